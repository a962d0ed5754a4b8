use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::bucket::Bucket;

/// Error returned by [`BucketQueue::extract`] once the queue has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("bucket queue closed")]
pub struct QueueClosed;

/// Outcome of a [`BucketQueue::wait_for`] health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueWait {
    /// The probe interval elapsed; the queue is still open.
    Timeout,
    /// The queue was closed while waiting.
    Closed,
}

struct Inner {
    items: VecDeque<Bucket>,
    closed: bool,
    last_submit: SystemTime,
    last_extract: SystemTime,
}

/// Unbounded FIFO carrying finalized buckets from the driver to the sink.
///
/// Single mutex-guarded state plus one [`Notify`]; `submit` never blocks,
/// `extract` parks until a bucket arrives or [`close`] wakes every waiter.
/// FIFO order is guaranteed per producer. There is no capacity bound: the
/// producer rate-limits itself to one bucket per minute.
///
/// [`close`]: BucketQueue::close
pub struct BucketQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl BucketQueue {
    pub fn new() -> Self {
        let now = SystemTime::now();
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
                last_submit: now,
                last_extract: now,
            }),
            notify: Notify::new(),
        }
    }

    /// Appends `bucket` and wakes any waiter. Buckets submitted after
    /// [`close`](Self::close) are dropped.
    pub fn submit(&self, bucket: Bucket) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.items.push_back(bucket);
            inner.last_submit = SystemTime::now();
        }
        self.notify.notify_waiters();
    }

    /// Removes and returns the oldest bucket, waiting while the queue is
    /// empty. Fails with [`QueueClosed`] once the queue has been shut down
    /// and drained.
    pub async fn extract(&self) -> Result<Bucket, QueueClosed> {
        let mut notified = std::pin::pin!(self.notify.notified());
        loop {
            // Enable before inspecting state so a notify_waiters racing with
            // the check below is not lost.
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock();
                if let Some(bucket) = inner.items.pop_front() {
                    inner.last_extract = SystemTime::now();
                    return Ok(bucket);
                }
                if inner.closed {
                    return Err(QueueClosed);
                }
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }

    /// Health probe for the supervisor: waits up to `howlong`, returning
    /// [`QueueWait::Closed`] as soon as the queue shuts down and
    /// [`QueueWait::Timeout`] otherwise. Submissions do not cut the wait
    /// short.
    pub async fn wait_for(&self, howlong: Duration) -> QueueWait {
        let deadline = tokio::time::Instant::now() + howlong;
        let mut notified = std::pin::pin!(self.notify.notified());
        loop {
            notified.as_mut().enable();
            if self.inner.lock().closed {
                return QueueWait::Closed;
            }
            match tokio::time::timeout_at(deadline, notified.as_mut()).await {
                Ok(()) => notified.set(self.notify.notified()),
                Err(_) => return QueueWait::Timeout,
            }
        }
    }

    /// Closes the queue and wakes every waiter. Idempotent. Buckets already
    /// queued remain extractable; only an empty closed queue reports
    /// [`QueueClosed`].
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
        }
        self.notify.notify_waiters();
    }

    /// Time of the most recent [`submit`](Self::submit); queue creation time
    /// before the first submission.
    pub fn last_submit(&self) -> SystemTime {
        self.inner.lock().last_submit
    }

    /// Time of the most recent successful [`extract`](Self::extract).
    pub fn last_extract(&self) -> SystemTime {
        self.inner.lock().last_extract
    }

    /// Number of buckets currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }
}

impl Default for BucketQueue {
    fn default() -> Self {
        Self::new()
    }
}
