use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Length of one integration interval.
pub const MINUTE: Duration = Duration::from_secs(60);

/// Returns the whole seconds since the Unix epoch for `t`.
///
/// Times before the epoch collapse to zero; the meters this daemon talks to
/// did not exist in 1969.
pub fn epoch_seconds(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_secs()
}

/// Floors `t` to the start of the UTC minute containing it.
pub fn minute_floor(t: SystemTime) -> SystemTime {
    let secs = epoch_seconds(t);
    UNIX_EPOCH + Duration::from_secs(secs - secs % 60)
}

/// Returns the `(start, end)` pair of the minute containing `t`.
///
/// `start` is the bucket anchor; `end - start` is always exactly one minute.
pub fn minute_bounds(t: SystemTime) -> (SystemTime, SystemTime) {
    let start = minute_floor(t);
    (start, start + MINUTE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64, millis: u32) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs) + Duration::from_millis(u64::from(millis))
    }

    #[test]
    fn test_minute_floor_mid_minute() {
        // 15 s past a minute boundary floors back to the boundary.
        let anchor = minute_floor(at(1_700_000_015, 0));
        assert_eq!(epoch_seconds(anchor), 1_700_000_000);
    }

    #[test]
    fn test_minute_floor_on_boundary() {
        let anchor = minute_floor(at(1_700_000_060, 0));
        assert_eq!(epoch_seconds(anchor), 1_700_000_060);
    }

    #[test]
    fn test_minute_floor_last_millisecond() {
        // 59.999 s into the minute still anchors to the current minute.
        let anchor = minute_floor(at(1_700_000_059, 999));
        assert_eq!(epoch_seconds(anchor), 1_700_000_000);
    }

    #[test]
    fn test_minute_bounds_span() {
        let (start, end) = minute_bounds(at(1_700_000_015, 0));
        assert_eq!(epoch_seconds(start), 1_700_000_000);
        assert_eq!(epoch_seconds(end), 1_700_000_060);
        assert_eq!(end.duration_since(start).expect("end after start"), MINUTE);
    }

    #[test]
    fn test_anchor_is_minute_aligned() {
        for secs in [0u64, 59, 60, 61, 1_700_000_015, u32::MAX as u64] {
            let anchor = minute_floor(at(secs, 123));
            assert_eq!(epoch_seconds(anchor) % 60, 0, "secs={secs}");
        }
    }
}
