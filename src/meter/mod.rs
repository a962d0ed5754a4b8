pub mod ale3;
pub mod fields;
pub mod modbus;
pub mod simulate;
pub mod solivia;
pub mod transport;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bucket::Bucket;
use crate::clock;
use crate::config::{Config, MeterType};
use crate::queue::BucketQueue;

use self::ale3::Ale3Meter;
use self::modbus::ModbusMeter;
use self::simulate::Simulator;
use self::solivia::SoliviaMeter;
use self::transport::{ModbusTransport, RegisterWindow, TransportError};

/// Default Modbus/TCP port for the register meters.
const MODBUS_DEFAULT_PORT: u16 = 502;
/// Default UDP port the Solivia inverter listens on.
const SOLIVIA_DEFAULT_PORT: u16 = 1471;

/// Error raised inside one integration interval. Everything except
/// [`Interrupted`](MeterError::Interrupted) is minute-scoped: the driver
/// loop logs it and starts over with the next minute.
#[derive(Debug, thiserror::Error)]
pub enum MeterError {
    /// Transport failure that persisted past the single reconnect attempt.
    #[error("device read failed: {0}")]
    DeviceRead(#[from] TransportError),
    /// The whole minute passed without a single sample.
    #[error("no samples during the integration interval")]
    NoSamples,
    /// UDP socket failure while talking to the inverter.
    #[error("socket error: {0}")]
    Socket(#[source] std::io::Error),
    /// Cancellation observed during the tick wait.
    #[error("integration interrupted")]
    Interrupted,
}

/// Where the Modbus-family drivers read their registers from: the live
/// TCP connection, or the waveform simulator when `simulate` is set.
#[derive(Debug)]
pub enum RegisterSource {
    Live(ModbusTransport),
    Simulated(Simulator),
}

impl RegisterSource {
    /// Deterministic simulated source for tests.
    pub fn simulated_seeded(seed: u64) -> Self {
        Self::Simulated(Simulator::seeded(seed))
    }

    pub async fn close(&mut self) {
        if let Self::Live(transport) = self {
            transport.close().await;
        }
    }
}

impl RegisterWindow for RegisterSource {
    async fn read(&mut self, unit: u8, addr: u16, count: u16) -> Result<Vec<u16>, TransportError> {
        match self {
            Self::Live(transport) => transport.read(unit, addr, count).await,
            Self::Simulated(sim) => Ok(sim.read_window(addr, count)),
        }
    }

    async fn reset(&mut self) -> Result<(), TransportError> {
        match self {
            Self::Live(transport) => transport.reset().await,
            Self::Simulated(_) => Ok(()),
        }
    }
}

/// The three supported meter families behind one tagged union. The common
/// tick loop lives in [`integrate`]; the variants only know how to take one
/// sample and how to finalize their fields.
pub enum MeterDevice {
    Modbus(ModbusMeter),
    Ale3(Ale3Meter),
    Solivia(SoliviaMeter),
}

impl MeterDevice {
    fn family(&self) -> &'static str {
        match self {
            Self::Modbus(_) => "modbus",
            Self::Ale3(_) => "ale3",
            Self::Solivia(_) => "solivia",
        }
    }

    /// Pre-populates keys that must exist even without samples on their
    /// side, such as the `_pos`/`_neg` pair of signed-split fields.
    fn seed(&self, bucket: &mut Bucket) {
        if let Self::Modbus(meter) = self {
            meter.seed(bucket);
        }
    }

    /// Takes at most one sample and accumulates it. Returns the number of
    /// samples taken (the inverter yields zero on a receive timeout).
    async fn poll_into(
        &mut self,
        bucket: &mut Bucket,
        previous: &mut SystemTime,
    ) -> Result<u32, MeterError> {
        match self {
            Self::Modbus(meter) => meter.poll_into(bucket, previous).await,
            Self::Ale3(meter) => meter.poll_into(bucket, previous).await,
            Self::Solivia(meter) => meter.poll_into(bucket, previous).await,
        }
    }

    fn finalize(&self, bucket: &mut Bucket, span: f32) {
        match self {
            Self::Modbus(meter) => meter.finalize(bucket, span),
            Self::Ale3(meter) => meter.finalize(bucket, span),
            Self::Solivia(meter) => meter.finalize(bucket, span),
        }
    }

    async fn shutdown(&mut self) {
        match self {
            Self::Modbus(meter) => meter.shutdown().await,
            Self::Ale3(meter) => meter.shutdown().await,
            Self::Solivia(_) => {}
        }
    }
}

/// Integrates one wall-clock minute into a bucket.
///
/// The bucket is anchored at the floor of the current minute; each tick
/// waits out the polling interval (clamped to the time left in the minute),
/// takes one sample and weights it by the time since the previous one.
/// Starting mid-minute back-extends the first sample to the anchor, so the
/// `1/d` normalization still yields a true time average.
///
/// Cancellation is observed during the tick wait, before the next device
/// read. A minute that produced no sample at all is an error; the bucket is
/// discarded.
pub async fn integrate(
    device: &mut MeterDevice,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<Bucket, MeterError> {
    let (start, end) = clock::minute_bounds(SystemTime::now());
    debug!(
        anchor = clock::epoch_seconds(start),
        family = device.family(),
        "integration interval started",
    );

    let mut bucket = Bucket::new(start);
    device.seed(&mut bucket);

    let mut previous = start;
    let mut samples = 0u32;

    loop {
        let now = SystemTime::now();
        let Ok(remaining) = end.duration_since(now) else {
            break;
        };
        if remaining.is_zero() {
            break;
        }

        let wait = remaining.min(interval);
        tokio::select! {
            _ = cancel.cancelled() => return Err(MeterError::Interrupted),
            _ = tokio::time::sleep(wait) => {}
        }

        samples += device.poll_into(&mut bucket, &mut previous).await?;
    }

    if samples == 0 {
        return Err(MeterError::NoSamples);
    }

    let span = end
        .duration_since(start)
        .unwrap_or(clock::MINUTE)
        .as_secs_f32();
    device.finalize(&mut bucket, span);

    debug!(
        anchor = clock::epoch_seconds(start),
        samples,
        fields = bucket.len(),
        "integration interval finalized",
    );
    Ok(bucket)
}

/// Driver loop: integrate a minute, hand the bucket over, repeat. Transient
/// errors cost at most the minute they occurred in.
async fn run(
    mut device: MeterDevice,
    interval: Duration,
    queue: Arc<BucketQueue>,
    cancel: CancellationToken,
) {
    info!(family = device.family(), "meter driver started");

    loop {
        match integrate(&mut device, interval, &cancel).await {
            Ok(bucket) => queue.submit(bucket),
            Err(MeterError::Interrupted) => break,
            Err(e) => warn!(error = %e, "integration failed, retrying"),
        }

        if cancel.is_cancelled() {
            break;
        }
    }

    device.shutdown().await;
    info!(family = device.family(), "meter driver stopped");
}

/// Handle of the running driver task.
pub struct Meter {
    cancel: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Meter {
    /// Builds the driver selected by `metertype`, opens its transport and
    /// starts the driver task. Configuration problems fail here, before any
    /// task exists.
    pub async fn open(cfg: &Config, queue: Arc<BucketQueue>) -> Result<Self> {
        let device = build_device(cfg).await?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            device,
            cfg.meterinterval,
            queue,
            cancel.clone(),
        ));

        Ok(Self {
            cancel,
            task: Some(task),
        })
    }

    /// Cooperative shutdown: flag the driver, then join it. The driver
    /// observes the flag on its next tick wait.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "meter task join failed");
            }
        }
    }
}

async fn build_device(cfg: &Config) -> Result<MeterDevice> {
    match cfg.metertype {
        MeterType::Modbus => {
            let path = cfg
                .datafields
                .as_deref()
                .context("datafields is required for metertype modbus")?;
            let descriptors = fields::load_fields(path)?;
            let source = register_source(cfg).await?;
            Ok(MeterDevice::Modbus(ModbusMeter::new(source, descriptors)?))
        }
        MeterType::Ale3 => {
            let source = register_source(cfg).await?;
            Ok(MeterDevice::Ale3(Ale3Meter::new(source, cfg.meterid)))
        }
        MeterType::Solivia => {
            if cfg.simulate {
                bail!("simulate is not supported for metertype solivia");
            }
            let listen_port = cfg
                .listenport
                .context("listenport is required for metertype solivia")?;
            let send_port = cfg.meterport.unwrap_or(SOLIVIA_DEFAULT_PORT);
            let meter = SoliviaMeter::open(
                &cfg.meterhostname,
                send_port,
                listen_port,
                cfg.meterid,
                cfg.meterpassive,
            )
            .await?;
            Ok(MeterDevice::Solivia(meter))
        }
    }
}

async fn register_source(cfg: &Config) -> Result<RegisterSource> {
    if cfg.simulate {
        info!("register source is simulated");
        return Ok(RegisterSource::Simulated(Simulator::new()));
    }

    let port = cfg.meterport.unwrap_or(MODBUS_DEFAULT_PORT);
    let transport = ModbusTransport::connect(&cfg.meterhostname, port)
        .await
        .with_context(|| format!("connecting to meter {}:{}", cfg.meterhostname, port))?;
    Ok(RegisterSource::Live(transport))
}
