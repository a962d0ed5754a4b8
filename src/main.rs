use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use powermeterd::config::{Config, ConfigMap};
use powermeterd::meter::Meter;
use powermeterd::queue::{BucketQueue, QueueWait};
use powermeterd::sink::DbSink;

/// How often the supervisor probes the queue for signs of life.
const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(120);
/// Producer silence beyond this is reported; the driver submits once a
/// minute when healthy.
const STALL_THRESHOLD: Duration = Duration::from_secs(180);

/// Power-meter acquisition daemon.
#[derive(Parser)]
#[command(name = "powermeterd", version, about)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short, long)]
    debug: bool,

    /// External store host.
    #[arg(long)]
    dbhostname: Option<String>,

    /// External store database name.
    #[arg(long)]
    dbname: Option<String>,

    /// External store user.
    #[arg(long)]
    dbuser: Option<String>,

    /// External store password.
    #[arg(long)]
    dbpassword: Option<String>,

    /// External store port.
    #[arg(long)]
    dbport: Option<u16>,

    /// Meter family: solivia, ale3 or modbus.
    #[arg(long)]
    metertype: Option<String>,

    /// Meter host name.
    #[arg(long)]
    meterhostname: Option<String>,

    /// Meter port.
    #[arg(long)]
    meterport: Option<u16>,

    /// Meter device id / Modbus slave address.
    #[arg(long)]
    meterid: Option<u8>,

    /// Station row selecting this installation in the store.
    #[arg(long)]
    stationname: Option<String>,

    /// Sensor for field names without a sensor prefix.
    #[arg(long)]
    sensorname: Option<String>,

    /// Stay in the foreground instead of daemonizing.
    #[arg(short, long)]
    foreground: bool,

    /// Read registers from the waveform simulator instead of a device.
    #[arg(long)]
    simulate: bool,
}

impl Cli {
    /// Overlays the command-line options onto the raw settings; they win
    /// over both the built-in defaults and the configuration file.
    fn apply(&self, map: &mut ConfigMap) {
        let strings = [
            ("dbhostname", &self.dbhostname),
            ("dbname", &self.dbname),
            ("dbuser", &self.dbuser),
            ("dbpassword", &self.dbpassword),
            ("metertype", &self.metertype),
            ("meterhostname", &self.meterhostname),
            ("stationname", &self.stationname),
            ("sensorname", &self.sensorname),
        ];
        for (key, value) in strings {
            if let Some(value) = value {
                map.set(key, value);
            }
        }

        if let Some(port) = self.dbport {
            map.set("dbport", port);
        }
        if let Some(port) = self.meterport {
            map.set("meterport", port);
        }
        if let Some(id) = self.meterid {
            map.set("meterid", id);
        }
        if self.simulate {
            map.set("simulate", "true");
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(if cli.debug { "debug" } else { "info" })
        .context("building log filter")?;
    fmt().with_env_filter(filter).with_target(true).init();

    let mut map = ConfigMap::builtin();
    if let Some(path) = &cli.config {
        map.merge_path(path)?;
    }
    cli.apply(&mut map);
    let cfg = Config::from_map(&map)?;

    // Fork before the runtime exists; tokio worker threads do not survive
    // a fork.
    if !cli.foreground {
        daemonize()?;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        metertype = cfg.metertype.as_str(),
        station = %cfg.stationname,
        "starting powermeterd",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    let queue = Arc::new(BucketQueue::new());

    // Bring up the consumer first so the first bucket has somewhere to go,
    // then the producer.
    let mut sink = DbSink::connect(&cfg, Arc::clone(&queue))
        .await
        .context("starting sink writer")?;
    let mut meter = Meter::open(&cfg, Arc::clone(&queue))
        .await
        .context("starting meter driver")?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    // Park on the queue's health probe until a signal or shutdown.
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            outcome = queue.wait_for(HEALTH_PROBE_INTERVAL) => match outcome {
                QueueWait::Closed => break,
                QueueWait::Timeout => {
                    let age = SystemTime::now()
                        .duration_since(queue.last_submit())
                        .unwrap_or_default();
                    if age > STALL_THRESHOLD {
                        warn!(
                            last_submit_secs_ago = age.as_secs(),
                            "meter driver has not submitted recently",
                        );
                    }
                }
            }
        }
    }

    // Cooperative shutdown: stop the producer, close the queue so the sink
    // drains and observes the close, then join the sink.
    meter.stop().await;
    queue.close();
    sink.stop().await;

    info!("powermeterd stopped");
    Ok(())
}

/// Classic double-start daemonization: fork, let the parent exit, then
/// detach the child from the controlling terminal.
fn daemonize() -> Result<()> {
    // SAFETY: called before the tokio runtime is built, while the process
    // is still single-threaded.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        bail!("cannot fork: {}", std::io::Error::last_os_error());
    }
    if pid > 0 {
        // Parent: the daemon lives on in the child.
        std::process::exit(0);
    }

    if unsafe { libc::setsid() } < 0 {
        bail!("cannot create session: {}", std::io::Error::last_os_error());
    }
    if unsafe { libc::chdir(c"/".as_ptr()) } < 0 {
        bail!("cannot chdir to /: {}", std::io::Error::last_os_error());
    }
    unsafe { libc::umask(0) };

    Ok(())
}
