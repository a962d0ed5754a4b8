use std::future::Future;
use std::net::SocketAddr;

use tokio_modbus::prelude::*;
use tracing::{debug, warn};

/// Modbus transport failure. One occurrence is recovered by a single
/// close-and-reopen retry; a second occurrence is surfaced to the driver.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("cannot resolve meter host {host}:{port}")]
    Resolve { host: String, port: u16 },
    #[error("modbus connect to {addr} failed: {detail}")]
    Connect { addr: SocketAddr, detail: String },
    #[error("modbus read of {count} registers at {addr} (unit {unit}) failed: {detail}")]
    Read {
        unit: u8,
        addr: u16,
        count: u16,
        detail: String,
    },
    #[error("modbus connection not open")]
    NotConnected,
}

/// A window-read capable register link. The production implementation is
/// [`ModbusTransport`]; tests substitute fault-injecting mocks.
pub trait RegisterWindow {
    /// Reads `count` consecutive 16-bit holding registers at `addr` from
    /// slave `unit`.
    fn read(
        &mut self,
        unit: u8,
        addr: u16,
        count: u16,
    ) -> impl Future<Output = Result<Vec<u16>, TransportError>> + Send;

    /// Tears the connection down and reestablishes it.
    fn reset(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Reads one register window, retrying exactly once across a reconnect.
///
/// The first failure closes and reopens the link and repeats the same read;
/// the second failure propagates.
pub async fn read_with_retry<L: RegisterWindow>(
    link: &mut L,
    unit: u8,
    addr: u16,
    count: u16,
) -> Result<Vec<u16>, TransportError> {
    match link.read(unit, addr, count).await {
        Ok(words) => Ok(words),
        Err(first) => {
            warn!(error = %first, unit, addr, "modbus read failed, reconnecting once");
            link.reset().await?;
            link.read(unit, addr, count).await
        }
    }
}

/// Modbus/TCP connection to a meter, opened once at driver construction and
/// owned by the driver task afterwards.
#[derive(Debug)]
pub struct ModbusTransport {
    addr: SocketAddr,
    ctx: Option<client::Context>,
    current_unit: Option<u8>,
}

impl ModbusTransport {
    /// Resolves `hostname` to an IPv4 address and opens the connection.
    pub async fn connect(hostname: &str, port: u16) -> Result<Self, TransportError> {
        let addr = resolve(hostname, port).await?;
        let mut transport = Self {
            addr,
            ctx: None,
            current_unit: None,
        };
        transport.open().await?;
        Ok(transport)
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        let ctx = tcp::connect(self.addr)
            .await
            .map_err(|e| TransportError::Connect {
                addr: self.addr,
                detail: e.to_string(),
            })?;
        debug!(addr = %self.addr, "modbus connection established");
        self.ctx = Some(ctx);
        self.current_unit = None;
        Ok(())
    }

    /// Closes the connection. Also called implicitly by `reset`.
    pub async fn close(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            let _ = ctx.disconnect().await;
        }
        self.current_unit = None;
    }
}

impl RegisterWindow for ModbusTransport {
    async fn read(
        &mut self,
        unit: u8,
        addr: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let current_unit = &mut self.current_unit;
        let ctx = self.ctx.as_mut().ok_or(TransportError::NotConnected)?;

        if *current_unit != Some(unit) {
            ctx.set_slave(Slave(unit));
            *current_unit = Some(unit);
        }

        let read_failed = |detail: String| TransportError::Read {
            unit,
            addr,
            count,
            detail,
        };

        match ctx.read_holding_registers(addr, count).await {
            Ok(Ok(words)) => Ok(words),
            Ok(Err(exception)) => Err(read_failed(exception.to_string())),
            Err(err) => Err(read_failed(err.to_string())),
        }
    }

    async fn reset(&mut self) -> Result<(), TransportError> {
        self.close().await;
        self.open().await
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    let unresolvable = || TransportError::Resolve {
        host: host.to_string(),
        port,
    };

    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| unresolvable())?;

    addrs
        .into_iter()
        .find(SocketAddr::is_ipv4)
        .ok_or_else(unresolvable)
}
