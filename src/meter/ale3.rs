use std::time::SystemTime;

use tracing::debug;

use super::transport::{read_with_retry, RegisterWindow, TransportError};
use super::{MeterError, RegisterSource};
use crate::bucket::Bucket;

/// Register map of the ALE3 three-phase revenue meter, per the device
/// manual. All values are 16-bit holding registers.
pub mod registers {
    pub const FIRMWARE_VERSION: u16 = 1;
    pub const NUMBER_OF_REGISTERS: u16 = 2;
    pub const NUMBER_OF_FLAGS: u16 = 3;
    pub const BAUDRATE_HIGH: u16 = 4;
    pub const BAUDRATE_LOW: u16 = 5;
    pub const ASN1: u16 = 7;
    pub const HW_VERSION: u16 = 15;
    pub const SERIAL_LOW: u16 = 16;
    pub const SERIAL_HIGH: u16 = 17;
    pub const STATUS: u16 = 22;
    pub const RESPONSE_TIMEOUT: u16 = 23;
    pub const MODBUS_ADDRESS: u16 = 24;
    pub const ERROR: u16 = 25;
    pub const TARIFF: u16 = 27;
    pub const TOTAL_TARIFF1_HIGH: u16 = 28;
    pub const TOTAL_TARIFF1_LOW: u16 = 29;
    pub const PARTIAL_TARIFF1_HIGH: u16 = 30;
    pub const PARTIAL_TARIFF1_LOW: u16 = 31;
    pub const TOTAL_TARIFF2_HIGH: u16 = 32;
    pub const TOTAL_TARIFF2_LOW: u16 = 33;
    pub const PARTIAL_TARIFF2_HIGH: u16 = 34;
    pub const PARTIAL_TARIFF2_LOW: u16 = 35;
    pub const URMS_PHASE1: u16 = 36;
    pub const IRMS_PHASE1: u16 = 37;
    pub const PRMS_PHASE1: u16 = 38;
    pub const QRMS_PHASE1: u16 = 39;
    pub const COSPHI_PHASE1: u16 = 40;
    pub const URMS_PHASE2: u16 = 41;
    pub const IRMS_PHASE2: u16 = 42;
    pub const PRMS_PHASE2: u16 = 43;
    pub const QRMS_PHASE2: u16 = 44;
    pub const COSPHI_PHASE2: u16 = 45;
    pub const URMS_PHASE3: u16 = 46;
    pub const IRMS_PHASE3: u16 = 47;
    pub const PRMS_PHASE3: u16 = 48;
    pub const QRMS_PHASE3: u16 = 49;
    pub const COSPHI_PHASE3: u16 = 50;
    pub const PRMS_TOTAL: u16 = 51;
    pub const QRMS_TOTAL: u16 = 52;

    /// Registers 0..COUNT cover the whole map.
    pub const COUNT: u16 = 53;
}

/// The device rejects reads of more than 10 registers at a time.
const WINDOW: u16 = 10;

/// Finalize policy of one ALE3 quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finalize {
    /// Divide the weighted sum by the span: true time average.
    Average,
    /// Multiply by 60/span: energy-per-minute extrapolation of a power.
    ExtrapolatePower,
}

struct Ale3Field {
    name: &'static str,
    register: u16,
    scale: f32,
    finalize: Finalize,
}

/// The quantities the driver integrates, with their decode scaling and
/// finalize factors. Voltages, currents, cos phi and reactive powers are
/// averaged; every active power is extrapolated to the full minute.
const FIELDS: &[Ale3Field] = &[
    Ale3Field { name: "urms_phase1", register: registers::URMS_PHASE1, scale: 1.0, finalize: Finalize::Average },
    Ale3Field { name: "irms_phase1", register: registers::IRMS_PHASE1, scale: 0.1, finalize: Finalize::Average },
    Ale3Field { name: "prms_phase1", register: registers::PRMS_PHASE1, scale: 10.0, finalize: Finalize::ExtrapolatePower },
    Ale3Field { name: "qrms_phase1", register: registers::QRMS_PHASE1, scale: 10.0, finalize: Finalize::Average },
    Ale3Field { name: "cosphi_phase1", register: registers::COSPHI_PHASE1, scale: 0.01, finalize: Finalize::Average },
    Ale3Field { name: "urms_phase2", register: registers::URMS_PHASE2, scale: 1.0, finalize: Finalize::Average },
    Ale3Field { name: "irms_phase2", register: registers::IRMS_PHASE2, scale: 0.1, finalize: Finalize::Average },
    Ale3Field { name: "prms_phase2", register: registers::PRMS_PHASE2, scale: 10.0, finalize: Finalize::ExtrapolatePower },
    Ale3Field { name: "qrms_phase2", register: registers::QRMS_PHASE2, scale: 10.0, finalize: Finalize::Average },
    Ale3Field { name: "cosphi_phase2", register: registers::COSPHI_PHASE2, scale: 0.01, finalize: Finalize::Average },
    Ale3Field { name: "urms_phase3", register: registers::URMS_PHASE3, scale: 1.0, finalize: Finalize::Average },
    Ale3Field { name: "irms_phase3", register: registers::IRMS_PHASE3, scale: 0.1, finalize: Finalize::Average },
    Ale3Field { name: "prms_phase3", register: registers::PRMS_PHASE3, scale: 10.0, finalize: Finalize::ExtrapolatePower },
    Ale3Field { name: "qrms_phase3", register: registers::QRMS_PHASE3, scale: 10.0, finalize: Finalize::Average },
    Ale3Field { name: "cosphi_phase3", register: registers::COSPHI_PHASE3, scale: 0.01, finalize: Finalize::Average },
    Ale3Field { name: "prms_total", register: registers::PRMS_TOTAL, scale: 10.0, finalize: Finalize::ExtrapolatePower },
    Ale3Field { name: "qrms_total", register: registers::QRMS_TOTAL, scale: 10.0, finalize: Finalize::Average },
];

/// Driver for the ALE3 revenue meter: one fixed register map at a single
/// slave address, read in windows the device can serve.
pub struct Ale3Meter {
    source: RegisterSource,
    unit: u8,
}

impl Ale3Meter {
    pub fn new(source: RegisterSource, unit: u8) -> Self {
        Self { source, unit }
    }

    /// Performs one integration tick: read the full map, then accumulate
    /// every quantity weighted by the time since the previous sample.
    pub async fn poll_into(
        &mut self,
        bucket: &mut Bucket,
        previous: &mut SystemTime,
    ) -> Result<u32, MeterError> {
        let regs = read_all_registers(&mut self.source, self.unit).await?;

        let now = SystemTime::now();
        let delta = now.duration_since(*previous).unwrap_or_default().as_secs_f32();
        *previous = now;

        accumulate_registers(bucket, delta, &regs);
        debug!(unit = self.unit, delta, "ale3 sample integrated");
        Ok(1)
    }

    pub fn finalize(&self, bucket: &mut Bucket, span: f32) {
        finalize_fields(bucket, span);
    }

    pub async fn shutdown(&mut self) {
        self.source.close().await;
    }
}

/// Reads the whole 53-register map in windows of at most [`WINDOW`]
/// registers, retrying each window once across a reconnect.
async fn read_all_registers<L: RegisterWindow>(
    link: &mut L,
    unit: u8,
) -> Result<[u16; registers::COUNT as usize], MeterError> {
    let mut regs = [0u16; registers::COUNT as usize];
    let mut addr = 0u16;
    while addr < registers::COUNT {
        let count = (registers::COUNT - addr).min(WINDOW);
        let words = read_with_retry(link, unit, addr, count).await?;
        if words.len() != count as usize {
            return Err(MeterError::DeviceRead(TransportError::Read {
                unit,
                addr,
                count,
                detail: format!("short response: {} registers", words.len()),
            }));
        }
        regs[addr as usize..(addr + count) as usize].copy_from_slice(&words);
        addr += count;
    }
    Ok(regs)
}

fn accumulate_registers(bucket: &mut Bucket, delta: f32, regs: &[u16; registers::COUNT as usize]) {
    for field in FIELDS {
        let value = field.scale * f32::from(regs[field.register as usize]);
        bucket.accumulate(delta, field.name, value);
    }
}

fn finalize_fields(bucket: &mut Bucket, span: f32) {
    for field in FIELDS {
        let factor = match field.finalize {
            Finalize::Average => 1.0 / span,
            Finalize::ExtrapolatePower => 60.0 / span,
        };
        bucket.finalize(field.name, factor);
    }
}
