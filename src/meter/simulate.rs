use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::ale3::registers as reg;

/// Synthesizes a physically plausible ALE3 register image for `--simulate`
/// runs: phase 1 carries a slowly breathing base load, phase 2 a square-wave
/// load and phase 3 a triangle-wave load, each with measurement noise.
///
/// Each driver instance owns its own simulator, so several simulated meters
/// can coexist in one process.
#[derive(Debug)]
pub struct Simulator {
    start: Instant,
    rng: StdRng,
    serial: u32,
}

/// Square wave in {-1, 1} with the given period.
fn squarewave(t: f32, period: f32) -> f32 {
    let s = t - period * (t / period).floor();
    if s > period / 2.0 {
        1.0
    } else {
        -1.0
    }
}

/// Triangle wave in [-1, 1] with the given period.
fn trianglewave(t: f32, period: f32) -> f32 {
    let s = t - period * (t / period).floor();
    let half = period / 2.0;
    1.0 - 2.0 * ((s - half) / half).abs()
}

struct PhaseSample {
    urms: f32,
    irms: f32,
    qrms: f32,
    cosphi: f32,
}

impl PhaseSample {
    fn prms(&self) -> f32 {
        self.urms * self.irms
    }
}

impl Simulator {
    pub fn new() -> Self {
        Self::seeded(rand::thread_rng().gen())
    }

    /// Deterministic simulator for tests.
    pub fn seeded(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let serial = rng.gen();
        Self {
            start: Instant::now(),
            rng,
            serial,
        }
    }

    fn noise(&mut self) -> f32 {
        self.rng.gen::<f32>() * 2.0 - 1.0
    }

    fn phase1(&mut self, t: f32) -> PhaseSample {
        PhaseSample {
            urms: 230.0 + self.noise(),
            irms: 1.0 + 0.5 * (std::f32::consts::PI * t / 3600.0).sin() + 0.05 * self.noise(),
            qrms: 0.02,
            cosphi: 0.97,
        }
    }

    fn phase2(&mut self, t: f32) -> PhaseSample {
        let sq = squarewave(t, 2000.0);
        PhaseSample {
            urms: 235.0 + 5.0 * sq + self.noise(),
            irms: 1.4 + 0.8 * sq + 0.05 * self.noise(),
            qrms: 0.05 + 0.3 * (1.0 + sq),
            cosphi: (1.0 + 0.3 * sq).cos(),
        }
    }

    fn phase3(&mut self, t: f32) -> PhaseSample {
        let tri = trianglewave(t, 4711.0);
        PhaseSample {
            urms: 235.0 + 10.0 * tri + self.noise(),
            irms: 2.0 * (2.0 + tri) + 0.05 * self.noise(),
            qrms: 0.1 + 0.05 * tri,
            cosphi: (0.5 + tri).cos(),
        }
    }

    /// Builds the full 53-register image at the current simulated instant.
    ///
    /// Register encodings invert the driver's decode scaling, so the values
    /// that come back out of the decode path are the waveforms above.
    fn image(&mut self) -> [u16; reg::COUNT as usize] {
        let t = self.start.elapsed().as_secs_f32();
        let p1 = self.phase1(t);
        let p2 = self.phase2(t);
        let p3 = self.phase3(t);

        let urms = |v: f32| v as u16;
        let irms = |v: f32| (10.0 * v) as u16;
        let prms = |v: f32| (0.1 * v) as u16;
        let qrms = |v: f32| (0.1 * v) as u16;
        let cosphi = |v: f32| (100.0 * v) as u16;

        let mut image = [0u16; reg::COUNT as usize];
        image[reg::FIRMWARE_VERSION as usize] = 1;
        image[reg::NUMBER_OF_REGISTERS as usize] = reg::COUNT;
        image[reg::SERIAL_LOW as usize] = self.serial as u16;
        image[reg::SERIAL_HIGH as usize] = (self.serial >> 16) as u16;

        image[reg::URMS_PHASE1 as usize] = urms(p1.urms);
        image[reg::IRMS_PHASE1 as usize] = irms(p1.irms);
        image[reg::PRMS_PHASE1 as usize] = prms(p1.prms());
        image[reg::QRMS_PHASE1 as usize] = qrms(p1.qrms);
        image[reg::COSPHI_PHASE1 as usize] = cosphi(p1.cosphi);

        image[reg::URMS_PHASE2 as usize] = urms(p2.urms);
        image[reg::IRMS_PHASE2 as usize] = irms(p2.irms);
        image[reg::PRMS_PHASE2 as usize] = prms(p2.prms());
        image[reg::QRMS_PHASE2 as usize] = qrms(p2.qrms);
        image[reg::COSPHI_PHASE2 as usize] = cosphi(p2.cosphi);

        image[reg::URMS_PHASE3 as usize] = urms(p3.urms);
        image[reg::IRMS_PHASE3 as usize] = irms(p3.irms);
        image[reg::PRMS_PHASE3 as usize] = prms(p3.prms());
        image[reg::QRMS_PHASE3 as usize] = qrms(p3.qrms);
        image[reg::COSPHI_PHASE3 as usize] = cosphi(p3.cosphi);

        image[reg::PRMS_TOTAL as usize] = prms(p1.prms() + p2.prms() + p3.prms());
        image[reg::QRMS_TOTAL as usize] = qrms((p1.qrms + p2.qrms + p3.qrms) / 3.0);

        image
    }

    /// Reads a register window out of the simulated image. Addresses past
    /// the ALE3 map read as zero, matching an unmapped device register.
    pub fn read_window(&mut self, addr: u16, count: u16) -> Vec<u16> {
        let image = self.image();
        (addr..addr.saturating_add(count))
            .map(|a| image.get(a as usize).copied().unwrap_or(0))
            .collect()
    }
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}
