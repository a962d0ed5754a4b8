use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use crc::{Crc, CRC_16_ARC};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use super::MeterError;
use crate::bucket::Bucket;

/// CRC-16 used by the Solivia protocol (the classic ARC polynomial).
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

/// A valid response frame is exactly this long.
pub const PACKET_SIZE: usize = 164;

/// Field offsets within the 164-byte response frame. 16-bit quantities are
/// big-endian; the energy counters are 32-bit.
pub mod offsets {
    pub const STX: usize = 0;
    pub const ACK: usize = 1;
    pub const ID: usize = 2;
    pub const PART: usize = 6;
    pub const SERIAL: usize = PART + 11;
    pub const VERSION: usize = SERIAL + 24;
    pub const PHASE1: usize = VERSION + 12;
    pub const PHASE2: usize = PHASE1 + 12;
    pub const PHASE3: usize = PHASE2 + 12;
    pub const STRING1: usize = PHASE3 + 12;
    pub const STRING2: usize = STRING1 + 6;
    pub const INVERTER: usize = STRING2 + 6;
    pub const CRC: usize = super::PACKET_SIZE - 3;
    pub const ETX: usize = super::PACKET_SIZE - 1;
}

/// Averaged fields extracted from a frame: `(name, offset, scale)`.
const AVERAGED_FIELDS: &[(&str, usize, f32)] = &[
    ("phase1.voltage", offsets::PHASE1, 0.1),
    ("phase1.current", offsets::PHASE1 + 2, 0.01),
    ("phase1.power", offsets::PHASE1 + 4, 1.0),
    ("phase1.frequency", offsets::PHASE1 + 6, 0.01),
    ("phase2.voltage", offsets::PHASE2, 0.1),
    ("phase2.current", offsets::PHASE2 + 2, 0.01),
    ("phase2.power", offsets::PHASE2 + 4, 1.0),
    ("phase2.frequency", offsets::PHASE2 + 6, 0.01),
    ("phase3.voltage", offsets::PHASE3, 0.1),
    ("phase3.current", offsets::PHASE3 + 2, 0.01),
    ("phase3.power", offsets::PHASE3 + 4, 1.0),
    ("phase3.frequency", offsets::PHASE3 + 6, 0.01),
    ("string1.voltage", offsets::STRING1, 0.1),
    ("string1.current", offsets::STRING1 + 2, 0.01),
    ("string1.power", offsets::STRING1 + 4, 1.0),
    ("string2.voltage", offsets::STRING2, 0.1),
    ("string2.current", offsets::STRING2 + 2, 0.01),
    ("string2.power", offsets::STRING2 + 4, 1.0),
    ("inverter.power", offsets::INVERTER, 1.0),
    ("inverter.temperature", offsets::INVERTER + 22, 1.0),
];

/// Monotonic counters, stored with `update` and never finalized:
/// `(name, offset)` of a 32-bit big-endian value.
const COUNTER_FIELDS: &[(&str, usize)] = &[
    ("inverter.energy", offsets::INVERTER + 6),
    ("inverter.feedtime", offsets::INVERTER + 10),
];

/// Why a received datagram was not accepted as a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDefect {
    WrongSize(usize),
    BadFraming,
    IdMismatch(u8),
    BadCrc { computed: u16, embedded: u16 },
}

/// A validated 164-byte Solivia response.
#[derive(Debug, Clone)]
pub struct SoliviaFrame {
    bytes: [u8; PACKET_SIZE],
}

impl SoliviaFrame {
    /// Validates a received datagram: exact size, STX/ACK framing, device
    /// id, and the CRC-16 over bytes 1..len-4 against the big-endian CRC
    /// stored at len-3.
    pub fn parse(data: &[u8], id: u8) -> Result<Self, FrameDefect> {
        if data.len() != PACKET_SIZE {
            return Err(FrameDefect::WrongSize(data.len()));
        }

        let mut bytes = [0u8; PACKET_SIZE];
        bytes.copy_from_slice(data);
        let frame = Self { bytes };

        if frame.bytes[offsets::STX] != 0x02 || frame.bytes[offsets::ACK] != 0x06 {
            return Err(FrameDefect::BadFraming);
        }
        if frame.bytes[offsets::ID] != id {
            return Err(FrameDefect::IdMismatch(frame.bytes[offsets::ID]));
        }

        let computed = frame.computed_crc();
        let embedded = frame.embedded_crc();
        if computed != embedded {
            return Err(FrameDefect::BadCrc { computed, embedded });
        }

        Ok(frame)
    }

    fn short_at(&self, offset: usize) -> u16 {
        u16::from(self.bytes[offset]) << 8 | u16::from(self.bytes[offset + 1])
    }

    fn float_at(&self, offset: usize, scale: f32) -> f32 {
        scale * f32::from(self.short_at(offset))
    }

    fn long_at(&self, offset: usize) -> u32 {
        u32::from_be_bytes([
            self.bytes[offset],
            self.bytes[offset + 1],
            self.bytes[offset + 2],
            self.bytes[offset + 3],
        ])
    }

    fn embedded_crc(&self) -> u16 {
        self.short_at(offsets::CRC)
    }

    fn computed_crc(&self) -> u16 {
        CRC16.checksum(&self.bytes[1..PACKET_SIZE - 3])
    }

    pub fn value(&self, offset: usize, scale: f32) -> f32 {
        self.float_at(offset, scale)
    }

    pub fn counter(&self, offset: usize) -> f32 {
        self.long_at(offset) as f32
    }

    /// Inverter part number string, for the startup log.
    pub fn part(&self) -> String {
        String::from_utf8_lossy(&self.bytes[offsets::PART..offsets::PART + 11])
            .trim()
            .to_string()
    }
}

/// Builds the 9-byte poll request for device `id`. The CRC-16 covers bytes
/// 1..5 and is embedded little-endian, unlike the big-endian response CRC.
pub fn build_request(id: u8) -> [u8; 9] {
    let mut request = [0x02, 0x05, id, 0x02, 0x60, 0x01, 0x00, 0x00, 0x03];
    let crc = CRC16.checksum(&request[1..6]);
    request[6] = (crc & 0xff) as u8;
    request[7] = (crc >> 8) as u8;
    request
}

/// Driver for the Solivia inverter: UDP request/response with a fixed-layout
/// binary frame. In passive mode the driver never transmits and only listens
/// for frames the inverter broadcasts on its own.
pub struct SoliviaMeter {
    receive: UdpSocket,
    send: UdpSocket,
    target: SocketAddr,
    id: u8,
    passive: bool,
    request: [u8; 9],
}

impl SoliviaMeter {
    /// Binds the listen socket, resolves the inverter address and prepares
    /// the poll request.
    pub async fn open(
        hostname: &str,
        send_port: u16,
        listen_port: u16,
        id: u8,
        passive: bool,
    ) -> Result<Self> {
        let receive = UdpSocket::bind(("0.0.0.0", listen_port))
            .await
            .with_context(|| format!("binding udp listen port {listen_port}"))?;
        let send = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .context("binding udp send socket")?;

        let target = tokio::net::lookup_host((hostname, send_port))
            .await
            .with_context(|| format!("resolving inverter host {hostname}"))?
            .find(SocketAddr::is_ipv4)
            .with_context(|| format!("no IPv4 address for inverter host {hostname}"))?;

        debug!(%target, listen_port, id, passive, "solivia meter ready");

        Ok(Self {
            receive,
            send,
            target,
            id,
            passive,
            request: build_request(id),
        })
    }

    /// One request/response exchange. Sends the poll request (unless
    /// passive), then drains the socket for up to one second until a valid
    /// frame arrives. `None` means the tick produced no sample.
    async fn get_packet(&mut self) -> Result<Option<SoliviaFrame>, MeterError> {
        if !self.passive {
            self.send
                .send_to(&self.request, self.target)
                .await
                .map_err(MeterError::Socket)?;
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        let mut buf = [0u8; 512];
        loop {
            let received = match tokio::time::timeout_at(deadline, self.receive.recv_from(&mut buf)).await {
                Err(_) => {
                    debug!("no inverter packet within 1s");
                    return Ok(None);
                }
                Ok(Err(e)) => return Err(MeterError::Socket(e)),
                Ok(Ok((len, _peer))) => &buf[..len],
            };

            match SoliviaFrame::parse(received, self.id) {
                Ok(frame) => {
                    debug!(part = %frame.part(), "inverter frame accepted");
                    return Ok(Some(frame));
                }
                Err(defect) => {
                    warn!(?defect, "discarding invalid inverter packet");
                    continue;
                }
            }
        }
    }

    /// One integration tick. A timed-out tick leaves the bucket and the
    /// previous-sample time untouched, so the next frame is weighted by the
    /// full elapsed interval.
    pub async fn poll_into(
        &mut self,
        bucket: &mut Bucket,
        previous: &mut SystemTime,
    ) -> Result<u32, MeterError> {
        let Some(frame) = self.get_packet().await? else {
            return Ok(0);
        };

        let now = SystemTime::now();
        let delta = now.duration_since(*previous).unwrap_or_default().as_secs_f32();
        *previous = now;

        accumulate_frame(bucket, delta, &frame);
        debug!(delta, "solivia frame integrated");
        Ok(1)
    }

    pub fn finalize(&self, bucket: &mut Bucket, span: f32) {
        finalize_fields(bucket, span);
    }
}

fn accumulate_frame(bucket: &mut Bucket, delta: f32, frame: &SoliviaFrame) {
    for &(name, offset, scale) in AVERAGED_FIELDS {
        bucket.accumulate(delta, name, frame.value(offset, scale));
    }
    for &(name, offset) in COUNTER_FIELDS {
        bucket.update(name, frame.counter(offset));
    }
}

fn finalize_fields(bucket: &mut Bucket, span: f32) {
    let factor = 1.0 / span;
    for &(name, _, _) in AVERAGED_FIELDS {
        bucket.finalize(name, factor);
    }
    // Monotonic counters keep their last observed value.
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    /// Builds a frame with valid framing, id and CRC, with `fill` applied
    /// to the payload before the CRC is computed.
    fn test_frame(id: u8, fill: impl FnOnce(&mut [u8; PACKET_SIZE])) -> Vec<u8> {
        let mut bytes = [0u8; PACKET_SIZE];
        bytes[offsets::STX] = 0x02;
        bytes[offsets::ACK] = 0x06;
        bytes[offsets::ID] = id;
        bytes[offsets::ETX] = 0x03;
        fill(&mut bytes);

        let crc = CRC16.checksum(&bytes[1..PACKET_SIZE - 3]);
        bytes[offsets::CRC] = (crc >> 8) as u8;
        bytes[offsets::CRC + 1] = (crc & 0xff) as u8;
        bytes.to_vec()
    }

    fn bucket() -> Bucket {
        Bucket::new(UNIX_EPOCH + Duration::from_secs(1_700_000_000))
    }

    #[test]
    fn test_valid_frame_accepted_and_decoded() {
        // Phase 1 voltage bytes 0x09 0x00 at the documented offset.
        let data = test_frame(0x05, |b| {
            b[offsets::PHASE1] = 0x09;
            b[offsets::PHASE1 + 1] = 0x00;
        });

        let frame = SoliviaFrame::parse(&data, 0x05).expect("valid frame");
        let voltage = frame.value(offsets::PHASE1, 0.1);
        assert!((voltage - 230.4).abs() < 1e-4, "voltage={voltage}");
    }

    #[test]
    fn test_one_bit_crc_corruption_rejected() {
        let mut data = test_frame(0x05, |_| {});
        data[offsets::CRC + 1] ^= 0x01;

        assert!(matches!(
            SoliviaFrame::parse(&data, 0x05),
            Err(FrameDefect::BadCrc { .. }),
        ));
    }

    #[test]
    fn test_payload_corruption_rejected() {
        let mut data = test_frame(0x05, |_| {});
        data[offsets::PHASE2] ^= 0x80;

        assert!(matches!(
            SoliviaFrame::parse(&data, 0x05),
            Err(FrameDefect::BadCrc { .. }),
        ));
    }

    #[test]
    fn test_short_packet_rejected() {
        let data = vec![0x02, 0x06, 0x05];
        assert!(matches!(
            SoliviaFrame::parse(&data, 0x05),
            Err(FrameDefect::WrongSize(3)),
        ));
    }

    #[test]
    fn test_bad_framing_rejected() {
        let mut data = test_frame(0x05, |_| {});
        data[offsets::ACK] = 0x15; // NAK
        assert!(matches!(
            SoliviaFrame::parse(&data, 0x05),
            Err(FrameDefect::BadFraming),
        ));
    }

    #[test]
    fn test_id_mismatch_rejected() {
        let data = test_frame(0x07, |_| {});
        assert!(matches!(
            SoliviaFrame::parse(&data, 0x05),
            Err(FrameDefect::IdMismatch(0x07)),
        ));
    }

    #[test]
    fn test_request_layout_and_crc() {
        let request = build_request(0x05);
        assert_eq!(request[0], 0x02);
        assert_eq!(&request[1..6], &[0x05, 0x05, 0x02, 0x60, 0x01]);
        assert_eq!(request[8], 0x03);

        // The embedded CRC is little-endian over bytes 1..5.
        let crc = CRC16.checksum(&request[1..6]);
        assert_eq!(request[6], (crc & 0xff) as u8);
        assert_eq!(request[7], (crc >> 8) as u8);
    }

    #[test]
    fn test_counters_update_averages_accumulate() {
        let data = test_frame(0x05, |b| {
            // phase1 voltage 230.4 V
            b[offsets::PHASE1] = 0x09;
            // inverter.energy = 100000
            b[offsets::INVERTER + 6..offsets::INVERTER + 10]
                .copy_from_slice(&100_000u32.to_be_bytes());
        });
        let frame = SoliviaFrame::parse(&data, 0x05).expect("valid");

        let mut b = bucket();
        accumulate_frame(&mut b, 30.0, &frame);
        accumulate_frame(&mut b, 30.0, &frame);
        finalize_fields(&mut b, 60.0);

        // Average recovers the instantaneous voltage.
        let v = b.value("phase1.voltage").expect("present");
        assert!((v - 230.4).abs() < 1e-3);

        // The counter holds its last value, unscaled by the span.
        assert_eq!(b.value("inverter.energy"), Some(100_000.0));
        assert_eq!(b.value("inverter.feedtime"), Some(0.0));
    }

    #[test]
    fn test_all_fields_extracted() {
        let data = test_frame(0x05, |_| {});
        let frame = SoliviaFrame::parse(&data, 0x05).expect("valid");

        let mut b = bucket();
        accumulate_frame(&mut b, 1.0, &frame);
        assert_eq!(b.len(), AVERAGED_FIELDS.len() + COUNTER_FIELDS.len());
    }

    #[tokio::test]
    async fn test_round_trip_over_loopback() {
        // Inverter stub answering one poll on loopback.
        let inverter = UdpSocket::bind(("127.0.0.1", 0)).await.expect("bind stub");
        let inverter_port = inverter.local_addr().expect("addr").port();

        let mut meter = SoliviaMeter::open("127.0.0.1", inverter_port, 0, 0x05, false)
            .await
            .expect("open meter");
        // Listen port 0 was auto-assigned; the stub needs the real one.
        let listen_port = meter.receive.local_addr().expect("addr").port();

        let reply = test_frame(0x05, |b| {
            b[offsets::PHASE1] = 0x09;
        });
        let stub = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, _peer) = inverter.recv_from(&mut buf).await.expect("request");
            assert_eq!(len, 9);
            assert_eq!(buf[0], 0x02);
            // Replies go to the meter's listen socket, not the send socket.
            inverter
                .send_to(&reply, ("127.0.0.1", listen_port))
                .await
                .expect("reply");
        });

        let mut b = bucket();
        let mut previous = SystemTime::now();
        let samples = meter.poll_into(&mut b, &mut previous).await.expect("poll");
        assert_eq!(samples, 1);
        assert!(b.value("phase1.voltage").is_some());

        stub.await.expect("stub");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_yields_no_sample() {
        let mut meter = SoliviaMeter::open("127.0.0.1", 47119, 0, 0x05, true)
            .await
            .expect("open meter");

        let mut b = bucket();
        let mut previous = SystemTime::now();
        let samples = meter.poll_into(&mut b, &mut previous).await.expect("poll");
        assert_eq!(samples, 0);
        assert!(b.is_empty());
    }
}
