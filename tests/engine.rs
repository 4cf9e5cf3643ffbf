//! End-to-end tests driving raw link-layer packets through the async bus.

use bytes::Bytes;
use rand::prelude::*;
use rand_xoshiro::Xoshiro128StarStar;
use std::sync::Once;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fluxlink::bus::{BusReceiver, BusSender, FluxFeeder, UsbBus};
use fluxlink::crc::{crc16, token_word};
use fluxlink::drive::FluxSample;
use fluxlink::engine::EngineConfig;
use fluxlink::greaseweazle::{self, FluxDecoder, FluxEvent};
use fluxlink::kryoflux::{self, StreamDecoder, StreamEvent};
use fluxlink::msc::RamDisk;
use fluxlink::native;
use fluxlink::packet::Pid;
use fluxlink::{CBW_SIGNATURE, CSW_SIGNATURE, EP_BULK_IN, EP_BULK_OUT, NATIVE_SIGNATURE};

const SAMPLE_SEED: u64 = 40517;

fn init_log() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        tracing_subscriber::registry().with(fmt::layer()).with(EnvFilter::from_default_env()).init();
        tracing_log::LogTracer::init().unwrap();
    });
}

/// Host end of the link: builds token and data packets, handles handshakes
/// and buffers payload bytes across transfer boundaries.
struct UsbHost {
    tx: BusSender,
    rx: BusReceiver,
    pending: Vec<u8>,
}

impl UsbHost {
    fn start() -> (UsbBus, UsbHost, FluxFeeder) {
        init_log();
        let (bus, tx, rx, flux) = UsbBus::new(EngineConfig::default(), RamDisk::new(64));
        (bus, UsbHost { tx, rx, pending: Vec::new() }, flux)
    }

    async fn send_token(&mut self, pid: Pid, ep: u8) {
        let word = token_word(0, ep);
        let packet = Bytes::copy_from_slice(&[pid.to_byte(), word as u8, (word >> 8) as u8]);
        self.tx.send(packet).await.unwrap();
    }

    async fn send_data(&mut self, payload: &[u8]) {
        let mut packet = Vec::with_capacity(payload.len() + 3);
        packet.push(Pid::Data0.to_byte());
        packet.extend_from_slice(payload);
        packet.extend_from_slice(&crc16(payload).to_le_bytes());
        self.tx.send(packet.into()).await.unwrap();
    }

    /// One bulk OUT transaction, retried until the device ACKs.
    async fn bulk_out(&mut self, payload: &[u8]) {
        loop {
            self.send_token(Pid::Out, EP_BULK_OUT).await;
            self.send_data(payload).await;
            let handshake = self.rx.recv().await.unwrap();
            assert_eq!(handshake.len(), 1, "expected a handshake packet");
            if handshake[0] == Pid::Ack.to_byte() {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    /// One bulk IN transaction into the pending buffer; false on NAK.
    async fn bulk_in(&mut self) -> bool {
        self.send_token(Pid::In, EP_BULK_IN).await;
        let packet = self.rx.recv().await.unwrap();
        if packet.len() == 1 {
            assert_eq!(packet[0], Pid::Nak.to_byte());
            return false;
        }
        self.tx.send(Bytes::copy_from_slice(&[Pid::Ack.to_byte()])).await.unwrap();
        self.pending.extend_from_slice(&packet[1..packet.len() - 2]);
        true
    }

    /// Reads until exactly `n` payload bytes are available, then takes them.
    async fn read_exact(&mut self, n: usize) -> Vec<u8> {
        let mut naks = 0u32;
        while self.pending.len() < n {
            if !self.bulk_in().await {
                naks += 1;
                assert!(naks < 1_000_000, "device stalled at {}/{} bytes", self.pending.len(), n);
                tokio::task::yield_now().await;
            }
        }
        self.pending.drain(..n).collect()
    }

    /// Reads until the terminator sequence appears, then takes everything
    /// through it; later bytes stay buffered.
    async fn read_until(&mut self, suffix: &[u8]) -> Vec<u8> {
        let mut naks = 0u32;
        loop {
            if let Some(pos) = self
                .pending
                .windows(suffix.len())
                .position(|window| window == suffix)
            {
                return self.pending.drain(..pos + suffix.len()).collect();
            }
            if !self.bulk_in().await {
                naks += 1;
                assert!(
                    naks < 1_000_000,
                    "terminator never arrived ({} bytes in)",
                    self.pending.len()
                );
                tokio::task::yield_now().await;
            }
        }
    }

    /// Runs one Greaseweazle command and returns its full response.
    async fn gw_command(&mut self, cmd: &[u8], payload_len: usize) -> Vec<u8> {
        self.bulk_out(cmd).await;
        let resp = self.read_exact(2 + payload_len).await;
        assert_eq!(resp[0], cmd[0], "opcode echo");
        resp
    }

    /// Device-to-host control transfer on the default endpoint.
    async fn control_in(&mut self, request_type: u8, request: u8, value: u16, length: u16) -> Vec<u8> {
        self.send_token(Pid::Setup, 0).await;
        let mut setup = vec![request_type, request];
        setup.extend_from_slice(&value.to_le_bytes());
        setup.extend_from_slice(&0u16.to_le_bytes());
        setup.extend_from_slice(&length.to_le_bytes());
        self.send_data(&setup).await;
        let handshake = self.rx.recv().await.unwrap();
        assert_eq!(handshake[0], Pid::Ack.to_byte());

        let mut data = Vec::new();
        loop {
            self.send_token(Pid::In, 0).await;
            let packet = self.rx.recv().await.unwrap();
            assert_ne!(packet.len(), 1, "control request stalled");
            self.tx.send(Bytes::copy_from_slice(&[Pid::Ack.to_byte()])).await.unwrap();
            let chunk = &packet[1..packet.len() - 2];
            data.extend_from_slice(chunk);
            if data.len() >= length as usize || chunk.len() < 64 {
                break;
            }
        }

        // Status stage: zero-length OUT.
        self.send_token(Pid::Out, 0).await;
        self.send_data(&[]).await;
        let handshake = self.rx.recv().await.unwrap();
        assert_eq!(handshake[0], Pid::Ack.to_byte());
        data
    }
}

#[tokio::test]
async fn greaseweazle_get_info_identity() {
    let (_bus, mut host, _flux) = UsbHost::start();
    let resp = host.gw_command(&[0x00, 0x03, 0x00], 32).await;
    assert_eq!(resp[1], greaseweazle::ACK_OKAY);
    assert_eq!(&resp[2..6], &[1, 6, 1, 22]);
    assert_eq!(&resp[6..10], &72_000_000u32.to_le_bytes());
    assert_eq!(&resp[10..12], &[7, 1]);
}

#[tokio::test]
async fn greaseweazle_flux_capture_round_trip() {
    let (_bus, mut host, flux) = UsbHost::start();

    let resp = host.gw_command(&[0x0E, 0x03, 0x01], 0).await;
    assert_eq!(resp[1], greaseweazle::ACK_OKAY);
    let resp = host.gw_command(&[0x0C, 0x03, 0x00], 0).await;
    assert_eq!(resp[1], greaseweazle::ACK_OKAY);

    // Capture-clock intervals spanning all three encoding tiers.
    let mut rng = Xoshiro128StarStar::seed_from_u64(SAMPLE_SEED);
    let mut samples: Vec<u32> = (0..200).map(|_| rng.random_range(100..20_000)).collect();
    samples.push(10_000_000);
    samples.push(150);

    // Replicate the 6/25 conversion with remainder carry.
    let mut rem = 0u64;
    let expected: Vec<u32> = samples
        .iter()
        .map(|&ts| {
            let num = ts as u64 * 6 + rem;
            rem = num % 25;
            (num / 25) as u32
        })
        .collect();
    let total: u64 = expected.iter().map(|&v| v as u64).sum();

    let mut cmd = vec![0x07, 0x08];
    cmd.extend_from_slice(&(total as u32).to_le_bytes());
    cmd.extend_from_slice(&0u16.to_le_bytes());
    let resp = host.gw_command(&cmd, 0).await;
    assert_eq!(resp[1], greaseweazle::ACK_OKAY);

    for &ts in &samples {
        flux.feed(FluxSample::new(ts)).await.unwrap();
    }

    let stream = host.read_until(&[0x00]).await;
    let mut decoder = FluxDecoder::new();
    let mut decoded = Vec::new();
    for &b in &stream {
        match decoder.push(b) {
            Some(FluxEvent::Flux(v)) => decoded.push(v),
            Some(FluxEvent::Index(_)) => panic!("no index samples were fed"),
            Some(FluxEvent::End) | None => (),
        }
    }
    assert_eq!(decoded, expected);

    let resp = host.gw_command(&[0x09, 0x02], 0).await;
    assert_eq!(resp[1], greaseweazle::ACK_OKAY);
}

#[tokio::test]
async fn greaseweazle_source_bytes_pattern() {
    let (_bus, mut host, _flux) = UsbHost::start();
    let mut cmd = vec![0x12, 0x0A];
    cmd.extend_from_slice(&256u32.to_le_bytes());
    cmd.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
    host.bulk_out(&cmd).await;
    let resp = host.read_exact(2 + 256).await;
    assert_eq!(&resp[..2], &[0x12, greaseweazle::ACK_OKAY]);

    let mut pattern = 0xDEAD_BEEFu32;
    for (i, &b) in resp[2..].iter().enumerate() {
        pattern ^= pattern << 13;
        pattern ^= pattern >> 17;
        pattern ^= pattern << 5;
        assert_eq!(b, pattern as u8, "pattern mismatch at byte {i}");
    }
}

#[tokio::test]
async fn kryoflux_track_seek() {
    let (_bus, mut host, _flux) = UsbHost::start();

    host.bulk_out(&[kryoflux::CMD_MAX_TRACK, 0, 82, 0]).await;
    let resp = host.read_exact(4).await;
    assert_eq!(resp, vec![kryoflux::CMD_MAX_TRACK, kryoflux::ST_OK, 82, 0]);

    // 80 tracks of stepping plus settle run inside the pump task.
    host.bulk_out(&[kryoflux::CMD_TRACK, 0, 80, 0]).await;
    let resp = host.read_exact(4).await;
    assert_eq!(resp, vec![kryoflux::CMD_TRACK, kryoflux::ST_OK, 80, 0]);

    // Out of range: rejected with the explicit status.
    host.bulk_out(&[kryoflux::CMD_TRACK, 0, 83, 0]).await;
    let resp = host.read_exact(4).await;
    assert_eq!(resp[..2], [kryoflux::CMD_TRACK, kryoflux::ST_OUT_OF_RANGE]);
}

#[tokio::test]
async fn kryoflux_stream_accumulates_small_values() {
    let (_bus, mut host, flux) = UsbHost::start();

    host.bulk_out(&[kryoflux::CMD_STREAM, 0, 1, 0]).await;
    let resp = host.read_exact(4).await;
    assert_eq!(resp[..2], [kryoflux::CMD_STREAM, kryoflux::ST_OK]);

    // Two capture intervals of 80 ticks convert to 5 stream ticks each;
    // they must deliver once, as a single FLUX1 group of 10.
    flux.feed(FluxSample::new(80)).await.unwrap();
    flux.feed(FluxSample::new(80)).await.unwrap();

    // The 12-byte StreamInfo record plus the single FLUX1 byte; reading it
    // guarantees both samples went through the encoder before the stop.
    let head = host.read_exact(12 + 1).await;
    assert_eq!(head[12], 10 + kryoflux::FLUX1_BIAS as u8);

    host.bulk_out(&[kryoflux::CMD_STREAM, 0, 0, 0]).await;
    let stream = host.read_until(&[kryoflux::OP_OOB, kryoflux::OOB_EOF, 0x0D, 0x0D]).await;
    let tail = host.read_exact(4).await;
    assert_eq!(tail[..2], [kryoflux::CMD_STREAM, kryoflux::ST_OK]);

    let mut decoder = StreamDecoder::new();
    let flux_events: Vec<u32> = head
        .into_iter()
        .chain(stream)
        .filter_map(|b| match decoder.push(b) {
            Some(StreamEvent::Flux(v)) => Some(v),
            _ => None,
        })
        .collect();
    assert_eq!(flux_events, vec![10]);
}

#[tokio::test]
async fn mass_storage_inquiry_and_phase_error() {
    let (_bus, mut host, _flux) = UsbHost::start();

    let mut cbw = Vec::with_capacity(31);
    cbw.extend_from_slice(&CBW_SIGNATURE.to_le_bytes());
    cbw.extend_from_slice(&0x1122_3344u32.to_le_bytes());
    cbw.extend_from_slice(&36u32.to_le_bytes());
    cbw.push(0x80);
    cbw.push(0);
    cbw.push(6);
    let mut cdb = [0u8; 16];
    cdb[0] = RamDisk::OP_INQUIRY;
    cdb[4] = 36;
    cbw.extend_from_slice(&cdb);
    host.bulk_out(&cbw).await;

    let data = host.read_exact(36).await;
    assert_eq!(&data[8..16], b"FLUXLINK");
    let csw = host.read_exact(13).await;
    assert_eq!(&csw[..4], &CSW_SIGNATURE.to_le_bytes());
    assert_eq!(&csw[4..8], &0x1122_3344u32.to_le_bytes());
    assert_eq!(csw[12], 0x00);

    // bCBWCBLength of 17 must yield a Phase-Error CSW with full residue.
    let mut bad = cbw.clone();
    bad[4..8].copy_from_slice(&0x5566_7788u32.to_le_bytes());
    bad[8..12].copy_from_slice(&4096u32.to_le_bytes());
    bad[14] = 17;
    host.bulk_out(&bad).await;
    let csw = host.read_exact(13).await;
    assert_eq!(&csw[4..8], &0x5566_7788u32.to_le_bytes());
    assert_eq!(u32::from_le_bytes(csw[8..12].try_into().unwrap()), 4096);
    assert_eq!(csw[12], 0x02);
}

#[tokio::test]
async fn mass_storage_read_sector() {
    let (_bus, mut host, _flux) = UsbHost::start();

    let mut cbw = Vec::with_capacity(31);
    cbw.extend_from_slice(&CBW_SIGNATURE.to_le_bytes());
    cbw.extend_from_slice(&7u32.to_le_bytes());
    cbw.extend_from_slice(&512u32.to_le_bytes());
    cbw.push(0x80);
    cbw.push(0);
    cbw.push(10);
    let mut cdb = [0u8; 16];
    cdb[0] = RamDisk::OP_READ_10;
    cdb[8] = 1; // one block
    cbw.extend_from_slice(&cdb);
    host.bulk_out(&cbw).await;

    let data = host.read_exact(512).await;
    assert!(data.iter().all(|&b| b == 0));
    let csw = host.read_exact(13).await;
    assert_eq!(csw[12], 0x00);
    assert_eq!(u32::from_le_bytes(csw[8..12].try_into().unwrap()), 0);
}

#[tokio::test]
async fn native_get_info_over_usb() {
    let (_bus, mut host, _flux) = UsbHost::start();

    let mut cmd = Vec::with_capacity(16);
    cmd.extend_from_slice(&NATIVE_SIGNATURE.to_le_bytes());
    cmd.push(native::CMD_GET_INFO);
    cmd.extend_from_slice(&[0; 11]);
    host.bulk_out(&cmd).await;

    let resp = host.read_exact(8 + 24).await;
    assert_eq!(&resp[..4], &NATIVE_SIGNATURE.to_le_bytes());
    assert_eq!(resp[4], native::RSP_OK);
    assert_eq!(resp[5], native::CMD_GET_INFO);
    assert_eq!(&resp[8..12], &native::DEVICE_ID.to_le_bytes());
}

#[tokio::test]
async fn personalities_switch_between_transactions() {
    let (_bus, mut host, _flux) = UsbHost::start();

    // Greaseweazle, then native, then Mass-Storage, sequentially on one pipe.
    let resp = host.gw_command(&[0x00, 0x03, 0x00], 32).await;
    assert_eq!(resp[1], greaseweazle::ACK_OKAY);

    let mut cmd = Vec::with_capacity(16);
    cmd.extend_from_slice(&NATIVE_SIGNATURE.to_le_bytes());
    cmd.push(native::CMD_NOP);
    cmd.extend_from_slice(&[0; 11]);
    host.bulk_out(&cmd).await;
    let resp = host.read_exact(8).await;
    assert_eq!(resp[4], native::RSP_OK);

    let mut cbw = Vec::with_capacity(31);
    cbw.extend_from_slice(&CBW_SIGNATURE.to_le_bytes());
    cbw.extend_from_slice(&1u32.to_le_bytes());
    cbw.extend_from_slice(&0u32.to_le_bytes());
    cbw.push(0x80);
    cbw.push(0);
    cbw.push(6);
    cbw.extend_from_slice(&[0u8; 16]);
    host.bulk_out(&cbw).await;
    let csw = host.read_exact(13).await;
    assert_eq!(&csw[..4], &CSW_SIGNATURE.to_le_bytes());
}

#[tokio::test]
async fn control_transfers_reach_their_codecs() {
    let (_bus, mut host, _flux) = UsbHost::start();

    // KryoFlux status over the vendor control transport.
    let data = host.control_in(0xC0, kryoflux::CMD_STATUS, 0, 4).await;
    assert_eq!(data[0], kryoflux::ST_OK);
    assert_eq!(data[1], 0); // cylinder

    // Mass-Storage GET MAX LUN class request.
    let data = host.control_in(0xA1, 0xFE, 0, 1).await;
    assert_eq!(data, vec![0]);
}

#[tokio::test]
async fn command_response_pairing_stress() {
    let (_bus, mut host, _flux) = UsbHost::start();
    let mut rng = Xoshiro128StarStar::seed_from_u64(SAMPLE_SEED);

    // Random mix of cheap commands: every command produces exactly one
    // response with the opcode echoed.
    for _ in 0..64 {
        match rng.random_range(0..4u32) {
            0 => {
                let resp = host.gw_command(&[0x00, 0x03, 0x00], 32).await;
                assert_eq!(resp[1], greaseweazle::ACK_OKAY);
            }
            1 => {
                let resp = host.gw_command(&[0x05, 0x03, 0x00], 16).await;
                assert_eq!(resp[1], greaseweazle::ACK_OKAY);
            }
            2 => {
                let resp = host.gw_command(&[0x09, 0x02], 0).await;
                assert_eq!(resp[1], greaseweazle::ACK_OKAY);
            }
            _ => {
                // Unknown opcode still pairs with exactly one response.
                let resp = host.gw_command(&[0x15, 0x02], 0).await;
                assert_eq!(resp[1], greaseweazle::ACK_BAD_COMMAND);
            }
        }
    }
}
