//! KryoFlux-compatible personality.
//!
//! Commands arrive on two transports: legacy 4-byte bulk command words and
//! USB control transfers; the control form takes priority when both are
//! pending. Flux is re-encoded at the protocol's ~24.027 MHz stream clock
//! into the tiered FLUX1/FLUX2/FLUX3/OVL16 codes with out-of-band records
//! for index pulses and stream boundaries.

use std::collections::VecDeque;

use crate::drive::{DriveBus, FluxSample};
use crate::packet::{ControlInReply, ControlReply, ControlTransfer};
use crate::router::{Codec, TxUnit};

pub const CMD_RESET: u8 = 0x00;
pub const CMD_DEVICE: u8 = 0x01;
pub const CMD_MOTOR: u8 = 0x02;
pub const CMD_DENSITY: u8 = 0x03;
pub const CMD_SIDE: u8 = 0x04;
pub const CMD_TRACK: u8 = 0x05;
pub const CMD_STREAM: u8 = 0x06;
pub const CMD_MIN_TRACK: u8 = 0x07;
pub const CMD_MAX_TRACK: u8 = 0x08;
pub const CMD_STATUS: u8 = 0x09;
pub const CMD_INFO: u8 = 0x0A;

pub const ST_OK: u8 = 0x00;
pub const ST_BAD_COMMAND: u8 = 0x01;
pub const ST_OUT_OF_RANGE: u8 = 0x02;
pub const ST_NOT_READY: u8 = 0x03;

/// Stream opcode bytes. 0x00-0x07 are FLUX2 accumulation codes and
/// 0x0E-0xFF are FLUX1 codes; the gap is occupied by the opcodes below.
pub const OP_NOP1: u8 = 0x08;
pub const OP_NOP2: u8 = 0x09;
pub const OP_NOP3: u8 = 0x0A;
pub const OP_OVL16: u8 = 0x0B;
pub const OP_FLUX3: u8 = 0x0C;
pub const OP_OOB: u8 = 0x0D;

/// FLUX1 bytes carry `value + FLUX1_BIAS`.
pub const FLUX1_BIAS: u32 = 14;
/// Largest value a FLUX1 byte can carry.
pub const FLUX1_MAX: u32 = 0xFF - FLUX1_BIAS;

pub const OOB_STREAM_INFO: u8 = 0x01;
pub const OOB_INDEX: u8 = 0x02;
pub const OOB_STREAM_END: u8 = 0x03;
pub const OOB_EOF: u8 = 0x0D;

/// Capture ticks are converted with a fixed-point multiply-then-shift to
/// the ~24.027 MHz stream clock.
pub const RATE_MUL: u64 = 524;
pub const RATE_SHIFT: u32 = 13;

const INFO_STRING: &[u8] = b"name=FluxRipper, version=1.6, sck=24027428";

/// Seek and range parameters, configurable at reset. Timing is in scheduler
/// ticks of one microsecond.
#[derive(Debug, Clone)]
pub struct KfConfig {
    /// Step pulse width; default 3 us.
    pub step_pulse: u32,
    /// Step-to-step interval; default 3 ms.
    pub step_interval: u32,
    /// Head settle after the last step; default 15 ms.
    pub settle: u32,
    pub track_min: u8,
    pub track_max: u8,
}

impl Default for KfConfig {
    fn default() -> Self {
        Self { step_pulse: 3, step_interval: 3000, settle: 15_000, track_min: 0, track_max: 83 }
    }
}

/// Event recovered from a KryoFlux stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// A delivered flux interval in stream-clock ticks.
    Flux(u32),
    /// An out-of-band record header was parsed; payload follows internally.
    Oob { subtype: u8, len: u16 },
}

/// Decoder for the tiered stream encoding, OOB records included.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending: u32,
    state: DecodeState,
}

#[derive(Debug, Default)]
enum DecodeState {
    #[default]
    Idle,
    Skip(u8),
    Flux3 { got: Option<u8> },
    OobSubtype,
    OobLen { subtype: u8, lo: Option<u8> },
    OobPayload { remaining: u16 },
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, byte: u8) -> Option<StreamEvent> {
        match std::mem::take(&mut self.state) {
            DecodeState::Idle => match byte {
                0x00..=0x07 => {
                    self.pending += byte as u32;
                    None
                }
                OP_NOP1 => None,
                OP_NOP2 => {
                    self.state = DecodeState::Skip(1);
                    None
                }
                OP_NOP3 => {
                    self.state = DecodeState::Skip(2);
                    None
                }
                OP_OVL16 => {
                    self.pending += 0xFFFF;
                    None
                }
                OP_FLUX3 => {
                    self.state = DecodeState::Flux3 { got: None };
                    None
                }
                OP_OOB => {
                    self.state = DecodeState::OobSubtype;
                    None
                }
                b => {
                    let v = self.pending + (b as u32 - FLUX1_BIAS);
                    self.pending = 0;
                    Some(StreamEvent::Flux(v))
                }
            },
            DecodeState::Skip(n) => {
                if n > 1 {
                    self.state = DecodeState::Skip(n - 1);
                }
                None
            }
            DecodeState::Flux3 { got: None } => {
                self.state = DecodeState::Flux3 { got: Some(byte) };
                None
            }
            DecodeState::Flux3 { got: Some(lo) } => {
                let v = self.pending + u16::from_le_bytes([lo, byte]) as u32;
                self.pending = 0;
                Some(StreamEvent::Flux(v))
            }
            DecodeState::OobSubtype => {
                self.state = DecodeState::OobLen { subtype: byte, lo: None };
                None
            }
            DecodeState::OobLen { subtype, lo: None } => {
                self.state = DecodeState::OobLen { subtype, lo: Some(byte) };
                None
            }
            DecodeState::OobLen { subtype, lo: Some(lo) } => {
                let len = u16::from_le_bytes([lo, byte]);
                // The EOF record carries no payload; its length field is the
                // 0x0D0D marker.
                if subtype != OOB_EOF && len > 0 {
                    self.state = DecodeState::OobPayload { remaining: len };
                }
                Some(StreamEvent::Oob { subtype, len })
            }
            DecodeState::OobPayload { remaining } => {
                if remaining > 1 {
                    self.state = DecodeState::OobPayload { remaining: remaining - 1 };
                }
                None
            }
        }
    }
}

/// Stream encoder state: fixed-point rate conversion plus the FLUX2
/// accumulation carry. Lives only for the duration of one stream.
#[derive(Debug, Default)]
struct StreamEncoder {
    frac: u64,
    carry: u32,
    /// Flux bytes emitted (OOB records excluded).
    stream_pos: u32,
    /// Delivered samples since the last index.
    sample_counter: u32,
    revolution: u32,
}

impl StreamEncoder {
    fn convert(&mut self, capture_ticks: u32) -> u32 {
        let num = capture_ticks as u64 * RATE_MUL + self.frac;
        self.frac = num & ((1 << RATE_SHIFT) - 1);
        (num >> RATE_SHIFT) as u32
    }

    fn push_flux(&mut self, out: &mut VecDeque<u8>, value: u32) {
        let mut v = value + self.carry;
        self.carry = 0;
        let mut overflowed = false;
        while v >= 0xFFFF {
            out.push_back(OP_OVL16);
            self.stream_pos += 1;
            self.sample_counter += 1;
            v -= 0xFFFF;
            overflowed = true;
        }
        if !overflowed && v == 0 {
            return;
        }
        if !overflowed && v <= 7 {
            // Too small to stand alone: accumulates into the next sample.
            self.carry = v;
        } else if v <= FLUX1_MAX {
            out.push_back((v + FLUX1_BIAS) as u8);
            self.stream_pos += 1;
            self.sample_counter += 1;
        } else {
            out.push_back(OP_FLUX3);
            let [lo, hi] = (v as u16).to_le_bytes();
            out.push_back(lo);
            out.push_back(hi);
            self.stream_pos += 3;
            self.sample_counter += 1;
        }
    }

    /// Flushes an accumulated-but-undelivered value with a zero-value FLUX1
    /// terminator. Compatibility risk against the reference tool; see
    /// DESIGN.md.
    fn flush(&mut self, out: &mut VecDeque<u8>) {
        if self.carry > 0 {
            out.push_back(self.carry as u8);
            out.push_back(FLUX1_BIAS as u8);
            self.stream_pos += 2;
            self.sample_counter += 1;
            self.carry = 0;
        }
    }

    fn oob(out: &mut VecDeque<u8>, subtype: u8, payload: &[u8]) {
        out.push_back(OP_OOB);
        out.push_back(subtype);
        let [lo, hi] = (payload.len() as u16).to_le_bytes();
        out.push_back(lo);
        out.push_back(hi);
        out.extend(payload.iter().copied());
    }

    fn stream_info(&self, out: &mut VecDeque<u8>) {
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&self.stream_pos.to_le_bytes());
        payload[4..].copy_from_slice(&self.sample_counter.to_le_bytes());
        Self::oob(out, OOB_STREAM_INFO, &payload);
    }

    fn index(&mut self, out: &mut VecDeque<u8>) {
        let mut payload = [0u8; 12];
        payload[..4].copy_from_slice(&self.stream_pos.to_le_bytes());
        payload[4..8].copy_from_slice(&self.sample_counter.to_le_bytes());
        payload[8..].copy_from_slice(&self.revolution.to_le_bytes());
        Self::oob(out, OOB_INDEX, &payload);
        self.revolution += 1;
        self.sample_counter = 0;
    }

    fn stream_end(&self, out: &mut VecDeque<u8>, result: u32) {
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&self.stream_pos.to_le_bytes());
        payload[4..].copy_from_slice(&result.to_le_bytes());
        Self::oob(out, OOB_STREAM_END, &payload);
        // EOF: subtype 0x0D with the 0x0D0D length marker, no payload.
        out.push_back(OP_OOB);
        out.push_back(OOB_EOF);
        out.push_back(0x0D);
        out.push_back(0x0D);
    }
}

#[derive(Debug)]
enum SeekPhase {
    Pulse(u32),
    Gap(u32),
    Settle(u32),
}

#[derive(Debug)]
struct KfSeek {
    remaining: u32,
    inward: bool,
    target: u8,
    phase: SeekPhase,
}

#[derive(Debug)]
enum KfState {
    Idle,
    Seeking(KfSeek),
    Streaming(StreamEncoder),
}

/// Pending command word, from either transport.
#[derive(Debug, Clone, Copy)]
struct PendingCmd {
    cmd: u8,
    arg: u16,
}

/// The KryoFlux command and stream engine.
pub struct KryoFluxCodec {
    cfg: KfConfig,
    track_min: u8,
    track_max: u8,
    state: KfState,
    cmd_word: Vec<u8>,
    /// Bulk command awaiting execution.
    pending_bulk: Option<PendingCmd>,
    /// Control-transfer command awaiting execution; beats the bulk word.
    pending_ctrl: Option<PendingCmd>,
    resp: VecDeque<u8>,
    cylinder: u8,
    side: u8,
    density: u8,
    device: u8,
    motor_on: bool,
}

const RESP_HIGH_WATER: usize = 4096;

impl KryoFluxCodec {
    pub fn new(cfg: KfConfig) -> Self {
        Self {
            track_min: cfg.track_min,
            track_max: cfg.track_max,
            cfg,
            state: KfState::Idle,
            cmd_word: Vec::new(),
            pending_bulk: None,
            pending_ctrl: None,
            resp: VecDeque::new(),
            cylinder: 0,
            side: 0,
            density: 0,
            device: 0,
            motor_on: false,
        }
    }

    pub fn cylinder(&self) -> u8 {
        self.cylinder
    }

    fn respond(&mut self, cmd: u8, status: u8, value: u16) {
        self.resp.push_back(cmd);
        self.resp.push_back(status);
        let [lo, hi] = value.to_le_bytes();
        self.resp.push_back(lo);
        self.resp.push_back(hi);
    }

    fn execute(&mut self, pending: PendingCmd, drive: &mut DriveBus) {
        let PendingCmd { cmd, arg } = pending;
        tracing::debug!(cmd, arg, "command");
        match cmd {
            CMD_RESET => {
                self.track_min = self.cfg.track_min;
                self.track_max = self.cfg.track_max;
                self.side = 0;
                self.density = 0;
                self.motor_on = false;
                drive.release_outputs();
                self.respond(cmd, ST_OK, 0);
            }
            CMD_DEVICE => {
                if arg > 1 {
                    self.respond(cmd, ST_OUT_OF_RANGE, arg);
                } else {
                    self.device = arg as u8;
                    drive.selected = Some(self.device);
                    self.respond(cmd, ST_OK, arg);
                }
            }
            CMD_MOTOR => {
                self.motor_on = arg != 0;
                drive.motor_on = self.motor_on;
                self.respond(cmd, ST_OK, arg);
            }
            CMD_DENSITY => {
                self.density = arg as u8;
                self.respond(cmd, ST_OK, arg);
            }
            CMD_SIDE => {
                if arg > 1 {
                    self.respond(cmd, ST_OUT_OF_RANGE, arg);
                } else {
                    self.side = arg as u8;
                    drive.head = self.side;
                    self.respond(cmd, ST_OK, arg);
                }
            }
            CMD_TRACK => self.track(arg, drive),
            CMD_STREAM => self.stream(arg != 0),
            CMD_MIN_TRACK => {
                self.track_min = arg as u8;
                self.respond(cmd, ST_OK, arg);
            }
            CMD_MAX_TRACK => {
                self.track_max = arg as u8;
                self.respond(cmd, ST_OK, arg);
            }
            CMD_STATUS => {
                let cylinder = self.cylinder;
                self.respond(cmd, ST_OK, cylinder as u16);
            }
            CMD_INFO => {
                self.respond(cmd, ST_OK, INFO_STRING.len() as u16);
                self.resp.extend(INFO_STRING.iter().copied());
            }
            _ => self.respond(cmd, ST_BAD_COMMAND, arg),
        }
    }

    fn track(&mut self, arg: u16, _drive: &mut DriveBus) {
        let Ok(target) = u8::try_from(arg) else {
            self.respond(CMD_TRACK, ST_OUT_OF_RANGE, arg);
            return;
        };
        if target < self.track_min || target > self.track_max {
            // No movement for out-of-range targets.
            self.respond(CMD_TRACK, ST_OUT_OF_RANGE, arg);
            return;
        }
        if target == self.cylinder {
            self.respond(CMD_TRACK, ST_OK, target as u16);
            return;
        }
        let (remaining, inward) = if target > self.cylinder {
            ((target - self.cylinder) as u32, true)
        } else {
            ((self.cylinder - target) as u32, false)
        };
        self.state = KfState::Seeking(KfSeek {
            remaining,
            inward,
            target,
            phase: SeekPhase::Gap(0),
        });
    }

    fn stream(&mut self, start: bool) {
        if start {
            if matches!(self.state, KfState::Streaming(_)) {
                self.respond(CMD_STREAM, ST_BAD_COMMAND, 1);
                return;
            }
            self.respond(CMD_STREAM, ST_OK, 1);
            let mut enc = StreamEncoder::default();
            enc.stream_info(&mut self.resp);
            self.state = KfState::Streaming(enc);
            return;
        }
        let KfState::Streaming(mut enc) = std::mem::replace(&mut self.state, KfState::Idle) else {
            self.respond(CMD_STREAM, ST_BAD_COMMAND, 0);
            return;
        };
        enc.flush(&mut self.resp);
        enc.stream_end(&mut self.resp, 0);
        self.respond(CMD_STREAM, ST_OK, 0);
    }
}

impl Codec for KryoFluxCodec {
    fn can_accept(&self) -> bool {
        if self.pending_bulk.is_some() {
            return false;
        }
        match self.state {
            // Strict request/response pairing between command words.
            KfState::Idle => self.resp.is_empty(),
            KfState::Streaming(_) => self.resp.len() < RESP_HIGH_WATER,
            KfState::Seeking(_) => false,
        }
    }

    fn accept(&mut self, byte: u8, _drive: &mut DriveBus) {
        self.cmd_word.push(byte);
        if self.cmd_word.len() == 4 {
            let cmd = self.cmd_word[0];
            let arg = u16::from_le_bytes([self.cmd_word[2], self.cmd_word[3]]);
            self.cmd_word.clear();
            self.pending_bulk = Some(PendingCmd { cmd, arg });
        }
    }

    fn poll_tx(&mut self) -> Option<TxUnit> {
        self.resp.pop_front().map(TxUnit::Byte)
    }

    fn offer_flux(&mut self, sample: FluxSample, _drive: &mut DriveBus) -> bool {
        let KfState::Streaming(_) = &self.state else {
            return true;
        };
        if self.resp.len() >= RESP_HIGH_WATER {
            return false;
        }
        let KfState::Streaming(enc) = &mut self.state else { unreachable!() };
        let v = enc.convert(sample.timestamp());
        if sample.is_index() {
            // The interval keeps accumulating across the index marker.
            enc.carry += v;
            enc.index(&mut self.resp);
        } else {
            enc.push_flux(&mut self.resp, v);
        }
        true
    }

    fn step(&mut self, drive: &mut DriveBus) {
        // Control-transfer commands win over a pending bulk word.
        if matches!(self.state, KfState::Idle | KfState::Streaming(_)) {
            if let Some(cmd) = self.pending_ctrl.take().or_else(|| self.pending_bulk.take()) {
                self.execute(cmd, drive);
                return;
            }
        }
        let KfState::Seeking(seek) = &mut self.state else {
            return;
        };
        match &mut seek.phase {
            SeekPhase::Pulse(left) => {
                drive.step_assert(!seek.inward);
                if *left > 1 {
                    *left -= 1;
                } else {
                    drive.step_release();
                    seek.remaining -= 1;
                    let gap = self.cfg.step_interval.saturating_sub(self.cfg.step_pulse);
                    seek.phase = SeekPhase::Gap(gap);
                }
            }
            SeekPhase::Gap(left) => {
                if *left > 0 {
                    *left -= 1;
                } else if seek.remaining > 0 {
                    seek.phase = SeekPhase::Pulse(self.cfg.step_pulse);
                } else {
                    seek.phase = SeekPhase::Settle(self.cfg.settle);
                }
            }
            SeekPhase::Settle(left) => {
                if *left > 0 {
                    *left -= 1;
                } else {
                    let target = seek.target;
                    self.cylinder = target;
                    self.state = KfState::Idle;
                    self.respond(CMD_TRACK, ST_OK, target as u16);
                }
            }
        }
    }

    fn busy(&self) -> bool {
        !matches!(self.state, KfState::Idle)
            || !self.resp.is_empty()
            || !self.cmd_word.is_empty()
            || self.pending_bulk.is_some()
            || self.pending_ctrl.is_some()
    }

    fn reset(&mut self) {
        self.state = KfState::Idle;
        self.cmd_word.clear();
        self.pending_bulk = None;
        self.pending_ctrl = None;
        self.resp.clear();
        self.track_min = self.cfg.track_min;
        self.track_max = self.cfg.track_max;
        self.side = 0;
        self.density = 0;
        self.motor_on = false;
    }

    fn control_out(&mut self, xfer: &ControlTransfer, _data: &[u8]) -> Option<ControlReply> {
        if xfer.request_type & 0x60 != 0x40 {
            return None;
        }
        self.pending_ctrl = Some(PendingCmd { cmd: xfer.request, arg: xfer.value });
        Some(ControlReply::Ack)
    }

    fn control_in(&mut self, xfer: &ControlTransfer) -> Option<ControlInReply> {
        if xfer.request_type & 0x60 != 0x40 {
            return None;
        }
        match xfer.request {
            CMD_INFO => Some(ControlInReply::Data(INFO_STRING.into())),
            CMD_STATUS => {
                let mut data = [0u8; 4];
                data[0] = ST_OK;
                data[1] = self.cylinder;
                data[2] = self.side;
                data[3] = self.motor_on as u8;
                Some(ControlInReply::Data(data.as_slice().into()))
            }
            _ => Some(ControlInReply::Stall),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn encode_values(values: &[u32]) -> (VecDeque<u8>, StreamEncoder) {
        let mut enc = StreamEncoder::default();
        let mut out = VecDeque::new();
        for &v in values {
            enc.push_flux(&mut out, v);
        }
        (out, enc)
    }

    fn decode_flux(bytes: impl IntoIterator<Item = u8>) -> Vec<u32> {
        let mut dec = StreamDecoder::new();
        bytes
            .into_iter()
            .filter_map(|b| match dec.push(b) {
                Some(StreamEvent::Flux(v)) => Some(v),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn round_trip_single_values() {
        let samples = (8u32..=2048).chain((2049..=0xFF_FFFF).step_by(991)).chain([0xFF_FFFF]);
        for v in samples {
            let (out, enc) = encode_values(&[v]);
            let decoded = decode_flux(out);
            assert_eq!(enc.carry, 0, "value {v} left a carry");
            assert_eq!(decoded.iter().sum::<u32>(), v, "value {v}");
        }
    }

    #[test]
    fn flux2_accumulates_into_next_sample() {
        // Two sub-threshold samples deliver once, as a single FLUX1 group.
        let (out, _) = encode_values(&[5, 5]);
        let bytes: Vec<u8> = out.clone().into();
        assert_eq!(bytes, vec![(10 + FLUX1_BIAS) as u8]);
        assert_eq!(decode_flux(out), vec![10]);
    }

    #[test]
    fn pending_carry_flushes_with_zero_terminator() {
        let (mut out, mut enc) = encode_values(&[6]);
        assert!(out.is_empty());
        assert_eq!(enc.carry, 6);
        enc.flush(&mut out);
        let bytes: Vec<u8> = out.clone().into();
        assert_eq!(bytes, vec![6, FLUX1_BIAS as u8]);
        assert_eq!(decode_flux(out), vec![6]);
    }

    #[test]
    fn overflow_markers_deliver_ffff_ticks_each() {
        let (out, _) = encode_values(&[0x2_0005]);
        let decoded = decode_flux(out);
        assert_eq!(decoded.iter().sum::<u32>(), 0x2_0005);
    }

    #[test]
    fn flux3_boundaries() {
        let (out, _) = encode_values(&[FLUX1_MAX]);
        assert_eq!(out.len(), 1);
        let (out, _) = encode_values(&[FLUX1_MAX + 1]);
        let bytes: Vec<u8> = out.into();
        assert_eq!(bytes[0], OP_FLUX3);
        assert_eq!(u16::from_le_bytes([bytes[1], bytes[2]]) as u32, FLUX1_MAX + 1);
    }

    #[test]
    fn index_record_framing() {
        let mut enc = StreamEncoder::default();
        let mut out = VecDeque::new();
        enc.push_flux(&mut out, 100);
        out.clear();
        enc.index(&mut out);
        let bytes: Vec<u8> = out.into();
        assert_eq!(bytes[0], OP_OOB);
        assert_eq!(bytes[1], OOB_INDEX);
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 12);
        // Stream position counts flux bytes only; one FLUX1 byte so far.
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 0);
    }

    #[test]
    fn decoder_passes_oob_records() {
        let mut enc = StreamEncoder::default();
        let mut out = VecDeque::new();
        enc.stream_info(&mut out);
        enc.push_flux(&mut out, 50);
        enc.stream_end(&mut out, 0);
        let mut dec = StreamDecoder::new();
        let events: Vec<StreamEvent> = out.into_iter().filter_map(|b| dec.push(b)).collect();
        assert_eq!(
            events,
            vec![
                StreamEvent::Oob { subtype: OOB_STREAM_INFO, len: 8 },
                StreamEvent::Flux(50),
                StreamEvent::Oob { subtype: OOB_STREAM_END, len: 8 },
                StreamEvent::Oob { subtype: OOB_EOF, len: 0x0D0D },
            ]
        );
    }

    fn run_ticks(codec: &mut KryoFluxCodec, drive: &mut DriveBus, max: u32) {
        for _ in 0..max {
            if !codec.busy() && codec.pending_bulk.is_none() {
                break;
            }
            codec.step(drive);
            if !codec.resp.is_empty() && matches!(codec.state, KfState::Idle) {
                break;
            }
        }
    }

    fn send_word(codec: &mut KryoFluxCodec, drive: &mut DriveBus, cmd: u8, arg: u16) {
        let [lo, hi] = arg.to_le_bytes();
        for b in [cmd, 0, lo, hi] {
            codec.accept(b, drive);
        }
    }

    fn drain(codec: &mut KryoFluxCodec) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(unit) = codec.poll_tx() {
            if let TxUnit::Byte(b) = unit {
                out.push(b);
            }
        }
        out
    }

    #[test]
    fn seek_pulses_and_settle() {
        // TRACK(80) from cylinder 0 with track_max 82: exactly 80 pulses,
        // one settle, status 0 with the new cylinder.
        let mut codec = KryoFluxCodec::new(KfConfig::default());
        let mut drive = DriveBus::new();
        send_word(&mut codec, &mut drive, CMD_MAX_TRACK, 82);
        run_ticks(&mut codec, &mut drive, 10);
        drain(&mut codec);
        send_word(&mut codec, &mut drive, CMD_TRACK, 80);
        run_ticks(&mut codec, &mut drive, 300_000_000);
        assert_eq!(drive.step_pulses, 80);
        assert_eq!(codec.cylinder(), 80);
        assert_eq!(drain(&mut codec), vec![CMD_TRACK, ST_OK, 80, 0]);
    }

    #[test]
    fn out_of_range_track_rejected_without_movement() {
        let mut codec = KryoFluxCodec::new(KfConfig::default());
        let mut drive = DriveBus::new();
        send_word(&mut codec, &mut drive, CMD_MAX_TRACK, 82);
        run_ticks(&mut codec, &mut drive, 10);
        drain(&mut codec);
        send_word(&mut codec, &mut drive, CMD_TRACK, 83);
        run_ticks(&mut codec, &mut drive, 10);
        assert_eq!(drive.step_pulses, 0);
        let resp = drain(&mut codec);
        assert_eq!(resp[..2], [CMD_TRACK, ST_OUT_OF_RANGE]);
    }

    #[test]
    fn control_transport_takes_priority() {
        let mut codec = KryoFluxCodec::new(KfConfig::default());
        let mut drive = DriveBus::new();
        send_word(&mut codec, &mut drive, CMD_DENSITY, 1);
        let xfer = ControlTransfer {
            request_type: 0x40,
            request: CMD_SIDE,
            value: 1,
            index: 0,
            length: 0,
            phase: crate::packet::ControlPhase::Setup,
        };
        assert!(codec.control_out(&xfer, &[]).is_some());
        codec.step(&mut drive);
        // The control-issued SIDE command executed first.
        assert_eq!(drain(&mut codec), vec![CMD_SIDE, ST_OK, 1, 0]);
        codec.step(&mut drive);
        assert_eq!(drain(&mut codec), vec![CMD_DENSITY, ST_OK, 1, 0]);
    }

    #[test]
    fn stream_stop_emits_end_records() {
        let mut codec = KryoFluxCodec::new(KfConfig::default());
        let mut drive = DriveBus::new();
        send_word(&mut codec, &mut drive, CMD_STREAM, 1);
        codec.step(&mut drive);
        let start = drain(&mut codec);
        assert_eq!(&start[..4], &[CMD_STREAM, ST_OK, 1, 0]);
        assert_eq!(start[4], OP_OOB);
        assert_eq!(start[5], OOB_STREAM_INFO);
        assert!(codec.offer_flux(FluxSample::new(1000), &mut drive));
        send_word(&mut codec, &mut drive, CMD_STREAM, 0);
        codec.step(&mut drive);
        let end = drain(&mut codec);
        // Stream tail: StreamEnd record, EOF record, then the command response.
        assert_eq!(&end[end.len() - 4..], &[CMD_STREAM, ST_OK, 0, 0]);
        assert_eq!(&end[end.len() - 8..end.len() - 4], &[OP_OOB, OOB_EOF, 0x0D, 0x0D]);
    }
}
