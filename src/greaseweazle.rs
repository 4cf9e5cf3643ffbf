//! Greaseweazle-compatible personality.
//!
//! Implements the Greaseweazle host protocol: 2-byte command headers with
//! little-endian parameters, single `{opcode, ack}` responses, and the
//! 3-tier variable-length flux encoding at the protocol's 72 MHz nominal
//! sample rate. The instrument reports itself as an F7 Lightning so existing
//! host tools work unmodified.

use std::collections::VecDeque;

use crate::drive::{DriveBus, FluxSample};
use crate::router::{Codec, TxUnit};

pub const CMD_GET_INFO: u8 = 0x00;
pub const CMD_UPDATE: u8 = 0x01;
pub const CMD_SEEK: u8 = 0x02;
pub const CMD_HEAD: u8 = 0x03;
pub const CMD_SET_PARAMS: u8 = 0x04;
pub const CMD_GET_PARAMS: u8 = 0x05;
pub const CMD_MOTOR: u8 = 0x06;
pub const CMD_READ_FLUX: u8 = 0x07;
pub const CMD_WRITE_FLUX: u8 = 0x08;
pub const CMD_GET_FLUX_STATUS: u8 = 0x09;
pub const CMD_GET_INDEX_TIMES: u8 = 0x0A;
pub const CMD_SWITCH_FW_MODE: u8 = 0x0B;
pub const CMD_SELECT: u8 = 0x0C;
pub const CMD_DESELECT: u8 = 0x0D;
pub const CMD_SET_BUS_TYPE: u8 = 0x0E;
pub const CMD_SET_PIN: u8 = 0x0F;
pub const CMD_RESET: u8 = 0x10;
pub const CMD_ERASE_FLUX: u8 = 0x11;
pub const CMD_SOURCE_BYTES: u8 = 0x12;
pub const CMD_SINK_BYTES: u8 = 0x13;
pub const CMD_GET_PIN: u8 = 0x14;
pub const CMD_TEST_MODE: u8 = 0x15;
pub const CMD_NOCLICK_STEP: u8 = 0x16;
pub const CMD_MAX: u8 = 0x16;

pub const ACK_OKAY: u8 = 0x00;
pub const ACK_BAD_COMMAND: u8 = 0x01;
pub const ACK_NO_INDEX: u8 = 0x02;
pub const ACK_NO_TRK0: u8 = 0x03;
pub const ACK_FLUX_OVERFLOW: u8 = 0x04;
pub const ACK_FLUX_UNDERFLOW: u8 = 0x05;
pub const ACK_WRPROT: u8 = 0x06;
pub const ACK_NO_UNIT: u8 = 0x07;
pub const ACK_NO_BUS: u8 = 0x08;
pub const ACK_BAD_UNIT: u8 = 0x09;
pub const ACK_BAD_PIN: u8 = 0x0A;
pub const ACK_BAD_CYLINDER: u8 = 0x0B;
pub const ACK_OUT_OF_SRAM: u8 = 0x0C;
pub const ACK_OUT_OF_FLASH: u8 = 0x0D;

const GETINFO_FIRMWARE: u8 = 0x00;
const GETINFO_CURRENT_DRIVE: u8 = 0x07;
const PARAMS_DELAYS: u8 = 0x00;

const FLUXOP_INDEX: u8 = 0x01;
const FLUXOP_SPACE: u8 = 0x02;

/// Values 1..=249 are encoded directly as one byte.
const FLUX_MAX_DIRECT: u32 = 249;
/// Values 250..=1524 take the two-byte form.
const FLUX_2BYTE_MAX: u32 = 1524;

/// Capture clock ticks are rescaled by 6/25 to the 72 MHz protocol rate.
const RATE_NUM: u64 = 6;
const RATE_DEN: u64 = 25;

/// Identity reported by GET_INFO: Greaseweazle F7 Lightning, firmware 1.6.
const FW_MAJOR: u8 = 1;
const FW_MINOR: u8 = 6;
const IS_MAIN_FIRMWARE: u8 = 1;
const HW_MODEL: u8 = 7;
const HW_SUBMODEL: u8 = 1;
const USB_SPEED: u8 = 1;
const MCU_ID: u8 = 7;
const MCU_MHZ: u16 = 216;
const MCU_SRAM_KB: u16 = 64;
const USB_BUF_KB: u16 = 32;
const SAMPLE_FREQ: u32 = 72_000_000;

/// Calibration gives up after this many outward steps without track 0.
const CALIBRATE_STEPS: u32 = 120;

/// Encoded bytes are held back once this much response data is pending.
const RESP_HIGH_WATER: usize = 4096;

/// Timing parameters in the PARAMS_DELAYS layout, one tick per microsecond.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GwDelays {
    pub select_delay: u16,
    pub step_delay: u16,
    pub seek_settle: u16,
    pub motor_delay: u16,
    pub watchdog: u16,
    pub pre_write: u16,
    pub post_write: u16,
    pub index_mask: u16,
}

impl Default for GwDelays {
    fn default() -> Self {
        Self {
            select_delay: 2000,
            step_delay: 3000,
            seek_settle: 15,
            motor_delay: 750,
            watchdog: 10000,
            pre_write: 140,
            post_write: 140,
            index_mask: 2000,
        }
    }
}

impl GwDelays {
    fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        for (i, v) in [
            self.select_delay,
            self.step_delay,
            self.seek_settle,
            self.motor_delay,
            self.watchdog,
            self.pre_write,
            self.post_write,
            self.index_mask,
        ]
        .into_iter()
        .enumerate()
        {
            out[i * 2..i * 2 + 2].copy_from_slice(&v.to_le_bytes());
        }
        out
    }

    fn from_bytes(data: &[u8]) -> Self {
        let word = |i: usize| u16::from_le_bytes([data[i * 2], data[i * 2 + 1]]);
        Self {
            select_delay: word(0),
            step_delay: word(1),
            seek_settle: word(2),
            motor_delay: word(3),
            watchdog: word(4),
            pre_write: word(5),
            post_write: word(6),
            index_mask: word(7),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GwConfig {
    /// Ticks without an index pulse before a capture aborts with NO_INDEX.
    pub index_timeout: u32,
}

impl Default for GwConfig {
    fn default() -> Self {
        // 500 ms, comfortably over one revolution at 300 rpm.
        Self { index_timeout: 500_000 }
    }
}

/// Packs a value into the 4-byte marker-bit form used by SPACE and INDEX
/// opcodes: 6 bits in the first byte, 7 in each of the rest, LSB set.
pub fn encode_n28(v: u32) -> [u8; 4] {
    [
        (((v & 0x3F) << 1) | 1) as u8,
        ((((v >> 6) & 0x7F) << 1) | 1) as u8,
        ((((v >> 13) & 0x7F) << 1) | 1) as u8,
        ((((v >> 20) & 0x7F) << 1) | 1) as u8,
    ]
}

pub fn decode_n28(b: [u8; 4]) -> u32 {
    ((b[0] as u32 >> 1) & 0x3F)
        | (((b[1] as u32 >> 1) & 0x7F) << 6)
        | (((b[2] as u32 >> 1) & 0x7F) << 13)
        | (((b[3] as u32 >> 1) & 0x7F) << 20)
}

/// Encodes one protocol-rate interval into the 3-tier flux form.
pub fn encode_interval(v: u32, out: &mut VecDeque<u8>) {
    if v == 0 {
        return;
    }
    if v <= FLUX_MAX_DIRECT {
        out.push_back(v as u8);
    } else if v <= FLUX_2BYTE_MAX {
        out.push_back((250 + (v - 250) / 255) as u8);
        out.push_back((1 + (v - 250) % 255) as u8);
    } else {
        out.push_back(0xFF);
        out.push_back(FLUXOP_SPACE);
        for b in encode_n28(v - 249) {
            out.push_back(b);
        }
        out.push_back(FLUX_MAX_DIRECT as u8);
    }
}

/// One event recovered from a flux byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxEvent {
    /// A transition this many protocol ticks after the previous one.
    Flux(u32),
    /// An index pulse this many ticks after the previous transition.
    Index(u32),
    /// Stream terminator.
    End,
}

/// Streaming decoder for the 3-tier flux encoding; also consumed by
/// WRITE_FLUX to take host-supplied flux back in.
#[derive(Debug, Default)]
pub struct FluxDecoder {
    space: u32,
    state: DecodeState,
}

#[derive(Debug, Default)]
enum DecodeState {
    #[default]
    Idle,
    TwoByte(u8),
    Opcode,
    N28 { op: u8, got: u8, bytes: [u8; 4] },
}

impl FluxDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one byte; returns a decoded event once one completes.
    pub fn push(&mut self, byte: u8) -> Option<FluxEvent> {
        match std::mem::take(&mut self.state) {
            DecodeState::Idle => match byte {
                0 => Some(FluxEvent::End),
                1..=249 => {
                    let v = self.space + byte as u32;
                    self.space = 0;
                    Some(FluxEvent::Flux(v))
                }
                250..=254 => {
                    self.state = DecodeState::TwoByte(byte);
                    None
                }
                0xFF => {
                    self.state = DecodeState::Opcode;
                    None
                }
            },
            DecodeState::TwoByte(hi) => {
                let v = 250 + (hi as u32 - 250) * 255 + (byte as u32 - 1);
                let v = self.space + v;
                self.space = 0;
                Some(FluxEvent::Flux(v))
            }
            DecodeState::Opcode => {
                self.state = DecodeState::N28 { op: byte, got: 0, bytes: [0; 4] };
                None
            }
            DecodeState::N28 { op, mut got, mut bytes } => {
                bytes[got as usize] = byte;
                got += 1;
                if got < 4 {
                    self.state = DecodeState::N28 { op, got, bytes };
                    return None;
                }
                let v = decode_n28(bytes);
                match op {
                    FLUXOP_INDEX => Some(FluxEvent::Index(self.space + v)),
                    FLUXOP_SPACE => {
                        self.space += v;
                        None
                    }
                    other => {
                        tracing::warn!(opcode = other, "unknown flux opcode, skipped");
                        None
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
enum GwState {
    /// Collecting the command header and parameters.
    Idle,
    /// Stepping the head; the ack is deferred until movement finishes.
    Seeking(Seek),
    /// Streaming encoded flux to the host.
    ReadFlux(ReadFlux),
    /// Consuming host flux until the terminator.
    WriteFlux(FluxDecoder),
    /// Consuming a SINK_BYTES data phase.
    Sink { remaining: u32 },
    /// Producing a SOURCE_BYTES data phase.
    Source { remaining: u32, pattern: u32 },
}

#[derive(Debug)]
struct Seek {
    /// Outward calibration steps still allowed; None once track 0 is found
    /// or the position was already known.
    calibrating: Option<u32>,
    target: u8,
    /// Steps still to issue towards the target.
    remaining: u32,
    inward: bool,
    wait: u32,
    settling: bool,
}

#[derive(Debug, Default)]
struct ReadFlux {
    /// Remainder carry of the 6/25 rate conversion.
    rate_rem: u32,
    /// Protocol ticks since the last emitted transition.
    pending: u32,
    /// Total protocol ticks consumed so far.
    total: u64,
    tick_limit: u32,
    index_limit: u16,
    index_seen: u16,
    ticks_since_index: u32,
}

impl ReadFlux {
    fn convert(&mut self, capture_ticks: u32) -> u32 {
        let num = capture_ticks as u64 * RATE_NUM + self.rate_rem as u64;
        self.rate_rem = (num % RATE_DEN) as u32;
        (num / RATE_DEN) as u32
    }
}

/// The Greaseweazle command/response and flux streaming engine.
pub struct GreaseweazleCodec {
    cfg: GwConfig,
    state: GwState,
    cmd: Vec<u8>,
    resp: VecDeque<u8>,
    delays: GwDelays,
    bus_type: Option<u8>,
    unit: Option<u8>,
    cylinder: Option<u8>,
    flux_status: u8,
}

impl GreaseweazleCodec {
    pub fn new(cfg: GwConfig) -> Self {
        Self {
            cfg,
            state: GwState::Idle,
            cmd: Vec::new(),
            resp: VecDeque::new(),
            delays: GwDelays::default(),
            bus_type: None,
            unit: None,
            cylinder: None,
            flux_status: ACK_OKAY,
        }
    }

    pub fn cylinder(&self) -> Option<u8> {
        self.cylinder
    }

    fn respond(&mut self, opcode: u8, ack: u8, payload: &[u8]) {
        self.resp.push_back(opcode);
        self.resp.push_back(ack);
        self.resp.extend(payload.iter().copied());
    }

    fn cmd_byte(&mut self, byte: u8, drive: &mut DriveBus) {
        self.cmd.push(byte);
        if self.cmd.len() < 2 {
            return;
        }
        let len = self.cmd[1] as usize;
        if len < 2 || len > 24 {
            let opcode = self.cmd[0];
            tracing::warn!(opcode, len, "malformed command length");
            self.cmd.clear();
            self.respond(opcode, ACK_BAD_COMMAND, &[]);
            return;
        }
        if self.cmd.len() == len {
            let cmd = std::mem::take(&mut self.cmd);
            self.dispatch(&cmd, drive);
        }
    }

    fn dispatch(&mut self, cmd: &[u8], drive: &mut DriveBus) {
        let opcode = cmd[0];
        let params = &cmd[2..];
        tracing::debug!(opcode, len = cmd.len(), "command");
        match opcode {
            CMD_GET_INFO if params.len() == 1 => self.get_info(params[0], drive),
            CMD_SEEK if params.len() == 1 || params.len() == 2 => {
                let target = if params.len() == 1 {
                    params[0] as i8 as i32
                } else {
                    i16::from_le_bytes([params[0], params[1]]) as i32
                };
                self.seek(target, drive)
            }
            CMD_HEAD if params.len() == 1 => {
                if params[0] <= 1 {
                    drive.head = params[0];
                    self.respond(opcode, ACK_OKAY, &[]);
                } else {
                    self.respond(opcode, ACK_BAD_CYLINDER, &[]);
                }
            }
            CMD_SET_PARAMS if params.len() == 17 && params[0] == PARAMS_DELAYS => {
                self.delays = GwDelays::from_bytes(&params[1..]);
                self.respond(opcode, ACK_OKAY, &[]);
            }
            CMD_GET_PARAMS if params.len() == 1 && params[0] == PARAMS_DELAYS => {
                let bytes = self.delays.to_bytes();
                self.respond(opcode, ACK_OKAY, &bytes);
            }
            CMD_MOTOR if params.len() == 2 => self.motor(params[0], params[1], drive),
            CMD_READ_FLUX if params.len() == 6 || params.len() == 10 => {
                self.read_flux(params, drive)
            }
            CMD_WRITE_FLUX if params.len() == 2 || params.len() == 6 => {
                if self.unit.is_none() {
                    self.respond(opcode, ACK_NO_UNIT, &[]);
                } else if drive.write_protect {
                    self.respond(opcode, ACK_WRPROT, &[]);
                } else {
                    self.respond(opcode, ACK_OKAY, &[]);
                    self.state = GwState::WriteFlux(FluxDecoder::new());
                }
            }
            CMD_GET_FLUX_STATUS if params.is_empty() => {
                let status = self.flux_status;
                self.respond(opcode, status, &[]);
            }
            CMD_SELECT if params.len() == 1 => self.select(params[0], drive),
            CMD_DESELECT if params.is_empty() => {
                self.unit = None;
                drive.selected = None;
                self.respond(opcode, ACK_OKAY, &[]);
            }
            CMD_SET_BUS_TYPE if params.len() == 1 => {
                if params[0] <= 3 {
                    self.bus_type = if params[0] == 0 { None } else { Some(params[0]) };
                    self.respond(opcode, ACK_OKAY, &[]);
                } else {
                    self.respond(opcode, ACK_BAD_COMMAND, &[]);
                }
            }
            CMD_SET_PIN if params.len() == 2 => {
                // Only the density-select output is writable.
                if params[0] == 2 {
                    self.respond(opcode, ACK_OKAY, &[]);
                } else {
                    self.respond(opcode, ACK_BAD_PIN, &[]);
                }
            }
            CMD_GET_PIN if params.len() == 1 => {
                let level = match params[0] {
                    26 => Some(drive.track0),
                    28 => Some(drive.write_protect),
                    34 => Some(drive.disk_present),
                    _ => None,
                };
                match level {
                    Some(level) => self.respond(opcode, ACK_OKAY, &[level as u8]),
                    None => self.respond(opcode, ACK_BAD_PIN, &[]),
                }
            }
            CMD_RESET if params.is_empty() => {
                self.delays = GwDelays::default();
                self.bus_type = None;
                self.unit = None;
                self.flux_status = ACK_OKAY;
                drive.release_outputs();
                self.respond(opcode, ACK_OKAY, &[]);
            }
            CMD_ERASE_FLUX if params.len() == 4 => {
                if self.unit.is_none() {
                    self.respond(opcode, ACK_NO_UNIT, &[]);
                } else if drive.write_protect {
                    self.respond(opcode, ACK_WRPROT, &[]);
                } else {
                    self.flux_status = ACK_OKAY;
                    self.respond(opcode, ACK_OKAY, &[]);
                }
            }
            CMD_SOURCE_BYTES if params.len() == 8 => {
                let count = u32::from_le_bytes(params[..4].try_into().unwrap());
                let seed = u32::from_le_bytes(params[4..].try_into().unwrap());
                self.respond(opcode, ACK_OKAY, &[]);
                self.state = GwState::Source { remaining: count, pattern: seed.max(1) };
            }
            CMD_SINK_BYTES if params.len() == 8 => {
                let count = u32::from_le_bytes(params[..4].try_into().unwrap());
                self.respond(opcode, ACK_OKAY, &[]);
                if count > 0 {
                    self.state = GwState::Sink { remaining: count };
                }
            }
            CMD_NOCLICK_STEP if params.is_empty() => {
                if !drive.track0 {
                    drive.step_assert(true);
                    drive.step_release();
                    if let Some(c) = self.cylinder {
                        self.cylinder = Some(c.saturating_sub(1));
                    }
                }
                self.respond(opcode, ACK_OKAY, &[]);
            }
            _ => self.respond(opcode, ACK_BAD_COMMAND, &[]),
        }
    }

    fn get_info(&mut self, index: u8, drive: &DriveBus) {
        let mut record = [0u8; 32];
        match index {
            GETINFO_FIRMWARE => {
                record[0] = FW_MAJOR;
                record[1] = FW_MINOR;
                record[2] = IS_MAIN_FIRMWARE;
                record[3] = CMD_MAX;
                record[4..8].copy_from_slice(&SAMPLE_FREQ.to_le_bytes());
                record[8] = HW_MODEL;
                record[9] = HW_SUBMODEL;
                record[10] = USB_SPEED;
                record[11] = MCU_ID;
                record[12..14].copy_from_slice(&MCU_MHZ.to_le_bytes());
                record[14..16].copy_from_slice(&MCU_SRAM_KB.to_le_bytes());
                record[16..18].copy_from_slice(&USB_BUF_KB.to_le_bytes());
                self.respond(CMD_GET_INFO, ACK_OKAY, &record);
            }
            GETINFO_CURRENT_DRIVE => {
                record[0] = self.cylinder.is_some() as u8
                    | (self.unit.is_some() as u8) << 1
                    | (drive.motor_on as u8) << 2;
                record[1] = self.cylinder.unwrap_or(0);
                self.respond(CMD_GET_INFO, ACK_OKAY, &record);
            }
            _ => self.respond(CMD_GET_INFO, ACK_BAD_COMMAND, &record),
        }
    }

    fn select(&mut self, unit: u8, drive: &mut DriveBus) {
        if self.bus_type.is_none() {
            self.respond(CMD_SELECT, ACK_NO_BUS, &[]);
        } else if unit > 1 {
            self.respond(CMD_SELECT, ACK_BAD_UNIT, &[]);
        } else {
            self.unit = Some(unit);
            drive.selected = Some(unit);
            self.respond(CMD_SELECT, ACK_OKAY, &[]);
        }
    }

    fn motor(&mut self, unit: u8, on: u8, drive: &mut DriveBus) {
        if self.bus_type.is_none() {
            self.respond(CMD_MOTOR, ACK_NO_BUS, &[]);
        } else if unit > 1 {
            self.respond(CMD_MOTOR, ACK_BAD_UNIT, &[]);
        } else if on > 1 {
            self.respond(CMD_MOTOR, ACK_BAD_COMMAND, &[]);
        } else {
            if self.unit == Some(unit) {
                drive.motor_on = on == 1;
            }
            self.respond(CMD_MOTOR, ACK_OKAY, &[]);
        }
    }

    fn seek(&mut self, target: i32, _drive: &mut DriveBus) {
        if self.unit.is_none() {
            self.respond(CMD_SEEK, ACK_NO_UNIT, &[]);
            return;
        }
        if !(0..=100).contains(&target) {
            self.respond(CMD_SEEK, ACK_BAD_CYLINDER, &[]);
            return;
        }
        let target = target as u8;
        let seek = match self.cylinder {
            Some(cur) => {
                let (remaining, inward) =
                    if target >= cur { ((target - cur) as u32, true) } else { ((cur - target) as u32, false) };
                Seek { calibrating: None, target, remaining, inward, wait: 0, settling: false }
            }
            // Unknown position: calibrate outward to track 0 first.
            None => Seek {
                calibrating: Some(CALIBRATE_STEPS),
                target,
                remaining: 0,
                inward: true,
                wait: 0,
                settling: false,
            },
        };
        self.state = GwState::Seeking(seek);
    }

    fn read_flux(&mut self, params: &[u8], _drive: &mut DriveBus) {
        if self.unit.is_none() {
            self.respond(CMD_READ_FLUX, ACK_NO_UNIT, &[]);
            return;
        }
        let tick_limit = u32::from_le_bytes(params[..4].try_into().unwrap());
        let index_limit = u16::from_le_bytes(params[4..6].try_into().unwrap());
        self.flux_status = ACK_OKAY;
        self.respond(CMD_READ_FLUX, ACK_OKAY, &[]);
        self.state = GwState::ReadFlux(ReadFlux {
            tick_limit,
            index_limit,
            ..ReadFlux::default()
        });
    }

    /// Ends the flux stream with the given status and the 0x00 terminator.
    fn finish_stream(&mut self, status: u8) {
        self.flux_status = status;
        self.resp.push_back(0x00);
        self.state = GwState::Idle;
    }

    fn write_flux_byte(&mut self, byte: u8) {
        // The payload is decoded for validation; the write channel towards
        // the drive head is outside this engine.
        let GwState::WriteFlux(dec) = &mut self.state else {
            return;
        };
        if let Some(FluxEvent::End) = dec.push(byte) {
            self.flux_status = ACK_OKAY;
            self.state = GwState::Idle;
        }
    }
}

impl Codec for GreaseweazleCodec {
    fn can_accept(&self) -> bool {
        match self.state {
            // Strict request/response pairing: the next command waits until
            // the previous response has fully left.
            GwState::Idle => self.resp.is_empty(),
            GwState::ReadFlux(_) | GwState::WriteFlux(_) | GwState::Sink { .. } => {
                self.resp.len() < RESP_HIGH_WATER
            }
            _ => false,
        }
    }

    fn accept(&mut self, byte: u8, drive: &mut DriveBus) {
        match &mut self.state {
            GwState::Idle => self.cmd_byte(byte, drive),
            GwState::ReadFlux(_) => {
                // Any host traffic aborts the capture. Partial encodings are
                // discarded, not flushed; the byte starts the next command.
                self.resp.clear();
                self.state = GwState::Idle;
                self.cmd_byte(byte, drive);
            }
            GwState::WriteFlux(_) => self.write_flux_byte(byte),
            GwState::Sink { remaining } => {
                *remaining -= 1;
                if *remaining == 0 {
                    self.state = GwState::Idle;
                }
            }
            _ => tracing::warn!("byte while busy, dropped"),
        }
    }

    fn poll_tx(&mut self) -> Option<TxUnit> {
        if let Some(b) = self.resp.pop_front() {
            return Some(TxUnit::Byte(b));
        }
        match &mut self.state {
            GwState::Source { remaining, pattern } => {
                if *remaining == 0 {
                    self.state = GwState::Idle;
                    return None;
                }
                *remaining -= 1;
                // xorshift32 pattern, seeded by the host.
                *pattern ^= *pattern << 13;
                *pattern ^= *pattern >> 17;
                *pattern ^= *pattern << 5;
                let byte = *pattern as u8;
                if *remaining == 0 {
                    self.state = GwState::Idle;
                }
                Some(TxUnit::Byte(byte))
            }
            _ => None,
        }
    }

    fn offer_flux(&mut self, sample: FluxSample, _drive: &mut DriveBus) -> bool {
        let GwState::ReadFlux(_) = &self.state else {
            // Not capturing: the sample is consumed and discarded.
            return true;
        };
        if self.resp.len() >= RESP_HIGH_WATER {
            return false;
        }
        let GwState::ReadFlux(rf) = &mut self.state else { unreachable!() };
        let v = rf.convert(sample.timestamp());
        rf.total += v as u64;
        if sample.is_index() {
            rf.index_seen += 1;
            rf.ticks_since_index = 0;
            let at = rf.pending + v;
            rf.pending = at;
            let index_seen = rf.index_seen;
            let index_limit = rf.index_limit;
            self.resp.push_back(0xFF);
            self.resp.push_back(FLUXOP_INDEX);
            for b in encode_n28(at) {
                self.resp.push_back(b);
            }
            if index_limit != 0 && index_seen >= index_limit {
                self.finish_stream(ACK_OKAY);
            }
            return true;
        }
        let interval = rf.pending + v;
        rf.pending = 0;
        let done = rf.tick_limit != 0 && rf.total >= rf.tick_limit as u64;
        let mut bytes = VecDeque::new();
        encode_interval(interval, &mut bytes);
        self.resp.extend(bytes);
        if done {
            self.finish_stream(ACK_OKAY);
        }
        true
    }

    fn step(&mut self, drive: &mut DriveBus) {
        match &mut self.state {
            GwState::Seeking(seek) => {
                if seek.wait > 0 {
                    seek.wait -= 1;
                    drive.step_release();
                    return;
                }
                if seek.settling {
                    let target = seek.target;
                    self.cylinder = Some(target);
                    self.state = GwState::Idle;
                    self.respond(CMD_SEEK, ACK_OKAY, &[]);
                    return;
                }
                if let Some(budget) = &mut seek.calibrating {
                    if drive.track0 {
                        seek.calibrating = None;
                        seek.remaining = seek.target as u32;
                        seek.inward = true;
                        return;
                    }
                    if *budget == 0 {
                        self.state = GwState::Idle;
                        self.respond(CMD_SEEK, ACK_NO_TRK0, &[]);
                        return;
                    }
                    *budget -= 1;
                    drive.step_assert(true);
                    seek.wait = self.delays.step_delay as u32;
                    return;
                }
                if seek.remaining == 0 {
                    seek.settling = true;
                    seek.wait = self.delays.seek_settle as u32 * 1000;
                    return;
                }
                seek.remaining -= 1;
                let inward = seek.inward;
                drive.step_assert(!inward);
                seek.wait = self.delays.step_delay as u32;
            }
            GwState::ReadFlux(rf) => {
                if rf.index_limit != 0 {
                    rf.ticks_since_index += 1;
                    if rf.ticks_since_index > self.cfg.index_timeout {
                        tracing::warn!("index wait timed out");
                        self.finish_stream(ACK_NO_INDEX);
                    }
                }
            }
            _ => (),
        }
    }

    fn busy(&self) -> bool {
        !matches!(self.state, GwState::Idle) || !self.resp.is_empty() || !self.cmd.is_empty()
    }

    fn reset(&mut self) {
        self.state = GwState::Idle;
        self.cmd.clear();
        self.resp.clear();
        self.delays = GwDelays::default();
        self.bus_type = None;
        self.unit = None;
        self.flux_status = ACK_OKAY;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn decode_all(bytes: impl IntoIterator<Item = u8>) -> Vec<FluxEvent> {
        let mut dec = FluxDecoder::new();
        bytes.into_iter().filter_map(|b| dec.push(b)).collect()
    }

    fn encode_one(v: u32) -> Vec<u8> {
        let mut out = VecDeque::new();
        encode_interval(v, &mut out);
        out.into()
    }

    #[test]
    fn boundary_encodings() {
        assert_eq!(encode_one(249), vec![0xF9]);
        assert_eq!(encode_one(250), vec![250, 1]);
        assert_eq!(encode_one(1524).len(), 2);
        let seven = encode_one(1525);
        assert_eq!(seven.len(), 7);
        assert_eq!(&seven[..2], &[0xFF, 0x02]);
        assert_eq!(seven[6], 249);
    }

    #[test]
    fn round_trip_full_range() {
        let samples = (1u32..=1600)
            .chain((1601..=0xFF_FFFF).step_by(997))
            .chain([0xFF_FFFF]);
        for v in samples {
            let events = decode_all(encode_one(v));
            assert_eq!(events, vec![FluxEvent::Flux(v)], "value {v}");
        }
    }

    #[test]
    fn n28_round_trip() {
        for v in [0u32, 1, 63, 64, 0x1FFF, 0x2000, 0x0FFF_FFFF & 0x07FF_FFFF] {
            assert_eq!(decode_n28(encode_n28(v)), v & 0x07FF_FFFF);
        }
    }

    fn run_command(codec: &mut GreaseweazleCodec, drive: &mut DriveBus, cmd: &[u8]) -> Vec<u8> {
        for &b in cmd {
            codec.accept(b, drive);
        }
        for _ in 0..10_000_000 {
            if !codec.resp.is_empty() || !codec.busy() {
                break;
            }
            codec.step(drive);
        }
        let mut out = Vec::new();
        while let Some(unit) = codec.poll_tx() {
            if let TxUnit::Byte(b) = unit {
                out.push(b);
            }
        }
        out
    }

    #[test]
    fn get_info_identity_record() {
        let mut codec = GreaseweazleCodec::new(GwConfig::default());
        let mut drive = DriveBus::new();
        let resp = run_command(&mut codec, &mut drive, &[CMD_GET_INFO, 3, 0]);
        assert_eq!(resp.len(), 2 + 32);
        assert_eq!(resp[0], CMD_GET_INFO);
        assert_eq!(resp[1], ACK_OKAY);
        assert_eq!(&resp[2..6], &[1, 6, 1, 22]);
        assert_eq!(&resp[6..10], &72_000_000u32.to_le_bytes());
    }

    #[test]
    fn select_requires_bus_type() {
        let mut codec = GreaseweazleCodec::new(GwConfig::default());
        let mut drive = DriveBus::new();
        let resp = run_command(&mut codec, &mut drive, &[CMD_SELECT, 3, 0]);
        assert_eq!(resp, vec![CMD_SELECT, ACK_NO_BUS]);
        let resp = run_command(&mut codec, &mut drive, &[CMD_SET_BUS_TYPE, 3, 1]);
        assert_eq!(resp, vec![CMD_SET_BUS_TYPE, ACK_OKAY]);
        let resp = run_command(&mut codec, &mut drive, &[CMD_SELECT, 3, 0]);
        assert_eq!(resp, vec![CMD_SELECT, ACK_OKAY]);
        assert_eq!(drive.selected, Some(0));
    }

    #[test]
    fn unknown_opcode_rejected() {
        let mut codec = GreaseweazleCodec::new(GwConfig::default());
        let mut drive = DriveBus::new();
        let resp = run_command(&mut codec, &mut drive, &[0x42, 2]);
        assert_eq!(resp, vec![0x42, ACK_BAD_COMMAND]);
    }

    #[test]
    fn every_command_gets_exactly_one_response() {
        let mut codec = GreaseweazleCodec::new(GwConfig::default());
        let mut drive = DriveBus::new();
        let cmds: &[&[u8]] = &[
            &[CMD_GET_INFO, 3, 0],
            &[CMD_SET_BUS_TYPE, 3, 1],
            &[CMD_SELECT, 3, 0],
            &[CMD_MOTOR, 4, 0, 1],
            &[CMD_GET_FLUX_STATUS, 2],
            &[CMD_DESELECT, 2],
        ];
        for cmd in cmds {
            let resp = run_command(&mut codec, &mut drive, cmd);
            assert!(resp.len() >= 2, "short response for {:#04x}", cmd[0]);
            assert_eq!(resp[0], cmd[0], "opcode echo for {:#04x}", cmd[0]);
        }
    }
}
