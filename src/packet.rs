//! USB packet engine.
//!
//! Turns the link-layer byte stream into validated token events, received
//! payloads and control-transfer phases, and produces the handshake and
//! transmit bytes going the other way. The engine is a synchronous state
//! machine: one [`LinkEvent`] in, zero or more transmit bytes queued for the
//! link to pull under its own ready/valid pacing.
//!
//! Framing rules (USB 2.0): a token is accepted only when its CRC5 matches
//! and it addresses this device; a data packet is accepted only when its
//! CRC16 matches. A corrupt data packet gets no handshake at all — the host
//! retries on its own clock. Exactly one handshake is emitted per accepted
//! transaction.

use bytes::BytesMut;
use std::collections::VecDeque;

use crate::crc::{self, Crc16};
use crate::MAX_PACKET_SIZE;

/// Largest data stage chunk on the default control endpoint.
const MAX_CONTROL_PACKET: usize = 64;

/// USB packet identifiers, 4 bits plus complement check nibble on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Pid {
    Out = 0b0001,
    In = 0b1001,
    Sof = 0b0101,
    Setup = 0b1101,
    Data0 = 0b0011,
    Data1 = 0b1011,
    Ack = 0b0010,
    Nak = 0b1010,
    Stall = 0b1110,
}

impl Pid {
    /// Decodes a PID byte, rejecting it when the check nibble is wrong.
    pub fn from_byte(byte: u8) -> Option<Pid> {
        if byte & 0x0F != !(byte >> 4) & 0x0F {
            return None;
        }
        match byte & 0x0F {
            0b0001 => Some(Pid::Out),
            0b1001 => Some(Pid::In),
            0b0101 => Some(Pid::Sof),
            0b1101 => Some(Pid::Setup),
            0b0011 => Some(Pid::Data0),
            0b1011 => Some(Pid::Data1),
            0b0010 => Some(Pid::Ack),
            0b1010 => Some(Pid::Nak),
            0b1110 => Some(Pid::Stall),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        let pid = self as u8;
        pid | (!pid << 4)
    }

    fn is_token(self) -> bool {
        matches!(self, Pid::Out | Pid::In | Pid::Sof | Pid::Setup)
    }

    fn is_data(self) -> bool {
        matches!(self, Pid::Data0 | Pid::Data1)
    }
}

/// Event delivered by the link-layer byte pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// One received byte; the first byte of every packet is the PID.
    Byte(u8),
    /// End-of-packet boundary.
    Eop,
    /// Bus reset from the line state.
    Reset,
}

/// One transmit byte with the link's last-byte marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxByte {
    pub byte: u8,
    pub last: bool,
}

/// Handshake to answer a transaction with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Ack,
    Nak,
    Stall,
}

impl Handshake {
    fn pid(self) -> Pid {
        match self {
            Handshake::Ack => Pid::Ack,
            Handshake::Nak => Pid::Nak,
            Handshake::Stall => Pid::Stall,
        }
    }
}

/// A received packet after validation, as handed up for dispatch.
#[derive(Debug)]
pub struct UsbPacket {
    pub pid: Pid,
    pub address: u8,
    pub endpoint: u8,
    pub payload: BytesMut,
    pub crc_ok: bool,
}

/// Control transfer phases, strictly ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPhase {
    Setup,
    DataOut,
    DataIn,
    StatusIn,
    StatusOut,
}

/// One live control transaction, created on SETUP and destroyed when the
/// status phase completes.
#[derive(Debug, Clone)]
pub struct ControlTransfer {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
    pub phase: ControlPhase,
}

impl ControlTransfer {
    /// Parses the 8-byte SETUP payload.
    pub fn parse(data: &[u8]) -> ControlTransfer {
        ControlTransfer {
            request_type: data[0],
            request: data[1],
            value: u16::from_le_bytes([data[2], data[3]]),
            index: u16::from_le_bytes([data[4], data[5]]),
            length: u16::from_le_bytes([data[6], data[7]]),
            phase: ControlPhase::Setup,
        }
    }

    pub fn direction_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

/// Reply to a host-to-device control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlReply {
    Ack,
    Stall,
}

/// Reply to a device-to-host control request.
#[derive(Debug)]
pub enum ControlInReply {
    Data(BytesMut),
    Stall,
}

/// Reply to an IN token on a non-control endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InReply {
    /// `n` bytes were written into the offered buffer.
    Data(usize),
    Nak,
    Stall,
}

/// Seam towards the endpoint consumers (the personality router).
pub trait Endpoints {
    /// Host-to-device control request; `data` is the complete data stage.
    fn control_out(&mut self, xfer: &ControlTransfer, data: &[u8]) -> ControlReply;

    /// Device-to-host control request; produce the response data.
    fn control_in(&mut self, xfer: &ControlTransfer) -> ControlInReply;

    /// Validated OUT payload for a non-control endpoint.
    fn out(&mut self, endpoint: u8, data: &[u8]) -> Handshake;

    /// IN token for a non-control endpoint; fill `buf` with response bytes.
    fn in_data(&mut self, endpoint: u8, buf: &mut [u8]) -> InReply;

    /// Whether the endpoint is halted; halted endpoints answer STALL.
    fn halted(&self, _endpoint: u8) -> bool {
        false
    }
}

#[derive(Debug)]
enum State {
    Idle,
    /// Collecting the two token bytes after a token PID.
    Token { pid: Pid, lo: Option<u8>, hi: Option<u8> },
    /// Token accepted; expecting the DATA packet of a SETUP or OUT.
    AwaitData { endpoint: u8, setup: bool },
    /// Buffering a DATA packet's payload and trailing CRC.
    RxData { endpoint: u8, setup: bool },
    /// IN data queued; expecting the host handshake.
    WaitHandshake,
    WaitHandshakeEop,
    /// Ignore everything until the next EOP.
    Drop,
}

struct ControlState {
    xfer: ControlTransfer,
    /// OUT data accumulated, or the prepared IN response.
    data: BytesMut,
    sent: usize,
    stalled: bool,
    reply: ControlReply,
}

/// The packet engine proper.
pub struct PacketEngine {
    state: State,
    address: u8,
    pending_address: Option<u8>,
    frame_number: u16,
    rx: BytesMut,
    control: Option<ControlState>,
    ep0_toggle: bool,
    in_toggle: [bool; 16],
    tx: VecDeque<TxByte>,
}

impl Default for PacketEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketEngine {
    pub fn new() -> PacketEngine {
        PacketEngine {
            state: State::Idle,
            address: 0,
            pending_address: None,
            frame_number: 0,
            rx: BytesMut::with_capacity(MAX_PACKET_SIZE + 2),
            control: None,
            ep0_toggle: false,
            in_toggle: [false; 16],
            tx: VecDeque::new(),
        }
    }

    /// Currently configured device address; tokens to other addresses are
    /// ignored. Zero until enumeration assigns one.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Frame number of the last start-of-frame token.
    pub fn frame_number(&self) -> u16 {
        self.frame_number
    }

    /// Pulls the next transmit byte when the link is ready for it.
    pub fn poll_tx(&mut self) -> Option<TxByte> {
        self.tx.pop_front()
    }

    pub fn tx_pending(&self) -> bool {
        !self.tx.is_empty()
    }

    /// Advances the state machine by one link event.
    pub fn handle(&mut self, event: LinkEvent, eps: &mut dyn Endpoints) {
        match event {
            LinkEvent::Byte(byte) => self.on_byte(byte),
            LinkEvent::Eop => self.on_eop(eps),
            LinkEvent::Reset => self.reset(),
        }
    }

    /// Bus reset: back to the unaddressed idle state.
    pub fn reset(&mut self) {
        tracing::debug!("bus reset");
        self.state = State::Idle;
        self.address = 0;
        self.pending_address = None;
        self.frame_number = 0;
        self.rx.clear();
        self.control = None;
        self.ep0_toggle = false;
        self.in_toggle = [false; 16];
        self.tx.clear();
    }

    fn on_byte(&mut self, byte: u8) {
        match &mut self.state {
            State::Idle => self.idle_byte(byte),
            State::Token { lo, hi, .. } => {
                if lo.is_none() {
                    *lo = Some(byte);
                } else if hi.is_none() {
                    *hi = Some(byte);
                } else {
                    // Token longer than three bytes; not a token after all.
                    self.state = State::Drop;
                }
            }
            State::AwaitData { endpoint, setup } => match Pid::from_byte(byte) {
                Some(pid) if pid.is_data() => {
                    let (endpoint, setup) = (*endpoint, *setup);
                    self.rx.clear();
                    self.state = State::RxData { endpoint, setup };
                }
                Some(pid) if pid.is_token() => {
                    // The host gave up on the data stage; a fresh token
                    // supersedes the pending transaction.
                    self.state = State::Token { pid, lo: None, hi: None };
                }
                _ => self.state = State::Drop,
            },
            State::RxData { .. } => {
                if self.rx.len() > MAX_PACKET_SIZE + 2 {
                    tracing::warn!("oversized data packet dropped");
                    self.state = State::Drop;
                } else {
                    self.rx.extend_from_slice(&[byte]);
                }
            }
            State::WaitHandshake => match Pid::from_byte(byte) {
                Some(Pid::Ack) => self.state = State::WaitHandshakeEop,
                Some(pid) if pid.is_token() => {
                    self.state = State::Token { pid, lo: None, hi: None };
                }
                _ => self.state = State::Drop,
            },
            State::WaitHandshakeEop => self.state = State::Drop,
            State::Drop => (),
        }
    }

    fn idle_byte(&mut self, byte: u8) {
        match Pid::from_byte(byte) {
            Some(pid) if pid.is_token() => {
                self.state = State::Token { pid, lo: None, hi: None };
            }
            Some(_) => {
                // Stray data or handshake PID outside a transaction.
                self.state = State::Drop;
            }
            None => {
                tracing::trace!(byte, "bad PID byte");
                self.state = State::Drop;
            }
        }
    }

    fn on_eop(&mut self, eps: &mut dyn Endpoints) {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Token { pid, lo: Some(lo), hi: Some(hi) } => {
                self.token_done(pid, u16::from_le_bytes([lo, hi]), eps)
            }
            State::RxData { endpoint, setup } => self.data_done(endpoint, setup, eps),
            // Runt token, missing handshake or deliberate drop: silence.
            _ => (),
        }
    }

    fn token_done(&mut self, pid: Pid, word: u16, eps: &mut dyn Endpoints) {
        if !crc::token_valid(word) {
            tracing::trace!(?pid, word, "token CRC mismatch");
            return;
        }
        if pid == Pid::Sof {
            // Frame number occupies the full 11-bit field.
            self.frame_number = word & 0x07FF;
            return;
        }
        if crc::token_address(word) != self.address {
            return;
        }
        let endpoint = crc::token_endpoint(word);
        match pid {
            Pid::Setup => self.state = State::AwaitData { endpoint, setup: true },
            Pid::Out => self.state = State::AwaitData { endpoint, setup: false },
            Pid::In => self.in_token(endpoint, eps),
            _ => unreachable!(),
        }
    }

    fn data_done(&mut self, endpoint: u8, setup: bool, eps: &mut dyn Endpoints) {
        if self.rx.len() < 2 {
            return;
        }
        let crc_pos = self.rx.len() - 2;
        let received = u16::from_le_bytes([self.rx[crc_pos], self.rx[crc_pos + 1]]);
        let mut crc = Crc16::new();
        for &b in &self.rx[..crc_pos] {
            crc.update(b);
        }
        let crc_ok = crc.finish() == received;
        let payload = self.rx.split_to(crc_pos);
        self.rx.clear();

        let packet = UsbPacket {
            pid: if setup { Pid::Setup } else { Pid::Out },
            address: self.address,
            endpoint,
            payload,
            crc_ok,
        };
        if !packet.crc_ok {
            // No handshake at all; the host retries.
            tracing::trace!(endpoint, "data CRC mismatch, dropped");
            return;
        }

        if setup {
            self.setup_done(packet, eps);
        } else if endpoint == 0 {
            let handshake = self.control_out_data(&packet.payload, eps);
            self.tx_handshake(handshake);
        } else if eps.halted(endpoint) {
            self.tx_handshake(Handshake::Stall);
        } else {
            let handshake = eps.out(endpoint, &packet.payload);
            self.tx_handshake(handshake);
        }
    }

    fn setup_done(&mut self, packet: UsbPacket, eps: &mut dyn Endpoints) {
        if packet.endpoint != 0 || packet.payload.len() != 8 {
            self.tx_handshake(Handshake::Stall);
            return;
        }
        let mut xfer = ControlTransfer::parse(&packet.payload);
        tracing::debug!(
            request_type = xfer.request_type,
            request = xfer.request,
            value = xfer.value,
            length = xfer.length,
            "control transfer"
        );
        // A new SETUP unconditionally supersedes any unfinished transfer and
        // restarts the data-phase toggle at DATA1.
        self.control = None;
        self.ep0_toggle = true;

        let state = if xfer.request_type == 0x00 && xfer.request == 0x05 {
            // SET_ADDRESS: latch now, apply after the status stage.
            self.pending_address = Some((xfer.value & 0x7F) as u8);
            xfer.phase = ControlPhase::StatusIn;
            ControlState { xfer, data: BytesMut::new(), sent: 0, stalled: false, reply: ControlReply::Ack }
        } else if xfer.length > 0 && xfer.direction_in() {
            xfer.phase = ControlPhase::DataIn;
            match eps.control_in(&xfer) {
                ControlInReply::Data(mut data) => {
                    data.truncate(xfer.length as usize);
                    ControlState { xfer, data, sent: 0, stalled: false, reply: ControlReply::Ack }
                }
                ControlInReply::Stall => {
                    ControlState { xfer, data: BytesMut::new(), sent: 0, stalled: true, reply: ControlReply::Ack }
                }
            }
        } else if xfer.length > 0 {
            xfer.phase = ControlPhase::DataOut;
            ControlState { xfer, data: BytesMut::new(), sent: 0, stalled: false, reply: ControlReply::Ack }
        } else {
            let reply = eps.control_out(&xfer, &[]);
            xfer.phase = ControlPhase::StatusIn;
            ControlState { xfer, data: BytesMut::new(), sent: 0, stalled: false, reply }
        };
        self.control = Some(state);
        self.tx_handshake(Handshake::Ack);
    }

    fn control_out_data(&mut self, payload: &[u8], eps: &mut dyn Endpoints) -> Handshake {
        let Some(cs) = &mut self.control else {
            return Handshake::Stall;
        };
        match cs.xfer.phase {
            ControlPhase::DataOut => {
                cs.data.extend_from_slice(payload);
                if cs.data.len() >= cs.xfer.length as usize {
                    cs.reply = eps.control_out(&cs.xfer, &cs.data);
                    cs.xfer.phase = ControlPhase::StatusIn;
                }
                Handshake::Ack
            }
            ControlPhase::StatusOut => {
                // Zero-length status packet completes an IN transfer.
                self.control = None;
                Handshake::Ack
            }
            _ => Handshake::Stall,
        }
    }

    fn in_token(&mut self, endpoint: u8, eps: &mut dyn Endpoints) {
        if eps.halted(endpoint) {
            self.tx_handshake(Handshake::Stall);
            return;
        }
        if endpoint == 0 {
            self.control_in_token();
            return;
        }
        let mut buf = [0u8; MAX_PACKET_SIZE];
        match eps.in_data(endpoint, &mut buf) {
            InReply::Data(n) => {
                let pid = if self.in_toggle[endpoint as usize & 0x0F] { Pid::Data1 } else { Pid::Data0 };
                self.in_toggle[endpoint as usize & 0x0F] ^= true;
                self.tx_data(pid, &buf[..n]);
                self.state = State::WaitHandshake;
            }
            InReply::Nak => self.tx_handshake(Handshake::Nak),
            InReply::Stall => self.tx_handshake(Handshake::Stall),
        }
    }

    fn control_in_token(&mut self) {
        let Some(cs) = &mut self.control else {
            self.tx_handshake(Handshake::Stall);
            return;
        };
        match cs.xfer.phase {
            ControlPhase::DataIn => {
                if cs.stalled {
                    self.control = None;
                    self.tx_handshake(Handshake::Stall);
                    return;
                }
                let n = (cs.data.len() - cs.sent).min(MAX_CONTROL_PACKET);
                let chunk = cs.data[cs.sent..cs.sent + n].to_vec();
                cs.sent += n;
                if cs.sent >= cs.data.len() {
                    cs.xfer.phase = ControlPhase::StatusOut;
                }
                let pid = if self.ep0_toggle { Pid::Data1 } else { Pid::Data0 };
                self.ep0_toggle ^= true;
                self.tx_data(pid, &chunk);
                self.state = State::WaitHandshake;
            }
            ControlPhase::StatusIn => {
                if cs.reply == ControlReply::Stall {
                    self.control = None;
                    self.tx_handshake(Handshake::Stall);
                    return;
                }
                self.control = None;
                if let Some(addr) = self.pending_address.take() {
                    tracing::debug!(addr, "device address assigned");
                    self.address = addr;
                }
                self.tx_data(Pid::Data1, &[]);
                self.state = State::WaitHandshake;
            }
            _ => {
                self.control = None;
                self.tx_handshake(Handshake::Stall);
            }
        }
    }

    fn tx_handshake(&mut self, handshake: Handshake) {
        self.tx.push_back(TxByte { byte: handshake.pid().to_byte(), last: true });
    }

    fn tx_data(&mut self, pid: Pid, payload: &[u8]) {
        self.tx.push_back(TxByte { byte: pid.to_byte(), last: false });
        let mut crc = Crc16::new();
        for &b in payload {
            self.tx.push_back(TxByte { byte: b, last: false });
            crc.update(b);
        }
        let [lo, hi] = crc.finish().to_le_bytes();
        self.tx.push_back(TxByte { byte: lo, last: false });
        self.tx.push_back(TxByte { byte: hi, last: true });
    }
}
