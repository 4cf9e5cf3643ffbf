//! USB Mass-Storage Bulk-Only Transport personality.
//!
//! Decodes Command Block Wrappers, hands the embedded SCSI command block to
//! the external SCSI engine, streams the data phase through a sector-sized
//! buffer and answers every CBW with exactly one Command Status Wrapper —
//! validation failures produce a Phase-Error CSW with full residue instead
//! of a silent drop.

use std::collections::VecDeque;

use crate::drive::{DriveBus, FluxSample};
use crate::packet::{ControlInReply, ControlReply, ControlTransfer};
use crate::router::{Codec, TxUnit};
use crate::{CBW_SIGNATURE, CSW_SIGNATURE};

/// Class-specific requests on the control endpoint.
const REQ_GET_MAX_LUN: u8 = 0xFE;
const REQ_BULK_ONLY_RESET: u8 = 0xFF;

pub const CSW_PASS: u8 = 0x00;
pub const CSW_FAIL: u8 = 0x01;
pub const CSW_PHASE_ERROR: u8 = 0x02;

const CBW_LEN: usize = 31;
const SECTOR_SIZE: usize = 512;
const RESP_HIGH_WATER: usize = 8192;

/// Direction and length the SCSI engine declares for a command.
#[derive(Debug, Clone, Copy)]
pub struct ScsiResponse {
    /// Bytes the command wants to move; zero for non-data commands.
    pub data_len: u32,
    /// Device-to-host when true.
    pub data_in: bool,
}

/// External SCSI command engine behind the transport.
pub trait ScsiEngine {
    /// Starts a command; declares the data phase.
    fn start(&mut self, lun: u8, cdb: &[u8]) -> ScsiResponse;

    /// Produces device-to-host data; returns bytes written into `buf`.
    fn data_in(&mut self, buf: &mut [u8]) -> usize;

    /// Consumes host-to-device data.
    fn data_out(&mut self, data: &[u8]);

    /// Final command status: 0 pass, 1 fail.
    fn status(&mut self) -> u8;
}

/// A decoded Command Block Wrapper.
#[derive(Debug, Clone)]
pub struct Cbw {
    pub signature: u32,
    pub tag: u32,
    pub data_transfer_length: u32,
    pub flags: u8,
    pub lun: u8,
    pub cb_length: u8,
    pub cdb: [u8; 16],
}

impl Cbw {
    pub fn parse(buf: &[u8]) -> Cbw {
        let mut cdb = [0u8; 16];
        cdb.copy_from_slice(&buf[15..31]);
        Cbw {
            signature: u32::from_le_bytes(buf[..4].try_into().unwrap()),
            tag: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            data_transfer_length: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            flags: buf[12],
            lun: buf[13],
            cb_length: buf[14],
            cdb,
        }
    }

    pub fn direction_in(&self) -> bool {
        self.flags & 0x80 != 0
    }
}

#[derive(Debug)]
enum MscState {
    /// Collecting the 31-byte CBW.
    Cbw,
    /// Host-to-device data phase.
    DataOut { remaining: u32 },
    /// Device-to-host data phase, refilled from the SCSI engine.
    DataIn { remaining: u32 },
}

/// The Bulk-Only Transport wrapper around an external SCSI engine.
pub struct MscBbbEngine<S> {
    scsi: S,
    max_lun: u8,
    state: MscState,
    buf: Vec<u8>,
    resp: VecDeque<TxUnit>,
    /// Tag and expected length of the CBW in flight.
    tag: u32,
    expected: u32,
    /// Bytes actually moved in the data phase.
    moved: u32,
    /// Set when the SCSI engine stops producing early.
    short_data: bool,
}

impl<S: ScsiEngine> MscBbbEngine<S> {
    pub fn new(scsi: S, max_lun: u8) -> Self {
        Self {
            scsi,
            max_lun,
            state: MscState::Cbw,
            buf: Vec::with_capacity(CBW_LEN),
            resp: VecDeque::new(),
            tag: 0,
            expected: 0,
            moved: 0,
            short_data: false,
        }
    }

    pub fn scsi_mut(&mut self) -> &mut S {
        &mut self.scsi
    }

    fn push_bytes(&mut self, bytes: impl IntoIterator<Item = u8>) {
        self.resp.extend(bytes.into_iter().map(TxUnit::Byte));
    }

    fn csw(&mut self, status: u8, residue: u32) {
        self.push_bytes(CSW_SIGNATURE.to_le_bytes());
        let tag = self.tag;
        self.push_bytes(tag.to_le_bytes());
        self.push_bytes(residue.to_le_bytes());
        self.resp.push_back(TxUnit::Byte(status));
        // The CSW travels in a transfer of its own.
        self.resp.push_back(TxUnit::End);
        self.state = MscState::Cbw;
    }

    fn cbw_complete(&mut self) {
        let cbw = Cbw::parse(&self.buf);
        self.buf.clear();
        self.tag = cbw.tag;
        self.expected = cbw.data_transfer_length;
        self.moved = 0;
        self.short_data = false;

        if cbw.signature != CBW_SIGNATURE
            || cbw.lun > self.max_lun
            || cbw.cb_length == 0
            || cbw.cb_length > 16
        {
            tracing::warn!(
                signature = cbw.signature,
                lun = cbw.lun,
                cb_length = cbw.cb_length,
                "CBW failed validation"
            );
            let residue = cbw.data_transfer_length;
            self.csw(CSW_PHASE_ERROR, residue);
            return;
        }

        let decl = self.scsi.start(cbw.lun, &cbw.cdb[..cbw.cb_length as usize]);
        let len = decl.data_len.min(cbw.data_transfer_length);
        tracing::debug!(opcode = cbw.cdb[0], len, "SCSI command");
        if len == 0 {
            let status = self.scsi.status();
            let expected = self.expected;
            self.csw(status, expected);
            return;
        }
        if decl.data_in != cbw.direction_in() {
            // Host and device disagree on direction: phase error.
            let expected = self.expected;
            self.csw(CSW_PHASE_ERROR, expected);
            return;
        }
        self.state = if decl.data_in {
            MscState::DataIn { remaining: len }
        } else {
            MscState::DataOut { remaining: len }
        };
    }

    /// Moves device-to-host data into the response queue, one sector at a
    /// time, and closes the transaction when the phase ends.
    fn pump_data_in(&mut self) {
        let MscState::DataIn { remaining } = &mut self.state else {
            return;
        };
        if *remaining == 0 || self.short_data {
            if self.moved > 0 {
                // Close the data transfer before the status transfer.
                self.resp.push_back(TxUnit::End);
            }
            let status = self.scsi.status();
            let expected = self.expected;
            let moved = self.moved;
            self.csw(status, expected - moved);
            return;
        }
        if self.resp.len() >= RESP_HIGH_WATER {
            return;
        }
        let want = (*remaining as usize).min(SECTOR_SIZE);
        let mut sector = [0u8; SECTOR_SIZE];
        let got = self.scsi.data_in(&mut sector[..want]);
        if got == 0 {
            self.short_data = true;
            return;
        }
        *remaining -= got as u32;
        self.moved += got as u32;
        self.push_bytes(sector[..got].iter().copied());
    }
}

impl<S: ScsiEngine> Codec for MscBbbEngine<S> {
    fn can_accept(&self) -> bool {
        match self.state {
            // The next CBW waits until the CSW has fully left.
            MscState::Cbw => self.resp.is_empty(),
            MscState::DataOut { .. } => true,
            MscState::DataIn { .. } => false,
        }
    }

    fn accept(&mut self, byte: u8, _drive: &mut DriveBus) {
        match &mut self.state {
            MscState::Cbw => {
                self.buf.push(byte);
                if self.buf.len() == CBW_LEN {
                    self.cbw_complete();
                }
            }
            MscState::DataOut { remaining } => {
                self.buf.push(byte);
                *remaining -= 1;
                let done = *remaining == 0;
                if self.buf.len() == SECTOR_SIZE || done {
                    let sector = std::mem::take(&mut self.buf);
                    self.scsi.data_out(&sector);
                    self.moved += sector.len() as u32;
                }
                if done {
                    let status = self.scsi.status();
                    let expected = self.expected;
                    let moved = self.moved;
                    self.csw(status, expected - moved);
                }
            }
            MscState::DataIn { .. } => {
                tracing::warn!("OUT data during IN phase, dropped");
            }
        }
    }

    fn poll_tx(&mut self) -> Option<TxUnit> {
        if self.resp.is_empty() {
            self.pump_data_in();
        }
        self.resp.pop_front()
    }

    fn offer_flux(&mut self, _sample: FluxSample, _drive: &mut DriveBus) -> bool {
        // Mass-Storage has no use for flux samples; consume and discard.
        true
    }

    fn step(&mut self, _drive: &mut DriveBus) {
        if matches!(self.state, MscState::DataIn { .. }) {
            self.pump_data_in();
        }
    }

    fn busy(&self) -> bool {
        !matches!(self.state, MscState::Cbw) || !self.resp.is_empty() || !self.buf.is_empty()
    }

    fn reset(&mut self) {
        self.state = MscState::Cbw;
        self.buf.clear();
        self.resp.clear();
        self.short_data = false;
    }

    fn control_out(&mut self, xfer: &ControlTransfer, _data: &[u8]) -> Option<ControlReply> {
        if xfer.request_type == 0x21 && xfer.request == REQ_BULK_ONLY_RESET {
            tracing::debug!("bulk-only mass storage reset");
            self.reset();
            return Some(ControlReply::Ack);
        }
        None
    }

    fn control_in(&mut self, xfer: &ControlTransfer) -> Option<ControlInReply> {
        if xfer.request_type == 0xA1 && xfer.request == REQ_GET_MAX_LUN {
            return Some(ControlInReply::Data([self.max_lun].as_slice().into()));
        }
        None
    }
}

/// In-memory SCSI disk covering the commands hosts probe with. Stands in
/// for the real SCSI engine in tests and examples.
pub struct RamDisk {
    data: Vec<u8>,
    pending: VecDeque<u8>,
    status: u8,
    write_lba: usize,
    sense: [u8; 3],
}

impl RamDisk {
    pub const OP_TEST_UNIT_READY: u8 = 0x00;
    pub const OP_REQUEST_SENSE: u8 = 0x03;
    pub const OP_INQUIRY: u8 = 0x12;
    pub const OP_READ_CAPACITY_10: u8 = 0x25;
    pub const OP_READ_10: u8 = 0x28;
    pub const OP_WRITE_10: u8 = 0x2A;

    pub fn new(sectors: usize) -> Self {
        Self {
            data: vec![0; sectors * SECTOR_SIZE],
            pending: VecDeque::new(),
            status: 0,
            write_lba: 0,
            sense: [0; 3],
        }
    }

    pub fn sector(&self, lba: usize) -> &[u8] {
        &self.data[lba * SECTOR_SIZE..(lba + 1) * SECTOR_SIZE]
    }

    pub fn sector_mut(&mut self, lba: usize) -> &mut [u8] {
        &mut self.data[lba * SECTOR_SIZE..(lba + 1) * SECTOR_SIZE]
    }

    fn sectors(&self) -> u32 {
        (self.data.len() / SECTOR_SIZE) as u32
    }

    fn fail(&mut self, key: u8, asc: u8) -> ScsiResponse {
        self.status = 1;
        self.sense = [key, asc, 0];
        ScsiResponse { data_len: 0, data_in: true }
    }
}

impl ScsiEngine for RamDisk {
    fn start(&mut self, _lun: u8, cdb: &[u8]) -> ScsiResponse {
        self.pending.clear();
        self.status = 0;
        match cdb[0] {
            Self::OP_TEST_UNIT_READY => ScsiResponse { data_len: 0, data_in: true },
            Self::OP_REQUEST_SENSE => {
                let mut sense = [0u8; 18];
                sense[0] = 0x70;
                sense[2] = self.sense[0];
                sense[7] = 10;
                sense[12] = self.sense[1];
                self.pending.extend(sense);
                ScsiResponse { data_len: 18, data_in: true }
            }
            Self::OP_INQUIRY => {
                let mut inq = [0u8; 36];
                inq[1] = 0x80; // removable
                inq[3] = 0x02;
                inq[4] = 31;
                inq[8..16].copy_from_slice(b"FLUXLINK");
                inq[16..32].copy_from_slice(b"FLUX IMAGE DISK ");
                inq[32..36].copy_from_slice(b"1.6 ");
                self.pending.extend(inq);
                ScsiResponse { data_len: 36, data_in: true }
            }
            Self::OP_READ_CAPACITY_10 => {
                let mut cap = [0u8; 8];
                cap[..4].copy_from_slice(&(self.sectors() - 1).to_be_bytes());
                cap[4..].copy_from_slice(&(SECTOR_SIZE as u32).to_be_bytes());
                self.pending.extend(cap);
                ScsiResponse { data_len: 8, data_in: true }
            }
            Self::OP_READ_10 => {
                let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]);
                let count = u16::from_be_bytes([cdb[7], cdb[8]]) as u32;
                if lba + count > self.sectors() {
                    return self.fail(0x05, 0x21); // illegal request, LBA out of range
                }
                let start = lba as usize * SECTOR_SIZE;
                let end = start + count as usize * SECTOR_SIZE;
                self.pending.extend(self.data[start..end].iter().copied());
                ScsiResponse { data_len: count * SECTOR_SIZE as u32, data_in: true }
            }
            Self::OP_WRITE_10 => {
                let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]);
                let count = u16::from_be_bytes([cdb[7], cdb[8]]) as u32;
                if lba + count > self.sectors() {
                    return self.fail(0x05, 0x21);
                }
                self.write_lba = lba as usize * SECTOR_SIZE;
                ScsiResponse { data_len: count * SECTOR_SIZE as u32, data_in: false }
            }
            _ => self.fail(0x05, 0x20), // illegal request, invalid opcode
        }
    }

    fn data_in(&mut self, buf: &mut [u8]) -> usize {
        let n = self.pending.len().min(buf.len());
        for b in buf[..n].iter_mut() {
            *b = self.pending.pop_front().unwrap();
        }
        n
    }

    fn data_out(&mut self, data: &[u8]) {
        let end = (self.write_lba + data.len()).min(self.data.len());
        let n = end - self.write_lba;
        self.data[self.write_lba..end].copy_from_slice(&data[..n]);
        self.write_lba = end;
    }

    fn status(&mut self) -> u8 {
        self.status
    }
}
