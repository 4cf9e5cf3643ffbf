//! Personality detection and routing.
//!
//! One bulk pipe, four codecs. The router sniffs the first word of each
//! inbound command to pick the personality, locks it for the duration of
//! the transaction, and multiplexes the single outbound channel so only
//! the active codec transmits. Hosts that send raw SCSI framing with no
//! recognizable signature land on the Mass-Storage fallback.

use crate::drive::{DriveBus, FluxSample};
use crate::greaseweazle::{self, GreaseweazleCodec, GwConfig};
use crate::kryoflux::{KfConfig, KryoFluxCodec};
use crate::msc::{MscBbbEngine, ScsiEngine};
use crate::native::NativeCodec;
use crate::packet::{ControlInReply, ControlReply, ControlTransfer};
use crate::{CBW_SIGNATURE, NATIVE_SIGNATURE};

/// A runtime-selected protocol identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Personality {
    Greaseweazle,
    KryoFlux,
    Native,
    MassStorage,
}

/// One unit of the outbound channel: a payload byte, or a transfer
/// boundary making the endpoint close the current bulk transfer with a
/// short (possibly zero-length) packet. Mass-Storage needs the boundary so
/// its CSW travels in its own transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxUnit {
    Byte(u8),
    End,
}

/// One personality codec behind the router.
pub trait Codec {
    /// Inbound ready signal; bytes are held upstream while false.
    fn can_accept(&self) -> bool;

    /// Consumes one host byte.
    fn accept(&mut self, byte: u8, drive: &mut DriveBus);

    /// Produces the next outbound unit, if any.
    fn poll_tx(&mut self) -> Option<TxUnit>;

    /// Offers one flux sample; false leaves the sample for a later tick.
    fn offer_flux(&mut self, sample: FluxSample, drive: &mut DriveBus) -> bool;

    /// Advances timers and deferred work by one tick.
    fn step(&mut self, drive: &mut DriveBus);

    /// A transaction (command, response or stream) is in flight.
    fn busy(&self) -> bool;

    fn reset(&mut self);

    /// Host-to-device control request; None when not for this codec.
    fn control_out(&mut self, _xfer: &ControlTransfer, _data: &[u8]) -> Option<ControlReply> {
        None
    }

    /// Device-to-host control request; None when not for this codec.
    fn control_in(&mut self, _xfer: &ControlTransfer) -> Option<ControlInReply> {
        None
    }
}

/// Routes command bytes to exactly one active codec.
pub struct PersonalityRouter<S> {
    greaseweazle: GreaseweazleCodec,
    kryoflux: KryoFluxCodec,
    native: NativeCodec,
    msc: MscBbbEngine<S>,
    active: Option<Personality>,
    /// Standing software override; wins over signature sniffing for every
    /// transaction starting after it is set.
    selected: Option<Personality>,
    fallback: Personality,
    sniff: Vec<u8>,
}

impl<S: ScsiEngine> PersonalityRouter<S> {
    pub fn new(gw: GwConfig, kf: KfConfig, scsi: S, max_lun: u8, fallback: Personality) -> Self {
        Self {
            greaseweazle: GreaseweazleCodec::new(gw),
            kryoflux: KryoFluxCodec::new(kf),
            native: NativeCodec::new(),
            msc: MscBbbEngine::new(scsi, max_lun),
            active: None,
            selected: None,
            fallback,
            sniff: Vec::with_capacity(4),
        }
    }

    /// Currently routed personality, if a transaction is in flight.
    pub fn active(&self) -> Option<Personality> {
        self.active
    }

    /// Sets a personality out of band. Mid-transaction the current
    /// personality stays locked; the override takes effect from the next
    /// transaction on and suppresses signature sniffing until cleared.
    pub fn select(&mut self, personality: Personality) {
        tracing::debug!(?personality, "personality override requested");
        self.selected = Some(personality);
    }

    /// Returns to signature-based routing.
    pub fn clear_selection(&mut self) {
        self.selected = None;
    }

    pub fn greaseweazle(&mut self) -> &mut GreaseweazleCodec {
        &mut self.greaseweazle
    }

    pub fn kryoflux(&mut self) -> &mut KryoFluxCodec {
        &mut self.kryoflux
    }

    pub fn native(&mut self) -> &mut NativeCodec {
        &mut self.native
    }

    pub fn msc(&mut self) -> &mut MscBbbEngine<S> {
        &mut self.msc
    }

    fn codec(&mut self, personality: Personality) -> &mut dyn Codec {
        match personality {
            Personality::Greaseweazle => &mut self.greaseweazle,
            Personality::KryoFlux => &mut self.kryoflux,
            Personality::Native => &mut self.native,
            Personality::MassStorage => &mut self.msc,
        }
    }

    /// Matches the collected prefix against the known signatures. `final_`
    /// forces a decision for a transfer shorter than the sniff window.
    fn detect(&self, final_: bool) -> Option<Personality> {
        let sniff = &self.sniff;
        if sniff.len() >= 4 {
            let word = u32::from_le_bytes(sniff[..4].try_into().unwrap());
            if word == NATIVE_SIGNATURE {
                return Some(Personality::Native);
            }
            if word == CBW_SIGNATURE {
                return Some(Personality::MassStorage);
            }
            if gw_header_shape(sniff) {
                return Some(Personality::Greaseweazle);
            }
            if sniff[1] == 0 && sniff[0] <= 0x0A {
                return Some(Personality::KryoFlux);
            }
            return Some(self.fallback);
        }
        if final_ {
            if sniff.len() >= 2 && gw_header_shape(sniff) {
                return Some(Personality::Greaseweazle);
            }
            return Some(self.fallback);
        }
        None
    }

    fn activate(&mut self, personality: Personality, drive: &mut DriveBus) {
        tracing::debug!(?personality, "personality active");
        self.active = Some(personality);
        let sniff = std::mem::take(&mut self.sniff);
        let codec = self.codec(personality);
        for byte in sniff {
            codec.accept(byte, drive);
        }
    }

    pub fn can_accept(&self) -> bool {
        match self.active {
            Some(p) => self.codec_ref(p).can_accept(),
            None => true,
        }
    }

    fn codec_ref(&self, personality: Personality) -> &dyn Codec {
        match personality {
            Personality::Greaseweazle => &self.greaseweazle,
            Personality::KryoFlux => &self.kryoflux,
            Personality::Native => &self.native,
            Personality::MassStorage => &self.msc,
        }
    }

    /// Consumes one inbound byte, deferring until enough arrive to pick a
    /// personality.
    pub fn accept(&mut self, byte: u8, drive: &mut DriveBus) {
        match self.active {
            Some(p) => self.codec(p).accept(byte, drive),
            None => {
                self.sniff.push(byte);
                if let Some(p) = self.selected.or_else(|| self.detect(false)) {
                    self.activate(p, drive);
                }
            }
        }
    }

    /// Transfer boundary: an undecided short command is resolved now.
    pub fn end_of_transfer(&mut self, drive: &mut DriveBus) {
        if self.active.is_none() && !self.sniff.is_empty() {
            if let Some(p) = self.detect(true) {
                self.activate(p, drive);
            }
        }
    }

    /// Pulls the next outbound unit from the active codec.
    pub fn poll_tx(&mut self) -> Option<TxUnit> {
        let p = self.active?;
        self.codec(p).poll_tx()
    }

    /// Routes a flux sample to the active codec; samples with no active
    /// consumer are destroyed, not multicast.
    pub fn offer_flux(&mut self, sample: FluxSample, drive: &mut DriveBus) -> bool {
        match self.active {
            Some(p) => self.codec(p).offer_flux(sample, drive),
            None => true,
        }
    }

    /// One tick: advance the active codec, then unlock at the transaction
    /// boundary if it has gone idle.
    pub fn step(&mut self, drive: &mut DriveBus) {
        if let Some(p) = self.active {
            self.codec(p).step(drive);
            if !self.codec_ref(p).busy() {
                tracing::trace!(?p, "transaction complete");
                self.active = None;
            }
        }
    }

    /// Control requests are offered to the codecs with control transports;
    /// the KryoFlux form takes priority, then Mass-Storage class requests.
    pub fn control_out(&mut self, xfer: &ControlTransfer, data: &[u8]) -> ControlReply {
        if let Some(reply) = self.kryoflux.control_out(xfer, data) {
            return reply;
        }
        if let Some(reply) = self.msc.control_out(xfer, data) {
            return reply;
        }
        tracing::warn!(request = xfer.request, "unhandled control request");
        ControlReply::Stall
    }

    pub fn control_in(&mut self, xfer: &ControlTransfer) -> ControlInReply {
        if let Some(reply) = self.kryoflux.control_in(xfer) {
            return reply;
        }
        if let Some(reply) = self.msc.control_in(xfer) {
            return reply;
        }
        tracing::warn!(request = xfer.request, "unhandled control request");
        ControlInReply::Stall
    }

    pub fn reset(&mut self, drive: &mut DriveBus) {
        self.greaseweazle.reset();
        self.kryoflux.reset();
        self.native.reset();
        self.msc.reset();
        self.active = None;
        self.selected = None;
        self.sniff.clear();
        drive.release_outputs();
    }
}

fn gw_header_shape(sniff: &[u8]) -> bool {
    sniff[0] <= greaseweazle::CMD_MAX && (2..=24).contains(&sniff[1])
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::msc::RamDisk;

    fn router() -> PersonalityRouter<RamDisk> {
        PersonalityRouter::new(
            GwConfig::default(),
            KfConfig::default(),
            RamDisk::new(16),
            0,
            Personality::MassStorage,
        )
    }

    fn feed(r: &mut PersonalityRouter<RamDisk>, drive: &mut DriveBus, bytes: &[u8]) {
        for &b in bytes {
            r.accept(b, drive);
        }
        r.end_of_transfer(drive);
    }

    #[test]
    fn native_signature_selects_native() {
        let mut r = router();
        let mut drive = DriveBus::new();
        feed(&mut r, &mut drive, &NATIVE_SIGNATURE.to_le_bytes());
        assert_eq!(r.active(), Some(Personality::Native));
    }

    #[test]
    fn cbw_signature_selects_mass_storage() {
        let mut r = router();
        let mut drive = DriveBus::new();
        feed(&mut r, &mut drive, b"USBC");
        assert_eq!(r.active(), Some(Personality::MassStorage));
    }

    #[test]
    fn gw_header_selects_greaseweazle() {
        let mut r = router();
        let mut drive = DriveBus::new();
        feed(&mut r, &mut drive, &[0x00, 0x03, 0x00]);
        assert_eq!(r.active(), Some(Personality::Greaseweazle));
    }

    #[test]
    fn kryoflux_word_selects_kryoflux() {
        let mut r = router();
        let mut drive = DriveBus::new();
        feed(&mut r, &mut drive, &[0x09, 0x00, 0x00, 0x00]);
        assert_eq!(r.active(), Some(Personality::KryoFlux));
    }

    #[test]
    fn garbage_falls_back_to_mass_storage() {
        let mut r = router();
        let mut drive = DriveBus::new();
        feed(&mut r, &mut drive, &[0xF0, 0xF1, 0xF2, 0xF3]);
        assert_eq!(r.active(), Some(Personality::MassStorage));
    }

    #[test]
    fn personality_unlocks_after_transaction() {
        let mut r = router();
        let mut drive = DriveBus::new();
        // Greaseweazle GET_INFO, then drain the response.
        feed(&mut r, &mut drive, &[0x00, 0x03, 0x00]);
        assert_eq!(r.active(), Some(Personality::Greaseweazle));
        while r.poll_tx().is_some() {}
        r.step(&mut drive);
        assert_eq!(r.active(), None);
        // The next transaction is free to pick another personality.
        feed(&mut r, &mut drive, &NATIVE_SIGNATURE.to_le_bytes());
        assert_eq!(r.active(), Some(Personality::Native));
    }

    #[test]
    fn override_applies_between_transactions() {
        let mut r = router();
        let mut drive = DriveBus::new();
        feed(&mut r, &mut drive, &[0x00, 0x03, 0x00]);
        r.select(Personality::Native);
        // Locked mid-transaction.
        assert_eq!(r.active(), Some(Personality::Greaseweazle));
        while r.poll_tx().is_some() {}
        r.step(&mut drive);
        assert_eq!(r.active(), None);
        // The override now beats sniffing, even for unrecognizable bytes.
        feed(&mut r, &mut drive, &[0xF0]);
        assert_eq!(r.active(), Some(Personality::Native));
    }
}
