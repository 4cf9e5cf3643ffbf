//! Tick-driven protocol engine.
//!
//! Composes the packet engine, the personality router and the drive bus
//! into one cooperatively scheduled unit. Every stage advances at most one
//! elementary item per tick and only when its consumer is ready, which
//! reproduces the ordering of the original shared-clock design without any
//! real concurrency.

use std::collections::VecDeque;

use crate::drive::{DriveBus, FluxSample};
use crate::greaseweazle::GwConfig;
use crate::kryoflux::KfConfig;
use crate::msc::ScsiEngine;
use crate::packet::{
    ControlInReply, ControlReply, ControlTransfer, Endpoints, Handshake, InReply, LinkEvent,
    PacketEngine, TxByte,
};
use crate::router::{PersonalityRouter, TxUnit};
use crate::{Personality, EP_BULK_IN, EP_BULK_OUT, MAX_PACKET_SIZE};

/// Inbound command bytes buffered ahead of the active codec.
const INBOUND_CAP: usize = 4096;
/// Outbound bytes buffered ahead of the bulk IN endpoint.
const OUTBOUND_CAP: usize = 16384;

/// Engine-wide configuration with per-codec sections.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub greaseweazle: GwConfig,
    pub kryoflux: KfConfig,
    pub max_lun: u8,
    pub fallback: Option<Personality>,
}

#[derive(Debug, Clone, Copy)]
enum InItem {
    Byte(u8),
    /// Bulk transfer boundary, ordered behind the bytes of its transfer.
    TransferEnd,
}

/// Everything below the packet engine; split out so the packet engine can
/// dispatch into it through the [`Endpoints`] seam.
struct Backend<S> {
    router: PersonalityRouter<S>,
    drive: DriveBus,
    inbound: VecDeque<InItem>,
    outbound: VecDeque<TxUnit>,
}

impl<S: ScsiEngine> Endpoints for Backend<S> {
    fn control_out(&mut self, xfer: &ControlTransfer, data: &[u8]) -> ControlReply {
        self.router.control_out(xfer, data)
    }

    fn control_in(&mut self, xfer: &ControlTransfer) -> ControlInReply {
        self.router.control_in(xfer)
    }

    fn out(&mut self, endpoint: u8, data: &[u8]) -> Handshake {
        if endpoint != EP_BULK_OUT {
            return Handshake::Stall;
        }
        if self.inbound.len() + data.len() > INBOUND_CAP {
            // No room; the host retries the whole packet.
            return Handshake::Nak;
        }
        self.inbound.extend(data.iter().copied().map(InItem::Byte));
        if data.len() < MAX_PACKET_SIZE {
            self.inbound.push_back(InItem::TransferEnd);
        }
        Handshake::Ack
    }

    fn in_data(&mut self, endpoint: u8, buf: &mut [u8]) -> InReply {
        if endpoint != EP_BULK_IN {
            return InReply::Stall;
        }
        if self.outbound.is_empty() {
            return InReply::Nak;
        }
        // Fill the packet up to a transfer boundary. A boundary reached
        // before the packet is full makes this a short packet (possibly a
        // ZLP), which closes the transfer on the wire.
        let mut n = 0;
        while n < buf.len() {
            match self.outbound.front() {
                Some(TxUnit::Byte(_)) => {
                    let Some(TxUnit::Byte(b)) = self.outbound.pop_front() else { unreachable!() };
                    buf[n] = b;
                    n += 1;
                }
                Some(TxUnit::End) => {
                    self.outbound.pop_front();
                    break;
                }
                None => break,
            }
        }
        InReply::Data(n)
    }
}

/// The complete protocol core: one USB link in, one USB link out, one flux
/// sample stream consumed by whichever personality is active.
pub struct Engine<S> {
    packet: PacketEngine,
    backend: Backend<S>,
}

impl<S: ScsiEngine> Engine<S> {
    pub fn new(config: EngineConfig, scsi: S) -> Self {
        let router = PersonalityRouter::new(
            config.greaseweazle,
            config.kryoflux,
            scsi,
            config.max_lun,
            config.fallback.unwrap_or(Personality::MassStorage),
        );
        Self {
            packet: PacketEngine::new(),
            backend: Backend {
                router,
                drive: DriveBus::new(),
                inbound: VecDeque::new(),
                outbound: VecDeque::new(),
            },
        }
    }

    /// Feeds one link-layer event into the packet engine.
    pub fn handle_link(&mut self, event: LinkEvent) {
        if matches!(event, LinkEvent::Reset) {
            self.backend.inbound.clear();
            self.backend.outbound.clear();
            self.backend.router.reset(&mut self.backend.drive);
        }
        self.packet.handle(event, &mut self.backend);
    }

    /// Pulls the next transmit byte for the link layer.
    pub fn poll_link_tx(&mut self) -> Option<TxByte> {
        self.packet.poll_tx()
    }

    /// Offers one flux sample to the active codec. Returns false when the
    /// codec is backpressured; the caller retries the same sample later.
    pub fn offer_flux(&mut self, sample: FluxSample) -> bool {
        self.backend.router.offer_flux(sample, &mut self.backend.drive)
    }

    /// One scheduler tick: at most one inbound byte into the router, one
    /// step of the active codec, one outbound byte towards the endpoint.
    pub fn tick(&mut self) {
        let backend = &mut self.backend;

        match backend.inbound.front() {
            Some(InItem::Byte(_)) if backend.router.can_accept() => {
                let Some(InItem::Byte(byte)) = backend.inbound.pop_front() else {
                    unreachable!()
                };
                backend.router.accept(byte, &mut backend.drive);
            }
            Some(InItem::TransferEnd) => {
                backend.inbound.pop_front();
                backend.router.end_of_transfer(&mut backend.drive);
            }
            _ => (),
        }

        backend.router.step(&mut backend.drive);

        if backend.outbound.len() < OUTBOUND_CAP {
            if let Some(unit) = backend.router.poll_tx() {
                backend.outbound.push_back(unit);
            }
        }
    }

    /// Whether any stage still has queued or in-flight work. Timers inside
    /// the active codec only advance through [`tick`](Self::tick), so a busy
    /// engine must keep being ticked.
    pub fn is_busy(&self) -> bool {
        !self.backend.inbound.is_empty()
            || !self.backend.outbound.is_empty()
            || self.backend.router.active().is_some()
            || self.packet.tx_pending()
    }

    /// Whether ticking can still make progress on its own. Buffered outbound
    /// bytes don't count; they wait for the host's IN tokens.
    pub fn needs_ticks(&self) -> bool {
        !self.backend.inbound.is_empty() || self.backend.router.active().is_some()
    }

    pub fn router(&mut self) -> &mut PersonalityRouter<S> {
        &mut self.backend.router
    }

    pub fn drive(&mut self) -> &mut DriveBus {
        &mut self.backend.drive
    }

    pub fn packet_engine(&mut self) -> &mut PacketEngine {
        &mut self.packet
    }
}
