//! USB protocol engine for a flux-level disk imaging instrument.
//!
//! One USB link, several incompatible wire protocols: a Greaseweazle-compatible
//! binary protocol, a KryoFlux stream protocol, the instrument's native raw
//! protocol and USB Mass-Storage Bulk-Only Transport. A runtime-selected
//! personality decides which codec sits behind the bulk pipe; all codecs
//! re-encode the same stream of timestamped flux samples into their own
//! formats.
//!
//! The protocol core ([`packet`], [`router`], the codec modules and
//! [`engine`]) is synchronous and tick-driven. [`bus`] wraps it in a tokio
//! task and exposes channel-style handles for embedding.

pub mod bus;
pub mod crc;
pub mod drive;
pub mod engine;
pub mod greaseweazle;
pub mod kryoflux;
pub mod msc;
pub mod native;
pub mod packet;
pub mod router;

pub use drive::{DriveBus, FluxSample};
pub use engine::{Engine, EngineConfig};
pub use router::Personality;

/// Native protocol signature word ("FRWQ", little-endian on the wire).
pub const NATIVE_SIGNATURE: u32 = 0x4652_5751;

/// Command Block Wrapper signature ("USBC").
pub const CBW_SIGNATURE: u32 = 0x4342_5355;

/// Command Status Wrapper signature ("USBS").
pub const CSW_SIGNATURE: u32 = 0x5342_5355;

/// Bulk OUT endpoint carrying host commands.
pub const EP_BULK_OUT: u8 = 1;

/// Bulk IN endpoint carrying responses and stream data.
pub const EP_BULK_IN: u8 = 2;

/// Largest bulk packet the engine accepts or produces.
pub const MAX_PACKET_SIZE: usize = 512;
