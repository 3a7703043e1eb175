// src/io/mod.rs
//
// Adapter I/O layer: the wire-independent frame type, the per-protocol
// drivers, and the engine that runs two concurrent tasks per adapter.

// Core modules
pub mod codec; // Frame codec, byte parser and wire protocol traits
mod error;
pub mod link; // Link trait and in-memory duplex link
pub mod traits; // Adapter capability trait
mod types;

// Engine pieces
pub mod adapter;
pub mod control;
pub mod engine;
pub mod hub;
pub mod registry;

// Links to real hardware
#[cfg(not(target_os = "ios"))]
pub mod serial;
#[cfg(not(target_os = "ios"))]
pub mod usb;

// Protocol drivers
pub mod combi;
pub mod passthru;
pub mod slcan;
pub mod stn;

pub use adapter::{Driver, LinkAdapter, LinkFactory};
pub use codec::{
    feed_all, ByteParser, ControlResponse, FrameCodec, ParseEvent, ProtocolError, ResponseStatus,
    WireProtocol,
};
pub use control::{ControlCorrelator, PendingControl};
pub use engine::{Engine, EngineOptions};
pub use error::{classify_read_error, IoError, ReadFault};
pub use hub::{DeliveryReport, Hub, Subscription};
pub use link::{Link, MemoryLink};
pub use registry::AdapterRegistry;
pub use traits::{traits_for_kind, Adapter, AdapterState, AdapterTraits, Transport};
pub use types::{ErrorBus, ErrorEvent, ErrorStream, FrameSender, StatsSnapshot};

use serde::Serialize;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// ============================================================================
// Identifier space
// ============================================================================

/// Mask for standard (11-bit) CAN ID
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;
/// Mask for extended (29-bit) CAN ID
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;
/// Maximum payload of a classic CAN frame
pub const MAX_DLC: usize = 8;
/// Upper bound on any single adapter command, including the parser scratch buffer
pub const MAX_COMMAND_SIZE: usize = 1024;

/// First identifier of the reserved system range. Frames at or above it are
/// meta/control messages and never reach the bus.
pub const SYSTEM_ID_BASE: u32 = 0x4000_0000;

/// Reserved system identifiers.
pub mod system_id {
    use super::SYSTEM_ID_BASE;

    /// Plain text message for the application
    pub const SYSTEM_MSG: u32 = SYSTEM_ID_BASE;
    /// Error text
    pub const SYSTEM_MSG_ERROR: u32 = SYSTEM_ID_BASE + 1;
    /// Debug text
    pub const SYSTEM_MSG_DEBUG: u32 = SYSTEM_ID_BASE + 2;
    /// The adapter hit an error it cannot recover from
    pub const SYSTEM_MSG_UNRECOVERABLE: u32 = SYSTEM_ID_BASE + 3;
    /// Payload is written to the link verbatim as an adapter command
    pub const SYSTEM_MSG_COMMAND: u32 = SYSTEM_ID_BASE + 0x10;
}

/// Get current time in microseconds since UNIX epoch
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Acceptance filter
// ============================================================================

/// Code/mask pair accepting every identifier in a filter list.
///
/// `mask` has a 1 for every identifier bit that must equal `code`. Hardware
/// filters of this shape may let extra identifiers through; subscribers
/// still filter exactly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcceptanceFilter {
    pub code: u32,
    pub mask: u32,
}

impl AcceptanceFilter {
    /// `None` for an empty list (accept everything).
    pub fn from_ids(ids: &[u32], extended: bool) -> Option<Self> {
        let width = if extended { CAN_EFF_MASK } else { CAN_SFF_MASK };
        let (&first, rest) = ids.split_first()?;
        let code = first & width;
        let differing = rest.iter().fold(0, |acc, &id| acc | ((id & width) ^ code));
        let mask = !differing & width;
        Some(Self {
            code: code & mask,
            mask,
        })
    }

    pub fn matches(&self, id: u32) -> bool {
        id & self.mask == self.code
    }
}

// ============================================================================
// Frame
// ============================================================================

/// Which way a frame travels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Decoded from the link
    #[default]
    Incoming,
    /// Queued by a caller for transmission
    Outgoing,
    /// Outgoing, and the caller expects `responses` answers
    ResponseRequired,
}

/// A single CAN message, or a system message in the reserved identifier range.
///
/// Frames are immutable once built. The payload is always an owned copy.
#[derive(Clone, Debug, Serialize)]
pub struct Frame {
    id: u32,
    data: Vec<u8>,
    extended: bool,
    rtr: bool,
    direction: Direction,
    #[serde(skip_serializing_if = "Option::is_none")]
    responses: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<Duration>,
    /// Host UNIX timestamp in microseconds.
    timestamp_us: u64,
}

impl Frame {
    /// Outgoing frame. Identifiers above 0x7FF are sent as extended.
    pub fn new(id: u32, data: &[u8]) -> Result<Self, IoError> {
        let extended = id > CAN_SFF_MASK && id < SYSTEM_ID_BASE;
        Self::build(id, data, extended, false, Direction::Outgoing)
    }

    /// Outgoing frame with a 29-bit identifier, whatever its value.
    pub fn new_extended(id: u32, data: &[u8]) -> Result<Self, IoError> {
        Self::build(id, data, true, false, Direction::Outgoing)
    }

    /// Frame decoded from the wire. The reserved range is never accepted here.
    pub fn incoming(id: u32, data: &[u8], extended: bool, rtr: bool) -> Result<Self, IoError> {
        if id > CAN_EFF_MASK {
            return Err(IoError::InvalidFrame(format!(
                "identifier 0x{:X} outside the 29-bit range",
                id
            )));
        }
        Self::build(id, data, extended, rtr, Direction::Incoming)
    }

    /// Meta message in the reserved range.
    pub fn system(id: u32, payload: &[u8]) -> Result<Self, IoError> {
        if id < SYSTEM_ID_BASE {
            return Err(IoError::InvalidFrame(format!(
                "0x{:X} is not a system identifier",
                id
            )));
        }
        Self::build(id, payload, false, false, Direction::Outgoing)
    }

    /// Raw adapter command carried through the send queue.
    pub fn command(bytes: &[u8]) -> Result<Self, IoError> {
        Self::system(system_id::SYSTEM_MSG_COMMAND, bytes)
    }

    fn build(
        id: u32,
        data: &[u8],
        extended: bool,
        rtr: bool,
        direction: Direction,
    ) -> Result<Self, IoError> {
        if id >= SYSTEM_ID_BASE {
            if data.len() >= MAX_COMMAND_SIZE {
                return Err(IoError::InvalidFrame(format!(
                    "system payload of {} bytes (max {})",
                    data.len(),
                    MAX_COMMAND_SIZE - 1
                )));
            }
        } else {
            if id > CAN_EFF_MASK {
                return Err(IoError::InvalidFrame(format!(
                    "identifier 0x{:X} outside the 29-bit range",
                    id
                )));
            }
            if !extended && id > CAN_SFF_MASK {
                return Err(IoError::InvalidFrame(format!(
                    "identifier 0x{:X} does not fit 11 bits",
                    id
                )));
            }
            if data.len() > MAX_DLC {
                return Err(IoError::InvalidFrame(format!(
                    "payload of {} bytes (max {})",
                    data.len(),
                    MAX_DLC
                )));
            }
        }

        Ok(Self {
            id,
            data: data.to_vec(),
            extended,
            rtr,
            direction,
            responses: None,
            timeout: None,
            timestamp_us: now_us(),
        })
    }

    /// Mark as a remote transmission request.
    pub fn with_rtr(mut self) -> Self {
        self.rtr = true;
        self
    }

    /// Wait for `count` answers after transmission (adapters that support it).
    pub fn with_responses(mut self, count: u8) -> Self {
        self.responses = Some(count);
        if self.direction == Direction::Outgoing {
            self.direction = Direction::ResponseRequired;
        }
        self
    }

    /// Override the write/response timeout for this frame.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    pub fn is_rtr(&self) -> bool {
        self.rtr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn responses(&self) -> Option<u8> {
        self.responses
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    /// Whether the identifier is in the reserved system range.
    pub fn is_system(&self) -> bool {
        self.id >= SYSTEM_ID_BASE
    }
}

/// Frames compare on wire content; the host timestamp is ignored.
impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.data == other.data
            && self.extended == other.extended
            && self.rtr == other.rtr
            && self.direction == other.direction
            && self.responses == other.responses
            && self.timeout == other.timeout
    }
}

impl Eq for Frame {}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "0x{:08X}", self.id)?;
        } else {
            write!(f, "0x{:03X}", self.id)?;
        }
        write!(f, " [{}]", self.data.len())?;
        if self.rtr {
            write!(f, " RTR")?;
        }
        for byte in &self.data {
            write!(f, " {:02X}", byte)?;
        }
        Ok(())
    }
}
