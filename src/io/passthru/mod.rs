// src/io/passthru/mod.rs
//
// Adapters behind a vendor pass-through library (SAE J2534 style). The
// library itself is not part of this crate: callers hand in something that
// implements `PassThruApi`, usually a thin binding over the vendor DLL.
//
// CAN messages on this boundary carry the identifier as the first four data
// bytes (big-endian), followed by the payload.

mod adapter;

pub use adapter::PassThruAdapter;

use std::fmt;
use std::time::Duration;

use crate::io::error::IoError;
use crate::io::{Frame, MAX_DLC};

// ============================================================================
// Call contract constants
// ============================================================================

/// Raw CAN protocol id
pub const PROTOCOL_CAN: u32 = 5;
/// Connect, transmit and receive flag for 29-bit identifiers
pub const CAN_29BIT_ID: u32 = 0x0000_0100;
/// Receive status bit marking the echo of our own transmission
pub const TX_MSG_TYPE: u32 = 0x0000_0001;

pub const ERR_DEVICE_NOT_CONNECTED: i32 = 0x08;
pub const ERR_TIMEOUT: i32 = 0x09;
pub const ERR_BUFFER_EMPTY: i32 = 0x10;

/// Bytes of identifier in front of every CAN message payload
const ID_LEN: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterKind {
    Pass,
    Block,
}

/// Failure reported by the pass-through library.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassThruError {
    pub code: i32,
    pub message: String,
}

impl PassThruError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Read returned nothing in time; not a failure.
    pub fn is_empty_read(&self) -> bool {
        self.code == ERR_BUFFER_EMPTY || self.code == ERR_TIMEOUT
    }
}

impl fmt::Display for PassThruError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code 0x{:02X}: {}", self.code, self.message)
    }
}

/// Lift a library failure into the crate error, naming the call.
pub(crate) fn lift<T>(device: &str, call: &'static str, result: Result<T, PassThruError>) -> Result<T, IoError> {
    result.map_err(|e| IoError::PassThru {
        device: device.to_string(),
        call,
        code: e.code,
        message: e.message,
    })
}

// ============================================================================
// Messages
// ============================================================================

/// One message crossing the pass-through boundary.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassThruMsg {
    pub protocol_id: u32,
    pub rx_status: u32,
    pub tx_flags: u32,
    /// Device timestamp in microseconds
    pub timestamp: u32,
    pub data: Vec<u8>,
}

impl PassThruMsg {
    pub fn from_frame(frame: &Frame) -> Self {
        let mut data = Vec::with_capacity(ID_LEN + frame.len());
        data.extend_from_slice(&frame.id().to_be_bytes());
        data.extend_from_slice(frame.data());
        Self {
            protocol_id: PROTOCOL_CAN,
            tx_flags: if frame.is_extended() { CAN_29BIT_ID } else { 0 },
            data,
            ..Self::default()
        }
    }

    /// Mask/pattern message over the identifier bytes, for filters.
    pub fn id_pattern(value: u32, extended: bool) -> Self {
        Self {
            protocol_id: PROTOCOL_CAN,
            tx_flags: if extended { CAN_29BIT_ID } else { 0 },
            data: value.to_be_bytes().to_vec(),
            ..Self::default()
        }
    }

    pub fn is_tx_echo(&self) -> bool {
        self.rx_status & TX_MSG_TYPE != 0
    }

    pub fn to_frame(&self) -> Result<Frame, IoError> {
        if self.data.len() < ID_LEN || self.data.len() > ID_LEN + MAX_DLC {
            return Err(IoError::protocol(
                "passthru",
                format!("message of {} bytes", self.data.len()),
            ));
        }
        let (id, payload) = self.data.split_at(ID_LEN);
        let id = u32::from_be_bytes([id[0], id[1], id[2], id[3]]);
        Frame::incoming(id, payload, self.rx_status & CAN_29BIT_ID != 0, false)
    }
}

// ============================================================================
// Call contract
// ============================================================================

/// The narrow call surface of a pass-through library. Calls block; the
/// adapter runs them off the async runtime.
pub trait PassThruApi: Send + Sync {
    /// Open the device, returning its handle.
    fn open(&self) -> Result<u32, PassThruError>;

    /// Connect a channel at `protocol` and `baud`, returning its handle.
    fn connect(&self, device: u32, protocol: u32, flags: u32, baud: u32) -> Result<u32, PassThruError>;

    /// Up to `max` messages, waiting at most `timeout`.
    fn read_msgs(&self, channel: u32, max: usize, timeout: Duration) -> Result<Vec<PassThruMsg>, PassThruError>;

    /// Returns how many messages were accepted.
    fn write_msgs(&self, channel: u32, msgs: &[PassThruMsg], timeout: Duration) -> Result<usize, PassThruError>;

    fn start_msg_filter(
        &self,
        channel: u32,
        kind: FilterKind,
        mask: &PassThruMsg,
        pattern: &PassThruMsg,
    ) -> Result<u32, PassThruError>;

    fn stop_msg_filter(&self, channel: u32, filter: u32) -> Result<(), PassThruError>;

    fn disconnect(&self, channel: u32) -> Result<(), PassThruError>;

    fn close(&self, device: u32) -> Result<(), PassThruError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_to_message() {
        let frame = Frame::new(0x7E0, &[0x02, 0x10, 0x03]).unwrap();
        let msg = PassThruMsg::from_frame(&frame);
        assert_eq!(msg.protocol_id, PROTOCOL_CAN);
        assert_eq!(msg.tx_flags, 0);
        assert_eq!(msg.data, vec![0x00, 0x00, 0x07, 0xE0, 0x02, 0x10, 0x03]);

        let ext = Frame::new_extended(0x18DA10F1, &[0x3E]).unwrap();
        assert_eq!(PassThruMsg::from_frame(&ext).tx_flags, CAN_29BIT_ID);
    }

    #[test]
    fn test_message_to_frame() {
        let msg = PassThruMsg {
            protocol_id: PROTOCOL_CAN,
            rx_status: CAN_29BIT_ID,
            data: vec![0x18, 0xDA, 0xF1, 0x10, 0x02, 0x50, 0x03],
            ..PassThruMsg::default()
        };
        let frame = msg.to_frame().unwrap();
        assert_eq!(frame.id(), 0x18DAF110);
        assert!(frame.is_extended());
        assert_eq!(frame.data(), &[0x02, 0x50, 0x03]);
    }

    #[test]
    fn test_bad_messages_rejected() {
        let short = PassThruMsg {
            data: vec![0x07, 0xE8],
            ..PassThruMsg::default()
        };
        assert!(short.to_frame().is_err());

        let long = PassThruMsg {
            data: vec![0; ID_LEN + 9],
            ..PassThruMsg::default()
        };
        assert!(long.to_frame().is_err());
    }

    #[test]
    fn test_error_lifting() {
        let err = lift::<()>("passthru", "PassThruConnect", Err(PassThruError::new(0x0A, "invalid baud")))
            .unwrap_err();
        match err {
            IoError::PassThru { call, code, .. } => {
                assert_eq!(call, "PassThruConnect");
                assert_eq!(code, 0x0A);
            }
            other => panic!("unexpected {}", other),
        }
        assert!(PassThruError::new(ERR_BUFFER_EMPTY, "").is_empty_read());
        assert!(!PassThruError::new(ERR_DEVICE_NOT_CONNECTED, "").is_empty_read());
    }
}
