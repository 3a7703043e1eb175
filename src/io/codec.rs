// src/io/codec.rs
//
// Codec, parser and wire-protocol traits shared by every adapter driver.
//
// Each protocol implements these in its own directory:
// - combi/  - CombiAdapter binary protocol
// - slcan/  - slcan ASCII protocol
// - stn/    - OBDLink / STN AT-command protocol
//
// `FrameCodec` is the stateless single-frame encode/decode. `ByteParser` is the
// per-byte receive state machine that drives the receive task. `WireProtocol`
// ties both together for the engine.

use thiserror::Error;

use crate::io::error::IoError;
use crate::io::{system_id, Frame};

// ============================================================================
// Frame Codec Trait
// ============================================================================

/// Trait for CAN frame codecs.
///
/// The associated types define the protocol-specific raw frame formats.
pub trait FrameCodec {
    /// The raw frame type for decoding (e.g., byte slice, ASCII string)
    type RawFrame: ?Sized;

    /// The encoded frame type for transmission
    type EncodedFrame;

    /// Decode a raw frame into an incoming `Frame`.
    fn decode(raw: &Self::RawFrame) -> Result<Frame, IoError>;

    /// Encode a frame for transmission.
    fn encode(frame: &Frame) -> Result<Self::EncodedFrame, IoError>;
}

// ============================================================================
// Parser output
// ============================================================================

/// How the device terminated a control exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseStatus {
    Ack,
    Nak,
}

/// A reply from the adapter itself, as opposed to a bus frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlResponse {
    /// Protocol-specific command code the reply belongs to
    pub command: u8,
    pub payload: Vec<u8>,
    pub status: ResponseStatus,
}

impl ControlResponse {
    pub fn ack(command: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            payload: payload.into(),
            status: ResponseStatus::Ack,
        }
    }

    pub fn nak(command: u8) -> Self {
        Self {
            command,
            payload: Vec::new(),
            status: ResponseStatus::Nak,
        }
    }

    pub fn is_ack(&self) -> bool {
        self.status == ResponseStatus::Ack
    }

    /// Payload as text, for ASCII protocols (version strings, AT replies).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).trim().to_string()
    }
}

/// A malformed unit on the wire. Reported, never fatal; the parser has
/// already returned to its idle state when one of these is emitted.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid command byte 0x{0:02X}")]
    InvalidCommand(u8),

    #[error("command 0x{command:02X} declares {size} bytes")]
    CommandTooLarge { command: u8, size: usize },

    /// `command` is `None` when the wire format does not say what was refused.
    #[error("command {} terminated with NAK", fmt_command(.command))]
    Nak { command: Option<u8> },

    #[error("command 0x{command:02X} ended with 0x{byte:02X} instead of ACK")]
    UnexpectedTerminator { command: u8, byte: u8 },

    #[error("line longer than {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("malformed unit: {0}")]
    Malformed(String),

    /// The adapter reported a bus-side condition (e.g. "CAN ERROR").
    #[error("device reported: {0}")]
    DeviceReported(String),
}

fn fmt_command(command: &Option<u8>) -> String {
    match command {
        Some(c) => format!("0x{:02X}", c),
        None => "(unknown)".to_string(),
    }
}

/// One result of feeding a byte to a parser.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParseEvent {
    Frame(Frame),
    Control(ControlResponse),
    /// Ready-for-next-command prompt (AT-command adapters)
    Prompt,
    Error(ProtocolError),
}

// ============================================================================
// Receive state machine
// ============================================================================

/// Per-byte receive state machine.
///
/// Implementations own a fixed-capacity scratch buffer and never allocate in
/// proportion to the input. After emitting `ParseEvent::Error` the parser is
/// idle again.
pub trait ByteParser: Send {
    /// Consume one byte; at most one event completes per byte.
    fn feed(&mut self, byte: u8) -> Option<ParseEvent>;

    /// Drop any partial unit.
    fn reset(&mut self);

    /// True when no partial unit is buffered.
    fn is_idle(&self) -> bool;
}

/// Feed a chunk and collect every completed event, in order.
pub fn feed_all<P: ByteParser + ?Sized>(parser: &mut P, bytes: &[u8]) -> Vec<ParseEvent> {
    bytes.iter().filter_map(|&b| parser.feed(b)).collect()
}

// ============================================================================
// Wire protocol
// ============================================================================

/// Everything the engine needs to know about one wire format.
pub trait WireProtocol: Send + Sync + 'static {
    type Parser: ByteParser + 'static;

    /// Short name used in log prefixes.
    fn name(&self) -> &'static str;

    /// Fresh receive state machine.
    fn parser(&self) -> Self::Parser;

    /// Wire bytes for a bus frame.
    fn encode_frame(&self, frame: &Frame) -> Result<Vec<u8>, IoError>;

    /// Wire bytes for a system frame, or `None` if it must not be written.
    fn encode_system(&self, frame: &Frame) -> Option<Vec<u8>> {
        if frame.id() == system_id::SYSTEM_MSG_COMMAND {
            Some(frame.data().to_vec())
        } else {
            None
        }
    }

    /// Whether the device prints a ready prompt after each command.
    fn awaits_prompt(&self) -> bool {
        false
    }

    /// Best-effort bytes that put the device back into its closed state.
    fn close_sequence(&self) -> Option<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Emits a control event on every CR; used to check the helpers.
    struct LineCounter {
        pending: usize,
    }

    impl ByteParser for LineCounter {
        fn feed(&mut self, byte: u8) -> Option<ParseEvent> {
            if byte == b'\r' {
                let n = self.pending;
                self.pending = 0;
                Some(ParseEvent::Control(ControlResponse::ack(n as u8, Vec::new())))
            } else {
                self.pending += 1;
                None
            }
        }

        fn reset(&mut self) {
            self.pending = 0;
        }

        fn is_idle(&self) -> bool {
            self.pending == 0
        }
    }

    #[test]
    fn test_feed_all_preserves_order() {
        let mut parser = LineCounter { pending: 0 };
        let events = feed_all(&mut parser, b"ab\rcde\rf");
        assert_eq!(
            events,
            vec![
                ParseEvent::Control(ControlResponse::ack(2, Vec::new())),
                ParseEvent::Control(ControlResponse::ack(3, Vec::new())),
            ]
        );
        assert!(!parser.is_idle());
        parser.reset();
        assert!(parser.is_idle());
    }

    #[test]
    fn test_protocol_error_messages() {
        assert_eq!(
            ProtocolError::Nak { command: Some(0x20) }.to_string(),
            "command 0x20 terminated with NAK"
        );
        assert_eq!(
            ProtocolError::Nak { command: None }.to_string(),
            "command (unknown) terminated with NAK"
        );
        assert_eq!(ProtocolError::InvalidCommand(0xAB).to_string(), "invalid command byte 0xAB");
    }

    #[test]
    fn test_control_response_text() {
        let resp = ControlResponse::ack(b'V', b"V1013 ".to_vec());
        assert_eq!(resp.text(), "V1013");
        assert!(resp.is_ack());
        assert!(!ControlResponse::nak(0x81).is_ack());
    }
}
