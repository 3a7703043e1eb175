// src/io/slcan/parser.rs
//
// Line state machine for slcan. Bytes accumulate until CR, then the line is
// classified by its first character:
//
//   t/T/r/R  received frame
//   z/Z      transmit acknowledged (standard/extended)
//   V/v/N/F  version, serial number and status replies
//   (empty)  command accepted
//
// BELL (0x07) is the device's NAK and needs no CR.

use crate::io::codec::{ByteParser, ControlResponse, FrameCodec, ParseEvent, ProtocolError};

use super::codec::SlcanCodec;

const CR: u8 = b'\r';
const BELL: u8 = 0x07;
/// Longest valid line is an extended frame: T + 8 + 1 + 16
const LINE_LIMIT: usize = 32;

/// Response code of a bare CR acknowledgement
pub const OK_RESPONSE: u8 = CR;

pub struct SlcanParser {
    line: Vec<u8>,
    /// Overflowed; dropping bytes until the next CR
    discarding: bool,
}

impl SlcanParser {
    pub fn new() -> Self {
        Self {
            line: Vec::with_capacity(LINE_LIMIT),
            discarding: false,
        }
    }

    fn classify(&self) -> ParseEvent {
        let Some((&tag, rest)) = self.line.split_first() else {
            return ParseEvent::Control(ControlResponse::ack(OK_RESPONSE, Vec::new()));
        };

        match tag {
            b't' | b'T' | b'r' | b'R' => {
                let decoded = std::str::from_utf8(&self.line)
                    .map_err(|_| "frame line is not ASCII".to_string())
                    .and_then(|line| SlcanCodec::decode(line).map_err(|e| e.to_string()));
                match decoded {
                    Ok(frame) => ParseEvent::Frame(frame),
                    Err(message) => ParseEvent::Error(ProtocolError::Malformed(message)),
                }
            }
            b'z' | b'Z' | b'V' | b'v' | b'N' | b'F' => {
                ParseEvent::Control(ControlResponse::ack(tag, rest.to_vec()))
            }
            _ => ParseEvent::Error(ProtocolError::Malformed(format!(
                "unrecognised line '{}'",
                String::from_utf8_lossy(&self.line)
            ))),
        }
    }
}

impl Default for SlcanParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteParser for SlcanParser {
    fn feed(&mut self, byte: u8) -> Option<ParseEvent> {
        match byte {
            CR => {
                let event = if self.discarding {
                    None
                } else {
                    Some(self.classify())
                };
                self.reset();
                event
            }
            BELL => {
                self.reset();
                Some(ParseEvent::Error(ProtocolError::Nak { command: None }))
            }
            // Some firmware terminates with CR LF
            b'\n' if self.line.is_empty() => None,
            _ if self.discarding => None,
            _ if self.line.len() >= LINE_LIMIT => {
                self.line.clear();
                self.discarding = true;
                Some(ParseEvent::Error(ProtocolError::LineTooLong { limit: LINE_LIMIT }))
            }
            _ => {
                self.line.push(byte);
                None
            }
        }
    }

    fn reset(&mut self) {
        self.line.clear();
        self.discarding = false;
    }

    fn is_idle(&self) -> bool {
        self.line.is_empty() && !self.discarding
    }
}
