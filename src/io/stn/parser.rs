// src/io/stn/parser.rs
//
// Line state machine for OBDLink / STN adapters. Lines end with CR; the `>`
// prompt byte arrives on its own once the device is ready for the next
// command. Lines are classified by literal content:
//
//   OK                        command accepted
//   ?                         command not understood (NAK)
//   NO DATA / STOPPED         exchange finished without (more) frames
//   CAN ERROR, BUFFER FULL..  bus-side condition reported by the device
//   all hex                   received frame
//   anything else             text reply (banner, version, voltage)

use crate::io::codec::{ByteParser, ControlResponse, FrameCodec, ParseEvent, ProtocolError};

use super::codec::StnCodec;
use super::{CODE_NO_DATA, CODE_OK, CODE_STOPPED, CODE_TEXT};

const CR: u8 = b'\r';
const PROMPT: u8 = b'>';
const LINE_LIMIT: usize = 64;

/// Lines the device prints for bus-side failures.
const DEVICE_ERRORS: [&str; 6] = [
    "CAN ERROR",
    "BUFFER FULL",
    "BUS ERROR",
    "BUS BUSY",
    "DATA ERROR",
    "FB ERROR",
];

pub struct StnParser {
    line: Vec<u8>,
    discarding: bool,
}

impl StnParser {
    pub fn new() -> Self {
        Self {
            line: Vec::with_capacity(LINE_LIMIT),
            discarding: false,
        }
    }

    fn classify(&self) -> Option<ParseEvent> {
        let text = String::from_utf8_lossy(&self.line);
        let text = text.trim();

        let event = match text {
            "" => return None,
            "OK" => ParseEvent::Control(ControlResponse::ack(CODE_OK, Vec::new())),
            "?" => ParseEvent::Error(ProtocolError::Nak { command: None }),
            "NO DATA" => ParseEvent::Control(ControlResponse::ack(CODE_NO_DATA, Vec::new())),
            "STOPPED" => ParseEvent::Control(ControlResponse::ack(CODE_STOPPED, Vec::new())),
            t if DEVICE_ERRORS.iter().any(|e| t.starts_with(e)) => {
                ParseEvent::Error(ProtocolError::DeviceReported(t.to_string()))
            }
            t if t.bytes().all(|b| b.is_ascii_hexdigit()) => match StnCodec::decode(t) {
                Ok(frame) => ParseEvent::Frame(frame),
                Err(e) => ParseEvent::Error(ProtocolError::Malformed(e.to_string())),
            },
            t => ParseEvent::Control(ControlResponse::ack(CODE_TEXT, t.as_bytes().to_vec())),
        };
        Some(event)
    }
}

impl Default for StnParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteParser for StnParser {
    fn feed(&mut self, byte: u8) -> Option<ParseEvent> {
        match byte {
            CR => {
                let event = if self.discarding { None } else { self.classify() };
                self.reset();
                event
            }
            PROMPT => {
                // The prompt always ends whatever was pending
                self.reset();
                Some(ParseEvent::Prompt)
            }
            // Line feeds and the NUL some firmware emits before the prompt
            b'\n' | 0x00 => None,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::codec::feed_all;
    use crate::io::Frame;
    use proptest::prelude::*;

    #[test]
    fn test_literal_lines() {
        let mut parser = StnParser::new();
        let events = feed_all(&mut parser, b"OK\r\r>?\r>NO DATA\r\r>STOPPED\r");
        assert_eq!(
            events,
            vec![
                ParseEvent::Control(ControlResponse::ack(CODE_OK, vec![])),
                ParseEvent::Prompt,
                ParseEvent::Error(ProtocolError::Nak { command: None }),
                ParseEvent::Prompt,
                ParseEvent::Control(ControlResponse::ack(CODE_NO_DATA, vec![])),
                ParseEvent::Prompt,
                ParseEvent::Control(ControlResponse::ack(CODE_STOPPED, vec![])),
            ]
        );
    }

    #[test]
    fn test_frames_and_text() {
        let mut parser = StnParser::new();
        let events = feed_all(&mut parser, b"7E803410D00\r\nSTN1110 v4.0.1\r");
        assert_eq!(
            events,
            vec![
                ParseEvent::Frame(Frame::incoming(0x7E8, &[0x03, 0x41, 0x0D, 0x00], false, false).unwrap()),
                ParseEvent::Control(ControlResponse::ack(CODE_TEXT, b"STN1110 v4.0.1".to_vec())),
            ]
        );
    }

    #[test]
    fn test_device_errors_are_reported() {
        let mut parser = StnParser::new();
        let events = feed_all(&mut parser, b"CAN ERROR\rBUFFER FULL\r");
        assert_eq!(
            events,
            vec![
                ParseEvent::Error(ProtocolError::DeviceReported("CAN ERROR".to_string())),
                ParseEvent::Error(ProtocolError::DeviceReported("BUFFER FULL".to_string())),
            ]
        );
    }

    #[test]
    fn test_bad_hex_frame_is_malformed() {
        let mut parser = StnParser::new();
        let events = feed_all(&mut parser, b"7E800000000000000000000\r");
        assert!(matches!(events.as_slice(), [ParseEvent::Error(ProtocolError::Malformed(_))]));
    }

    #[test]
    fn test_prompt_cuts_partial_line() {
        let mut parser = StnParser::new();
        let events = feed_all(&mut parser, b"SEARCH>OK\r");
        assert_eq!(
            events,
            vec![
                ParseEvent::Prompt,
                ParseEvent::Control(ControlResponse::ack(CODE_OK, vec![])),
            ]
        );
    }

    proptest! {
        #[test]
        fn prop_resync_after_garbage(garbage in prop::collection::vec(any::<u8>(), 0..300)) {
            let mut parser = StnParser::new();
            feed_all(&mut parser, &garbage);
            feed_all(&mut parser, b"\r");
            prop_assert!(parser.is_idle());
            prop_assert_eq!(
                feed_all(&mut parser, b"OK\r"),
                vec![ParseEvent::Control(ControlResponse::ack(CODE_OK, vec![]))]
            );
        }
    }
}
