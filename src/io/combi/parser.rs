// src/io/combi/parser.rs
//
// Receive state machine for the CombiAdapter binary protocol.
//
//   Command -> SizeHigh -> SizeLow -> Data -> Terminator -> Command
//
// Unknown command bytes are reported one at a time, so the parser slides
// forward byte by byte until it finds a plausible unit start.

use crate::io::codec::{ByteParser, ControlResponse, FrameCodec, ParseEvent, ProtocolError};
use crate::io::MAX_COMMAND_SIZE;

use super::codec::CombiCodec;
use super::{is_known_command, ACK, CMD_ADC_FILTER, CMD_CAN_FRAME_RX, NAK};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Command,
    SizeHigh,
    SizeLow,
    Data,
    Terminator,
}

pub struct CombiParser {
    stage: Stage,
    command: u8,
    size: usize,
    cursor: usize,
    /// Reused for every unit; never grows
    scratch: Box<[u8; MAX_COMMAND_SIZE]>,
}

impl CombiParser {
    pub fn new() -> Self {
        Self {
            stage: Stage::Command,
            command: 0,
            size: 0,
            cursor: 0,
            scratch: Box::new([0u8; MAX_COMMAND_SIZE]),
        }
    }

    /// Decode a completed, ACK-terminated unit.
    fn dispatch(&self) -> ParseEvent {
        let payload = &self.scratch[..self.size];

        if self.command == CMD_CAN_FRAME_RX {
            return match CombiCodec::decode(payload) {
                Ok(frame) => ParseEvent::Frame(frame),
                Err(e) => ParseEvent::Error(ProtocolError::Malformed(e.to_string())),
            };
        }

        let mut payload = payload.to_vec();
        // Firmware quirk: the ADC filter reply may be shortened to [channel],
        // meaning the filter is on. Normalise to [channel, 0x01].
        if self.command == CMD_ADC_FILTER && payload.len() == 1 {
            payload.push(0x01);
        }
        ParseEvent::Control(ControlResponse::ack(self.command, payload))
    }
}

impl Default for CombiParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteParser for CombiParser {
    fn feed(&mut self, byte: u8) -> Option<ParseEvent> {
        match self.stage {
            Stage::Command => {
                if !is_known_command(byte) {
                    return Some(ParseEvent::Error(ProtocolError::InvalidCommand(byte)));
                }
                self.command = byte;
                self.stage = Stage::SizeHigh;
                None
            }
            Stage::SizeHigh => {
                self.size = (byte as usize) << 8;
                self.stage = Stage::SizeLow;
                None
            }
            Stage::SizeLow => {
                self.size |= byte as usize;
                if self.size >= MAX_COMMAND_SIZE {
                    let err = ProtocolError::CommandTooLarge {
                        command: self.command,
                        size: self.size,
                    };
                    self.reset();
                    return Some(ParseEvent::Error(err));
                }
                self.cursor = 0;
                self.stage = if self.size == 0 {
                    Stage::Terminator
                } else {
                    Stage::Data
                };
                None
            }
            Stage::Data => {
                self.scratch[self.cursor] = byte;
                self.cursor += 1;
                if self.cursor == self.size {
                    self.stage = Stage::Terminator;
                }
                None
            }
            Stage::Terminator => {
                let event = match byte {
                    ACK => self.dispatch(),
                    NAK => ParseEvent::Error(ProtocolError::Nak {
                        command: Some(self.command),
                    }),
                    other => ParseEvent::Error(ProtocolError::UnexpectedTerminator {
                        command: self.command,
                        byte: other,
                    }),
                };
                self.reset();
                Some(event)
            }
        }
    }

    fn reset(&mut self) {
        self.stage = Stage::Command;
        self.command = 0;
        self.size = 0;
        self.cursor = 0;
    }

    fn is_idle(&self) -> bool {
        self.stage == Stage::Command
    }
}
