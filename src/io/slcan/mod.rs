// src/io/slcan/mod.rs
//
// slcan (Serial Line CAN) protocol driver for CANable, CANUSB and other
// USB-CAN adapters using the Lawicel/slcan ASCII protocol.
//
// Protocol reference: http://www.can232.com/docs/can232_v3.pdf

pub mod codec;
mod driver;
pub mod parser;

pub use driver::{SlcanAdapter, SlcanDriver};

use crate::io::codec::{FrameCodec, WireProtocol};
use crate::io::error::IoError;
use crate::io::Frame;

use self::codec::SlcanCodec;
use self::parser::SlcanParser;

pub struct SlcanProtocol {
    /// Opened with `L`: the device never transmits or acknowledges
    listen_only: bool,
}

impl SlcanProtocol {
    pub fn new(listen_only: bool) -> Self {
        Self { listen_only }
    }
}

impl WireProtocol for SlcanProtocol {
    type Parser = SlcanParser;

    fn name(&self) -> &'static str {
        "slcan"
    }

    fn parser(&self) -> SlcanParser {
        SlcanParser::new()
    }

    fn encode_frame(&self, frame: &Frame) -> Result<Vec<u8>, IoError> {
        if self.listen_only {
            return Err(IoError::unsupported("slcan", "transmit in listen-only mode"));
        }
        SlcanCodec::encode(frame)
    }

    fn close_sequence(&self) -> Option<Vec<u8>> {
        Some(b"C\r".to_vec())
    }
}
