// src/io/stn/mod.rs
//
// OBDLink / STN11xx AT-command adapters over a serial port. The device
// accepts one command at a time and prints `>` when it is ready for the
// next, so the send task holds the queue until the prompt arrives.

pub mod codec;
mod driver;
pub mod parser;

pub use driver::{StnAdapter, StnDriver};

use crate::io::codec::{FrameCodec, WireProtocol};
use crate::io::error::IoError;
use crate::io::Frame;

use self::codec::StnCodec;
use self::parser::StnParser;

// Response codes assigned by the parser; the device has no binary codes.

/// `OK`
pub const CODE_OK: u8 = 0x01;
/// Any text line that is not a frame or a known literal
pub const CODE_TEXT: u8 = 0x02;
/// `NO DATA`
pub const CODE_NO_DATA: u8 = 0x03;
/// `STOPPED`
pub const CODE_STOPPED: u8 = 0x04;

pub struct StnProtocol;

impl WireProtocol for StnProtocol {
    type Parser = StnParser;

    fn name(&self) -> &'static str {
        "stn"
    }

    fn parser(&self) -> StnParser {
        StnParser::new()
    }

    fn encode_frame(&self, frame: &Frame) -> Result<Vec<u8>, IoError> {
        StnCodec::encode(frame)
    }

    fn awaits_prompt(&self) -> bool {
        true
    }

    /// Close the active protocol
    fn close_sequence(&self) -> Option<Vec<u8>> {
        Some(b"ATPC\r".to_vec())
    }
}
