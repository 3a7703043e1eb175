// src/io/combi/mod.rs
//
// CombiAdapter: USB bulk adapter speaking a length-prefixed binary protocol.
// Besides CAN it exposes a firmware version query, ADC channels with an
// optional filter, and an EGT (exhaust gas temperature) input.

pub mod codec;
mod driver;
pub mod parser;

pub use driver::{CombiAdapter, CombiDriver};

use crate::io::codec::WireProtocol;
use crate::io::error::IoError;
use crate::io::Frame;

use self::parser::CombiParser;

/// Unit terminator: command accepted
pub const ACK: u8 = 0x00;
/// Unit terminator: command rejected
pub const NAK: u8 = 0xFF;

pub const CMD_VERSION: u8 = 0x20;
pub const CMD_ADC_FILTER: u8 = 0x21;
pub const CMD_ADC: u8 = 0x22;
pub const CMD_EGT: u8 = 0x23;
/// Payload `[1]` opens the CAN channel, `[0]` closes it
pub const CMD_CAN_OPEN: u8 = 0x80;
/// Payload is the bit rate in bit/s, 4 bytes big endian
pub const CMD_CAN_BITRATE: u8 = 0x81;
/// Frame received from the bus (device to host)
pub const CMD_CAN_FRAME_RX: u8 = 0x82;
/// Frame to transmit (host to device); the device acks with the same code
pub const CMD_CAN_FRAME_TX: u8 = 0x83;

/// Size of the frame payload carried by `CMD_CAN_FRAME_RX`/`TX`
pub const FRAME_PAYLOAD_LEN: usize = 15;

#[cfg(not(target_os = "ios"))]
pub const USB_ENDPOINTS: crate::io::usb::UsbEndpoints = crate::io::usb::UsbEndpoints {
    vendor_id: 0xFFFF,
    product_id: 0x0005,
    interface: 0,
    bulk_in: 0x82,
    bulk_out: 0x05,
};

/// Command codes the device may send.
pub fn is_known_command(byte: u8) -> bool {
    matches!(
        byte,
        CMD_VERSION
            | CMD_ADC_FILTER
            | CMD_ADC
            | CMD_EGT
            | CMD_CAN_OPEN
            | CMD_CAN_BITRATE
            | CMD_CAN_FRAME_RX
            | CMD_CAN_FRAME_TX
    )
}

pub struct CombiProtocol;

impl WireProtocol for CombiProtocol {
    type Parser = CombiParser;

    fn name(&self) -> &'static str {
        "combi"
    }

    fn parser(&self) -> CombiParser {
        CombiParser::new()
    }

    fn encode_frame(&self, frame: &Frame) -> Result<Vec<u8>, IoError> {
        codec::encode_transmit(frame)
    }

    /// Close the CAN channel so the device stops streaming.
    fn close_sequence(&self) -> Option<Vec<u8>> {
        codec::encode_command(CMD_CAN_OPEN, &[0]).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_commands() {
        assert!(is_known_command(CMD_VERSION));
        assert!(is_known_command(CMD_CAN_FRAME_RX));
        assert!(!is_known_command(ACK));
        assert!(!is_known_command(NAK));
        assert!(!is_known_command(0x24));
    }

    #[test]
    fn test_close_sequence_closes_channel() {
        assert_eq!(
            CombiProtocol.close_sequence(),
            Some(vec![CMD_CAN_OPEN, 0x00, 0x01, 0x00, ACK])
        );
    }

    #[test]
    fn test_system_command_passes_through() {
        let raw = codec::encode_command(CMD_VERSION, &[]).unwrap();
        let frame = Frame::command(&raw).unwrap();
        assert_eq!(CombiProtocol.encode_system(&frame), Some(raw));
    }
}
