// src/io/combi/codec.rs
//
// CombiAdapter binary protocol codec.
//
// Wire unit (both directions):
//   [cmd:1][size_hi:1][size_lo:1][payload:size][term:1]   term: ACK=0x00, NAK=0xFF
//
// CAN frame payload (15 bytes):
//   [id:4 LE][data:8, zero padded][len:1][ext:1][rtr:1]

use crate::io::codec::FrameCodec;
use crate::io::error::IoError;
use crate::io::{Direction, Frame, MAX_COMMAND_SIZE, MAX_DLC};

use super::{ACK, CMD_CAN_FRAME_RX, CMD_CAN_FRAME_TX, FRAME_PAYLOAD_LEN};

/// CombiAdapter binary protocol codec.
pub struct CombiCodec;

impl FrameCodec for CombiCodec {
    /// Raw frame is the 15-byte CAN frame payload
    type RawFrame = [u8];
    /// Encoded frame is a complete wire unit
    type EncodedFrame = Vec<u8>;

    fn decode(payload: &[u8]) -> Result<Frame, IoError> {
        if payload.len() != FRAME_PAYLOAD_LEN {
            return Err(IoError::protocol(
                "combi",
                format!(
                    "frame payload is {} bytes, expected {}",
                    payload.len(),
                    FRAME_PAYLOAD_LEN
                ),
            ));
        }

        let id = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let len = payload[12] as usize;
        if len > MAX_DLC {
            return Err(IoError::protocol(
                "combi",
                format!("invalid length: {} (max 8)", len),
            ));
        }
        let extended = payload[13] != 0;
        let rtr = payload[14] != 0;

        Frame::incoming(id, &payload[4..4 + len], extended, rtr)
    }

    /// Outgoing frames use the transmit command, incoming ones the receive
    /// command, so a decoded frame re-encodes to the bytes it came from.
    fn encode(frame: &Frame) -> Result<Vec<u8>, IoError> {
        let command = match frame.direction() {
            Direction::Incoming => CMD_CAN_FRAME_RX,
            Direction::Outgoing | Direction::ResponseRequired => CMD_CAN_FRAME_TX,
        };
        encode_command(command, &frame_payload(frame)?)
    }
}

/// Encode `frame` for transmission whatever its direction, so a received
/// frame can be forwarded as is.
pub fn encode_transmit(frame: &Frame) -> Result<Vec<u8>, IoError> {
    encode_command(CMD_CAN_FRAME_TX, &frame_payload(frame)?)
}

fn frame_payload(frame: &Frame) -> Result<[u8; FRAME_PAYLOAD_LEN], IoError> {
    if frame.is_system() {
        return Err(IoError::InvalidFrame(format!(
            "system identifier 0x{:X} cannot go on the bus",
            frame.id()
        )));
    }

    let mut payload = [0u8; FRAME_PAYLOAD_LEN];
    payload[..4].copy_from_slice(&frame.id().to_le_bytes());
    payload[4..4 + frame.len()].copy_from_slice(frame.data());
    payload[12] = frame.len() as u8;
    payload[13] = frame.is_extended() as u8;
    payload[14] = frame.is_rtr() as u8;
    Ok(payload)
}

/// Wrap `payload` in a wire unit for `command`.
pub fn encode_command(command: u8, payload: &[u8]) -> Result<Vec<u8>, IoError> {
    if payload.len() >= MAX_COMMAND_SIZE {
        return Err(IoError::protocol(
            "combi",
            format!("command 0x{:02X} payload of {} bytes", command, payload.len()),
        ));
    }
    let size = payload.len() as u16;
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(command);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(payload);
    out.push(ACK);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_outgoing_frame() {
        let frame = Frame::new(0x7E0, &[0x02, 0x10, 0x03]).unwrap();
        let wire = CombiCodec::encode(&frame).unwrap();
        assert_eq!(
            wire,
            vec![
                0x83, 0x00, 0x0F, // tx, size 15
                0xE0, 0x07, 0x00, 0x00, // id LE
                0x02, 0x10, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, // data
                0x03, 0x00, 0x00, // len, ext, rtr
                0x00, // ACK
            ]
        );
    }

    #[test]
    fn test_decode_extended_rtr() {
        let mut payload = [0u8; FRAME_PAYLOAD_LEN];
        payload[..4].copy_from_slice(&0x18DAF110u32.to_le_bytes());
        payload[12] = 0;
        payload[13] = 1;
        payload[14] = 1;
        let frame = CombiCodec::decode(&payload).unwrap();
        assert_eq!(frame.id(), 0x18DAF110);
        assert!(frame.is_extended());
        assert!(frame.is_rtr());
        assert!(frame.is_empty());
    }

    #[test]
    fn test_decode_rejects_bad_payloads() {
        assert!(CombiCodec::decode(&[0u8; 14]).is_err());
        let mut payload = [0u8; FRAME_PAYLOAD_LEN];
        payload[12] = 9;
        assert!(CombiCodec::decode(&payload).is_err());
    }

    #[test]
    fn test_encode_command_framing() {
        assert_eq!(encode_command(0x20, &[]).unwrap(), vec![0x20, 0x00, 0x00, 0x00]);
        assert_eq!(
            encode_command(0x81, &500_000u32.to_be_bytes()).unwrap(),
            vec![0x81, 0x00, 0x04, 0x00, 0x07, 0xA1, 0x20, 0x00]
        );
        assert!(encode_command(0x20, &[0u8; MAX_COMMAND_SIZE]).is_err());
    }

    #[test]
    fn test_forwarded_frame_uses_transmit_command() {
        let frame = Frame::incoming(0x100, &[1], false, false).unwrap();
        assert_eq!(CombiCodec::encode(&frame).unwrap()[0], CMD_CAN_FRAME_RX);
        assert_eq!(encode_transmit(&frame).unwrap()[0], CMD_CAN_FRAME_TX);
    }

    #[test]
    fn test_system_frame_not_encodable() {
        let frame = Frame::command(&[0x20, 0x00, 0x00, 0x00]).unwrap();
        assert!(CombiCodec::encode(&frame).is_err());
    }
}
