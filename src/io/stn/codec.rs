// src/io/stn/codec.rs
//
// OBDLink / STN AT-command codec.
//
// Outgoing frames use the STN extended transmit command:
//   STPXh:<id>,d:<data hex>[,t:<timeout ms>][,r:<response count>]\r
//
// Incoming frames are response lines with headers on and spaces off:
//   Standard: <ID:3hex><DATA:2hex*n>      (odd length)
//   Extended: <ID:8hex><DATA:2hex*n>      (even length)

use crate::io::codec::FrameCodec;
use crate::io::error::IoError;
use crate::io::{Frame, MAX_DLC};

pub struct StnCodec;

impl FrameCodec for StnCodec {
    /// Raw frame is one response line (without CR)
    type RawFrame = str;
    /// Encoded frame is an `STPX` command line
    type EncodedFrame = Vec<u8>;

    fn decode(line: &str) -> Result<Frame, IoError> {
        if line.is_empty() || !line.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(IoError::protocol("stn", format!("not a frame line: '{}'", line)));
        }

        let extended = line.len() % 2 == 0;
        let id_len = if extended { 8 } else { 3 };
        if line.len() < id_len || (line.len() - id_len) / 2 > MAX_DLC {
            return Err(IoError::protocol(
                "stn",
                format!("frame line of {} chars", line.len()),
            ));
        }

        let id = u32::from_str_radix(&line[..id_len], 16)
            .map_err(|_| IoError::protocol("stn", format!("invalid ID in '{}'", line)))?;
        let data = hex::decode(&line[id_len..])
            .map_err(|e| IoError::protocol("stn", format!("invalid data in '{}': {}", line, e)))?;

        Frame::incoming(id, &data, extended, false)
    }

    fn encode(frame: &Frame) -> Result<Vec<u8>, IoError> {
        if frame.is_system() {
            return Err(IoError::InvalidFrame(format!(
                "system identifier 0x{:X} cannot go on the bus",
                frame.id()
            )));
        }
        if frame.is_rtr() {
            return Err(IoError::unsupported("stn", "remote frames"));
        }

        let mut cmd = String::with_capacity(48);
        cmd.push_str("STPXh:");
        cmd.push_str(&format_id(frame));
        cmd.push_str(",d:");
        cmd.push_str(&hex::encode_upper(frame.data()));
        if let Some(timeout) = frame.timeout() {
            cmd.push_str(&format!(",t:{}", timeout.as_millis()));
        }
        if let Some(count) = frame.responses() {
            cmd.push_str(&format!(",r:{}", count));
        }
        cmd.push('\r');
        Ok(cmd.into_bytes())
    }
}

fn format_id(frame: &Frame) -> String {
    if frame.is_extended() {
        format!("{:08X}", frame.id())
    } else {
        format!("{:03X}", frame.id() & 0x7FF)
    }
}

/// The response line the device prints for `frame` (without CR).
pub fn format_line(frame: &Frame) -> String {
    format!("{}{}", format_id(frame), hex::encode_upper(frame.data()))
}
