// src/io/slcan/codec.rs
//
// slcan (Serial Line CAN) ASCII protocol codec.
//
// Protocol reference: http://www.can232.com/docs/can232_v3.pdf
//
// Frame formats:
//   Standard: t<ID:3hex><DLC:1hex><DATA:2hex*DLC>\r
//   Extended: T<ID:8hex><DLC:1hex><DATA:2hex*DLC>\r
//   RTR:      r<ID:3hex><DLC:1hex>\r / R<ID:8hex><DLC:1hex>\r

use crate::io::codec::FrameCodec;
use crate::io::error::IoError;
use crate::io::{AcceptanceFilter, Frame, MAX_DLC};
use crate::settings::Bitrate;

/// slcan bitrate commands (S0-S8)
const SLCAN_BITRATES: [(u32, &str); 9] = [
    (10_000, "S0"),     // 10 Kbit/s
    (20_000, "S1"),     // 20 Kbit/s
    (50_000, "S2"),     // 50 Kbit/s
    (100_000, "S3"),    // 100 Kbit/s
    (125_000, "S4"),    // 125 Kbit/s
    (250_000, "S5"),    // 250 Kbit/s
    (500_000, "S6"),    // 500 Kbit/s
    (750_000, "S7"),    // 750 Kbit/s
    (1_000_000, "S8"),  // 1 Mbit/s
];

/// slcan (Serial Line CAN) ASCII protocol codec.
pub struct SlcanCodec;

impl FrameCodec for SlcanCodec {
    /// Raw frame is an ASCII line (without trailing \r)
    type RawFrame = str;
    /// Encoded frame is a Vec<u8> (ASCII bytes with trailing \r)
    type EncodedFrame = Vec<u8>;

    /// Decode an slcan ASCII frame line.
    ///
    /// Examples:
    ///   `t1234AABBCCDD` -> Standard frame, ID=0x123, DLC=4, data=AA BB CC DD
    ///   `T123456782AABB` -> Extended frame, ID=0x12345678, DLC=2
    ///   `r1232` -> Standard RTR, ID=0x123, requesting 2 bytes
    fn decode(line: &str) -> Result<Frame, IoError> {
        let bytes = line.as_bytes();
        if bytes.is_empty() {
            return Err(IoError::protocol("slcan", "empty frame"));
        }
        if !line.is_ascii() {
            return Err(IoError::protocol("slcan", "non-ASCII frame line"));
        }

        let (is_extended, is_rtr) = match bytes[0] {
            b't' => (false, false),
            b'T' => (true, false),
            b'r' => (false, true),
            b'R' => (true, true),
            c => {
                return Err(IoError::protocol(
                    "slcan",
                    format!("invalid frame prefix: '{}'", c as char),
                ))
            }
        };

        let id_len = if is_extended { 8 } else { 3 };
        let data_start = 1 + id_len + 1; // prefix + ID + DLC

        if bytes.len() < data_start {
            return Err(IoError::protocol(
                "slcan",
                format!(
                    "frame too short: {} bytes, need at least {}",
                    bytes.len(),
                    data_start
                ),
            ));
        }

        let id_str = &line[1..1 + id_len];
        if !id_str.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(IoError::protocol("slcan", format!("invalid hex ID: {}", id_str)));
        }
        let frame_id = u32::from_str_radix(id_str, 16)
            .map_err(|_| IoError::protocol("slcan", format!("invalid hex ID: {}", id_str)))?;

        let dlc_char = bytes[1 + id_len] as char;
        let dlc = dlc_char.to_digit(16).ok_or_else(|| {
            IoError::protocol("slcan", format!("invalid DLC character: '{}'", dlc_char))
        })? as usize;
        if dlc > MAX_DLC {
            return Err(IoError::protocol(
                "slcan",
                format!("invalid DLC: {} (max 8)", dlc),
            ));
        }

        // A remote request carries no data; its DLC becomes a zero-filled payload
        if is_rtr {
            return Frame::incoming(frame_id, &[0u8; MAX_DLC][..dlc], is_extended, true);
        }

        let expected_len = data_start + dlc * 2;
        if bytes.len() != expected_len {
            return Err(IoError::protocol(
                "slcan",
                format!("data is {} chars, DLC {} needs {}", bytes.len() - data_start, dlc, dlc * 2),
            ));
        }
        let data = hex::decode(&line[data_start..])
            .map_err(|e| IoError::protocol("slcan", format!("invalid hex data: {}", e)))?;

        Frame::incoming(frame_id, &data, is_extended, false)
    }

    /// Encode a CAN frame to slcan ASCII format.
    ///
    /// Returns ASCII bytes including trailing `\r`.
    fn encode(frame: &Frame) -> Result<Vec<u8>, IoError> {
        if frame.is_system() {
            return Err(IoError::InvalidFrame(format!(
                "system identifier 0x{:X} cannot go on the bus",
                frame.id()
            )));
        }

        let mut cmd = String::with_capacity(32);
        let prefix = match (frame.is_extended(), frame.is_rtr()) {
            (false, false) => 't',
            (true, false) => 'T',
            (false, true) => 'r',
            (true, true) => 'R',
        };
        cmd.push(prefix);
        if frame.is_extended() {
            cmd.push_str(&format!("{:08X}", frame.id()));
        } else {
            cmd.push_str(&format!("{:03X}", frame.id() & 0x7FF));
        }

        cmd.push_str(&format!("{:X}", frame.len()));
        if !frame.is_rtr() {
            cmd.push_str(&hex::encode_upper(frame.data()));
        }

        cmd.push('\r');
        Ok(cmd.into_bytes())
    }
}

/// `S0`..`S8` for a standard rate, `sXXYY` for a raw BTR0/BTR1 pair.
pub fn bitrate_command(bitrate: Bitrate) -> Result<String, IoError> {
    match bitrate {
        Bitrate::Registers { btr0, btr1 } => Ok(format!("s{:02X}{:02X}", btr0, btr1)),
        Bitrate::Rate(bps) => SLCAN_BITRATES
            .iter()
            .find(|(rate, _)| *rate == bps)
            .map(|(_, cmd)| cmd.to_string())
            .ok_or_else(|| {
                let valid: Vec<String> = SLCAN_BITRATES.iter().map(|(r, _)| format!("{}", r)).collect();
                IoError::configuration(format!(
                    "Invalid CAN bitrate {}. Valid bitrates: {} (or btr:XXYY)",
                    bps,
                    valid.join(", ")
                ))
            }),
    }
}

/// `M` (acceptance code) and `m` (acceptance mask) commands in SJA1000
/// single-filter layout. A set mask bit means "don't care" there, the
/// inverse of [`AcceptanceFilter::mask`].
pub fn acceptance_commands(filter: Option<AcceptanceFilter>, extended: bool) -> [String; 2] {
    let (code, mask) = match filter {
        None => (0, u32::MAX),
        Some(f) if extended => (f.code << 3, (!f.mask & 0x1FFF_FFFF) << 3 | 0x7),
        Some(f) => (f.code << 21, (!f.mask & 0x7FF) << 21 | 0x001F_FFFF),
    };
    [format!("M{:08X}", code), format!("m{:08X}", mask)]
}
