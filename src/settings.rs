// src/settings.rs
//
// Adapter configuration: one immutable snapshot per adapter instance,
// loadable from TOML.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::io::{IoError, CAN_EFF_MASK, CAN_SFF_MASK};

// ============================================================================
// Bitrate
// ============================================================================

/// CAN bus bit rate: a plain rate or a raw SJA1000-style BTR0/BTR1 pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bitrate {
    /// Bits per second
    Rate(u32),
    Registers { btr0: u8, btr1: u8 },
}

impl Bitrate {
    pub fn kbps(kbit: u32) -> Self {
        Bitrate::Rate(kbit * 1000)
    }

    /// Rate in bit/s, or `None` for a raw register pair.
    pub fn bps(&self) -> Option<u32> {
        match self {
            Bitrate::Rate(bps) => Some(*bps),
            Bitrate::Registers { .. } => None,
        }
    }

    fn from_kbit(kbit: f64) -> Result<Self, IoError> {
        let bps = (kbit * 1000.0).round();
        if !(1.0..=1_000_000.0).contains(&bps) {
            return Err(IoError::configuration(format!(
                "bitrate {} kbit/s out of range",
                kbit
            )));
        }
        Ok(Bitrate::Rate(bps as u32))
    }
}

impl Default for Bitrate {
    fn default() -> Self {
        Bitrate::Rate(500_000)
    }
}

impl FromStr for Bitrate {
    type Err = IoError;

    /// Accepts `500`, `33.3`, `500k`, `1M` (kbit/s unless suffixed) or `btr:CB9A`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if let Some(regs) = s.strip_prefix("btr:") {
            let bytes = hex::decode(regs)
                .map_err(|e| IoError::configuration(format!("bad BTR pair '{}': {}", regs, e)))?;
            return match bytes.as_slice() {
                [btr0, btr1] => Ok(Bitrate::Registers {
                    btr0: *btr0,
                    btr1: *btr1,
                }),
                _ => Err(IoError::configuration(format!(
                    "BTR pair '{}' must be exactly 4 hex digits",
                    regs
                ))),
            };
        }

        let (number, scale) = if let Some(n) = s.strip_suffix('m') {
            (n, 1000.0)
        } else if let Some(n) = s.strip_suffix('k') {
            (n, 1.0)
        } else {
            (s.as_str(), 1.0)
        };
        let value: f64 = number
            .trim()
            .parse()
            .map_err(|_| IoError::configuration(format!("bad bitrate '{}'", s)))?;
        Bitrate::from_kbit(value * scale)
    }
}

impl fmt::Display for Bitrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bitrate::Rate(bps) if bps % 1000 == 0 => write!(f, "{}k", bps / 1000),
            Bitrate::Rate(bps) => write!(f, "{}k", *bps as f64 / 1000.0),
            Bitrate::Registers { btr0, btr1 } => write!(f, "btr:{:02X}{:02X}", btr0, btr1),
        }
    }
}

impl Serialize for Bitrate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Bitrate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BitrateVisitor;

        impl<'de> Visitor<'de> for BitrateVisitor {
            type Value = Bitrate;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a bitrate in kbit/s, a string like \"500k\", or \"btr:XXYY\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Bitrate, E> {
                Bitrate::from_kbit(v as f64).map_err(E::custom)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Bitrate, E> {
                Bitrate::from_kbit(v as f64).map_err(E::custom)
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Bitrate, E> {
                Bitrate::from_kbit(v).map_err(E::custom)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Bitrate, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(BitrateVisitor)
    }
}

// ============================================================================
// Serial framing
// ============================================================================

/// Parity setting for serial port configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

// ============================================================================
// AdapterConfig
// ============================================================================

/// Configuration snapshot for one adapter. Read-only once the adapter is built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM3"); empty for USB auto-detect
    #[serde(default)]
    pub port: String,
    /// Serial baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// CAN bus bit rate
    #[serde(default)]
    pub bitrate: Bitrate,
    /// Identifiers to accept in hardware; empty = everything
    #[serde(default)]
    pub filter_ids: Vec<u32>,
    /// Use 29-bit identifiers
    #[serde(default)]
    pub extended: bool,
    /// Verbose wire logging
    #[serde(default)]
    pub debug: bool,
    /// Query and log the firmware version on open
    #[serde(default)]
    pub print_version: bool,
    /// Adapter-specific overrides (e.g. `mode = "silent"`, `protocol = "6"`)
    #[serde(default)]
    pub options: HashMap<String, String>,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    /// Capacity of the outgoing frame queue
    #[serde(default = "default_send_queue")]
    pub send_queue: usize,
    /// Default capacity of each subscriber's delivery queue
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
    /// Per-read timeout of the receive task; bounds cancellation latency
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Default wait for a control response
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

fn default_baud_rate() -> u32 { 115_200 }
fn default_data_bits() -> u8 { 8 }
fn default_stop_bits() -> u8 { 1 }
fn default_send_queue() -> usize { 64 }
fn default_subscriber_queue() -> usize { 128 }
fn default_read_timeout_ms() -> u64 { 20 }
fn default_write_timeout_ms() -> u64 { 100 }
fn default_command_timeout_ms() -> u64 { 250 }

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: default_baud_rate(),
            bitrate: Bitrate::default(),
            filter_ids: Vec::new(),
            extended: false,
            debug: false,
            print_version: false,
            options: HashMap::new(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::None,
            send_queue: default_send_queue(),
            subscriber_queue: default_subscriber_queue(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl AdapterConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Self::default()
        }
    }

    pub fn with_bitrate(mut self, bitrate: Bitrate) -> Self {
        self.bitrate = bitrate;
        self
    }

    pub fn with_filter(mut self, ids: &[u32]) -> Self {
        self.filter_ids = ids.to_vec();
        self
    }

    pub fn with_option(mut self, key: &str, value: &str) -> Self {
        self.options.insert(key.to_string(), value.to_string());
        self
    }

    /// Vendor override, matched case-insensitively on the key.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Check the snapshot once, before an adapter is built from it.
    pub fn validate(&self) -> Result<(), IoError> {
        if self.send_queue == 0 || self.subscriber_queue == 0 {
            return Err(IoError::configuration("queue capacities must be at least 1"));
        }
        if self.read_timeout_ms == 0 {
            return Err(IoError::configuration("read_timeout_ms must be positive"));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(IoError::configuration(format!(
                "data_bits {} (expected 5-8)",
                self.data_bits
            )));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(IoError::configuration(format!(
                "stop_bits {} (expected 1 or 2)",
                self.stop_bits
            )));
        }
        let max_id = if self.extended { CAN_EFF_MASK } else { CAN_SFF_MASK };
        if let Some(bad) = self.filter_ids.iter().find(|&&id| id > max_id) {
            return Err(IoError::configuration(format!(
                "filter id 0x{:X} exceeds 0x{:X}",
                bad, max_id
            )));
        }
        Ok(())
    }

    pub fn from_toml_str(text: &str) -> Result<Self, IoError> {
        let config: AdapterConfig = toml::from_str(text)
            .map_err(|e| IoError::configuration(format!("invalid adapter config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, IoError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            IoError::configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }
}

/// A config file that also names the registry entry to build.
///
/// ```toml
/// adapter = "slcan"
/// port = "/dev/ttyACM0"
/// bitrate = "500k"
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdapterFile {
    pub adapter: String,
    #[serde(flatten)]
    pub config: AdapterConfig,
}

impl AdapterFile {
    pub fn from_toml_str(text: &str) -> Result<Self, IoError> {
        let file: AdapterFile = toml::from_str(text)
            .map_err(|e| IoError::configuration(format!("invalid adapter file: {}", e)))?;
        file.config.validate()?;
        Ok(file)
    }

    pub fn load(path: &Path) -> Result<Self, IoError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            IoError::configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitrate_forms() {
        assert_eq!("500".parse::<Bitrate>().unwrap(), Bitrate::Rate(500_000));
        assert_eq!("500k".parse::<Bitrate>().unwrap(), Bitrate::Rate(500_000));
        assert_eq!("1M".parse::<Bitrate>().unwrap(), Bitrate::Rate(1_000_000));
        assert_eq!("33.3".parse::<Bitrate>().unwrap(), Bitrate::Rate(33_300));
        assert_eq!("47.619".parse::<Bitrate>().unwrap(), Bitrate::Rate(47_619));
        assert_eq!(
            "btr:CB9A".parse::<Bitrate>().unwrap(),
            Bitrate::Registers { btr0: 0xCB, btr1: 0x9A }
        );
        assert!("btr:CB".parse::<Bitrate>().is_err());
        assert!("fast".parse::<Bitrate>().is_err());
        assert!("0".parse::<Bitrate>().is_err());
        assert!("2M".parse::<Bitrate>().is_err());
    }

    #[test]
    fn test_bitrate_display() {
        assert_eq!(Bitrate::Rate(125_000).to_string(), "125k");
        assert_eq!(Bitrate::Rate(33_300).to_string(), "33.3k");
        assert_eq!(Bitrate::Registers { btr0: 0x03, btr1: 0x1C }.to_string(), "btr:031C");
    }

    #[test]
    fn test_toml_defaults() {
        let config = AdapterConfig::from_toml_str("port = \"/dev/ttyUSB0\"").unwrap();
        assert_eq!(config.port, "/dev/ttyUSB0");
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.bitrate, Bitrate::Rate(500_000));
        assert_eq!(config.send_queue, 64);
        assert_eq!(config.command_timeout(), Duration::from_millis(250));
        assert_eq!(config.parity, Parity::None);
    }

    #[test]
    fn test_toml_full() {
        let text = r#"
            port = "COM3"
            bitrate = 250
            filter_ids = [0x7E8, 0x7E9]
            debug = true
            print_version = true
            parity = "even"

            [options]
            mode = "silent"
        "#;
        let config = AdapterConfig::from_toml_str(text).unwrap();
        assert_eq!(config.bitrate, Bitrate::Rate(250_000));
        assert_eq!(config.filter_ids, vec![0x7E8, 0x7E9]);
        assert!(config.debug && config.print_version);
        assert_eq!(config.parity, Parity::Even);
        assert_eq!(config.option("MODE"), Some("silent"));
    }

    #[test]
    fn test_adapter_file() {
        let text = "adapter = \"obdlink\"\nport = \"/dev/ttyUSB1\"\nbitrate = \"btr:031C\"\n";
        let file = AdapterFile::from_toml_str(text).unwrap();
        assert_eq!(file.adapter, "obdlink");
        assert_eq!(file.config.port, "/dev/ttyUSB1");
        assert_eq!(file.config.bitrate, Bitrate::Registers { btr0: 0x03, btr1: 0x1C });
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AdapterConfig::new("COM1").with_filter(&[0x800]);
        assert!(config.validate().is_err());
        config.extended = true;
        assert!(config.validate().is_ok());

        let zero_queue = AdapterConfig {
            send_queue: 0,
            ..AdapterConfig::default()
        };
        assert!(zero_queue.validate().is_err());
        assert!(AdapterConfig::from_toml_str("data_bits = 9").is_err());
    }
}
