// src/io/traits.rs
//
// The adapter capability set every backend exposes, and the static traits
// describing what each adapter kind can do.

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::error::IoError;
use super::hub::Subscription;
use super::types::{ErrorStream, FrameSender, StatsSnapshot};

/// Adapter lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterState {
    Closed,
    Opening,
    Running,
    Closing,
}

/// Physical transport under an adapter
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Usb,
    Serial,
    /// External vendor library behind a call contract
    PassThru,
    Memory,
}

/// What an adapter kind supports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AdapterTraits {
    pub transport: Transport,
    /// Whether the adapter can transmit frames
    pub can_transmit: bool,
    /// Whether `set_filter` is implemented
    pub supports_filter: bool,
    /// Whether 29-bit identifiers can be sent and received
    pub supports_extended: bool,
    /// Whether frames may carry a response-wait count
    pub supports_response_wait: bool,
}

/// Get adapter traits for a registry kind.
pub fn traits_for_kind(kind: &str) -> AdapterTraits {
    match kind {
        "combi" => AdapterTraits {
            transport: Transport::Usb,
            can_transmit: true,
            supports_filter: false,
            supports_extended: true,
            supports_response_wait: false,
        },
        "slcan" | "canusb" => AdapterTraits {
            transport: Transport::Serial,
            can_transmit: true, // Note: mode=silent overrides this at runtime
            supports_filter: true,
            supports_extended: true,
            supports_response_wait: false,
        },
        "obdlink" | "stn" => AdapterTraits {
            transport: Transport::Serial,
            can_transmit: true,
            supports_filter: true,
            supports_extended: true,
            supports_response_wait: true,
        },
        "passthru" | "j2534" => AdapterTraits {
            transport: Transport::PassThru,
            can_transmit: true,
            supports_filter: true,
            supports_extended: true,
            supports_response_wait: false,
        },
        _ => AdapterTraits {
            transport: Transport::Memory,
            can_transmit: false,
            supports_filter: false,
            supports_extended: false,
            supports_response_wait: false,
        },
    }
}

/// Duplex CAN frame interface over one physical adapter.
///
/// All methods take `&self` so one adapter can be shared behind an `Arc` and
/// closed from any task.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Device name used in logs and errors, e.g. `slcan(/dev/ttyACM0)`
    fn name(&self) -> &str;

    fn traits(&self) -> AdapterTraits;

    fn state(&self) -> AdapterState;

    /// Acquire the link, bring the device up and start the I/O tasks.
    /// On failure everything acquired so far has been released.
    async fn open(&self, cancel: CancellationToken) -> Result<(), IoError>;

    /// Tear down. Idempotent: later or concurrent calls return `Ok(())`.
    async fn close(&self) -> Result<(), IoError>;

    /// Outgoing queue handle
    fn sender(&self) -> Result<FrameSender, IoError>;

    /// Incoming frames matching `filter` (empty = all)
    fn subscribe(&self, filter: &[u32]) -> Result<Subscription, IoError>;

    /// Adapter-wide error events
    fn errors(&self) -> Result<ErrorStream, IoError>;

    /// Apply a hardware acceptance filter (if supported).
    async fn set_filter(&self, _ids: &[u32]) -> Result<(), IoError> {
        Err(IoError::unsupported(self.name(), "hardware filtering"))
    }

    fn stats(&self) -> StatsSnapshot;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aliases_share_traits() {
        assert_eq!(traits_for_kind("slcan"), traits_for_kind("canusb"));
        assert_eq!(traits_for_kind("obdlink"), traits_for_kind("stn"));
    }

    #[test]
    fn test_combi_has_no_filter() {
        let combi = traits_for_kind("combi");
        assert_eq!(combi.transport, Transport::Usb);
        assert!(!combi.supports_filter);
        assert!(traits_for_kind("obdlink").supports_response_wait);
    }

    #[test]
    fn test_unknown_kind_cannot_transmit() {
        assert!(!traits_for_kind("nope").can_transmit);
    }
}
