// src/io/combi/driver.rs
//
// CombiAdapter bring-up and typed control helpers.
//
// Open sequence:
//   close channel (idle) -> drain -> [version] -> bitrate -> open channel

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::io::adapter::{Driver, LinkAdapter};
use crate::io::codec::ControlResponse;
use crate::io::engine::Engine;
use crate::io::error::IoError;
use crate::io::link::Link;
use crate::io::traits::{traits_for_kind, AdapterTraits};
use crate::settings::{AdapterConfig, Bitrate};

use super::codec::encode_command;
use super::{
    CombiProtocol, CMD_ADC, CMD_ADC_FILTER, CMD_CAN_BITRATE, CMD_CAN_OPEN, CMD_EGT, CMD_VERSION,
};

/// Time for the device to stop streaming after the channel is closed
const IDLE_SETTLE: Duration = Duration::from_millis(50);

pub type CombiAdapter = LinkAdapter<CombiDriver>;

#[derive(Clone, Copy, Debug, Default)]
pub struct CombiDriver;

#[async_trait]
impl Driver for CombiDriver {
    type Protocol = CombiProtocol;

    fn kind(&self) -> &'static str {
        "combi"
    }

    fn traits(&self, _config: &AdapterConfig) -> AdapterTraits {
        traits_for_kind("combi")
    }

    fn protocol(&self, config: &AdapterConfig) -> Result<CombiProtocol, IoError> {
        if let Bitrate::Registers { .. } = config.bitrate {
            return Err(IoError::configuration(
                "combi takes a bit rate, not a BTR register pair",
            ));
        }
        Ok(CombiProtocol)
    }

    #[cfg(not(target_os = "ios"))]
    fn connect(&self, config: &AdapterConfig) -> Result<Arc<dyn Link>, IoError> {
        // `port` optionally selects a device by USB serial number
        let serial = Some(config.port.as_str()).filter(|s| !s.is_empty());
        let link = crate::io::usb::UsbLink::open(super::USB_ENDPOINTS, serial)?;
        Ok(Arc::new(link))
    }

    #[cfg(target_os = "ios")]
    fn connect(&self, _config: &AdapterConfig) -> Result<Arc<dyn Link>, IoError> {
        Err(IoError::unsupported("combi", "USB on this platform"))
    }

    async fn prepare(&self, link: &dyn Link, config: &AdapterConfig) -> Result<(), IoError> {
        // A previous session may have left the channel open and streaming
        let close = encode_command(CMD_CAN_OPEN, &[0])?;
        link.write(&close, config.write_timeout())
            .map_err(|e| IoError::write(link.name(), e.to_string()))?;
        tokio::time::sleep(IDLE_SETTLE).await;
        link.clear_input()
            .map_err(|e| IoError::connection(link.name(), format!("drain: {}", e)))
    }

    async fn configure(&self, engine: &Engine, config: &AdapterConfig) -> Result<(), IoError> {
        if config.print_version {
            let version = firmware_version(engine).await?;
            tlog!("[{}] Firmware version {}", engine.device(), version);
        }

        let bps = config
            .bitrate
            .bps()
            .ok_or_else(|| IoError::unsupported(engine.device(), "BTR register bit rates"))?;
        control(engine, CMD_CAN_BITRATE, &bps.to_be_bytes()).await?;
        control(engine, CMD_CAN_OPEN, &[1]).await?;
        Ok(())
    }
}

/// One correlated exchange; the device answers with the command's own code.
async fn control(engine: &Engine, command: u8, payload: &[u8]) -> Result<ControlResponse, IoError> {
    let bytes = encode_command(command, payload)?;
    engine.command(command, command, bytes, None).await
}

async fn firmware_version(engine: &Engine) -> Result<String, IoError> {
    let resp = control(engine, CMD_VERSION, &[]).await?;
    match resp.payload.as_slice() {
        [major, minor, ..] => Ok(format!("{}.{}", major, minor)),
        other => Err(IoError::protocol(
            engine.device(),
            format!("version reply of {} bytes", other.len()),
        )),
    }
}

fn f32_reply(engine: &Engine, resp: &ControlResponse) -> Result<f32, IoError> {
    // Value is the trailing 4 bytes; some firmware echoes the channel first
    let payload = &resp.payload;
    if payload.len() < 4 {
        return Err(IoError::protocol(
            engine.device(),
            format!("command 0x{:02X}: reply of {} bytes", resp.command, payload.len()),
        ));
    }
    let tail = &payload[payload.len() - 4..];
    Ok(f32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]))
}

fn filter_reply(engine: &Engine, channel: u8, resp: &ControlResponse) -> Result<bool, IoError> {
    match resp.payload.as_slice() {
        [ch, flag] if *ch == channel => Ok(*flag != 0),
        other => Err(IoError::protocol(
            engine.device(),
            format!("ADC filter reply {:02X?} for channel {}", other, channel),
        )),
    }
}

// ============================================================================
// Typed helpers
// ============================================================================

impl LinkAdapter<CombiDriver> {
    /// Firmware version as `major.minor`
    pub async fn firmware_version(&self) -> Result<String, IoError> {
        let engine = self.engine()?;
        firmware_version(&engine).await
    }

    /// Whether the input filter of ADC `channel` is enabled.
    pub async fn adc_filter(&self, channel: u8) -> Result<bool, IoError> {
        let engine = self.engine()?;
        let resp = control(&engine, CMD_ADC_FILTER, &[channel]).await?;
        filter_reply(&engine, channel, &resp)
    }

    pub async fn set_adc_filter(&self, channel: u8, enabled: bool) -> Result<bool, IoError> {
        let engine = self.engine()?;
        let resp = control(&engine, CMD_ADC_FILTER, &[channel, enabled as u8]).await?;
        filter_reply(&engine, channel, &resp)
    }

    /// ADC `channel` reading in volts.
    pub async fn read_adc(&self, channel: u8) -> Result<f32, IoError> {
        let engine = self.engine()?;
        let resp = control(&engine, CMD_ADC, &[channel]).await?;
        f32_reply(&engine, &resp)
    }

    /// Exhaust gas temperature in degrees Celsius.
    pub async fn read_egt(&self) -> Result<f32, IoError> {
        let engine = self.engine()?;
        let resp = control(&engine, CMD_EGT, &[]).await?;
        f32_reply(&engine, &resp)
    }
}
