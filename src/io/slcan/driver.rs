// src/io/slcan/driver.rs
//
// slcan bring-up: close -> drain -> [V, N] -> bitrate -> [M, m] -> O (or L).
// Every command is acknowledged with a bare CR, or BELL on error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::io::adapter::{Driver, LinkAdapter};
use crate::io::codec::ControlResponse;
use crate::io::engine::Engine;
use crate::io::error::IoError;
use crate::io::link::Link;
use crate::io::traits::{traits_for_kind, AdapterTraits};
use crate::io::AcceptanceFilter;
use crate::settings::AdapterConfig;

use super::codec::{acceptance_commands, bitrate_command};
use super::parser::OK_RESPONSE;
use super::SlcanProtocol;

/// Time for the device to settle after closing the channel
const CLOSE_SETTLE: Duration = Duration::from_millis(50);

pub type SlcanAdapter = LinkAdapter<SlcanDriver>;

#[derive(Clone, Copy, Debug, Default)]
pub struct SlcanDriver;

/// `mode = "silent"` opens the channel listen-only.
fn listen_only(config: &AdapterConfig) -> bool {
    config
        .option("mode")
        .is_some_and(|mode| mode.eq_ignore_ascii_case("silent"))
}

/// Send one command line and wait for the reply tagged `expects`.
async fn line(engine: &Engine, command: &str, expects: u8) -> Result<ControlResponse, IoError> {
    let code = command.as_bytes().first().copied().unwrap_or(OK_RESPONSE);
    let mut bytes = command.as_bytes().to_vec();
    bytes.push(b'\r');
    engine.command(code, expects, bytes, None).await
}

async fn open_channel(engine: &Engine, config: &AdapterConfig) -> Result<(), IoError> {
    let command = if listen_only(config) { "L" } else { "O" };
    line(engine, command, OK_RESPONSE).await?;
    Ok(())
}

async fn apply_filter(engine: &Engine, ids: &[u32], extended: bool) -> Result<(), IoError> {
    let filter = AcceptanceFilter::from_ids(ids, extended);
    for command in acceptance_commands(filter, extended) {
        line(engine, &command, OK_RESPONSE).await?;
    }
    Ok(())
}

#[async_trait]
impl Driver for SlcanDriver {
    type Protocol = SlcanProtocol;

    fn kind(&self) -> &'static str {
        "slcan"
    }

    fn traits(&self, config: &AdapterConfig) -> AdapterTraits {
        let mut traits = traits_for_kind("slcan");
        traits.can_transmit = !listen_only(config);
        traits
    }

    fn protocol(&self, config: &AdapterConfig) -> Result<SlcanProtocol, IoError> {
        // Reject unsupported rates before the port is touched
        bitrate_command(config.bitrate)?;
        Ok(SlcanProtocol::new(listen_only(config)))
    }

    #[cfg(not(target_os = "ios"))]
    fn connect(&self, config: &AdapterConfig) -> Result<Arc<dyn Link>, IoError> {
        Ok(Arc::new(crate::io::serial::SerialLink::open(config)?))
    }

    #[cfg(target_os = "ios")]
    fn connect(&self, _config: &AdapterConfig) -> Result<Arc<dyn Link>, IoError> {
        Err(IoError::unsupported("slcan", "serial ports on this platform"))
    }

    async fn prepare(&self, link: &dyn Link, config: &AdapterConfig) -> Result<(), IoError> {
        // Close the channel in case it was left open
        link.write(b"C\r", config.write_timeout())
            .map_err(|e| IoError::write(link.name(), e.to_string()))?;
        tokio::time::sleep(CLOSE_SETTLE).await;
        link.clear_input()
            .map_err(|e| IoError::connection(link.name(), format!("drain: {}", e)))
    }

    async fn configure(&self, engine: &Engine, config: &AdapterConfig) -> Result<(), IoError> {
        if config.print_version {
            let version = line(engine, "V", b'V').await?;
            let serial = line(engine, "N", b'N').await?;
            tlog!(
                "[{}] Firmware version {}, serial {}",
                engine.device(),
                version.text(),
                serial.text()
            );
        }

        line(engine, &bitrate_command(config.bitrate)?, OK_RESPONSE).await?;
        if !config.filter_ids.is_empty() {
            apply_filter(engine, &config.filter_ids, config.extended).await?;
        }
        open_channel(engine, config).await
    }

    /// The acceptance registers can only be written while the channel is
    /// closed, so the channel is cycled.
    async fn set_filter(&self, engine: &Engine, ids: &[u32], config: &AdapterConfig) -> Result<(), IoError> {
        line(engine, "C", OK_RESPONSE).await?;
        apply_filter(engine, ids, config.extended).await?;
        open_channel(engine, config).await
    }
}

impl LinkAdapter<SlcanDriver> {
    /// Hardware and firmware version, e.g. `1013`
    pub async fn version(&self) -> Result<String, IoError> {
        let engine = self.engine()?;
        Ok(line(&engine, "V", b'V').await?.text())
    }

    pub async fn serial_number(&self) -> Result<String, IoError> {
        let engine = self.engine()?;
        Ok(line(&engine, "N", b'N').await?.text())
    }

    /// Status flags (`F` command): bus errors, overruns, error passive.
    pub async fn status(&self) -> Result<u8, IoError> {
        let engine = self.engine()?;
        let text = line(&engine, "F", b'F').await?.text();
        u8::from_str_radix(&text, 16)
            .map_err(|_| IoError::protocol(engine.device(), format!("status reply '{}'", text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::traits::{Adapter, AdapterState};
    use crate::io::link::MemoryLink;
    use crate::io::types::ErrorEvent;
    use crate::io::Frame;
    use std::thread::JoinHandle;
    use tokio_util::sync::CancellationToken;

    type Reply = Box<dyn Fn(&str) -> Option<Vec<u8>> + Send>;

    /// Scripted device: splits host bytes into CR-terminated lines and answers
    /// each through `reply`. Returns the lines once the host closes the link.
    fn spawn_device(device: Arc<MemoryLink>, reply: Reply) -> JoinHandle<Vec<String>> {
        std::thread::spawn(move || {
            let mut seen = Vec::new();
            let mut pending = Vec::new();
            let mut buf = [0u8; 256];
            loop {
                match device.read(&mut buf, Duration::from_millis(20)) {
                    Ok(0) => {}
                    Ok(n) => {
                        for &byte in &buf[..n] {
                            if byte != b'\r' {
                                pending.push(byte);
                                continue;
                            }
                            let text = String::from_utf8_lossy(&pending).into_owned();
                            pending.clear();
                            if let Some(out) = reply(&text) {
                                let _ = device.write(&out, Duration::ZERO);
                            }
                            seen.push(text);
                        }
                    }
                    Err(_) => break,
                }
            }
            seen
        })
    }

    fn healthy() -> Reply {
        Box::new(|line| {
            let out: &[u8] = match line.as_bytes().first() {
                Some(b'V') => b"V1013\r",
                Some(b'N') => b"NA1B2\r",
                Some(b'F') => b"F04\r",
                Some(b't') | Some(b'r') => b"z\r",
                Some(b'T') | Some(b'R') => b"Z\r",
                _ => b"\r",
            };
            Some(out.to_vec())
        })
    }

    fn config() -> AdapterConfig {
        let mut config = AdapterConfig::new("/dev/ttyTEST");
        config.command_timeout_ms = 1000;
        config.read_timeout_ms = 5;
        config
    }

    fn adapter(config: AdapterConfig, reply: Reply) -> (SlcanAdapter, Arc<MemoryLink>, JoinHandle<Vec<String>>) {
        let (host, device) = MemoryLink::pair();
        let device = Arc::new(device);
        let handle = spawn_device(device.clone(), reply);
        let adapter = LinkAdapter::with_link(SlcanDriver, config, Arc::new(host)).unwrap();
        (adapter, device, handle)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_sequence_with_filter_and_version() {
        let mut config = config().with_filter(&[0x7E8]);
        config.print_version = true;
        let (adapter, _device, script) = adapter(config, healthy());
        assert_eq!(adapter.name(), "slcan(/dev/ttyTEST)");

        adapter.open(CancellationToken::new()).await.unwrap();
        assert_eq!(adapter.version().await.unwrap(), "1013");
        assert_eq!(adapter.serial_number().await.unwrap(), "A1B2");
        assert_eq!(adapter.status().await.unwrap(), 0x04);
        adapter.close().await.unwrap();

        assert_eq!(
            script.join().unwrap(),
            vec!["C", "V", "N", "S6", "MFD000000", "m001FFFFF", "O", "V", "N", "F", "C"]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_frames_both_ways() {
        let (adapter, device, _script) = adapter(config(), healthy());
        adapter.open(CancellationToken::new()).await.unwrap();

        let mut sub = adapter.subscribe(&[0x7E8]).unwrap();
        device.write(b"t1231FF\rt7E8203AA\r", Duration::ZERO).unwrap();
        let frame = sub.recv_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(frame, Frame::incoming(0x7E8, &[0x03, 0xAA], false, false).unwrap());

        let request = Frame::new(0x7E0, &[0x02, 0x3E, 0x00]).unwrap();
        adapter.sender().unwrap().send(request).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(adapter.stats().frames_tx, 1);
        adapter.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_listen_only_mode() {
        let config = config().with_option("mode", "silent");
        let (adapter, _device, script) = adapter(config, healthy());
        assert!(!adapter.traits().can_transmit);

        adapter.open(CancellationToken::new()).await.unwrap();
        let mut errors = adapter.errors().unwrap();
        adapter
            .sender()
            .unwrap()
            .send(Frame::new(0x100, &[]).unwrap())
            .unwrap();
        let event = errors.recv().await.unwrap();
        assert!(matches!(event, ErrorEvent::Link(IoError::Unsupported { .. })));
        assert_eq!(adapter.state(), AdapterState::Running);
        adapter.close().await.unwrap();

        let seen = script.join().unwrap();
        assert_eq!(seen, vec!["C", "S6", "L", "C"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bell_rejects_bitrate() {
        let reply: Reply = Box::new(|line| {
            if line.starts_with('S') {
                Some(vec![0x07])
            } else {
                Some(b"\r".to_vec())
            }
        });
        let (adapter, _device, script) = adapter(config(), reply);
        let err = adapter.open(CancellationToken::new()).await.unwrap_err();
        match err {
            IoError::OpenFailed { stage, cause, .. } => {
                assert_eq!(stage, "configure");
                assert!(matches!(*cause, IoError::Rejected { command: b'S', .. }));
            }
            other => panic!("unexpected {}", other),
        }
        assert_eq!(adapter.state(), AdapterState::Closed);
        // Teardown still sends the close command
        assert_eq!(script.join().unwrap(), vec!["C", "S6", "C"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_set_filter_cycles_channel() {
        let (adapter, _device, script) = adapter(config(), healthy());
        adapter.open(CancellationToken::new()).await.unwrap();
        adapter.set_filter(&[0x7E8, 0x7E9]).await.unwrap();
        adapter.close().await.unwrap();

        assert_eq!(
            script.join().unwrap(),
            vec!["C", "S6", "O", "C", "MFD000000", "m003FFFFF", "O", "C"]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_parent_cancel_reports_closed() {
        let (adapter, _device, script) = adapter(config(), healthy());
        let parent = CancellationToken::new();
        adapter.open(parent.clone()).await.unwrap();
        let mut sub = adapter.subscribe(&[]).unwrap();
        let before = adapter.stats();

        parent.cancel();
        assert!(sub.recv().await.is_none());
        assert_eq!(adapter.state(), AdapterState::Closed);
        assert!(matches!(adapter.sender(), Err(IoError::Closed { .. })));
        assert!(matches!(adapter.version().await, Err(IoError::Closed { .. })));
        assert_eq!(adapter.stats().frames_rx, before.frames_rx);

        // Close still releases the link and sends the close command
        adapter.close().await.unwrap();
        assert_eq!(adapter.state(), AdapterState::Closed);
        assert_eq!(script.join().unwrap(), vec!["C", "S6", "O", "C"]);
    }

    #[tokio::test]
    async fn test_unsupported_bitrate_fails_before_link() {
        let config = config().with_bitrate(crate::settings::Bitrate::Rate(33_300));
        let (host, device) = MemoryLink::pair();
        let adapter = LinkAdapter::with_link(SlcanDriver, config, Arc::new(host)).unwrap();
        let err = adapter.open(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, IoError::OpenFailed { stage: "protocol", .. }));
        assert!(device.take_pending().is_empty());
    }
}
