// src/io/stn/driver.rs
//
// OBDLink / STN bring-up:
//   ATZ (wait for prompt) -> drain -> ATE0 -> ATH1 -> ATS0 -> ATSPn
//   -> [ATCF, ATCM] -> [STI]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::io::adapter::{Driver, LinkAdapter};
use crate::io::codec::ControlResponse;
use crate::io::engine::Engine;
use crate::io::error::{classify_read_error, IoError, ReadFault};
use crate::io::link::Link;
use crate::io::traits::{traits_for_kind, AdapterTraits};
use crate::io::AcceptanceFilter;
use crate::settings::{AdapterConfig, Bitrate};

use super::{StnProtocol, CODE_OK, CODE_TEXT};

/// ATZ restarts the firmware; the prompt can take this long to appear
const RESET_TIMEOUT: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub type StnAdapter = LinkAdapter<StnDriver>;

#[derive(Clone, Copy, Debug, Default)]
pub struct StnDriver;

/// `ATSP` protocol number: the `protocol` option, or ISO 15765-4 picked
/// from bit rate and identifier width.
fn protocol_number(config: &AdapterConfig) -> Result<String, IoError> {
    if let Some(protocol) = config.option("protocol") {
        return Ok(protocol.to_string());
    }
    let number = match (config.bitrate, config.extended) {
        (Bitrate::Rate(500_000), false) => "6",
        (Bitrate::Rate(500_000), true) => "7",
        (Bitrate::Rate(250_000), false) => "8",
        (Bitrate::Rate(250_000), true) => "9",
        (other, _) => {
            return Err(IoError::configuration(format!(
                "stn: no ISO 15765 protocol for {}; set option protocol=",
                other
            )))
        }
    };
    Ok(number.to_string())
}

async fn at(engine: &Engine, command: &str, expects: u8) -> Result<ControlResponse, IoError> {
    let code = command.as_bytes().first().copied().unwrap_or(b'A');
    let mut bytes = command.as_bytes().to_vec();
    bytes.push(b'\r');
    engine.command(code, expects, bytes, None).await
}

/// `ATCF`/`ATCM` in the identifier width in use. An empty list clears the
/// mask so everything passes.
async fn apply_filter(engine: &Engine, ids: &[u32], extended: bool) -> Result<(), IoError> {
    let filter = AcceptanceFilter::from_ids(ids, extended).unwrap_or(AcceptanceFilter { code: 0, mask: 0 });
    let (code, mask) = if extended {
        (format!("{:08X}", filter.code), format!("{:08X}", filter.mask))
    } else {
        (format!("{:03X}", filter.code), format!("{:03X}", filter.mask))
    };
    at(engine, &format!("ATCF{}", code), CODE_OK).await?;
    at(engine, &format!("ATCM{}", mask), CODE_OK).await?;
    Ok(())
}

/// Poll the link until the `>` prompt shows up.
async fn wait_for_prompt(link: &dyn Link, timeout: Duration) -> Result<(), IoError> {
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 64];
    loop {
        match link.read(&mut buf, Duration::ZERO) {
            Ok(n) if buf[..n].contains(&b'>') => return Ok(()),
            Ok(_) => {}
            Err(e) => match classify_read_error(&e) {
                ReadFault::Idle => {}
                _ => return Err(IoError::read_fatal(link.name(), e.to_string())),
            },
        }
        if Instant::now() >= deadline {
            return Err(IoError::timeout(link.name(), "prompt after ATZ", timeout));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[async_trait]
impl Driver for StnDriver {
    type Protocol = StnProtocol;

    fn kind(&self) -> &'static str {
        "obdlink"
    }

    fn traits(&self, _config: &AdapterConfig) -> AdapterTraits {
        traits_for_kind("obdlink")
    }

    fn protocol(&self, config: &AdapterConfig) -> Result<StnProtocol, IoError> {
        protocol_number(config)?;
        Ok(StnProtocol)
    }

    #[cfg(not(target_os = "ios"))]
    fn connect(&self, config: &AdapterConfig) -> Result<Arc<dyn Link>, IoError> {
        Ok(Arc::new(crate::io::serial::SerialLink::open(config)?))
    }

    #[cfg(target_os = "ios")]
    fn connect(&self, _config: &AdapterConfig) -> Result<Arc<dyn Link>, IoError> {
        Err(IoError::unsupported("obdlink", "serial ports on this platform"))
    }

    async fn prepare(&self, link: &dyn Link, config: &AdapterConfig) -> Result<(), IoError> {
        link.write(b"ATZ\r", config.write_timeout())
            .map_err(|e| IoError::write(link.name(), e.to_string()))?;
        wait_for_prompt(link, RESET_TIMEOUT).await?;
        link.clear_input()
            .map_err(|e| IoError::connection(link.name(), format!("drain: {}", e)))
    }

    async fn configure(&self, engine: &Engine, config: &AdapterConfig) -> Result<(), IoError> {
        // Echo off, headers on, spaces off
        for command in ["ATE0", "ATH1", "ATS0"] {
            at(engine, command, CODE_OK).await?;
        }
        at(engine, &format!("ATSP{}", protocol_number(config)?), CODE_OK).await?;
        if !config.filter_ids.is_empty() {
            apply_filter(engine, &config.filter_ids, config.extended).await?;
        }
        if config.print_version {
            let version = at(engine, "STI", CODE_TEXT).await?;
            tlog!("[{}] Firmware version {}", engine.device(), version.text());
        }
        Ok(())
    }

    async fn set_filter(&self, engine: &Engine, ids: &[u32], config: &AdapterConfig) -> Result<(), IoError> {
        apply_filter(engine, ids, config.extended).await
    }
}

impl LinkAdapter<StnDriver> {
    /// Firmware identification, e.g. `STN1110 v4.0.1`
    pub async fn version(&self) -> Result<String, IoError> {
        let engine = self.engine()?;
        Ok(at(&engine, "STI", CODE_TEXT).await?.text())
    }

    /// Supply voltage at the OBD connector.
    pub async fn voltage(&self) -> Result<f32, IoError> {
        let engine = self.engine()?;
        let text = at(&engine, "ATRV", CODE_TEXT).await?.text();
        text.trim_end_matches(|c| c == 'V' || c == 'v')
            .parse()
            .map_err(|_| IoError::protocol(engine.device(), format!("voltage reply '{}'", text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::link::MemoryLink;
    use crate::io::traits::{Adapter, AdapterState};
    use crate::io::types::ErrorEvent;
    use crate::io::{Frame, ProtocolError};
    use std::thread::JoinHandle;
    use tokio_util::sync::CancellationToken;

    type Reply = Box<dyn Fn(&str) -> String + Send>;

    /// Scripted device: answers each CR-terminated command line through
    /// `reply` and returns the lines once the host closes the link.
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
                            let _ = device.write(reply(&text).as_bytes(), Duration::ZERO);
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
            let body = match line {
                "ATZ" => "ATZ\r\r\rELM327 v1.4b",
                "ATE0" => "ATE0\rOK",
                "STI" => "STN1110 v4.0.1",
                "ATRV" => "12.6V",
                l if l.starts_with("STPXh:7E0") => "7E803410D00",
                l if l.starts_with("STPX") => "NO DATA",
                _ => "OK",
            };
            format!("{}\r\r>", body)
        })
    }

    fn config() -> AdapterConfig {
        let mut config = AdapterConfig::new("/dev/ttyOBD");
        config.command_timeout_ms = 1000;
        config.read_timeout_ms = 5;
        config
    }

    fn adapter(config: AdapterConfig, reply: Reply) -> (StnAdapter, Arc<MemoryLink>, JoinHandle<Vec<String>>) {
        let (host, device) = MemoryLink::pair();
        let device = Arc::new(device);
        let handle = spawn_device(device.clone(), reply);
        let adapter = LinkAdapter::with_link(StnDriver, config, Arc::new(host)).unwrap();
        (adapter, device, handle)
    }

    #[test]
    fn test_protocol_selection() {
        assert_eq!(protocol_number(&config()).unwrap(), "6");
        let mut ext = config().with_bitrate(Bitrate::kbps(250));
        ext.extended = true;
        assert_eq!(protocol_number(&ext).unwrap(), "9");
        let slow = config().with_bitrate(Bitrate::kbps(125));
        assert!(protocol_number(&slow).is_err());
        let forced = slow.with_option("PROTOCOL", "B");
        assert_eq!(protocol_number(&forced).unwrap(), "B");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_init_sequence() {
        let mut config = config().with_filter(&[0x7E8, 0x7E9]);
        config.print_version = true;
        let (adapter, _device, script) = adapter(config, healthy());

        adapter.open(CancellationToken::new()).await.unwrap();
        assert_eq!(adapter.state(), AdapterState::Running);
        assert_eq!(adapter.version().await.unwrap(), "STN1110 v4.0.1");
        assert_eq!(adapter.voltage().await.unwrap(), 12.6);
        adapter.close().await.unwrap();

        assert_eq!(
            script.join().unwrap(),
            vec![
                "ATZ", "ATE0", "ATH1", "ATS0", "ATSP6", "ATCF7E8", "ATCM7FE", "STI", "STI", "ATRV",
                "ATPC"
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_request_response_through_stpx() {
        let (adapter, _device, script) = adapter(config(), healthy());
        adapter.open(CancellationToken::new()).await.unwrap();
        let mut sub = adapter.subscribe(&[0x7E8]).unwrap();

        let sender = adapter.sender().unwrap();
        sender
            .send(Frame::new(0x7E0, &[0x02, 0x01, 0x0D]).unwrap().with_responses(1))
            .unwrap();
        sender.send(Frame::new(0x7DF, &[0x02, 0x01, 0x0D]).unwrap()).unwrap();

        let reply = sub.recv_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.data(), &[0x03, 0x41, 0x0D, 0x00]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(adapter.stats().frames_tx, 2);
        adapter.close().await.unwrap();

        let seen = script.join().unwrap();
        let stpx: Vec<&String> = seen.iter().filter(|l| l.starts_with("STPX")).collect();
        assert_eq!(stpx, vec!["STPXh:7E0,d:02010D,r:1", "STPXh:7DF,d:02010D"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_question_mark_rejects_command() {
        let reply: Reply = Box::new(|line| {
            let body = if line.starts_with("ATSP") { "?" } else { "OK" };
            format!("{}\r\r>", body)
        });
        let (adapter, _device, _script) = adapter(config(), reply);
        let err = adapter.open(CancellationToken::new()).await.unwrap_err();
        match err {
            IoError::OpenFailed { stage, cause, .. } => {
                assert_eq!(stage, "configure");
                assert!(matches!(*cause, IoError::Rejected { command: b'A', .. }));
            }
            other => panic!("unexpected {}", other),
        }
        assert_eq!(adapter.state(), AdapterState::Closed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_device_errors_do_not_stop_adapter() {
        let (adapter, device, _script) = adapter(config(), healthy());
        adapter.open(CancellationToken::new()).await.unwrap();
        let mut errors = adapter.errors().unwrap();

        device.write(b"CAN ERROR\r\r>", Duration::ZERO).unwrap();
        match errors.recv().await {
            Some(ErrorEvent::Protocol(ProtocolError::DeviceReported(text))) => {
                assert_eq!(text, "CAN ERROR")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(adapter.state(), AdapterState::Running);
        adapter.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_fails_handshake() {
        let (host, device) = MemoryLink::pair();
        let adapter = LinkAdapter::with_link(StnDriver, config(), Arc::new(host)).unwrap();

        let err = adapter.open(CancellationToken::new()).await.unwrap_err();
        match err {
            IoError::OpenFailed { stage, cause, .. } => {
                assert_eq!(stage, "handshake");
                assert!(cause.is_timeout());
            }
            other => panic!("unexpected {}", other),
        }
        // The link was released
        assert!(device.write(b">", Duration::ZERO).is_err());
    }
}
