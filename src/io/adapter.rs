// src/io/adapter.rs
//
// Adapter lifecycle for link-based backends (USB and serial).
//
// Open:  link -> prepare (idle + drain) -> engine -> configure (correlated
//        bring-up commands). A failure at any step releases what the earlier
//        steps acquired, newest first.
// Close: one-shot under the state lock; the engine does the ordered teardown.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::io::codec::WireProtocol;
use crate::io::engine::{Engine, EngineOptions};
use crate::io::error::IoError;
use crate::io::hub::Subscription;
use crate::io::link::Link;
use crate::io::traits::{Adapter, AdapterState, AdapterTraits};
use crate::io::types::{ErrorStream, FrameSender, StatsSnapshot};
use crate::settings::AdapterConfig;

/// Opens the link for an adapter. Replaceable so tests can inject a
/// `MemoryLink`.
pub type LinkFactory = Box<dyn Fn(&AdapterConfig) -> Result<Arc<dyn Link>, IoError> + Send + Sync>;

/// Protocol-specific part of a link adapter.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    type Protocol: WireProtocol;

    /// Registry kind, e.g. "slcan"
    fn kind(&self) -> &'static str;

    fn traits(&self, config: &AdapterConfig) -> AdapterTraits;

    fn protocol(&self, config: &AdapterConfig) -> Result<Self::Protocol, IoError>;

    /// Open the physical link.
    fn connect(&self, config: &AdapterConfig) -> Result<Arc<dyn Link>, IoError>;

    /// Put the device into a known idle state and drain stale bytes, before
    /// the I/O tasks start.
    async fn prepare(&self, link: &dyn Link, _config: &AdapterConfig) -> Result<(), IoError> {
        link.clear_input()
            .map_err(|e| IoError::connection(link.name(), format!("drain: {}", e)))
    }

    /// Correlated bring-up (version, bitrate, filters, open channel), with the
    /// engine running.
    async fn configure(&self, engine: &Engine, config: &AdapterConfig) -> Result<(), IoError>;

    async fn set_filter(&self, engine: &Engine, _ids: &[u32], _config: &AdapterConfig) -> Result<(), IoError> {
        Err(IoError::unsupported(engine.device(), "hardware filtering"))
    }
}

struct Slot {
    state: AdapterState,
    engine: Option<Arc<Engine>>,
    /// Set by the first `close`; the adapter cannot be reopened afterwards
    finished: bool,
}

impl Slot {
    /// The engine stopped on its own: link loss, a fatal write or the
    /// caller's cancellation token.
    fn stopped(&self) -> bool {
        self.state == AdapterState::Running
            && self.engine.as_ref().map_or(true, |e| !e.is_running())
    }

    fn observed_state(&self) -> AdapterState {
        if self.stopped() {
            AdapterState::Closed
        } else {
            self.state
        }
    }
}

pub struct LinkAdapter<D: Driver> {
    name: String,
    driver: D,
    config: AdapterConfig,
    /// Overrides `Driver::connect` when set
    factory: Option<LinkFactory>,
    slot: Mutex<Slot>,
}

impl<D: Driver> LinkAdapter<D> {
    /// Build an adapter that opens its link through the driver.
    pub fn new(driver: D, config: AdapterConfig) -> Result<Self, IoError> {
        config.validate()?;
        let name = device_name(driver.kind(), &config);
        Ok(Self {
            name,
            driver,
            config,
            factory: None,
            slot: Mutex::new(Slot {
                state: AdapterState::Closed,
                engine: None,
                finished: false,
            }),
        })
    }

    /// Build an adapter over an already-open link.
    pub fn with_link(driver: D, config: AdapterConfig, link: Arc<dyn Link>) -> Result<Self, IoError> {
        let mut adapter = Self::new(driver, config)?;
        adapter.factory = Some(Box::new(move |_| Ok(link.clone())));
        Ok(adapter)
    }

    /// Build an adapter whose link comes from `factory` instead of the driver.
    pub fn with_factory(driver: D, config: AdapterConfig, factory: LinkFactory) -> Result<Self, IoError> {
        let mut adapter = Self::new(driver, config)?;
        adapter.factory = Some(factory);
        Ok(adapter)
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// The running engine, for typed control helpers.
    pub fn engine(&self) -> Result<Arc<Engine>, IoError> {
        let slot = self.lock_slot()?;
        match (&slot.state, &slot.engine) {
            (AdapterState::Running, Some(engine)) if engine.is_running() => Ok(engine.clone()),
            _ => Err(IoError::closed(&self.name)),
        }
    }

    fn lock_slot(&self) -> Result<std::sync::MutexGuard<'_, Slot>, IoError> {
        self.slot
            .lock()
            .map_err(|_| IoError::protocol(&self.name, "adapter state poisoned"))
    }

    fn connect(&self) -> Result<Arc<dyn Link>, IoError> {
        match &self.factory {
            Some(factory) => factory(&self.config),
            None => self.driver.connect(&self.config),
        }
    }

    async fn bring_up(&self, cancel: &CancellationToken) -> Result<Arc<Engine>, IoError> {
        let protocol = self
            .driver
            .protocol(&self.config)
            .map_err(|e| IoError::open_failed(&self.name, "protocol", e))?;

        let link = self
            .connect()
            .map_err(|e| IoError::open_failed(&self.name, "link", e))?;

        if let Err(e) = self.driver.prepare(link.as_ref(), &self.config).await {
            link.close();
            return Err(IoError::open_failed(&self.name, "handshake", e));
        }

        let options = EngineOptions::from_config(self.name.clone(), &self.config);
        let engine = Arc::new(Engine::start(link, Arc::new(protocol), options, cancel));

        if let Err(e) = self.driver.configure(&engine, &self.config).await {
            // Stops both tasks, then releases the link
            engine.shutdown().await;
            return Err(IoError::open_failed(&self.name, "configure", e));
        }

        Ok(engine)
    }
}

/// `kind(port)`, or just `kind` for auto-detected USB devices.
pub(crate) fn device_name(kind: &str, config: &AdapterConfig) -> String {
    if config.port.is_empty() {
        kind.to_string()
    } else {
        format!("{}({})", kind, config.port)
    }
}

#[async_trait]
impl<D: Driver> Adapter for LinkAdapter<D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn traits(&self) -> AdapterTraits {
        self.driver.traits(&self.config)
    }

    fn state(&self) -> AdapterState {
        self.slot
            .lock()
            .map(|s| s.observed_state())
            .unwrap_or(AdapterState::Closed)
    }

    async fn open(&self, cancel: CancellationToken) -> Result<(), IoError> {
        let stale = {
            let mut slot = self.lock_slot()?;
            match slot.state {
                AdapterState::Closed if !slot.finished => {
                    slot.state = AdapterState::Opening;
                    None
                }
                AdapterState::Running if slot.stopped() && !slot.finished => {
                    slot.state = AdapterState::Opening;
                    slot.engine.take()
                }
                AdapterState::Closed => return Err(IoError::closed(&self.name)),
                other => {
                    return Err(IoError::configuration(format!(
                        "{} cannot open while {:?}",
                        self.name, other
                    )))
                }
            }
        };
        if let Some(engine) = stale {
            // Release the link the stopped engine still holds
            engine.shutdown().await;
        }

        tlog!("[{}] Opening", self.name);
        let result = self.bring_up(&cancel).await;

        let aborted = {
            let mut slot = self.lock_slot()?;
            match result {
                Ok(engine) if slot.state == AdapterState::Opening => {
                    slot.engine = Some(engine);
                    slot.state = AdapterState::Running;
                    tlog!("[{}] Running", self.name);
                    return Ok(());
                }
                // close() ran while we were opening
                Ok(engine) => engine,
                Err(e) => {
                    slot.state = AdapterState::Closed;
                    tlog!("[{}] {}", self.name, e);
                    return Err(e);
                }
            }
        };

        aborted.shutdown().await;
        if let Ok(mut slot) = self.slot.lock() {
            slot.state = AdapterState::Closed;
        }
        Err(IoError::closed(&self.name))
    }

    async fn close(&self) -> Result<(), IoError> {
        let engine = {
            let mut slot = self.lock_slot()?;
            if slot.finished {
                return Ok(());
            }
            slot.finished = true;
            match slot.state {
                AdapterState::Running => {
                    slot.state = AdapterState::Closing;
                    slot.engine.take()
                }
                AdapterState::Opening => {
                    // open() sees this and tears down what it built
                    slot.state = AdapterState::Closing;
                    None
                }
                _ => None,
            }
        };

        if let Some(engine) = engine {
            tlog!("[{}] Closing", self.name);
            engine.shutdown().await;
            if let Ok(mut slot) = self.slot.lock() {
                slot.state = AdapterState::Closed;
            }
            tlog!("[{}] Closed", self.name);
        }
        Ok(())
    }

    fn sender(&self) -> Result<FrameSender, IoError> {
        Ok(self.engine()?.sender())
    }

    fn subscribe(&self, filter: &[u32]) -> Result<Subscription, IoError> {
        self.engine()?.subscribe(filter)
    }

    fn errors(&self) -> Result<ErrorStream, IoError> {
        Ok(self.engine()?.errors())
    }

    async fn set_filter(&self, ids: &[u32]) -> Result<(), IoError> {
        let engine = self.engine()?;
        self.driver.set_filter(&engine, ids, &self.config).await
    }

    /// Counters stay readable after the engine stopped on its own.
    fn stats(&self) -> StatsSnapshot {
        self.slot
            .lock()
            .ok()
            .and_then(|s| s.engine.as_ref().map(|e| e.stats()))
            .unwrap_or_default()
    }
}
