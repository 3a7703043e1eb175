// src/io/passthru/adapter.rs
//
// Adapter over a pass-through library. Same two-task shape as the byte-stream
// engine, with messages instead of bytes: a blocking receive task polls
// `read_msgs` and feeds the hub, an async send task drains the send queue
// into `write_msgs`.
//
// Open:  open device -> connect channel -> install filters -> start tasks.
// Close: stop tasks -> stop filters -> disconnect -> close device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::io::adapter::device_name;
use crate::io::codec::ProtocolError;
use crate::io::engine::EngineOptions;
use crate::io::error::IoError;
use crate::io::hub::{Hub, Subscription};
use crate::io::traits::{traits_for_kind, Adapter, AdapterState, AdapterTraits};
use crate::io::types::{ErrorBus, ErrorEvent, ErrorStream, EngineStats, FrameSender, SendRequest, StatsSnapshot};
use crate::io::{Frame, CAN_EFF_MASK, CAN_SFF_MASK};
use crate::settings::AdapterConfig;

use super::{lift, FilterKind, PassThruApi, PassThruMsg, CAN_29BIT_ID, ERR_DEVICE_NOT_CONNECTED, PROTOCOL_CAN};

/// Messages requested per `read_msgs` call
const READ_BATCH: usize = 16;
/// Consecutive failed reads before the device is declared lost
const MAX_TRANSIENT_READ_ERRORS: u32 = 3;

/// Run a blocking library call off the async runtime.
async fn blocking<T, F>(device: &str, f: F) -> Result<T, IoError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| IoError::connection(device, format!("pass-through task failed: {}", e)))
}

/// Start one pass filter per identifier, or a single pass-all filter for an
/// empty list (the library blocks everything until a filter exists). Filters
/// started before a failure are stopped again.
fn install_filters(
    api: &dyn PassThruApi,
    device: &str,
    channel: u32,
    ids: &[u32],
    extended: bool,
) -> Result<Vec<u32>, IoError> {
    let width = if extended { CAN_EFF_MASK } else { CAN_SFF_MASK };
    let pairs: Vec<(u32, u32)> = if ids.is_empty() {
        vec![(0, 0)]
    } else {
        ids.iter().map(|&id| (width, id & width)).collect()
    };

    let mut started = Vec::with_capacity(pairs.len());
    for (mask, pattern) in pairs {
        let result = api.start_msg_filter(
            channel,
            FilterKind::Pass,
            &PassThruMsg::id_pattern(mask, extended),
            &PassThruMsg::id_pattern(pattern, extended),
        );
        match lift(device, "PassThruStartMsgFilter", result) {
            Ok(filter) => started.push(filter),
            Err(e) => {
                stop_filters(api, device, channel, &started);
                return Err(e);
            }
        }
    }
    Ok(started)
}

fn stop_filters(api: &dyn PassThruApi, device: &str, channel: u32, filters: &[u32]) {
    for &filter in filters {
        if let Err(e) = api.stop_msg_filter(channel, filter) {
            tlog!("[{}] Filter {} not stopped: {}", device, filter, e);
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Everything one open adapter holds.
struct Session {
    device: String,
    api: Arc<dyn PassThruApi>,
    device_id: u32,
    channel: u32,
    filters: Mutex<Vec<u32>>,
    hub: Arc<Hub>,
    errors: ErrorBus,
    stats: Arc<EngineStats>,
    sender: FrameSender,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Session {
    fn start(
        api: Arc<dyn PassThruApi>,
        device_id: u32,
        channel: u32,
        filters: Vec<u32>,
        options: EngineOptions,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let cancel = parent.child_token();
        let hub = Hub::new(options.device.clone(), options.subscriber_queue);
        let errors = ErrorBus::new();
        let stats = Arc::new(EngineStats::default());
        let (tx, rx) = mpsc::channel(options.send_queue);
        let sender = FrameSender::new(&options.device, tx, stats.clone(), errors.clone());

        let session = Arc::new(Self {
            device: options.device.clone(),
            api,
            device_id,
            channel,
            filters: Mutex::new(filters),
            hub,
            errors,
            stats,
            sender,
            cancel,
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        });

        let receiver = session.clone();
        let read_timeout = options.read_timeout;
        let debug = options.debug;
        let rx_task = tokio::task::spawn_blocking(move || receiver.receive(read_timeout, debug));
        let tx_task = tokio::spawn(session.clone().transmit(rx, options.write_timeout, debug));
        if let Ok(mut tasks) = session.tasks.lock() {
            tasks.push(rx_task);
            tasks.push(tx_task);
        }

        tlog!("[{}] Channel {} running", session.device, channel);
        session
    }

    fn receive(&self, timeout: Duration, debug: bool) {
        let mut transient = 0u32;
        while !self.cancel.is_cancelled() {
            match self.api.read_msgs(self.channel, READ_BATCH, timeout) {
                Ok(msgs) => {
                    transient = 0;
                    for msg in msgs.iter().filter(|m| !m.is_tx_echo()) {
                        wire_log!(debug, self.device, "<-", &msg.data);
                        self.route(msg);
                    }
                }
                Err(e) if e.is_empty_read() => {}
                Err(e) if e.code == ERR_DEVICE_NOT_CONNECTED => {
                    self.stats.read_errors.fetch_add(1, Ordering::Relaxed);
                    self.link_lost(e.to_string());
                    break;
                }
                Err(e) => {
                    transient += 1;
                    self.stats.read_errors.fetch_add(1, Ordering::Relaxed);
                    if transient >= MAX_TRANSIENT_READ_ERRORS {
                        self.link_lost(format!("{} (after {} attempts)", e, transient));
                        break;
                    }
                    self.errors
                        .publish(ErrorEvent::Link(IoError::read(&self.device, e.to_string())));
                }
            }
        }
        self.hub.close_all();
    }

    fn route(&self, msg: &PassThruMsg) {
        match msg.to_frame() {
            Ok(frame) => {
                self.stats.frames_rx.fetch_add(1, Ordering::Relaxed);
                let report = self.hub.deliver(&frame);
                if report.dropped > 0 {
                    self.stats
                        .dispatch_drops
                        .fetch_add(report.dropped as u64, Ordering::Relaxed);
                    self.errors.publish(ErrorEvent::DispatchDropped {
                        frame_id: frame.id(),
                        subscribers: report.dropped,
                    });
                }
            }
            Err(e) => {
                self.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                self.errors
                    .publish(ErrorEvent::Protocol(ProtocolError::Malformed(e.to_string())));
            }
        }
    }

    fn link_lost(&self, message: String) {
        tlog!("[{}] Device lost: {}", self.device, message);
        self.errors
            .publish(ErrorEvent::Link(IoError::read_fatal(&self.device, message)));
        self.cancel.cancel();
    }

    async fn transmit(self: Arc<Self>, mut rx: mpsc::Receiver<SendRequest>, timeout: Duration, debug: bool) {
        loop {
            let request = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            match request {
                SendRequest::Frame(frame) if frame.is_system() => {
                    tlog!(
                        "[{}] System message: {}",
                        self.device,
                        String::from_utf8_lossy(frame.data())
                    );
                }
                SendRequest::Frame(frame) if frame.is_rtr() => {
                    self.errors
                        .publish(ErrorEvent::Link(IoError::unsupported(&self.device, "remote frames")));
                }
                SendRequest::Frame(frame) => {
                    if let Err(e) = self.write(&frame, timeout, debug).await {
                        self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                        tlog!("[{}] Frame write failed, closing: {}", self.device, e);
                        self.errors.publish(ErrorEvent::Link(e));
                        self.cancel.cancel();
                        break;
                    }
                    self.stats.frames_tx.fetch_add(1, Ordering::Relaxed);
                }
                SendRequest::Raw { done, .. } => {
                    let _ = done.send(Err(IoError::unsupported(&self.device, "raw adapter commands")));
                }
            }
        }
    }

    async fn write(self: &Arc<Self>, frame: &Frame, timeout: Duration, debug: bool) -> Result<(), IoError> {
        let msg = PassThruMsg::from_frame(frame);
        wire_log!(debug, self.device, "->", &msg.data);
        let timeout = frame.timeout().unwrap_or(timeout);
        let session = self.clone();
        let result = blocking(&self.device, move || {
            session.api.write_msgs(session.channel, &[msg], timeout)
        })
        .await?;
        let written = lift(&self.device, "PassThruWriteMsgs", result)?;
        if written < 1 {
            return Err(IoError::ShortWrite {
                device: self.device.clone(),
                written,
                expected: 1,
            });
        }
        Ok(())
    }

    async fn set_filter(self: &Arc<Self>, ids: &[u32], extended: bool) -> Result<(), IoError> {
        let session = self.clone();
        let ids = ids.to_vec();
        blocking(&self.device, move || {
            let mut filters = session
                .filters
                .lock()
                .map_err(|_| IoError::protocol(&session.device, "filter list poisoned"))?;
            stop_filters(session.api.as_ref(), &session.device, session.channel, &filters);
            filters.clear();
            *filters = install_filters(session.api.as_ref(), &session.device, session.channel, &ids, extended)?;
            Ok::<(), IoError>(())
        })
        .await?
    }

    fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stop both tasks, then release filters, channel and device. Runs once.
    async fn shutdown(self: &Arc<Self>) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.sender.close();

        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            if let Err(e) = task.await {
                tlog!("[{}] Task ended abnormally: {}", self.device, e);
            }
        }

        let session = self.clone();
        let released = blocking(&self.device, move || {
            let filters = session
                .filters
                .lock()
                .map(|mut f| std::mem::take(&mut *f))
                .unwrap_or_default();
            stop_filters(session.api.as_ref(), &session.device, session.channel, &filters);
            release(session.api.as_ref(), &session.device, session.device_id, Some(session.channel));
        })
        .await;
        if let Err(e) = released {
            tlog!("[{}] {}", self.device, e);
        }

        self.hub.close_all();
        tlog!("[{}] Channel {} closed", self.device, self.channel);
    }
}

/// Best effort: disconnect the channel (if any), then close the device.
fn release(api: &dyn PassThruApi, device: &str, device_id: u32, channel: Option<u32>) {
    if let Some(channel) = channel {
        if let Err(e) = api.disconnect(channel) {
            tlog!("[{}] Disconnect failed: {}", device, e);
        }
    }
    if let Err(e) = api.close(device_id) {
        tlog!("[{}] Close failed: {}", device, e);
    }
}

// ============================================================================
// Adapter
// ============================================================================

struct Slot {
    state: AdapterState,
    session: Option<Arc<Session>>,
    finished: bool,
}

impl Slot {
    /// The session stopped on its own: unplug, write failure or the caller's
    /// cancellation token.
    fn stopped(&self) -> bool {
        self.state == AdapterState::Running
            && self.session.as_ref().map_or(true, |s| !s.is_running())
    }

    fn observed_state(&self) -> AdapterState {
        if self.stopped() {
            AdapterState::Closed
        } else {
            self.state
        }
    }
}

pub struct PassThruAdapter {
    name: String,
    config: AdapterConfig,
    api: Arc<dyn PassThruApi>,
    slot: Mutex<Slot>,
}

impl PassThruAdapter {
    pub fn new(api: Arc<dyn PassThruApi>, config: AdapterConfig) -> Result<Self, IoError> {
        config.validate()?;
        Ok(Self {
            name: device_name("passthru", &config),
            config,
            api,
            slot: Mutex::new(Slot {
                state: AdapterState::Closed,
                session: None,
                finished: false,
            }),
        })
    }

    fn lock_slot(&self) -> Result<std::sync::MutexGuard<'_, Slot>, IoError> {
        self.slot
            .lock()
            .map_err(|_| IoError::protocol(&self.name, "adapter state poisoned"))
    }

    fn session(&self) -> Result<Arc<Session>, IoError> {
        let slot = self.lock_slot()?;
        match (&slot.state, &slot.session) {
            (AdapterState::Running, Some(session)) if session.is_running() => Ok(session.clone()),
            _ => Err(IoError::closed(&self.name)),
        }
    }

    async fn bring_up(&self, cancel: &CancellationToken) -> Result<Arc<Session>, IoError> {
        let name = self.name.clone();
        let baud = self.config.bitrate.bps().ok_or_else(|| {
            IoError::open_failed(
                &name,
                "protocol",
                IoError::configuration("pass-through needs a plain bit rate, not BTR registers"),
            )
        })?;
        let flags = if self.config.extended { CAN_29BIT_ID } else { 0 };

        let api = self.api.clone();
        let device_id = blocking(&name, move || api.open())
            .await
            .and_then(|r| lift(&name, "PassThruOpen", r))
            .map_err(|e| IoError::open_failed(&name, "link", e))?;

        let api = self.api.clone();
        let connected = blocking(&name, move || api.connect(device_id, PROTOCOL_CAN, flags, baud))
            .await
            .and_then(|r| lift(&name, "PassThruConnect", r));
        let channel = match connected {
            Ok(channel) => channel,
            Err(e) => {
                let api = self.api.clone();
                let device = name.clone();
                let _ = blocking(&name, move || release(api.as_ref(), &device, device_id, None)).await;
                return Err(IoError::open_failed(&name, "connect", e));
            }
        };

        let api = self.api.clone();
        let device = name.clone();
        let ids = self.config.filter_ids.clone();
        let extended = self.config.extended;
        let installed = blocking(&name, move || {
            let result = install_filters(api.as_ref(), &device, channel, &ids, extended);
            if result.is_err() {
                release(api.as_ref(), &device, device_id, Some(channel));
            }
            result
        })
        .await
        .and_then(|r| r);
        let filters = installed.map_err(|e| IoError::open_failed(&name, "configure", e))?;

        let options = EngineOptions::from_config(name, &self.config);
        Ok(Session::start(self.api.clone(), device_id, channel, filters, options, cancel))
    }
}

#[async_trait]
impl Adapter for PassThruAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn traits(&self) -> AdapterTraits {
        traits_for_kind("passthru")
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
                    slot.session.take()
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
        if let Some(session) = stale {
            // The stopped session still holds the channel and device
            session.shutdown().await;
        }

        tlog!("[{}] Opening", self.name);
        let result = self.bring_up(&cancel).await;

        let aborted = {
            let mut slot = self.lock_slot()?;
            match result {
                Ok(session) if slot.state == AdapterState::Opening => {
                    slot.session = Some(session);
                    slot.state = AdapterState::Running;
                    tlog!("[{}] Running", self.name);
                    return Ok(());
                }
                Ok(session) => session,
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
        let session = {
            let mut slot = self.lock_slot()?;
            if slot.finished {
                return Ok(());
            }
            slot.finished = true;
            match slot.state {
                AdapterState::Running => {
                    slot.state = AdapterState::Closing;
                    slot.session.take()
                }
                AdapterState::Opening => {
                    slot.state = AdapterState::Closing;
                    None
                }
                _ => None,
            }
        };

        if let Some(session) = session {
            tlog!("[{}] Closing", self.name);
            session.shutdown().await;
            if let Ok(mut slot) = self.slot.lock() {
                slot.state = AdapterState::Closed;
            }
            tlog!("[{}] Closed", self.name);
        }
        Ok(())
    }

    fn sender(&self) -> Result<FrameSender, IoError> {
        Ok(self.session()?.sender.clone())
    }

    fn subscribe(&self, filter: &[u32]) -> Result<Subscription, IoError> {
        self.session()?.hub.subscribe(filter)
    }

    fn errors(&self) -> Result<ErrorStream, IoError> {
        Ok(self.session()?.errors.subscribe())
    }

    async fn set_filter(&self, ids: &[u32]) -> Result<(), IoError> {
        self.session()?.set_filter(ids, self.config.extended).await
    }

    fn stats(&self) -> StatsSnapshot {
        self.slot
            .lock()
            .ok()
            .and_then(|s| s.session.as_ref().map(|s| s.stats.snapshot()))
            .unwrap_or_default()
    }
}
