// src/io/engine.rs
//
// Per-adapter I/O engine: one blocking receive task that drives the byte
// parser and dispatches what it decodes, and one async send task that drains
// the bounded send queue in FIFO order. Both observe one cancellation token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::io::codec::{ByteParser, ControlResponse, ParseEvent, ProtocolError, WireProtocol};
use crate::io::control::ControlCorrelator;
use crate::io::error::{classify_read_error, IoError, ReadFault};
use crate::io::hub::{Hub, Subscription};
use crate::io::link::Link;
use crate::io::types::{ErrorBus, ErrorEvent, ErrorStream, EngineStats, FrameSender, SendRequest, StatsSnapshot};
use crate::io::{system_id, Frame};
use crate::settings::AdapterConfig;

/// Consecutive transient read failures before the link is declared lost
const MAX_TRANSIENT_READ_ERRORS: u32 = 3;
/// Bytes requested per link read
const READ_CHUNK: usize = 256;
/// Added to a frame's timeout while waiting for the ready prompt
const PROMPT_MARGIN: Duration = Duration::from_millis(100);

/// Tunables for one engine, usually taken from `AdapterConfig`.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub device: String,
    pub debug: bool,
    pub send_queue: usize,
    pub subscriber_queue: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub command_timeout: Duration,
}

impl EngineOptions {
    pub fn from_config(device: impl Into<String>, config: &AdapterConfig) -> Self {
        Self {
            device: device.into(),
            debug: config.debug,
            send_queue: config.send_queue.max(1),
            subscriber_queue: config.subscriber_queue.max(1),
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
            command_timeout: config.command_timeout(),
        }
    }
}

pub struct Engine {
    options: EngineOptions,
    link: Arc<dyn Link>,
    hub: Arc<Hub>,
    correlator: Arc<ControlCorrelator>,
    errors: ErrorBus,
    stats: Arc<EngineStats>,
    sender: FrameSender,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    close_sequence: Option<Vec<u8>>,
    stopped: AtomicBool,
}

impl Engine {
    /// Spawn the receive and send tasks on the current tokio runtime.
    /// The engine stops when `parent` is cancelled or on a fatal link error.
    pub fn start<P: WireProtocol>(
        link: Arc<dyn Link>,
        protocol: Arc<P>,
        options: EngineOptions,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let hub = Hub::new(options.device.clone(), options.subscriber_queue);
        let correlator = ControlCorrelator::new(options.device.clone());
        let errors = ErrorBus::new();
        let stats = Arc::new(EngineStats::default());

        let (tx, rx) = mpsc::channel(options.send_queue);
        let sender = FrameSender::new(&options.device, tx, stats.clone(), errors.clone());

        let (prompt_tx, prompt_rx) = if protocol.awaits_prompt() {
            let (tx, rx) = mpsc::channel(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let receiver = Receiver {
            device: options.device.clone(),
            debug: options.debug,
            read_timeout: options.read_timeout,
            link: link.clone(),
            hub: hub.clone(),
            correlator: correlator.clone(),
            errors: errors.clone(),
            stats: stats.clone(),
            prompts: prompt_tx,
            cancel: cancel.clone(),
        };
        let parser = protocol.parser();
        let rx_task = tokio::task::spawn_blocking(move || receiver.run(parser));

        let close_sequence = protocol.close_sequence();
        let transmitter = Transmitter {
            device: options.device.clone(),
            debug: options.debug,
            write_timeout: options.write_timeout,
            link: link.clone(),
            protocol,
            correlator: correlator.clone(),
            errors: errors.clone(),
            stats: stats.clone(),
            prompts: prompt_rx,
            cancel: cancel.clone(),
        };
        let tx_task = tokio::spawn(transmitter.run(rx));

        tlog!("[{}] Engine started", options.device);

        Self {
            options,
            link,
            hub,
            correlator,
            errors,
            stats,
            sender,
            cancel,
            tasks: Mutex::new(vec![rx_task, tx_task]),
            close_sequence,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn device(&self) -> &str {
        &self.options.device
    }

    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    pub fn subscribe(&self, filter: &[u32]) -> Result<Subscription, IoError> {
        self.hub.subscribe(filter)
    }

    pub fn subscribe_with_capacity(&self, filter: &[u32], capacity: usize) -> Result<Subscription, IoError> {
        self.hub.subscribe_with_capacity(filter, capacity)
    }

    /// Short-lived subscriber for a request/response exchange.
    pub fn poll(&self, filter: &[u32], capacity: usize) -> Result<Subscription, IoError> {
        self.hub.poll(filter, capacity)
    }

    pub fn errors(&self) -> ErrorStream {
        self.errors.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn command_timeout(&self) -> Duration {
        self.options.command_timeout
    }

    /// False once cancelled, by `shutdown` or by a fatal link error.
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Send a control command and wait for its response.
    ///
    /// Fails fast with `Busy` if another command is outstanding. `expects` is
    /// the response code that completes the exchange.
    pub async fn command(
        &self,
        command: u8,
        expects: u8,
        bytes: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<ControlResponse, IoError> {
        let pending = self.correlator.register(command, expects)?;
        self.write_raw(bytes).await?;
        pending
            .wait(timeout.unwrap_or(self.options.command_timeout))
            .await
    }

    /// Queue raw command bytes and wait until they are on the wire.
    pub async fn write_raw(&self, bytes: Vec<u8>) -> Result<(), IoError> {
        let written = self.sender.send_raw(bytes)?;
        match written.await {
            Ok(result) => result,
            Err(_) => Err(IoError::closed(&self.options.device)),
        }
    }

    /// Stop both tasks and release the link. Runs once; later calls return
    /// immediately.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        self.cancel.cancel();
        self.sender.close();
        self.correlator.fail_all();

        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            if let Err(e) = task.await {
                tlog!("[{}] Engine task ended abnormally: {}", self.options.device, e);
            }
        }

        // Both tasks are gone, so this is the only writer
        if let Some(bytes) = self.close_sequence.clone() {
            let link = self.link.clone();
            let timeout = self.options.write_timeout;
            wire_log!(self.options.debug, self.options.device, "->", &bytes);
            let result = tokio::task::spawn_blocking(move || link.write(&bytes, timeout)).await;
            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tlog!("[{}] Close command not sent: {}", self.options.device, e),
                Err(e) => tlog!("[{}] Close command not sent: {}", self.options.device, e),
            }
        }

        self.hub.close_all();
        self.link.close();
        tlog!("[{}] Engine stopped", self.options.device);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// Receive task
// ============================================================================

struct Receiver {
    device: String,
    debug: bool,
    read_timeout: Duration,
    link: Arc<dyn Link>,
    hub: Arc<Hub>,
    correlator: Arc<ControlCorrelator>,
    errors: ErrorBus,
    stats: Arc<EngineStats>,
    prompts: Option<mpsc::Sender<()>>,
    cancel: CancellationToken,
}

impl Receiver {
    fn run<P: ByteParser>(self, mut parser: P) {
        let mut buf = [0u8; READ_CHUNK];
        let mut transient = 0u32;

        while !self.cancel.is_cancelled() {
            match self.link.read(&mut buf, self.read_timeout) {
                Ok(0) => {}
                Ok(n) => {
                    transient = 0;
                    wire_log!(self.debug, self.device, "<-", &buf[..n]);
                    for &byte in &buf[..n] {
                        if let Some(event) = parser.feed(byte) {
                            self.route(event);
                        }
                    }
                }
                Err(e) => match classify_read_error(&e) {
                    ReadFault::Idle => {}
                    ReadFault::Transient => {
                        transient += 1;
                        self.stats.read_errors.fetch_add(1, Ordering::Relaxed);
                        if transient >= MAX_TRANSIENT_READ_ERRORS {
                            self.link_lost(format!("{} (after {} attempts)", e, transient));
                            break;
                        }
                        self.errors
                            .publish(ErrorEvent::Link(IoError::read(&self.device, e.to_string())));
                    }
                    ReadFault::Fatal => {
                        self.stats.read_errors.fetch_add(1, Ordering::Relaxed);
                        self.link_lost(e.to_string());
                        break;
                    }
                },
            }
        }

        // Nobody will answer outstanding commands or produce frames any more
        self.correlator.fail_all();
        self.hub.close_all();
    }

    fn link_lost(&self, message: String) {
        tlog!("[{}] Link lost: {}", self.device, message);
        self.errors
            .publish(ErrorEvent::Link(IoError::read_fatal(&self.device, message)));
        self.cancel.cancel();
    }

    fn route(&self, event: ParseEvent) {
        match event {
            ParseEvent::Frame(frame) => {
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
            ParseEvent::Control(response) => {
                self.stats.control_rx.fetch_add(1, Ordering::Relaxed);
                let code = response.command;
                if !self.correlator.complete(response) && self.debug {
                    tlog!("[{}] Unsolicited response 0x{:02X}", self.device, code);
                }
            }
            ParseEvent::Prompt => {
                if let Some(prompts) = &self.prompts {
                    // A prompt already pending means the send task has not looked yet
                    let _ = prompts.try_send(());
                }
            }
            ParseEvent::Error(err) => {
                self.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                if let ProtocolError::Nak { command } = &err {
                    self.correlator.reject(*command);
                }
                if self.debug {
                    tlog!("[{}] {}", self.device, err);
                }
                self.errors.publish(ErrorEvent::Protocol(err));
            }
        }
    }
}

// ============================================================================
// Send task
// ============================================================================

struct Transmitter<P> {
    device: String,
    debug: bool,
    write_timeout: Duration,
    link: Arc<dyn Link>,
    protocol: Arc<P>,
    correlator: Arc<ControlCorrelator>,
    errors: ErrorBus,
    stats: Arc<EngineStats>,
    prompts: Option<mpsc::Receiver<()>>,
    cancel: CancellationToken,
}

impl<P: WireProtocol> Transmitter<P> {
    async fn run(mut self, mut rx: mpsc::Receiver<SendRequest>) {
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
                SendRequest::Frame(frame) if frame.is_system() => self.send_system(&frame).await,
                SendRequest::Frame(frame) => {
                    if !self.send_frame(&frame).await {
                        break;
                    }
                }
                SendRequest::Raw { bytes, done } => {
                    // Only `Engine::command` queues raw bytes, after claiming the slot
                    self.correlator.note_write(true);
                    let result = self.write(bytes, None).await;
                    if result.is_err() {
                        self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.await_prompt(None).await;
                    }
                    let _ = done.send(result);
                }
            }
        }
        // Dropping `rx` here makes every FrameSender report closed
    }

    /// Returns false when the engine must stop.
    async fn send_frame(&mut self, frame: &Frame) -> bool {
        let bytes = match self.protocol.encode_frame(frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.errors.publish(ErrorEvent::Link(e));
                return true;
            }
        };

        self.correlator.note_write(false);
        match self.write(bytes, frame.timeout()).await {
            Ok(()) => {
                self.stats.frames_tx.fetch_add(1, Ordering::Relaxed);
                self.await_prompt(frame.timeout()).await;
                true
            }
            Err(e) => {
                // The device may have seen half a frame; the stream is unusable
                self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                tlog!("[{}] Frame write failed, closing: {}", self.device, e);
                self.errors.publish(ErrorEvent::Link(e));
                self.cancel.cancel();
                false
            }
        }
    }

    /// Best effort: failures are reported, never fatal. Raw commands are
    /// refused while a control command is outstanding, since the device's
    /// answer could complete the wrong waiter.
    async fn send_system(&mut self, frame: &Frame) {
        match self.protocol.encode_system(frame) {
            Some(bytes) => {
                if let Some(pending) = self.correlator.pending_command() {
                    tlog!(
                        "[{}] Raw command dropped, 0x{:02X} outstanding",
                        self.device,
                        pending
                    );
                    self.stats.send_drops.fetch_add(1, Ordering::Relaxed);
                    self.errors.publish(ErrorEvent::Link(IoError::Busy {
                        device: self.device.clone(),
                        pending,
                    }));
                    return;
                }
                self.correlator.note_write(false);
                match self.write(bytes, frame.timeout()).await {
                    Ok(()) => self.await_prompt(frame.timeout()).await,
                    Err(e) => {
                        self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                        self.errors.publish(ErrorEvent::Link(e));
                    }
                }
            }
            None => {
                let label = match frame.id() {
                    system_id::SYSTEM_MSG_ERROR => "error",
                    system_id::SYSTEM_MSG_DEBUG => "debug",
                    system_id::SYSTEM_MSG_UNRECOVERABLE => "unrecoverable",
                    _ => "message",
                };
                tlog!(
                    "[{}] System {}: {}",
                    self.device,
                    label,
                    String::from_utf8_lossy(frame.data())
                );
            }
        }
    }

    async fn write(&mut self, bytes: Vec<u8>, timeout: Option<Duration>) -> Result<(), IoError> {
        let timeout = timeout.unwrap_or(self.write_timeout);
        let expected = bytes.len();
        wire_log!(self.debug, self.device, "->", &bytes);

        // A prompt left over from an earlier exchange must not release this one
        if let Some(prompts) = self.prompts.as_mut() {
            while prompts.try_recv().is_ok() {}
        }

        let link = self.link.clone();
        let written = tokio::task::spawn_blocking(move || link.write(&bytes, timeout))
            .await
            .map_err(|e| IoError::write(&self.device, format!("write task failed: {}", e)))?
            .map_err(|e| IoError::write(&self.device, e.to_string()))?;

        if written < expected {
            return Err(IoError::ShortWrite {
                device: self.device.clone(),
                written,
                expected,
            });
        }
        Ok(())
    }

    /// Hold the queue until the device prints its ready prompt.
    async fn await_prompt(&mut self, timeout: Option<Duration>) {
        let Some(prompts) = self.prompts.as_mut() else {
            return;
        };
        let wait = timeout.unwrap_or(self.write_timeout) + PROMPT_MARGIN;
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            result = tokio::time::timeout(wait, prompts.recv()) => {
                if result.is_err() && self.debug {
                    tlog!("[{}] No prompt after {:?}", self.device, wait);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::codec::ControlResponse;
    use crate::io::link::MemoryLink;
    use crate::io::system_id;

    /// Two-byte units: `F <id>` is a frame, `C <code>` a control response,
    /// `N` a NAK, `>` a prompt. Frames encode as `F <id>`.
    struct TestProtocol {
        prompt: bool,
    }

    #[derive(Default)]
    struct TestParser {
        tag: Option<u8>,
    }

    impl ByteParser for TestParser {
        fn feed(&mut self, byte: u8) -> Option<ParseEvent> {
            match self.tag.take() {
                Some(b'F') => Some(ParseEvent::Frame(
                    Frame::incoming(byte as u32, &[byte], false, false).unwrap(),
                )),
                Some(_) => Some(ParseEvent::Control(ControlResponse::ack(byte, vec![byte]))),
                None => match byte {
                    b'F' | b'C' => {
                        self.tag = Some(byte);
                        None
                    }
                    b'N' => Some(ParseEvent::Error(ProtocolError::Nak { command: None })),
                    b'>' => Some(ParseEvent::Prompt),
                    other => Some(ParseEvent::Error(ProtocolError::InvalidCommand(other))),
                },
            }
        }

        fn reset(&mut self) {
            self.tag = None;
        }

        fn is_idle(&self) -> bool {
            self.tag.is_none()
        }
    }

    impl WireProtocol for TestProtocol {
        type Parser = TestParser;

        fn name(&self) -> &'static str {
            "test"
        }

        fn parser(&self) -> TestParser {
            TestParser::default()
        }

        fn encode_frame(&self, frame: &Frame) -> Result<Vec<u8>, IoError> {
            Ok(vec![b'F', frame.id() as u8])
        }

        fn awaits_prompt(&self) -> bool {
            self.prompt
        }

        fn close_sequence(&self) -> Option<Vec<u8>> {
            Some(b"BYE".to_vec())
        }
    }

    fn options() -> EngineOptions {
        EngineOptions {
            device: "test".to_string(),
            debug: false,
            send_queue: 8,
            subscriber_queue: 8,
            read_timeout: Duration::from_millis(5),
            write_timeout: Duration::from_millis(50),
            command_timeout: Duration::from_millis(200),
        }
    }

    fn start(prompt: bool) -> (Engine, MemoryLink, Arc<MemoryLink>) {
        let (host, device) = MemoryLink::pair();
        let host = Arc::new(host);
        let engine = Engine::start(
            host.clone(),
            Arc::new(TestProtocol { prompt }),
            options(),
            &CancellationToken::new(),
        );
        (engine, device, host)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_frames_reach_subscribers() {
        let (engine, device, _host) = start(false);
        let mut sub = engine.subscribe(&[0x12]).unwrap();
        let mut all = engine.subscribe(&[]).unwrap();

        device.write(b"F\x12F\x34", Duration::ZERO).unwrap();
        let frame = sub.recv_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(frame.id(), 0x12);
        assert_eq!(all.recv_timeout(Duration::from_secs(1)).await.unwrap().id(), 0x12);
        assert_eq!(all.recv_timeout(Duration::from_secs(1)).await.unwrap().id(), 0x34);
        assert!(sub.try_recv().is_none());
        assert_eq!(engine.stats().frames_rx, 2);
        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sends_in_fifo_order() {
        let (engine, device, _host) = start(false);
        let sender = engine.sender();
        for id in 1..=5u32 {
            sender.send(Frame::new(id, &[]).unwrap()).unwrap();
        }
        let wire = device.read_exact_timeout(10, Duration::from_secs(1));
        assert_eq!(wire, b"F\x01F\x02F\x03F\x04F\x05");
        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_command_round_trip_and_busy() {
        let (engine, device, _host) = start(false);
        let engine = Arc::new(engine);

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.command(0x20, 0x20, b"Q".to_vec(), None).await })
        };
        assert_eq!(device.read_exact_timeout(1, Duration::from_secs(1)), b"Q");

        // Second command while the first is outstanding fails fast
        let err = engine.command(0x21, 0x21, b"R".to_vec(), None).await.unwrap_err();
        assert!(matches!(err, IoError::Busy { pending: 0x20, .. }));

        device.write(b"C\x20", Duration::ZERO).unwrap();
        let resp = first.await.unwrap().unwrap();
        assert_eq!(resp.payload, vec![0x20]);
        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_nak_rejects_outstanding_command() {
        let (engine, device, _host) = start(false);
        let mut errors = engine.errors();
        let engine = Arc::new(engine);
        let pending = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.command(0x30, 0x30, b"X".to_vec(), None).await })
        };
        device.read_exact_timeout(1, Duration::from_secs(1));
        device.write(b"N", Duration::ZERO).unwrap();

        assert!(matches!(pending.await.unwrap(), Err(IoError::Rejected { command: 0x30, .. })));
        assert!(matches!(errors.recv().await, Some(ErrorEvent::Protocol(ProtocolError::Nak { .. }))));
        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_short_frame_write_is_fatal() {
        let (engine, device, host) = start(false);
        let mut errors = engine.errors();
        host.set_write_limit(Some(1));

        engine.sender().send(Frame::new(0x7, &[]).unwrap()).unwrap();
        let event = errors.recv().await.unwrap();
        assert!(event.is_fatal(), "{}", event);
        assert!(matches!(event, ErrorEvent::Link(IoError::ShortWrite { written: 1, expected: 2, .. })));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!engine.is_running());
        assert!(engine.sender().send(Frame::new(0x7, &[]).unwrap()).is_err());
        assert_eq!(engine.stats().write_failures, 1);
        drop(device);
        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unplugged_link_stops_engine() {
        let (engine, device, _host) = start(false);
        let mut sub = engine.subscribe(&[]).unwrap();
        let mut errors = engine.errors();

        device.disconnect();
        let event = errors.recv().await.unwrap();
        assert!(event.is_fatal());
        // Subscribers see end of stream rather than hanging
        assert!(sub.recv().await.is_none());
        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_system_frames() {
        let (engine, device, _host) = start(false);
        let sender = engine.sender();
        sender
            .send(Frame::system(system_id::SYSTEM_MSG_DEBUG, b"not for the wire").unwrap())
            .unwrap();
        sender.send(Frame::command(b"RAW").unwrap()).unwrap();
        assert_eq!(device.read_exact_timeout(3, Duration::from_secs(1)), b"RAW");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(device.take_pending().is_empty());
        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_raw_command_refused_while_command_outstanding() {
        let (engine, device, _host) = start(false);
        let mut errors = engine.errors();
        let engine = Arc::new(engine);

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.command(0x20, 0x20, b"Q".to_vec(), None).await })
        };
        assert_eq!(device.read_exact_timeout(1, Duration::from_secs(1)), b"Q");

        engine.sender().send(Frame::command(b"Z").unwrap()).unwrap();
        let event = errors.recv().await.unwrap();
        assert!(matches!(event, ErrorEvent::Link(IoError::Busy { pending: 0x20, .. })), "{}", event);
        assert!(!event.is_fatal());
        assert!(device.read_exact_timeout(1, Duration::from_millis(50)).is_empty());
        assert_eq!(engine.stats().send_drops, 1);

        device.write(b"C\x20", Duration::ZERO).unwrap();
        assert!(first.await.unwrap().is_ok());

        // With the slot free the raw command goes out
        engine.sender().send(Frame::command(b"Z").unwrap()).unwrap();
        assert_eq!(device.read_exact_timeout(1, Duration::from_secs(1)), b"Z");
        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_nak_after_frame_write_spares_command() {
        let (engine, device, _host) = start(false);
        let engine = Arc::new(engine);

        let pending = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.command(0x30, 0x30, b"X".to_vec(), None).await })
        };
        assert_eq!(device.read_exact_timeout(1, Duration::from_secs(1)), b"X");
        engine.sender().send(Frame::new(0x5, &[]).unwrap()).unwrap();
        assert_eq!(device.read_exact_timeout(2, Duration::from_secs(1)), b"F\x05");

        // This NAK answers the frame, not the command
        device.write(b"N", Duration::ZERO).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!pending.is_finished());

        device.write(b"C\x30", Duration::ZERO).unwrap();
        assert!(pending.await.unwrap().is_ok());
        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_prompt_gates_sends() {
        let (engine, device, _host) = start(true);
        let sender = engine.sender();
        sender.send(Frame::new(0x1, &[]).unwrap()).unwrap();
        sender.send(Frame::new(0x2, &[]).unwrap()).unwrap();

        assert_eq!(device.read_exact_timeout(2, Duration::from_secs(1)), b"F\x01");
        // The second frame waits for the prompt
        assert!(device.read_exact_timeout(2, Duration::from_millis(50)).is_empty());
        device.write(b">", Duration::ZERO).unwrap();
        assert_eq!(device.read_exact_timeout(2, Duration::from_secs(1)), b"F\x02");
        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_writes_close_sequence_once() {
        let (engine, device, _host) = start(false);
        let mut sub = engine.subscribe(&[]).unwrap();
        engine.shutdown().await;
        engine.shutdown().await;

        assert_eq!(device.take_pending(), b"BYE");
        assert!(sub.recv().await.is_none());
        assert!(matches!(
            engine.sender().send(Frame::new(1, &[]).unwrap()),
            Err(IoError::Closed { .. })
        ));
        assert!(matches!(engine.subscribe(&[]), Err(IoError::Closed { .. })));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_protocol_errors_are_counted_not_fatal() {
        let (engine, device, _host) = start(false);
        let mut sub = engine.subscribe(&[]).unwrap();
        device.write(b"\x99F\x05", Duration::ZERO).unwrap();
        assert_eq!(sub.recv_timeout(Duration::from_secs(1)).await.unwrap().id(), 0x05);
        assert_eq!(engine.stats().protocol_errors, 1);
        assert!(engine.is_running());
        engine.shutdown().await;
    }
}
