// src/io/types.rs
//
// Shared types between an adapter's tasks and its callers: the send-queue
// request, the error-event bus and the engine counters.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{broadcast, mpsc, oneshot};

use super::codec::ProtocolError;
use super::error::IoError;
use super::Frame;

/// Capacity of the error-event broadcast ring
const ERROR_BUS_CAPACITY: usize = 256;

// ============================================================================
// Send queue
// ============================================================================

/// Item on the send queue.
pub(crate) enum SendRequest {
    /// Bus frame or system frame from a caller
    Frame(Frame),
    /// Raw adapter command bytes; `done` reports the write result
    Raw {
        bytes: Vec<u8>,
        done: oneshot::Sender<Result<(), IoError>>,
    },
}

/// Caller handle to an adapter's outgoing queue. Cheap to clone.
#[derive(Clone)]
pub struct FrameSender {
    device: Arc<str>,
    tx: mpsc::Sender<SendRequest>,
    /// Set once the adapter starts closing
    closed: Arc<AtomicBool>,
    stats: Arc<EngineStats>,
    errors: ErrorBus,
}

impl FrameSender {
    pub(crate) fn new(
        device: &str,
        tx: mpsc::Sender<SendRequest>,
        stats: Arc<EngineStats>,
        errors: ErrorBus,
    ) -> Self {
        Self {
            device: Arc::from(device),
            tx,
            closed: Arc::new(AtomicBool::new(false)),
            stats,
            errors,
        }
    }

    /// Queue a frame without waiting. A full queue is reported, counted and
    /// returned as `QueueFull`.
    pub fn send(&self, frame: Frame) -> Result<(), IoError> {
        if self.is_closed() {
            return Err(IoError::closed(&*self.device));
        }
        match self.tx.try_send(SendRequest::Frame(frame)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.stats.send_drops.fetch_add(1, Ordering::Relaxed);
                self.errors.publish(ErrorEvent::SendQueueFull);
                Err(IoError::QueueFull {
                    device: self.device.to_string(),
                    queue: "send",
                })
            }
            Err(TrySendError::Closed(_)) => Err(IoError::closed(&*self.device)),
        }
    }

    /// Queue a frame, waiting up to `timeout` for space.
    pub async fn send_timeout(&self, frame: Frame, timeout: Duration) -> Result<(), IoError> {
        if self.is_closed() {
            return Err(IoError::closed(&*self.device));
        }
        match self.tx.send_timeout(SendRequest::Frame(frame), timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                self.stats.send_drops.fetch_add(1, Ordering::Relaxed);
                Err(IoError::timeout(&*self.device, "send queue space", timeout))
            }
            Err(SendTimeoutError::Closed(_)) => Err(IoError::closed(&*self.device)),
        }
    }

    /// Queue raw command bytes; the receiver resolves once they are written.
    pub(crate) fn send_raw(
        &self,
        bytes: Vec<u8>,
    ) -> Result<oneshot::Receiver<Result<(), IoError>>, IoError> {
        if self.is_closed() {
            return Err(IoError::closed(&*self.device));
        }
        let (done, rx) = oneshot::channel();
        match self.tx.try_send(SendRequest::Raw { bytes, done }) {
            Ok(()) => Ok(rx),
            Err(TrySendError::Full(_)) => Err(IoError::QueueFull {
                device: self.device.to_string(),
                queue: "send",
            }),
            Err(TrySendError::Closed(_)) => Err(IoError::closed(&*self.device)),
        }
    }

    /// Stop accepting new requests from every clone of this handle.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }
}

// ============================================================================
// Error events
// ============================================================================

/// Degraded condition observed by an adapter. Informational: nothing in the
/// engine waits for these to be consumed.
#[derive(Clone, Debug)]
pub enum ErrorEvent {
    /// Malformed wire unit; the parser already resynchronised
    Protocol(ProtocolError),
    /// A decoded frame could not be queued for `subscribers` subscribers
    DispatchDropped { frame_id: u32, subscribers: usize },
    /// A caller's frame was refused because the send queue was full
    SendQueueFull,
    /// Read or write failure on the link
    Link(IoError),
}

impl ErrorEvent {
    /// Whether the adapter is shutting down because of this event.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorEvent::Link(e) if e.is_fatal())
    }
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorEvent::Protocol(e) => write!(f, "protocol: {}", e),
            ErrorEvent::DispatchDropped {
                frame_id,
                subscribers,
            } => write!(
                f,
                "frame 0x{:X} dropped for {} subscriber(s)",
                frame_id, subscribers
            ),
            ErrorEvent::SendQueueFull => write!(f, "send queue full"),
            ErrorEvent::Link(e) => write!(f, "link: {}", e),
        }
    }
}

/// Adapter-wide error-event stream. Publishing never blocks; slow readers
/// lose the oldest events.
#[derive(Clone)]
pub struct ErrorBus {
    tx: broadcast::Sender<ErrorEvent>,
}

impl ErrorBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(ERROR_BUS_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: ErrorEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> ErrorStream {
        ErrorStream {
            rx: self.tx.subscribe(),
            missed: 0,
        }
    }
}

impl Default for ErrorBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ErrorStream {
    rx: broadcast::Receiver<ErrorEvent>,
    missed: u64,
}

impl ErrorStream {
    /// Next event; `None` once the adapter is gone.
    pub async fn recv(&mut self) -> Option<ErrorEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => self.missed += n,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<ErrorEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => self.missed += n,
                Err(_) => return None,
            }
        }
    }

    /// Events overwritten before this stream read them.
    pub fn missed(&self) -> u64 {
        self.missed
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Lock-free counters updated by the engine tasks.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub(crate) frames_rx: AtomicU64,
    pub(crate) frames_tx: AtomicU64,
    pub(crate) control_rx: AtomicU64,
    pub(crate) protocol_errors: AtomicU64,
    pub(crate) dispatch_drops: AtomicU64,
    pub(crate) send_drops: AtomicU64,
    pub(crate) write_failures: AtomicU64,
    pub(crate) read_errors: AtomicU64,
}

impl EngineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_rx: self.frames_rx.load(Ordering::Relaxed),
            frames_tx: self.frames_tx.load(Ordering::Relaxed),
            control_rx: self.control_rx.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            dispatch_drops: self.dispatch_drops.load(Ordering::Relaxed),
            send_drops: self.send_drops.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_rx: u64,
    pub frames_tx: u64,
    pub control_rx: u64,
    pub protocol_errors: u64,
    pub dispatch_drops: u64,
    pub send_drops: u64,
    pub write_failures: u64,
    pub read_errors: u64,
}
