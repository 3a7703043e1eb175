// src/io/hub.rs
//
// Subscription hub: fans decoded frames out to subscribers.
//
// Delivery holds the registry read lock for the whole pass and never blocks:
// a full subscriber queue costs that subscriber one drop, nothing else.
// Unregistration takes the write lock only around remove-and-close, so a
// delivery pass either sees a subscriber with its queue open or not at all.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::io::error::IoError;
use crate::io::Frame;

/// Failed deliveries after which a poll subscriber unregisters itself
pub const POLL_ERROR_THRESHOLD: u32 = 100;

struct Subscriber {
    id: u64,
    filter: Vec<u32>,
    /// Sole sender of the delivery queue; dropping it closes the queue
    tx: mpsc::Sender<Frame>,
    errors: Arc<AtomicU32>,
    poll: bool,
}

#[derive(Default)]
struct Registry {
    global: Vec<Arc<Subscriber>>,
    by_id: HashMap<u32, Vec<Arc<Subscriber>>>,
    all: HashMap<u64, Arc<Subscriber>>,
}

impl Registry {
    fn insert(&mut self, sub: Arc<Subscriber>) {
        if sub.filter.is_empty() {
            self.global.push(sub.clone());
        } else {
            for id in &sub.filter {
                self.by_id.entry(*id).or_default().push(sub.clone());
            }
        }
        self.all.insert(sub.id, sub);
    }

    fn remove(&mut self, id: u64) -> Option<Arc<Subscriber>> {
        let sub = self.all.remove(&id)?;
        if sub.filter.is_empty() {
            self.global.retain(|s| s.id != id);
        } else {
            for frame_id in &sub.filter {
                if let Some(list) = self.by_id.get_mut(frame_id) {
                    list.retain(|s| s.id != id);
                    if list.is_empty() {
                        self.by_id.remove(frame_id);
                    }
                }
            }
        }
        Some(sub)
    }
}

/// Outcome of one delivery pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub dropped: usize,
}

pub struct Hub {
    device: String,
    registry: RwLock<Registry>,
    next_id: AtomicU64,
    default_capacity: usize,
    dropped_total: AtomicU64,
    closed: AtomicBool,
}

enum Stale {
    ReceiverGone(u64),
    PollThreshold(u64),
}

impl Hub {
    pub fn new(device: impl Into<String>, default_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            device: device.into(),
            registry: RwLock::new(Registry::default()),
            next_id: AtomicU64::new(1),
            default_capacity: default_capacity.max(1),
            dropped_total: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Subscribe to `filter` (empty = every frame) with the default queue size.
    pub fn subscribe(self: &Arc<Self>, filter: &[u32]) -> Result<Subscription, IoError> {
        self.register(filter, self.default_capacity, false)
    }

    pub fn subscribe_with_capacity(
        self: &Arc<Self>,
        filter: &[u32],
        capacity: usize,
    ) -> Result<Subscription, IoError> {
        self.register(filter, capacity, false)
    }

    /// One-shot listener for a request/response exchange. Unregisters itself
    /// once `POLL_ERROR_THRESHOLD` deliveries have failed.
    pub fn poll(self: &Arc<Self>, filter: &[u32], capacity: usize) -> Result<Subscription, IoError> {
        self.register(filter, capacity, true)
    }

    fn register(
        self: &Arc<Self>,
        filter: &[u32],
        capacity: usize,
        poll: bool,
    ) -> Result<Subscription, IoError> {
        let mut filter = filter.to_vec();
        filter.sort_unstable();
        filter.dedup();

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let errors = Arc::new(AtomicU32::new(0));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut registry = self
                .registry
                .write()
                .map_err(|_| IoError::protocol(&self.device, "hub registry poisoned"))?;
            if self.closed.load(Ordering::Acquire) {
                return Err(IoError::closed(&self.device));
            }
            registry.insert(Arc::new(Subscriber {
                id,
                filter,
                tx,
                errors: errors.clone(),
                poll,
            }));
        }

        Ok(Subscription {
            id,
            rx,
            errors,
            hub: Arc::downgrade(self),
        })
    }

    /// Remove subscriber `id` from every set and close its queue.
    /// Returns false if it was already gone.
    pub fn unregister(&self, id: u64) -> bool {
        let removed = match self.registry.write() {
            Ok(mut registry) => registry.remove(id),
            Err(_) => None,
        };
        // The queue closes here, when the last sender handle drops
        removed.is_some()
    }

    /// Deliver one frame to every matching subscriber. Never blocks.
    pub fn deliver(&self, frame: &Frame) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let mut stale = Vec::new();

        {
            let Ok(registry) = self.registry.read() else {
                return report;
            };
            let targets = registry
                .global
                .iter()
                .chain(registry.by_id.get(&frame.id()).into_iter().flatten());

            for sub in targets {
                match sub.tx.try_send(frame.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        report.dropped += 1;
                        let errors = sub.errors.fetch_add(1, Ordering::Relaxed) + 1;
                        if sub.poll && errors >= POLL_ERROR_THRESHOLD {
                            stale.push(Stale::PollThreshold(sub.id));
                        }
                    }
                    Err(TrySendError::Closed(_)) => stale.push(Stale::ReceiverGone(sub.id)),
                }
            }
        }

        if report.dropped > 0 {
            self.dropped_total
                .fetch_add(report.dropped as u64, Ordering::Relaxed);
        }

        for entry in stale {
            match entry {
                Stale::ReceiverGone(id) => {
                    self.unregister(id);
                }
                Stale::PollThreshold(id) => {
                    if self.unregister(id) {
                        tlog!(
                            "[hub:{}] Poll subscriber {} unregistered after {} failed deliveries",
                            self.device,
                            id,
                            POLL_ERROR_THRESHOLD
                        );
                    }
                }
            }
        }

        report
    }

    /// Close every queue and refuse new subscribers.
    pub fn close_all(&self) {
        if let Ok(mut registry) = self.registry.write() {
            self.closed.store(true, Ordering::Release);
            *registry = Registry::default();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.read().map(|r| r.all.len()).unwrap_or(0)
    }

    /// Frames dropped across all subscribers since creation.
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Subscription handle
// ============================================================================

/// Receiving end of a subscriber. Dropping it unregisters the subscriber.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Frame>,
    errors: Arc<AtomicU32>,
    hub: Weak<Hub>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next frame, or `None` once the subscriber was unregistered and drained.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Frame, IoError> {
        let device = self
            .hub
            .upgrade()
            .map(|h| h.device.clone())
            .unwrap_or_default();
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(IoError::closed(device)),
            Err(_) => Err(IoError::timeout(device, "frame", timeout)),
        }
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// Deliveries this subscriber missed because its queue was full.
    pub fn dropped(&self) -> u32 {
        self.errors.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unregister(self.id);
        }
    }
}
