// src/io/control.rs
//
// Single-in-flight control command correlation.
//
// At most one waiter is registered per adapter. The receive task hands every
// control response to `complete`; the waiting caller gets it through a
// oneshot channel. Timeout, drop and shutdown all clear the slot.
//
// Some wire formats NAK without naming the command (SLCAN BELL, STN `?`).
// Such a NAK belongs to the outstanding command only if that command was the
// last thing written; the send task announces every write through `note_write`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::io::codec::{ControlResponse, ResponseStatus};
use crate::io::error::IoError;

type Reply = Result<ControlResponse, IoError>;

struct Waiter {
    id: u64,
    /// Code written to the device
    command: u8,
    /// Code of the response that completes the exchange
    expects: u8,
    reply: oneshot::Sender<Reply>,
}

pub struct ControlCorrelator {
    device: String,
    slot: Mutex<Option<Waiter>>,
    next_id: AtomicU64,
    /// The most recent write carried the outstanding command
    command_written_last: AtomicBool,
}

impl ControlCorrelator {
    pub fn new(device: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            device: device.into(),
            slot: Mutex::new(None),
            next_id: AtomicU64::new(1),
            command_written_last: AtomicBool::new(false),
        })
    }

    /// Claim the slot for `command`, completed by a response tagged `expects`.
    /// Fails with `Busy` if another command is outstanding.
    pub fn register(self: &Arc<Self>, command: u8, expects: u8) -> Result<PendingControl, IoError> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| IoError::protocol(&self.device, "control slot poisoned"))?;

        if let Some(waiter) = slot.as_ref() {
            return Err(IoError::Busy {
                device: self.device.clone(),
                pending: waiter.command,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.command_written_last.store(false, Ordering::Release);
        let (tx, rx) = oneshot::channel();
        *slot = Some(Waiter {
            id,
            command,
            expects,
            reply: tx,
        });

        Ok(PendingControl {
            correlator: Arc::clone(self),
            id,
            command,
            rx,
        })
    }

    /// Hand a control response to the waiter. Returns false when nobody was
    /// waiting for this code.
    pub fn complete(&self, response: ControlResponse) -> bool {
        let Ok(mut slot) = self.slot.lock() else {
            return false;
        };
        match slot.as_ref() {
            Some(w) if w.expects == response.command => {}
            _ => return false,
        }
        let Some(waiter) = slot.take() else {
            return false;
        };
        drop(slot);

        let reply = match response.status {
            ResponseStatus::Ack => Ok(response),
            ResponseStatus::Nak => Err(IoError::Rejected {
                device: self.device.clone(),
                command: waiter.command,
            }),
        };
        // The caller may have given up already
        let _ = waiter.reply.send(reply);
        true
    }

    /// Called by the send task before each write. `command` is true when the
    /// bytes are those of the outstanding control command.
    pub fn note_write(&self, command: bool) {
        self.command_written_last.store(command, Ordering::Release);
    }

    /// The device refused a command. `None` means the wire format does not
    /// say which: the outstanding command is failed only when it was the last
    /// write, otherwise the NAK answers a frame and the waiter is left alone.
    pub fn reject(&self, command: Option<u8>) -> bool {
        let Ok(mut slot) = self.slot.lock() else {
            return false;
        };
        let matches = match (slot.as_ref(), command) {
            (Some(_), None) => self.command_written_last.load(Ordering::Acquire),
            (Some(w), Some(c)) => w.command == c || w.expects == c,
            (None, _) => false,
        };
        if !matches {
            return false;
        }
        let Some(waiter) = slot.take() else {
            return false;
        };
        drop(slot);

        let _ = waiter.reply.send(Err(IoError::Rejected {
            device: self.device.clone(),
            command: waiter.command,
        }));
        true
    }

    /// Clear the slot if it still belongs to waiter `id`.
    fn cancel(&self, id: u64) {
        if let Ok(mut slot) = self.slot.lock() {
            if slot.as_ref().is_some_and(|w| w.id == id) {
                slot.take();
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.slot.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Command code of the outstanding waiter, if any.
    pub fn pending_command(&self) -> Option<u8> {
        self.slot
            .lock()
            .ok()
            .and_then(|s| s.as_ref().map(|w| w.command))
    }

    /// Fail the outstanding waiter with `Closed`. Used on shutdown.
    pub fn fail_all(&self) {
        let waiter = self.slot.lock().ok().and_then(|mut s| s.take());
        if let Some(waiter) = waiter {
            let _ = waiter.reply.send(Err(IoError::closed(&self.device)));
        }
    }
}

/// A registered control command awaiting its response.
///
/// Dropping it without waiting releases the slot.
pub struct PendingControl {
    correlator: Arc<ControlCorrelator>,
    id: u64,
    command: u8,
    rx: oneshot::Receiver<Reply>,
}

impl PendingControl {
    pub fn command(&self) -> u8 {
        self.command
    }

    /// Wait for the response. On timeout the slot is cleared before returning,
    /// so the next command can be issued immediately.
    pub async fn wait(mut self, timeout: Duration) -> Result<ControlResponse, IoError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(IoError::closed(&self.correlator.device)),
            Err(_) => {
                self.correlator.cancel(self.id);
                Err(IoError::timeout(
                    &self.correlator.device,
                    format!("response to command 0x{:02X}", self.command),
                    timeout,
                ))
            }
        }
    }
}

impl Drop for PendingControl {
    fn drop(&mut self) {
        self.correlator.cancel(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_response_completes_waiter() {
        let correlator = ControlCorrelator::new("test");
        let pending = correlator.register(0x20, 0x20).unwrap();
        assert!(correlator.is_busy());

        assert!(correlator.complete(ControlResponse::ack(0x20, vec![1, 1])));
        let resp = pending.wait(Duration::from_millis(100)).await.unwrap();
        assert_eq!(resp.payload, vec![1, 1]);
        assert!(!correlator.is_busy());
    }

    #[tokio::test]
    async fn test_second_register_is_busy() {
        let correlator = ControlCorrelator::new("test");
        let first = correlator.register(0x20, 0x20).unwrap();

        let err = correlator.register(0x81, 0x81).err().unwrap();
        assert!(matches!(err, IoError::Busy { pending: 0x20, .. }));
        // The first waiter was not overwritten
        assert_eq!(correlator.pending_command(), Some(0x20));
        assert!(correlator.complete(ControlResponse::ack(0x20, vec![])));
        assert!(first.wait(Duration::from_millis(50)).await.is_ok());
    }

    #[tokio::test]
    async fn test_unrelated_response_ignored() {
        let correlator = ControlCorrelator::new("test");
        let _pending = correlator.register(0x20, 0x20).unwrap();
        assert!(!correlator.complete(ControlResponse::ack(0x22, vec![0, 0])));
        assert!(correlator.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_clears_slot() {
        let correlator = ControlCorrelator::new("test");
        let pending = correlator.register(0x21, 0x21).unwrap();
        let err = pending.wait(Duration::from_millis(250)).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(!correlator.is_busy());
        assert!(correlator.register(0x21, 0x21).is_ok());
    }

    #[test]
    fn test_drop_releases_slot() {
        let correlator = ControlCorrelator::new("test");
        let pending = correlator.register(0x80, 0x80).unwrap();
        drop(pending);
        assert!(!correlator.is_busy());
        // A late response after release goes nowhere
        assert!(!correlator.complete(ControlResponse::ack(0x80, vec![])));
    }

    #[tokio::test]
    async fn test_nak_rejects() {
        let correlator = ControlCorrelator::new("test");
        let pending = correlator.register(0x81, 0x81).unwrap();
        assert!(!correlator.reject(Some(0x20)));
        assert!(correlator.reject(Some(0x81)));
        let err = pending.wait(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, IoError::Rejected { command: 0x81, .. }));

        let pending = correlator.register(b'S', b'\r').unwrap();
        correlator.note_write(true);
        assert!(correlator.reject(None));
        assert!(pending.wait(Duration::from_millis(50)).await.is_err());
    }

    #[tokio::test]
    async fn test_anonymous_nak_after_frame_write_ignored() {
        let correlator = ControlCorrelator::new("test");
        let pending = correlator.register(b'V', b'V').unwrap();
        // Not yet on the wire: a NAK now answers something older
        assert!(!correlator.reject(None));

        correlator.note_write(true);
        correlator.note_write(false);
        assert!(!correlator.reject(None));
        assert!(correlator.is_busy());

        assert!(correlator.complete(ControlResponse::ack(b'V', b"1013".to_vec())));
        assert!(pending.wait(Duration::from_millis(50)).await.is_ok());
    }

    #[tokio::test]
    async fn test_nak_status_response() {
        let correlator = ControlCorrelator::new("test");
        let pending = correlator.register(0x01, 0x01).unwrap();
        assert!(correlator.complete(ControlResponse::nak(0x01)));
        assert!(matches!(
            pending.wait(Duration::from_millis(50)).await,
            Err(IoError::Rejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_fail_all_closes_waiter() {
        let correlator = ControlCorrelator::new("test");
        let pending = correlator.register(0x20, 0x20).unwrap();
        correlator.fail_all();
        assert!(matches!(
            pending.wait(Duration::from_secs(1)).await,
            Err(IoError::Closed { .. })
        ));
    }
}
