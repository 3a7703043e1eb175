// src/io/link.rs
//
// Duplex byte-stream endpoint under every adapter, plus an in-memory pair
// used to script devices in tests.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// A serial port or USB bulk pipe pair.
///
/// Reads and writes take `&self`: the receive task only reads and the send
/// task only writes, so implementations lock each direction separately.
pub trait Link: Send + Sync {
    /// Human-readable endpoint name for log prefixes.
    fn name(&self) -> &str;

    /// Read whatever is available, waiting at most `timeout`.
    /// `Ok(0)` means nothing arrived in time.
    fn read(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Write `data`, waiting at most `timeout`. May write fewer bytes.
    fn write(&self, data: &[u8], timeout: Duration) -> io::Result<usize>;

    /// Discard anything the device sent that has not been read yet.
    fn clear_input(&self) -> io::Result<()>;

    /// Release the endpoint. Subsequent reads and writes fail.
    fn close(&self);
}

// ============================================================================
// In-memory link
// ============================================================================

#[derive(Default)]
struct PipeState {
    buf: VecDeque<u8>,
    closed: bool,
}

#[derive(Default)]
struct Pipe {
    state: Mutex<PipeState>,
    ready: Condvar,
}

impl Pipe {
    fn push(&self, data: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link closed"));
        }
        state.buf.extend(data);
        self.ready.notify_all();
        Ok(())
    }

    fn pop(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        loop {
            if !state.buf.is_empty() {
                let n = buf.len().min(state.buf.len());
                for (slot, byte) in buf.iter_mut().zip(state.buf.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if state.closed {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link closed"));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(0);
            }
            let (guard, _) = self
                .ready
                .wait_timeout(state, deadline - now)
                .map_err(|_| poisoned())?;
            state = guard;
        }
    }

    fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.buf.clear();
        }
    }

    fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
            self.ready.notify_all();
        }
    }
}

fn poisoned() -> io::Error {
    io::Error::other("link mutex poisoned")
}

/// One end of an in-memory duplex link.
pub struct MemoryLink {
    name: String,
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
    /// Max bytes accepted per write; `usize::MAX` means unlimited.
    write_limit: AtomicUsize,
}

impl MemoryLink {
    /// Two connected ends: `(host, device)`. Bytes written on one are read on
    /// the other.
    pub fn pair() -> (MemoryLink, MemoryLink) {
        let a = Arc::new(Pipe::default());
        let b = Arc::new(Pipe::default());
        let host = MemoryLink {
            name: "memory".to_string(),
            rx: a.clone(),
            tx: b.clone(),
            write_limit: AtomicUsize::new(usize::MAX),
        };
        let device = MemoryLink {
            name: "memory-device".to_string(),
            rx: b,
            tx: a,
            write_limit: AtomicUsize::new(usize::MAX),
        };
        (host, device)
    }

    /// Accept at most `limit` bytes per write, to simulate short writes.
    pub fn set_write_limit(&self, limit: Option<usize>) {
        self.write_limit
            .store(limit.unwrap_or(usize::MAX), Ordering::SeqCst);
    }

    /// Simulate an unplugged device: both directions fail from now on.
    pub fn disconnect(&self) {
        self.rx.close();
        self.tx.close();
    }

    /// Everything currently readable on this end, without waiting.
    pub fn take_pending(&self) -> Vec<u8> {
        match self.rx.state.lock() {
            Ok(mut state) => state.buf.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Read until `len` bytes arrived or `timeout` elapsed.
    pub fn read_exact_timeout(&self, len: usize, timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::with_capacity(len);
        let mut buf = [0u8; 256];
        while out.len() < len {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let want = (len - out.len()).min(buf.len());
            match self.rx.pop(&mut buf[..want], deadline - now) {
                Ok(0) => continue,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
        out
    }

    /// Read until `terminator` is seen or `timeout` elapsed. Includes the terminator.
    pub fn read_until(&self, terminator: u8, timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.rx.pop(&mut byte, deadline - now) {
                Ok(0) => continue,
                Ok(_) => {
                    out.push(byte[0]);
                    if byte[0] == terminator {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        out
    }
}

impl Link for MemoryLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.rx.pop(buf, timeout)
    }

    fn write(&self, data: &[u8], _timeout: Duration) -> io::Result<usize> {
        let limit = self.write_limit.load(Ordering::SeqCst);
        let n = data.len().min(limit);
        self.tx.push(&data[..n])?;
        Ok(n)
    }

    fn clear_input(&self) -> io::Result<()> {
        self.rx.clear();
        Ok(())
    }

    fn close(&self) {
        self.rx.close();
        self.tx.close();
    }
}
