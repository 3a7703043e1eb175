// src/io/usb.rs
//
// USB bulk link (nusb crate) for adapters that speak their protocol over a
// bulk IN/OUT endpoint pair, such as the CombiAdapter.

use nusb::transfer::{Buffer, Bulk, In, Out};
use nusb::{Endpoint, Interface, MaybeFuture};
use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;
use std::time::Duration;

use crate::io::error::IoError;
use crate::io::link::Link;

/// Read transfers kept in flight on the IN endpoint
const PENDING_READS: usize = 4;
/// Size of each IN transfer
const READ_TRANSFER_SIZE: usize = 64;

/// Where to find the device and which endpoints to use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsbEndpoints {
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface: u8,
    pub bulk_in: u8,
    pub bulk_out: u8,
}

struct ReadHalf {
    endpoint: Endpoint<Bulk, In>,
    /// Bytes from a completed transfer that did not fit the caller's buffer
    leftover: VecDeque<u8>,
}

pub struct UsbLink {
    name: String,
    // Held so the interface stays claimed while the endpoints are open
    _interface: Interface,
    reader: Mutex<Option<ReadHalf>>,
    writer: Mutex<Option<Endpoint<Bulk, Out>>>,
}

impl UsbLink {
    /// Open the first device matching `ids`, or the one whose serial number
    /// equals `serial` when given.
    pub fn open(ids: UsbEndpoints, serial: Option<&str>) -> Result<Self, IoError> {
        let label = format!("usb({:04x}:{:04x})", ids.vendor_id, ids.product_id);

        let device_info = nusb::list_devices()
            .wait()
            .map_err(|e| IoError::connection(&label, format!("Failed to list USB devices: {}", e)))?
            .find(|dev| {
                dev.vendor_id() == ids.vendor_id
                    && dev.product_id() == ids.product_id
                    && serial.is_none_or(|s| dev.serial_number() == Some(s))
            })
            .ok_or_else(|| IoError::connection(&label, "device not found"))?;

        let name = match device_info.serial_number() {
            Some(sn) => format!("usb({})", sn),
            None => label.clone(),
        };

        let device = device_info
            .open()
            .wait()
            .map_err(|e| IoError::connection(&name, format!("Failed to open device: {}", e)))?;
        let interface = device
            .claim_interface(ids.interface)
            .wait()
            .map_err(|e| IoError::connection(&name, format!("Failed to claim interface: {}", e)))?;

        let mut bulk_in = interface
            .endpoint::<Bulk, In>(ids.bulk_in)
            .map_err(|e| IoError::connection(&name, format!("Failed to open bulk IN endpoint: {}", e)))?;
        let bulk_out = interface
            .endpoint::<Bulk, Out>(ids.bulk_out)
            .map_err(|e| IoError::connection(&name, format!("Failed to open bulk OUT endpoint: {}", e)))?;

        for _ in 0..PENDING_READS {
            let buf = bulk_in.allocate(READ_TRANSFER_SIZE);
            bulk_in.submit(buf);
        }

        tlog!("[usb] Opened {}", name);

        Ok(Self {
            name,
            _interface: interface,
            reader: Mutex::new(Some(ReadHalf {
                endpoint: bulk_in,
                leftover: VecDeque::new(),
            })),
            writer: Mutex::new(Some(bulk_out)),
        })
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "usb device closed")
}

fn poisoned() -> io::Error {
    io::Error::other("usb endpoint mutex poisoned")
}

fn transfer_error(e: nusb::transfer::TransferError) -> io::Error {
    use nusb::transfer::TransferError;
    match e {
        TransferError::Disconnected => io::Error::new(io::ErrorKind::NotConnected, e.to_string()),
        TransferError::Cancelled => io::Error::new(io::ErrorKind::Interrupted, e.to_string()),
        _ => io::Error::other(e.to_string()),
    }
}

impl Link for UsbLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let mut guard = self.reader.lock().map_err(|_| poisoned())?;
        let half = guard.as_mut().ok_or_else(not_connected)?;

        if half.leftover.is_empty() {
            let Some(completion) = half.endpoint.wait_next_complete(timeout) else {
                return Ok(0);
            };
            let status = completion.status;
            half.leftover
                .extend(&completion.buffer[..completion.actual_len]);
            // Keep the IN pipe primed
            let next = half.endpoint.allocate(READ_TRANSFER_SIZE);
            half.endpoint.submit(next);
            status.map_err(transfer_error)?;
        }

        let n = buf.len().min(half.leftover.len());
        for (slot, byte) in buf.iter_mut().zip(half.leftover.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&self, data: &[u8], timeout: Duration) -> io::Result<usize> {
        let mut guard = self.writer.lock().map_err(|_| poisoned())?;
        let endpoint = guard.as_mut().ok_or_else(not_connected)?;

        endpoint.submit(Buffer::from(data.to_vec()));
        match endpoint.wait_next_complete(timeout) {
            Some(completion) => {
                completion.status.map_err(transfer_error)?;
                Ok(completion.actual_len)
            }
            None => {
                endpoint.cancel_all();
                // Reap the cancelled transfer so the next write starts clean
                let _ = endpoint.wait_next_complete(Duration::from_millis(50));
                Err(io::Error::new(io::ErrorKind::TimedOut, "bulk OUT timed out"))
            }
        }
    }

    fn clear_input(&self) -> io::Result<()> {
        let mut guard = self.reader.lock().map_err(|_| poisoned())?;
        let half = guard.as_mut().ok_or_else(not_connected)?;
        half.leftover.clear();
        // Swallow whatever already completed
        while let Some(completion) = half.endpoint.wait_next_complete(Duration::ZERO) {
            let next = half.endpoint.allocate(READ_TRANSFER_SIZE);
            half.endpoint.submit(next);
            completion.status.map_err(transfer_error)?;
        }
        Ok(())
    }

    fn close(&self) {
        if let Ok(mut w) = self.writer.lock() {
            if let Some(mut ep) = w.take() {
                ep.cancel_all();
            }
        }
        if let Ok(mut r) = self.reader.lock() {
            if let Some(mut half) = r.take() {
                half.endpoint.cancel_all();
            }
        }
    }
}
