// src/io/serial/mod.rs
//
// Serial port link for ASCII adapters (slcan, OBDLink).
// Read and write halves are separate handles so the receive task and the
// send task never contend for the same lock.

pub(crate) mod utils;

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::sync::Mutex;
use std::time::Duration;

use crate::io::error::IoError;
use crate::io::link::Link;
use crate::settings::AdapterConfig;

type Port = Box<dyn SerialPort>;

pub struct SerialLink {
    name: String,
    reader: Mutex<Option<Port>>,
    writer: Mutex<Option<Port>>,
}

impl SerialLink {
    /// Open `config.port` with the configured framing.
    pub fn open(config: &AdapterConfig) -> Result<Self, IoError> {
        let name = config.port.clone();
        if name.is_empty() {
            return Err(IoError::configuration("serial adapters need a port"));
        }
        let reader = utils::port_builder(config)
            .open()
            .map_err(|e| IoError::connection(&name, e.to_string()))?;
        let writer = reader
            .try_clone()
            .map_err(|e| IoError::connection(&name, format!("clone port: {}", e)))?;

        tlog!("[serial] Opened {} at {} baud", name, config.baud_rate);

        Ok(Self {
            name,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        })
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "serial port closed")
}

fn poisoned() -> io::Error {
    io::Error::other("serial port mutex poisoned")
}

impl Link for SerialLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let mut guard = self.reader.lock().map_err(|_| poisoned())?;
        let port = guard.as_mut().ok_or_else(not_connected)?;
        port.set_timeout(timeout)?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write(&self, data: &[u8], timeout: Duration) -> io::Result<usize> {
        let mut guard = self.writer.lock().map_err(|_| poisoned())?;
        let port = guard.as_mut().ok_or_else(not_connected)?;
        port.set_timeout(timeout)?;
        let mut written = 0;
        while written < data.len() {
            match port.write(&data[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut && written > 0 => break,
                Err(e) => return Err(e),
            }
        }
        port.flush()?;
        Ok(written)
    }

    fn clear_input(&self) -> io::Result<()> {
        let guard = self.reader.lock().map_err(|_| poisoned())?;
        let port = guard.as_ref().ok_or_else(not_connected)?;
        port.clear(serialport::ClearBuffer::Input)
            .map_err(|e| io::Error::other(e.to_string()))
    }

    fn close(&self) {
        if let Ok(mut w) = self.writer.lock() {
            w.take();
        }
        if let Ok(mut r) = self.reader.lock() {
            r.take();
        }
    }
}
