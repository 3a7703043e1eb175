// src/io/error.rs
//
// Typed errors for links, adapters and the I/O engine.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by adapters and the engine.
///
/// Parser-local problems are not represented here; they travel as
/// [`ProtocolError`](crate::io::ProtocolError) on the error-event stream.
#[derive(Clone, Debug, Error)]
pub enum IoError {
    #[error("{device}: connection failed: {message}")]
    Connection { device: String, message: String },

    #[error("{device}: protocol error: {message}")]
    Protocol { device: String, message: String },

    #[error("{device}: read failed: {message}")]
    Read { device: String, message: String, fatal: bool },

    #[error("{device}: write failed: {message}")]
    Write { device: String, message: String },

    #[error("{device}: short write ({written} of {expected} bytes)")]
    ShortWrite {
        device: String,
        written: usize,
        expected: usize,
    },

    #[error("{device}: timed out after {after:?} waiting for {what}")]
    Timeout {
        device: String,
        what: String,
        after: Duration,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// A control command is already outstanding on this adapter.
    #[error("{device}: control pipe busy (command 0x{pending:02X} outstanding)")]
    Busy { device: String, pending: u8 },

    #[error("{device}: {queue} queue full")]
    QueueFull { device: String, queue: &'static str },

    #[error("{device}: adapter is closed")]
    Closed { device: String },

    /// The device answered a control command with NAK.
    #[error("{device}: command 0x{command:02X} rejected by device")]
    Rejected { device: String, command: u8 },

    #[error("{device}: {what} is not supported")]
    Unsupported { device: String, what: String },

    #[error("unknown adapter '{0}'")]
    UnknownAdapter(String),

    /// Open failed at `stage`; everything acquired before it was released.
    #[error("{device}: open failed during {stage}: {cause}")]
    OpenFailed {
        device: String,
        stage: &'static str,
        cause: Box<IoError>,
    },

    #[error("{device}: pass-through call {call} failed (code {code}): {message}")]
    PassThru {
        device: String,
        call: &'static str,
        code: i32,
        message: String,
    },
}

impl IoError {
    pub fn connection(device: impl Into<String>, message: impl Into<String>) -> Self {
        IoError::Connection {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn protocol(device: impl Into<String>, message: impl Into<String>) -> Self {
        IoError::Protocol {
            device: device.into(),
            message: message.into(),
        }
    }

    /// A read error that the receive loop may retry.
    pub fn read(device: impl Into<String>, message: impl Into<String>) -> Self {
        IoError::Read {
            device: device.into(),
            message: message.into(),
            fatal: false,
        }
    }

    /// A read error after which the link is unusable (device unplugged).
    pub fn read_fatal(device: impl Into<String>, message: impl Into<String>) -> Self {
        IoError::Read {
            device: device.into(),
            message: message.into(),
            fatal: true,
        }
    }

    pub fn write(device: impl Into<String>, message: impl Into<String>) -> Self {
        IoError::Write {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn timeout(device: impl Into<String>, what: impl Into<String>, after: Duration) -> Self {
        IoError::Timeout {
            device: device.into(),
            what: what.into(),
            after,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        IoError::Configuration(message.into())
    }

    pub fn closed(device: impl Into<String>) -> Self {
        IoError::Closed {
            device: device.into(),
        }
    }

    pub fn unsupported(device: impl Into<String>, what: impl Into<String>) -> Self {
        IoError::Unsupported {
            device: device.into(),
            what: what.into(),
        }
    }

    /// Wrap a failure from one step of `open`.
    pub fn open_failed(device: impl Into<String>, stage: &'static str, cause: IoError) -> Self {
        IoError::OpenFailed {
            device: device.into(),
            stage,
            cause: Box::new(cause),
        }
    }

    /// Whether the link behind the adapter must be considered lost.
    pub fn is_fatal(&self) -> bool {
        match self {
            IoError::Read { fatal, .. } => *fatal,
            IoError::Write { .. } | IoError::ShortWrite { .. } | IoError::Connection { .. } => true,
            IoError::OpenFailed { cause, .. } => cause.is_fatal(),
            _ => false,
        }
    }

    /// Whether this is a timeout, regardless of what was awaited.
    pub fn is_timeout(&self) -> bool {
        matches!(self, IoError::Timeout { .. })
    }
}

impl From<IoError> for String {
    fn from(err: IoError) -> Self {
        err.to_string()
    }
}

/// How the receive loop should treat a failed read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadFault {
    /// Nothing arrived within the read timeout.
    Idle,
    /// A single bad read; report and retry.
    Transient,
    /// The link is gone.
    Fatal,
}

/// Classify a `std::io::Error` returned by a link read.
pub fn classify_read_error(err: &std::io::Error) -> ReadFault {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted => ReadFault::Idle,
        ErrorKind::BrokenPipe
        | ErrorKind::NotConnected
        | ErrorKind::UnexpectedEof
        | ErrorKind::PermissionDenied
        | ErrorKind::NotFound => ReadFault::Fatal,
        _ => ReadFault::Transient,
    }
}
