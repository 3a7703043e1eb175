// src/lib.rs
//
// canhub: one duplex CAN frame interface over CombiAdapter (USB), SLCAN and
// OBDLink (serial) devices, and vendor pass-through libraries.

#[macro_use]
mod logging;

pub mod io;
pub mod settings;

pub use io::registry::{self, AdapterRegistry};
pub use io::{
    Adapter, AdapterState, AdapterTraits, Direction, ErrorEvent, ErrorStream, Frame, FrameSender,
    IoError, StatsSnapshot, Subscription,
};
pub use logging::{file_logging_active, init_file_logging, stop_file_logging};
pub use settings::{AdapterConfig, AdapterFile, Bitrate};
