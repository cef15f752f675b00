//! # servobus Core Library
//!
//! Shares one serial line between many addressable servo controllers.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - The addressed binary protocol spoken by servo controllers on a shared line
//! - One worker thread per port that executes commands in priority order
//! - Correlation of replies with the commands that asked for them
//! - Per-controller handles with fire-and-forget writes and callback reads
//! - A simulated bus for running everything without hardware
//!
//! ## Example
//!
//! ```rust,no_run
//! use servobus_core::prelude::*;
//! use std::time::Duration;
//!
//! let manager = PortManager::new(BusConfig::default());
//! let mut head = manager.controller("/dev/ttyUSB0", 12)?;
//! head.detect_channel_count(Duration::from_millis(200));
//!
//! head.set_target(5, 1500.0, Priority::Normal);
//! let position = head.get_position_sync(5, Duration::from_millis(500));
//! println!("channel 5 at {:?}", position);
//!
//! manager.shutdown_all();
//! # Ok::<(), servobus_core::bus::BusError>(())
//! ```

/// Shared serial command bus
pub mod bus;
/// Bus configuration
pub mod config;
/// Per-controller handles
pub mod device;
/// Wire protocol and transports
pub mod protocol;
/// Simulated bus
pub mod sim;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::bus::{
        BusError, Command, PortManager, PortState, PortStats, PortWorker, Priority,
    };
    pub use crate::config::BusConfig;
    pub use crate::device::{ControllerStatus, ServoController};
    pub use crate::protocol::{CommandKind, ControllerErrors, ProtocolError, Response, ScriptState};
    pub use crate::sim::SimulatedBus;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
