//! Shared Serial Command Bus
//!
//! Serializes access to one serial line on behalf of many logical servo
//! controllers: a priority queue feeds a single worker per port, replies are
//! correlated back to their commands, and failed commands are retried.

/// Commands and priorities
pub mod command;
/// Matching replies to waiting commands
pub mod correlator;
mod error;
/// Port table
pub mod manager;
/// Priority queue feeding a worker
pub mod queue;
/// Device number registry
pub mod registry;
/// Per-port worker thread
pub mod worker;

pub use command::{Command, CommandId, Priority, ResponseCallback, DEFAULT_MAX_RETRIES};
pub use correlator::{PendingResponse, ResponseCorrelator};
pub use error::BusError;
pub use manager::{default_device_id, PortManager};
pub use queue::{CommandQueue, QueueEntry};
pub use registry::{DeviceRegistry, RegistrationConflict, RegistryStats, VirtualDevice};
pub use worker::{PortState, PortStats, PortWorker};
