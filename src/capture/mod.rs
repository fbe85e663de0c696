//! Screen capture subsystem
//!
//! Outbound path: screen source, snapshot render loop and transmit cadence.

pub mod sampler;
pub mod scheduler;
pub mod source;

pub use sampler::{FrameSampler, Snapshot, SnapshotReceiver};
pub use scheduler::{CaptureScheduler, FrameTick};
pub use source::{list_monitors, MonitorProvider, ScreenProvider, ScreenSource};
