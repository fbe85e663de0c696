//! Network subsystem for the session's duplex channel

pub mod transport;

pub use transport::{StreamTransport, TransportEvent, TransportEvents, TransportState, TransportStats};
