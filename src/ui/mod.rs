//! Local preview/status web UI

pub mod handlers;
pub mod server;

pub use handlers::UiState;
pub use server::{router, WebServer};
