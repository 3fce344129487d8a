//! HTTP API Module
//!
//! Read-only views of the registry, metrics, and the live observer socket.

mod metrics;
mod routes;
mod ws;

pub use metrics::Metrics;
pub use routes::{run_api_server, ApiState};
