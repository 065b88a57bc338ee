//! Structured logging setup shared by the server binaries.

pub mod tracing_setup;

pub use tracing_setup::setup_logging;
