//! Observability subsystem.
//!
//! Structured logging only; the tunnel core emits `tracing` events and the
//! binaries initialize the subscriber here.

pub mod logging;

pub use logging::init_logging;
