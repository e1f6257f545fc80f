//! # AZ Finance Common
//!
//! Shared logging configuration for the AZ Finance offline engine.
//!
//! The engine crates log through `tracing` and never install a
//! subscriber themselves; hosts and harnesses call [`init_logging`]
//! exactly once at startup.

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat};
