//! # lib_common
//!
//! Shared building blocks of the magnet relay agent. Every top-level folder is
//! gated behind a cargo feature of the same name so the binaries only compile
//! what they use; `full` turns everything on.
//!
//! - **`configs`**: the flat JSON relay configuration and its validation.
//! - **`loggers`**: the size-rotated log file sink used by the fern dispatcher.
//! - **`utils`**: process memory probing and byte formatting.
//! - **`ingestors`**: remote file discovery, FTP transfer and record extraction.
//! - **`connections`**: the MQTT publisher with delivery confirmation.
//! - **`core`**: the scheduling loop and the memory-growth leak detector.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

#[cfg(feature = "configs")]
pub mod configs;
#[cfg(feature = "connections")]
pub mod connections;
#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "ingestors")]
pub mod ingestors;
#[cfg(feature = "loggers")]
pub mod loggers;
#[cfg(feature = "utils")]
pub mod utils;

// Re-export the types the binaries wire together.
#[cfg(feature = "configs")]
pub use configs::config_relay::{ConfigError, RelayConfig};
#[cfg(feature = "core")]
pub use crate::core::{LeakDetector, Scheduler, SchedulerSettings};
