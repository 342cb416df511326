//! # Core Engine Module
//!
//! This module forms the heart of the magnet relay agent. It owns the loop
//! that moves one record per cycle from the data logger's FTP server to the
//! MQTT broker, and the bookkeeping that watches the agent's own health.
//!
//! ## Core Components:
//!
//! - **`scheduler`**: The self-scheduling state machine. It runs discovery,
//!   download, extraction and publishing strictly in sequence, picks the poll
//!   or retry interval from the outcome, isolates panicking cycles behind a
//!   cooldown and stops cleanly on a shutdown signal.
//!
//! - **`leak_detector`**: A resident-memory watchdog. It compares periodic
//!   readings against a baseline and flags both large absolute growth and
//!   sustained step-by-step growth.
//!
//! By declaring and re-exporting these components, the `core` module gives the
//! `daemons` binaries a single place to wire the agent together.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Resident-memory growth heuristics over an owned baseline.
pub mod leak_detector;
/// The cycle state machine and daemon loop.
pub mod scheduler;

// --- Public API Re-exports ---
pub use leak_detector::{LeakBaseline, LeakDetector};
pub use scheduler::{
    CycleFault, CycleOutcome, CycleReport, CycleState, Scheduler, SchedulerSettings,
};
