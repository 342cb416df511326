//! # Utilities Module
//!
//! General-purpose helpers shared by the `core` and `ingestors` modules.
//!
//! ## Contained Modules:
//!
//! - **`misc`**: A submodule for miscellaneous functions, currently the
//!   process memory probe and byte formatting (`sys_info`).

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Miscellaneous utility functions, including process memory information.
pub mod misc;
