//! # Configuration Modules
//!
//! This module aggregates the configuration providers of the relay agent.

/// Loads and validates the flat JSON relay configuration.
pub mod config_relay;
