//! Worker Configuration Module
//!
//! Settings for the link and correction workers, loaded from TOML with
//! environment overrides.
//!
//! ## Loading Order
//!
//! 1. `TIMESYNC_CONFIG` environment variable (path to TOML file)
//! 2. `timesync.toml` in the current working directory
//! 3. Built-in defaults (see [`defaults`])
//!
//! Environment variables (`DATABASE_URL`, `TIMESYNC_*`) are applied on top,
//! then CLI flags in the binary.

mod timesync_config;
pub mod defaults;

pub use timesync_config::*;
