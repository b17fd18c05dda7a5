//! Singulator Common Library
//!
//! Shared types and contracts for all singulator workspace crates.
//!
//! # Module Structure
//!
//! - [`state`] - Isolation states, trigger kinds and state-change events
//! - [`config`] - TOML configuration loading traits and component configs
//! - [`bus`] - Typed publish/subscribe registry with per-subscriber isolation
//! - [`hal`] - Hardware-facing interface traits (axes, bus, indicator, telemetry)
//!
//! # Usage
//!
//! Add to your `Cargo.toml` with alias for shorter imports:
//! ```toml
//! [dependencies]
//! sgx = { package = "singulator_common", path = "../singulator_common" }
//! ```

pub mod bus;
pub mod config;
pub mod hal;
pub mod state;
