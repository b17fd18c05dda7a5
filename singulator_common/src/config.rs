//! Configuration loading traits and types.
//!
//! Provides a standardized way to load TOML configuration files across all
//! singulator applications, plus the per-component config structs. Every
//! timing knob of the safety core (lock wait, watchdog tick, staleness
//! threshold, recovery delays) lives here rather than in code.
//!
//! # Usage
//!
//! ```rust,no_run
//! use singulator_common::config::{ConfigLoader, SingulatorConfig};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), singulator_common::config::ConfigError> {
//! let config = SingulatorConfig::load(Path::new("singulator.toml"))?;
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

/// Common configuration fields shared across all singulator applications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Application instance identifier.
    pub service_name: String,
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Safety pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Fixed conveyor speed written in local mode [mm/s].
    #[serde(default = "default_fixed_speed")]
    pub fixed_speed_mm_s: f64,

    /// How long to wait for bus initialization before subscribing IO modules [s].
    #[serde(default = "default_startup_timeout")]
    pub startup_init_timeout_s: u64,

    /// Interval between initialization polls during startup gating [ms].
    #[serde(default = "default_startup_poll")]
    pub startup_poll_interval_ms: u64,
}

fn default_fixed_speed() -> f64 {
    250.0
}
fn default_startup_timeout() -> u64 {
    60
}
fn default_startup_poll() -> u64 {
    500
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fixed_speed_mm_s: default_fixed_speed(),
            startup_init_timeout_s: default_startup_timeout(),
            startup_poll_interval_ms: default_startup_poll(),
        }
    }
}

impl PipelineConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.fixed_speed_mm_s.is_finite() || self.fixed_speed_mm_s < 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "fixed_speed_mm_s must be finite and >= 0, got {}",
                self.fixed_speed_mm_s
            )));
        }
        if self.startup_poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "startup_poll_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Frame admission and heartbeat watchdog tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameGuardConfig {
    /// Retained window of recent frame sequence numbers.
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Heartbeat channel number; 0 disables the watchdog entirely.
    #[serde(default)]
    pub heartbeat_channel: u16,

    /// Heartbeat staleness threshold [ms].
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,

    /// Watchdog check interval [ms].
    #[serde(default = "default_watchdog_tick")]
    pub watchdog_tick_ms: u64,
}

fn default_window_size() -> usize {
    128
}
fn default_heartbeat_timeout() -> u64 {
    1000
}
fn default_watchdog_tick() -> u64 {
    200
}

impl Default for FrameGuardConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            heartbeat_channel: 0,
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            watchdog_tick_ms: default_watchdog_tick(),
        }
    }
}

impl FrameGuardConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::ValidationError(
                "window_size must be > 0".to_string(),
            ));
        }
        if self.watchdog_tick_ms == 0 {
            return Err(ConfigError::ValidationError(
                "watchdog_tick_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the heartbeat watchdog should run at all.
    #[inline]
    pub const fn heartbeat_enabled(&self) -> bool {
        self.heartbeat_channel != 0
    }
}

/// Cross-process reset coordination tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Hardware resource id shared by all cooperating processes.
    pub card_id: u32,

    /// Namespace prefix for machine-wide lock and mailbox names.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Maximum wait for the machine-wide reset lock [ms].
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,

    /// Mailbox poll interval [ms].
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Notifications older than this are discarded [s].
    #[serde(default = "default_staleness")]
    pub staleness_secs: u64,

    /// Grace delay between broadcast and closing the connection [ms].
    #[serde(default = "default_grace")]
    pub broadcast_grace_ms: u64,

    /// Recovery delay after a cold (power-cycle) reset [s].
    #[serde(default = "default_cold_recovery")]
    pub cold_recovery_secs: u64,

    /// Recovery delay after a warm (soft) reset [s].
    #[serde(default = "default_warm_recovery")]
    pub warm_recovery_secs: u64,
}

fn default_namespace() -> String {
    "sgx".to_string()
}
fn default_lock_timeout() -> u64 {
    5000
}
fn default_poll_interval() -> u64 {
    500
}
fn default_staleness() -> u64 {
    30
}
fn default_grace() -> u64 {
    500
}
fn default_cold_recovery() -> u64 {
    15
}
fn default_warm_recovery() -> u64 {
    2
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            card_id: 0,
            namespace: default_namespace(),
            lock_timeout_ms: default_lock_timeout(),
            poll_interval_ms: default_poll_interval(),
            staleness_secs: default_staleness(),
            broadcast_grace_ms: default_grace(),
            cold_recovery_secs: default_cold_recovery(),
            warm_recovery_secs: default_warm_recovery(),
        }
    }
}

impl CoordinatorConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.is_empty() {
            return Err(ConfigError::ValidationError(
                "namespace cannot be empty".to_string(),
            ));
        }
        if self.namespace.contains(['/', '\0']) {
            return Err(ConfigError::ValidationError(format!(
                "namespace must be a plain name, got {:?}",
                self.namespace
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poll_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration for the supervisor binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingulatorConfig {
    /// Shared fields (logging, service identity).
    pub shared: SharedConfig,
    /// Safety pipeline tuning.
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Frame guard tuning.
    #[serde(default)]
    pub frame_guard: FrameGuardConfig,
    /// Reset coordinator tuning.
    pub coordinator: CoordinatorConfig,
}

impl SingulatorConfig {
    /// Validate the full configuration tree.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;
        self.pipeline.validate()?;
        self.frame_guard.validate()?;
        self.coordinator.validate()?;
        Ok(())
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
/// - Returns `ConfigError::ValidationError` if semantic validation fails
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Blanket implementation for all types that implement DeserializeOwned.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
