//! Hardware-facing interface contracts.
//!
//! The safety core never talks to vendor drivers directly; everything goes
//! through these traits. Backends are pluggable (simulation, fieldbus),
//! and all hardware calls are async because the underlying links are.
//!
//! # Lifecycle
//!
//! 1. `BusAdapter::initialize()` — once, before the pipeline subscribes IO.
//! 2. Axis commands flow only through the pipeline's consumer task.
//! 3. `BusAdapter::close()` — on shutdown or around a coordinated reset.

use crate::state::{ControlMode, IndicatorState, TriggerKind};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Error types for hardware operations.
#[derive(Debug, Clone, Error)]
pub enum HalError {
    /// Adapter initialization failed.
    #[error("Initialization failed: {0}")]
    InitFailed(String),

    /// Hardware communication error.
    #[error("Hardware communication error: {0}")]
    CommunicationError(String),

    /// Operation rejected by current device state.
    #[error("Operation rejected: {0}")]
    Rejected(String),

    /// Backing store error (options, telemetry).
    #[error("Store error: {0}")]
    StoreError(String),
}

/// Aggregate control over every conveyor axis.
///
/// Implementations issue the command to all configured axes and report the
/// first failure; the pipeline treats any error as a degraded condition,
/// never as fatal.
#[async_trait]
pub trait AxisController: Send + Sync {
    /// Enable all axis drives.
    async fn enable_all(&self) -> Result<(), HalError>;
    /// Disable all axis drives.
    async fn disable_all(&self) -> Result<(), HalError>;
    /// Write one speed setpoint to all axes [mm/s].
    async fn write_speed_all(&self, speed_mm_s: f64) -> Result<(), HalError>;
    /// Immediate stop of all axes.
    async fn stop_all(&self) -> Result<(), HalError>;
    /// Latch the staged per-axis speed set into the drives.
    async fn apply_speed_set(&self) -> Result<(), HalError>;
}

/// Connection-level control of the shared motion controller.
#[async_trait]
pub trait BusAdapter: Send + Sync {
    /// Open the hardware link and bring the bus up.
    async fn initialize(&self) -> Result<(), HalError>;
    /// Close the hardware link.
    async fn close(&self) -> Result<(), HalError>;
    /// Clear bus-level error registers without dropping the link.
    async fn reset_errors(&self) -> Result<(), HalError>;
    /// Soft-reset the controller (link survives, state is reloaded).
    async fn warm_reset(&self) -> Result<(), HalError>;
    /// Whether the link is currently up.
    fn is_initialized(&self) -> bool;
}

/// Stack light / machine state indicator.
#[async_trait]
pub trait IndicatorLightService: Send + Sync {
    /// Drive the indicator to the given state.
    async fn update_state(&self, state: IndicatorState) -> Result<(), HalError>;
    /// Last state the indicator was driven to.
    fn current_state(&self) -> IndicatorState;
}

/// Best-effort realtime telemetry sink.
///
/// Failures here must never affect control flow; callers log and continue.
#[async_trait]
pub trait RealtimeNotifier: Send + Sync {
    /// Publish a device-level payload to connected clients.
    async fn publish_device(&self, payload: serde_json::Value) -> Result<(), HalError>;
}

/// Runtime-changeable options backed by an external store.
#[async_trait]
pub trait OptionsStore<T: Clone + Send + Sync + 'static>: Send + Sync {
    /// Fetch the current options value.
    async fn get(&self) -> Result<T, HalError>;
}

/// Options consumed by the pipeline's local-mode start path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedOptions {
    /// Fixed conveyor speed written in local mode [mm/s].
    pub fixed_speed_mm_s: f64,
}

/// Events raised by physical IO modules (buttons, estop circuit, mode key).
#[derive(Debug, Clone, PartialEq)]
pub enum IoEvent {
    /// Emergency stop circuit opened.
    EmergencyStop,
    /// Stop button pressed.
    StopRequested,
    /// Start button pressed.
    StartRequested,
    /// Reset button pressed.
    ResetRequested,
    /// Mode key switched between local and remote.
    RemoteLocalModeChanged(ControlMode),
}

/// Health signal for a single axis.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisHealthEvent {
    /// `AxisFault`, `AxisDisconnected` or `HealthRecovered`.
    pub kind: TriggerKind,
    /// Axis name as configured on the bus.
    pub axis: String,
    /// Driver-provided detail text.
    pub reason: String,
}

/// Cheap cloneable callback sink for pushing events into a consumer.
///
/// Unlike [`crate::bus::EventBus`], delivery is synchronous and ordered —
/// this is the producer side of the pipeline's serialized operation queue.
#[derive(Clone)]
pub struct EventSink<E>(Arc<dyn Fn(E) + Send + Sync>);

impl<E> EventSink<E> {
    /// Wrap a delivery function.
    pub fn new<F: Fn(E) + Send + Sync + 'static>(f: F) -> Self {
        Self(Arc::new(f))
    }

    /// Deliver one event.
    pub fn send(&self, event: E) {
        (self.0)(event)
    }
}

/// A source of physical IO events.
pub trait IoModule: Send + Sync {
    /// Module name for logs.
    fn name(&self) -> &str;
    /// Begin delivering events into `sink`. Called once by the pipeline
    /// after startup gating; implementations must not deliver before this.
    fn subscribe(&self, sink: EventSink<IoEvent>);
}
