//! Safety posture enums and state-change events.
//!
//! All enums use `#[repr(u8)]` for compact layout. `IsolationState` is the
//! system-wide safety posture; exactly one live value exists per process,
//! owned by the isolator. `StateChangeEvent` is immutable and produced only
//! on an actual transition — previous and current never compare equal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// System-wide safety posture.
///
/// `Isolated` exits only via an explicit reset. `Degraded` exits to `Normal`
/// via recovery or escalates to `Isolated` via a trip. `Isolated` never
/// silently downgrades to `Degraded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum IsolationState {
    /// All safety conditions satisfied.
    Normal = 0,
    /// Recoverable fault active — motion inhibited until recovery.
    Degraded = 1,
    /// Tripped — requires an explicit reset to resume.
    Isolated = 2,
}

impl IsolationState {
    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Normal),
            1 => Some(Self::Degraded),
            2 => Some(Self::Isolated),
            _ => None,
        }
    }
}

impl Default for IsolationState {
    fn default() -> Self {
        Self::Normal
    }
}

/// Origin of a safety transition or command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TriggerKind {
    /// Hardware emergency stop circuit.
    EmergencyStop = 0,
    /// Physical stop button.
    StopButton = 1,
    /// Physical start button.
    StartButton = 2,
    /// Physical reset button.
    ResetButton = 3,
    /// An axis drive reported a fault.
    AxisFault = 4,
    /// An axis dropped off the bus.
    AxisDisconnected = 5,
    /// Upstream heartbeat went stale.
    HeartbeatTimeout = 6,
    /// A previously faulted source reported healthy again.
    HealthRecovered = 7,
    /// Origin could not be determined.
    Unknown = 8,
}

impl TriggerKind {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::EmergencyStop),
            1 => Some(Self::StopButton),
            2 => Some(Self::StartButton),
            3 => Some(Self::ResetButton),
            4 => Some(Self::AxisFault),
            5 => Some(Self::AxisDisconnected),
            6 => Some(Self::HeartbeatTimeout),
            7 => Some(Self::HealthRecovered),
            8 => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl Default for TriggerKind {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Immutable record of one isolation transition.
///
/// Produced only when the posture actually changes; consumers may rely on
/// `previous != current`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangeEvent {
    /// Posture before the transition.
    pub previous: IsolationState,
    /// Posture after the transition.
    pub current: IsolationState,
    /// What caused the transition.
    pub reason_kind: TriggerKind,
    /// Human-readable reason text.
    pub reason: String,
    /// When the transition was committed.
    pub timestamp: DateTime<Utc>,
}

/// Externally observed machine run state, mirrored on the indicator light.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum IndicatorState {
    /// Axes disabled, no alarm.
    Stopped = 0,
    /// Reset complete, ready to start.
    Ready = 1,
    /// Axes enabled and commanded.
    Running = 2,
    /// Emergency stop or unrecovered fault.
    Alarm = 3,
}

impl IndicatorState {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Stopped),
            1 => Some(Self::Ready),
            2 => Some(Self::Running),
            3 => Some(Self::Alarm),
            _ => None,
        }
    }
}

impl Default for IndicatorState {
    fn default() -> Self {
        Self::Stopped
    }
}

/// Speed-command ownership mode.
///
/// In `Remote` mode speed setpoints arrive from the upstream vision layer;
/// in `Local` mode the configured fixed speed is written directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ControlMode {
    /// Fixed-speed operation driven by the local configuration.
    Local = 0,
    /// Speed pushed by the remote upstream source.
    Remote = 1,
}

impl Default for ControlMode {
    fn default() -> Self {
        Self::Local
    }
}
