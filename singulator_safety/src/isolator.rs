//! Fault-isolation state machine.
//!
//! Holds the single live [`IsolationState`] of the process. All transitions
//! are computed under one mutex; the resulting [`StateChangeEvent`] is
//! dispatched after the lock is released so a subscriber can call back into
//! the isolator without deadlocking. Subscriber failures are contained per
//! subscriber and never reach the publisher.
//!
//! Transition rules:
//! - `Isolated` exits only through [`SafetyIsolator::try_reset_isolation`].
//! - `Degraded` exits to `Normal` via recovery, or escalates via a trip.
//! - A trip while already `Isolated` returns `false` and changes nothing.

use chrono::Utc;
use parking_lot::Mutex;
use sgx::bus::EventBus;
use sgx::state::{IsolationState, StateChangeEvent, TriggerKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct IsolatorInner {
    state: IsolationState,
    last_trigger: TriggerKind,
    last_reason: String,
}

/// In-process fault isolation state machine.
pub struct SafetyIsolator {
    inner: Mutex<IsolatorInner>,
    events: EventBus<StateChangeEvent>,
}

impl SafetyIsolator {
    /// Create a new isolator in `Normal` posture.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(IsolatorInner {
                state: IsolationState::Normal,
                last_trigger: TriggerKind::Unknown,
                last_reason: String::new(),
            }),
            events: EventBus::new("isolator"),
        }
    }

    /// Current posture.
    pub fn state(&self) -> IsolationState {
        self.inner.lock().state
    }

    /// Last recorded trigger kind and reason text.
    pub fn last_trigger(&self) -> (TriggerKind, String) {
        let inner = self.inner.lock();
        (inner.last_trigger, inner.last_reason.clone())
    }

    /// State-change event bus. Events are produced only on actual
    /// transitions; `previous != current` always holds.
    pub fn events(&self) -> &EventBus<StateChangeEvent> {
        &self.events
    }

    /// Force the posture to `Isolated`.
    ///
    /// Returns `false` (and changes nothing) if already `Isolated`.
    pub fn try_trip(&self, kind: TriggerKind, reason: &str) -> bool {
        let event = {
            let mut inner = self.inner.lock();
            if inner.state == IsolationState::Isolated {
                debug!(?kind, reason, "trip ignored: already isolated");
                return false;
            }
            let previous = inner.state;
            inner.state = IsolationState::Isolated;
            inner.last_trigger = kind;
            inner.last_reason = reason.to_string();
            Self::make_event(previous, IsolationState::Isolated, kind, reason)
        };
        warn!(?kind, reason, "isolation tripped");
        self.events.publish(&event);
        true
    }

    /// Transition `Normal` → `Degraded`.
    ///
    /// Returns `false` if already `Isolated` (isolation wins) or already
    /// `Degraded`; in the latter case the new reason is still recorded.
    pub fn try_enter_degraded(&self, kind: TriggerKind, reason: &str) -> bool {
        let event = {
            let mut inner = self.inner.lock();
            match inner.state {
                IsolationState::Isolated => {
                    debug!(?kind, reason, "degrade ignored: isolated");
                    return false;
                }
                IsolationState::Degraded => {
                    inner.last_trigger = kind;
                    inner.last_reason = reason.to_string();
                    debug!(?kind, reason, "already degraded, reason recorded");
                    return false;
                }
                IsolationState::Normal => {
                    inner.state = IsolationState::Degraded;
                    inner.last_trigger = kind;
                    inner.last_reason = reason.to_string();
                    Self::make_event(IsolationState::Normal, IsolationState::Degraded, kind, reason)
                }
            }
        };
        warn!(?kind, reason, "entered degraded");
        self.events.publish(&event);
        true
    }

    /// Transition `Degraded` → `Normal`. Only valid from `Degraded`.
    pub fn try_recover_from_degraded(&self, reason: &str) -> bool {
        let event = {
            let mut inner = self.inner.lock();
            if inner.state != IsolationState::Degraded {
                return false;
            }
            inner.state = IsolationState::Normal;
            inner.last_trigger = TriggerKind::HealthRecovered;
            inner.last_reason = reason.to_string();
            Self::make_event(
                IsolationState::Degraded,
                IsolationState::Normal,
                TriggerKind::HealthRecovered,
                reason,
            )
        };
        info!(reason, "recovered from degraded");
        self.events.publish(&event);
        true
    }

    /// Transition `Isolated` → `Normal`. Only valid from `Isolated`.
    ///
    /// Checks `cancel` before committing; a cancelled reset leaves the
    /// posture untouched.
    pub fn try_reset_isolation(&self, reason: &str, cancel: &CancellationToken) -> bool {
        let event = {
            let mut inner = self.inner.lock();
            if inner.state != IsolationState::Isolated {
                return false;
            }
            if cancel.is_cancelled() {
                debug!(reason, "isolation reset abandoned: cancelled");
                return false;
            }
            inner.state = IsolationState::Normal;
            inner.last_trigger = TriggerKind::ResetButton;
            inner.last_reason = reason.to_string();
            Self::make_event(
                IsolationState::Isolated,
                IsolationState::Normal,
                TriggerKind::ResetButton,
                reason,
            )
        };
        info!(reason, "isolation reset");
        self.events.publish(&event);
        true
    }

    fn make_event(
        previous: IsolationState,
        current: IsolationState,
        kind: TriggerKind,
        reason: &str,
    ) -> StateChangeEvent {
        StateChangeEvent {
            previous,
            current,
            reason_kind: kind,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        }
    }
}

impl Default for SafetyIsolator {
    fn default() -> Self {
        Self::new()
    }
}
