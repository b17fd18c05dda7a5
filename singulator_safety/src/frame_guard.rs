//! Admission control for upstream motion frames.
//!
//! Two independent concerns, deliberately on separate locks so frame
//! admission and heartbeat checking never contend:
//!
//! - a bounded FIFO window of recently seen positive sequence numbers
//!   (queue and membership set kept in lock-step) used to reject duplicates;
//! - a heartbeat watchdog task that pushes the isolator into `Degraded`
//!   when the upstream source goes quiet, latched so the trip fires once
//!   per outage.
//!
//! Speed pass-through is exact: no scaling is ever applied to an accepted
//! frame, including while `Degraded`.

use crate::isolator::SafetyIsolator;
use parking_lot::Mutex;
use sgx::bus::SubscriptionId;
use sgx::config::FrameGuardConfig;
use sgx::state::{IsolationState, StateChangeEvent, TriggerKind};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One upstream speed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionFrame {
    /// Source sequence number; values <= 0 mean the source is unsequenced.
    pub sequence: i64,
    /// Commanded speed [mm/s]; forwarded exactly when accepted.
    pub speed_mm_s: f64,
}

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameDecision {
    /// Whether the frame may reach motion control.
    pub accepted: bool,
    /// The evaluated frame, unmodified.
    pub frame: MotionFrame,
    /// Why the frame was rejected, if it was.
    pub reject_reason: Option<String>,
}

impl FrameDecision {
    fn accept(frame: MotionFrame) -> Self {
        Self {
            accepted: true,
            frame,
            reject_reason: None,
        }
    }

    fn reject(frame: MotionFrame, reason: &str) -> Self {
        Self {
            accepted: false,
            frame,
            reject_reason: Some(reason.to_string()),
        }
    }
}

/// Queue + membership set, evicted in lock-step.
struct SequenceWindow {
    order: VecDeque<i64>,
    members: HashSet<i64>,
    capacity: usize,
}

impl SequenceWindow {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    fn contains(&self, seq: i64) -> bool {
        self.members.contains(&seq)
    }

    /// Insert `seq`, evicting the oldest entry when over capacity. Both
    /// structures change together or not at all.
    fn insert(&mut self, seq: i64) {
        self.order.push_back(seq);
        self.members.insert(seq);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }
}

/// Frame admission guard with heartbeat watchdog.
pub struct FrameGuard {
    isolator: Arc<SafetyIsolator>,
    config: FrameGuardConfig,
    window: Mutex<SequenceWindow>,
    last_heartbeat: Mutex<Instant>,
    /// Set when the watchdog has already degraded the isolator for the
    /// current outage; cleared by a heartbeat or by recovery to Normal.
    heartbeat_latched: Arc<AtomicBool>,
    initialized: AtomicBool,
    cancel: CancellationToken,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    isolator_sub: Mutex<Option<SubscriptionId>>,
}

impl FrameGuard {
    /// Create a guard; call [`FrameGuard::initialize`] to arm the watchdog.
    pub fn new(isolator: Arc<SafetyIsolator>, config: FrameGuardConfig) -> Self {
        Self {
            isolator,
            window: Mutex::new(SequenceWindow::new(config.window_size)),
            config,
            last_heartbeat: Mutex::new(Instant::now()),
            heartbeat_latched: Arc::new(AtomicBool::new(false)),
            initialized: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            watchdog: Mutex::new(None),
            isolator_sub: Mutex::new(None),
        }
    }

    /// Evaluate one frame.
    ///
    /// Order of checks: isolation, unsequenced pass-through, duplicate
    /// window, accept-and-insert. Accepted speed always equals the
    /// commanded value exactly.
    pub fn evaluate(&self, frame: MotionFrame) -> FrameDecision {
        if self.isolator.state() == IsolationState::Isolated {
            return FrameDecision::reject(frame, "isolated");
        }

        if frame.sequence <= 0 {
            return FrameDecision::accept(frame);
        }

        let mut window = self.window.lock();
        if window.contains(frame.sequence) {
            debug!(sequence = frame.sequence, "duplicate frame rejected");
            return FrameDecision::reject(frame, "duplicate");
        }
        window.insert(frame.sequence);
        drop(window);

        FrameDecision::accept(frame)
    }

    /// Record a heartbeat from the upstream source.
    ///
    /// Also clears the watchdog latch so a future outage can trip again.
    pub fn report_heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
        self.heartbeat_latched.store(false, Ordering::Release);
    }

    /// Arm the heartbeat watchdog and subscribe to isolator recovery.
    ///
    /// Idempotent: a second call is a no-op returning `false`. When the
    /// heartbeat channel is configured as 0, the watchdog is never started
    /// (explicit opt-out, not an error) but the call still claims
    /// initialization.
    pub async fn initialize(self: &Arc<Self>) -> bool {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return false;
        }

        // Recovery to Normal re-arms the latch.
        let latch = Arc::clone(&self.heartbeat_latched);
        let sub = self.isolator.events().subscribe(move |ev: StateChangeEvent| {
            if ev.current == IsolationState::Normal {
                latch.store(false, Ordering::Release);
            }
        });
        *self.isolator_sub.lock() = Some(sub);

        if !self.config.heartbeat_enabled() {
            info!("heartbeat channel disabled, watchdog not started");
            return true;
        }

        *self.last_heartbeat.lock() = Instant::now();
        let guard = Arc::clone(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut tick = interval(Duration::from_millis(guard.config.watchdog_tick_ms));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => guard.check_heartbeat(),
                }
            }
        });
        *self.watchdog.lock() = Some(handle);
        info!(
            timeout_ms = self.config.heartbeat_timeout_ms,
            tick_ms = self.config.watchdog_tick_ms,
            "heartbeat watchdog armed"
        );
        true
    }

    fn check_heartbeat(&self) {
        let elapsed = self.last_heartbeat.lock().elapsed();
        if elapsed < Duration::from_millis(self.config.heartbeat_timeout_ms) {
            return;
        }
        if self.heartbeat_latched.load(Ordering::Acquire) {
            return;
        }
        let reason = format!("no upstream heartbeat for {} ms", elapsed.as_millis());
        warn!(%reason, "heartbeat timeout");
        if self
            .isolator
            .try_enter_degraded(TriggerKind::HeartbeatTimeout, &reason)
        {
            self.heartbeat_latched.store(true, Ordering::Release);
        }
    }

    /// Cancel the watchdog, await its shutdown and unsubscribe from
    /// isolator events. Safe to call more than once.
    pub async fn dispose(&self) {
        self.cancel.cancel();
        let handle = self.watchdog.lock().take();
        if let Some(handle) = handle {
            // Swallow cancellation/panics; shutdown must not propagate.
            let _ = handle.await;
        }
        if let Some(sub) = self.isolator_sub.lock().take() {
            self.isolator.events().unsubscribe(sub);
        }
    }
}
