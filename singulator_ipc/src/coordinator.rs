//! Cross-process coordination of shared motion-controller resets.
//!
//! Only one process on the machine may reset the controller at a time; the
//! originator takes the machine-wide lock, announces the reset through the
//! mailbox, performs it, and releases the lock no matter how the reset
//! went. Every other process reacts to the announcement by tearing down
//! its own link, waiting out the controller's recovery, and reconnecting.

use crate::error::IpcResult;
use crate::lock::ExclusiveResourceLock;
use crate::mailbox::{ResetBroadcastChannel, ResetKind, ResetNotification};
use chrono::Utc;
use sgx::bus::EventBus;
use sgx::config::CoordinatorConfig;
use sgx::hal::{AxisController, BusAdapter, EventSink};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Lifecycle events other components can observe.
///
/// The supervisor pauses the safety pipeline on `ReconnectionStarting` and
/// resumes it on `ReconnectionCompleted`, so no axis command races a
/// half-reconnected bus.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    /// A reset (local or remote) is about to take the bus down.
    ReconnectionStarting {
        /// Reset kind in flight.
        kind: ResetKind,
    },
    /// The bus is back up after a reset.
    ReconnectionCompleted {
        /// Reset kind that completed.
        kind: ResetKind,
    },
    /// The machine-wide lock was taken over from a dead holder.
    AbandonedLockRecovered {
        /// Pid of the dead previous holder.
        holder_pid: u32,
    },
}

/// Coordinates controller resets across every process sharing one card.
pub struct DistributedResetCoordinator {
    axes: Arc<dyn AxisController>,
    bus: Arc<dyn BusAdapter>,
    config: CoordinatorConfig,
    lock: ExclusiveResourceLock,
    channel: Arc<ResetBroadcastChannel>,
    events: EventBus<CoordinatorEvent>,
    /// Serializes reactions to peer announcements; two quick announcements
    /// must never run overlapping teardown/reconnect flows on one bus.
    follow_gate: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    process_name: String,
    self_pid: u32,
}

impl DistributedResetCoordinator {
    /// Build a coordinator for the configured card.
    ///
    /// Lock and mailbox live under `/dev/shm` as
    /// `<namespace>_reset_card<id>.lock` and `<namespace>_reset_card<id>`.
    pub fn new(
        axes: Arc<dyn AxisController>,
        bus: Arc<dyn BusAdapter>,
        config: CoordinatorConfig,
    ) -> Self {
        let base = PathBuf::from("/dev/shm");
        Self::with_base_dir(axes, bus, config, base)
    }

    /// Same as [`DistributedResetCoordinator::new`] with an explicit base
    /// directory for the lock and slot files.
    pub fn with_base_dir(
        axes: Arc<dyn AxisController>,
        bus: Arc<dyn BusAdapter>,
        config: CoordinatorConfig,
        base: PathBuf,
    ) -> Self {
        let resource = format!("{}_reset_card{}", config.namespace, config.card_id);
        let lock = ExclusiveResourceLock::new(base.join(format!("{resource}.lock")), &resource);
        let self_pid = std::process::id();
        let channel = Arc::new(ResetBroadcastChannel::open(
            base.join(&resource),
            self_pid,
            Duration::from_millis(config.poll_interval_ms),
            Duration::from_secs(config.staleness_secs),
        ));
        Self {
            axes,
            bus,
            config,
            lock,
            channel,
            events: EventBus::new("coordinator"),
            follow_gate: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
            process_name: process_name(),
            self_pid,
        }
    }

    /// Lifecycle event bus.
    pub fn events(&self) -> &EventBus<CoordinatorEvent> {
        &self.events
    }

    /// Begin watching the mailbox for resets announced by peers.
    pub fn start(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        self.channel
            .start(EventSink::new(move |n: ResetNotification| {
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move {
                    coordinator.follow_remote_reset(n).await;
                });
            }));
    }

    /// Stop watching and drop any held lock.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.channel.dispose().await;
        self.lock.release();
    }

    /// Originate a full teardown-and-reinitialize of the controller.
    pub async fn cold_reset(&self) -> IpcResult<()> {
        self.coordinated_reset(ResetKind::Cold).await
    }

    /// Originate a soft controller reset; the link stays up.
    pub async fn warm_reset(&self) -> IpcResult<()> {
        self.coordinated_reset(ResetKind::Warm).await
    }

    async fn coordinated_reset(&self, kind: ResetKind) -> IpcResult<()> {
        let acquisition = self
            .lock
            .acquire(
                Duration::from_millis(self.config.lock_timeout_ms),
                Duration::from_millis(self.config.poll_interval_ms),
                &self.cancel,
            )
            .await?;
        if let Some(holder_pid) = acquisition.abandoned_holder {
            self.events
                .publish(&CoordinatorEvent::AbandonedLockRecovered { holder_pid });
        }

        // The lock is released whatever happens past this point.
        let result = self.perform_reset(kind).await;
        self.lock.release();
        result
    }

    async fn perform_reset(&self, kind: ResetKind) -> IpcResult<()> {
        info!(kind = %kind, "originating coordinated reset");

        // Announce first so peers stop driving axes before the bus drops.
        let notification = ResetNotification {
            card_id: self.config.card_id,
            kind: kind.clone(),
            pid: self.self_pid,
            process_name: self.process_name.clone(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.channel.publish(&notification) {
            warn!(error = %e, "reset announcement failed, proceeding under lock alone");
        }
        tokio::time::sleep(Duration::from_millis(self.config.broadcast_grace_ms)).await;

        self.events
            .publish(&CoordinatorEvent::ReconnectionStarting { kind: kind.clone() });
        self.quiesce_axes().await;

        // Both kinds end with a dropped link, a recovery wait sized to the
        // kind, and a fresh initialize; warm additionally soft-resets the
        // controller first.
        match &kind {
            ResetKind::Cold => {
                self.bus.close().await?;
            }
            ResetKind::Warm | ResetKind::Other(_) => {
                self.bus.warm_reset().await?;
                self.bus.close().await?;
            }
        }
        self.wait_recovery(&kind).await;
        self.bus.initialize().await?;

        info!(kind = %kind, "coordinated reset complete");
        self.events
            .publish(&CoordinatorEvent::ReconnectionCompleted { kind });
        Ok(())
    }

    /// React to a reset another process announced: drop our link, wait out
    /// the controller's recovery, reconnect.
    async fn follow_remote_reset(&self, notification: ResetNotification) {
        let _serialized = self.follow_gate.lock().await;
        let kind = notification.kind.clone();
        info!(
            from = %notification.process_name,
            from_pid = notification.pid,
            kind = %kind,
            "following peer reset"
        );
        self.events
            .publish(&CoordinatorEvent::ReconnectionStarting { kind: kind.clone() });

        self.quiesce_axes().await;
        if let Err(e) = self.bus.close().await {
            warn!(error = %e, "link close failed while following peer reset");
        }

        self.wait_recovery(&kind).await;
        if self.cancel.is_cancelled() {
            return;
        }

        match self.bus.initialize().await {
            Ok(()) => {
                info!(kind = %kind, "reconnected after peer reset");
                self.events
                    .publish(&CoordinatorEvent::ReconnectionCompleted { kind });
            }
            Err(e) => {
                error!(error = %e, "reconnection after peer reset failed");
            }
        }
    }

    /// Stop driving axes before the bus goes away. Failures are logged;
    /// the reset proceeds regardless since the bus is about to drop.
    async fn quiesce_axes(&self) {
        if let Err(e) = self.axes.write_speed_all(0.0).await {
            warn!(error = %e, "zero speed failed before reset");
        }
        if let Err(e) = self.axes.disable_all().await {
            warn!(error = %e, "axis disable failed before reset");
        }
    }

    async fn wait_recovery(&self, kind: &ResetKind) {
        let wait = kind.recovery_wait(&self.config);
        info!(wait_secs = wait.as_secs(), "waiting for controller recovery");
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

fn process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "singulator".to_string())
}
