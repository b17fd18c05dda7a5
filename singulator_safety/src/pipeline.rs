//! Ordered safety operation pipeline.
//!
//! Every safety-relevant side effect in the process funnels through one
//! unbounded multi-producer queue drained by a single consumer task; no two
//! safety actions ever execute concurrently, by construction. Producers are
//! IO modules, axis-health signals and the isolator's own state changes.
//!
//! The queue is unbounded on purpose: safety events are never intentionally
//! dropped. The only loss window is a send during the shutdown race, which
//! is logged and discarded. Per-operation failures are caught at the loop
//! boundary with full context and never terminate the consumer.

use crate::isolator::SafetyIsolator;
use sgx::bus::SubscriptionId;
use sgx::config::PipelineConfig;
use sgx::hal::{
    AxisController, BusAdapter, EventSink, HalError, IndicatorLightService, IoEvent, IoModule,
    OptionsStore, RealtimeNotifier, SpeedOptions,
};
use sgx::state::{ControlMode, IndicatorState, IsolationState, StateChangeEvent, TriggerKind};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Safety command verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Enable axes and begin running.
    Start,
    /// Halt motion; severity depends on the trigger.
    Stop,
    /// Clear faults and return the isolator to Normal.
    Reset,
}

/// One entry in the serialized safety queue.
#[derive(Debug, Clone)]
pub enum Operation {
    /// The isolator committed a transition.
    StateChanged(StateChangeEvent),
    /// An operator or IO command.
    Command {
        /// Verb to execute.
        kind: CommandKind,
        /// What raised the command.
        trigger: TriggerKind,
        /// Human-readable reason text.
        reason: String,
        /// Whether a physical IO module raised it.
        from_io: bool,
    },
    /// An axis health signal.
    AxisHealth {
        /// `AxisFault`, `AxisDisconnected` or `HealthRecovered`.
        trigger: TriggerKind,
        /// Axis name as configured on the bus.
        axis: String,
        /// Driver-provided detail text.
        reason: String,
    },
}

/// Error type for pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A hardware call inside an operation failed.
    #[error("hardware call failed: {0}")]
    Hal(#[from] HalError),
}

struct Shared {
    isolator: Arc<SafetyIsolator>,
    axes: Arc<dyn AxisController>,
    bus: Arc<dyn BusAdapter>,
    indicator: Arc<dyn IndicatorLightService>,
    notifier: Arc<dyn RealtimeNotifier>,
    speed_options: Arc<dyn OptionsStore<SpeedOptions>>,
    config: PipelineConfig,
    /// Guards remote/local mode transitions, independent of queue ordering.
    mode: tokio::sync::Mutex<ControlMode>,
    paused: watch::Sender<bool>,
}

/// Orchestrator for all safety side effects.
pub struct SafetyPipeline {
    shared: Arc<Shared>,
    tx: UnboundedSender<Operation>,
    rx: parking_lot::Mutex<Option<UnboundedReceiver<Operation>>>,
    consumer: parking_lot::Mutex<Option<JoinHandle<()>>>,
    isolator_sub: parking_lot::Mutex<Option<SubscriptionId>>,
    io_modules: parking_lot::Mutex<Vec<Arc<dyn IoModule>>>,
    cancel: CancellationToken,
}

impl SafetyPipeline {
    /// Build a pipeline. Call [`SafetyPipeline::start`] to run the consumer.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        isolator: Arc<SafetyIsolator>,
        axes: Arc<dyn AxisController>,
        bus: Arc<dyn BusAdapter>,
        indicator: Arc<dyn IndicatorLightService>,
        notifier: Arc<dyn RealtimeNotifier>,
        speed_options: Arc<dyn OptionsStore<SpeedOptions>>,
        config: PipelineConfig,
    ) -> Self {
        let (tx, rx) = unbounded_channel();
        let (paused, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                isolator,
                axes,
                bus,
                indicator,
                notifier,
                speed_options,
                config,
                mode: tokio::sync::Mutex::new(ControlMode::Local),
                paused,
            }),
            tx,
            rx: parking_lot::Mutex::new(Some(rx)),
            consumer: parking_lot::Mutex::new(None),
            isolator_sub: parking_lot::Mutex::new(None),
            io_modules: parking_lot::Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Register an IO module. Its events are subscribed during
    /// [`SafetyPipeline::start`], after startup gating.
    pub fn add_io_module(&self, module: Arc<dyn IoModule>) {
        self.io_modules.lock().push(module);
    }

    /// Enqueue an operation. A failed send is only possible during the
    /// shutdown race and is logged and discarded.
    pub fn submit(&self, op: Operation) {
        if self.tx.send(op).is_err() {
            warn!("safety operation dropped: pipeline shutting down");
        }
    }

    /// Enqueue a command on behalf of an external caller (API layer).
    pub fn request(&self, kind: CommandKind, trigger: TriggerKind, reason: &str) {
        self.submit(Operation::Command {
            kind,
            trigger,
            reason: reason.to_string(),
            from_io: false,
        });
    }

    /// Sink for axis-health signals from the drive layer.
    pub fn axis_health_sink(&self) -> EventSink<sgx::hal::AxisHealthEvent> {
        let tx = self.tx.clone();
        EventSink::new(move |ev: sgx::hal::AxisHealthEvent| {
            if tx
                .send(Operation::AxisHealth {
                    trigger: ev.kind,
                    axis: ev.axis,
                    reason: ev.reason,
                })
                .is_err()
            {
                warn!("axis health signal dropped: pipeline shutting down");
            }
        })
    }

    /// Suspend operation execution between items. Used while a coordinated
    /// bus reset is reconnecting the hardware link.
    pub fn pause(&self) {
        info!("safety pipeline paused");
        let _ = self.shared.paused.send(true);
    }

    /// Resume operation execution.
    pub fn resume(&self) {
        info!("safety pipeline resumed");
        let _ = self.shared.paused.send(false);
    }

    /// Gate on bus initialization, subscribe producers and spawn the
    /// consumer task.
    ///
    /// The gate polls at a fixed interval up to the configured timeout and
    /// proceeds anyway past it with a warning, so a physical reset button
    /// cannot fire into a half-initialized axis layer.
    pub async fn start(&self) {
        // Claim the receiver before touching any subscription; a second
        // call must not install duplicate producers.
        let Some(mut rx) = self.rx.lock().take() else {
            warn!("pipeline already started, ignoring");
            return;
        };

        self.wait_for_bus().await;

        // The isolator feeds its own transitions back into the ordered queue.
        let tx = self.tx.clone();
        let sub = self
            .shared
            .isolator
            .events()
            .subscribe(move |ev: StateChangeEvent| {
                if tx.send(Operation::StateChanged(ev)).is_err() {
                    warn!("state change dropped: pipeline shutting down");
                }
            });
        *self.isolator_sub.lock() = Some(sub);

        // IO modules are subscribed only now, after gating.
        let modules: Vec<Arc<dyn IoModule>> = self.io_modules.lock().clone();
        for module in modules {
            info!(module = module.name(), "subscribing IO module");
            module.subscribe(self.io_sink());
        }

        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut paused_rx = shared.paused.subscribe();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    op = rx.recv() => {
                        let Some(op) = op else { break };
                        // Block between operations while a coordinated
                        // reconnect is in flight.
                        while *paused_rx.borrow_and_update() {
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                r = paused_rx.changed() => { if r.is_err() { return; } }
                            }
                        }
                        if let Err(e) = shared.handle(&op, &cancel).await {
                            error!(?op, error = %e, "safety operation failed");
                        }
                    }
                }
            }
            debug!("safety pipeline consumer stopped");
        });
        *self.consumer.lock() = Some(handle);
        info!("safety pipeline started");
    }

    /// Stop the consumer and unsubscribe from the isolator.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.consumer.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if let Some(sub) = self.isolator_sub.lock().take() {
            self.shared.isolator.events().unsubscribe(sub);
        }
    }

    fn io_sink(&self) -> EventSink<IoEvent> {
        let tx = self.tx.clone();
        let shared = Arc::clone(&self.shared);
        EventSink::new(move |ev: IoEvent| {
            let op = match ev {
                IoEvent::EmergencyStop => Operation::Command {
                    kind: CommandKind::Stop,
                    trigger: TriggerKind::EmergencyStop,
                    reason: "emergency stop circuit opened".to_string(),
                    from_io: true,
                },
                IoEvent::StopRequested => Operation::Command {
                    kind: CommandKind::Stop,
                    trigger: TriggerKind::StopButton,
                    reason: "stop button pressed".to_string(),
                    from_io: true,
                },
                IoEvent::StartRequested => Operation::Command {
                    kind: CommandKind::Start,
                    trigger: TriggerKind::StartButton,
                    reason: "start button pressed".to_string(),
                    from_io: true,
                },
                IoEvent::ResetRequested => Operation::Command {
                    kind: CommandKind::Reset,
                    trigger: TriggerKind::ResetButton,
                    reason: "reset button pressed".to_string(),
                    from_io: true,
                },
                IoEvent::RemoteLocalModeChanged(mode) => {
                    // Mode changes bypass the queue; they are ordered by
                    // their own lock.
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        shared.handle_mode_change(mode).await;
                    });
                    return;
                }
            };
            if tx.send(op).is_err() {
                warn!("io event dropped: pipeline shutting down");
            }
        })
    }

    async fn wait_for_bus(&self) {
        let timeout = Duration::from_secs(self.shared.config.startup_init_timeout_s);
        let deadline = Instant::now() + timeout;
        let mut tick = interval(Duration::from_millis(
            self.shared.config.startup_poll_interval_ms,
        ));
        loop {
            if self.shared.bus.is_initialized() {
                info!("bus initialized, pipeline may subscribe IO");
                return;
            }
            if Instant::now() >= deadline {
                warn!(
                    timeout_s = self.shared.config.startup_init_timeout_s,
                    "bus not initialized within startup gate, proceeding anyway"
                );
                return;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tick.tick() => {}
            }
        }
    }
}

impl Shared {
    async fn handle(&self, op: &Operation, cancel: &CancellationToken) -> Result<(), PipelineError> {
        match op {
            Operation::StateChanged(ev) => self.on_state_changed(ev).await,
            Operation::Command {
                kind,
                trigger,
                reason,
                from_io,
            } => match kind {
                CommandKind::Start => self.on_start(*trigger, reason, *from_io).await,
                CommandKind::Stop => self.on_stop(*trigger, reason).await,
                CommandKind::Reset => self.on_reset(reason, cancel).await,
            },
            Operation::AxisHealth {
                trigger,
                axis,
                reason,
            } => {
                self.on_axis_health(*trigger, axis, reason);
                Ok(())
            }
        }
    }

    async fn on_state_changed(&self, ev: &StateChangeEvent) -> Result<(), PipelineError> {
        self.publish_state(ev).await;
        match ev.current {
            IsolationState::Isolated | IsolationState::Degraded => {
                info!(?ev.current, reason = %ev.reason, "halting all axes on posture change");
                self.halt_all().await;
            }
            IsolationState::Normal => {}
        }
        Ok(())
    }

    async fn on_start(
        &self,
        trigger: TriggerKind,
        reason: &str,
        from_io: bool,
    ) -> Result<(), PipelineError> {
        let observed = self.indicator.current_state();
        if matches!(observed, IndicatorState::Running | IndicatorState::Alarm) {
            warn!(?observed, ?trigger, from_io, "start rejected: machine state");
            return Ok(());
        }
        if self.isolator.state() == IsolationState::Isolated {
            warn!(?trigger, from_io, "start rejected: isolated");
            return Ok(());
        }

        info!(?trigger, reason, from_io, "starting axes");
        self.axes.enable_all().await?;

        let mode = *self.mode.lock().await;
        match mode {
            ControlMode::Remote => {
                // Remote source pushes the real setpoint; hold at zero.
                self.axes.write_speed_all(0.0).await?;
            }
            ControlMode::Local => {
                let speed = match self.speed_options.get().await {
                    Ok(opts) => opts.fixed_speed_mm_s,
                    Err(e) => {
                        warn!(error = %e, "speed options unavailable, using configured default");
                        self.config.fixed_speed_mm_s
                    }
                };
                self.axes.write_speed_all(speed).await?;
                self.axes.apply_speed_set().await?;
            }
        }

        self.set_indicator(IndicatorState::Running).await;
        Ok(())
    }

    async fn on_stop(&self, trigger: TriggerKind, reason: &str) -> Result<(), PipelineError> {
        if trigger == TriggerKind::EmergencyStop {
            info!(reason, "emergency stop");
            self.halt_all().await;
            self.set_indicator(IndicatorState::Alarm).await;
        } else {
            info!(?trigger, reason, "controlled stop");
            if let Err(e) = self.axes.write_speed_all(0.0).await {
                error!(error = %e, "zero speed failed during stop");
            }
            if let Err(e) = self.axes.disable_all().await {
                error!(error = %e, "disable failed during stop");
            }
            self.set_indicator(IndicatorState::Stopped).await;
        }
        // Record the stop cause regardless of hardware outcome.
        self.isolator.try_enter_degraded(trigger, reason);
        Ok(())
    }

    async fn on_reset(
        &self,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        info!(reason, "reset requested");
        if let Err(e) = self.axes.write_speed_all(0.0).await {
            error!(error = %e, "zero speed failed during reset");
        }
        if let Err(e) = self.axes.disable_all().await {
            error!(error = %e, "disable failed during reset");
        }
        if let Err(e) = self.bus.reset_errors().await {
            error!(error = %e, "bus error reset failed");
        }

        match self.isolator.state() {
            IsolationState::Isolated => {
                self.isolator.try_reset_isolation(reason, cancel);
            }
            IsolationState::Degraded => {
                self.isolator.try_recover_from_degraded(reason);
            }
            IsolationState::Normal => {}
        }

        self.set_indicator(IndicatorState::Ready).await;
        Ok(())
    }

    fn on_axis_health(&self, trigger: TriggerKind, axis: &str, reason: &str) {
        let detail = format!("axis {axis}: {reason}");
        match trigger {
            TriggerKind::AxisFault => {
                self.isolator.try_enter_degraded(TriggerKind::AxisFault, &detail);
            }
            TriggerKind::AxisDisconnected => {
                self.isolator.try_trip(TriggerKind::AxisDisconnected, &detail);
            }
            TriggerKind::HealthRecovered => {
                self.isolator.try_recover_from_degraded(&detail);
            }
            other => warn!(?other, axis, "unexpected axis health trigger"),
        }
    }

    /// local→remote: hold zero and auto-enable; remote→local: hold zero and
    /// disable until an operator starts explicitly.
    async fn handle_mode_change(&self, new_mode: ControlMode) {
        let mut mode = self.mode.lock().await;
        if *mode == new_mode {
            return;
        }
        info!(from = ?*mode, to = ?new_mode, "control mode changed");
        *mode = new_mode;

        if let Err(e) = self.axes.write_speed_all(0.0).await {
            error!(error = %e, "zero speed failed during mode change");
        }
        let result = match new_mode {
            ControlMode::Remote => self.axes.enable_all().await,
            ControlMode::Local => self.axes.disable_all().await,
        };
        if let Err(e) = result {
            error!(error = %e, ?new_mode, "axis state change failed during mode change");
        }
    }

    /// Zero, stop and disable every axis. Each step's failure is logged and
    /// the remaining steps still run.
    async fn halt_all(&self) {
        if let Err(e) = self.axes.write_speed_all(0.0).await {
            error!(error = %e, "zero speed failed during halt");
        }
        if let Err(e) = self.axes.stop_all().await {
            error!(error = %e, "stop failed during halt");
        }
        if let Err(e) = self.axes.disable_all().await {
            error!(error = %e, "disable failed during halt");
        }
    }

    async fn set_indicator(&self, state: IndicatorState) {
        if let Err(e) = self.indicator.update_state(state).await {
            error!(error = %e, ?state, "indicator update failed");
        }
    }

    /// Best-effort realtime publication; never affects control flow.
    async fn publish_state(&self, ev: &StateChangeEvent) {
        match serde_json::to_value(ev) {
            Ok(payload) => {
                if let Err(e) = self.notifier.publish_device(payload).await {
                    debug!(error = %e, "realtime publish failed");
                }
            }
            Err(e) => debug!(error = %e, "state change not serializable"),
        }
    }
}
