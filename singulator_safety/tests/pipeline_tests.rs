//! End-to-end pipeline tests against recording hardware mocks.

use async_trait::async_trait;
use parking_lot::Mutex;
use sgx::config::PipelineConfig;
use sgx::hal::{
    AxisController, BusAdapter, EventSink, HalError, IndicatorLightService, IoEvent, IoModule,
    OptionsStore, RealtimeNotifier, SpeedOptions,
};
use sgx::state::{ControlMode, IndicatorState, IsolationState, TriggerKind};
use singulator_safety::{CommandKind, SafetyIsolator, SafetyPipeline};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Default)]
struct RecordingAxes {
    calls: Mutex<Vec<String>>,
}

impl RecordingAxes {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
    fn record(&self, call: &str) {
        self.calls.lock().push(call.to_string());
    }
}

#[async_trait]
impl AxisController for RecordingAxes {
    async fn enable_all(&self) -> Result<(), HalError> {
        self.record("enable");
        Ok(())
    }
    async fn disable_all(&self) -> Result<(), HalError> {
        self.record("disable");
        Ok(())
    }
    async fn write_speed_all(&self, speed_mm_s: f64) -> Result<(), HalError> {
        self.record(&format!("speed {speed_mm_s}"));
        Ok(())
    }
    async fn stop_all(&self) -> Result<(), HalError> {
        self.record("stop");
        Ok(())
    }
    async fn apply_speed_set(&self) -> Result<(), HalError> {
        self.record("apply");
        Ok(())
    }
}

struct FakeBus {
    up: AtomicBool,
}

impl FakeBus {
    fn up() -> Self {
        Self {
            up: AtomicBool::new(true),
        }
    }
    fn down() -> Self {
        Self {
            up: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl BusAdapter for FakeBus {
    async fn initialize(&self) -> Result<(), HalError> {
        self.up.store(true, Ordering::Relaxed);
        Ok(())
    }
    async fn close(&self) -> Result<(), HalError> {
        self.up.store(false, Ordering::Relaxed);
        Ok(())
    }
    async fn reset_errors(&self) -> Result<(), HalError> {
        Ok(())
    }
    async fn warm_reset(&self) -> Result<(), HalError> {
        Ok(())
    }
    fn is_initialized(&self) -> bool {
        self.up.load(Ordering::Relaxed)
    }
}

/// Button/mode-key source delivering events through the pipeline's sink.
#[derive(Default)]
struct TestPanel {
    sink: Mutex<Option<EventSink<IoEvent>>>,
}

impl TestPanel {
    fn emit(&self, event: IoEvent) {
        self.sink
            .lock()
            .as_ref()
            .expect("panel not subscribed")
            .send(event);
    }
}

impl IoModule for TestPanel {
    fn name(&self) -> &str {
        "test_panel"
    }
    fn subscribe(&self, sink: EventSink<IoEvent>) {
        *self.sink.lock() = Some(sink);
    }
}

struct FakeIndicator {
    state: Mutex<IndicatorState>,
}

impl FakeIndicator {
    fn new(initial: IndicatorState) -> Self {
        Self {
            state: Mutex::new(initial),
        }
    }
}

#[async_trait]
impl IndicatorLightService for FakeIndicator {
    async fn update_state(&self, state: IndicatorState) -> Result<(), HalError> {
        *self.state.lock() = state;
        Ok(())
    }
    fn current_state(&self) -> IndicatorState {
        *self.state.lock()
    }
}

struct NullNotifier;

#[async_trait]
impl RealtimeNotifier for NullNotifier {
    async fn publish_device(&self, _payload: serde_json::Value) -> Result<(), HalError> {
        Ok(())
    }
}

struct FixedSpeed(f64);

#[async_trait]
impl OptionsStore<SpeedOptions> for FixedSpeed {
    async fn get(&self) -> Result<SpeedOptions, HalError> {
        Ok(SpeedOptions {
            fixed_speed_mm_s: self.0,
        })
    }
}

struct Rig {
    pipeline: SafetyPipeline,
    isolator: Arc<SafetyIsolator>,
    axes: Arc<RecordingAxes>,
    indicator: Arc<FakeIndicator>,
    panel: Arc<TestPanel>,
}

fn rig(initial_indicator: IndicatorState) -> Rig {
    rig_with(initial_indicator, FakeBus::up(), PipelineConfig::default())
}

fn rig_with(initial_indicator: IndicatorState, bus: FakeBus, config: PipelineConfig) -> Rig {
    let isolator = Arc::new(SafetyIsolator::new());
    let axes = Arc::new(RecordingAxes::default());
    let indicator = Arc::new(FakeIndicator::new(initial_indicator));
    let panel = Arc::new(TestPanel::default());
    let pipeline = SafetyPipeline::new(
        Arc::clone(&isolator),
        Arc::clone(&axes) as Arc<dyn AxisController>,
        Arc::new(bus),
        Arc::clone(&indicator) as Arc<dyn IndicatorLightService>,
        Arc::new(NullNotifier),
        Arc::new(FixedSpeed(180.0)),
        config,
    );
    pipeline.add_io_module(Arc::clone(&panel) as Arc<dyn IoModule>);
    Rig {
        pipeline,
        isolator,
        axes,
        indicator,
        panel,
    }
}

async fn eventually<F: Fn() -> bool>(cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn start_enables_and_writes_local_speed() {
    let rig = rig(IndicatorState::Stopped);
    rig.pipeline.start().await;

    rig.pipeline
        .request(CommandKind::Start, TriggerKind::StartButton, "operator");
    eventually(|| rig.indicator.current_state() == IndicatorState::Running).await;

    assert_eq!(rig.axes.calls(), vec!["enable", "speed 180", "apply"]);
    rig.pipeline.shutdown().await;
}

#[tokio::test]
async fn start_rejected_while_running_or_isolated() {
    let rig = rig(IndicatorState::Running);
    rig.pipeline.start().await;

    rig.pipeline
        .request(CommandKind::Start, TriggerKind::StartButton, "operator");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rig.axes.calls().is_empty(), "start must be a no-op while running");

    // Same when isolated, regardless of indicator.
    let rig2 = rig2_isolated().await;
    rig2.pipeline
        .request(CommandKind::Start, TriggerKind::StartButton, "operator");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        !rig2.axes.calls().contains(&"enable".to_string()),
        "start must not enable axes while isolated"
    );
    rig.pipeline.shutdown().await;
    rig2.pipeline.shutdown().await;
}

async fn rig2_isolated() -> Rig {
    let rig = rig(IndicatorState::Stopped);
    rig.isolator
        .try_trip(TriggerKind::AxisDisconnected, "axis 1 gone");
    rig.pipeline.start().await;
    // Let the queued state change (and its halt) drain first.
    tokio::time::sleep(Duration::from_millis(50)).await;
    rig.axes.calls.lock().clear();
    rig
}

#[tokio::test]
async fn emergency_stop_halts_and_degrades() {
    let rig = rig(IndicatorState::Running);
    rig.pipeline.start().await;

    rig.pipeline.request(
        CommandKind::Stop,
        TriggerKind::EmergencyStop,
        "estop circuit opened",
    );
    eventually(|| rig.indicator.current_state() == IndicatorState::Alarm).await;

    let calls = rig.axes.calls();
    assert_eq!(&calls[..3], ["speed 0", "stop", "disable"]);
    assert_eq!(rig.isolator.state(), IsolationState::Degraded);
    rig.pipeline.shutdown().await;
}

#[tokio::test]
async fn reset_clears_isolation_and_readies() {
    let rig = rig(IndicatorState::Alarm);
    rig.isolator.try_trip(TriggerKind::EmergencyStop, "estop held");
    rig.pipeline.start().await;

    rig.pipeline
        .request(CommandKind::Reset, TriggerKind::ResetButton, "operator reset");
    eventually(|| rig.isolator.state() == IsolationState::Normal).await;
    eventually(|| rig.indicator.current_state() == IndicatorState::Ready).await;

    let calls = rig.axes.calls();
    assert!(calls.contains(&"speed 0".to_string()));
    assert!(calls.contains(&"disable".to_string()));
    rig.pipeline.shutdown().await;
}

#[tokio::test]
async fn reset_recovers_from_degraded() {
    let rig = rig(IndicatorState::Stopped);
    rig.isolator
        .try_enter_degraded(TriggerKind::AxisFault, "axis 2 fault");
    rig.pipeline.start().await;

    rig.pipeline
        .request(CommandKind::Reset, TriggerKind::ResetButton, "operator reset");
    eventually(|| rig.isolator.state() == IsolationState::Normal).await;
    rig.pipeline.shutdown().await;
}

#[tokio::test]
async fn pause_holds_operations_until_resume() {
    let rig = rig(IndicatorState::Running);
    rig.pipeline.start().await;
    rig.pipeline.pause();

    rig.pipeline
        .request(CommandKind::Stop, TriggerKind::StopButton, "stop while paused");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rig.axes.calls().is_empty(), "paused pipeline must not act");

    rig.pipeline.resume();
    eventually(|| rig.indicator.current_state() == IndicatorState::Stopped).await;
    assert_eq!(rig.isolator.state(), IsolationState::Degraded);
    rig.pipeline.shutdown().await;
}

#[tokio::test]
async fn second_start_does_not_duplicate_safety_actions() {
    let rig = rig(IndicatorState::Running);
    rig.pipeline.start().await;
    rig.pipeline.start().await;

    // One transition must produce exactly one halt sequence; a duplicate
    // subscription would run it twice.
    rig.isolator
        .try_trip(TriggerKind::AxisDisconnected, "axis 1 gone");
    eventually(|| rig.axes.calls().len() >= 3).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(rig.axes.calls(), vec!["speed 0", "stop", "disable"]);
    rig.pipeline.shutdown().await;
}

#[tokio::test]
async fn mode_changes_rezero_and_switch_start_semantics() {
    let rig = rig(IndicatorState::Stopped);
    rig.pipeline.start().await;

    // local -> remote: hold zero, auto-enable.
    rig.panel
        .emit(IoEvent::RemoteLocalModeChanged(ControlMode::Remote));
    eventually(|| rig.axes.calls() == vec!["speed 0", "enable"]).await;
    rig.axes.calls.lock().clear();

    // A remote-mode start holds the setpoint at zero for the remote source
    // instead of writing the fixed local speed.
    rig.pipeline
        .request(CommandKind::Start, TriggerKind::StartButton, "operator");
    eventually(|| rig.indicator.current_state() == IndicatorState::Running).await;
    assert_eq!(rig.axes.calls(), vec!["enable", "speed 0"]);
    rig.axes.calls.lock().clear();

    // remote -> local: hold zero, disable until an explicit start.
    rig.panel
        .emit(IoEvent::RemoteLocalModeChanged(ControlMode::Local));
    eventually(|| rig.axes.calls() == vec!["speed 0", "disable"]).await;
    rig.pipeline.shutdown().await;
}

#[tokio::test]
async fn startup_gate_proceeds_past_timeout_with_bus_down() {
    let config = PipelineConfig {
        startup_init_timeout_s: 1,
        startup_poll_interval_ms: 100,
        ..Default::default()
    };
    let rig = rig_with(IndicatorState::Running, FakeBus::down(), config);
    rig.pipeline.start().await;

    // IO was subscribed anyway; commands flow although the bus never came up.
    rig.panel.emit(IoEvent::StopRequested);
    eventually(|| rig.indicator.current_state() == IndicatorState::Stopped).await;
    assert_eq!(rig.isolator.state(), IsolationState::Degraded);
    rig.pipeline.shutdown().await;
}

#[tokio::test]
async fn axis_disconnect_trips_isolation_and_halts() {
    let rig = rig(IndicatorState::Running);
    rig.pipeline.start().await;

    let sink = rig.pipeline.axis_health_sink();
    sink.send(sgx::hal::AxisHealthEvent {
        kind: TriggerKind::AxisDisconnected,
        axis: "axis3".into(),
        reason: "no heartbeat".into(),
    });

    eventually(|| rig.isolator.state() == IsolationState::Isolated).await;
    // The resulting state change drains through the queue and halts axes.
    eventually(|| rig.axes.calls() == vec!["speed 0", "stop", "disable"]).await;
    rig.pipeline.shutdown().await;
}
