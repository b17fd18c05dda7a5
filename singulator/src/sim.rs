//! Simulation backends for running the safety core without hardware.
//!
//! Every trait the core needs has a logging in-memory implementation here,
//! so the full supervisor can run on a developer machine. State is tracked
//! just far enough to make the logs truthful (enabled flags, last speed,
//! indicator color).

use async_trait::async_trait;
use parking_lot::Mutex;
use sgx::hal::{
    AxisController, BusAdapter, EventSink, HalError, IndicatorLightService, IoEvent, IoModule,
    OptionsStore, RealtimeNotifier, SpeedOptions,
};
use sgx::state::IndicatorState;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Simulated conveyor axes.
#[derive(Default)]
pub struct SimAxisController {
    enabled: AtomicBool,
    speed_mm_s: Mutex<f64>,
}

impl SimAxisController {
    /// Last speed setpoint written.
    pub fn speed(&self) -> f64 {
        *self.speed_mm_s.lock()
    }

    /// Whether drives are currently enabled.
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AxisController for SimAxisController {
    async fn enable_all(&self) -> Result<(), HalError> {
        self.enabled.store(true, Ordering::Relaxed);
        info!("sim axes enabled");
        Ok(())
    }

    async fn disable_all(&self) -> Result<(), HalError> {
        self.enabled.store(false, Ordering::Relaxed);
        info!("sim axes disabled");
        Ok(())
    }

    async fn write_speed_all(&self, speed_mm_s: f64) -> Result<(), HalError> {
        *self.speed_mm_s.lock() = speed_mm_s;
        debug!(speed_mm_s, "sim speed setpoint");
        Ok(())
    }

    async fn stop_all(&self) -> Result<(), HalError> {
        *self.speed_mm_s.lock() = 0.0;
        info!("sim axes stopped");
        Ok(())
    }

    async fn apply_speed_set(&self) -> Result<(), HalError> {
        debug!("sim speed set latched");
        Ok(())
    }
}

/// Simulated motion-controller link.
#[derive(Default)]
pub struct SimBusAdapter {
    up: AtomicBool,
}

#[async_trait]
impl BusAdapter for SimBusAdapter {
    async fn initialize(&self) -> Result<(), HalError> {
        self.up.store(true, Ordering::Relaxed);
        info!("sim bus initialized");
        Ok(())
    }

    async fn close(&self) -> Result<(), HalError> {
        self.up.store(false, Ordering::Relaxed);
        info!("sim bus closed");
        Ok(())
    }

    async fn reset_errors(&self) -> Result<(), HalError> {
        info!("sim bus error registers cleared");
        Ok(())
    }

    async fn warm_reset(&self) -> Result<(), HalError> {
        info!("sim bus warm reset");
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.up.load(Ordering::Relaxed)
    }
}

/// Simulated stack light.
pub struct SimIndicatorLight {
    state: Mutex<IndicatorState>,
}

impl Default for SimIndicatorLight {
    fn default() -> Self {
        Self {
            state: Mutex::new(IndicatorState::Stopped),
        }
    }
}

#[async_trait]
impl IndicatorLightService for SimIndicatorLight {
    async fn update_state(&self, state: IndicatorState) -> Result<(), HalError> {
        *self.state.lock() = state;
        info!(?state, "sim indicator");
        Ok(())
    }

    fn current_state(&self) -> IndicatorState {
        *self.state.lock()
    }
}

/// Telemetry sink that logs instead of pushing to clients.
#[derive(Default)]
pub struct SimRealtimeNotifier;

#[async_trait]
impl RealtimeNotifier for SimRealtimeNotifier {
    async fn publish_device(&self, payload: serde_json::Value) -> Result<(), HalError> {
        debug!(%payload, "sim realtime publish");
        Ok(())
    }
}

/// Fixed speed options, standing in for the machine database.
pub struct SimSpeedStore(pub f64);

#[async_trait]
impl OptionsStore<SpeedOptions> for SimSpeedStore {
    async fn get(&self) -> Result<SpeedOptions, HalError> {
        Ok(SpeedOptions {
            fixed_speed_mm_s: self.0,
        })
    }
}

/// Simulated operator panel.
///
/// Holds the pipeline's sink once subscribed; the `press_*` methods stand
/// in for physical button edges.
#[derive(Default)]
pub struct SimOperatorPanel {
    sink: Mutex<Option<EventSink<IoEvent>>>,
}

impl SimOperatorPanel {
    fn emit(&self, event: IoEvent) {
        if let Some(sink) = self.sink.lock().as_ref() {
            sink.send(event);
        } else {
            debug!(?event, "sim panel event before subscription, dropped");
        }
    }

    /// Simulate a start button press.
    pub fn press_start(&self) {
        self.emit(IoEvent::StartRequested);
    }

    /// Simulate a stop button press.
    pub fn press_stop(&self) {
        self.emit(IoEvent::StopRequested);
    }

    /// Simulate a reset button press.
    pub fn press_reset(&self) {
        self.emit(IoEvent::ResetRequested);
    }

    /// Simulate the emergency stop circuit opening.
    pub fn pull_estop(&self) {
        self.emit(IoEvent::EmergencyStop);
    }
}

impl IoModule for SimOperatorPanel {
    fn name(&self) -> &str {
        "sim_panel"
    }

    fn subscribe(&self, sink: EventSink<IoEvent>) {
        *self.sink.lock() = Some(sink);
    }
}

/// Container for one full set of simulation backends.
pub struct SimBackends {
    /// Conveyor axes.
    pub axes: Arc<SimAxisController>,
    /// Controller link.
    pub bus: Arc<SimBusAdapter>,
    /// Stack light.
    pub indicator: Arc<SimIndicatorLight>,
    /// Telemetry sink.
    pub notifier: Arc<SimRealtimeNotifier>,
    /// Operator panel.
    pub panel: Arc<SimOperatorPanel>,
}

impl SimBackends {
    /// Build a fresh set of backends.
    pub fn new() -> Self {
        Self {
            axes: Arc::new(SimAxisController::default()),
            bus: Arc::new(SimBusAdapter::default()),
            indicator: Arc::new(SimIndicatorLight::default()),
            notifier: Arc::new(SimRealtimeNotifier),
            panel: Arc::new(SimOperatorPanel::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn axes_track_enable_and_speed() {
        let axes = SimAxisController::default();
        axes.enable_all().await.unwrap();
        axes.write_speed_all(120.0).await.unwrap();
        assert!(axes.enabled());
        assert_eq!(axes.speed(), 120.0);

        axes.stop_all().await.unwrap();
        axes.disable_all().await.unwrap();
        assert!(!axes.enabled());
        assert_eq!(axes.speed(), 0.0);
    }

    #[tokio::test]
    async fn bus_tracks_link_state() {
        let bus = SimBusAdapter::default();
        assert!(!bus.is_initialized());
        bus.initialize().await.unwrap();
        assert!(bus.is_initialized());
        bus.close().await.unwrap();
        assert!(!bus.is_initialized());
    }

    #[test]
    fn panel_delivers_after_subscription() {
        let panel = SimOperatorPanel::default();
        // Before subscription nothing is delivered, and nothing panics.
        panel.press_start();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        panel.subscribe(EventSink::new(move |ev| {
            sink_seen.lock().push(ev);
        }));
        panel.press_start();
        panel.pull_estop();
        assert_eq!(
            *seen.lock(),
            vec![IoEvent::StartRequested, IoEvent::EmergencyStop]
        );
    }
}
