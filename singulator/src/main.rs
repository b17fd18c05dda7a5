//! # Singulator Supervisor
//!
//! Wires the safety core together and runs it against the selected
//! hardware backends (simulation in this build): isolator, safety
//! pipeline, frame guard and the cross-process reset coordinator.
//!
//! Lifecycle:
//! 1. Load and validate TOML configuration.
//! 2. Bring the bus up, start pipeline + frame guard.
//! 3. Start the reset coordinator; pause/resume the pipeline around
//!    coordinated reconnects.
//! 4. Run until Ctrl+C, then tear everything down in reverse order.

mod sim;

use clap::Parser;
use sgx::config::{ConfigLoader, LogLevel, SingulatorConfig};
use sgx::hal::{AxisController, BusAdapter, IndicatorLightService, IoModule, RealtimeNotifier};
use singulator_ipc::{CoordinatorEvent, DistributedResetCoordinator};
use singulator_safety::{FrameGuard, MotionFrame, SafetyIsolator, SafetyPipeline};
use sim::{SimBackends, SimSpeedStore};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Singulator supervisor — conveyor safety coordination core
#[derive(Parser, Debug)]
#[command(name = "singulator")]
#[command(version)]
#[command(about = "Safety coordination supervisor for a multi-axis conveyor singulator")]
struct Args {
    /// Path to the supervisor configuration TOML.
    #[arg(long, default_value = "config/singulator.toml")]
    config: PathBuf,

    /// Enable verbose logging (DEBUG level), overriding the config.
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format.
    #[arg(long)]
    json: bool,

    /// Run a scripted demo sequence (start, frames, estop, reset) after
    /// startup.
    #[arg(long)]
    demo: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match load_config(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("FATAL: {e}");
            process::exit(1);
        }
    };
    setup_tracing(&args, config.shared.log_level);

    info!(
        "Singulator supervisor v{} starting...",
        env!("CARGO_PKG_VERSION")
    );

    if let Err(e) = run(&args, config).await {
        error!("FATAL: {e}");
        process::exit(1);
    }

    info!("Singulator supervisor shutdown complete");
}

fn load_config(path: &PathBuf) -> Result<SingulatorConfig, sgx::config::ConfigError> {
    let config = SingulatorConfig::load(path)?;
    config.validate()?;
    Ok(config)
}

async fn run(args: &Args, config: SingulatorConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        service = %config.shared.service_name,
        card = config.coordinator.card_id,
        "config OK"
    );

    let backends = SimBackends::new();
    backends.bus.initialize().await?;

    let isolator = Arc::new(SafetyIsolator::new());

    let frame_guard = Arc::new(FrameGuard::new(
        Arc::clone(&isolator),
        config.frame_guard.clone(),
    ));
    frame_guard.initialize().await;

    let pipeline = Arc::new(SafetyPipeline::new(
        Arc::clone(&isolator),
        Arc::clone(&backends.axes) as Arc<dyn AxisController>,
        Arc::clone(&backends.bus) as Arc<dyn BusAdapter>,
        Arc::clone(&backends.indicator) as Arc<dyn IndicatorLightService>,
        Arc::clone(&backends.notifier) as Arc<dyn RealtimeNotifier>,
        Arc::new(SimSpeedStore(config.pipeline.fixed_speed_mm_s)),
        config.pipeline.clone(),
    ));
    pipeline.add_io_module(Arc::clone(&backends.panel) as Arc<dyn IoModule>);
    pipeline.start().await;

    let coordinator = Arc::new(DistributedResetCoordinator::new(
        Arc::clone(&backends.axes) as Arc<dyn AxisController>,
        Arc::clone(&backends.bus) as Arc<dyn BusAdapter>,
        config.coordinator.clone(),
    ));
    {
        // No axis command may race a half-reconnected bus.
        let pipeline = Arc::clone(&pipeline);
        coordinator.events().subscribe(move |ev: CoordinatorEvent| match ev {
            CoordinatorEvent::ReconnectionStarting { kind } => {
                info!(kind = %kind, "pausing pipeline for coordinated reset");
                pipeline.pause();
            }
            CoordinatorEvent::ReconnectionCompleted { kind } => {
                info!(kind = %kind, "resuming pipeline after coordinated reset");
                pipeline.resume();
            }
            CoordinatorEvent::AbandonedLockRecovered { holder_pid } => {
                warn!(holder_pid, "took over reset lock from dead process");
            }
        });
    }
    coordinator.start();

    info!("safety core running");

    if args.demo {
        run_demo(&backends, &frame_guard).await;
    }

    match signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!("Unable to listen for shutdown signal: {e}"),
    }

    pipeline.shutdown().await;
    frame_guard.dispose().await;
    coordinator.shutdown().await;
    backends.bus.close().await?;

    let (trigger, reason) = isolator.last_trigger();
    info!("Final state:");
    info!("  - Isolation: {:?}", isolator.state());
    info!("  - Last trigger: {:?} ({})", trigger, reason);
    info!("  - Indicator: {:?}", backends.indicator.current_state());
    info!("  - Axes enabled: {}", backends.axes.enabled());
    Ok(())
}

/// Scripted exercise of the whole core: start, motion frames with a
/// duplicate, emergency stop, reset.
async fn run_demo(backends: &SimBackends, frame_guard: &Arc<FrameGuard>) {
    info!("demo: pressing start");
    backends.panel.press_start();
    tokio::time::sleep(Duration::from_millis(200)).await;

    for sequence in [1i64, 2, 3, 3, 4] {
        frame_guard.report_heartbeat();
        let decision = frame_guard.evaluate(MotionFrame {
            sequence,
            speed_mm_s: 250.0,
        });
        info!(
            sequence,
            accepted = decision.accepted,
            reason = decision.reject_reason.as_deref().unwrap_or("-"),
            "demo: frame"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    info!("demo: pulling emergency stop");
    backends.panel.pull_estop();
    tokio::time::sleep(Duration::from_millis(200)).await;

    info!("demo: pressing reset");
    backends.panel.press_reset();
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!(
        indicator = ?backends.indicator.current_state(),
        "demo complete"
    );
}

/// Setup tracing subscriber from CLI arguments and configured level.
fn setup_tracing(args: &Args, configured: LogLevel) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        match configured {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init();
    }
}
