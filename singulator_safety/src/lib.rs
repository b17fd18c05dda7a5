//! Safety coordination core for the singulator.
//!
//! Three cooperating pieces:
//!
//! - [`isolator`] — the fault-isolation state machine. One per process.
//! - [`pipeline`] — the ordered operation queue that serializes every
//!   safety-relevant side effect onto a single consumer task.
//! - [`frame_guard`] — admission control for upstream motion frames plus
//!   the heartbeat watchdog that can push the isolator into Degraded.
//!
//! The pieces share state only through [`isolator::SafetyIsolator`] and its
//! event bus; frame admission and the pipeline never contend on a lock.

pub mod frame_guard;
pub mod isolator;
pub mod pipeline;

pub use frame_guard::{FrameDecision, FrameGuard, MotionFrame};
pub use isolator::SafetyIsolator;
pub use pipeline::{CommandKind, Operation, PipelineError, SafetyPipeline};
