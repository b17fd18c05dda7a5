//! Cross-process reset coordination for a shared motion controller.
//!
//! Several processes on one machine may talk to the same controller card.
//! This crate gives them three primitives:
//!
//! - [`ExclusiveResourceLock`]: a machine-wide `flock`-backed lock so only
//!   one process resets the card at a time.
//! - [`ResetBroadcastChannel`]: a shared-memory mailbox announcing resets
//!   to every peer process.
//! - [`DistributedResetCoordinator`]: the protocol tying both together,
//!   on both the originating and the following side.

pub mod coordinator;
pub mod error;
pub mod lock;
pub mod mailbox;

pub use coordinator::{CoordinatorEvent, DistributedResetCoordinator};
pub use error::{IpcError, IpcResult};
pub use lock::{ExclusiveResourceLock, LockAcquisition};
pub use mailbox::{ResetBroadcastChannel, ResetKind, ResetNotification};
