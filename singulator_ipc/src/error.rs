//! Error types for cross-process coordination.

use thiserror::Error;

/// Errors that can occur during cross-process coordination.
///
/// Cancellation and timeout are distinct variants on purpose: a caller
/// tearing down must be able to tell "the peer held the lock too long"
/// apart from "we were asked to stop waiting".
#[derive(Error, Debug)]
pub enum IpcError {
    /// The machine-wide lock was not acquired within the deadline.
    #[error("timed out after {waited_ms} ms waiting for lock '{resource}'")]
    LockTimeout {
        /// Lock resource name.
        resource: String,
        /// Total time spent waiting.
        waited_ms: u64,
    },

    /// The wait was cancelled before the lock became available.
    #[error("cancelled while waiting for lock '{resource}'")]
    Cancelled {
        /// Lock resource name.
        resource: String,
    },

    /// A notification payload could not be parsed.
    #[error("malformed reset notification: {reason}")]
    MalformedNotification {
        /// What failed to parse.
        reason: String,
    },

    /// A notification does not fit the shared-memory slot.
    #[error("notification payload is {len} bytes, slot holds at most {max}")]
    PayloadTooLarge {
        /// Serialized payload length.
        len: usize,
        /// Maximum payload the slot can carry.
        max: usize,
    },

    /// A hardware call inside a coordinated reset failed.
    #[error("hardware error during coordinated reset: {0}")]
    Hal(#[from] sgx::hal::HalError),

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("system call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },
}

/// Result type for coordination operations.
pub type IpcResult<T> = Result<T, IpcError>;
