//! Machine-wide exclusive lock over a shared hardware resource.
//!
//! Backed by `flock(2)` on a file in `/dev/shm`. The kernel releases the
//! lock when the holding process dies, so a crashed holder never wedges
//! the machine; the holder's pid is additionally stamped into the file so
//! the next acquirer can tell a clean handover from an abandoned lock.

use crate::error::{IpcError, IpcResult};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome detail of a successful acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockAcquisition {
    /// Pid of a previous holder that died without releasing, if the stamp
    /// pointed at a dead process when we took over.
    pub abandoned_holder: Option<u32>,
}

/// Exclusive cross-process lock on one named resource.
///
/// Acquire and release are idempotent; dropping the lock releases it.
pub struct ExclusiveResourceLock {
    path: PathBuf,
    resource: String,
    held: parking_lot::Mutex<Option<File>>,
}

impl ExclusiveResourceLock {
    /// Bind to a lock file. The file is created lazily on first acquire.
    pub fn new(path: impl Into<PathBuf>, resource: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            resource: resource.into(),
            held: parking_lot::Mutex::new(None),
        }
    }

    /// Lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this instance currently holds the lock.
    pub fn is_held(&self) -> bool {
        self.held.lock().is_some()
    }

    /// Acquire the lock, polling until `timeout` elapses or `cancel` fires.
    ///
    /// Re-acquiring while already held returns immediately.
    pub async fn acquire(
        &self,
        timeout: Duration,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> IpcResult<LockAcquisition> {
        if self.is_held() {
            debug!(resource = %self.resource, "lock already held by this instance");
            return Ok(LockAcquisition {
                abandoned_holder: None,
            });
        }

        let previous_stamp = read_pid_stamp(&self.path);

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .mode(0o600)
            .open(&self.path)?;

        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            if try_flock(&file) {
                break;
            }
            if Instant::now() >= deadline {
                return Err(IpcError::LockTimeout {
                    resource: self.resource.clone(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(IpcError::Cancelled {
                        resource: self.resource.clone(),
                    });
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        let self_pid = std::process::id();
        let abandoned_holder = match previous_stamp {
            Some(pid) if pid != self_pid && !is_process_alive(pid) => {
                warn!(
                    resource = %self.resource,
                    holder_pid = pid,
                    "recovered lock abandoned by dead process"
                );
                Some(pid)
            }
            _ => None,
        };

        stamp_pid(&file, self_pid)?;
        *self.held.lock() = Some(file);
        info!(resource = %self.resource, "lock acquired");
        Ok(LockAcquisition { abandoned_holder })
    }

    /// Release the lock. Releasing while not held is a no-op.
    ///
    /// The pid stamp is cleared before unlocking, so when this process
    /// later exits the next acquirer never mistakes the clean handover for
    /// an abandoned lock.
    pub fn release(&self) {
        if let Some(file) = self.held.lock().take() {
            if let Err(e) = file.set_len(0) {
                warn!(resource = %self.resource, error = %e, "stamp clear failed on release");
            }
            unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
            info!(resource = %self.resource, "lock released");
        }
    }
}

impl Drop for ExclusiveResourceLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn try_flock(file: &File) -> bool {
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    result == 0
}

fn read_pid_stamp(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

fn stamp_pid(mut file: &File, pid: u32) -> IpcResult<()> {
    file.set_len(0)?;
    file.write_all(pid.to_string().as_bytes())?;
    file.flush()?;
    Ok(())
}

/// Liveness probe via `kill(pid, 0)`; EPERM means alive but unsignalable.
pub(crate) fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::Error::EPERM) => true,
        Err(_) => false,
    }
}
