//! Shared-memory reset broadcast mailbox.
//!
//! One fixed 4096-byte slot per card in `/dev/shm`, written whole by the
//! reset originator and polled by every other process on the machine. The
//! slot holds a 4-byte little-endian length prefix followed by a UTF-8
//! payload:
//!
//! ```text
//! cardId|resetKind|pid|processName|timestampISO8601
//! ```
//!
//! Receivers drop self-originated, malformed and stale notifications. If
//! the slot cannot be mapped the channel degrades to lock-only
//! coordination, logged once at open.

use crate::error::{IpcError, IpcResult};
use chrono::{DateTime, Utc};
use memmap2::{MmapMut, MmapOptions};
use sgx::hal::EventSink;
use std::fmt;
use std::fs::OpenOptions;
use std::hash::{Hash, Hasher};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Total slot size in shared memory.
pub const SLOT_SIZE: usize = 4096;
const LEN_PREFIX: usize = 4;
/// Largest payload the slot can carry.
pub const MAX_PAYLOAD: usize = SLOT_SIZE - LEN_PREFIX;

static_assertions::const_assert!(MAX_PAYLOAD > 256);

/// Kind of coordinated reset being announced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetKind {
    /// Full link teardown and re-initialization.
    Cold,
    /// Soft controller reset, link survives.
    Warm,
    /// A kind this build does not know; carried verbatim so newer peers
    /// interoperate with older ones.
    Other(String),
}

impl ResetKind {
    fn from_token(token: &str) -> Self {
        match token {
            "cold" => Self::Cold,
            "warm" => Self::Warm,
            other => Self::Other(other.to_string()),
        }
    }

    /// How long a receiver should wait for the controller to come back.
    pub fn recovery_wait(&self, config: &sgx::config::CoordinatorConfig) -> Duration {
        match self {
            Self::Cold => Duration::from_secs(config.cold_recovery_secs),
            Self::Warm => Duration::from_secs(config.warm_recovery_secs),
            Self::Other(_) => Duration::from_secs(5),
        }
    }
}

impl fmt::Display for ResetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cold => f.write_str("cold"),
            Self::Warm => f.write_str("warm"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

/// One reset announcement as carried in the slot.
#[derive(Debug, Clone, PartialEq)]
pub struct ResetNotification {
    /// Card the reset applies to.
    pub card_id: u32,
    /// Reset kind.
    pub kind: ResetKind,
    /// Originating process id, used for self-origin filtering.
    pub pid: u32,
    /// Originating process name, for logs only.
    pub process_name: String,
    /// When the originator wrote the notification.
    pub timestamp: DateTime<Utc>,
}

impl ResetNotification {
    /// Serialize to the pipe-delimited wire form.
    pub fn to_wire(&self) -> String {
        // The field separator must not appear inside a field.
        let name = self.process_name.replace('|', "_");
        format!(
            "{}|{}|{}|{}|{}",
            self.card_id,
            self.kind,
            self.pid,
            name,
            self.timestamp.to_rfc3339()
        )
    }

    /// Parse the wire form.
    pub fn parse(wire: &str) -> IpcResult<Self> {
        let fields: Vec<&str> = wire.split('|').collect();
        if fields.len() != 5 {
            return Err(IpcError::MalformedNotification {
                reason: format!("expected 5 fields, got {}", fields.len()),
            });
        }
        let card_id = fields[0]
            .parse()
            .map_err(|_| IpcError::MalformedNotification {
                reason: format!("bad card id '{}'", fields[0]),
            })?;
        let pid = fields[2]
            .parse()
            .map_err(|_| IpcError::MalformedNotification {
                reason: format!("bad pid '{}'", fields[2]),
            })?;
        let timestamp = DateTime::parse_from_rfc3339(fields[4])
            .map_err(|e| IpcError::MalformedNotification {
                reason: format!("bad timestamp '{}': {e}", fields[4]),
            })?
            .with_timezone(&Utc);
        Ok(Self {
            card_id,
            kind: ResetKind::from_token(fields[1]),
            pid,
            process_name: fields[3].to_string(),
            timestamp,
        })
    }
}

/// Shared-memory broadcast channel for one card's reset slot.
pub struct ResetBroadcastChannel {
    path: PathBuf,
    mmap: parking_lot::Mutex<Option<MmapMut>>,
    self_pid: u32,
    staleness: Duration,
    poll_interval: Duration,
    last_fingerprint: parking_lot::Mutex<Option<u64>>,
    cancel: CancellationToken,
    poller: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ResetBroadcastChannel {
    /// Map (creating if needed) the slot file.
    ///
    /// `self_pid` is the identity used for self-origin filtering; pass the
    /// current process id in production.
    pub fn open(
        path: impl Into<PathBuf>,
        self_pid: u32,
        poll_interval: Duration,
        staleness: Duration,
    ) -> Self {
        let path = path.into();
        let mmap = match map_slot(&path) {
            Ok(m) => Some(m),
            Err(e) => {
                // Logged once; the coordinator still works through the
                // lock alone, peers just reconnect on their own schedule.
                warn!(
                    path = %path.display(),
                    error = %e,
                    "reset mailbox unavailable, degrading to lock-only coordination"
                );
                None
            }
        };
        Self {
            path,
            mmap: parking_lot::Mutex::new(mmap),
            self_pid,
            staleness,
            poll_interval,
            last_fingerprint: parking_lot::Mutex::new(None),
            cancel: CancellationToken::new(),
            poller: parking_lot::Mutex::new(None),
        }
    }

    /// Slot file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the mailbox is operating in degraded, lock-only mode.
    pub fn is_degraded(&self) -> bool {
        self.mmap.lock().is_none()
    }

    /// Write a notification into the slot for peers to observe.
    pub fn publish(&self, notification: &ResetNotification) -> IpcResult<()> {
        let payload = notification.to_wire().into_bytes();
        if payload.len() > MAX_PAYLOAD {
            return Err(IpcError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD,
            });
        }
        let mut guard = self.mmap.lock();
        let Some(mmap) = guard.as_mut() else {
            debug!("mailbox degraded, notification not broadcast");
            return Ok(());
        };
        mmap[..LEN_PREFIX].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        mmap[LEN_PREFIX..LEN_PREFIX + payload.len()].copy_from_slice(&payload);
        // Zero the tail so a shorter write never exposes old bytes.
        mmap[LEN_PREFIX + payload.len()..].fill(0);
        mmap.flush()?;
        // Our own write must not appear as an incoming change.
        *self.last_fingerprint.lock() = Some(fingerprint(&payload));
        debug!(wire = %notification.to_wire(), "reset notification published");
        Ok(())
    }

    /// Read the slot once and return an actionable incoming notification,
    /// if the content changed since the last poll and survives filtering.
    pub fn poll_once(&self) -> Option<ResetNotification> {
        let raw = {
            let guard = self.mmap.lock();
            let mmap = guard.as_ref()?;
            let len = u32::from_le_bytes([mmap[0], mmap[1], mmap[2], mmap[3]]) as usize;
            if len == 0 || len > MAX_PAYLOAD {
                return None;
            }
            mmap[LEN_PREFIX..LEN_PREFIX + len].to_vec()
        };

        let fp = fingerprint(&raw);
        {
            let mut last = self.last_fingerprint.lock();
            if *last == Some(fp) {
                return None;
            }
            *last = Some(fp);
        }

        let wire = match std::str::from_utf8(&raw) {
            Ok(s) => s,
            Err(_) => {
                warn!("dropping reset notification: not valid UTF-8");
                return None;
            }
        };
        let notification = match ResetNotification::parse(wire) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "dropping malformed reset notification");
                return None;
            }
        };
        if notification.pid == self.self_pid {
            debug!("dropping self-originated reset notification");
            return None;
        }
        let age = Utc::now() - notification.timestamp;
        if age > chrono::Duration::from_std(self.staleness).unwrap_or(chrono::Duration::zero()) {
            warn!(
                age_secs = age.num_seconds(),
                "dropping stale reset notification"
            );
            return None;
        }
        Some(notification)
    }

    /// Spawn the background poller, delivering incoming notifications to
    /// `sink`. Degraded channels spawn nothing.
    pub fn start(self: &Arc<Self>, sink: EventSink<ResetNotification>) {
        if self.is_degraded() {
            return;
        }
        // Content present before we started is history, not a command.
        self.baseline();
        let channel = Arc::clone(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(channel.poll_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        if let Some(n) = channel.poll_once() {
                            info!(
                                from_pid = n.pid,
                                from = %n.process_name,
                                kind = %n.kind,
                                "incoming reset notification"
                            );
                            sink.send(n);
                        }
                    }
                }
            }
        });
        *self.poller.lock() = Some(handle);
    }

    /// Stop the poller.
    pub async fn dispose(&self) {
        self.cancel.cancel();
        let handle = self.poller.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn baseline(&self) {
        let guard = self.mmap.lock();
        if let Some(mmap) = guard.as_ref() {
            let len = u32::from_le_bytes([mmap[0], mmap[1], mmap[2], mmap[3]]) as usize;
            if len > 0 && len <= MAX_PAYLOAD {
                *self.last_fingerprint.lock() =
                    Some(fingerprint(&mmap[LEN_PREFIX..LEN_PREFIX + len]));
            }
        }
    }
}

fn map_slot(path: &Path) -> IpcResult<MmapMut> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .mode(0o600)
        .open(path)?;
    file.set_len(SLOT_SIZE as u64)?;
    let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
    Ok(mmap)
}

fn fingerprint(bytes: &[u8]) -> u64 {
    let mut hasher = std::hash::DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}
