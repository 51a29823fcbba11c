//! TTL cache for adapter results with a JSON snapshot on disk.
//!
//! Entries live in a `moka` cache whose per-entry expiry is derived from an
//! absolute epoch-millisecond deadline, so a snapshot restored after a restart
//! keeps the deadline it was written with. Snapshot failures are logged and
//! swallowed: the store keeps serving from memory.

use moka::future::Cache;
use moka::Expiry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::CacheIoError;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Value,
    expires_at_ms: i64,
}

impl StoredValue {
    fn is_live(&self, now: i64) -> bool {
        self.expires_at_ms > now
    }

    fn remaining(&self, now: i64) -> Duration {
        Duration::from_millis(self.expires_at_ms.saturating_sub(now).max(0) as u64)
    }
}

/// Expiry policy that reads the deadline carried by each value. Updates reset
/// the timer from the new value rather than keeping the old one.
struct DeadlineExpiry;

impl Expiry<String, StoredValue> for DeadlineExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredValue,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.remaining(now_ms()))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.remaining(now_ms()))
    }
}

/// On-disk form of one entry.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEntry {
    value: Value,
    expires: i64,
}

pub struct CacheStore {
    entries: Cache<String, StoredValue>,
    default_ttl: Duration,
    snapshot_path: Option<PathBuf>,
}

impl CacheStore {
    /// Memory-only store; `persist` and `close` are no-ops.
    pub fn in_memory(default_ttl: Duration) -> Self {
        Self {
            entries: Cache::builder().expire_after(DeadlineExpiry).build(),
            default_ttl,
            snapshot_path: None,
        }
    }

    /// Build a store backed by `snapshot_path`, restoring any live entries it holds.
    pub async fn open(snapshot_path: impl Into<PathBuf>, default_ttl: Duration) -> Self {
        let mut store = Self::in_memory(default_ttl);
        let path = snapshot_path.into();
        match store.restore(&path).await {
            Ok(0) => debug!("No cache entries restored from {}", path.display()),
            Ok(count) => info!("Restored {} cache entries from {}", count, path.display()),
            Err(e) => warn!("Ignoring cache snapshot {}: {}", path.display(), e),
        }
        store.snapshot_path = Some(path);
        store
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let stored = self.entries.get(key).await?;
        // moka reclaims lazily; the deadline is authoritative.
        if stored.is_live(now_ms()) {
            Some(stored.value)
        } else {
            None
        }
    }

    pub async fn set(&self, key: impl Into<String>, value: Value) {
        self.set_with_ttl(key, value, self.default_ttl).await
    }

    pub async fn set_with_ttl(&self, key: impl Into<String>, value: Value, ttl: Duration) {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let stored = StoredValue {
            value,
            expires_at_ms: now_ms().saturating_add(ttl_ms),
        };
        self.entries.insert(key.into(), stored).await;
    }

    /// Time left before `key` expires, if it is live.
    pub async fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let now = now_ms();
        self.entries
            .get(key)
            .await
            .filter(|stored| stored.is_live(now))
            .map(|stored| stored.remaining(now))
    }

    /// Reclaim expired entries. Returns the number of entries left.
    pub async fn sweep(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }

    fn live_entries(&self) -> BTreeMap<String, SnapshotEntry> {
        let now = now_ms();
        self.entries
            .iter()
            .filter(|(_, stored)| stored.is_live(now))
            .map(|(key, stored)| {
                (
                    String::clone(&key),
                    SnapshotEntry {
                        value: stored.value,
                        expires: stored.expires_at_ms,
                    },
                )
            })
            .collect()
    }

    /// Write all live entries to `path`, replacing it through a temporary file.
    pub async fn save_snapshot(&self, path: &Path) -> Result<usize, CacheIoError> {
        let entries = self.live_entries();
        let bytes = serde_json::to_vec(&entries)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(entries.len())
    }

    async fn restore(&self, path: &Path) -> Result<usize, CacheIoError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let snapshot: BTreeMap<String, SnapshotEntry> = serde_json::from_slice(&bytes)?;

        let now = now_ms();
        let mut restored = 0;
        for (key, entry) in snapshot {
            if entry.expires <= now {
                continue;
            }
            let stored = StoredValue {
                value: entry.value,
                expires_at_ms: entry.expires,
            };
            self.entries.insert(key, stored).await;
            restored += 1;
        }
        Ok(restored)
    }

    /// Best-effort snapshot to the configured path.
    pub async fn persist(&self) {
        let Some(path) = self.snapshot_path.as_deref() else {
            return;
        };
        match self.save_snapshot(path).await {
            Ok(count) => debug!("Saved {} cache entries to {}", count, path.display()),
            Err(e) => warn!("Failed to save cache snapshot {}: {}", path.display(), e),
        }
    }

    /// Final snapshot at shutdown.
    pub async fn close(&self) {
        self.sweep().await;
        self.persist().await;
        info!("Cache store closed with {} entries", self.entry_count());
    }

    /// Start the periodic sweep and snapshot tasks.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        sweep_every: Duration,
        snapshot_every: Duration,
    ) -> Maintenance {
        let (stop, stopped) = watch::channel(false);
        let sweeper = {
            let store = Arc::clone(self);
            let mut stopped = stopped.clone();
            tokio::spawn(async move {
                let start = tokio::time::Instant::now() + sweep_every;
                let mut ticker = tokio::time::interval_at(start, sweep_every);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let left = store.sweep().await;
                            debug!("Cache sweep done, {} entries live", left);
                        }
                        _ = stopped.changed() => break,
                    }
                }
            })
        };
        let snapshotter = {
            let store = Arc::clone(self);
            let mut stopped = stopped;
            tokio::spawn(async move {
                let start = tokio::time::Instant::now() + snapshot_every;
                let mut ticker = tokio::time::interval_at(start, snapshot_every);
                loop {
                    tokio::select! {
                        // A write already under way runs to completion before the
                        // stop signal is looked at again.
                        _ = ticker.tick() => store.persist().await,
                        _ = stopped.changed() => break,
                    }
                }
            })
        };
        Maintenance {
            stop,
            handles: vec![sweeper, snapshotter],
        }
    }
}

/// Handles of the background cache tasks.
pub struct Maintenance {
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Maintenance {
    /// Signal both tasks and wait for them, letting a snapshot write in
    /// progress finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Cache maintenance task ended abnormally: {}", e);
            }
        }
    }
}
