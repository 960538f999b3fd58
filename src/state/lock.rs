//! Run lock preventing concurrent runs against the same state.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, StateError, TerraceError};

use super::store::StateStore;

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300;

/// Information about a run lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// What the holder is doing (`apply`, `destroy`, `manual`).
    #[serde(default)]
    pub operation: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a new lock info; an empty holder gets a generated identifier.
    #[must_use]
    pub fn new(holder: &str, operation: &str) -> Self {
        let now = Utc::now();
        let holder = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder,
            operation: operation.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns a copy whose expiry is pushed back by [`LOCK_EXPIRY_SECS`].
    #[must_use]
    pub fn renewed(&self) -> Self {
        Self {
            expires_at: Utc::now() + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
            ..self.clone()
        }
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }
}

/// How often a held lock is renewed in the background.
const HEARTBEAT_SECS: u64 = 60;

/// Serializes a lock for a backend to store.
pub(crate) fn serialize_lock(lock: &LockInfo) -> Result<String> {
    serde_json::to_string_pretty(lock).map_err(|e| {
        TerraceError::State(StateError::serialization(format!("Failed to serialize lock: {e}")))
    })
}

/// The error reported to a run that finds `lock` held.
pub(crate) fn locked_by(lock: LockInfo) -> TerraceError {
    TerraceError::State(StateError::LockedByOther {
        holder: lock.holder,
        since: lock.acquired_at.to_rfc3339(),
    })
}

/// Checks that `current` is the lock `lock_id` and returns it.
///
/// # Errors
///
/// Returns `LockedByOther` if a different lock is present, `LockLost` if none is.
pub(crate) fn ensure_owner(current: Option<LockInfo>, lock_id: &str) -> Result<LockInfo> {
    match current {
        Some(lock) if lock.lock_id == lock_id => Ok(lock),
        Some(other) => Err(locked_by(other)),
        None => Err(TerraceError::State(StateError::LockLost {
            lock_id: lock_id.to_string(),
            message: String::from("the lock was removed"),
        })),
    }
}

/// A held run lock. Release it explicitly with [`RunLock::release`].
///
/// While held, a background task renews the lock once a minute so that long
/// provider calls do not let it expire.
pub struct RunLock {
    store: Arc<dyn StateStore>,
    info: Arc<Mutex<LockInfo>>,
    heartbeat: JoinHandle<()>,
}

impl std::fmt::Debug for RunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLock").field("info", &self.info()).finish_non_exhaustive()
    }
}

impl RunLock {
    /// Acquires the run lock on `store`.
    ///
    /// # Errors
    ///
    /// Returns `LockedByOther` if another unexpired lock exists.
    pub async fn acquire(store: Arc<dyn StateStore>, operation: &str) -> Result<Self> {
        let info = Arc::new(Mutex::new(
            store.acquire_lock(&generate_holder_id(), operation).await?,
        ));
        let heartbeat = tokio::spawn(heartbeat(Arc::clone(&store), Arc::clone(&info)));
        Ok(Self {
            store,
            info,
            heartbeat,
        })
    }

    /// Gets a copy of the lock info.
    #[must_use]
    pub fn info(&self) -> LockInfo {
        self.info.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Confirms the lock is still ours and extends it.
    ///
    /// # Errors
    ///
    /// Returns `LockedByOther` if another run took the lock over, or
    /// `LockLost` if it was removed.
    pub async fn renew(&self) -> Result<()> {
        let lock_id = self.info().lock_id;
        let renewed = self.store.renew_lock(&lock_id).await?;
        *self.info.lock().unwrap_or_else(PoisonError::into_inner) = renewed;
        Ok(())
    }

    /// Releases the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot remove the lock.
    pub async fn release(self) -> Result<()> {
        self.heartbeat.abort();
        let info = self.info();
        if info.is_expired() {
            warn!(
                "Run lock {} expired before release; another run may have taken over",
                info.lock_id
            );
        }
        self.store.release_lock(&info.lock_id).await
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

async fn heartbeat(store: Arc<dyn StateStore>, info: Arc<Mutex<LockInfo>>) {
    let lock_id = info.lock().unwrap_or_else(PoisonError::into_inner).lock_id.clone();
    loop {
        tokio::time::sleep(Duration::from_secs(HEARTBEAT_SECS)).await;
        match store.renew_lock(&lock_id).await {
            Ok(renewed) => {
                debug!("Renewed run lock {lock_id} until {}", renewed.expires_at);
                *info.lock().unwrap_or_else(PoisonError::into_inner) = renewed;
            }
            Err(e) => {
                warn!("Stopped renewing run lock {lock_id}: {e}");
                return;
            }
        }
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());
    let pid = std::process::id();
    let suffix = &Uuid::new_v4().simple().to_string()[..8];

    format!("{hostname}-{pid}-{suffix}")
}
