//! Local file-based state storage backend.
//!
//! The state document lives in `.terrace/state.json` next to the
//! configuration. Every save writes a temporary file, syncs it and renames it
//! over the previous document, so a crash never leaves a half-written state.
//! The lock file is created with a hard link, so exactly one of several
//! concurrent runs can acquire it; replacing an expired lock, renewing and
//! releasing happen under a short-lived guard file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, StateError, TerraceError};

use super::lock::{ensure_owner, locked_by, serialize_lock, LockInfo, LOCK_EXPIRY_SECS};
use super::store::StateStore;
use super::types::StateDocument;

/// Default state directory name.
pub const STATE_DIR: &str = ".terrace";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Guard file serializing changes to an existing lock file.
const GUARD_FILE: &str = "state.lock.guard";

/// How many times to wait for the guard before giving up.
const GUARD_ATTEMPTS: u32 = 100;

/// Pause between guard attempts.
const GUARD_RETRY: Duration = Duration::from_millis(20);

/// A guard older than this was left behind by a crashed process.
const GUARD_STALE: Duration = Duration::from_secs(30);

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Path to the lock guard file.
    guard_path: PathBuf,
}

/// Held lock guard; removes the guard file when dropped.
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove lock guard {}: {e}", self.path.display());
        }
    }
}

impl LocalStateStore {
    /// Creates a store in `.terrace` under the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| TerraceError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a store in a custom directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);
        let guard_path = base_dir.join(GUARD_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
            guard_path,
        }
    }

    /// Path of the state document.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                TerraceError::State(StateError::local(format!(
                    "Failed to create state directory: {e}"
                )))
            })?;
        }
        Ok(())
    }

    /// Writes `content` to a synced temporary file next to `path`.
    ///
    /// Every call gets its own file name so concurrent writers never share one.
    async fn write_temp(&self, path: &Path, content: &str) -> Result<PathBuf> {
        self.ensure_dir().await?;
        let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
        temp_name.push(format!(".{}.tmp", Uuid::new_v4().simple()));
        let temp_path = path.with_file_name(temp_name);
        let io_error = |action: &str, e: std::io::Error| {
            TerraceError::State(StateError::local(format!(
                "Failed to {action} {}: {e}",
                temp_path.display()
            )))
        };

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| io_error("create", e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| io_error("write", e))?;
        file.sync_all().await.map_err(|e| io_error("sync", e))?;
        Ok(temp_path)
    }

    /// Writes `content` to `path` through a synced temporary file.
    async fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        let temp_path = self.write_temp(path, content).await?;
        if let Err(e) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(TerraceError::State(StateError::local(format!(
                "Failed to move state into {}: {e}",
                path.display()
            ))));
        }
        Ok(())
    }

    /// Publishes `lock` only if no lock file exists.
    ///
    /// The content is written to a temporary file and hard-linked into place,
    /// which fails atomically when another process got there first. Returns
    /// `false` in that case.
    async fn create_lock_file(&self, lock: &LockInfo) -> Result<bool> {
        let temp_path = self.write_temp(&self.lock_path, &serialize_lock(lock)?).await?;
        let linked = fs::hard_link(&temp_path, &self.lock_path).await;
        let _ = fs::remove_file(&temp_path).await;

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(TerraceError::State(StateError::LockFailed {
                message: format!("Failed to create lock file: {e}"),
            })),
        }
    }

    /// Takes the guard that every read-modify-write of the lock file holds.
    ///
    /// Creating a lock where none exists does not need it; replacing, renewing
    /// or removing an existing lock does.
    async fn lock_guard(&self) -> Result<LockGuard> {
        self.ensure_dir().await?;
        for _ in 0..GUARD_ATTEMPTS {
            let created = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.guard_path)
                .await;
            match created {
                Ok(_) => {
                    return Ok(LockGuard {
                        path: self.guard_path.clone(),
                    })
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.guard_is_stale().await {
                        warn!("Removing stale lock guard {}", self.guard_path.display());
                        let _ = fs::remove_file(&self.guard_path).await;
                    } else {
                        tokio::time::sleep(GUARD_RETRY).await;
                    }
                }
                Err(e) => {
                    return Err(TerraceError::State(StateError::LockFailed {
                        message: format!("Failed to create lock guard: {e}"),
                    }))
                }
            }
        }
        Err(TerraceError::State(StateError::LockFailed {
            message: format!("Timed out waiting for {}", self.guard_path.display()),
        }))
    }

    async fn guard_is_stale(&self) -> bool {
        fs::metadata(&self.guard_path)
            .await
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age > GUARD_STALE)
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(TerraceError::State(StateError::corrupted(format!(
                    "Failed to read lock file: {e}"
                ))));
            }
        };

        serde_json::from_str(&content).map(Some).map_err(|e| {
            TerraceError::State(StateError::corrupted(format!("Failed to parse lock file: {e}")))
        })
    }

    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TerraceError::State(StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })),
        }
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<StateDocument>> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        }

        info!("Loading state from: {}", self.state_path.display());

        let content = fs::read_to_string(&self.state_path).await.map_err(|e| {
            TerraceError::State(StateError::corrupted(format!("Failed to read state file: {e}")))
        })?;

        StateDocument::from_json(&content).map(Some)
    }

    async fn save(&self, state: &StateDocument) -> Result<()> {
        debug!(
            "Saving state serial {} to: {}",
            state.serial,
            self.state_path.display()
        );
        let content = state.to_json()?;
        self.write_atomic(&self.state_path, &content).await
    }

    async fn delete(&self) -> Result<()> {
        if self.state_path.exists() {
            info!("Deleting state file: {}", self.state_path.display());
            fs::remove_file(&self.state_path).await.map_err(|e| {
                TerraceError::State(StateError::local(format!("Failed to delete state file: {e}")))
            })?;
        }
        self.delete_lock_file().await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let lock_info = LockInfo::new(holder, operation);

        if !self.create_lock_file(&lock_info).await? {
            let _guard = self.lock_guard().await?;
            match self.read_lock_file().await? {
                Some(existing) if !existing.is_expired() => return Err(locked_by(existing)),
                Some(existing) => {
                    debug!("Expired lock held by {} found, taking over", existing.holder);
                    self.delete_lock_file().await?;
                }
                None => {}
            }
            if !self.create_lock_file(&lock_info).await? {
                return match self.read_lock_file().await? {
                    Some(winner) => Err(locked_by(winner)),
                    None => Err(TerraceError::State(StateError::LockFailed {
                        message: String::from("Lock file changed while acquiring it"),
                    })),
                };
            }
        }

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );
        Ok(lock_info)
    }

    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let _guard = self.lock_guard().await?;
        let renewed = ensure_owner(self.read_lock_file().await?, lock_id)?.renewed();
        self.write_atomic(&self.lock_path, &serialize_lock(&renewed)?)
            .await
            .map_err(|e| {
                TerraceError::State(StateError::LockFailed {
                    message: e.to_string(),
                })
            })?;
        debug!("Renewed state lock {lock_id} until {}", renewed.expires_at);
        Ok(renewed)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let _guard = self.lock_guard().await?;
        match self.read_lock_file().await? {
            Some(existing) if existing.lock_id == lock_id => {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            }
            Some(existing) => debug!(
                "Lock ID mismatch: expected {lock_id}, found {}",
                existing.lock_id
            ),
            None => debug!("No lock to release"),
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        info!("Force-removing state lock at {}", self.lock_path.display());
        self.delete_lock_file().await?;
        match fs::remove_file(&self.guard_path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(TerraceError::State(
                StateError::LockFailed {
                    message: format!("Failed to delete lock guard: {e}"),
                },
            )),
            _ => Ok(()),
        }
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }

    fn location(&self) -> String {
        self.state_path.display().to_string()
    }
}
