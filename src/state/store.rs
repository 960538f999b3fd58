//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.

use async_trait::async_trait;

use crate::error::Result;
use super::types::StateDocument;
use super::lock::LockInfo;

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the state document.
    ///
    /// Returns `None` if no state exists yet. An unreadable document is an
    /// error, never an empty state.
    async fn load(&self) -> Result<Option<StateDocument>>;

    /// Saves the state document atomically.
    async fn save(&self, state: &StateDocument) -> Result<()>;

    /// Deletes the state document and any lock.
    async fn delete(&self) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the run lock for `holder`, describing `operation`.
    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo>;

    /// Pushes back the expiry of the lock `lock_id`.
    ///
    /// Fails with `LockedByOther` when another run has replaced the lock and
    /// with `LockLost` when no lock is present.
    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo>;

    /// Releases the run lock if `lock_id` still owns it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Removes the run lock whoever holds it.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked by an unexpired lock.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self.get_lock_info().await?.is_some_and(|l| !l.is_expired()))
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;

    /// Describes where the state lives, for display.
    fn location(&self) -> String;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self) -> Result<Option<StateDocument>> {
        (**self).load().await
    }

    async fn save(&self, state: &StateDocument) -> Result<()> {
        (**self).save(state).await
    }

    async fn delete(&self) -> Result<()> {
        (**self).delete().await
    }

    async fn exists(&self) -> Result<bool> {
        (**self).exists().await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder, operation).await
    }

    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo> {
        (**self).renew_lock(lock_id).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn force_unlock(&self) -> Result<()> {
        (**self).force_unlock().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    async fn is_locked(&self) -> Result<bool> {
        (**self).is_locked().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }

    fn location(&self) -> String {
        (**self).location()
    }
}
