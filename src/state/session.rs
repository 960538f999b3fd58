//! Lock-guarded state session used for the duration of one run.
//!
//! A session holds the run lock, keeps the working document in memory and
//! writes it back after every change. Changes to one resource are serialized
//! by a lock scoped to that resource; flushes are serialized by a session-wide
//! lock so serials reach the backend in order.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{Lookup, Reference, ReferenceResolver, ResourceId};

use super::lock::RunLock;
use super::store::StateStore;
use super::types::{DataEntry, EntryStatus, RunRecord, StateDocument, StateEntry};

/// An open, locked view of the persisted state.
pub struct StateSession {
    store: Arc<dyn StateStore>,
    lock: RunLock,
    document: Mutex<StateDocument>,
    entry_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    flush_lock: tokio::sync::Mutex<()>,
    started_at: DateTime<Utc>,
}

impl std::fmt::Debug for StateSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSession")
            .field("backend", &self.store.backend_type())
            .field("lock", &self.lock)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl StateSession {
    /// Acquires the run lock and loads the current document.
    ///
    /// A missing document starts an empty one for `project`/`environment`.
    ///
    /// # Errors
    ///
    /// Returns `LockedByOther` if another run holds the lock, or the load
    /// error if the document is unreadable. The lock is released before a
    /// load error is returned.
    pub async fn open(
        store: Arc<dyn StateStore>,
        project: &str,
        environment: &str,
        operation: &str,
    ) -> Result<Self> {
        let lock = RunLock::acquire(Arc::clone(&store), operation).await?;

        let document = match store.load().await {
            Ok(Some(document)) => document,
            Ok(None) => {
                info!("No existing state, starting a new document");
                StateDocument::new(project, environment)
            }
            Err(e) => {
                if let Err(release) = lock.release().await {
                    warn!("Failed to release run lock after load error: {release}");
                }
                return Err(e);
            }
        };

        if document.project != project || document.environment != environment {
            warn!(
                "State belongs to {}/{}, configuration is {project}/{environment}",
                document.project, document.environment
            );
        }

        debug!(
            "Opened state session (lineage {}, serial {})",
            document.lineage, document.serial
        );

        Ok(Self {
            store,
            lock,
            document: Mutex::new(document),
            entry_locks: Mutex::new(HashMap::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            started_at: Utc::now(),
        })
    }

    /// When the session was opened.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Returns a copy of the working document.
    #[must_use]
    pub fn snapshot(&self) -> StateDocument {
        self.document().clone()
    }

    /// Gets a copy of one entry.
    #[must_use]
    pub fn entry(&self, id: &ResourceId) -> Option<StateEntry> {
        self.document().entry(id).cloned()
    }

    /// Applies `change` to the entry of `id` and flushes.
    ///
    /// `change` receives the current entry (if any) and returns the new one;
    /// returning `None` removes the entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails, including `LockedByOther` when
    /// another run has taken the lock over. The in-memory change is kept.
    pub async fn modify<F>(&self, id: &ResourceId, change: F) -> Result<()>
    where
        F: FnOnce(Option<StateEntry>) -> Option<StateEntry> + Send,
    {
        let entry_lock = self.entry_lock(id);
        let _guard = entry_lock.lock().await;

        {
            let mut document = self.document();
            let current = document.entry(id).cloned();
            match change(current) {
                Some(entry) => document.upsert(entry),
                None => {
                    document.remove(id);
                }
            }
        }

        self.flush().await
    }

    /// Inserts or replaces an entry and flushes.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub async fn upsert(&self, entry: StateEntry) -> Result<()> {
        let id = entry.id.clone();
        self.modify(&id, move |_| Some(entry)).await
    }

    /// Removes an entry and flushes.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub async fn remove(&self, id: &ResourceId) -> Result<()> {
        self.modify(id, |_| None).await
    }

    /// Sets the status of an entry, creating a placeholder when none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub async fn mark(
        &self,
        id: &ResourceId,
        status: EntryStatus,
        index: usize,
        error: Option<String>,
    ) -> Result<()> {
        let target = id.clone();
        self.modify(id, move |current| {
            Some(match current {
                Some(mut entry) => {
                    entry.mark(status, error);
                    entry
                }
                None => StateEntry::placeholder(target, status, index, error),
            })
        })
        .await
    }

    /// Replaces the resolved data-source snapshot and flushes.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub async fn set_data(&self, data: BTreeMap<String, DataEntry>) -> Result<()> {
        self.document().data = data;
        self.flush().await
    }

    /// Appends the run record, writes the final document and releases the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the final write fails; the lock is released either
    /// way.
    pub async fn close(self, record: RunRecord) -> Result<StateDocument> {
        self.document().add_history(record);
        let flushed = self.flush().await;

        let document = self
            .document
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        self.lock.release().await?;
        flushed?;

        info!("Closed state session at serial {}", document.serial);
        Ok(document)
    }

    /// Releases the lock without recording a run.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot remove the lock.
    pub async fn abandon(self) -> Result<()> {
        warn!("Abandoning state session without a run record");
        self.lock.release().await
    }

    /// Writes the working document with the next serial.
    ///
    /// The run lock is checked and renewed first; a session whose lock was
    /// taken over never writes again.
    async fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;
        self.lock.renew().await?;
        let document = {
            let mut document = self.document();
            document.serial += 1;
            document.last_updated = Utc::now();
            document.clone()
        };
        self.store.save(&document).await
    }

    fn document(&self) -> std::sync::MutexGuard<'_, StateDocument> {
        self.document.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry_lock(&self, id: &ResourceId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.entry_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(id.to_string()).or_default())
    }
}

impl ReferenceResolver for StateSession {
    fn lookup(&self, reference: &Reference) -> Lookup {
        self.document().lookup(reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StateError, TerraceError};
    use crate::state::{LocalStateStore, LockInfo};
    use serde_json::json;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> Arc<dyn StateStore> {
        Arc::new(LocalStateStore::with_base_dir(dir.path()))
    }

    fn vpc() -> StateEntry {
        StateEntry::created(
            ResourceId::managed("aws_vpc", "main"),
            String::from("vpc-1"),
            BTreeMap::from([(String::from("cidr_block"), json!("10.0.0.0/16"))]),
            BTreeMap::new(),
            Vec::new(),
            0,
        )
    }

    fn record() -> RunRecord {
        RunRecord {
            run_id: String::from("run-1"),
            operation: crate::state::RunOperation::Apply,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            config_hash: String::from("abc"),
            succeeded: 1,
            failed: 0,
            skipped: 0,
            cancelled: 0,
            success: true,
        }
    }

    #[tokio::test]
    async fn test_every_change_is_flushed() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let session = StateSession::open(Arc::clone(&store), "demo", "dev", "apply")
            .await
            .unwrap();

        session.upsert(vpc()).await.unwrap();
        let persisted = store.load().await.unwrap().unwrap();
        assert_eq!(persisted.serial, 1);
        assert!(persisted.live_entry(&ResourceId::managed("aws_vpc", "main")).is_some());

        session
            .mark(&ResourceId::managed("aws_subnet", "a"), EntryStatus::Failed, 2, Some(String::from("boom")))
            .await
            .unwrap();
        let persisted = store.load().await.unwrap().unwrap();
        assert_eq!(persisted.serial, 2);
        let failed = persisted.entry(&ResourceId::managed("aws_subnet", "a")).unwrap();
        assert_eq!(failed.status, EntryStatus::Failed);
        assert_eq!(failed.provider_id, None);

        session.remove(&ResourceId::managed("aws_vpc", "main")).await.unwrap();
        let document = session.close(record()).await.unwrap();
        assert_eq!(document.serial, 4);
        assert_eq!(document.history.len(), 1);
        assert!(!store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_second_session_is_refused() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let first = StateSession::open(Arc::clone(&store), "demo", "dev", "apply")
            .await
            .unwrap();

        let err = StateSession::open(Arc::clone(&store), "demo", "dev", "apply")
            .await
            .unwrap_err();
        assert!(matches!(err, TerraceError::State(StateError::LockedByOther { .. })));

        first.abandon().await.unwrap();
        assert!(StateSession::open(store, "demo", "dev", "apply").await.is_ok());
    }

    #[tokio::test]
    async fn test_taken_over_session_stops_writing() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let first = StateSession::open(Arc::clone(&store), "demo", "dev", "apply")
            .await
            .unwrap();
        first.upsert(vpc()).await.unwrap();

        let lock_path = dir.path().join("state.lock");
        let mut lock: LockInfo =
            serde_json::from_str(&std::fs::read_to_string(&lock_path).unwrap()).unwrap();
        lock.expires_at = Utc::now() - chrono::Duration::seconds(1);
        std::fs::write(&lock_path, serde_json::to_string(&lock).unwrap()).unwrap();

        let second = StateSession::open(Arc::clone(&store), "demo", "dev", "apply")
            .await
            .unwrap();
        let subnet = ResourceId::managed("aws_subnet", "a");
        second.mark(&subnet, EntryStatus::Failed, 1, None).await.unwrap();

        let err = first.remove(&vpc().id).await.unwrap_err();
        assert!(matches!(err, TerraceError::State(StateError::LockedByOther { .. })));

        let persisted = store.load().await.unwrap().unwrap();
        assert!(persisted.entry(&subnet).is_some());
        assert!(persisted.live_entry(&vpc().id).is_some());

        first.abandon().await.unwrap();
        assert!(store.is_locked().await.unwrap());
        second.abandon().await.unwrap();
        assert!(!store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupted_state_releases_lock() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("state.json"), "garbage").unwrap();
        let store = store(&dir);

        let err = StateSession::open(Arc::clone(&store), "demo", "dev", "apply")
            .await
            .unwrap_err();
        assert!(matches!(err, TerraceError::State(StateError::Corrupted { .. })));
        assert!(!store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_lookup_reads_working_document() {
        let dir = TempDir::new().unwrap();
        let session = StateSession::open(store(&dir), "demo", "dev", "apply")
            .await
            .unwrap();
        session.upsert(vpc()).await.unwrap();

        let reference = Reference {
            target: ResourceId::managed("aws_vpc", "main"),
            attribute: String::from("id"),
        };
        assert_eq!(session.lookup(&reference), Lookup::Known(json!("vpc-1")));
        session.abandon().await.unwrap();
    }
}
