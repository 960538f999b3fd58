//! State management for provisioned resources.
//!
//! This module records what each run created: provider identifiers, attribute
//! snapshots, recorded dependencies and run history. Backends persist the
//! document locally or in S3; a run lock keeps runs from overlapping.

mod local;
mod lock;
mod s3;
mod session;
mod store;
mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::config::{StateBackend, StateConfig};
use crate::error::{ConfigError, Result, TerraceError};

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{generate_holder_id, LockInfo, RunLock, LOCK_EXPIRY_SECS};
pub use s3::S3StateStore;
pub use session::StateSession;
pub use store::StateStore;
pub use types::{
    DataEntry, EntryStatus, RunOperation, RunRecord, StateDocument, StateEntry, MAX_HISTORY,
    STATE_VERSION,
};

/// Directory of the local backend, relative paths taken from `root`.
#[must_use]
pub fn local_state_dir(config: &StateConfig, root: &Path) -> PathBuf {
    config
        .path
        .as_ref()
        .map_or_else(|| root.join(STATE_DIR), |path| root.join(path))
}

/// Opens the backend selected by the configuration.
///
/// # Errors
///
/// Returns a configuration error if the S3 backend has no bucket, or the
/// backend error if the S3 client cannot be created.
pub async fn open_store(config: &StateConfig, root: &Path) -> Result<Arc<dyn StateStore>> {
    match config.backend {
        StateBackend::Local => {
            let dir = local_state_dir(config, root);
            info!("Using local state in {}", dir.display());
            Ok(Arc::new(LocalStateStore::with_base_dir(dir)))
        }
        StateBackend::S3 => {
            let bucket = config.bucket.as_deref().ok_or_else(|| {
                TerraceError::Config(ConfigError::validation(
                    "s3 backend requires a bucket",
                    "state.bucket",
                ))
            })?;
            let store =
                S3StateStore::new(bucket, config.prefix.as_deref(), config.region.as_deref())
                    .await?;
            info!("Using S3 state at {}", store.location());
            Ok(Arc::new(store))
        }
    }
}
