//! S3-based state storage backend.
//!
//! Remote state for teams sharing one project. A single `PutObject` replaces
//! the whole document, so readers see either the old or the new serial. The
//! lock object is created with a conditional `PutObject` (`If-None-Match: *`),
//! so two runs cannot both create it.

use async_trait::async_trait;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::error::{Result, StateError, TerraceError};

use super::lock::{ensure_owner, locked_by, serialize_lock, LockInfo, LOCK_EXPIRY_SECS};
use super::store::StateStore;
use super::types::StateDocument;

/// State object key suffix.
const STATE_KEY: &str = "state.json";

/// Lock object key suffix.
const LOCK_KEY: &str = "state.lock";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, empty or ending in `/`.
    prefix: String,
}

impl S3StateStore {
    /// Creates a store using credentials from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response.body.collect().await.map_err(|e| {
                    TerraceError::State(StateError::s3(format!("Failed to read S3 object: {e}")))
                })?;

                String::from_utf8(bytes.to_vec()).map(Some).map_err(|e| {
                    TerraceError::State(StateError::corrupted(format!(
                        "Invalid UTF-8 in S3 object {key}: {e}"
                    )))
                })
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(TerraceError::State(StateError::s3(format!(
                        "S3 get error: {service_err}"
                    ))))
                }
            }
        }
    }

    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| TerraceError::State(StateError::s3(format!("S3 put error: {e}"))))?;
        Ok(())
    }

    /// Writes `content` only if `key` does not exist yet.
    ///
    /// Returns `false` when another writer created the object first.
    async fn put_object_if_absent(&self, key: &str, content: &str) -> Result<bool> {
        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .if_none_match("*")
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                match service_err.code() {
                    Some("PreconditionFailed" | "ConditionalRequestConflict") => Ok(false),
                    _ => Err(TerraceError::State(StateError::s3(format!(
                        "S3 conditional put error: {service_err}"
                    )))),
                }
            }
        }
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| TerraceError::State(StateError::s3(format!("S3 delete error: {e}"))))?;
        Ok(())
    }

    async fn object_exists(&self, key: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(TerraceError::State(StateError::s3(format!(
                        "S3 head error: {service_err}"
                    ))))
                }
            }
        }
    }

    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        let Some(content) = self.get_object(&self.key(LOCK_KEY)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&content).map(Some).map_err(|e| {
            TerraceError::State(StateError::corrupted(format!("Failed to parse lock: {e}")))
        })
    }
}

/// Trims slashes and appends a single trailing `/` to a non-empty prefix.
fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .map(|p| format!("{p}/"))
        .unwrap_or_default()
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<Option<StateDocument>> {
        let key = self.key(STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        match self.get_object(&key).await? {
            Some(json) => {
                let state = StateDocument::from_json(&json)?;
                info!(
                    "Loaded state serial {} for {}/{}",
                    state.serial, state.project, state.environment
                );
                Ok(Some(state))
            }
            None => {
                debug!("No state found in S3");
                Ok(None)
            }
        }
    }

    async fn save(&self, state: &StateDocument) -> Result<()> {
        let key = self.key(STATE_KEY);
        debug!("Saving state serial {} to s3://{}/{key}", state.serial, self.bucket);
        let content = state.to_json()?;
        self.put_object(&key, &content).await
    }

    async fn delete(&self) -> Result<()> {
        let state_key = self.key(STATE_KEY);
        info!("Deleting state from s3://{}/{state_key}", self.bucket);
        self.delete_object(&state_key).await?;
        self.delete_object(&self.key(LOCK_KEY)).await
    }

    async fn exists(&self) -> Result<bool> {
        self.object_exists(&self.key(STATE_KEY)).await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let lock_key = self.key(LOCK_KEY);
        let lock_info = LockInfo::new(holder, operation);
        let content = serialize_lock(&lock_info)?;

        if !self.put_object_if_absent(&lock_key, &content).await? {
            match self.read_lock().await? {
                Some(existing) if !existing.is_expired() => return Err(locked_by(existing)),
                Some(existing) => {
                    debug!("Expired lock held by {} found, taking over", existing.holder);
                    self.delete_object(&lock_key).await?;
                }
                None => {}
            }
            if !self.put_object_if_absent(&lock_key, &content).await? {
                return match self.read_lock().await? {
                    Some(winner) => Err(locked_by(winner)),
                    None => Err(TerraceError::State(StateError::LockFailed {
                        message: String::from("Lock object changed while acquiring it"),
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
        let renewed = ensure_owner(self.read_lock().await?, lock_id)?.renewed();
        self.put_object(&self.key(LOCK_KEY), &serialize_lock(&renewed)?).await?;
        debug!("Renewed state lock {lock_id} until {}", renewed.expires_at);
        Ok(renewed)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        match self.read_lock().await? {
            Some(existing) if existing.lock_id == lock_id => {
                self.delete_object(&self.key(LOCK_KEY)).await?;
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
        info!("Force-removing state lock in s3://{}", self.bucket);
        self.delete_object(&self.key(LOCK_KEY)).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock().await
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }

    fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key(STATE_KEY))
    }
}
