//! S3-based state storage backend.
//!
//! Remote state for teams and CI. A commit is a single `PutObject` of the
//! whole snapshot, which S3 applies atomically. The lock is created with a
//! conditional put (`If-None-Match: *`) so two runs cannot both create it.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::ProvideErrorMetadata;
use tracing::{debug, info, warn};

use crate::error::{Result, SkyforgeError, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, lost_race, renew_held};
use super::store::{
    StateStore, WorkingCopy, decode_lock, decode_snapshot, encode_lock, encode_snapshot,
};
use super::types::{NodeRecord, RunSummary, StateSnapshot};

/// State file key suffix.
const STATE_KEY: &str = "state.json";

/// Lock file key suffix.
const LOCK_KEY: &str = "state.lock";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix.
    prefix: String,
    working: WorkingCopy,
}

impl S3StateStore {
    /// Creates a new S3 state store from the ambient AWS configuration.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Self {
        let config = if let Some(region) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Self::with_client(Client::new(&config), bucket, prefix)
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
            working: WorkingCopy::default(),
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
                    SkyforgeError::State(StateError::s3(format!("Failed to read S3 object: {e}")))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    SkyforgeError::State(StateError::Corrupted {
                        message: format!("Invalid UTF-8 in S3 object: {e}"),
                    })
                })?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(SkyforgeError::State(StateError::s3(format!(
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
            .map_err(|e| SkyforgeError::State(StateError::s3(format!("S3 put error: {e}"))))?;

        Ok(())
    }

    /// Puts an object only if the key is absent. Returns false if it exists.
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
                    _ => Err(SkyforgeError::State(StateError::LockFailed {
                        message: format!("S3 conditional put error: {service_err}"),
                    })),
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
            .map_err(|e| SkyforgeError::State(StateError::s3(format!("S3 delete error: {e}"))))?;

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
                    Err(SkyforgeError::State(StateError::s3(format!(
                        "S3 head error: {service_err}"
                    ))))
                }
            }
        }
    }

    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        match self.get_object(&self.key(LOCK_KEY)).await? {
            Some(content) => decode_lock(&content).map(Some),
            None => Ok(None),
        }
    }
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<StateSnapshot> {
        let key = self.key(STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        let snapshot = match self.get_object(&key).await? {
            Some(json) => {
                let snapshot = decode_snapshot(&json)?;
                info!(
                    "Loaded state for {}/{} ({} resources)",
                    snapshot.project,
                    snapshot.environment,
                    snapshot.resources.len()
                );
                snapshot
            }
            None => {
                debug!("No state found in S3");
                StateSnapshot::default()
            }
        };

        self.working.reset(snapshot.clone()).await;
        Ok(snapshot)
    }

    async fn save_node(&self, id: &str, record: &NodeRecord) -> Result<()> {
        let record = record.clone();
        self.working.update(|s| s.upsert(id, record)).await
    }

    async fn remove_node(&self, id: &str) -> Result<()> {
        self.working
            .update(|s| {
                s.remove(id);
            })
            .await
    }

    async fn record_run(&self, summary: RunSummary) -> Result<()> {
        self.working.update(|s| s.apply_summary(summary)).await
    }

    async fn commit(&self) -> Result<()> {
        let snapshot = self.working.current().await?;
        let key = self.key(STATE_KEY);
        let content = encode_snapshot(&snapshot)?;
        self.put_object(&key, &content).await.map_err(|e| {
            SkyforgeError::State(StateError::write(format!("s3://{}/{key}: {e}", self.bucket)))
        })?;
        debug!("Committed {} records to S3", snapshot.resources.len());
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let state_key = self.key(STATE_KEY);
        info!("Deleting state from s3://{}/{state_key}", self.bucket);

        self.delete_object(&state_key).await?;
        self.delete_object(&self.key(LOCK_KEY)).await?;
        self.working.clear().await;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        self.object_exists(&self.key(STATE_KEY)).await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let key = self.key(LOCK_KEY);
        let lock_info = LockInfo::new(holder);
        let content = encode_lock(&lock_info)?;

        if !self.put_object_if_absent(&key, &content).await? {
            match self.read_lock().await? {
                Some(existing) if !existing.is_expired() => return Err(existing.conflict()),
                Some(existing) => warn!(
                    "Taking over expired lock held by {} since {}",
                    existing.holder, existing.acquired_at
                ),
                None => debug!("Lock disappeared while acquiring, retrying"),
            }
            self.delete_object(&key).await?;
            if !self.put_object_if_absent(&key, &content).await? {
                return Err(lost_race(self.read_lock().await?));
            }
        }

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );
        Ok(lock_info)
    }

    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let renewed = renew_held(self.read_lock().await?, lock_id)?;
        self.put_object(&self.key(LOCK_KEY), &encode_lock(&renewed)?)
            .await?;
        debug!("Renewed state lock {lock_id} until {}", renewed.expires_at);
        Ok(renewed)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock().await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.key(LOCK_KEY)).await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        warn!("Force-removing state lock in s3://{}", self.bucket);
        self.delete_object(&self.key(LOCK_KEY)).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock().await
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self.read_lock().await?.is_some_and(|lock| !lock.is_expired()))
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("stacks/prod/")), "stacks/prod/");
        assert_eq!(normalize_prefix(Some("/stacks")), "stacks/");
    }
}
