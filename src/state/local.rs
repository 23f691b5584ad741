//! Local file-based state storage backend.
//!
//! State lives in `.skyforge/state.json` next to the stack document.
//! Commits write a temporary file, fsync it, then rename it over the old
//! state, so a crash leaves either the old or the new snapshot on disk.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{Result, SkyforgeError, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, lost_race, renew_held};
use super::store::{
    StateStore, WorkingCopy, decode_lock, decode_snapshot, encode_lock, encode_snapshot,
};
use super::types::{NodeRecord, RunSummary, StateSnapshot};

/// Default state directory name.
pub const STATE_DIR: &str = ".skyforge";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    working: WorkingCopy,
}

impl LocalStateStore {
    /// Creates a store under `.skyforge` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| {
                SkyforgeError::internal(format!("Cannot determine current directory: {e}"))
            })?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
            working: WorkingCopy::default(),
        }
    }

    /// Path of the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                SkyforgeError::State(StateError::write(format!(
                    "Failed to create state directory: {e}"
                )))
            })?;
        }
        Ok(())
    }

    async fn read_snapshot(&self) -> Result<Option<StateSnapshot>> {
        let content = match fs::read_to_string(&self.state_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("State file does not exist: {}", self.state_path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(SkyforgeError::State(StateError::Corrupted {
                    message: format!("Failed to read state file: {e}"),
                }));
            }
        };
        decode_snapshot(&content).map(Some)
    }

    async fn write_snapshot(&self, snapshot: &StateSnapshot) -> Result<()> {
        self.ensure_dir().await?;
        let content = encode_snapshot(snapshot)?;

        let temp_path = self.state_path.with_extension("tmp");
        let write_err =
            |e: std::io::Error| SkyforgeError::State(StateError::write(format!("{e}")));

        let mut file = fs::File::create(&temp_path).await.map_err(write_err)?;
        file.write_all(content.as_bytes()).await.map_err(write_err)?;
        file.sync_all().await.map_err(write_err)?;
        drop(file);

        fs::rename(&temp_path, &self.state_path)
            .await
            .map_err(write_err)?;

        debug!(
            "Committed {} records to {}",
            snapshot.resources.len(),
            self.state_path.display()
        );
        Ok(())
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        match fs::read_to_string(&self.lock_path).await {
            Ok(content) => decode_lock(&content).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SkyforgeError::State(StateError::Corrupted {
                message: format!("Failed to read lock file: {e}"),
            })),
        }
    }

    /// Creates the lock file; fails if it already exists.
    async fn create_lock_file(&self, lock_info: &LockInfo) -> Result<bool> {
        self.ensure_dir().await?;
        let content = encode_lock(lock_info)?;

        let lock_err = |e: std::io::Error| {
            SkyforgeError::State(StateError::LockFailed {
                message: format!("Failed to write lock file: {e}"),
            })
        };

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(lock_err(e)),
        };

        file.write_all(content.as_bytes()).await.map_err(lock_err)?;
        file.sync_all().await.map_err(lock_err)?;
        Ok(true)
    }

    /// Overwrites the lock file through a temporary file.
    async fn replace_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        let content = encode_lock(lock_info)?;
        let temp_path = self.lock_path.with_extension("tmp");
        let lock_err = |e: std::io::Error| {
            SkyforgeError::State(StateError::LockFailed {
                message: format!("Failed to renew lock file: {e}"),
            })
        };

        fs::write(&temp_path, content.as_bytes())
            .await
            .map_err(lock_err)?;
        fs::rename(&temp_path, &self.lock_path)
            .await
            .map_err(lock_err)
    }

    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SkyforgeError::State(StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })),
        }
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<StateSnapshot> {
        info!("Loading state from: {}", self.state_path.display());
        let snapshot = self.read_snapshot().await?.unwrap_or_default();
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
        self.write_snapshot(&snapshot).await
    }

    async fn delete(&self) -> Result<()> {
        if self.state_path.exists() {
            info!("Deleting state file: {}", self.state_path.display());
            fs::remove_file(&self.state_path).await.map_err(|e| {
                SkyforgeError::State(StateError::write(format!(
                    "Failed to delete state file: {e}"
                )))
            })?;
        }
        self.working.clear().await;
        self.delete_lock_file().await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let lock_info = LockInfo::new(holder);

        if !self.create_lock_file(&lock_info).await? {
            match self.read_lock_file().await? {
                Some(existing) if !existing.is_expired() => return Err(existing.conflict()),
                Some(existing) => {
                    warn!(
                        "Taking over expired lock held by {} since {}",
                        existing.holder, existing.acquired_at
                    );
                }
                None => debug!("Lock disappeared while acquiring, retrying"),
            }
            self.delete_lock_file().await?;
            if !self.create_lock_file(&lock_info).await? {
                return Err(lost_race(self.read_lock_file().await?));
            }
        }

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );
        Ok(lock_info)
    }

    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let renewed = renew_held(self.read_lock_file().await?, lock_id)?;
        self.replace_lock_file(&renewed).await?;
        debug!("Renewed state lock {lock_id} until {}", renewed.expires_at);
        Ok(renewed)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
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
        warn!("Force-removing state lock at {}", self.lock_path.display());
        self.delete_lock_file().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .read_lock_file()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{RunHistoryEntry, RunOperation};
    use serde_json::json;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path().join(STATE_DIR));
        (store, temp_dir)
    }

    fn bucket_record() -> NodeRecord {
        let mut props = crate::graph::Properties::new();
        props.insert("bucket_name".into(), json!("uploads"));
        NodeRecord::new("S3Bucket", props, "bkt-1", crate::graph::Outputs::new())
    }

    #[tokio::test]
    async fn test_load_nonexistent_is_empty() {
        let (store, _temp) = create_test_store();
        let snapshot = store.load().await.expect("Load should not fail");
        assert!(snapshot.is_empty());
        assert!(!store.exists().await.expect("exists check failed"));
    }

    #[tokio::test]
    async fn test_save_commit_and_reload() {
        let (store, temp) = create_test_store();
        store.load().await.expect("load");
        store
            .save_node("bucket", &bucket_record())
            .await
            .expect("save node");
        store.commit().await.expect("commit");

        let reopened = LocalStateStore::with_base_dir(temp.path().join(STATE_DIR));
        let snapshot = reopened.load().await.expect("reload");
        assert_eq!(
            snapshot.get("bucket").map(|r| &r.properties),
            Some(&bucket_record().properties)
        );
        assert_eq!(
            snapshot.get("bucket").map(|r| r.physical_id.as_str()),
            Some("bkt-1")
        );
        assert!(!store.state_path().with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_uncommitted_changes_are_not_persisted() {
        let (store, temp) = create_test_store();
        store.load().await.expect("load");
        store
            .save_node("bucket", &bucket_record())
            .await
            .expect("save node");

        let reopened = LocalStateStore::with_base_dir(temp.path().join(STATE_DIR));
        assert!(reopened.load().await.expect("reload").is_empty());
    }

    #[tokio::test]
    async fn test_save_before_load_fails() {
        let (store, _temp) = create_test_store();
        assert!(store.save_node("bucket", &bucket_record()).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_and_record_run() {
        let (store, _temp) = create_test_store();
        store.load().await.expect("load");
        store
            .save_node("bucket", &bucket_record())
            .await
            .expect("save node");
        store.remove_node("bucket").await.expect("remove node");
        store
            .record_run(RunSummary {
                project: "demo".into(),
                environment: "dev".into(),
                desired_hash: Some("abc".into()),
                entry: RunHistoryEntry::new(Uuid::new_v4(), RunOperation::Apply, vec![]),
            })
            .await
            .expect("record run");
        store.commit().await.expect("commit");

        let snapshot = store.load().await.expect("reload");
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.project, "demo");
        assert_eq!(snapshot.desired_hash, "abc");
        assert_eq!(snapshot.history.len(), 1);
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("test-holder")
            .await
            .expect("Failed to acquire lock");
        assert!(store.is_locked().await.expect("is_locked failed"));

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");
        assert!(!store.is_locked().await.expect("is_locked failed"));
    }

    #[tokio::test]
    async fn test_lock_conflict_reports_run_in_progress() {
        let (store, _temp) = create_test_store();

        let _lock = store
            .acquire_lock("holder-1")
            .await
            .expect("Failed to acquire first lock");

        match store.acquire_lock("holder-2").await {
            Err(SkyforgeError::RunInProgress { holder, .. }) => assert_eq!(holder, "holder-1"),
            other => panic!("expected RunInProgress, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let (store, _temp) = create_test_store();
        store.ensure_dir().await.expect("state dir");

        let mut stale = LockInfo::new("crashed-run");
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(5);
        fs::write(&store.lock_path, encode_lock(&stale).expect("encode"))
            .await
            .expect("write stale lock");

        let lock = store.acquire_lock("fresh-run").await.expect("take over");
        assert_eq!(lock.holder, "fresh-run");
    }

    #[tokio::test]
    async fn test_renew_lock_extends_expiry() {
        let (store, _temp) = create_test_store();
        let mut lock = store.acquire_lock("long-run").await.expect("lock");
        lock.expires_at = chrono::Utc::now() + chrono::Duration::seconds(5);
        fs::write(&store.lock_path, encode_lock(&lock).expect("encode"))
            .await
            .expect("shorten lock");

        store.renew_lock(&lock.lock_id).await.expect("renew");
        let current = store
            .get_lock_info()
            .await
            .expect("lock info")
            .expect("still locked");
        assert_eq!(current.lock_id, lock.lock_id);
        assert!(current.remaining_secs() > LOCK_EXPIRY_SECS - 60);

        store.force_unlock().await.expect("force unlock");
        assert!(store.renew_lock(&lock.lock_id).await.is_err());
    }

    #[tokio::test]
    async fn test_force_unlock() {
        let (store, _temp) = create_test_store();
        store.acquire_lock("holder").await.expect("lock");
        store.force_unlock().await.expect("force unlock");
        assert!(store.get_lock_info().await.expect("lock info").is_none());
    }
}
