//! State store trait definition.
//!
//! Backends keep an in-memory working copy of the snapshot. Node writes
//! change the working copy; [`StateStore::commit`] makes it durable. The
//! executor commits after every completed operation so a crash never loses
//! more than the operation in flight.

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::lock::LockInfo;
use super::types::{NodeRecord, RunSummary, STATE_VERSION, StateSnapshot};
use crate::error::{Result, SkyforgeError, StateError};

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the persisted snapshot into the working copy and returns it.
    ///
    /// Returns an empty snapshot if no state exists yet.
    async fn load(&self) -> Result<StateSnapshot>;

    /// Records a node in the working copy.
    async fn save_node(&self, id: &str, record: &NodeRecord) -> Result<()>;

    /// Removes a node from the working copy.
    async fn remove_node(&self, id: &str) -> Result<()>;

    /// Records the stack-level facts of a finished run in the working copy.
    async fn record_run(&self, summary: RunSummary) -> Result<()>;

    /// Persists the working copy atomically.
    async fn commit(&self) -> Result<()>;

    /// Deletes the persisted state and any lock.
    async fn delete(&self) -> Result<()>;

    /// Checks if persisted state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the run lock.
    ///
    /// Fails with [`SkyforgeError::RunInProgress`] if another run holds an
    /// unexpired lock.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Pushes back the expiry of the lock `lock_id`.
    ///
    /// Fails if the lock was released or taken over.
    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo>;

    /// Releases the run lock if `lock_id` still owns it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Removes the lock regardless of owner.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if an unexpired lock is held.
    async fn is_locked(&self) -> Result<bool>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self) -> Result<StateSnapshot> {
        (**self).load().await
    }

    async fn save_node(&self, id: &str, record: &NodeRecord) -> Result<()> {
        (**self).save_node(id, record).await
    }

    async fn remove_node(&self, id: &str) -> Result<()> {
        (**self).remove_node(id).await
    }

    async fn record_run(&self, summary: RunSummary) -> Result<()> {
        (**self).record_run(summary).await
    }

    async fn commit(&self) -> Result<()> {
        (**self).commit().await
    }

    async fn delete(&self) -> Result<()> {
        (**self).delete().await
    }

    async fn exists(&self) -> Result<bool> {
        (**self).exists().await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder).await
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
}

/// The working copy shared by the backends.
#[derive(Debug, Default)]
pub(crate) struct WorkingCopy {
    inner: Mutex<Option<StateSnapshot>>,
}

impl WorkingCopy {
    /// Replaces the working copy with a freshly loaded snapshot.
    pub(crate) async fn reset(&self, snapshot: StateSnapshot) {
        *self.inner.lock().await = Some(snapshot);
    }

    /// Applies `f` to the working copy.
    pub(crate) async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut StateSnapshot) + Send,
    {
        let mut guard = self.inner.lock().await;
        let snapshot = guard.as_mut().ok_or_else(not_loaded)?;
        f(snapshot);
        Ok(())
    }

    /// Returns a copy of the working snapshot.
    pub(crate) async fn current(&self) -> Result<StateSnapshot> {
        self.inner.lock().await.clone().ok_or_else(not_loaded)
    }

    /// Drops the working copy.
    pub(crate) async fn clear(&self) {
        *self.inner.lock().await = None;
    }
}

fn not_loaded() -> SkyforgeError {
    SkyforgeError::State(StateError::write(
        "state must be loaded before it is modified",
    ))
}

/// Parses persisted state, rejecting formats this version cannot read.
pub(crate) fn decode_snapshot(content: &str) -> Result<StateSnapshot> {
    let snapshot: StateSnapshot = serde_json::from_str(content).map_err(|e| {
        SkyforgeError::State(StateError::Corrupted {
            message: format!("Failed to parse state: {e}"),
        })
    })?;

    if snapshot.version != STATE_VERSION {
        return Err(SkyforgeError::State(StateError::VersionMismatch {
            expected: STATE_VERSION.to_string(),
            found: snapshot.version,
        }));
    }
    Ok(snapshot)
}

/// Serializes state for persistence.
pub(crate) fn encode_snapshot(snapshot: &StateSnapshot) -> Result<String> {
    serde_json::to_string_pretty(snapshot).map_err(|e| {
        SkyforgeError::State(StateError::serialization(format!(
            "Failed to serialize state: {e}"
        )))
    })
}

/// Parses a persisted lock.
pub(crate) fn decode_lock(content: &str) -> Result<LockInfo> {
    serde_json::from_str(content).map_err(|e| {
        SkyforgeError::State(StateError::Corrupted {
            message: format!("Failed to parse lock: {e}"),
        })
    })
}

/// Serializes a lock for persistence.
pub(crate) fn encode_lock(lock: &LockInfo) -> Result<String> {
    serde_json::to_string_pretty(lock).map_err(|e| {
        SkyforgeError::State(StateError::serialization(format!(
            "Failed to serialize lock: {e}"
        )))
    })
}
