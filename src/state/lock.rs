//! Run locking.
//!
//! One run may write a stack's state at a time. A lock that outlives
//! [`LOCK_EXPIRY_SECS`] is treated as abandoned and may be taken over, so a
//! running apply renews its lock every [`LOCK_RENEW_SECS`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SkyforgeError, StateError};

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 3600;

/// Interval at which a run renews the lock it holds.
pub const LOCK_RENEW_SECS: u64 = 600;

/// Information about a held lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a new lock for `holder`, or for this process if empty.
    #[must_use]
    pub fn new(holder: &str) -> Self {
        let holder = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder,
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }

    /// Returns this lock with a fresh expiry.
    #[must_use]
    pub fn renewed(&self) -> Self {
        Self {
            expires_at: Utc::now() + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
            ..self.clone()
        }
    }

    /// The error reported to a run that finds this lock held.
    #[must_use]
    pub fn conflict(&self) -> SkyforgeError {
        SkyforgeError::RunInProgress {
            holder: self.holder.clone(),
            since: self.acquired_at.to_rfc3339(),
        }
    }
}

/// Renews `current` if it is the lock `lock_id`.
///
/// # Errors
///
/// Returns a lock error if the lock was released or taken over.
pub(crate) fn renew_held(current: Option<LockInfo>, lock_id: &str) -> Result<LockInfo> {
    match current {
        Some(lock) if lock.lock_id == lock_id => Ok(lock.renewed()),
        Some(lock) => Err(SkyforgeError::State(StateError::LockFailed {
            message: format!("lock {lock_id} was taken over by {}", lock.holder),
        })),
        None => Err(SkyforgeError::State(StateError::LockFailed {
            message: format!("lock {lock_id} is no longer held"),
        })),
    }
}

/// The error for an expired-lock takeover that another run won first.
pub(crate) fn lost_race(winner: Option<LockInfo>) -> SkyforgeError {
    winner.map_or_else(
        || SkyforgeError::RunInProgress {
            holder: String::from("unknown"),
            since: Utc::now().to_rfc3339(),
        },
        |lock| lock.conflict(),
    )
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = Uuid::new_v4().simple().to_string();

    format!("{hostname}-{pid}-{}", &uuid[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_creation() {
        let lock = LockInfo::new("test-holder");
        assert_eq!(lock.holder, "test-holder");
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > LOCK_EXPIRY_SECS - 60);
    }

    #[test]
    fn test_empty_holder_uses_process_id() {
        let lock = LockInfo::new("");
        assert!(lock.holder.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_expired_lock() {
        let mut lock = LockInfo::new("old");
        lock.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(lock.is_expired());
        assert_eq!(lock.remaining_secs(), 0);
    }

    #[test]
    fn test_conflict_error() {
        let lock = LockInfo::new("ci-runner");
        match lock.conflict() {
            SkyforgeError::RunInProgress { holder, .. } => assert_eq!(holder, "ci-runner"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_renew_held_extends_expiry() {
        let mut lock = LockInfo::new("runner");
        lock.expires_at = Utc::now() + chrono::Duration::seconds(5);

        let renewed = renew_held(Some(lock.clone()), &lock.lock_id).expect("renew");
        assert_eq!(renewed.lock_id, lock.lock_id);
        assert_eq!(renewed.acquired_at, lock.acquired_at);
        assert!(renewed.remaining_secs() > LOCK_EXPIRY_SECS - 60);
    }

    #[test]
    fn test_renew_fails_once_lock_is_gone() {
        let lock = LockInfo::new("runner");
        let other = LockInfo::new("intruder");
        assert!(renew_held(Some(other), &lock.lock_id).is_err());
        assert!(renew_held(None, &lock.lock_id).is_err());
    }

    #[test]
    fn test_lost_takeover_race_is_run_in_progress() {
        match lost_race(Some(LockInfo::new("winner"))) {
            SkyforgeError::RunInProgress { holder, .. } => assert_eq!(holder, "winner"),
            other => panic!("expected RunInProgress, got {other:?}"),
        }
        assert!(matches!(lost_race(None), SkyforgeError::RunInProgress { .. }));
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();
        assert_ne!(id1, id2);
    }
}
