//! Per-user advisory rotation lock.
//!
//! At most one rotation per user runs at a time. A second request for the
//! same user is rejected rather than queued. The lock is released when the
//! guard drops, on every exit path including panics and early returns.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::UekvaultError;
use crate::model::UserId;

/// Set of users with a rotation in flight.
///
/// Thread-safe via `Arc<Mutex<_>>`. Clone shares the same set, so every
/// engine handle built from one `RotationLocks` serializes against the
/// others.
#[derive(Clone, Default)]
pub struct RotationLocks {
    held: Arc<Mutex<HashSet<UserId>>>,
}

impl RotationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `user_id`, or fail with
    /// [`UekvaultError::RotationInProgress`] if it is held.
    pub fn try_acquire(&self, user_id: &str) -> Result<RotationGuard, UekvaultError> {
        if !self.set().insert(user_id.to_string()) {
            return Err(UekvaultError::RotationInProgress(user_id.to_string()));
        }
        Ok(RotationGuard {
            locks: self.clone(),
            user_id: user_id.to_string(),
        })
    }

    /// Whether a rotation for `user_id` currently holds the lock.
    pub fn is_held(&self, user_id: &str) -> bool {
        self.set().contains(user_id)
    }

    // A set insert/remove cannot leave the set half-updated, so a
    // poisoned lock is still consistent.
    fn set(&self) -> MutexGuard<'_, HashSet<UserId>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the user's rotation lock on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct RotationGuard {
    locks: RotationLocks,
    user_id: UserId,
}

impl Drop for RotationGuard {
    fn drop(&mut self) {
        self.locks.set().remove(&self.user_id);
    }
}
