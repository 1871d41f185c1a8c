//! Per-user advisory locks.
//!
//! SQLite gives each mutation a serializable transaction, but the
//! check-then-insert in initiate spans two records (caller and callee),
//! so two concurrent initiates against the same callee could both pass the
//! active-call check. Holding both parties' locks across the guard and the
//! insert closes that race.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use peal_common::UserId;

#[derive(Default)]
pub struct UserLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Holds both parties' locks for the duration of an initiate.
pub struct PairGuard {
    _first: OwnedMutexGuard<()>,
    _second: OwnedMutexGuard<()>,
}

impl UserLocks {
    fn handle(&self, user: &UserId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("user lock table poisoned");
        locks
            .entry(user.as_str().to_string())
            .or_default()
            .clone()
    }

    /// Lock two distinct users, always in sorted order so concurrent
    /// initiates over overlapping pairs cannot deadlock.
    pub async fn lock_pair(&self, a: &UserId, b: &UserId) -> PairGuard {
        debug_assert_ne!(a, b, "lock_pair requires distinct users");
        let (first, second) = if a.as_str() <= b.as_str() {
            (a, b)
        } else {
            (b, a)
        };
        let first = self.handle(first).lock_owned().await;
        let second = self.handle(second).lock_owned().await;
        PairGuard {
            _first: first,
            _second: second,
        }
    }
}
