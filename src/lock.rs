//! Per-cluster serializer.
//!
//! Cluster-level work involves several Kubernetes round-trips whose
//! interleaving would corrupt a StatefulSet roll, so every mutating
//! operation runs under a named advisory lock keyed by
//! `(clusterType, namespace, name)`. At most one holder exists per key at
//! any moment; acquisition fails with [`OperatorError::LockTimeout`] after
//! the configured timeout. Distinct keys are fully independent.

use crate::error::{OperatorError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Keyed mutual-exclusion facility for cluster operations.
///
/// Clones share the same lock table, so one manager instance serializes the
/// event path and the sweep path alike.
#[derive(Clone, Default)]
pub struct LockManager {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

/// A held per-cluster lock. Dropping the lease releases the lock, so release
/// happens on every exit path; [`Lease::release`] makes the release explicit.
#[derive(Debug)]
pub struct Lease {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl Lease {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the lock. Equivalent to dropping the lease.
    pub fn release(self) {}
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the named lock, waiting at most `timeout`.
    pub async fn acquire(&self, name: &str, timeout: Duration) -> Result<Lease> {
        let mutex = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => {
                trace!(lock = name, "acquired");
                Ok(Lease {
                    name: name.to_string(),
                    _guard: guard,
                })
            }
            Err(_) => Err(OperatorError::LockTimeout(name.to_string())),
        }
    }

    /// Drop table entries nobody is holding or waiting on, keeping the table
    /// bounded by the live cluster count.
    pub async fn prune(&self) {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SHORT: Duration = Duration::from_millis(50);
    const LONG: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_mutual_exclusion_per_key() {
        let manager = LockManager::new();
        let holders = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let holders = Arc::clone(&holders);
            let overlapped = Arc::clone(&overlapped);
            handles.push(tokio::spawn(async move {
                let lease = manager.acquire("lock::kafka::ns::c1", LONG).await.unwrap();
                if holders.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlapped.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                holders.fetch_sub(1, Ordering::SeqCst);
                lease.release();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(overlapped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_are_independent() {
        let manager = LockManager::new();
        let first = manager.acquire("lock::kafka::ns::a", SHORT).await.unwrap();
        // A different key must be acquirable while the first is held.
        let second = manager.acquire("lock::kafka::ns::b", SHORT).await.unwrap();
        drop(first);
        drop(second);
    }

    #[tokio::test]
    async fn test_acquire_times_out_while_held() {
        let manager = LockManager::new();
        let held = manager.acquire("lock::kafka::ns::c", LONG).await.unwrap();

        let err = manager.acquire("lock::kafka::ns::c", SHORT).await.unwrap_err();
        match err {
            OperatorError::LockTimeout(name) => assert_eq!(name, "lock::kafka::ns::c"),
            other => panic!("expected lock timeout, got {other}"),
        }
        drop(held);
    }

    #[tokio::test]
    async fn test_release_on_drop_frees_the_key() {
        let manager = LockManager::new();
        {
            let _lease = manager.acquire("lock::kafka::ns::d", SHORT).await.unwrap();
        }
        // Reacquirable immediately after the guard went out of scope.
        manager.acquire("lock::kafka::ns::d", SHORT).await.unwrap();
    }

    #[tokio::test]
    async fn test_prune_drops_only_idle_entries() {
        let manager = LockManager::new();
        let held = manager.acquire("lock::kafka::ns::held", SHORT).await.unwrap();
        drop(manager.acquire("lock::kafka::ns::idle", SHORT).await.unwrap());
        assert_eq!(manager.len().await, 2);

        manager.prune().await;
        assert_eq!(manager.len().await, 1);
        drop(held);
    }
}
