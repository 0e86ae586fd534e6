//! Composite cluster operations and their serialized executor.
//!
//! A composite is an ordered bundle of per-resource reconciliations forming
//! one logical cluster-level create, update, or delete. The executor first
//! obtains the desired cluster state ([`CompositeOperation::get_cluster`]),
//! then applies the resource operations ([`CompositeOperation::composite`]),
//! holding the per-cluster lock for the whole exchange so only one
//! operation per cluster proceeds at once.

mod connect;
mod kafka;

pub use connect::ConnectComposite;
pub use kafka::KafkaComposite;

use crate::cluster::{ClusterKey, ClusterOperation, ClusterType, OperationType};
use crate::error::Result;
use crate::lock::LockManager;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{error, info};

/// One cluster-level operation for a given `(clusterType, operationType)`.
#[async_trait]
pub trait CompositeOperation: Send + Sync {
    fn cluster_type(&self) -> ClusterType;

    fn operation_type(&self) -> OperationType;

    /// Build the desired cluster state (and, for updates, the diff against
    /// the recovered current state).
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<ClusterOperation>;

    /// Apply the ordered resource reconciliations. Fails with the first
    /// failed step and performs no compensation; the next sweep retries.
    async fn composite(&self, namespace: &str, operation: &ClusterOperation) -> Result<()>;
}

/// Runs composites under per-cluster mutual exclusion.
#[derive(Clone)]
pub struct Executor {
    locks: LockManager,
    lock_timeout: Duration,
}

impl Executor {
    pub fn new(locks: LockManager, lock_timeout: Duration) -> Self {
        Self { locks, lock_timeout }
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Execute the resource operations necessary to make a cluster conform
    /// to its desired state.
    ///
    /// The lease is held from before `get_cluster` until the composite
    /// completes and is released on every exit path.
    pub async fn execute<O>(&self, namespace: &str, name: &str, composite: &O) -> Result<()>
    where
        O: CompositeOperation + ?Sized,
    {
        let key = ClusterKey::new(composite.cluster_type(), namespace, name);
        let op = composite.operation_type();

        let _lease = match self.locks.acquire(&key.lock_name(), self.lock_timeout).await {
            Ok(lease) => lease,
            Err(e) => {
                error!("failed to acquire lock to {} {}", op, key);
                return Err(e);
            }
        };

        let operation = match composite.get_cluster(namespace, name).await {
            Ok(operation) => operation,
            Err(e) => {
                error!("error getting required state to {} {}: {}", op, key, e);
                return Err(e);
            }
        };

        info!("{} {}", op, key);
        match composite.composite(namespace, &operation).await {
            Ok(()) => {
                info!("{}: successful {}", key, op);
                Ok(())
            }
            Err(e) => {
                error!("{}: failed to {}: {}", key, op, e);
                Err(e)
            }
        }
    }
}
