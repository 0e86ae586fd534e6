//! Kafka Cluster Operator
//!
//! A Kubernetes operator that reconciles declarative Kafka and Kafka
//! Connect cluster definitions, held as labeled ConfigMaps, against the
//! workload resources that implement them.
//!
//! ## Cluster definitions
//!
//! A cluster is declared by a ConfigMap carrying the selector label set
//! (default `kind=cluster`) and a type label choosing `kafka`,
//! `kafka-connect`, or `kafka-connect-s2i`:
//!
//! ```yaml
//! apiVersion: v1
//! kind: ConfigMap
//! metadata:
//!   name: my-cluster
//!   labels:
//!     kind: cluster
//!     kafka-cluster-operator.io/type: kafka
//! data:
//!   kafka-nodes: "3"
//!   kafka-storage: '{"type":"ephemeral"}'
//!   zookeeper-storage: '{"type":"ephemeral"}'
//! ```
//!
//! The engine watches these ConfigMaps and runs a periodic full sweep;
//! every cluster-level operation is serialized under a per-cluster lock.

pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod labels;
pub mod leader_election;
pub mod lock;
pub mod operations;
pub mod resources;

pub use cluster::{
    ClusterDiff, ClusterKey, ClusterOperation, ClusterSpec, ClusterType, ConnectCluster,
    KafkaCluster, OperationType, StorageSpec,
};
pub use config::OperatorConfig;
pub use engine::ReconciliationEngine;
pub use error::{OperatorError, Result};
pub use health::HealthState;
pub use lock::{Lease, LockManager};
pub use operations::{CompositeOperation, Executor};
pub use resources::ResourceAdapter;
