//! Typed in-memory model of desired clusters and the desired-vs-actual diff.
//!
//! A cluster definition is decoded from a labeled ConfigMap, discriminated
//! by the type label into a Kafka, Kafka Connect, or Kafka Connect S2I
//! variant. The same model is recovered from the representative workload
//! resource so updates can diff against the last-applied state.

mod connect;
mod kafka;
mod storage;

pub use connect::ConnectCluster;
pub use kafka::KafkaCluster;
pub use storage::{ClaimSelector, StorageSpec};

use crate::error::{OperatorError, Result};
use std::collections::BTreeMap;
use std::fmt;

/// The kinds of cluster the operator manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterType {
    Kafka,
    KafkaConnect,
    KafkaConnectS2i,
}

impl ClusterType {
    pub const ALL: [ClusterType; 3] = [
        ClusterType::Kafka,
        ClusterType::KafkaConnect,
        ClusterType::KafkaConnectS2i,
    ];

    /// The value used in the type label and lock names.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterType::Kafka => "kafka",
            ClusterType::KafkaConnect => "kafka-connect",
            ClusterType::KafkaConnectS2i => "kafka-connect-s2i",
        }
    }

    pub fn from_label(value: &str) -> Option<ClusterType> {
        match value {
            "kafka" => Some(ClusterType::Kafka),
            "kafka-connect" => Some(ClusterType::KafkaConnect),
            "kafka-connect-s2i" => Some(ClusterType::KafkaConnectS2i),
            _ => None,
        }
    }
}

impl fmt::Display for ClusterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primary identity of a cluster, also its lock key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClusterKey {
    pub cluster_type: ClusterType,
    pub namespace: String,
    pub name: String,
}

impl ClusterKey {
    pub fn new(cluster_type: ClusterType, namespace: &str, name: &str) -> Self {
        Self {
            cluster_type,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// The advisory lock name serializing operations on this cluster.
    pub fn lock_name(&self) -> String {
        format!("lock::{}::{}::{}", self.cluster_type, self.namespace, self.name)
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} cluster {}/{}", self.cluster_type, self.namespace, self.name)
    }
}

/// The kind of cluster-level operation being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which facets of a cluster changed between the last-applied state and the
/// desired state. Composite updates use this to pick the minimal sequence of
/// resource reconciliations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterDiff {
    pub scale_up: bool,
    pub scale_down: bool,
    pub rolling_update: bool,
    pub metrics_changed: bool,
    /// Any change at all, including ones not covered by the other flags
    pub different: bool,
}

impl ClusterDiff {
    pub const UNCHANGED: ClusterDiff = ClusterDiff {
        scale_up: false,
        scale_down: false,
        rolling_update: false,
        metrics_changed: false,
        different: false,
    };

    /// Whether the workload resource itself needs a patch.
    pub fn needs_workload_patch(&self) -> bool {
        self.scale_up || self.scale_down || self.rolling_update
    }
}

/// Desired state of one cluster, tagged by cluster type.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterSpec {
    Kafka(KafkaCluster),
    Connect(ConnectCluster),
    ConnectS2i(ConnectCluster),
}

impl ClusterSpec {
    pub fn cluster_type(&self) -> ClusterType {
        match self {
            ClusterSpec::Kafka(_) => ClusterType::Kafka,
            ClusterSpec::Connect(_) => ClusterType::KafkaConnect,
            ClusterSpec::ConnectS2i(_) => ClusterType::KafkaConnectS2i,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ClusterSpec::Kafka(c) => &c.name,
            ClusterSpec::Connect(c) | ClusterSpec::ConnectS2i(c) => &c.name,
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            ClusterSpec::Kafka(c) => &c.namespace,
            ClusterSpec::Connect(c) | ClusterSpec::ConnectS2i(c) => &c.namespace,
        }
    }

    pub fn key(&self) -> ClusterKey {
        ClusterKey::new(self.cluster_type(), self.namespace(), self.name())
    }
}

/// The desired state of a cluster together with how it differs from the
/// current state. `diff` is populated for updates; `current` carries the
/// recovered pre-change snapshot when one exists.
#[derive(Debug, Clone)]
pub struct ClusterOperation {
    pub cluster: ClusterSpec,
    pub current: Option<ClusterSpec>,
    pub diff: Option<ClusterDiff>,
}

impl ClusterOperation {
    pub fn new(cluster: ClusterSpec) -> Self {
        Self {
            cluster,
            current: None,
            diff: None,
        }
    }

    pub fn with_diff(cluster: ClusterSpec, current: ClusterSpec, diff: ClusterDiff) -> Self {
        Self {
            cluster,
            current: Some(current),
            diff: Some(diff),
        }
    }
}

// ConfigMap `data` field accessors shared by the cluster variants. Missing
// keys fall back to defaults; malformed values are decode errors.

pub(crate) fn data_string(data: &BTreeMap<String, String>, key: &str, default: &str) -> String {
    data.get(key)
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| default.to_string())
}

pub(crate) fn data_int(data: &BTreeMap<String, String>, key: &str, default: i32) -> Result<i32> {
    match data.get(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| {
            OperatorError::Decode(format!("field `{}` is not an integer: `{}`", key, value))
        }),
    }
}

pub(crate) fn data_bool(data: &BTreeMap<String, String>, key: &str, default: bool) -> Result<bool> {
    match data.get(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| {
            OperatorError::Decode(format!("field `{}` is not a boolean: `{}`", key, value))
        }),
    }
}

pub(crate) fn data_required<'a>(data: &'a BTreeMap<String, String>, key: &str) -> Result<&'a str> {
    data.get(key)
        .map(String::as_str)
        .ok_or_else(|| OperatorError::Decode(format!("missing required field `{}`", key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_name_format() {
        let key = ClusterKey::new(ClusterType::Kafka, "my-namespace", "my-cluster");
        assert_eq!(key.lock_name(), "lock::kafka::my-namespace::my-cluster");

        let key = ClusterKey::new(ClusterType::KafkaConnectS2i, "ns", "c");
        assert_eq!(key.lock_name(), "lock::kafka-connect-s2i::ns::c");
    }

    #[test]
    fn test_cluster_type_label_round_trip() {
        for cluster_type in ClusterType::ALL {
            assert_eq!(ClusterType::from_label(cluster_type.as_str()), Some(cluster_type));
        }
        assert_eq!(ClusterType::from_label("zookeeper"), None);
    }

    #[test]
    fn test_diff_unchanged() {
        assert!(!ClusterDiff::UNCHANGED.different);
        assert!(!ClusterDiff::UNCHANGED.needs_workload_patch());

        let scale = ClusterDiff {
            scale_up: true,
            different: true,
            ..ClusterDiff::UNCHANGED
        };
        assert!(scale.needs_workload_patch());

        let metrics_only = ClusterDiff {
            metrics_changed: true,
            different: true,
            ..ClusterDiff::UNCHANGED
        };
        assert!(!metrics_only.needs_workload_patch());
    }

    #[test]
    fn test_data_accessors() {
        let mut data = BTreeMap::new();
        data.insert("kafka-nodes".to_string(), " 5 ".to_string());
        data.insert("kafka-image".to_string(), "kafka:1".to_string());
        data.insert("bad-int".to_string(), "three".to_string());

        assert_eq!(data_int(&data, "kafka-nodes", 3).unwrap(), 5);
        assert_eq!(data_int(&data, "zookeeper-nodes", 3).unwrap(), 3);
        assert!(data_int(&data, "bad-int", 0).is_err());
        assert_eq!(data_string(&data, "kafka-image", "default"), "kafka:1");
        assert_eq!(data_string(&data, "missing", "default"), "default");
        assert!(data_required(&data, "kafka-storage").is_err());
    }
}
