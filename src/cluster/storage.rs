//! Storage definitions for brokers and Zookeeper nodes.
//!
//! A storage definition arrives as a JSON document in the cluster ConfigMap
//! (`kafka-storage`, `zookeeper-storage`) and is immutable for the lifetime
//! of the cluster apart from the `delete-claim` flag.

use crate::error::{OperatorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a workload persists its data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StorageSpec {
    /// Pod-local scratch storage, lost on rescheduling
    Ephemeral,
    /// A persistent volume claim per replica
    PersistentClaim {
        /// Requested volume size, e.g. `"100Gi"`
        size: String,
        /// Storage class, cluster default when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        class: Option<String>,
        /// Volume selector
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<ClaimSelector>,
        /// Whether claims are deleted together with the cluster
        #[serde(default, rename = "delete-claim")]
        delete_claim: bool,
    },
}

/// Label selector restricting which volumes may satisfy a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl StorageSpec {
    /// Parse a storage definition from its ConfigMap JSON value.
    pub fn from_json(field: &str, raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| OperatorError::Decode(format!("field `{}`: {}", field, e)))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The `type` tag this definition serializes with.
    pub fn type_tag(&self) -> &'static str {
        match self {
            StorageSpec::Ephemeral => "ephemeral",
            StorageSpec::PersistentClaim { .. } => "persistent-claim",
        }
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self, StorageSpec::PersistentClaim { .. })
    }

    /// Whether claims should be removed when the cluster is deleted or
    /// scaled down. Always false for ephemeral storage.
    pub fn delete_claim(&self) -> bool {
        match self {
            StorageSpec::Ephemeral => false,
            StorageSpec::PersistentClaim { delete_claim, .. } => *delete_claim,
        }
    }

    /// Equality modulo the `delete-claim` flag, which is the only storage
    /// field an update may change.
    pub fn same_shape(&self, other: &StorageSpec) -> bool {
        match (self, other) {
            (StorageSpec::Ephemeral, StorageSpec::Ephemeral) => true,
            (
                StorageSpec::PersistentClaim {
                    size: a_size,
                    class: a_class,
                    selector: a_selector,
                    ..
                },
                StorageSpec::PersistentClaim {
                    size: b_size,
                    class: b_class,
                    selector: b_selector,
                    ..
                },
            ) => a_size == b_size && a_class == b_class && a_selector == b_selector,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ephemeral() {
        let storage = StorageSpec::from_json("kafka-storage", r#"{"type":"ephemeral"}"#).unwrap();
        assert_eq!(storage, StorageSpec::Ephemeral);
        assert!(!storage.is_persistent());
        assert!(!storage.delete_claim());
    }

    #[test]
    fn test_parse_persistent_claim_defaults() {
        let storage = StorageSpec::from_json(
            "kafka-storage",
            r#"{"type":"persistent-claim","size":"100Gi"}"#,
        )
        .unwrap();
        match &storage {
            StorageSpec::PersistentClaim {
                size,
                class,
                selector,
                delete_claim,
            } => {
                assert_eq!(size, "100Gi");
                assert!(class.is_none());
                assert!(selector.is_none());
                assert!(!delete_claim);
            }
            StorageSpec::Ephemeral => panic!("expected persistent-claim"),
        }
        assert_eq!(storage.type_tag(), "persistent-claim");
    }

    #[test]
    fn test_parse_persistent_claim_full() {
        let raw = r#"{
            "type": "persistent-claim",
            "size": "10Gi",
            "class": "fast-ssd",
            "selector": {"matchLabels": {"disk": "nvme"}},
            "delete-claim": true
        }"#;
        let storage = StorageSpec::from_json("zookeeper-storage", raw).unwrap();
        assert!(storage.delete_claim());
        match storage {
            StorageSpec::PersistentClaim { class, selector, .. } => {
                assert_eq!(class.as_deref(), Some("fast-ssd"));
                let selector = selector.unwrap();
                assert_eq!(selector.match_labels.get("disk").map(String::as_str), Some("nvme"));
            }
            StorageSpec::Ephemeral => panic!("expected persistent-claim"),
        }
    }

    #[test]
    fn test_json_round_trip() {
        let raw = r#"{"type":"persistent-claim","size":"5Gi","class":"standard","delete-claim":true}"#;
        let storage = StorageSpec::from_json("kafka-storage", raw).unwrap();
        let reparsed = StorageSpec::from_json("kafka-storage", &storage.to_json().unwrap()).unwrap();
        assert_eq!(storage, reparsed);
    }

    #[test]
    fn test_malformed_json_is_a_decode_error() {
        let err = StorageSpec::from_json("kafka-storage", r#"{"type":"floppy-disk"}"#).unwrap_err();
        assert!(matches!(err, OperatorError::Decode(_)));
        assert!(err.to_string().contains("kafka-storage"));
    }

    #[test]
    fn test_same_shape_ignores_delete_claim() {
        let keep = StorageSpec::from_json("s", r#"{"type":"persistent-claim","size":"5Gi"}"#).unwrap();
        let drop =
            StorageSpec::from_json("s", r#"{"type":"persistent-claim","size":"5Gi","delete-claim":true}"#)
                .unwrap();
        assert!(keep.same_shape(&drop));

        let bigger = StorageSpec::from_json("s", r#"{"type":"persistent-claim","size":"9Gi"}"#).unwrap();
        assert!(!keep.same_shape(&bigger));
        assert!(!keep.same_shape(&StorageSpec::Ephemeral));
    }
}
