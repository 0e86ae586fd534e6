//! Label and annotation vocabulary shared by every engine-owned resource.
//!
//! Every resource the operator creates carries the cluster label (which
//! cluster it belongs to) and the type label (which kind of cluster). The
//! periodic sweep joins ConfigMaps and workload resources on these labels.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

/// Name of the cluster a resource belongs to
pub const CLUSTER_LABEL: &str = "kafka-cluster-operator.io/cluster";

/// Cluster type discriminator: `kafka`, `kafka-connect` or `kafka-connect-s2i`
pub const TYPE_LABEL: &str = "kafka-cluster-operator.io/type";

/// Workload name label, distinguishing e.g. broker pods from zookeeper pods
pub const NAME_LABEL: &str = "kafka-cluster-operator.io/name";

/// Annotation carrying the JSON storage definition last applied to a workload
pub const STORAGE_ANNOTATION: &str = "kafka-cluster-operator.io/storage";

/// Annotation carrying the JSON metrics configuration last applied to a workload
pub const METRICS_ANNOTATION: &str = "kafka-cluster-operator.io/metrics";

/// Field manager identity used for server-side apply patches
pub const FIELD_MANAGER: &str = "kafka-cluster-operator";

/// Default selector for cluster ConfigMaps, overridable via `CONFIGMAP_LABELS`
pub const DEFAULT_CONFIGMAP_LABELS: &str = "kind=cluster";

/// Render a label map as a Kubernetes label selector string.
pub fn selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// The cluster name recorded on an engine-owned resource, if any.
pub fn cluster_name(meta: &ObjectMeta) -> Option<String> {
    meta.labels.as_ref()?.get(CLUSTER_LABEL).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_rendering() {
        let mut labels = BTreeMap::new();
        labels.insert("kind".to_string(), "cluster".to_string());
        assert_eq!(selector(&labels), "kind=cluster");

        labels.insert("app".to_string(), "kafka".to_string());
        // BTreeMap iterates in key order
        assert_eq!(selector(&labels), "app=kafka,kind=cluster");
    }

    #[test]
    fn test_cluster_name_from_labels() {
        let mut labels = BTreeMap::new();
        labels.insert(CLUSTER_LABEL.to_string(), "my-cluster".to_string());
        let meta = ObjectMeta {
            labels: Some(labels),
            ..Default::default()
        };
        assert_eq!(cluster_name(&meta).as_deref(), Some("my-cluster"));
        assert_eq!(cluster_name(&ObjectMeta::default()), None);
    }
}
