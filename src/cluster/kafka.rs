//! Kafka cluster model.
//!
//! Decodes the desired state of a Kafka cluster from its ConfigMap,
//! recovers the last-applied state from the Kafka StatefulSet, diffs the
//! two, and builds every Kubernetes resource the cluster is made of:
//! two StatefulSets, client and headless Services for brokers and
//! Zookeeper, and the optional metrics ConfigMaps.

use crate::cluster::{
    data_int, data_required, data_string, ClusterDiff, StorageSpec,
};
use crate::error::{OperatorError, Result};
use crate::labels::{
    CLUSTER_LABEL, METRICS_ANNOTATION, NAME_LABEL, STORAGE_ANNOTATION, TYPE_LABEL,
};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe, Service,
    ServicePort, ServiceSpec, TCPSocketAction, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

pub const DEFAULT_KAFKA_IMAGE: &str = "strimzi/kafka:latest";
pub const DEFAULT_ZOOKEEPER_IMAGE: &str = "strimzi/zookeeper:latest";

pub const KAFKA_CLIENT_PORT: i32 = 9092;
pub const ZOOKEEPER_CLIENT_PORT: i32 = 2181;
pub const ZOOKEEPER_CLUSTERING_PORT: i32 = 2888;
pub const ZOOKEEPER_LEADER_ELECTION_PORT: i32 = 3888;

const KAFKA_VOLUME: &str = "kafka-storage";
const ZOOKEEPER_VOLUME: &str = "zookeeper-storage";
const METRICS_VOLUME: &str = "metrics-config";
const METRICS_CONFIG_KEY: &str = "metrics-config.json";

const ENV_ZOOKEEPER_CONNECT: &str = "KAFKA_ZOOKEEPER_CONNECT";
const ENV_METRICS_ENABLED: &str = "KAFKA_METRICS_ENABLED";
const ENV_ZOOKEEPER_METRICS_ENABLED: &str = "ZOOKEEPER_METRICS_ENABLED";
const ENV_ZOOKEEPER_NODE_COUNT: &str = "ZOOKEEPER_NODE_COUNT";

const KEY_DEFAULT_REPLICATION_FACTOR: &str = "KAFKA_DEFAULT_REPLICATION_FACTOR";
const KEY_OFFSETS_TOPIC_REPLICATION_FACTOR: &str = "KAFKA_OFFSETS_TOPIC_REPLICATION_FACTOR";
const KEY_TRANSACTION_STATE_LOG_REPLICATION_FACTOR: &str =
    "KAFKA_TRANSACTION_STATE_LOG_REPLICATION_FACTOR";

/// Desired state of one Kafka cluster
#[derive(Debug, Clone, PartialEq)]
pub struct KafkaCluster {
    pub name: String,
    pub namespace: String,
    /// Labels carried over from the cluster ConfigMap
    pub labels: BTreeMap<String, String>,

    pub replicas: i32,
    pub image: String,
    pub healthcheck_delay: i32,
    pub healthcheck_timeout: i32,

    pub zookeeper_replicas: i32,
    pub zookeeper_image: String,
    pub zookeeper_healthcheck_delay: i32,
    pub zookeeper_healthcheck_timeout: i32,

    pub default_replication_factor: i32,
    pub offsets_topic_replication_factor: i32,
    pub transaction_state_log_replication_factor: i32,

    pub storage: StorageSpec,
    pub zookeeper_storage: StorageSpec,
    pub metrics_config: Option<serde_json::Value>,
    pub zookeeper_metrics_config: Option<serde_json::Value>,
}

impl KafkaCluster {
    /// Decode the desired state from a cluster ConfigMap.
    pub fn decode(config_map: &ConfigMap) -> Result<KafkaCluster> {
        let name = config_map
            .metadata
            .name
            .clone()
            .ok_or_else(|| OperatorError::Decode("cluster ConfigMap has no name".to_string()))?;
        let namespace = config_map
            .metadata
            .namespace
            .clone()
            .ok_or_else(|| OperatorError::Decode("cluster ConfigMap has no namespace".to_string()))?;
        let empty = BTreeMap::new();
        let data = config_map.data.as_ref().unwrap_or(&empty);

        let mut labels = config_map.metadata.labels.clone().unwrap_or_default();
        for owned in [CLUSTER_LABEL, TYPE_LABEL, NAME_LABEL] {
            labels.remove(owned);
        }

        Ok(KafkaCluster {
            name,
            namespace,
            labels,
            replicas: data_int(data, "kafka-nodes", 3)?,
            image: data_string(data, "kafka-image", DEFAULT_KAFKA_IMAGE),
            healthcheck_delay: data_int(data, "kafka-healthcheck-delay", 15)?,
            healthcheck_timeout: data_int(data, "kafka-healthcheck-timeout", 5)?,
            zookeeper_replicas: data_int(data, "zookeeper-nodes", 3)?,
            zookeeper_image: data_string(data, "zookeeper-image", DEFAULT_ZOOKEEPER_IMAGE),
            zookeeper_healthcheck_delay: data_int(data, "zookeeper-healthcheck-delay", 15)?,
            zookeeper_healthcheck_timeout: data_int(data, "zookeeper-healthcheck-timeout", 5)?,
            default_replication_factor: data_int(data, KEY_DEFAULT_REPLICATION_FACTOR, 3)?,
            offsets_topic_replication_factor: data_int(
                data,
                KEY_OFFSETS_TOPIC_REPLICATION_FACTOR,
                3,
            )?,
            transaction_state_log_replication_factor: data_int(
                data,
                KEY_TRANSACTION_STATE_LOG_REPLICATION_FACTOR,
                3,
            )?,
            storage: StorageSpec::from_json("kafka-storage", data_required(data, "kafka-storage")?)?,
            zookeeper_storage: StorageSpec::from_json(
                "zookeeper-storage",
                data_required(data, "zookeeper-storage")?,
            )?,
            metrics_config: parse_metrics(data, "kafka-metrics-config")?,
            zookeeper_metrics_config: parse_metrics(data, "zookeeper-metrics-config")?,
        })
    }

    /// Recover the last-applied state from the Kafka StatefulSet (and the
    /// Zookeeper one when it exists). Workload spec fields carry replicas,
    /// image, and probe timings; operator annotations carry the storage and
    /// metrics JSON.
    pub fn from_statefulsets(
        kafka: &StatefulSet,
        zookeeper: Option<&StatefulSet>,
    ) -> Result<KafkaCluster> {
        let name = crate::labels::cluster_name(&kafka.metadata).ok_or_else(|| {
            OperatorError::InvalidState(format!(
                "StatefulSet {} has no cluster label",
                kafka.metadata.name.as_deref().unwrap_or("?")
            ))
        })?;
        let namespace = kafka.metadata.namespace.clone().unwrap_or_default();

        let mut labels = kafka.metadata.labels.clone().unwrap_or_default();
        for owned in [CLUSTER_LABEL, TYPE_LABEL, NAME_LABEL] {
            labels.remove(owned);
        }

        let (zk_replicas, zk_image, zk_delay, zk_timeout, zk_storage, zk_metrics) = match zookeeper {
            Some(sts) => (
                replicas_of(sts),
                image_of(sts).unwrap_or_else(|| DEFAULT_ZOOKEEPER_IMAGE.to_string()),
                probe_delay_of(sts, 15),
                probe_timeout_of(sts, 5),
                storage_annotation(sts),
                metrics_annotation(sts)?,
            ),
            None => (3, DEFAULT_ZOOKEEPER_IMAGE.to_string(), 15, 5, StorageSpec::Ephemeral, None),
        };

        Ok(KafkaCluster {
            name,
            namespace,
            labels,
            replicas: replicas_of(kafka),
            image: image_of(kafka).unwrap_or_else(|| DEFAULT_KAFKA_IMAGE.to_string()),
            healthcheck_delay: probe_delay_of(kafka, 15),
            healthcheck_timeout: probe_timeout_of(kafka, 5),
            zookeeper_replicas: zk_replicas,
            zookeeper_image: zk_image,
            zookeeper_healthcheck_delay: zk_delay,
            zookeeper_healthcheck_timeout: zk_timeout,
            default_replication_factor: env_int_of(kafka, KEY_DEFAULT_REPLICATION_FACTOR, 3),
            offsets_topic_replication_factor: env_int_of(
                kafka,
                KEY_OFFSETS_TOPIC_REPLICATION_FACTOR,
                3,
            ),
            transaction_state_log_replication_factor: env_int_of(
                kafka,
                KEY_TRANSACTION_STATE_LOG_REPLICATION_FACTOR,
                3,
            ),
            storage: storage_annotation(kafka),
            zookeeper_storage: zk_storage,
            metrics_config: metrics_annotation(kafka)?,
            zookeeper_metrics_config: zk_metrics,
        })
    }

    /// Diff the last-applied state (`self`) against the desired state.
    ///
    /// A storage change other than the `delete-claim` flag is an illegal
    /// transition: the claim layout of a running cluster cannot be rebuilt
    /// by a rolling replacement.
    pub fn diff(&self, desired: &KafkaCluster) -> Result<ClusterDiff> {
        if !self.storage.same_shape(&desired.storage) {
            return Err(OperatorError::IllegalTransition(format!(
                "cluster {} storage cannot change from {} to {}",
                self.name,
                self.storage.type_tag(),
                desired.storage.type_tag()
            )));
        }
        if !self.zookeeper_storage.same_shape(&desired.zookeeper_storage) {
            return Err(OperatorError::IllegalTransition(format!(
                "cluster {} zookeeper storage cannot change from {} to {}",
                self.name,
                self.zookeeper_storage.type_tag(),
                desired.zookeeper_storage.type_tag()
            )));
        }

        let scale_up = desired.replicas > self.replicas
            || desired.zookeeper_replicas > self.zookeeper_replicas;
        let scale_down = desired.replicas < self.replicas
            || desired.zookeeper_replicas < self.zookeeper_replicas;

        // The explicit set of pod-template-affecting fields. Metrics config
        // is excluded: a metrics-only change must not roll pods.
        let rolling_update = self.image != desired.image
            || self.healthcheck_delay != desired.healthcheck_delay
            || self.healthcheck_timeout != desired.healthcheck_timeout
            || self.zookeeper_image != desired.zookeeper_image
            || self.zookeeper_healthcheck_delay != desired.zookeeper_healthcheck_delay
            || self.zookeeper_healthcheck_timeout != desired.zookeeper_healthcheck_timeout
            || self.default_replication_factor != desired.default_replication_factor
            || self.offsets_topic_replication_factor != desired.offsets_topic_replication_factor
            || self.transaction_state_log_replication_factor
                != desired.transaction_state_log_replication_factor;

        let metrics_changed = self.metrics_config != desired.metrics_config
            || self.zookeeper_metrics_config != desired.zookeeper_metrics_config;

        let different = scale_up
            || scale_down
            || rolling_update
            || metrics_changed
            || self.labels != desired.labels
            || self.storage != desired.storage
            || self.zookeeper_storage != desired.zookeeper_storage;

        Ok(ClusterDiff {
            scale_up,
            scale_down,
            rolling_update,
            metrics_changed,
            different,
        })
    }

    // Deterministic resource names

    pub fn kafka_statefulset_name(&self) -> String {
        format!("{}-kafka", self.name)
    }

    pub fn zookeeper_statefulset_name(&self) -> String {
        format!("{}-zookeeper", self.name)
    }

    pub fn kafka_service_name(&self) -> String {
        format!("{}-kafka", self.name)
    }

    pub fn kafka_headless_service_name(&self) -> String {
        format!("{}-kafka-headless", self.name)
    }

    pub fn zookeeper_service_name(&self) -> String {
        format!("{}-zookeeper", self.name)
    }

    pub fn zookeeper_headless_service_name(&self) -> String {
        format!("{}-zookeeper-headless", self.name)
    }

    pub fn kafka_metrics_configmap_name(&self) -> String {
        format!("{}-kafka-metrics-config", self.name)
    }

    pub fn zookeeper_metrics_configmap_name(&self) -> String {
        format!("{}-zookeeper-metrics-config", self.name)
    }

    /// Claim name for broker `i`, as produced by the claim template.
    pub fn kafka_claim_name(&self, i: i32) -> String {
        format!("{}-{}-kafka-{}", KAFKA_VOLUME, self.name, i)
    }

    /// Claim name for Zookeeper node `i`.
    pub fn zookeeper_claim_name(&self, i: i32) -> String {
        format!("{}-{}-zookeeper-{}", ZOOKEEPER_VOLUME, self.name, i)
    }

    // Resource builders

    pub fn kafka_statefulset(&self) -> StatefulSet {
        let workload = self.kafka_statefulset_name();
        let mut env = vec![
            env_var(
                ENV_ZOOKEEPER_CONNECT,
                &format!("{}:{}", self.zookeeper_service_name(), ZOOKEEPER_CLIENT_PORT),
            ),
            env_var(
                KEY_DEFAULT_REPLICATION_FACTOR,
                &self.default_replication_factor.to_string(),
            ),
            env_var(
                KEY_OFFSETS_TOPIC_REPLICATION_FACTOR,
                &self.offsets_topic_replication_factor.to_string(),
            ),
            env_var(
                KEY_TRANSACTION_STATE_LOG_REPLICATION_FACTOR,
                &self.transaction_state_log_replication_factor.to_string(),
            ),
        ];
        if self.metrics_config.is_some() {
            env.push(env_var(ENV_METRICS_ENABLED, "true"));
        }

        self.statefulset(
            &workload,
            "kafka",
            &self.image,
            KAFKA_CLIENT_PORT,
            self.healthcheck_delay,
            self.healthcheck_timeout,
            env,
            self.replicas,
            &self.storage,
            KAFKA_VOLUME,
            "/var/lib/kafka",
            self.metrics_config
                .as_ref()
                .map(|_| self.kafka_metrics_configmap_name()),
            &self.metrics_json(),
        )
    }

    pub fn zookeeper_statefulset(&self) -> StatefulSet {
        let workload = self.zookeeper_statefulset_name();
        let mut env = vec![env_var(
            ENV_ZOOKEEPER_NODE_COUNT,
            &self.zookeeper_replicas.to_string(),
        )];
        if self.zookeeper_metrics_config.is_some() {
            env.push(env_var(ENV_ZOOKEEPER_METRICS_ENABLED, "true"));
        }

        self.statefulset(
            &workload,
            "zookeeper",
            &self.zookeeper_image,
            ZOOKEEPER_CLIENT_PORT,
            self.zookeeper_healthcheck_delay,
            self.zookeeper_healthcheck_timeout,
            env,
            self.zookeeper_replicas,
            &self.zookeeper_storage,
            ZOOKEEPER_VOLUME,
            "/var/lib/zookeeper",
            self.zookeeper_metrics_config
                .as_ref()
                .map(|_| self.zookeeper_metrics_configmap_name()),
            &self.zookeeper_metrics_json(),
        )
    }

    pub fn kafka_service(&self) -> Service {
        self.service(
            &self.kafka_service_name(),
            &self.kafka_statefulset_name(),
            vec![service_port("clients", KAFKA_CLIENT_PORT)],
            false,
        )
    }

    pub fn kafka_headless_service(&self) -> Service {
        self.service(
            &self.kafka_headless_service_name(),
            &self.kafka_statefulset_name(),
            vec![service_port("clients", KAFKA_CLIENT_PORT)],
            true,
        )
    }

    pub fn zookeeper_service(&self) -> Service {
        self.service(
            &self.zookeeper_service_name(),
            &self.zookeeper_statefulset_name(),
            vec![service_port("clients", ZOOKEEPER_CLIENT_PORT)],
            false,
        )
    }

    pub fn zookeeper_headless_service(&self) -> Service {
        self.service(
            &self.zookeeper_headless_service_name(),
            &self.zookeeper_statefulset_name(),
            vec![
                service_port("clients", ZOOKEEPER_CLIENT_PORT),
                service_port("clustering", ZOOKEEPER_CLUSTERING_PORT),
                service_port("leader-election", ZOOKEEPER_LEADER_ELECTION_PORT),
            ],
            true,
        )
    }

    pub fn kafka_metrics_configmap(&self) -> Option<ConfigMap> {
        self.metrics_configmap(&self.kafka_metrics_configmap_name(), self.metrics_config.as_ref())
    }

    pub fn zookeeper_metrics_configmap(&self) -> Option<ConfigMap> {
        self.metrics_configmap(
            &self.zookeeper_metrics_configmap_name(),
            self.zookeeper_metrics_config.as_ref(),
        )
    }

    /// Labels stamped on every engine-owned resource of this cluster.
    pub fn resource_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.labels.clone();
        labels.insert(CLUSTER_LABEL.to_string(), self.name.clone());
        labels.insert(TYPE_LABEL.to_string(), "kafka".to_string());
        labels
    }

    fn pod_selector(&self, workload: &str) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(CLUSTER_LABEL.to_string(), self.name.clone());
        labels.insert(NAME_LABEL.to_string(), workload.to_string());
        labels
    }

    fn metrics_json(&self) -> Option<String> {
        self.metrics_config.as_ref().map(|v| v.to_string())
    }

    fn zookeeper_metrics_json(&self) -> Option<String> {
        self.zookeeper_metrics_config.as_ref().map(|v| v.to_string())
    }

    #[allow(clippy::too_many_arguments)]
    fn statefulset(
        &self,
        workload: &str,
        container_name: &str,
        image: &str,
        client_port: i32,
        probe_delay: i32,
        probe_timeout: i32,
        env: Vec<EnvVar>,
        replicas: i32,
        storage: &StorageSpec,
        volume_name: &str,
        mount_path: &str,
        metrics_configmap: Option<String>,
        metrics_json: &Option<String>,
    ) -> StatefulSet {
        let selector = self.pod_selector(workload);
        let mut template_labels = self.resource_labels();
        template_labels.extend(selector.clone());

        let mut volume_mounts = vec![VolumeMount {
            name: volume_name.to_string(),
            mount_path: mount_path.to_string(),
            ..Default::default()
        }];
        let mut volumes = Vec::new();
        let mut volume_claim_templates = Vec::new();

        match storage {
            StorageSpec::Ephemeral => volumes.push(Volume {
                name: volume_name.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }),
            StorageSpec::PersistentClaim {
                size,
                class,
                selector: claim_selector,
                ..
            } => volume_claim_templates.push(PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(volume_name.to_string()),
                    labels: Some(self.resource_labels()),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                    storage_class_name: class.clone(),
                    selector: claim_selector.as_ref().map(|s| LabelSelector {
                        match_labels: Some(s.match_labels.clone()),
                        ..Default::default()
                    }),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(BTreeMap::from([(
                            "storage".to_string(),
                            Quantity(size.clone()),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        }

        if let Some(configmap_name) = &metrics_configmap {
            volume_mounts.push(VolumeMount {
                name: METRICS_VOLUME.to_string(),
                mount_path: format!("/opt/{}/metrics-config", container_name),
                read_only: Some(true),
                ..Default::default()
            });
            volumes.push(Volume {
                name: METRICS_VOLUME.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: Some(configmap_name.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        let probe = tcp_probe(client_port, probe_delay, probe_timeout);

        let container = Container {
            name: container_name.to_string(),
            image: Some(image.to_string()),
            ports: Some(vec![ContainerPort {
                name: Some("clients".to_string()),
                container_port: client_port,
                ..Default::default()
            }]),
            env: Some(env),
            volume_mounts: Some(volume_mounts),
            liveness_probe: Some(probe.clone()),
            readiness_probe: Some(probe),
            ..Default::default()
        };

        let mut annotations = BTreeMap::new();
        if let Ok(json) = storage.to_json() {
            annotations.insert(STORAGE_ANNOTATION.to_string(), json);
        }
        if let Some(json) = metrics_json {
            annotations.insert(METRICS_ANNOTATION.to_string(), json.clone());
        }

        StatefulSet {
            metadata: ObjectMeta {
                name: Some(workload.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(template_labels.clone()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(replicas),
                selector: LabelSelector {
                    match_labels: Some(selector),
                    ..Default::default()
                },
                service_name: format!("{}-headless", workload),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(template_labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes: if volumes.is_empty() { None } else { Some(volumes) },
                        ..Default::default()
                    }),
                },
                volume_claim_templates: if volume_claim_templates.is_empty() {
                    None
                } else {
                    Some(volume_claim_templates)
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn service(
        &self,
        name: &str,
        workload: &str,
        ports: Vec<ServicePort>,
        headless: bool,
    ) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.resource_labels()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: headless.then(|| "None".to_string()),
                publish_not_ready_addresses: headless.then_some(true),
                selector: Some(self.pod_selector(workload)),
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn metrics_configmap(
        &self,
        name: &str,
        metrics: Option<&serde_json::Value>,
    ) -> Option<ConfigMap> {
        let metrics = metrics?;
        Some(ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.resource_labels()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                METRICS_CONFIG_KEY.to_string(),
                metrics.to_string(),
            )])),
            ..Default::default()
        })
    }
}

fn parse_metrics(
    data: &BTreeMap<String, String>,
    key: &str,
) -> Result<Option<serde_json::Value>> {
    match data.get(key) {
        None => Ok(None),
        Some(raw) => serde_json::from_str(raw)
            .map(Some)
            .map_err(|e| OperatorError::Decode(format!("field `{}`: {}", key, e))),
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn service_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        ..Default::default()
    }
}

fn tcp_probe(port: i32, delay: i32, timeout: i32) -> Probe {
    Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(delay),
        timeout_seconds: Some(timeout),
        ..Default::default()
    }
}

// Recovery accessors over a StatefulSet

fn replicas_of(sts: &StatefulSet) -> i32 {
    sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0)
}

fn first_container(sts: &StatefulSet) -> Option<&Container> {
    sts.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()
}

fn image_of(sts: &StatefulSet) -> Option<String> {
    first_container(sts)?.image.clone()
}

fn probe_delay_of(sts: &StatefulSet, default: i32) -> i32 {
    first_container(sts)
        .and_then(|c| c.liveness_probe.as_ref())
        .and_then(|p| p.initial_delay_seconds)
        .unwrap_or(default)
}

fn probe_timeout_of(sts: &StatefulSet, default: i32) -> i32 {
    first_container(sts)
        .and_then(|c| c.liveness_probe.as_ref())
        .and_then(|p| p.timeout_seconds)
        .unwrap_or(default)
}

fn env_int_of(sts: &StatefulSet, name: &str, default: i32) -> i32 {
    first_container(sts)
        .and_then(|c| c.env.as_ref())
        .and_then(|env| env.iter().find(|e| e.name == name))
        .and_then(|e| e.value.as_ref())
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Storage recorded on a workload. A missing or unreadable annotation is
/// treated as ephemeral so recovery never blocks deletion.
fn storage_annotation(sts: &StatefulSet) -> StorageSpec {
    sts.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(STORAGE_ANNOTATION))
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or(StorageSpec::Ephemeral)
}

fn metrics_annotation(sts: &StatefulSet) -> Result<Option<serde_json::Value>> {
    match sts
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(METRICS_ANNOTATION))
    {
        None => Ok(None),
        Some(raw) => serde_json::from_str(raw).map(Some).map_err(|e| {
            OperatorError::InvalidState(format!("unreadable metrics annotation: {}", e))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_map(data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("my-cluster".to_string()),
                namespace: Some("default".to_string()),
                labels: Some(BTreeMap::from([(
                    "kind".to_string(),
                    "cluster".to_string(),
                )])),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn ephemeral_config_map() -> ConfigMap {
        config_map(&[
            ("kafka-storage", r#"{"type":"ephemeral"}"#),
            ("zookeeper-storage", r#"{"type":"ephemeral"}"#),
        ])
    }

    #[test]
    fn test_decode_defaults() {
        let cluster = KafkaCluster::decode(&ephemeral_config_map()).unwrap();
        assert_eq!(cluster.name, "my-cluster");
        assert_eq!(cluster.namespace, "default");
        assert_eq!(cluster.replicas, 3);
        assert_eq!(cluster.zookeeper_replicas, 3);
        assert_eq!(cluster.image, DEFAULT_KAFKA_IMAGE);
        assert_eq!(cluster.healthcheck_delay, 15);
        assert_eq!(cluster.healthcheck_timeout, 5);
        assert_eq!(cluster.default_replication_factor, 3);
        assert_eq!(cluster.storage, StorageSpec::Ephemeral);
        assert!(cluster.metrics_config.is_none());
    }

    #[test]
    fn test_decode_is_pure() {
        let cm = ephemeral_config_map();
        assert_eq!(KafkaCluster::decode(&cm).unwrap(), KafkaCluster::decode(&cm).unwrap());
    }

    #[test]
    fn test_decode_missing_storage_fails() {
        let cm = config_map(&[("kafka-storage", r#"{"type":"ephemeral"}"#)]);
        let err = KafkaCluster::decode(&cm).unwrap_err();
        assert!(matches!(err, OperatorError::Decode(_)));
        assert!(err.to_string().contains("zookeeper-storage"));
    }

    #[test]
    fn test_decode_malformed_int_fails() {
        let mut cm = ephemeral_config_map();
        cm.data
            .as_mut()
            .unwrap()
            .insert("kafka-nodes".to_string(), "many".to_string());
        assert!(matches!(
            KafkaCluster::decode(&cm).unwrap_err(),
            OperatorError::Decode(_)
        ));
    }

    #[test]
    fn test_resource_names() {
        let cluster = KafkaCluster::decode(&ephemeral_config_map()).unwrap();
        assert_eq!(cluster.kafka_statefulset_name(), "my-cluster-kafka");
        assert_eq!(cluster.zookeeper_statefulset_name(), "my-cluster-zookeeper");
        assert_eq!(cluster.kafka_headless_service_name(), "my-cluster-kafka-headless");
        assert_eq!(
            cluster.zookeeper_headless_service_name(),
            "my-cluster-zookeeper-headless"
        );
        assert_eq!(
            cluster.kafka_metrics_configmap_name(),
            "my-cluster-kafka-metrics-config"
        );
        assert_eq!(cluster.kafka_claim_name(0), "kafka-storage-my-cluster-kafka-0");
        assert_eq!(
            cluster.zookeeper_claim_name(2),
            "zookeeper-storage-my-cluster-zookeeper-2"
        );
    }

    #[test]
    fn test_kafka_statefulset_shape() {
        let cm = config_map(&[
            ("kafka-nodes", "5"),
            ("kafka-image", "kafka:2.8"),
            ("kafka-healthcheck-delay", "30"),
            ("kafka-storage", r#"{"type":"ephemeral"}"#),
            ("zookeeper-storage", r#"{"type":"ephemeral"}"#),
        ]);
        let cluster = KafkaCluster::decode(&cm).unwrap();
        let sts = cluster.kafka_statefulset();

        assert_eq!(sts.metadata.name.as_deref(), Some("my-cluster-kafka"));
        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(5));
        assert_eq!(spec.service_name, "my-cluster-kafka-headless");
        assert!(spec.volume_claim_templates.is_none());

        let pod = spec.template.spec.unwrap();
        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("kafka:2.8"));
        let probe = container.liveness_probe.as_ref().unwrap();
        assert_eq!(probe.initial_delay_seconds, Some(30));
        assert_eq!(probe.timeout_seconds, Some(5));
        // Ephemeral storage mounts an emptyDir volume.
        assert!(pod.volumes.unwrap().iter().any(|v| v.empty_dir.is_some()));

        let labels = sts.metadata.labels.unwrap();
        assert_eq!(labels.get(CLUSTER_LABEL).map(String::as_str), Some("my-cluster"));
        assert_eq!(labels.get(TYPE_LABEL).map(String::as_str), Some("kafka"));
    }

    #[test]
    fn test_persistent_claim_template_yields_expected_claim_names() {
        let cm = config_map(&[
            ("kafka-storage", r#"{"type":"persistent-claim","size":"100Gi","class":"ssd"}"#),
            ("zookeeper-storage", r#"{"type":"ephemeral"}"#),
        ]);
        let cluster = KafkaCluster::decode(&cm).unwrap();
        let sts = cluster.kafka_statefulset();
        let templates = sts.spec.unwrap().volume_claim_templates.unwrap();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].metadata.name.as_deref(), Some("kafka-storage"));
        let claim_spec = templates[0].spec.as_ref().unwrap();
        assert_eq!(claim_spec.storage_class_name.as_deref(), Some("ssd"));

        // Template name + pod name compose into the per-broker claim name.
        assert_eq!(cluster.kafka_claim_name(1), "kafka-storage-my-cluster-kafka-1");
    }

    #[test]
    fn test_storage_annotation_round_trip() {
        let cm = config_map(&[
            ("kafka-storage", r#"{"type":"persistent-claim","size":"10Gi","delete-claim":true}"#),
            ("zookeeper-storage", r#"{"type":"ephemeral"}"#),
        ]);
        let cluster = KafkaCluster::decode(&cm).unwrap();
        let recovered =
            KafkaCluster::from_statefulsets(&cluster.kafka_statefulset(), Some(&cluster.zookeeper_statefulset()))
                .unwrap();
        assert_eq!(recovered.storage, cluster.storage);
        assert!(recovered.storage.delete_claim());
        assert_eq!(recovered.replicas, cluster.replicas);
        assert_eq!(recovered.image, cluster.image);
        assert_eq!(recovered.zookeeper_replicas, cluster.zookeeper_replicas);
    }

    #[test]
    fn test_headless_services() {
        let cluster = KafkaCluster::decode(&ephemeral_config_map()).unwrap();
        let headless = cluster.zookeeper_headless_service();
        let spec = headless.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));
        assert_eq!(spec.ports.unwrap().len(), 3);

        let client = cluster.kafka_service();
        let spec = client.spec.unwrap();
        assert!(spec.cluster_ip.is_none());
        assert_eq!(spec.ports.unwrap()[0].port, KAFKA_CLIENT_PORT);
    }

    #[test]
    fn test_metrics_configmap_only_when_configured() {
        let cluster = KafkaCluster::decode(&ephemeral_config_map()).unwrap();
        assert!(cluster.kafka_metrics_configmap().is_none());

        let mut cm = ephemeral_config_map();
        cm.data.as_mut().unwrap().insert(
            "kafka-metrics-config".to_string(),
            r#"{"rules":[{"pattern":".*"}]}"#.to_string(),
        );
        let cluster = KafkaCluster::decode(&cm).unwrap();
        let metrics_cm = cluster.kafka_metrics_configmap().unwrap();
        assert_eq!(
            metrics_cm.metadata.name.as_deref(),
            Some("my-cluster-kafka-metrics-config")
        );
        assert!(metrics_cm.data.unwrap().contains_key("metrics-config.json"));
    }

    #[test]
    fn test_diff_is_empty_for_identical_clusters() {
        let cluster = KafkaCluster::decode(&ephemeral_config_map()).unwrap();
        let diff = cluster.diff(&cluster).unwrap();
        assert_eq!(diff, ClusterDiff::UNCHANGED);
    }

    #[test]
    fn test_diff_scale_up_without_rolling() {
        let current = KafkaCluster::decode(&ephemeral_config_map()).unwrap();
        let mut desired = current.clone();
        desired.replicas = 5;
        let diff = current.diff(&desired).unwrap();
        assert!(diff.scale_up);
        assert!(!diff.scale_down);
        assert!(!diff.rolling_update);
        assert!(diff.different);
    }

    #[test]
    fn test_diff_image_change_rolls() {
        let current = KafkaCluster::decode(&ephemeral_config_map()).unwrap();
        let mut desired = current.clone();
        desired.image = "kafka:next".to_string();
        let diff = current.diff(&desired).unwrap();
        assert!(diff.rolling_update);
        assert!(!diff.scale_up);
    }

    #[test]
    fn test_diff_metrics_only_change() {
        let current = KafkaCluster::decode(&ephemeral_config_map()).unwrap();
        let mut desired = current.clone();
        desired.metrics_config = Some(serde_json::json!({"rules": []}));
        let diff = current.diff(&desired).unwrap();
        assert!(diff.metrics_changed);
        assert!(!diff.rolling_update);
        assert!(!diff.needs_workload_patch());
        assert!(diff.different);
    }

    #[test]
    fn test_diff_storage_change_is_illegal() {
        let current = KafkaCluster::decode(&ephemeral_config_map()).unwrap();
        let mut desired = current.clone();
        desired.storage = StorageSpec::PersistentClaim {
            size: "10Gi".to_string(),
            class: None,
            selector: None,
            delete_claim: false,
        };
        let err = current.diff(&desired).unwrap_err();
        assert!(matches!(err, OperatorError::IllegalTransition(_)));
    }

    #[test]
    fn test_diff_delete_claim_toggle_is_legal() {
        let cm = config_map(&[
            ("kafka-storage", r#"{"type":"persistent-claim","size":"10Gi"}"#),
            ("zookeeper-storage", r#"{"type":"ephemeral"}"#),
        ]);
        let current = KafkaCluster::decode(&cm).unwrap();
        let mut desired = current.clone();
        desired.storage = StorageSpec::PersistentClaim {
            size: "10Gi".to_string(),
            class: None,
            selector: None,
            delete_claim: true,
        };
        let diff = current.diff(&desired).unwrap();
        assert!(!diff.needs_workload_patch());
        assert!(diff.different);
    }
}
