//! Kafka Connect cluster model.
//!
//! Covers both `kafka-connect` and `kafka-connect-s2i` clusters: the two
//! types share one desired-state shape and reconcile the same Deployment
//! and REST Service, but live under distinct type labels and lock keys.

use crate::cluster::{data_bool, data_int, data_string, ClusterDiff, ClusterType};
use crate::error::{OperatorError, Result};
use crate::labels::{CLUSTER_LABEL, NAME_LABEL, TYPE_LABEL};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HTTPGetAction, PodSpec, PodTemplateSpec, Probe, Service,
    ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

pub const DEFAULT_CONNECT_IMAGE: &str = "strimzi/kafka-connect:latest";
pub const CONNECT_REST_PORT: i32 = 8083;

const KEY_BOOTSTRAP_SERVERS: &str = "KAFKA_CONNECT_BOOTSTRAP_SERVERS";
const KEY_GROUP_ID: &str = "KAFKA_CONNECT_GROUP_ID";
const KEY_KEY_CONVERTER: &str = "KAFKA_CONNECT_KEY_CONVERTER";
const KEY_KEY_CONVERTER_SCHEMAS_ENABLE: &str = "KAFKA_CONNECT_KEY_CONVERTER_SCHEMAS_ENABLE";
const KEY_VALUE_CONVERTER: &str = "KAFKA_CONNECT_VALUE_CONVERTER";
const KEY_VALUE_CONVERTER_SCHEMAS_ENABLE: &str = "KAFKA_CONNECT_VALUE_CONVERTER_SCHEMAS_ENABLE";
const KEY_CONFIG_STORAGE_REPLICATION_FACTOR: &str =
    "KAFKA_CONNECT_CONFIG_STORAGE_REPLICATION_FACTOR";
const KEY_OFFSET_STORAGE_REPLICATION_FACTOR: &str =
    "KAFKA_CONNECT_OFFSET_STORAGE_REPLICATION_FACTOR";
const KEY_STATUS_STORAGE_REPLICATION_FACTOR: &str =
    "KAFKA_CONNECT_STATUS_STORAGE_REPLICATION_FACTOR";

const DEFAULT_BOOTSTRAP_SERVERS: &str = "my-cluster-kafka:9092";
const DEFAULT_GROUP_ID: &str = "my-connect-cluster";
const DEFAULT_CONVERTER: &str = "org.apache.kafka.connect.json.JsonConverter";

/// Desired state of one Kafka Connect worker cluster
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectCluster {
    pub cluster_type: ClusterType,
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,

    pub replicas: i32,
    pub image: String,
    pub healthcheck_delay: i32,
    pub healthcheck_timeout: i32,

    pub bootstrap_servers: String,
    pub group_id: String,
    pub key_converter: String,
    pub key_converter_schemas_enable: bool,
    pub value_converter: String,
    pub value_converter_schemas_enable: bool,
    pub config_storage_replication_factor: i32,
    pub offset_storage_replication_factor: i32,
    pub status_storage_replication_factor: i32,
}

impl ConnectCluster {
    pub fn decode(
        config_map: &k8s_openapi::api::core::v1::ConfigMap,
        cluster_type: ClusterType,
    ) -> Result<ConnectCluster> {
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

        Ok(ConnectCluster {
            cluster_type,
            name,
            namespace,
            labels,
            replicas: data_int(data, "nodes", 1)?,
            image: data_string(data, "image", DEFAULT_CONNECT_IMAGE),
            healthcheck_delay: data_int(data, "healthcheck-delay", 60)?,
            healthcheck_timeout: data_int(data, "healthcheck-timeout", 5)?,
            bootstrap_servers: data_string(data, KEY_BOOTSTRAP_SERVERS, DEFAULT_BOOTSTRAP_SERVERS),
            group_id: data_string(data, KEY_GROUP_ID, DEFAULT_GROUP_ID),
            key_converter: data_string(data, KEY_KEY_CONVERTER, DEFAULT_CONVERTER),
            key_converter_schemas_enable: data_bool(data, KEY_KEY_CONVERTER_SCHEMAS_ENABLE, true)?,
            value_converter: data_string(data, KEY_VALUE_CONVERTER, DEFAULT_CONVERTER),
            value_converter_schemas_enable: data_bool(
                data,
                KEY_VALUE_CONVERTER_SCHEMAS_ENABLE,
                true,
            )?,
            config_storage_replication_factor: data_int(
                data,
                KEY_CONFIG_STORAGE_REPLICATION_FACTOR,
                3,
            )?,
            offset_storage_replication_factor: data_int(
                data,
                KEY_OFFSET_STORAGE_REPLICATION_FACTOR,
                3,
            )?,
            status_storage_replication_factor: data_int(
                data,
                KEY_STATUS_STORAGE_REPLICATION_FACTOR,
                3,
            )?,
        })
    }

    /// Recover the last-applied state from the Connect Deployment.
    pub fn from_deployment(deployment: &Deployment) -> Result<ConnectCluster> {
        let name = crate::labels::cluster_name(&deployment.metadata).ok_or_else(|| {
            OperatorError::InvalidState(format!(
                "Deployment {} has no cluster label",
                deployment.metadata.name.as_deref().unwrap_or("?")
            ))
        })?;
        let namespace = deployment.metadata.namespace.clone().unwrap_or_default();

        let mut labels = deployment.metadata.labels.clone().unwrap_or_default();
        let cluster_type = labels
            .get(TYPE_LABEL)
            .and_then(|v| ClusterType::from_label(v))
            .unwrap_or(ClusterType::KafkaConnect);
        for owned in [CLUSTER_LABEL, TYPE_LABEL, NAME_LABEL] {
            labels.remove(owned);
        }

        let container = first_container(deployment);
        let env = |key: &str, default: &str| -> String {
            container
                .and_then(|c| c.env.as_ref())
                .and_then(|env| env.iter().find(|e| e.name == key))
                .and_then(|e| e.value.clone())
                .unwrap_or_else(|| default.to_string())
        };
        let env_int = |key: &str, default: i32| -> i32 {
            env(key, "").parse().unwrap_or(default)
        };
        let env_bool = |key: &str, default: bool| -> bool {
            env(key, "").parse().unwrap_or(default)
        };
        let probe = container.and_then(|c| c.liveness_probe.as_ref());

        Ok(ConnectCluster {
            cluster_type,
            name,
            namespace,
            labels,
            replicas: deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0),
            image: container
                .and_then(|c| c.image.clone())
                .unwrap_or_else(|| DEFAULT_CONNECT_IMAGE.to_string()),
            healthcheck_delay: probe.and_then(|p| p.initial_delay_seconds).unwrap_or(60),
            healthcheck_timeout: probe.and_then(|p| p.timeout_seconds).unwrap_or(5),
            bootstrap_servers: env(KEY_BOOTSTRAP_SERVERS, DEFAULT_BOOTSTRAP_SERVERS),
            group_id: env(KEY_GROUP_ID, DEFAULT_GROUP_ID),
            key_converter: env(KEY_KEY_CONVERTER, DEFAULT_CONVERTER),
            key_converter_schemas_enable: env_bool(KEY_KEY_CONVERTER_SCHEMAS_ENABLE, true),
            value_converter: env(KEY_VALUE_CONVERTER, DEFAULT_CONVERTER),
            value_converter_schemas_enable: env_bool(KEY_VALUE_CONVERTER_SCHEMAS_ENABLE, true),
            config_storage_replication_factor: env_int(KEY_CONFIG_STORAGE_REPLICATION_FACTOR, 3),
            offset_storage_replication_factor: env_int(KEY_OFFSET_STORAGE_REPLICATION_FACTOR, 3),
            status_storage_replication_factor: env_int(KEY_STATUS_STORAGE_REPLICATION_FACTOR, 3),
        })
    }

    pub fn diff(&self, desired: &ConnectCluster) -> Result<ClusterDiff> {
        let scale_up = desired.replicas > self.replicas;
        let scale_down = desired.replicas < self.replicas;

        // Pod-template-affecting fields for Connect workers: everything that
        // lands in the container spec or its environment.
        let rolling_update = self.image != desired.image
            || self.healthcheck_delay != desired.healthcheck_delay
            || self.healthcheck_timeout != desired.healthcheck_timeout
            || self.bootstrap_servers != desired.bootstrap_servers
            || self.group_id != desired.group_id
            || self.key_converter != desired.key_converter
            || self.key_converter_schemas_enable != desired.key_converter_schemas_enable
            || self.value_converter != desired.value_converter
            || self.value_converter_schemas_enable != desired.value_converter_schemas_enable
            || self.config_storage_replication_factor != desired.config_storage_replication_factor
            || self.offset_storage_replication_factor != desired.offset_storage_replication_factor
            || self.status_storage_replication_factor != desired.status_storage_replication_factor;

        let different =
            scale_up || scale_down || rolling_update || self.labels != desired.labels;

        Ok(ClusterDiff {
            scale_up,
            scale_down,
            rolling_update,
            metrics_changed: false,
            different,
        })
    }

    pub fn deployment_name(&self) -> String {
        format!("{}-connect", self.name)
    }

    pub fn service_name(&self) -> String {
        format!("{}-connect", self.name)
    }

    pub fn resource_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.labels.clone();
        labels.insert(CLUSTER_LABEL.to_string(), self.name.clone());
        labels.insert(TYPE_LABEL.to_string(), self.cluster_type.as_str().to_string());
        labels
    }

    fn pod_selector(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(CLUSTER_LABEL.to_string(), self.name.clone());
        labels.insert(NAME_LABEL.to_string(), self.deployment_name());
        labels
    }

    pub fn deployment(&self) -> Deployment {
        let selector = self.pod_selector();
        let mut template_labels = self.resource_labels();
        template_labels.extend(selector.clone());

        let env = vec![
            env_var(KEY_BOOTSTRAP_SERVERS, &self.bootstrap_servers),
            env_var(KEY_GROUP_ID, &self.group_id),
            env_var(KEY_KEY_CONVERTER, &self.key_converter),
            env_var(
                KEY_KEY_CONVERTER_SCHEMAS_ENABLE,
                &self.key_converter_schemas_enable.to_string(),
            ),
            env_var(KEY_VALUE_CONVERTER, &self.value_converter),
            env_var(
                KEY_VALUE_CONVERTER_SCHEMAS_ENABLE,
                &self.value_converter_schemas_enable.to_string(),
            ),
            env_var(
                KEY_CONFIG_STORAGE_REPLICATION_FACTOR,
                &self.config_storage_replication_factor.to_string(),
            ),
            env_var(
                KEY_OFFSET_STORAGE_REPLICATION_FACTOR,
                &self.offset_storage_replication_factor.to_string(),
            ),
            env_var(
                KEY_STATUS_STORAGE_REPLICATION_FACTOR,
                &self.status_storage_replication_factor.to_string(),
            ),
        ];

        let probe = Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/".to_string()),
                port: IntOrString::Int(CONNECT_REST_PORT),
                ..Default::default()
            }),
            initial_delay_seconds: Some(self.healthcheck_delay),
            timeout_seconds: Some(self.healthcheck_timeout),
            ..Default::default()
        };

        Deployment {
            metadata: ObjectMeta {
                name: Some(self.deployment_name()),
                namespace: Some(self.namespace.clone()),
                labels: Some(template_labels.clone()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(self.replicas),
                selector: LabelSelector {
                    match_labels: Some(selector),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(template_labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "kafka-connect".to_string(),
                            image: Some(self.image.clone()),
                            ports: Some(vec![ContainerPort {
                                name: Some("rest-api".to_string()),
                                container_port: CONNECT_REST_PORT,
                                ..Default::default()
                            }]),
                            env: Some(env),
                            liveness_probe: Some(probe.clone()),
                            readiness_probe: Some(probe),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn service(&self) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(self.service_name()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.resource_labels()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(self.pod_selector()),
                ports: Some(vec![ServicePort {
                    name: Some("rest-api".to_string()),
                    port: CONNECT_REST_PORT,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn first_container(deployment: &Deployment) -> Option<&Container> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;

    fn config_map(data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("my-connect".to_string()),
                namespace: Some("default".to_string()),
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

    #[test]
    fn test_decode_defaults() {
        let cluster =
            ConnectCluster::decode(&config_map(&[]), ClusterType::KafkaConnect).unwrap();
        assert_eq!(cluster.replicas, 1);
        assert_eq!(cluster.image, DEFAULT_CONNECT_IMAGE);
        assert_eq!(cluster.healthcheck_delay, 60);
        assert_eq!(cluster.healthcheck_timeout, 5);
        assert_eq!(cluster.bootstrap_servers, "my-cluster-kafka:9092");
        assert_eq!(cluster.group_id, "my-connect-cluster");
        assert!(cluster.key_converter_schemas_enable);
        assert_eq!(cluster.config_storage_replication_factor, 3);
    }

    #[test]
    fn test_decode_overrides() {
        let cluster = ConnectCluster::decode(
            &config_map(&[
                ("nodes", "4"),
                ("KAFKA_CONNECT_BOOTSTRAP_SERVERS", "other-kafka:9092"),
                ("KAFKA_CONNECT_KEY_CONVERTER_SCHEMAS_ENABLE", "false"),
            ]),
            ClusterType::KafkaConnectS2i,
        )
        .unwrap();
        assert_eq!(cluster.cluster_type, ClusterType::KafkaConnectS2i);
        assert_eq!(cluster.replicas, 4);
        assert_eq!(cluster.bootstrap_servers, "other-kafka:9092");
        assert!(!cluster.key_converter_schemas_enable);
    }

    #[test]
    fn test_decode_malformed_bool_fails() {
        let err = ConnectCluster::decode(
            &config_map(&[("KAFKA_CONNECT_KEY_CONVERTER_SCHEMAS_ENABLE", "yes")]),
            ClusterType::KafkaConnect,
        )
        .unwrap_err();
        assert!(matches!(err, OperatorError::Decode(_)));
    }

    #[test]
    fn test_deployment_shape() {
        let cluster = ConnectCluster::decode(
            &config_map(&[("nodes", "2"), ("image", "connect:1")]),
            ClusterType::KafkaConnect,
        )
        .unwrap();
        let deployment = cluster.deployment();

        assert_eq!(deployment.metadata.name.as_deref(), Some("my-connect-connect"));
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        let container = &spec.template.spec.unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some("connect:1"));
        let probe = container.readiness_probe.as_ref().unwrap();
        assert_eq!(probe.initial_delay_seconds, Some(60));
        assert!(container
            .env
            .as_ref()
            .unwrap()
            .iter()
            .any(|e| e.name == "KAFKA_CONNECT_GROUP_ID"));

        let labels = deployment.metadata.labels.unwrap();
        assert_eq!(labels.get(TYPE_LABEL).map(String::as_str), Some("kafka-connect"));
        assert_eq!(labels.get(CLUSTER_LABEL).map(String::as_str), Some("my-connect"));
    }

    #[test]
    fn test_deployment_round_trip() {
        let cluster = ConnectCluster::decode(
            &config_map(&[("nodes", "3"), ("KAFKA_CONNECT_GROUP_ID", "workers")]),
            ClusterType::KafkaConnect,
        )
        .unwrap();
        let recovered = ConnectCluster::from_deployment(&cluster.deployment()).unwrap();
        assert_eq!(recovered, cluster);
    }

    #[test]
    fn test_s2i_type_survives_recovery() {
        let cluster =
            ConnectCluster::decode(&config_map(&[]), ClusterType::KafkaConnectS2i).unwrap();
        let recovered = ConnectCluster::from_deployment(&cluster.deployment()).unwrap();
        assert_eq!(recovered.cluster_type, ClusterType::KafkaConnectS2i);
    }

    #[test]
    fn test_diff_rules() {
        let current = ConnectCluster::decode(&config_map(&[]), ClusterType::KafkaConnect).unwrap();
        assert_eq!(current.diff(&current).unwrap(), ClusterDiff::UNCHANGED);

        let mut desired = current.clone();
        desired.replicas = 3;
        let diff = current.diff(&desired).unwrap();
        assert!(diff.scale_up && !diff.rolling_update && diff.different);

        let mut desired = current.clone();
        desired.bootstrap_servers = "new-kafka:9092".to_string();
        let diff = current.diff(&desired).unwrap();
        assert!(diff.rolling_update);
        assert!(!diff.metrics_changed);
    }
}
