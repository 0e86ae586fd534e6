//! Composite operations for Kafka Connect clusters.
//!
//! Create brings up the worker Deployment and then the REST Service;
//! delete walks the plan in reverse. The same composite serves
//! `kafka-connect` and `kafka-connect-s2i`, which differ only in their
//! type label and lock keyspace.

use crate::cluster::{
    ClusterDiff, ClusterOperation, ClusterSpec, ClusterType, ConnectCluster, OperationType,
};
use crate::error::{OperatorError, Result};
use crate::operations::CompositeOperation;
use crate::resources::ResourceAdapter;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::Client;
use std::collections::BTreeMap;
use tracing::debug;

/// Create, update, or delete composite for a Connect cluster.
pub struct ConnectComposite {
    client: Client,
    cluster_type: ClusterType,
    operation: OperationType,
}

impl ConnectComposite {
    pub fn new(client: Client, cluster_type: ClusterType, operation: OperationType) -> Self {
        Self {
            client,
            cluster_type,
            operation,
        }
    }

    fn deployments(&self, namespace: &str) -> ResourceAdapter<Deployment> {
        ResourceAdapter::new(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> ResourceAdapter<Service> {
        ResourceAdapter::new(self.client.clone(), namespace)
    }

    async fn create(&self, namespace: &str, cluster: &ConnectCluster) -> Result<()> {
        self.deployments(namespace)
            .reconcile(&cluster.deployment_name(), Some(&cluster.deployment()))
            .await?;
        self.services(namespace)
            .reconcile(&cluster.service_name(), Some(&cluster.service()))
            .await?;
        Ok(())
    }

    async fn update(
        &self,
        namespace: &str,
        operation: &ClusterOperation,
        cluster: &ConnectCluster,
    ) -> Result<()> {
        let diff = operation.diff.unwrap_or(ClusterDiff::UNCHANGED);
        if !diff.different {
            debug!("cluster {} is up to date", cluster.name);
            return Ok(());
        }

        self.services(namespace)
            .reconcile(&cluster.service_name(), Some(&cluster.service()))
            .await?;

        if diff.needs_workload_patch() {
            self.deployments(namespace)
                .reconcile(&cluster.deployment_name(), Some(&cluster.deployment()))
                .await?;
        }
        Ok(())
    }

    async fn delete(&self, namespace: &str, cluster: &ConnectCluster) -> Result<()> {
        self.services(namespace)
            .reconcile(&cluster.service_name(), None)
            .await?;
        self.deployments(namespace)
            .reconcile(&cluster.deployment_name(), None)
            .await?;
        Ok(())
    }

    async fn decode_config(&self, namespace: &str, name: &str) -> Result<ConnectCluster> {
        let config_map = ResourceAdapter::<ConfigMap>::new(self.client.clone(), namespace)
            .get(name)
            .await?
            .ok_or_else(|| {
                OperatorError::Decode(format!(
                    "cluster ConfigMap {}/{} not found",
                    namespace, name
                ))
            })?;
        ConnectCluster::decode(&config_map, self.cluster_type)
    }
}

fn wrap(cluster: ConnectCluster) -> ClusterSpec {
    match cluster.cluster_type {
        ClusterType::KafkaConnectS2i => ClusterSpec::ConnectS2i(cluster),
        _ => ClusterSpec::Connect(cluster),
    }
}

#[async_trait]
impl CompositeOperation for ConnectComposite {
    fn cluster_type(&self) -> ClusterType {
        self.cluster_type
    }

    fn operation_type(&self) -> OperationType {
        self.operation
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<ClusterOperation> {
        match self.operation {
            OperationType::Create => {
                let desired = self.decode_config(namespace, name).await?;
                Ok(ClusterOperation::new(wrap(desired)))
            }
            OperationType::Update => {
                let desired = self.decode_config(namespace, name).await?;
                let deployment = self
                    .deployments(namespace)
                    .get(&desired.deployment_name())
                    .await?
                    .ok_or_else(|| {
                        OperatorError::InvalidState(format!(
                            "no Deployment for cluster {}/{}",
                            namespace, name
                        ))
                    })?;
                let current = ConnectCluster::from_deployment(&deployment)?;
                let diff = current.diff(&desired)?;
                Ok(ClusterOperation::with_diff(wrap(desired), wrap(current), diff))
            }
            OperationType::Delete => {
                let deployment = self
                    .deployments(namespace)
                    .get(&format!("{}-connect", name))
                    .await?;
                let cluster = match deployment {
                    Some(deployment) => ConnectCluster::from_deployment(&deployment)?,
                    None => vacant_cluster(self.cluster_type, namespace, name),
                };
                Ok(ClusterOperation::new(wrap(cluster)))
            }
        }
    }

    async fn composite(&self, namespace: &str, operation: &ClusterOperation) -> Result<()> {
        let cluster = match &operation.cluster {
            ClusterSpec::Connect(cluster) | ClusterSpec::ConnectS2i(cluster) => cluster,
            other => {
                return Err(OperatorError::InvalidState(format!(
                    "Connect composite dispatched for {} cluster {}",
                    other.cluster_type(),
                    other.name()
                )))
            }
        };
        match self.operation {
            OperationType::Create => self.create(namespace, cluster).await,
            OperationType::Update => self.update(namespace, operation, cluster).await,
            OperationType::Delete => self.delete(namespace, cluster).await,
        }
    }
}

fn vacant_cluster(cluster_type: ClusterType, namespace: &str, name: &str) -> ConnectCluster {
    ConnectCluster {
        cluster_type,
        name: name.to_string(),
        namespace: namespace.to_string(),
        labels: BTreeMap::new(),
        replicas: 0,
        image: String::new(),
        healthcheck_delay: 0,
        healthcheck_timeout: 0,
        bootstrap_servers: String::new(),
        group_id: String::new(),
        key_converter: String::new(),
        key_converter_schemas_enable: false,
        value_converter: String::new(),
        value_converter_schemas_enable: false,
        config_storage_replication_factor: 0,
        offset_storage_replication_factor: 0,
        status_storage_replication_factor: 0,
    }
}
