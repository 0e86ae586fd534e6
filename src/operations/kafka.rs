//! Composite operations for Kafka clusters.
//!
//! Create brings up the services first so broker and Zookeeper pods resolve
//! their peers the moment they start, then the Zookeeper StatefulSet, then
//! the Kafka StatefulSet. Delete walks the same plan in reverse. Update
//! applies metrics ConfigMaps and Services, and only patches the
//! StatefulSets when the diff actually requires a workload change.

use crate::cluster::{
    ClusterDiff, ClusterOperation, ClusterSpec, ClusterType, KafkaCluster, OperationType,
    StorageSpec,
};
use crate::error::{OperatorError, Result};
use crate::operations::CompositeOperation;
use crate::resources::ResourceAdapter;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Service};
use kube::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

const SCALE_DOWN_POLL: Duration = Duration::from_secs(5);
const SCALE_DOWN_ATTEMPTS: u32 = 60;

/// Create, update, or delete composite for a Kafka cluster.
pub struct KafkaComposite {
    client: Client,
    operation: OperationType,
}

impl KafkaComposite {
    pub fn new(client: Client, operation: OperationType) -> Self {
        Self { client, operation }
    }

    fn services(&self, namespace: &str) -> ResourceAdapter<Service> {
        ResourceAdapter::new(self.client.clone(), namespace)
    }

    fn config_maps(&self, namespace: &str) -> ResourceAdapter<ConfigMap> {
        ResourceAdapter::new(self.client.clone(), namespace)
    }

    fn statefulsets(&self, namespace: &str) -> ResourceAdapter<StatefulSet> {
        ResourceAdapter::new(self.client.clone(), namespace)
    }

    fn claims(&self, namespace: &str) -> ResourceAdapter<PersistentVolumeClaim> {
        ResourceAdapter::new(self.client.clone(), namespace)
    }

    async fn create(&self, namespace: &str, cluster: &KafkaCluster) -> Result<()> {
        let services = self.services(namespace);
        let config_maps = self.config_maps(namespace);
        let statefulsets = self.statefulsets(namespace);

        services
            .reconcile(&cluster.kafka_headless_service_name(), Some(&cluster.kafka_headless_service()))
            .await?;
        services
            .reconcile(
                &cluster.zookeeper_headless_service_name(),
                Some(&cluster.zookeeper_headless_service()),
            )
            .await?;
        services
            .reconcile(&cluster.kafka_service_name(), Some(&cluster.kafka_service()))
            .await?;
        services
            .reconcile(&cluster.zookeeper_service_name(), Some(&cluster.zookeeper_service()))
            .await?;

        if let Some(metrics) = cluster.kafka_metrics_configmap() {
            config_maps
                .reconcile(&cluster.kafka_metrics_configmap_name(), Some(&metrics))
                .await?;
        }
        if let Some(metrics) = cluster.zookeeper_metrics_configmap() {
            config_maps
                .reconcile(&cluster.zookeeper_metrics_configmap_name(), Some(&metrics))
                .await?;
        }

        statefulsets
            .reconcile(&cluster.zookeeper_statefulset_name(), Some(&cluster.zookeeper_statefulset()))
            .await?;
        statefulsets
            .reconcile(&cluster.kafka_statefulset_name(), Some(&cluster.kafka_statefulset()))
            .await?;

        Ok(())
    }

    async fn update(
        &self,
        namespace: &str,
        operation: &ClusterOperation,
        cluster: &KafkaCluster,
    ) -> Result<()> {
        let diff = operation.diff.unwrap_or(ClusterDiff::UNCHANGED);
        if !diff.different {
            debug!("cluster {} is up to date", cluster.name);
            return Ok(());
        }

        let config_maps = self.config_maps(namespace);
        config_maps
            .reconcile(
                &cluster.kafka_metrics_configmap_name(),
                cluster.kafka_metrics_configmap().as_ref(),
            )
            .await?;
        config_maps
            .reconcile(
                &cluster.zookeeper_metrics_configmap_name(),
                cluster.zookeeper_metrics_configmap().as_ref(),
            )
            .await?;

        let services = self.services(namespace);
        services
            .reconcile(&cluster.kafka_headless_service_name(), Some(&cluster.kafka_headless_service()))
            .await?;
        services
            .reconcile(
                &cluster.zookeeper_headless_service_name(),
                Some(&cluster.zookeeper_headless_service()),
            )
            .await?;
        services
            .reconcile(&cluster.kafka_service_name(), Some(&cluster.kafka_service()))
            .await?;
        services
            .reconcile(&cluster.zookeeper_service_name(), Some(&cluster.zookeeper_service()))
            .await?;

        // A metrics-only change stops here: no StatefulSet patch, no roll.
        if !diff.needs_workload_patch() {
            return Ok(());
        }

        let statefulsets = self.statefulsets(namespace);
        statefulsets
            .reconcile(&cluster.zookeeper_statefulset_name(), Some(&cluster.zookeeper_statefulset()))
            .await?;
        statefulsets
            .reconcile(&cluster.kafka_statefulset_name(), Some(&cluster.kafka_statefulset()))
            .await?;

        if diff.scale_down {
            self.delete_vacated_claims(namespace, operation, cluster).await?;
        }

        Ok(())
    }

    async fn delete(&self, namespace: &str, cluster: &KafkaCluster) -> Result<()> {
        let statefulsets = self.statefulsets(namespace);
        statefulsets.reconcile(&cluster.kafka_statefulset_name(), None).await?;
        statefulsets.reconcile(&cluster.zookeeper_statefulset_name(), None).await?;

        let config_maps = self.config_maps(namespace);
        config_maps.reconcile(&cluster.kafka_metrics_configmap_name(), None).await?;
        config_maps.reconcile(&cluster.zookeeper_metrics_configmap_name(), None).await?;

        let services = self.services(namespace);
        services.reconcile(&cluster.zookeeper_service_name(), None).await?;
        services.reconcile(&cluster.kafka_service_name(), None).await?;
        services.reconcile(&cluster.zookeeper_headless_service_name(), None).await?;
        services.reconcile(&cluster.kafka_headless_service_name(), None).await?;

        let claims = self.claims(namespace);
        if cluster.storage.delete_claim() {
            for i in 0..cluster.replicas {
                claims.reconcile(&cluster.kafka_claim_name(i), None).await?;
            }
        }
        if cluster.zookeeper_storage.delete_claim() {
            for i in 0..cluster.zookeeper_replicas {
                claims.reconcile(&cluster.zookeeper_claim_name(i), None).await?;
            }
        }

        Ok(())
    }

    /// After a scale-down, wait for the StatefulSets to shed the vacated
    /// pods, then delete their claims if the storage asks for it.
    async fn delete_vacated_claims(
        &self,
        namespace: &str,
        operation: &ClusterOperation,
        cluster: &KafkaCluster,
    ) -> Result<()> {
        let previous = match &operation.current {
            Some(ClusterSpec::Kafka(previous)) => previous,
            _ => return Ok(()),
        };
        let statefulsets = self.statefulsets(namespace);
        let claims = self.claims(namespace);

        if cluster.storage.delete_claim() && previous.replicas > cluster.replicas {
            self.await_replica_convergence(
                &statefulsets,
                &cluster.kafka_statefulset_name(),
                cluster.replicas,
            )
            .await?;
            for i in cluster.replicas..previous.replicas {
                let claim = cluster.kafka_claim_name(i);
                info!("deleting vacated claim {}", claim);
                claims.reconcile(&claim, None).await?;
            }
        }

        if cluster.zookeeper_storage.delete_claim()
            && previous.zookeeper_replicas > cluster.zookeeper_replicas
        {
            self.await_replica_convergence(
                &statefulsets,
                &cluster.zookeeper_statefulset_name(),
                cluster.zookeeper_replicas,
            )
            .await?;
            for i in cluster.zookeeper_replicas..previous.zookeeper_replicas {
                let claim = cluster.zookeeper_claim_name(i);
                info!("deleting vacated claim {}", claim);
                claims.reconcile(&claim, None).await?;
            }
        }

        Ok(())
    }

    async fn await_replica_convergence(
        &self,
        statefulsets: &ResourceAdapter<StatefulSet>,
        name: &str,
        replicas: i32,
    ) -> Result<()> {
        for _ in 0..SCALE_DOWN_ATTEMPTS {
            match statefulsets.get(name).await? {
                None => return Ok(()),
                Some(sts) => {
                    let observed = sts.status.map(|s| s.replicas).unwrap_or(0);
                    if observed <= replicas {
                        return Ok(());
                    }
                }
            }
            tokio::time::sleep(SCALE_DOWN_POLL).await;
        }
        Err(OperatorError::InvalidState(format!(
            "statefulset {} did not converge to {} replicas",
            name, replicas
        )))
    }
}

#[async_trait]
impl CompositeOperation for KafkaComposite {
    fn cluster_type(&self) -> ClusterType {
        ClusterType::Kafka
    }

    fn operation_type(&self) -> OperationType {
        self.operation
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<ClusterOperation> {
        match self.operation {
            OperationType::Create => {
                let desired = self.decode_config(namespace, name).await?;
                Ok(ClusterOperation::new(ClusterSpec::Kafka(desired)))
            }
            OperationType::Update => {
                let desired = self.decode_config(namespace, name).await?;
                let statefulsets = self.statefulsets(namespace);
                let kafka = statefulsets
                    .get(&desired.kafka_statefulset_name())
                    .await?
                    .ok_or_else(|| {
                        OperatorError::InvalidState(format!(
                            "no Kafka StatefulSet for cluster {}/{}",
                            namespace, name
                        ))
                    })?;
                let zookeeper = statefulsets.get(&desired.zookeeper_statefulset_name()).await?;
                let current = KafkaCluster::from_statefulsets(&kafka, zookeeper.as_ref())?;
                let diff = current.diff(&desired)?;
                Ok(ClusterOperation::with_diff(
                    ClusterSpec::Kafka(desired),
                    ClusterSpec::Kafka(current),
                    diff,
                ))
            }
            OperationType::Delete => {
                let statefulsets = self.statefulsets(namespace);
                let kafka = statefulsets.get(&format!("{}-kafka", name)).await?;
                let cluster = match kafka {
                    Some(kafka) => {
                        let zookeeper = statefulsets.get(&format!("{}-zookeeper", name)).await?;
                        KafkaCluster::from_statefulsets(&kafka, zookeeper.as_ref())?
                    }
                    // Already gone; a vacant model keeps repeated deletes
                    // succeeding against the remaining resources.
                    None => vacant_cluster(namespace, name),
                };
                Ok(ClusterOperation::new(ClusterSpec::Kafka(cluster)))
            }
        }
    }

    async fn composite(&self, namespace: &str, operation: &ClusterOperation) -> Result<()> {
        let cluster = match &operation.cluster {
            ClusterSpec::Kafka(cluster) => cluster,
            other => {
                return Err(OperatorError::InvalidState(format!(
                    "Kafka composite dispatched for {} cluster {}",
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

impl KafkaComposite {
    async fn decode_config(&self, namespace: &str, name: &str) -> Result<KafkaCluster> {
        let config_map = self
            .config_maps(namespace)
            .get(name)
            .await?
            .ok_or_else(|| {
                OperatorError::Decode(format!(
                    "cluster ConfigMap {}/{} not found",
                    namespace, name
                ))
            })?;
        KafkaCluster::decode(&config_map)
    }
}

fn vacant_cluster(namespace: &str, name: &str) -> KafkaCluster {
    KafkaCluster {
        name: name.to_string(),
        namespace: namespace.to_string(),
        labels: BTreeMap::new(),
        replicas: 0,
        image: String::new(),
        healthcheck_delay: 0,
        healthcheck_timeout: 0,
        zookeeper_replicas: 0,
        zookeeper_image: String::new(),
        zookeeper_healthcheck_delay: 0,
        zookeeper_healthcheck_timeout: 0,
        default_replication_factor: 0,
        offsets_topic_replication_factor: 0,
        transaction_state_log_replication_factor: 0,
        storage: StorageSpec::Ephemeral,
        zookeeper_storage: StorageSpec::Ephemeral,
        metrics_config: None,
        zookeeper_metrics_config: None,
    }
}
