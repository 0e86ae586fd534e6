//! Reconciliation engine.
//!
//! Two triggers feed the engine: label-selected watch notifications on
//! cluster ConfigMaps, and a periodic full sweep. Both funnel into the same
//! per-key worker, which classifies the cluster's live state into a create,
//! update, or delete operation and runs it through the serialized executor.
//!
//! Event handlers never block: a notification only marks the cluster key as
//! needing work. One worker runs per key at a time, with a single pending
//! token so bursts collapse into at most one rerun that re-reads the latest
//! state.

use crate::cluster::{ClusterKey, ClusterType, OperationType};
use crate::config::OperatorConfig;
use crate::error::Result;
use crate::health::HealthState;
use crate::labels::{self, TYPE_LABEL};
use crate::lock::LockManager;
use crate::operations::{ConnectComposite, Executor, KafkaComposite};
use crate::resources::ResourceAdapter;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::Api;
use kube::runtime::watcher;
use kube::Client;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Clones share the engine's lock table, pending tokens, and worker set.
#[derive(Clone)]
pub struct ReconciliationEngine {
    client: Client,
    config: OperatorConfig,
    executor: Executor,
    health: Arc<HealthState>,
    /// Cluster keys with a running worker; the flag is the pending token,
    /// set when new work arrived while the worker was busy.
    pending: Arc<Mutex<HashMap<ClusterKey, bool>>>,
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl ReconciliationEngine {
    pub fn new(client: Client, config: OperatorConfig, health: Arc<HealthState>) -> Self {
        let executor = Executor::new(LockManager::new(), config.lock_timeout);
        Self {
            client,
            config,
            executor,
            health,
            pending: Arc::new(Mutex::new(HashMap::new())),
            tasks: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    /// Run the engine until cancelled.
    pub async fn run(&self) -> Result<()> {
        info!(
            namespace = %self.config.namespace,
            selector = %labels::selector(&self.config.labels),
            interval = ?self.config.full_reconciliation_interval,
            "starting reconciliation engine"
        );
        tokio::try_join!(self.watch_config_maps(), self.sweep_loop())?;
        Ok(())
    }

    /// Let in-flight cluster operations finish. Called after `run` has been
    /// cancelled, so no new work arrives while draining.
    pub async fn drain(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            info!("draining {} in-flight cluster operations", tasks.len());
        }
        while tasks.join_next().await.is_some() {}
    }

    async fn watch_config_maps(&self) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let selector = labels::selector(&self.config.labels);
        let stream = watcher(api, watcher::Config::default().labels(&selector));
        futures::pin_mut!(stream);

        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Apply(cm))
                | Ok(watcher::Event::Delete(cm))
                | Ok(watcher::Event::InitApply(cm)) => self.observe(&cm).await,
                Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => {}
                Err(e) => warn!("cluster ConfigMap watch interrupted: {}", e),
            }
        }
        Ok(())
    }

    /// Classify a watch notification into a cluster key and mark it.
    async fn observe(&self, config_map: &ConfigMap) {
        let name = match &config_map.metadata.name {
            Some(name) => name.clone(),
            None => return,
        };
        let cluster_type = match config_map
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(TYPE_LABEL))
            .and_then(|v| ClusterType::from_label(v))
        {
            Some(cluster_type) => cluster_type,
            None => {
                warn!(
                    "ignoring cluster ConfigMap {} without a recognized {} label",
                    name, TYPE_LABEL
                );
                return;
            }
        };
        self.schedule(ClusterKey::new(cluster_type, &self.config.namespace, &name))
            .await;
    }

    /// Mark a cluster key as needing work. If a worker is already running
    /// for the key, set its pending token instead of queuing more work.
    async fn schedule(&self, key: ClusterKey) {
        {
            let mut pending = self.pending.lock().await;
            if let Some(dirty) = pending.get_mut(&key) {
                *dirty = true;
                return;
            }
            pending.insert(key.clone(), false);
        }
        let engine = self.clone();
        self.tasks.lock().await.spawn(async move {
            engine.worker(key).await;
        });
    }

    /// Per-key worker: classify against live state, run the operation, and
    /// rerun once if new work arrived meanwhile.
    async fn worker(self, key: ClusterKey) {
        loop {
            match self.classify(&key).await {
                Ok(Some(operation)) => {
                    // Success and failure are both logged by the executor;
                    // non-transient failures wait for the user to edit the
                    // cluster ConfigMap, transient ones for the next sweep.
                    let _ = self.run_operation(&key, operation).await;
                }
                Ok(None) => debug!("{}: nothing to reconcile", key),
                Err(e) => warn!("could not classify work for {}: {}", key, e),
            }

            let rerun = {
                let mut pending = self.pending.lock().await;
                match pending.get_mut(&key) {
                    Some(dirty) if *dirty => {
                        *dirty = false;
                        true
                    }
                    _ => {
                        pending.remove(&key);
                        false
                    }
                }
            };
            if !rerun {
                break;
            }
        }
    }

    /// Join the cluster ConfigMap with the representative resource to
    /// decide which operation the cluster needs.
    async fn classify(&self, key: &ClusterKey) -> Result<Option<OperationType>> {
        let config_maps =
            ResourceAdapter::<ConfigMap>::new(self.client.clone(), &key.namespace);
        let config = config_maps
            .get(&key.name)
            .await?
            .filter(|cm| labels_match(&cm.metadata, &self.config.labels, key.cluster_type));
        let resource = self.representative_exists(key).await?;

        Ok(match (config.is_some(), resource) {
            (true, false) => Some(OperationType::Create),
            (true, true) => Some(OperationType::Update),
            (false, true) => Some(OperationType::Delete),
            (false, false) => None,
        })
    }

    async fn representative_exists(&self, key: &ClusterKey) -> Result<bool> {
        match key.cluster_type {
            ClusterType::Kafka => {
                let statefulsets =
                    ResourceAdapter::<StatefulSet>::new(self.client.clone(), &key.namespace);
                Ok(statefulsets
                    .get(&format!("{}-kafka", key.name))
                    .await?
                    .is_some_and(|sts| type_label_is(&sts.metadata, key.cluster_type)))
            }
            ClusterType::KafkaConnect | ClusterType::KafkaConnectS2i => {
                let deployments =
                    ResourceAdapter::<Deployment>::new(self.client.clone(), &key.namespace);
                Ok(deployments
                    .get(&format!("{}-connect", key.name))
                    .await?
                    .is_some_and(|dep| type_label_is(&dep.metadata, key.cluster_type)))
            }
        }
    }

    async fn run_operation(&self, key: &ClusterKey, operation: OperationType) -> Result<()> {
        match key.cluster_type {
            ClusterType::Kafka => {
                let composite = KafkaComposite::new(self.client.clone(), operation);
                self.executor.execute(&key.namespace, &key.name, &composite).await
            }
            cluster_type => {
                let composite =
                    ConnectComposite::new(self.client.clone(), cluster_type, operation);
                self.executor.execute(&key.namespace, &key.name, &composite).await
            }
        }
    }

    async fn sweep_loop(&self) -> Result<()> {
        let mut interval = tokio::time::interval(self.config.full_reconciliation_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match self.sweep().await {
                Ok(()) => self.health.record_sweep_success(),
                Err(e) => error!("full reconciliation sweep failed: {}", e),
            }
            self.executor.locks().prune().await;
            self.reap_finished_workers().await;
        }
    }

    /// Enumerate cluster ConfigMaps and representative resources per
    /// cluster type, partition them by name, and mark every cluster that
    /// needs a create, update check, or delete.
    async fn sweep(&self) -> Result<()> {
        debug!("reconciling clusters in namespace {}", self.config.namespace);
        for cluster_type in ClusterType::ALL {
            let mut selector = self.config.labels.clone();
            selector.insert(TYPE_LABEL.to_string(), cluster_type.as_str().to_string());

            let config_maps =
                ResourceAdapter::<ConfigMap>::new(self.client.clone(), &self.config.namespace);
            let configs: BTreeSet<String> = config_maps
                .list(&selector)
                .await?
                .iter()
                .filter_map(|cm| cm.metadata.name.clone())
                .collect();

            let resources: BTreeSet<String> = match cluster_type {
                ClusterType::Kafka => {
                    let statefulsets = ResourceAdapter::<StatefulSet>::new(
                        self.client.clone(),
                        &self.config.namespace,
                    );
                    statefulsets
                        .list(&selector)
                        .await?
                        .iter()
                        .filter_map(|sts| representative_name(&sts.metadata, "kafka"))
                        .collect()
                }
                ClusterType::KafkaConnect | ClusterType::KafkaConnectS2i => {
                    let deployments = ResourceAdapter::<Deployment>::new(
                        self.client.clone(),
                        &self.config.namespace,
                    );
                    deployments
                        .list(&selector)
                        .await?
                        .iter()
                        .filter_map(|dep| representative_name(&dep.metadata, "connect"))
                        .collect()
                }
            };

            let partition = partition(&configs, &resources);
            for name in &partition.add {
                info!("reconciliation: {} cluster {} should be added", cluster_type, name);
            }
            for name in &partition.update {
                info!(
                    "reconciliation: {} cluster {} should be checked for updates",
                    cluster_type, name
                );
            }
            for name in &partition.delete {
                info!("reconciliation: {} cluster {} should be deleted", cluster_type, name);
            }
            for name in partition.into_names() {
                self.schedule(ClusterKey::new(cluster_type, &self.config.namespace, &name))
                    .await;
            }
        }
        Ok(())
    }

    async fn reap_finished_workers(&self) {
        use futures::FutureExt;
        let mut tasks = self.tasks.lock().await;
        while let Some(Some(_)) = tasks.join_next().now_or_never() {}
    }
}

/// The add/update/delete partition of one sweep for one cluster type.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Partition {
    pub add: Vec<String>,
    pub update: Vec<String>,
    pub delete: Vec<String>,
}

impl Partition {
    fn into_names(self) -> impl Iterator<Item = String> {
        self.add.into_iter().chain(self.update).chain(self.delete)
    }
}

/// Join configs and resources by cluster name:
/// configs without resources are added, configs with resources are checked
/// for updates, resources without configs are deleted.
pub(crate) fn partition(configs: &BTreeSet<String>, resources: &BTreeSet<String>) -> Partition {
    Partition {
        add: configs.difference(resources).cloned().collect(),
        update: configs.intersection(resources).cloned().collect(),
        delete: resources.difference(configs).cloned().collect(),
    }
}

/// The cluster name a workload represents, provided it is the cluster's
/// representative resource (the one whose name is `<cluster>-<suffix>`).
fn representative_name(meta: &ObjectMeta, suffix: &str) -> Option<String> {
    let cluster = labels::cluster_name(meta)?;
    (meta.name.as_deref() == Some(format!("{}-{}", cluster, suffix).as_str())).then_some(cluster)
}

fn labels_match(
    meta: &ObjectMeta,
    selector: &BTreeMap<String, String>,
    cluster_type: ClusterType,
) -> bool {
    let Some(labels) = meta.labels.as_ref() else {
        return false;
    };
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
        && type_label_is(meta, cluster_type)
}

fn type_label_is(meta: &ObjectMeta, cluster_type: ClusterType) -> bool {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(TYPE_LABEL))
        .map(String::as_str)
        == Some(cluster_type.as_str())
}
