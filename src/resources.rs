//! Resource client adapter.
//!
//! One thin capability surface per Kubernetes resource kind, generic over
//! the typed resource. `reconcile` is the canonical create-or-update-or-
//! delete primitive every composite operation is built from:
//!
//! - desired absent, resource exists: delete it (idempotent on repeat)
//! - desired present, resource absent: create
//! - both present: patch via server-side apply

use crate::error::Result;
use crate::labels::FIELD_MANAGER;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::{debug, info};

pub struct ResourceAdapter<K> {
    api: Api<K>,
    kind: String,
}

impl<K> ResourceAdapter<K>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
    K::DynamicType: Default,
{
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            kind: K::kind(&K::DynamicType::default()).into_owned(),
        }
    }

    /// Get a resource by name, mapping 404 to `None`.
    pub async fn get(&self, name: &str) -> Result<Option<K>> {
        match self.api.get(name).await {
            Ok(resource) => Ok(Some(resource)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List all resources in the namespace matching every label pair.
    /// Order is unspecified.
    pub async fn list(&self, labels: &BTreeMap<String, String>) -> Result<Vec<K>> {
        let params = ListParams::default().labels(&crate::labels::selector(labels));
        Ok(self.api.list(&params).await?.items)
    }

    pub async fn create(&self, desired: &K) -> Result<()> {
        self.api.create(&PostParams::default(), desired).await?;
        info!("created {} {}", self.kind, name_of(desired));
        Ok(())
    }

    pub async fn patch(&self, name: &str, desired: &K) -> Result<()> {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.api.patch(name, &params, &Patch::Apply(desired)).await?;
        debug!("patched {} {}", self.kind, name);
        Ok(())
    }

    /// Delete by name; a missing resource is success.
    pub async fn delete(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!("deleted {} {}", self.kind, name);
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Bring the named resource to the desired state.
    pub async fn reconcile(&self, name: &str, desired: Option<&K>) -> Result<()> {
        match desired {
            None => self.delete(name).await,
            Some(desired) => match self.get(name).await? {
                Some(_) => self.patch(name, desired).await,
                None => match self.create(desired).await {
                    // Lost a create race; the object exists now, so patch it.
                    Err(crate::error::OperatorError::Kube(kube::Error::Api(ae)))
                        if ae.code == 409 =>
                    {
                        self.patch(name, desired).await
                    }
                    other => other,
                },
            },
        }
    }
}

fn name_of<K: Resource>(resource: &K) -> String {
    resource.meta().name.clone().unwrap_or_else(|| "<unnamed>".to_string())
}
