//! Lease-based leader election for HA operator deployments.
//!
//! The keyed per-cluster lock serializes work inside one process; when
//! several operator replicas run, a `coordination.k8s.io/v1` Lease makes
//! sure only one of them drives the reconciliation engine. Standby
//! replicas block in [`LeaderElector::acquire`] until the current leader's
//! lease expires.

use crate::error::Result;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

const LEASE_NAME: &str = "kafka-cluster-operator-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Detects the namespace for the leader election Lease.
///
/// Priority: explicit argument, then the service account file, then
/// `"default"`.
pub fn detect_namespace(explicit: &str) -> String {
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/namespace")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "default".to_string())
}

/// Holds and renews the operator leader Lease.
pub struct LeaderElector {
    lease_api: Api<Lease>,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str) -> Self {
        let lease_api = Api::<Lease>::namespaced(client, namespace);
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("operator-{:08x}", rand::random::<u32>()));
        info!(identity = %identity, namespace = %namespace, "initialized leader elector");
        Self { lease_api, identity }
    }

    /// Blocks until the lease is successfully acquired.
    pub async fn acquire(&self) -> Result<()> {
        info!(identity = %self.identity, "waiting to acquire leader lease '{}'", LEASE_NAME);
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!(identity = %self.identity, "acquired leader lease");
                    return Ok(());
                }
                Ok(false) => {
                    debug!("lease held by another instance, retrying in {:?}", RETRY_INTERVAL);
                }
                Err(e) => {
                    warn!("lease acquisition error: {}, retrying in {:?}", e, RETRY_INTERVAL);
                }
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// Renews the lease. Returns `Ok(true)` if still leader, `Ok(false)` if
    /// leadership was lost.
    pub async fn renew(&self) -> Result<bool> {
        let lease = self.lease_api.get(LEASE_NAME).await?;
        if holder_of(&lease).as_deref() != Some(self.identity.as_str()) {
            return Ok(false);
        }

        let mut updated = lease.clone();
        if let Some(spec) = updated.spec.as_mut() {
            spec.renew_time = Some(MicroTime(Utc::now()));
        }
        match self
            .lease_api
            .replace(LEASE_NAME, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                warn!("lease conflict during renewal, lost leadership");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Releases the lease by clearing the holder identity so a standby
    /// replica can take over immediately.
    pub async fn release(&self) {
        let lease = match self.lease_api.get(LEASE_NAME).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!("failed to read lease for release: {}", e);
                return;
            }
        };
        if holder_of(&lease).as_deref() != Some(self.identity.as_str()) {
            debug!("lease not held by us, skipping release");
            return;
        }

        let mut updated = lease.clone();
        if let Some(spec) = updated.spec.as_mut() {
            spec.holder_identity = None;
        }
        match self
            .lease_api
            .replace(LEASE_NAME, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => info!("released leader lease"),
            Err(e) => warn!("failed to release leader lease: {}", e),
        }
    }

    pub fn renew_interval(&self) -> Duration {
        RENEW_INTERVAL
    }

    async fn try_acquire(&self) -> Result<bool> {
        let now = MicroTime(Utc::now());

        let existing = match self.lease_api.get(LEASE_NAME).await {
            Ok(existing) => existing,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return self.create_lease(&now).await;
            }
            Err(e) => return Err(e.into()),
        };

        if holder_of(&existing).as_deref() == Some(self.identity.as_str()) {
            self.update_lease(&existing, &now, false).await
        } else if is_expired(existing.spec.as_ref()) {
            self.update_lease(&existing, &now, true).await
        } else {
            Ok(false)
        }
    }

    async fn create_lease(&self, now: &MicroTime) -> Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION_SECS),
                acquire_time: Some(now.clone()),
                renew_time: Some(now.clone()),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };
        match self.lease_api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_lease(&self, existing: &Lease, now: &MicroTime, takeover: bool) -> Result<bool> {
        let prev = existing.spec.as_ref();
        let transitions = prev.and_then(|s| s.lease_transitions).unwrap_or(0);

        let mut updated = existing.clone();
        updated.spec = Some(LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_DURATION_SECS),
            acquire_time: if takeover {
                Some(now.clone())
            } else {
                prev.and_then(|s| s.acquire_time.clone())
            },
            renew_time: Some(now.clone()),
            lease_transitions: Some(if takeover { transitions + 1 } else { transitions }),
            ..Default::default()
        });

        match self
            .lease_api
            .replace(LEASE_NAME, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn holder_of(lease: &Lease) -> Option<String> {
    lease.spec.as_ref()?.holder_identity.clone()
}

fn is_expired(spec: Option<&LeaseSpec>) -> bool {
    let duration_secs = spec
        .and_then(|s| s.lease_duration_seconds)
        .unwrap_or(LEASE_DURATION_SECS) as i64;
    match spec.and_then(|s| s.renew_time.as_ref()) {
        Some(MicroTime(t)) => Utc::now().signed_duration_since(*t).num_seconds() > duration_secs,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_expiry() {
        assert!(is_expired(None));

        let fresh = LeaseSpec {
            renew_time: Some(MicroTime(Utc::now())),
            lease_duration_seconds: Some(15),
            ..Default::default()
        };
        assert!(!is_expired(Some(&fresh)));

        let stale = LeaseSpec {
            renew_time: Some(MicroTime(Utc::now() - chrono::Duration::seconds(60))),
            lease_duration_seconds: Some(15),
            ..Default::default()
        };
        assert!(is_expired(Some(&stale)));
    }
}
