//! Operator process configuration.
//!
//! Values arrive through the environment (`CONFIGMAP_LABELS`, `NAMESPACE`,
//! `FULL_RECONCILIATION_INTERVAL`) or command-line flags; `main` feeds them
//! into [`OperatorConfig::from_parts`] which validates everything up front
//! so a bad environment fails the process at startup.

use crate::error::{OperatorError, Result};
use std::collections::BTreeMap;
use std::time::Duration;

/// How long a cluster operation may wait for its per-cluster lock.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Default interval between full reconciliation sweeps, in milliseconds.
pub const DEFAULT_FULL_RECONCILIATION_INTERVAL_MS: u64 = 120_000;

/// Validated operator configuration
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace the engine watches
    pub namespace: String,
    /// Label selector identifying cluster ConfigMaps
    pub labels: BTreeMap<String, String>,
    /// Interval between full reconciliation sweeps
    pub full_reconciliation_interval: Duration,
    /// Timeout for per-cluster lock acquisition
    pub lock_timeout: Duration,
}

impl OperatorConfig {
    pub fn from_parts(
        namespace: &str,
        configmap_labels: &str,
        full_reconciliation_interval_ms: u64,
    ) -> Result<Self> {
        if namespace.is_empty() {
            return Err(OperatorError::Config("namespace must not be empty".to_string()));
        }
        if full_reconciliation_interval_ms == 0 {
            return Err(OperatorError::Config(
                "full reconciliation interval must be positive".to_string(),
            ));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            labels: parse_labels(configmap_labels)?,
            full_reconciliation_interval: Duration::from_millis(full_reconciliation_interval_ms),
            lock_timeout: LOCK_TIMEOUT,
        })
    }
}

/// Parse a `key=value,key=value` label selector string.
fn parse_labels(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() && !value.is_empty() => {
                labels.insert(key.trim().to_string(), value.trim().to_string());
            }
            _ => {
                return Err(OperatorError::Config(format!(
                    "invalid label pair `{}` in selector `{}`",
                    pair, raw
                )));
            }
        }
    }
    if labels.is_empty() {
        return Err(OperatorError::Config(format!("empty label selector `{}`", raw)));
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_parts_defaults() {
        let config = OperatorConfig::from_parts("my-namespace", "kind=cluster", 120_000).unwrap();
        assert_eq!(config.namespace, "my-namespace");
        assert_eq!(config.labels.get("kind").map(String::as_str), Some("cluster"));
        assert_eq!(config.full_reconciliation_interval, Duration::from_secs(120));
        assert_eq!(config.lock_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_parse_multiple_labels() {
        let config =
            OperatorConfig::from_parts("ns", "kind=cluster, app = kafka", 1_000).unwrap();
        assert_eq!(config.labels.len(), 2);
        assert_eq!(config.labels.get("app").map(String::as_str), Some("kafka"));
    }

    #[test]
    fn test_invalid_labels_rejected() {
        assert!(OperatorConfig::from_parts("ns", "kind", 1_000).is_err());
        assert!(OperatorConfig::from_parts("ns", "=cluster", 1_000).is_err());
        assert!(OperatorConfig::from_parts("ns", "", 1_000).is_err());
    }

    #[test]
    fn test_invalid_namespace_and_interval_rejected() {
        assert!(OperatorConfig::from_parts("", "kind=cluster", 1_000).is_err());
        assert!(OperatorConfig::from_parts("ns", "kind=cluster", 0).is_err());
    }
}
