//! Kafka Cluster Operator
//!
//! Watches cluster ConfigMaps in a namespace and reconciles Kafka and
//! Kafka Connect clusters against them.
//!
//! ## Usage
//!
//! ```bash
//! # Run the operator (requires kubeconfig)
//! NAMESPACE=kafka kafka-cluster-operator
//!
//! # Run with a custom selector and sweep interval
//! NAMESPACE=kafka CONFIGMAP_LABELS=kind=cluster \
//!     FULL_RECONCILIATION_INTERVAL=60000 kafka-cluster-operator
//! ```

use clap::Parser;
use kafka_cluster_operator::engine::ReconciliationEngine;
use kafka_cluster_operator::health::{self, HealthState};
use kafka_cluster_operator::labels::DEFAULT_CONFIGMAP_LABELS;
use kafka_cluster_operator::leader_election::{self, LeaderElector};
use kafka_cluster_operator::OperatorConfig;
use kube::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Kafka Cluster Operator
#[derive(Parser, Debug)]
#[command(name = "kafka-cluster-operator")]
#[command(version, about = "Kubernetes operator for Kafka and Kafka Connect clusters")]
struct Args {
    /// Namespace to watch
    #[arg(long, env = "NAMESPACE")]
    namespace: String,

    /// Label selector for cluster ConfigMaps
    #[arg(long, env = "CONFIGMAP_LABELS", default_value = DEFAULT_CONFIGMAP_LABELS)]
    configmap_labels: String,

    /// Milliseconds between full reconciliation sweeps
    #[arg(long, env = "FULL_RECONCILIATION_INTERVAL", default_value_t = 120_000)]
    full_reconciliation_interval: u64,

    /// Health probe bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Enable leader election for HA deployments
    #[arg(long, env = "LEADER_ELECTION", default_value_t = false)]
    leader_election: bool,

    /// Namespace for the leader election Lease (auto-detected if empty)
    #[arg(long, env = "LEADER_ELECTION_NAMESPACE", default_value = "")]
    leader_election_namespace: String,

    /// Emit JSON-formatted logs
    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("starting Kafka Cluster Operator");

    let config = OperatorConfig::from_parts(
        &args.namespace,
        &args.configmap_labels,
        args.full_reconciliation_interval,
    )?;

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("connected to Kubernetes API server");

    // Health surface
    let health = HealthState::new(config.full_reconciliation_interval);
    {
        let health = Arc::clone(&health);
        let addr = args.health_addr;
        tokio::spawn(async move {
            if let Err(e) = health::serve(addr, health).await {
                error!("health surface failed: {}", e);
            }
        });
    }

    // Leader election: acquire the lease before driving any reconciliation
    let elector = if args.leader_election {
        let ns = leader_election::detect_namespace(&args.leader_election_namespace);
        info!("leader election namespace: {}", ns);
        let elector = LeaderElector::new(client.clone(), &ns);
        elector.acquire().await?;
        Some(Arc::new(elector))
    } else {
        None
    };

    // Periodic lease renewal (pending forever when leader election is off)
    let elector_for_renew = elector.clone();
    let renew = tokio::spawn(async move {
        match elector_for_renew {
            Some(elector) => loop {
                tokio::time::sleep(elector.renew_interval()).await;
                match elector.renew().await {
                    Ok(true) => {}
                    Ok(false) => {
                        error!("lost leader lease");
                        break;
                    }
                    Err(e) => {
                        error!("failed to renew leader lease: {}", e);
                        break;
                    }
                }
            },
            None => std::future::pending::<()>().await,
        }
    });

    let engine = ReconciliationEngine::new(client, config, Arc::clone(&health));

    // Run until a shutdown signal or a fatal engine error; either way stop
    // accepting events, then let in-flight locked operations drain.
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        result = engine.run() => {
            if let Err(e) = result {
                health.record_fatal();
                engine.drain().await;
                anyhow::bail!("reconciliation engine failed: {}", e);
            }
        }
        _ = renew => {
            health.record_fatal();
            engine.drain().await;
            anyhow::bail!("leader lease lost");
        }
    }

    engine.drain().await;

    // Release the lease so a standby replica can take over immediately
    if let Some(elector) = &elector {
        elector.release().await;
    }

    info!("Kafka Cluster Operator shutting down");
    Ok(())
}
