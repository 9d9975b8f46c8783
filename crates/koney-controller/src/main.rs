//! koney-controller - the deception-policy reconciler daemon.
//!
//! Wires together leader election, the reconciliation engine, and the
//! Prometheus metrics endpoint. The cluster transport is an external
//! collaborator behind [`koney_core::cluster::ClusterClient`]; this
//! binary ships with the standalone in-memory backend so the control
//! loop can be exercised without a cluster.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use koney_controller::engine::{LeaderElector, DEFAULT_LEASE_TTL};
use koney_controller::metrics::ControllerMetrics;
use koney_controller::{Engine, EngineConfig};
use koney_core::cluster::{ClusterClient, InMemoryCluster};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// koney controller - deploys deception policies
#[derive(Parser, Debug)]
#[command(name = "koney-controller")]
#[command(version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Number of reconcile workers
    #[arg(long, default_value = "2")]
    workers: usize,

    /// Periodic resync interval in seconds
    #[arg(long, default_value = "300")]
    resync_seconds: u64,

    /// Port for the Prometheus metrics endpoint
    #[arg(long, default_value = "9100")]
    metrics_port: u16,

    /// Disable the metrics endpoint
    #[arg(long)]
    no_metrics: bool,

    /// Run against the in-memory standalone backend instead of a
    /// cluster transport
    #[arg(long)]
    standalone: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("koney-controller starting");

    let client: Arc<dyn ClusterClient> = if args.standalone {
        info!("using the standalone in-memory backend");
        Arc::new(InMemoryCluster::new())
    } else {
        bail!(
            "no cluster transport is linked into this build; \
             run with --standalone or provide a ClusterClient implementation"
        );
    };

    let config = EngineConfig {
        operator_namespace: koney_core::config::operator_namespace(),
        workers: args.workers,
        resync_interval: Duration::from_secs(args.resync_seconds),
        ..EngineConfig::default()
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (leader_tx, leader_rx) = watch::channel(false);

    let elector = LeaderElector::new(Arc::clone(&client), DEFAULT_LEASE_TTL);
    tokio::spawn(elector.run(leader_tx, shutdown_rx.clone()));

    let metrics = if args.no_metrics {
        None
    } else {
        let metrics = ControllerMetrics::new().context("failed to build metrics")?;
        let addr = SocketAddr::from(([0, 0, 0, 0], args.metrics_port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind metrics endpoint on {addr}"))?;
        let router = Arc::clone(&metrics).router();
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router).await {
                tracing::error!(error = %err, "metrics server failed");
            }
        });
        info!(port = args.metrics_port, "metrics endpoint listening");
        Some(metrics)
    };

    let engine = match metrics {
        Some(metrics) => Engine::with_metrics(Arc::clone(&client), config, metrics),
        None => Engine::new(Arc::clone(&client), config),
    };
    engine.enqueue_all().await;
    tokio::spawn(Arc::clone(&engine).run(leader_rx, shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received; abandoning in-flight reconciles");
    let _ = shutdown_tx.send(true);

    Ok(())
}
