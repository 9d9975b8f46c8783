//! koney-alert-forwarder - the alert ingestion daemon.
//!
//! Serves the webhook surface the tracing policies point at, debounces
//! the triggers, and writes canonical alerts to stdout. The cluster
//! transport is an external collaborator behind
//! [`koney_core::cluster::ClusterClient`]; this binary ships with the
//! standalone in-memory backend so the pipeline can be exercised
//! without a cluster.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use koney_core::cluster::{ClusterClient, InMemoryCluster};
use koney_core::config::EnvConfig;
use koney_forwarder::sink::StdoutSink;
use koney_forwarder::{debounce, server, Pipeline};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// koney alert forwarder - turns probe events into alerts
#[derive(Parser, Debug)]
#[command(name = "koney-alert-forwarder")]
#[command(version, about, long_about = None)]
struct Args {
    /// Run against the in-memory standalone backend instead of a
    /// cluster transport
    #[arg(long)]
    standalone: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = EnvConfig::from_env();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("alert-forwarder starting");

    let client: Arc<dyn ClusterClient> = if args.standalone {
        info!("using the standalone in-memory backend");
        Arc::new(InMemoryCluster::new())
    } else {
        bail!(
            "no cluster transport is linked into this build; \
             run with --standalone or provide a ClusterClient implementation"
        );
    };

    let (trigger, triggers) = debounce::channel();
    let pipeline = Arc::new(Pipeline::new(Arc::clone(&client), Arc::new(StdoutSink)));
    tokio::spawn(async move {
        debounce::run(triggers, debounce::DEBOUNCE_DELAY, move || {
            let pipeline = Arc::clone(&pipeline);
            async move {
                if let Err(err) = pipeline.scan(debounce::SCAN_WINDOW).await {
                    tracing::error!(error = %err, "scan failed");
                }
            }
        })
        .await;
    });
    info!("debouncer started");

    let state = Arc::new(server::AppState { client, trigger });
    let router = server::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind on {addr}"))?;
    info!(port = config.port, "starting server");

    axum::serve(listener, router)
        .await
        .context("server failed")?;
    Ok(())
}
