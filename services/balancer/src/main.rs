//! ferry balancer
//!
//! Transparent per-host load balancer. This service:
//! - Installs dedicated NAT and filter chains
//! - Reads service updates as JSON lines from stdin or a file
//! - Steers each virtual address to a local forwarder, or rejects it
//! - Removes its chains again on shutdown

use std::sync::Arc;

use anyhow::{Context, Result};
use ferry_balancer::{feed, Balancer, BalancerContext, Config, ErrorReporter};
use ferry_model::TracingSink;
use ferry_netfilter::{ChainManager, IptablesInvoker};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to FERRY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting ferry balancer");
    info!(
        bridge_ip = %config.bridge_ip,
        chain = %config.chain,
        iptables = %config.iptables,
        updates = ?config.updates,
        connect_timeout_ms = config.connect_timeout.as_millis() as u64,
        "Configuration loaded"
    );

    let (errors, mut errors_rx) = ErrorReporter::new();
    let ctx = BalancerContext {
        netfilter: Arc::new(ChainManager::new(
            Arc::new(IptablesInvoker::new(config.iptables.clone())),
            config.chain.clone(),
        )),
        bridge_ip: config.bridge_ip,
        pool_config: config.pool.clone(),
        connect_timeout: config.connect_timeout,
        sink: Arc::new(TracingSink),
        errors,
    };
    ctx.install_chains().context("Failed to install packet-filter chains")?;

    let reader = feed::open_feed(&config.updates)
        .await
        .with_context(|| format!("Failed to open update feed {:?}", config.updates))?;
    let (updates_tx, updates_rx) = mpsc::channel(16);
    tokio::spawn(async move {
        if let Err(e) = feed::read_updates(reader, updates_tx).await {
            error!(error = %e, "Update feed failed");
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = tokio::spawn(async move {
        let mut fatal = false;
        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    match result {
                        Ok(()) => info!("Shutdown requested"),
                        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
                    }
                    break;
                }
                reported = errors_rx.recv() => match reported {
                    Some(op) if op.is_fatal() => {
                        error!(
                            service = %op.service,
                            error = %op.error,
                            "Fatal balancer error, shutting down"
                        );
                        fatal = true;
                        break;
                    }
                    Some(op) => warn!(service = %op.service, error = %op.error, "Balancer error"),
                    None => break,
                },
            }
        }
        let _ = shutdown_tx.send(true);
        fatal
    });

    let mut balancer = Balancer::new(ctx);
    balancer.run(updates_rx, shutdown_rx).await;

    balancer
        .context()
        .remove_chains()
        .context("Failed to remove packet-filter chains")?;
    if supervisor.await.unwrap_or(false) {
        anyhow::bail!("Balancer stopped after a fatal error");
    }
    info!("ferry balancer stopped");
    Ok(())
}
