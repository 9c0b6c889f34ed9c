use crate::{http, manager::PortForwardManager};
use anyhow::{Context, Result};
use clap::Parser;
use porthole_forward_core::SessionStore;
use porthole_forward_k8s::ContextStore;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tracing::info;

#[derive(Debug, Parser)]
#[clap(
    name = "porthole-forward-manager",
    about = "Port-forward session manager for the porthole dashboard"
)]
pub struct Args {
    #[clap(long, default_value = "porthole=info,warn", env = "PORTHOLE_LOG")]
    log_level: String,

    /// Address the HTTP API listens on.
    #[clap(long, default_value = "127.0.0.1:4466", env = "PORTHOLE_ADDR")]
    addr: SocketAddr,

    /// Path to a kubeconfig; the ambient KUBECONFIG/default chain is used
    /// when unset.
    #[clap(long, env = "PORTHOLE_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,
}

impl Args {
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            addr,
            kubeconfig,
        } = self;

        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_new(&log_level)
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();

        let contexts =
            ContextStore::load(kubeconfig.as_deref()).context("failed to load kubeconfig")?;
        let manager = PortForwardManager::new(SessionStore::new(), Arc::new(contexts));

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!(%addr, "port forward API listening");

        axum::serve(listener, http::router(manager))
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("server error")?;

        info!("shutting down");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for shutdown signal");
    }
}
