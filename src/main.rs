//! entityproxy - data-access proxy for entity records
//!
//! This is the main entry point for the entityproxy server.
//! The actual logic is in the library modules for better testability.

use anyhow::{Context, Result};
use clap::Parser;
use entityproxy::api;
use entityproxy::config::{ConnectionConfig, load_settings};
use entityproxy::dispatch::Dispatcher;
use entityproxy::service::ProxyService;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "entityproxy", version, about = "Entity data-access proxy")]
struct Args {
    /// Settings file (defaults to ~/.entityproxy/config.toml)
    #[arg(short, long, env = "ENTITYPROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the settings file
    #[arg(short, long)]
    listen: Option<String>,

    /// Default tenant database as a postgres:// URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("entityproxy=info,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut settings = load_settings(args.config.as_deref()).context("loading settings")?;
    if let Some(listen) = args.listen {
        settings.server.listen = listen;
    }
    if let Some(url) = args.database_url.as_deref() {
        settings.database = ConnectionConfig::from_url(url).context("parsing --database-url")?;
    }

    let dispatcher = Dispatcher::from_settings(&settings).context("building backends")?;
    let service = Arc::new(ProxyService::new(dispatcher, &settings));
    let app = api::router(service);

    let listener = tokio::net::TcpListener::bind(&settings.server.listen)
        .await
        .with_context(|| format!("binding {}", settings.server.listen))?;
    tracing::info!(
        listen = %settings.server.listen,
        default_db = %settings.database.connection_string(),
        managed = %settings.managed.base_url,
        "entityproxy started"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "could not install ctrl-c handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
