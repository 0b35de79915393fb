// Udhiya Ledger - Web Server
// REST API over the donation ledger

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use udhiya_ledger::{api, Database, ServerConfig};

#[derive(Parser)]
#[command(name = "udhiya-server", version, about = "Udhiya donation ledger API server")]
struct Args {
    #[command(flatten)]
    config: ServerConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,udhiya_ledger=debug")),
        )
        .init();

    let config = Args::parse().config;

    let db = Database::open(&config.store).with_context(|| {
        format!("opening database {}", config.store.database_path.display())
    })?;

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;

    info!(
        addr = %config.listen_addr,
        version = udhiya_ledger::VERSION,
        "server listening, API under /api"
    );

    axum::serve(listener, api::router(db))
        .await
        .context("server stopped")?;

    Ok(())
}
