//! # QA Mocks Server
//!
//! Serves canned HTTP responses registered at runtime through the admin API.
//!
//! Mocks live in SQLite when `--use-database` is set, and in process memory otherwise
//! or whenever the database cannot be reached and fallback is allowed.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use qa_mocks::http::{build_router, AppState};
use qa_mocks::storage::{FallbackController, MockStore};
use qa_mocks::{MockRegistry, SeedBook};

mod cli;

use cli::Cli;

#[tokio::main]
async fn main() -> io::Result<()> {
    // Initialize logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    let policy = cli.storage_policy();
    let database = cli.database_config();
    if policy.use_durable {
        info!(backend = %database.describe(), "durable storage requested");
    }
    let controller = FallbackController::initialize(policy, move || {
        Ok(Arc::new(database.open_store()?) as Arc<dyn MockStore>)
    })
    .await
    .map_err(io::Error::other)?;
    let registry = Arc::new(MockRegistry::new(Arc::new(controller)));

    if let Some(path) = &cli.seed {
        let book = SeedBook::load_from_path(path)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        book.apply(&registry).await;
    }

    let state = AppState::builder().with_registry(Arc::clone(&registry)).build()?;
    let app = build_router(state);

    let addr: SocketAddr = cli.listen.parse().map_err(io::Error::other)?;
    info!("starting qa-mocks on http://{addr}");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
