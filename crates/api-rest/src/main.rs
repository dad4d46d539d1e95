//! Standalone REST API server binary.
//!
//! ## Purpose
//! Runs the REST API server on its own.
//!
//! ## Intended use
//! Useful for development and debugging. The workspace's main `ums-run` binary serves the same
//! router after loading `.env`.

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_rest::{defaults_from_env, router, AppState};
use ums_core::{MeasureService, OverrideStore};

/// Main entry point for the UMS REST API server
///
/// Starts the REST API server on the configured address (default: 0.0.0.0:3000).
///
/// # Environment Variables
/// - `UMS_REST_ADDR`: Server address (default: "0.0.0.0:3000")
/// - `UMS_SQL_DIALECT`, `UMS_POPULATION_ID`, `UMS_ONTOLOGY_CONTEXTS`: generation defaults
///
/// # Errors
/// Returns an error if:
/// - the logging/tracing configuration cannot be initialised,
/// - a generation default cannot be parsed,
/// - the server address cannot be bound, or
/// - the HTTP server fails while running.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("api_rest=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr = std::env::var("UMS_REST_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());

    tracing::info!("-- Starting UMS REST API on {}", addr);

    let defaults = defaults_from_env()?;
    let service = MeasureService::new(Arc::new(OverrideStore::new()));
    let app = router(AppState::new(service, defaults));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
