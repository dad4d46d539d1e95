use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_rest::{AppState, defaults_from_env, router};
use ums_core::{MeasureService, OverrideStore};

/// Main entry point for the UMS application
///
/// Loads `.env`, installs tracing and serves the REST API (with Swagger UI at `/swagger-ui`).
///
/// # Environment Variables
/// - `UMS_REST_ADDR`: REST server address (default: "0.0.0.0:3000")
/// - `UMS_SQL_DIALECT`: SQL dialect for generation and validation (default: "tsql")
/// - `UMS_POPULATION_ID`: literal population id (default: quoted placeholder)
/// - `UMS_ONTOLOGY_CONTEXTS`: comma-separated ontology contexts joined into `DEMOG`
///
/// # Returns
/// * `Ok(())` - If the server starts and runs successfully
/// * `Err(anyhow::Error)` - If configuration, binding or serving fails
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ums=info".parse()?)
                .add_directive("ums_core=info".parse()?)
                .add_directive("api_rest=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rest_addr = std::env::var("UMS_REST_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let defaults = defaults_from_env()?;

    tracing::info!("++ Starting UMS REST on {}", rest_addr);
    tracing::info!(
        dialect = defaults.dialect.display_name(),
        population_id = defaults.population_id.as_deref().unwrap_or("{{population_id}}"),
        "generation defaults"
    );

    let store = Arc::new(OverrideStore::new());
    let app = router(AppState::new(MeasureService::new(store), defaults));

    let listener = tokio::net::TcpListener::bind(&rest_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
