use anyhow::Result;
use axum::Router;
use sheet_insight::{clients::EngineClient, config, logging, routes, services::session_registry, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logging()?;

    let config = config::load_config()?;

    let registry = Arc::new(session_registry::SessionRegistry::new());
    let engine = EngineClient::new(&config.engine, registry)?;
    let sweep = session_registry::spawn_idle_sweep(
        engine.clone(),
        config.session_sweep_interval,
        config.session_idle_timeout,
    );
    tracing::info!(
        "Engine at {}, idle sessions swept every {:?}",
        config.engine.base_url,
        config.session_sweep_interval
    );

    let port = config.server_port;
    let state = Arc::new(AppState::new(config, engine));

    let app = Router::new()
        .merge(routes::routes())
        .merge(routes::workbooks::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    tracing::info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    sweep.abort();
    Ok(())
}
