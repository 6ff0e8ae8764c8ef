use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use signalk_core::config::{ConfigStorage, FileConfigStorage};
use signalk_core::{FullSignalK, SignalKStore};
use signalk_protocol::DiscoveryResponse;
use signalk_providers::PipelineContext;
use signalk_server::{ProviderManager, ServerConfig, SignalKServer};
use tokio::sync::{oneshot, RwLock};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_HTTP_PORT: u16 = 3000;

type Store = Arc<RwLock<FullSignalK>>;

#[derive(Clone)]
struct AppState {
    store: Store,
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,signalk_providers=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let storage = FileConfigStorage::default_location();
    tracing::info!("Loading settings from {}", storage.path().display());
    let settings = storage.load_or_init_settings()?;

    let server = SignalKServer::new(ServerConfig::from_settings(&settings));
    let store = server.store();
    tracing::info!("Self vessel is {}", server.config().self_urn);

    let mut manager = ProviderManager::new(PipelineContext::new(server.app_handle()));
    if let Some(directory) = &settings.logging_directory {
        manager = manager.with_logging_directory(directory);
    }

    let (stop_hub, hub_stopped) = oneshot::channel::<()>();
    let hub = tokio::spawn(server.run(async {
        let _ = hub_stopped.await;
    }));

    let started = manager.start_all(&settings.piped_providers);
    tracing::info!(
        "Started {} of {} provider(s)",
        started,
        settings.piped_providers.len()
    );

    let port = settings.http_port.unwrap_or(DEFAULT_HTTP_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let http = tokio::spawn(async move {
        if let Err(e) = start_http_server(addr, AppState { store, port }).await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    tracing::info!("SignalK ingest ready");
    tracing::info!("   Discovery: http://localhost:{}/signalk", port);
    tracing::info!("   Full model: http://localhost:{}/signalk/v1/api", port);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = http => {
            tracing::warn!("HTTP server stopped");
        }
    }

    // providers drain into the hub, so the hub stops last
    manager.shutdown().await;
    let _ = stop_hub.send(());
    hub.await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn start_http_server(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/signalk", get(discovery_handler))
        .route("/signalk/v1/api", get(full_api_handler))
        .route("/signalk/v1/api/*path", get(path_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("HTTP server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn discovery_handler(State(state): State<AppState>) -> Json<DiscoveryResponse> {
    Json(DiscoveryResponse::new("localhost", state.port))
}

async fn full_api_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.store.read().await.retrieve())
}

/// `/signalk/v1/api/vessels/self/navigation/position` style reads.
async fn path_handler(
    Path(path): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let path = path.trim_matches('/').replace('/', ".");
    match state.store.read().await.get_path(&path) {
        Some(value) => Ok(Json(value)),
        None => Err(StatusCode::NOT_FOUND),
    }
}
