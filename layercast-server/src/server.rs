use crate::config::{Config, DiscoveryMode};
use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use layercast_core::{
    CancellationToken, DnsPeers, DynPeerDiscovery, LayerKeeper, LayerRegistry, LayercastError,
    Result, StaticPeers, StoreBuilder,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub struct ServerState {
    pub keeper: Arc<LayerKeeper>,
    pub shutdown: CancellationToken,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(keeper: Arc<LayerKeeper>, shutdown: CancellationToken) -> Self {
        Self {
            keeper,
            shutdown,
            started_at: Utc::now(),
        }
    }

    fn registry(&self) -> &LayerRegistry {
        self.keeper.registry()
    }
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LayersRequest {
    layers: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PeersQuery {
    layer: String,
}

#[derive(Debug, Serialize)]
struct PeersResponse {
    layer: String,
    peers: Vec<String>,
}

#[derive(Debug, Serialize)]
struct DumpResponse {
    count: usize,
    keys: Vec<String>,
}

pub async fn build_registry(config: &Config) -> Result<Arc<LayerRegistry>> {
    let mut store_builder = StoreBuilder::new().backend(config.store.backend.as_str());
    if let Some(redis) = config.store.redis.as_ref() {
        store_builder = store_builder.redis_url(redis.url.clone());
    }
    let store = store_builder.build().await?;

    let peers: DynPeerDiscovery = match config.discovery.mode {
        DiscoveryMode::Static => Arc::new(StaticPeers::new(config.discovery.peers.clone())),
        DiscoveryMode::Dns => {
            let dns = config.discovery.dns.as_ref().ok_or_else(|| {
                LayercastError::Config("dns configuration is required for dns discovery".to_string())
            })?;
            Arc::new(DnsPeers::new(dns.host.clone(), dns.port))
        }
    };

    let registry = LayerRegistry::new(
        config.node.address.clone(),
        peers,
        store,
        config.registry.expiration(),
    )
    .with_scan_count(config.registry.scan_count)
    .with_lookup_concurrency(config.registry.lookup_concurrency);

    Ok(Arc::new(registry))
}

pub async fn run_server(config: Config) -> Result<()> {
    let registry = build_registry(&config).await?;
    let keeper = Arc::new(LayerKeeper::new(registry, config.registry.refresh_interval())?);

    let shutdown = CancellationToken::new();
    let state = Arc::new(ServerState::new(keeper.clone(), shutdown.clone()));

    // Start background tasks
    let keeper_task = tokio::spawn({
        let keeper = keeper.clone();
        let cancel = shutdown.child_token();
        async move { keeper.run(cancel).await }
    });

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.node.bind_addr).await?;
    tracing::info!(
        "Layercast listening on {} as {}",
        config.node.bind_addr,
        config.node.address
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Err(error) = keeper_task.await {
        tracing::warn!("Layer keeper task ended abnormally: {}", error);
    }

    Ok(())
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/layers", post(hold_layers).delete(release_layers))
        .route("/layers/refresh", post(refresh_layers))
        .route("/layers/peers", get(find_peers))
        .route("/admin/dump", get(dump_layers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(error) = result {
                tracing::error!("Failed to listen for shutdown signal: {}", error);
            }
            tracing::info!("Shutdown signal received");
        }
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}

fn success<T: Serialize>(data: T) -> Response {
    let resp = ApiResponse {
        success: true,
        data: Some(data),
        error: None,
    };
    (StatusCode::OK, Json(resp)).into_response()
}

fn failure(status: StatusCode, error: impl ToString) -> Response {
    let resp = ApiResponse::<()> {
        success: false,
        data: None,
        error: Some(error.to_string()),
    };
    (status, Json(resp)).into_response()
}

fn error_response(error: LayercastError) -> Response {
    let status = match &error {
        LayercastError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        LayercastError::Discovery(_) => StatusCode::SERVICE_UNAVAILABLE,
        LayercastError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    failure(status, error)
}

fn validate_layers(layers: &[String]) -> Result<()> {
    if layers.iter().any(|layer| layer.trim().is_empty()) {
        return Err(LayercastError::InvalidRequest(
            "layer identifiers cannot be empty".to_string(),
        ));
    }
    Ok(())
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let held = state.keeper.held().await;

    let response = serde_json::json!({
        "address": state.registry().self_address(),
        "held_layers": held.len(),
        "expiration_secs": state.registry().expiration().as_secs(),
        "started_at": state.started_at.to_rfc3339(),
    });

    (StatusCode::OK, Json(response))
}

async fn hold_layers(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<LayersRequest>,
) -> Response {
    if let Err(error) = validate_layers(&request.layers) {
        return error_response(error);
    }

    let cancel = state.shutdown.child_token();
    match state.keeper.hold(&cancel, &request.layers).await {
        Ok(()) => success(serde_json::json!({ "held": request.layers.len() })),
        Err(error) => {
            tracing::warn!("Failed to announce layers: {}", error);
            error_response(error)
        }
    }
}

async fn release_layers(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<LayersRequest>,
) -> Response {
    if let Err(error) = validate_layers(&request.layers) {
        return error_response(error);
    }

    let cancel = state.shutdown.child_token();
    match state.keeper.release(&cancel, &request.layers).await {
        Ok(()) => success(serde_json::json!({ "released": request.layers.len() })),
        Err(error) => {
            tracing::warn!("Failed to withdraw layers: {}", error);
            error_response(error)
        }
    }
}

async fn refresh_layers(State(state): State<Arc<ServerState>>) -> Response {
    let cancel = state.shutdown.child_token();
    match state.keeper.refresh(&cancel).await {
        Ok(refreshed) => success(serde_json::json!({ "refreshed": refreshed })),
        Err(error) => error_response(error),
    }
}

async fn find_peers(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<PeersQuery>,
) -> Response {
    if query.layer.trim().is_empty() {
        return failure(StatusCode::BAD_REQUEST, "layer query parameter cannot be empty");
    }

    let cancel = state.shutdown.child_token();
    match state.registry().get(&cancel, &query.layer).await {
        Ok(peers) => success(PeersResponse {
            layer: query.layer,
            peers,
        }),
        Err(error) => {
            tracing::warn!("Lookup for layer {} failed: {}", query.layer, error);
            error_response(error)
        }
    }
}

async fn dump_layers(State(state): State<Arc<ServerState>>) -> Response {
    let cancel = state.shutdown.child_token();
    match state.registry().dump(&cancel).await {
        Ok(keys) => success(DumpResponse {
            count: keys.len(),
            keys,
        }),
        Err(error) => error_response(error),
    }
}
