use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use shale_core::wire::ErrorResponse;
use shale_core::{
    Balancer, BalancerConfig, Result, ShaleError, ShardingInfo, StoreEngine, StoreOptions,
};
use std::sync::Arc;
use tokio::net::TcpListener;

mod balancer;
mod storage;
mod types;

pub(crate) use types::*;

pub struct StorageState {
    pub engine: StoreEngine,
}

pub struct BalancerState {
    pub balancer: Balancer,
}

pub fn storage_router(state: Arc<StorageState>) -> Router {
    Router::new()
        .route("/healthz", get(storage::healthz))
        .route("/v1/objects", get(storage::list_objects))
        .route(
            "/v1/objects/:key",
            put(storage::put_object)
                .get(storage::get_object)
                .delete(storage::delete_object),
        )
        .route("/v1/capacity", get(storage::capacity))
        .route("/v1/compact", post(storage::compact))
        .route("/v1/gc/begin", post(storage::begin_gc))
        .route("/v1/gc/mark", post(storage::mark_gc))
        .route("/v1/gc/end", post(storage::end_gc))
        .route("/v1/config", get(storage::get_config))
        .with_state(state)
}

pub fn balancer_router(state: Arc<BalancerState>) -> Router {
    Router::new()
        .route("/healthz", get(balancer::healthz))
        .route(
            "/v1/objects",
            get(balancer::list_objects).put(balancer::put_object_keyless),
        )
        .route(
            "/v1/objects/:key",
            put(balancer::put_object)
                .get(balancer::get_object)
                .delete(balancer::delete_object),
        )
        .route("/v1/capacity", get(balancer::capacity))
        .route("/v1/compact", post(balancer::compact))
        .route("/v1/gc/begin", post(balancer::begin_gc))
        .route("/v1/gc/mark", post(balancer::mark_gc))
        .route("/v1/gc/end", post(balancer::end_gc))
        .route("/v1/config", get(balancer::get_config))
        .with_state(state)
}

pub async fn run_storage_server(path: &str, bind: &str, options: StoreOptions) -> Result<()> {
    let engine = StoreEngine::open(path, options)?;
    let state = Arc::new(StorageState { engine });

    let listener = TcpListener::bind(bind).await?;
    tracing::info!("storage node listening on {}", bind);

    axum::serve(listener, storage_router(state))
        .await
        .map_err(|error| ShaleError::Http(error.to_string()))?;
    Ok(())
}

pub async fn run_balancer_server(config_path: &str, bind: &str) -> Result<()> {
    let config = BalancerConfig::from_file(config_path)?;
    let sharding = ShardingInfo::from_config(&config).await?;
    tracing::info!(
        "balancer serving {} backends, {} buckets, {} replicas",
        sharding.backends().len(),
        sharding.bucket_count(),
        sharding.replicas()
    );

    let state = Arc::new(BalancerState {
        balancer: Balancer::new(sharding),
    });

    let listener = TcpListener::bind(bind).await?;
    tracing::info!("balancer listening on {}", bind);

    axum::serve(listener, balancer_router(state))
        .await
        .map_err(|error| ShaleError::Http(error.to_string()))?;
    Ok(())
}

pub(crate) fn response_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

pub(crate) fn error_response(error: ShaleError) -> Response {
    let status = match &error {
        ShaleError::ObjectNotFound(_) => StatusCode::NOT_FOUND,
        ShaleError::InvalidKey(_)
        | ShaleError::InvalidRequest(_)
        | ShaleError::DigestMismatch { .. } => StatusCode::BAD_REQUEST,
        ShaleError::GcConflict { .. } => StatusCode::CONFLICT,
        ShaleError::InsufficientReplicas { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ShaleError::ReadDisabled => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    response_error(status, error.to_string())
}
