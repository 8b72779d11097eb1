use super::{BalancerState, GetQuery, ListQuery, PutQuery, error_response, response_error};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use shale_core::wire::{
    CompactRequest, ConfigResponse, EndGcRequest, GcBeginResponse, HealthResponse, MarkGcRequest,
    PutResponse,
};
use shale_core::{ListMode, ObjectKey, PutOutcome};
use std::sync::Arc;

pub(crate) async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

pub(crate) async fn put_object(
    State(state): State<Arc<BalancerState>>,
    Path(key_text): Path<String>,
    Query(query): Query<PutQuery>,
    body: Bytes,
) -> Response {
    let key = match ObjectKey::parse(&key_text) {
        Ok(key) => key,
        Err(error) => return response_error(StatusCode::BAD_REQUEST, error.to_string()),
    };
    run_put(&state, key, query.sync, body).await
}

/// Put without a key: the cluster computes the digest itself.
pub(crate) async fn put_object_keyless(
    State(state): State<Arc<BalancerState>>,
    Query(query): Query<PutQuery>,
    body: Bytes,
) -> Response {
    let key = ObjectKey::digest_of(&body);
    run_put(&state, key, query.sync, body).await
}

async fn run_put(state: &BalancerState, key: ObjectKey, sync: bool, body: Bytes) -> Response {
    let size = body.len() as u64;
    match state.balancer.put(key, body, sync).await {
        Ok(outcome) => {
            let existed = outcome == PutOutcome::Existed;
            let status = if existed {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            (status, Json(PutResponse { key, size, existed })).into_response()
        }
        Err(error) => error_response(error),
    }
}

pub(crate) async fn get_object(
    State(state): State<Arc<BalancerState>>,
    Path(key_text): Path<String>,
    Query(query): Query<GetQuery>,
) -> Response {
    let key = match ObjectKey::parse(&key_text) {
        Ok(key) => key,
        Err(error) => return response_error(StatusCode::BAD_REQUEST, error.to_string()),
    };

    match state.balancer.get(key, query.offset, query.size).await {
        Ok(data) => {
            let mut response = Response::new(Body::from(data));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            response
        }
        Err(error) => error_response(error),
    }
}

pub(crate) async fn delete_object(
    State(state): State<Arc<BalancerState>>,
    Path(key_text): Path<String>,
) -> Response {
    let key = match ObjectKey::parse(&key_text) {
        Ok(key) => key,
        Err(error) => return response_error(StatusCode::BAD_REQUEST, error.to_string()),
    };

    match state.balancer.remove(key).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => response_error(
            StatusCode::NOT_FOUND,
            format!("object not found: {}", key),
        ),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn list_objects(
    State(state): State<Arc<BalancerState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let mode = match query.mode.as_deref().unwrap_or("default").parse::<ListMode>() {
        Ok(mode) => mode,
        Err(error) => return response_error(StatusCode::BAD_REQUEST, error.to_string()),
    };

    let page = state
        .balancer
        .list_page(
            mode,
            query.min_size,
            query.max_size,
            query.cursor.as_deref(),
            query.limit.max(1),
        )
        .await;

    match page {
        Ok(page) => (StatusCode::OK, Json(page)).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn capacity(State(state): State<Arc<BalancerState>>) -> Response {
    match state.balancer.capacity().await {
        Ok(capacity) => (StatusCode::OK, Json(capacity)).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn compact(
    State(state): State<Arc<BalancerState>>,
    Json(request): Json<CompactRequest>,
) -> Response {
    match state.balancer.compact(request.sync).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn begin_gc(State(state): State<Arc<BalancerState>>) -> Response {
    match state.balancer.begin_gc().await {
        Ok(id) => (StatusCode::OK, Json(GcBeginResponse { id })).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn mark_gc(
    State(state): State<Arc<BalancerState>>,
    Json(request): Json<MarkGcRequest>,
) -> Response {
    match state.balancer.mark_gc(&request.keys).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn end_gc(
    State(state): State<Arc<BalancerState>>,
    Json(request): Json<EndGcRequest>,
) -> Response {
    match state.balancer.end_gc(request.id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn get_config(State(state): State<Arc<BalancerState>>) -> Response {
    (
        StatusCode::OK,
        Json(ConfigResponse {
            buckets: state.balancer.config_buckets(),
        }),
    )
        .into_response()
}
