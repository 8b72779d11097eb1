use super::{GetQuery, ListQuery, PutQuery, StorageState, error_response, response_error};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use shale_core::wire::{
    CompactRequest, EndGcRequest, GcBeginResponse, HealthResponse, ListResponse, MarkGcRequest,
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
    State(state): State<Arc<StorageState>>,
    Path(key_text): Path<String>,
    Query(query): Query<PutQuery>,
    body: Bytes,
) -> Response {
    let key = match ObjectKey::parse(&key_text) {
        Ok(key) => key,
        Err(error) => return response_error(StatusCode::BAD_REQUEST, error.to_string()),
    };

    let size = body.len() as u64;
    match state.engine.put(key, body, query.sync).await {
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
    State(state): State<Arc<StorageState>>,
    Path(key_text): Path<String>,
    Query(query): Query<GetQuery>,
) -> Response {
    let key = match ObjectKey::parse(&key_text) {
        Ok(key) => key,
        Err(error) => return response_error(StatusCode::BAD_REQUEST, error.to_string()),
    };

    let read = match state.engine.get(key, query.offset, query.size).await {
        Ok(read) => read,
        Err(error) => return error_response(error),
    };

    let size = read.size();
    let mut response = Response::new(Body::from_stream(read.into_stream()));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    if let Ok(value) = HeaderValue::from_str(&size.to_string()) {
        response.headers_mut().insert(header::CONTENT_LENGTH, value);
    }
    response
}

pub(crate) async fn delete_object(
    State(state): State<Arc<StorageState>>,
    Path(key_text): Path<String>,
) -> Response {
    let key = match ObjectKey::parse(&key_text) {
        Ok(key) => key,
        Err(error) => return response_error(StatusCode::BAD_REQUEST, error.to_string()),
    };

    match state.engine.remove(key).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => response_error(
            StatusCode::NOT_FOUND,
            format!("object not found: {}", key),
        ),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn list_objects(
    State(state): State<Arc<StorageState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let mode = match query.mode.as_deref().unwrap_or("default").parse::<ListMode>() {
        Ok(mode) => mode,
        Err(error) => return response_error(StatusCode::BAD_REQUEST, error.to_string()),
    };

    let after_offset = match &query.cursor {
        None => None,
        Some(cursor) => match cursor.parse::<u64>() {
            Ok(offset) => Some(offset),
            Err(_) => {
                return response_error(
                    StatusCode::BAD_REQUEST,
                    format!("malformed cursor '{}'", cursor),
                );
            }
        },
    };

    let entries = match state.engine.list(mode, query.min_size, query.max_size).await {
        Ok(entries) => entries,
        Err(error) => return error_response(error),
    };

    let limit = query.limit.max(1);
    let page: Vec<_> = entries
        .iter()
        .filter(|entry| after_offset.map_or(true, |cursor| entry.offset > cursor))
        .take(limit)
        .collect();

    let next_cursor = (page.len() == limit)
        .then(|| page.last().map(|entry| entry.offset.to_string()))
        .flatten();
    let keys = page.into_iter().map(|entry| entry.key).collect();

    (StatusCode::OK, Json(ListResponse { keys, next_cursor })).into_response()
}

pub(crate) async fn capacity(State(state): State<Arc<StorageState>>) -> Response {
    match state.engine.capacity().await {
        Ok(capacity) => (StatusCode::OK, Json(capacity)).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn compact(
    State(state): State<Arc<StorageState>>,
    Json(request): Json<CompactRequest>,
) -> Response {
    match state.engine.compact(request.sync).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn begin_gc(State(state): State<Arc<StorageState>>) -> Response {
    match state.engine.begin_gc().await {
        Ok(id) => (StatusCode::OK, Json(GcBeginResponse { id })).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn mark_gc(
    State(state): State<Arc<StorageState>>,
    Json(request): Json<MarkGcRequest>,
) -> Response {
    match state.engine.mark_gc(&request.keys).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn end_gc(
    State(state): State<Arc<StorageState>>,
    Json(request): Json<EndGcRequest>,
) -> Response {
    match state.engine.end_gc(request.id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => error_response(error),
    }
}

/// Streams the preserialized bucket list written at repository creation.
pub(crate) async fn get_config(State(state): State<Arc<StorageState>>) -> Response {
    let mut response = Response::new(Body::from(state.engine.config_bytes()));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
