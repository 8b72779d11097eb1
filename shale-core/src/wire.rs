use crate::key::ObjectKey;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PutResponse {
    pub key: ObjectKey,
    pub size: u64,
    /// The key was already stored; the uploaded bytes were discarded.
    pub existed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse {
    pub keys: Vec<ObjectKey>,
    /// Present when more pages may follow; pass back as `cursor`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GcBeginResponse {
    pub id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MarkGcRequest {
    pub keys: Vec<ObjectKey>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EndGcRequest {
    pub id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompactRequest {
    #[serde(default)]
    pub sync: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigResponse {
    pub buckets: Vec<ObjectKey>,
}
