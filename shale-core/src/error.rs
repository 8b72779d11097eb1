use thiserror::Error;

pub type Result<T> = std::result::Result<T, ShaleError>;

#[derive(Error, Debug)]
pub enum ShaleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Insufficient replicas: need {required}, found {found}")]
    InsufficientReplicas { required: usize, found: usize },

    #[error("Conflicting garbage collection: submitted id {submitted}, current id {current}")]
    GcConflict { submitted: u64, current: u64 },

    #[error("Read requests are disabled on this node")]
    ReadDisabled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
