use pvfll_types::{BoxNumber, TypesError};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum BoxError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    InvalidValue(#[from] TypesError),
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("box {box_number} already holds {name}")]
    Occupied { box_number: BoxNumber, name: String },
    #[error("no such file: {0}")]
    NotFound(String),
    #[error("file too big: {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: u64, max: u64 },
    #[error("the configured object store cannot sign URLs")]
    SigningUnsupported,

    #[error("object store error: {0}")]
    Store(#[from] object_store::Error),
    #[error("object store path error: {0}")]
    StorePath(#[from] object_store::path::Error),

    #[error("failed to serialize document: {0}")]
    Serialization(serde_json::Error),
    #[error("failed to deserialize document: {0}")]
    Deserialization(serde_json::Error),

    #[error("notification failed: {0}")]
    Notify(String),
    #[error("notification request failed: {0}")]
    NotifyHttp(#[from] reqwest::Error),

    #[error("{step} timed out after {after:?}")]
    Timeout { step: &'static str, after: Duration },
}

pub type BoxResult<T> = std::result::Result<T, BoxError>;
