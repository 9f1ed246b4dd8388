//! Error types for the entity cache.

use std::sync::Arc;

use thiserror::Error;

/// A transport failure shared between the slot that stores it and every
/// reader that observes it.
pub type FetchError = Arc<TransportError>;

/// Errors produced by the id and query codecs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The value is outside the identifier grammar.
    #[error("not a valid identifier: {0}")]
    InvalidId(String),
}

/// Errors returned by a [`Transport`](crate::Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The server answered with a non-success status.
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// Resource not found.
    #[error("not found: {model} {key}")]
    NotFound { model: String, key: String },

    /// The transport has no requests registered for this model.
    #[error("unknown model: {0}")]
    UnknownModel(String),

    /// Base URL could not be turned into a request URL.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// The read was rejected by the backend.
    #[error("read rejected: {0}")]
    Rejected(String),
}

/// Errors surfaced by repository, branch and view reads and edits.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The last fetch for this slot failed.
    #[error("fetch failed for {model} {key}: {source}")]
    Fetch {
        model: String,
        key: String,
        source: FetchError,
    },

    /// The item was deleted by an explicit deletion write.
    #[error("the item was deleted: {model} {key}")]
    Deleted { model: String, key: String },

    /// An edit was attempted without a bound item.
    #[error("cannot edit {model}: no item is bound")]
    Unbound { model: String },
}

impl CacheError {
    /// Whether this error reports access to a deleted item.
    pub fn is_deleted(&self) -> bool {
        matches!(self, CacheError::Deleted { .. })
    }
}

/// Invalid repository configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);
