use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type. Only the startup kinds (`ConfigInvalid`,
/// `WatchDirMissing`, `Model` at process start) terminate the process;
/// everything else is recovered locally and logged.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("watch directory does not exist: {0}")]
    WatchDirMissing(PathBuf),

    #[error("embedding model: {0}")]
    Model(String),

    #[error("document produced no tokens: {0}")]
    EmptyTokens(String),

    #[error("query produced no tokens")]
    EmptyQuery,

    #[error("document produced no chunks: {0}")]
    NoChunks(String),

    #[error("failed to persist {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("vector store: {0}")]
    Store(#[from] lancedb::Error),

    #[error("arrow: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    #[error("file watch: {0}")]
    Watch(#[from] notify::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
