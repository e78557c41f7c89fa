use bitstats_adapters::AdapterError;
use bitstats_core::DecomposeError;
use bitstats_storage::{FetchError, SecretError, StorageError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("secret {name} not found")]
    SecretNotFound { name: String },
    #[error("remote stats api: {0}")]
    Remote(#[source] FetchError),
    #[error("link {link_id}: {source}")]
    MalformedUrl {
        link_id: String,
        #[source]
        source: DecomposeError,
    },
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("no data: {0}")]
    NoData(String),
    #[error("{failed} of {total} links failed")]
    LinksFailed { failed: usize, total: usize },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<AdapterError> for SyncError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Remote(fetch) => SyncError::Remote(fetch),
            AdapterError::NoData(msg) => SyncError::NoData(msg),
        }
    }
}

impl From<SecretError> for SyncError {
    fn from(err: SecretError) -> Self {
        match err {
            SecretError::NotFound { name } => SyncError::SecretNotFound { name },
            SecretError::Other(err) => SyncError::Other(err),
        }
    }
}
