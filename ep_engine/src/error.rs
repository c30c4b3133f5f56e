use thiserror::Error;

use crate::vbucket::Vbid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store returned a transient error for vbucket {vbid}: {source}")]
    StoreTransient { vbid: Vbid, #[source] source: couchstore::Error },

    #[error("notifier returned an unrecoverable status: {0}")]
    NotifierFatal(String),

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
