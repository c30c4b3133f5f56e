use std::io;

/// Errors surfaced by the store's public API.
///
/// `Success` is deliberately not a variant here — unlike the C original this
/// is expressed as `Result<T, Error>`, so the absence of an `Err` already
/// means success.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("document not found")]
    DocNotFound,
    #[error("no such file")]
    NoSuchFile,
    #[error("operation cancelled")]
    Cancel,
    #[error("file is corrupt: {0}")]
    Corrupt(String),
    #[error("checksum mismatch reading chunk at offset {offset}")]
    ChecksumMismatch { offset: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("failed to (de)serialize local document: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
