//! Append-only, revision-numbered document storage.
//!
//! This crate is the external collaborator the persistence coordinator in
//! `ep_engine` builds on: it knows how to open and commit a partition file,
//! save and stream documents, and read/write small `_local/*` metadata
//! documents. It has no notion of vbuckets, CAS, or the notifier protocol —
//! those live one layer up.

pub mod constants;
pub mod db;
pub mod docinfo;
pub mod error;
pub mod file;
mod header;
pub mod options;

pub use db::Db;
pub use docinfo::{ContentMeta, Doc, DocInfo, LocalDoc};
pub use error::{Error, Result};
pub use file::TreeFile;
pub use header::Header;
pub use options::{ChangesAction, DBOpenOptions, DocInfosOptions};
