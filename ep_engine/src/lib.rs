//! The persistence coordinator for a partitioned, eventually-persistent
//! key/value store: per-vbucket request batching, commit orchestration,
//! vbucket-state tracking, warmup/dump, and the notifier channel to the
//! external compaction manager. Consumes `couchstore` as its document
//! store; knows nothing about the in-memory tier above it beyond the
//! callbacks it invokes.

pub mod batcher;
pub mod config;
pub mod error;
pub mod file_registry;
pub mod kv_store;
pub mod metadata;
pub mod notifier;
pub mod request;
pub mod stats;
pub mod vbucket;
pub mod warmup;

pub use batcher::{Item, RequestBatcher};
pub use config::Configuration;
pub use error::{EngineError, EngineResult};
pub use file_registry::{FileRegistry, FileRevision};
pub use kv_store::CouchKVStore;
pub use metadata::ItemMetadata;
pub use request::{MutationStatus, PersistRequest};
pub use vbucket::{CachedVBStates, VBucketState, VBucketStateId, Vbid};
pub use warmup::{StillWarmingUp, VBucketSelection, WarmupItem};
