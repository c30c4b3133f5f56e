use std::time::Instant;

use crate::metadata::ItemMetadata;
use crate::vbucket::Vbid;
use couchstore::ContentMeta;

/// Outcome delivered to a caller's `set`/`del` callback once a commit has
/// resolved the request's fate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    /// Persisted. `new_item_id` is 1 for a newly persisted item, 0 otherwise
    /// (mirrors the source's item-id convention, not a database key).
    Success { new_item_id: i64 },
    /// The vbucket's file revision was unknown at enqueue time; the caller
    /// should not retry this request against this engine instance.
    NotMyVBucket,
    /// A delete targeted a document the store does not have; the caller
    /// should discard the mutation rather than retry it.
    Dropped,
    /// A transient store or notifier failure; the caller should re-enqueue.
    Retry,
}

pub type PersistCallback = Box<dyn FnOnce(MutationStatus) + Send>;

/// One queued set or delete, from `set`/`del` until its callback fires.
pub struct PersistRequest {
    pub vbucket: Vbid,
    pub revision: u64,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub metadata: ItemMetadata,
    pub content_meta: ContentMeta,
    pub sequence_number: u64,
    pub is_delete: bool,
    pub is_new_item: bool,
    pub issued_at: Instant,
    pub callback: PersistCallback,
}

impl PersistRequest {
    pub fn byte_len(&self) -> usize {
        self.key.len() + self.value.as_ref().map_or(0, |v| v.len())
    }
}

impl std::fmt::Debug for PersistRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistRequest")
            .field("vbucket", &self.vbucket)
            .field("revision", &self.revision)
            .field("key", &String::from_utf8_lossy(&self.key))
            .field("is_delete", &self.is_delete)
            .field("sequence_number", &self.sequence_number)
            .finish()
    }
}
