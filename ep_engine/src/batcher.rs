use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use crate::file_registry::FileRegistry;
use crate::kv_store::CouchKVStore;
use crate::metadata::{classify_content, ItemMetadata};
use crate::request::{MutationStatus, PersistCallback, PersistRequest};
use crate::vbucket::Vbid;
use crate::error::EngineResult;

/// The caller-supplied half of a `PersistRequest`: everything known before
/// the file revision is resolved.
pub struct Item {
    pub vbucket: Vbid,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub metadata: ItemMetadata,
    pub sequence_number: u64,
    pub is_new_item: bool,
}

/// Queues set/delete requests for one writable [`CouchKVStore`] instance,
/// groups them by vbucket, and hands them to the coordinator on `commit`.
///
/// Not concurrency-safe with itself: `begin_transaction`/`set`/`del`/`commit`
/// must be serialized by the caller, matching the single-writer discipline
/// of the instance it batches for.
pub struct RequestBatcher {
    registry: Arc<FileRegistry>,
    pending: VecDeque<PersistRequest>,
    in_transaction: bool,
}

impl RequestBatcher {
    pub fn new(registry: Arc<FileRegistry>) -> Self {
        Self { registry, pending: VecDeque::new(), in_transaction: false }
    }

    pub fn begin_transaction(&mut self) {
        debug_assert!(!self.in_transaction, "begin_transaction called while a transaction is already open");
        self.in_transaction = true;
    }

    pub fn set(&mut self, item: Item, cb: PersistCallback) {
        self.enqueue(item, false, cb);
    }

    pub fn del(&mut self, item: Item, cb: PersistCallback) {
        self.enqueue(item, true, cb);
    }

    fn enqueue(&mut self, item: Item, is_delete: bool, cb: PersistCallback) {
        debug_assert!(self.in_transaction, "set/del called without an open transaction");

        let revision = match self.registry.lookup(item.vbucket) {
            Some(rev) => rev,
            None => {
                cb(MutationStatus::NotMyVBucket);
                return;
            }
        };

        let content_meta = item.value.as_deref().map(classify_content).unwrap_or_default();

        self.pending.push_back(PersistRequest {
            vbucket: item.vbucket,
            revision,
            key: item.key,
            value: item.value,
            metadata: item.metadata,
            content_meta,
            sequence_number: item.sequence_number,
            is_delete,
            is_new_item: item.is_new_item,
            issued_at: Instant::now(),
            callback: cb,
        });
    }

    /// Stable-sorts the pending queue by `(vbucket, key)` to maximize
    /// locality within the store's bulk insert.
    pub fn optimize_writes(&mut self) {
        self.pending.make_contiguous().sort_by(|a, b| (a.vbucket, &a.key).cmp(&(b.vbucket, &b.key)));
    }

    /// Drains the queue into contiguous per-vbucket runs, hands each run to
    /// the coordinator, and dispatches every request's callback from the
    /// returned statuses.
    pub fn commit(&mut self, store: &mut CouchKVStore) -> EngineResult<()> {
        debug_assert!(self.in_transaction, "commit called without an open transaction");
        self.in_transaction = false;

        let requests: Vec<PersistRequest> = self.pending.drain(..).collect();
        for run in group_by_vbucket(requests) {
            let outcomes = store.save_batch(run)?;
            for (request, status) in outcomes {
                (request.callback)(status);
            }
        }
        Ok(())
    }
}

fn group_by_vbucket(requests: Vec<PersistRequest>) -> Vec<Vec<PersistRequest>> {
    let mut runs: Vec<Vec<PersistRequest>> = Vec::new();
    for request in requests {
        match runs.last_mut() {
            Some(run) if run[0].vbucket == request.vbucket => run.push(request),
            _ => runs.push(vec![request]),
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(vbid: Vbid, rev: u64) -> Arc<FileRegistry> {
        let registry = FileRegistry::new("/tmp/ep_engine-batcher-test");
        registry.set(vbid, rev);
        Arc::new(registry)
    }

    #[test]
    fn unknown_vbucket_fails_synchronously_without_queueing() {
        let registry = Arc::new(FileRegistry::new("/tmp/ep_engine-batcher-test"));
        let mut batcher = RequestBatcher::new(registry);
        batcher.begin_transaction();

        let observed = Arc::new(parking_lot::Mutex::new(None));
        let observed2 = observed.clone();
        batcher.set(
            Item {
                vbucket: Vbid::new(9),
                key: b"k".to_vec(),
                value: Some(b"v".to_vec()),
                metadata: ItemMetadata::default(),
                sequence_number: 1,
                is_new_item: true,
            },
            Box::new(move |status| *observed2.lock() = Some(status)),
        );

        assert_eq!(*observed.lock(), Some(MutationStatus::NotMyVBucket));
        assert_eq!(batcher.pending.len(), 0);
    }

    #[test]
    fn optimize_writes_orders_by_vbucket_then_key() {
        let registry = registry_with(Vbid::new(0), 1);
        registry.set(Vbid::new(1), 1);
        let mut batcher = RequestBatcher::new(registry);
        batcher.begin_transaction();

        for (vbid, key) in [(1u16, b"b".to_vec()), (0u16, b"z".to_vec()), (0u16, b"a".to_vec())] {
            batcher.set(
                Item {
                    vbucket: Vbid::new(vbid),
                    key,
                    value: Some(b"v".to_vec()),
                    metadata: ItemMetadata::default(),
                    sequence_number: 1,
                    is_new_item: true,
                },
                Box::new(|_| {}),
            );
        }

        batcher.optimize_writes();
        let ordered: Vec<(u16, Vec<u8>)> =
            batcher.pending.iter().map(|r| (r.vbucket.0, r.key.clone())).collect();
        assert_eq!(
            ordered,
            vec![(0, b"a".to_vec()), (0, b"z".to_vec()), (1, b"b".to_vec())]
        );
    }
}
