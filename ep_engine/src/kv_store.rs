use std::collections::HashMap;
use std::sync::Arc;

use couchstore::{Doc, DocInfo};

use crate::config::Configuration;
use crate::error::{EngineError, EngineResult};
use crate::file_registry::{FileRegistry, FileRevision};
use crate::notifier::{CouchNotifier, NotifyOutcome};
use crate::request::{MutationStatus, PersistRequest};
use crate::vbucket::{self, CachedVBStates, VBucketState, Vbid};

/// The persistence coordinator: owns the file registry, the cached vbucket
/// states, and (for a writable instance) the notifier channel. One
/// writable instance exists per shard; any number of read-only instances
/// may exist alongside it, each with its own snapshot taken at
/// construction (sharding across OS threads is left to the host, not
/// modeled here — see `DESIGN.md`).
pub struct CouchKVStore {
    config: Configuration,
    registry: Arc<FileRegistry>,
    cached_states: Arc<CachedVBStates>,
    notifier: Option<CouchNotifier>,
    read_only: bool,
}

impl CouchKVStore {
    pub fn new(config: Configuration, read_only: bool) -> EngineResult<Self> {
        let registry = Arc::new(FileRegistry::discover(&config.dbname)?);
        let cached_states = Arc::new(CachedVBStates::new());

        let mut store = Self { config, registry, cached_states, notifier: None, read_only };
        store.populate_cached_states();

        if !read_only {
            store.notifier = Some(CouchNotifier::new(Arc::new(store.config.clone())));
        }

        Ok(store)
    }

    fn populate_cached_states(&mut self) {
        for vbid in self.registry.vbids() {
            let rev = self.registry.lookup(vbid).unwrap_or(1);
            let path = self.registry.file_name(vbid, rev);
            match couchstore::Db::open(&path, couchstore::DBOpenOptions::read_only()) {
                Ok(mut db) => {
                    let state = vbucket::read_state(&mut db, vbid);
                    self.cached_states.insert(vbid, state);
                }
                Err(e) => {
                    tracing::warn!(%vbid, revision = rev, error = %e, "failed to open vbucket file, dropping from registry");
                    self.registry.remove(vbid);
                }
            }
        }
    }

    pub fn registry(&self) -> &Arc<FileRegistry> {
        &self.registry
    }

    pub fn cached_states(&self) -> &Arc<CachedVBStates> {
        &self.cached_states
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Persists one contiguous per-vbucket run of requests (open → save →
    /// commit → notify, with retry on `ETMPFAIL`) and returns each request
    /// paired with the status its callback should receive.
    pub fn save_batch(&mut self, requests: Vec<PersistRequest>) -> EngineResult<Vec<(PersistRequest, MutationStatus)>> {
        debug_assert!(!self.read_only, "save_batch on a read-only instance");
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let vbid = requests[0].vbucket;

        loop {
            let (mut db, effective_rev) =
                self.registry.open(vbid, true).map_err(|e| EngineError::StoreTransient { vbid, source: e })?;

            let mut delete_exists: HashMap<Vec<u8>, bool> = HashMap::new();
            for req in &requests {
                if req.is_delete {
                    delete_exists.insert(req.key.clone(), db.docinfo_by_id(&req.key).is_ok());
                }
            }

            if let Some(m) = requests.iter().filter(|r| r.is_delete).map(|r| r.sequence_number).max() {
                let mut state = self.cached_states.get(vbid).unwrap_or_default();
                if m > state.max_deleted_seqno as u64 {
                    state.max_deleted_seqno = m as u32;
                    self.cached_states.insert(vbid, state);
                    vbucket::write_state(&mut db, &state)
                        .map_err(|e| EngineError::StoreTransient { vbid, source: e })?;
                }
            }

            let to_persist: Vec<&PersistRequest> = requests
                .iter()
                .filter(|r| !r.is_delete || *delete_exists.get(&r.key).unwrap_or(&false))
                .collect();

            let docs: Vec<Doc> = to_persist
                .iter()
                .map(|r| Doc { id: r.key.clone(), data: r.value.clone().unwrap_or_default() })
                .collect();
            let infos: Vec<DocInfo> = to_persist
                .iter()
                .map(|r| DocInfo {
                    id: r.key.clone(),
                    rev_seq: r.sequence_number,
                    db_seq: 0,
                    deleted: r.is_delete,
                    content_meta: r.content_meta,
                    rev_meta: r.metadata.encode().to_vec(),
                    size: r.value.as_ref().map_or(0, |v| v.len() as u64),
                })
                .collect();

            db.save_documents(&docs, &infos).map_err(|e| EngineError::StoreTransient { vbid, source: e })?;
            let header_offset = db.commit().map_err(|e| EngineError::StoreTransient { vbid, source: e })?;

            match self.notify_headerpos(vbid, effective_rev, header_offset)? {
                NotifyOutcome::Success => {
                    self.registry.set(vbid, effective_rev);
                    let statuses = requests
                        .into_iter()
                        .map(|r| {
                            let status = if r.is_delete && !*delete_exists.get(&r.key).unwrap_or(&false) {
                                MutationStatus::Dropped
                            } else {
                                MutationStatus::Success { new_item_id: if r.is_new_item { 1 } else { 0 } }
                            };
                            (r, status)
                        })
                        .collect();
                    return Ok(statuses);
                }
                NotifyOutcome::ETmpfail => {
                    tracing::debug!(%vbid, effective_rev, "notifier returned ETMPFAIL, retrying batch");
                    self.registry.set(vbid, effective_rev);
                    continue;
                }
            }
        }
    }

    fn notify_headerpos(&self, vbid: Vbid, revision: FileRevision, header_offset: u64) -> EngineResult<NotifyOutcome> {
        match &self.notifier {
            Some(notifier) => notifier.notify_headerpos_update(vbid, revision, header_offset),
            None => Ok(NotifyOutcome::Success),
        }
    }

    /// Writes only the vbstate local document, commits, and notifies via
    /// the richer `notify_vbucket_update` command.
    pub fn set_vbucket_state(&mut self, vbid: Vbid, state: VBucketState, state_changed: bool) -> EngineResult<()> {
        debug_assert!(!self.read_only, "set_vbucket_state on a read-only instance");

        loop {
            let (mut db, effective_rev) =
                self.registry.open(vbid, true).map_err(|e| EngineError::StoreTransient { vbid, source: e })?;

            vbucket::write_state(&mut db, &state).map_err(|e| EngineError::StoreTransient { vbid, source: e })?;
            let header_offset = db.commit().map_err(|e| EngineError::StoreTransient { vbid, source: e })?;

            let outcome = match &self.notifier {
                Some(notifier) => notifier.notify_vbucket_update(
                    vbid,
                    effective_rev,
                    header_offset,
                    state_changed,
                    state.state as u32,
                    state.checkpoint_id,
                )?,
                None => NotifyOutcome::Success,
            };

            match outcome {
                NotifyOutcome::Success => {
                    self.registry.set(vbid, effective_rev);
                    self.cached_states.insert(vbid, state);
                    return Ok(());
                }
                NotifyOutcome::ETmpfail => {
                    self.registry.set(vbid, effective_rev);
                    continue;
                }
            }
        }
    }

    /// Issues a global flush to the notifier and, on success, zeroes every
    /// cached vbucket's checkpoint/`max_deleted_seqno` and resets its live
    /// revision to 1.
    pub fn reset(&mut self) -> EngineResult<()> {
        debug_assert!(!self.read_only, "reset on a read-only instance");

        if let Some(notifier) = &self.notifier {
            loop {
                match notifier.flush()? {
                    NotifyOutcome::Success => break,
                    NotifyOutcome::ETmpfail => continue,
                }
            }
        }

        for vbid in self.cached_states.iter_vbids() {
            self.cached_states.insert(
                vbid,
                VBucketState { state: vbucket::VBucketStateId::Dead, checkpoint_id: 0, max_deleted_seqno: 0 },
            );
            self.registry.set(vbid, 1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path) -> Configuration {
        Configuration {
            dbname: dir.to_string_lossy().to_string(),
            couch_host: "127.0.0.1".to_string(),
            couch_port: 0,
            couch_bucket: "default".to_string(),
            couch_response_timeout_ms: 1000,
            couch_reconnect_sleeptime_ms: 100,
            allow_data_loss_during_shutdown: false,
        }
    }

    #[test]
    fn new_store_discovers_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = CouchKVStore::new(config(dir.path()), true).unwrap();
        assert_eq!(store.registry().len(), 0);
    }

    #[test]
    fn new_store_picks_up_preseeded_revision() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut db = couchstore::Db::open(dir.path().join("0.couch.7"), couchstore::DBOpenOptions::create()).unwrap();
            db.commit().unwrap();
        }
        let store = CouchKVStore::new(config(dir.path()), true).unwrap();
        assert_eq!(store.registry().lookup(Vbid::new(0)), Some(7));
    }

    #[test]
    fn save_batch_without_notifier_persists_and_records_revision() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CouchKVStore::new(config(dir.path()), false).unwrap();
        store.notifier = None;

        let request = PersistRequest {
            vbucket: Vbid::new(0),
            revision: 1,
            key: b"a".to_vec(),
            value: Some(b"1".to_vec()),
            metadata: crate::metadata::ItemMetadata::default(),
            content_meta: couchstore::ContentMeta::NON_JSON,
            sequence_number: 1,
            is_delete: false,
            is_new_item: true,
            issued_at: std::time::Instant::now(),
            callback: Box::new(|_| {}),
        };

        let outcomes = store.save_batch(vec![request]).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].1, MutationStatus::Success { new_item_id: 1 });
        assert_eq!(store.registry().lookup(Vbid::new(0)), Some(1));
        assert!(dir.path().join("0.couch.1").exists());
    }

    #[test]
    fn deleting_a_missing_key_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CouchKVStore::new(config(dir.path()), false).unwrap();
        store.notifier = None;

        let request = PersistRequest {
            vbucket: Vbid::new(0),
            revision: 1,
            key: b"missing".to_vec(),
            value: None,
            metadata: crate::metadata::ItemMetadata::default(),
            content_meta: couchstore::ContentMeta::NON_JSON,
            sequence_number: 1,
            is_delete: true,
            is_new_item: false,
            issued_at: std::time::Instant::now(),
            callback: Box::new(|_| {}),
        };

        let outcomes = store.save_batch(vec![request]).unwrap();
        assert_eq!(outcomes[0].1, MutationStatus::Dropped);
    }
}
