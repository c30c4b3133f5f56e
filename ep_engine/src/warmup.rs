use couchstore::{ChangesAction, DocInfosOptions};

use crate::kv_store::CouchKVStore;
use crate::metadata::ItemMetadata;
use crate::vbucket::{self, VBucketStateId, Vbid};

/// One document delivered to the warmup callback. `value` is absent for
/// keys-only loads and for deleted documents.
pub struct WarmupItem {
    pub vbucket: Vbid,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub metadata: ItemMetadata,
    pub sequence_number: u64,
    pub deleted: bool,
}

/// Consulted between documents so a long scan can stop as soon as the host
/// has finished warming up.
pub trait StillWarmingUp {
    fn still_warming_up(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VBucketSelection<'a> {
    All,
    Selected(&'a [Vbid]),
}

impl CouchKVStore {
    /// Ensures the registry is populated, opens each file, reads its
    /// vbstate, and populates the cached states — dropping any vbucket
    /// whose file fails to open.
    pub fn list_persisted_vbuckets(&mut self) {
        for vbid in self.registry().vbids() {
            let rev = self.registry().lookup(vbid).unwrap_or(1);
            let path = self.registry().file_name(vbid, rev);
            match couchstore::Db::open(&path, couchstore::DBOpenOptions::read_only()) {
                Ok(mut db) => {
                    let state = vbucket::read_state(&mut db, vbid);
                    self.cached_states().insert(vbid, state);
                }
                Err(e) => {
                    tracing::warn!(%vbid, error = %e, "failed to open vbucket file during warmup listing");
                    self.registry().remove(vbid);
                }
            }
        }
    }

    /// Streams documents from the selected vbuckets in a state-aware order,
    /// invoking `cb` for each and consulting `warming_up` for early
    /// cancellation. Vbuckets that error out mid-scan are dropped from the
    /// registry; the scan continues with the rest.
    pub fn load(
        &mut self,
        selection: VBucketSelection<'_>,
        keys_only: bool,
        warming_up: &dyn StillWarmingUp,
        mut cb: impl FnMut(WarmupItem),
    ) {
        let targets = self.target_list(selection, keys_only);

        for vbid in targets {
            if !warming_up.still_warming_up() {
                return;
            }

            let rev = match self.registry().lookup(vbid) {
                Some(rev) => rev,
                None => continue,
            };
            let path = self.registry().file_name(vbid, rev);
            let mut db = match couchstore::Db::open(&path, couchstore::DBOpenOptions::read_only()) {
                Ok(db) => db,
                Err(e) => {
                    tracing::warn!(%vbid, error = %e, "failed to open vbucket file during warmup load");
                    self.registry().remove(vbid);
                    continue;
                }
            };

            let result = db.changes_since(0, DocInfosOptions::AllDocs, |db, info| {
                let metadata = ItemMetadata::decode(&info.rev_meta).unwrap_or_default();
                let value = if keys_only || info.deleted {
                    None
                } else {
                    db.open_doc_with_docinfo(info).ok().map(|d| d.data)
                };

                cb(WarmupItem {
                    vbucket: vbid,
                    key: info.id.clone(),
                    value,
                    metadata,
                    sequence_number: info.rev_seq,
                    deleted: info.deleted,
                });

                if warming_up.still_warming_up() {
                    Ok(ChangesAction::Continue)
                } else {
                    Ok(ChangesAction::Cancel)
                }
            });

            match result {
                Ok(()) | Err(couchstore::Error::Cancel) => {}
                Err(e) => {
                    tracing::warn!(%vbid, error = %e, "warmup scan failed, dropping vbucket");
                    self.registry().remove(vbid);
                }
            }
        }
    }

    /// `dump`: a single vbucket, full data.
    pub fn dump(&mut self, vbid: Vbid, warming_up: &dyn StillWarmingUp, cb: impl FnMut(WarmupItem)) {
        self.load(VBucketSelection::Selected(&[vbid]), false, warming_up, cb);
    }

    /// `dumpKeys`: every vbucket, keys only.
    pub fn dump_keys(&mut self, warming_up: &dyn StillWarmingUp, cb: impl FnMut(WarmupItem)) {
        self.load(VBucketSelection::All, true, warming_up, cb);
    }

    /// `dumpDeleted`: every vbucket, deleted documents only. Deleted items
    /// never carry a body, so this is equivalent to a keys-only scan
    /// restricted to tombstones at the `changes_since` layer; filtering by
    /// `deleted` happens in the callback.
    pub fn dump_deleted(&mut self, warming_up: &dyn StillWarmingUp, mut cb: impl FnMut(WarmupItem)) {
        self.load(VBucketSelection::All, true, warming_up, |item| {
            if item.deleted {
                cb(item);
            }
        });
    }

    fn target_list(&mut self, selection: VBucketSelection<'_>, keys_only: bool) -> Vec<Vbid> {
        match selection {
            VBucketSelection::Selected(vbids) => vbids.to_vec(),
            VBucketSelection::All => {
                if keys_only {
                    return self.registry().vbids();
                }
                self.list_persisted_vbuckets();

                let mut actives = Vec::new();
                let mut replicas = Vec::new();
                for vbid in self.registry().vbids() {
                    match self.cached_states().get(vbid).map(|s| s.state) {
                        Some(VBucketStateId::Active) => actives.push(vbid),
                        Some(VBucketStateId::Replica) => replicas.push(vbid),
                        _ => {}
                    }
                }
                actives.extend(replicas);
                actives
            }
        }
    }
}
