use std::fmt;
use std::str::FromStr;

use dashmap::DashMap;
use serde::Deserialize;

use couchstore::Db;

const LOCAL_DOC_VBSTATE: &str = "_local/vbstate";

/// Identifies a logical partition of the keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Vbid(pub u16);

impl Vbid {
    pub fn new(id: u16) -> Self {
        Vbid(id)
    }
}

impl fmt::Display for Vbid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VBucketStateId {
    Active,
    Replica,
    Pending,
    Dead,
}

impl Default for VBucketStateId {
    fn default() -> Self {
        VBucketStateId::Dead
    }
}

impl fmt::Display for VBucketStateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VBucketStateId::Active => "active",
            VBucketStateId::Replica => "replica",
            VBucketStateId::Pending => "pending",
            VBucketStateId::Dead => "dead",
        };
        f.write_str(s)
    }
}

impl FromStr for VBucketStateId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(VBucketStateId::Active),
            "replica" => Ok(VBucketStateId::Replica),
            "pending" => Ok(VBucketStateId::Pending),
            "dead" => Ok(VBucketStateId::Dead),
            _ => Err(()),
        }
    }
}

/// `_local/vbstate`, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VBucketState {
    pub state: VBucketStateId,
    pub checkpoint_id: u64,
    pub max_deleted_seqno: u32,
}

/// Process-wide `vbid -> state` cache, populated by discovery and kept
/// current by commits and explicit snapshots.
#[derive(Default)]
pub struct CachedVBStates {
    inner: DashMap<Vbid, VBucketState>,
}

impl CachedVBStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, vbid: Vbid) -> Option<VBucketState> {
        self.inner.get(&vbid).map(|e| *e)
    }

    pub fn insert(&self, vbid: Vbid, state: VBucketState) {
        self.inner.insert(vbid, state);
    }

    pub fn remove(&self, vbid: Vbid) {
        self.inner.remove(&vbid);
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn iter_vbids(&self) -> Vec<Vbid> {
        self.inner.iter().map(|e| *e.key()).collect()
    }
}

#[derive(Deserialize)]
struct RawVBState {
    state: String,
    checkpoint_id: String,
    max_deleted_seqno: String,
}

/// Reads `_local/vbstate`. Any absence or malformed field falls back to the
/// default `dead`/0/0 state rather than propagating an error.
pub fn read_state(db: &mut Db, vbid: Vbid) -> VBucketState {
    let local = match db.open_local_document(LOCAL_DOC_VBSTATE) {
        Ok(local) => local,
        Err(couchstore::Error::DocNotFound) => return VBucketState::default(),
        Err(e) => {
            tracing::warn!(%vbid, error = %e, "failed to open _local/vbstate, using default");
            return VBucketState::default();
        }
    };

    match parse_state(&local.json) {
        Ok(state) => state,
        Err(e) => {
            tracing::warn!(%vbid, error = %e, "malformed _local/vbstate, using default");
            VBucketState::default()
        }
    }
}

fn parse_state(json: &[u8]) -> Result<VBucketState, String> {
    let raw: RawVBState = serde_json::from_slice(json).map_err(|e| e.to_string())?;
    let state = VBucketStateId::from_str(&raw.state).map_err(|_| format!("unknown state {:?}", raw.state))?;
    let checkpoint_id = raw.checkpoint_id.parse().map_err(|_| "bad checkpoint_id".to_string())?;
    let max_deleted_seqno = raw
        .max_deleted_seqno
        .parse()
        .map_err(|_| "bad max_deleted_seqno".to_string())?;
    Ok(VBucketState { state, checkpoint_id, max_deleted_seqno })
}

/// Writes `_local/vbstate`. Does not commit; the caller does that once it
/// has finished staging everything else for this header.
pub fn write_state(db: &mut Db, state: &VBucketState) -> couchstore::Result<()> {
    let json = serde_json::json!({
        "state": state.state.to_string(),
        "checkpoint_id": state.checkpoint_id.to_string(),
        "max_deleted_seqno": state.max_deleted_seqno.to_string(),
    });
    let doc = couchstore::LocalDoc {
        id: LOCAL_DOC_VBSTATE.to_string(),
        json: serde_json::to_vec(&json).expect("vbstate json is always serializable"),
        deleted: false,
    };
    db.save_local_document(&doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_display_and_from_str() {
        for s in [VBucketStateId::Active, VBucketStateId::Replica, VBucketStateId::Pending, VBucketStateId::Dead] {
            assert_eq!(VBucketStateId::from_str(&s.to_string()).unwrap(), s);
        }
    }

    #[test]
    fn unknown_state_string_does_not_parse() {
        assert!(VBucketStateId::from_str("bogus").is_err());
    }
}
