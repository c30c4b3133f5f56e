use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::vbucket::Vbid;

pub type FileRevision = u64;

/// `vbid -> current file revision`, populated by [`FileRegistry::discover`]
/// and kept current as the coordinator promotes files.
pub struct FileRegistry {
    inner: RwLock<HashMap<Vbid, FileRevision>>,
    dir: PathBuf,
}

impl FileRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { inner: RwLock::new(HashMap::new()), dir: dir.into() }
    }

    /// Enumerates `<vbid>.couch.<rev>` files in `dir`. `.compact` temporaries
    /// are ignored. When a vbucket has multiple files, the highest revision
    /// wins.
    pub fn discover(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        let mut map = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(n) => n,
                None => continue,
            };
            if let Some((vbid, rev)) = parse_partition_file_name(name) {
                map.entry(vbid)
                    .and_modify(|existing: &mut FileRevision| {
                        if rev > *existing {
                            *existing = rev;
                        }
                    })
                    .or_insert(rev);
            }
        }
        Ok(Self { inner: RwLock::new(map), dir })
    }

    pub fn lookup(&self, vbid: Vbid) -> Option<FileRevision> {
        self.inner.read().get(&vbid).copied()
    }

    /// Numerically highest `<vbid>.couch.<rev>` revision on disk, or 0 if
    /// none exists.
    pub fn scan_for_new_rev(&self, vbid: Vbid) -> FileRevision {
        let prefix = format!("{}.couch.", vbid);
        let mut highest = 0;
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(n) => n,
                None => continue,
            };
            if let Some(rev_str) = name.strip_prefix(&prefix) {
                if let Ok(rev) = rev_str.parse::<FileRevision>() {
                    if rev > highest {
                        highest = rev;
                    }
                }
            }
        }
        highest
    }

    pub fn set(&self, vbid: Vbid, rev: FileRevision) {
        let mut map = self.inner.write();
        match map.get(&vbid) {
            Some(existing) if *existing > rev => {}
            _ => {
                map.insert(vbid, rev);
            }
        }
    }

    pub fn remove(&self, vbid: Vbid) {
        self.inner.write().remove(&vbid);
    }

    pub fn file_name(&self, vbid: Vbid, rev: FileRevision) -> PathBuf {
        self.dir.join(format!("{}.couch.{}", vbid, rev))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn vbids(&self) -> Vec<Vbid> {
        self.inner.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// File open policy shared by the persistence coordinator and the
    /// warmup engine: try the cached revision read-only; on failure, rescan
    /// for a revision the compaction peer may have advanced to without
    /// notifying us; if that also fails and the caller wants create
    /// semantics, create at the originally cached revision. Returns the
    /// effective revision the caller must record.
    pub fn open(&self, vbid: Vbid, create: bool) -> couchstore::Result<(couchstore::Db, FileRevision)> {
        // 0 is `scan_for_new_rev`'s "nothing on disk" sentinel, never a real
        // revision; a vbucket nobody has recorded yet starts at 1.
        let cached_rev = self.lookup(vbid).unwrap_or(1);

        if let Ok(db) = couchstore::Db::open(self.file_name(vbid, cached_rev), couchstore::DBOpenOptions::read_only())
        {
            return Ok((db, cached_rev));
        }

        let scanned = self.scan_for_new_rev(vbid);
        if scanned > cached_rev {
            if let Ok(db) =
                couchstore::Db::open(self.file_name(vbid, scanned), couchstore::DBOpenOptions::read_only())
            {
                return Ok((db, scanned));
            }
        }

        if create {
            let db = couchstore::Db::open(self.file_name(vbid, cached_rev), couchstore::DBOpenOptions::create())?;
            return Ok((db, cached_rev));
        }

        Err(couchstore::Error::NoSuchFile)
    }
}

fn parse_partition_file_name(name: &str) -> Option<(Vbid, FileRevision)> {
    if !name.contains(".couch.") || name.ends_with(".compact") {
        return None;
    }
    let mut parts = name.splitn(3, '.');
    let vbid_part = parts.next()?;
    let marker = parts.next()?;
    let rev_part = parts.next()?;
    if marker != "couch" {
        return None;
    }
    let vbid: u16 = vbid_part.parse().ok()?;
    let rev: FileRevision = rev_part.parse().ok()?;
    Some((Vbid::new(vbid), rev))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn touch(dir: &Path, name: &str) {
        File::create(dir.join(name)).unwrap();
    }

    #[test]
    fn highest_revision_wins() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "5.couch.3");
        touch(dir.path(), "5.couch.7");
        touch(dir.path(), "5.couch.4");
        let registry = FileRegistry::discover(dir.path()).unwrap();
        assert_eq!(registry.lookup(Vbid::new(5)), Some(7));
    }

    #[test]
    fn compact_files_excluded() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "5.couch.3");
        touch(dir.path(), "5.couch.3.compact");
        let registry = FileRegistry::discover(dir.path()).unwrap();
        assert_eq!(registry.lookup(Vbid::new(5)), Some(3));
    }

    #[test]
    fn discovery_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "1.couch.1");
        touch(dir.path(), "2.couch.9");
        let first = FileRegistry::discover(dir.path()).unwrap();
        let second = FileRegistry::discover(dir.path()).unwrap();
        assert_eq!(first.lookup(Vbid::new(1)), second.lookup(Vbid::new(1)));
        assert_eq!(first.lookup(Vbid::new(2)), second.lookup(Vbid::new(2)));
    }

    #[test]
    fn scan_for_new_rev_finds_highest_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "3.couch.1");
        touch(dir.path(), "3.couch.2");
        let registry = FileRegistry::new(dir.path());
        assert_eq!(registry.scan_for_new_rev(Vbid::new(3)), 2);
        assert_eq!(registry.scan_for_new_rev(Vbid::new(4)), 0);
    }

    #[test]
    fn set_does_not_go_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::new(dir.path());
        registry.set(Vbid::new(1), 5);
        registry.set(Vbid::new(1), 3);
        assert_eq!(registry.lookup(Vbid::new(1)), Some(5));
        registry.set(Vbid::new(1), 9);
        assert_eq!(registry.lookup(Vbid::new(1)), Some(9));
    }
}
