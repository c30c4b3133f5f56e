use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::constants::CHUNK_MAGIC_DOC;
use crate::docinfo::{Doc, DocInfo, LocalDoc};
use crate::error::{Error, Result};
use crate::file::TreeFile;
use crate::header::{self, DocIndexEntry, Header, HeaderData, LocalDocIndexEntry};
use crate::options::{ChangesAction, DBOpenOptions, DocInfosOptions};

/// A single partition file. Knows nothing about vbuckets, CAS, or the
/// notifier protocol — it stores opaque documents keyed by id, plus a
/// handful of `_local/*` metadata documents, and commits them atomically.
pub struct Db {
    path: PathBuf,
    tree: TreeFile,
    read_only: bool,
    committed: HeaderData,
    header: Header,
    pending_docs: Vec<(DocIndexEntry, Option<Vec<u8>>)>,
    pending_locals: Vec<(LocalDocIndexEntry, Vec<u8>)>,
}

impl Db {
    pub fn open(path: impl AsRef<Path>, options: DBOpenOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let exists = path.exists();
        if !exists && !options.create {
            return Err(Error::NoSuchFile);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(!options.read_only)
            .create(options.create && !options.read_only)
            .open(&path)?;

        let mut tree = TreeFile::open(file);
        let (committed, header_pos) = match header::read_latest_header(&mut tree)? {
            Some((data, pos)) => (data, pos),
            None => (HeaderData::default(), 0),
        };

        let header = Header {
            update_seq: committed.update_seq,
            purge_seq: committed.purge_seq,
            header_pos,
        };

        Ok(Self {
            path,
            tree,
            read_only: options.read_only,
            committed,
            header,
            pending_docs: Vec::new(),
            pending_locals: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn header_position(&self) -> u64 {
        self.header.header_pos
    }

    /// Stage `docs`/`infos` (parallel arrays, by position) for the next
    /// `commit`. Deleted documents (`info.deleted`) carry no body.
    pub fn save_documents(&mut self, docs: &[Doc], infos: &[DocInfo]) -> Result<()> {
        debug_assert!(!self.read_only, "save_documents on a read-only handle");
        assert_eq!(docs.len(), infos.len(), "docs/infos length mismatch");

        for (doc, info) in docs.iter().zip(infos.iter()) {
            let seq = self.header.update_seq + self.pending_docs.len() as u64 + 1;
            let offset = if info.deleted {
                0
            } else {
                let pos = self.tree.len()? as usize;
                self.tree
                    .pwrite_compressed(pos, CHUNK_MAGIC_DOC, &doc.data)? as u64
            };

            let entry = DocIndexEntry {
                id: info.id.clone(),
                offset,
                rev_seq: info.rev_seq,
                db_seq: seq,
                deleted: info.deleted,
                content_meta: info.content_meta.bits(),
                rev_meta: info.rev_meta.clone(),
                size: info.size,
            };
            self.pending_docs
                .push((entry, if info.deleted { None } else { Some(doc.data.clone()) }));
        }

        Ok(())
    }

    /// Persist everything staged since the last commit as one new header,
    /// and return the header's file offset.
    pub fn commit(&mut self) -> Result<u64> {
        debug_assert!(!self.read_only, "commit on a read-only handle");

        if self.pending_docs.is_empty() && self.pending_locals.is_empty() {
            return Ok(self.header.header_pos);
        }

        for (entry, _) in self.pending_docs.drain(..) {
            upsert_doc(&mut self.committed.docs, entry);
        }
        for (entry, _) in self.pending_locals.drain(..) {
            upsert_local(&mut self.committed.locals, entry);
        }
        self.committed.update_seq = self
            .committed
            .docs
            .iter()
            .map(|d| d.db_seq)
            .max()
            .unwrap_or(self.committed.update_seq);

        let pos = self.tree.len()? as usize;
        let header_offset = header::write_header(&mut self.tree, pos, &self.committed)?;
        self.header.header_pos = header_offset;
        self.header.update_seq = self.committed.update_seq;

        debug!(path = %self.path.display(), header_offset, "couchstore commit");
        Ok(header_offset)
    }

    pub fn docinfo_by_id(&self, id: &[u8]) -> Result<DocInfo> {
        if let Some((entry, _)) = self.pending_docs.iter().rev().find(|(e, _)| e.id == id) {
            return Ok(to_docinfo(entry));
        }
        self.committed
            .docs
            .iter()
            .find(|d| d.id == id)
            .map(to_docinfo)
            .ok_or(Error::DocNotFound)
    }

    pub fn open_doc_with_docinfo(&mut self, info: &DocInfo) -> Result<Doc> {
        if info.deleted {
            return Ok(Doc {
                id: info.id.clone(),
                data: Vec::new(),
            });
        }
        if let Some((_, Some(bytes))) = self.pending_docs.iter().find(|(e, _)| e.id == info.id) {
            return Ok(Doc {
                id: info.id.clone(),
                data: bytes.clone(),
            });
        }
        let (_, data, _) = self.tree.pread_compressed(info.offset as usize)?;
        Ok(Doc {
            id: info.id.clone(),
            data,
        })
    }

    /// Stream every live document whose `db_seq` is `> since_seq`, in
    /// ascending `db_seq` order, to `callback`. Stops early if `callback`
    /// returns [`ChangesAction::Cancel`].
    pub fn changes_since(
        &mut self,
        since_seq: u64,
        options: DocInfosOptions,
        mut callback: impl FnMut(&mut Self, &DocInfo) -> Result<ChangesAction>,
    ) -> Result<()> {
        let mut entries: Vec<DocIndexEntry> = self
            .committed
            .docs
            .iter()
            .filter(|d| d.db_seq > since_seq)
            .filter(|d| match options {
                DocInfosOptions::AllDocs => true,
                DocInfosOptions::NoDeletes => !d.deleted,
                DocInfosOptions::DeletesOnly => d.deleted,
            })
            .cloned()
            .collect();
        entries.sort_by_key(|d| d.db_seq);

        for entry in &entries {
            let info = to_docinfo(entry);
            match callback(self, &info)? {
                ChangesAction::Continue => {}
                ChangesAction::Cancel => return Err(Error::Cancel),
            }
        }

        Ok(())
    }

    pub fn open_local_document(&self, id: &str) -> Result<LocalDoc> {
        if let Some((_, bytes)) = self.pending_locals.iter().rev().find(|(e, _)| e.id == id) {
            return Ok(LocalDoc {
                id: id.to_string(),
                json: bytes.clone(),
                deleted: false,
            });
        }
        let entry = self
            .committed
            .locals
            .iter()
            .find(|l| l.id == id && !l.deleted)
            .ok_or(Error::DocNotFound)?;

        // A local document lookup only needs a read-only handle to the
        // file, so it is satisfied against an independent fd rather than
        // requiring `&mut self`.
        let file = std::fs::File::open(&self.path)?;
        let mut tree = TreeFile::open(file);
        let (_, bytes, _) = tree.pread_chunk(entry.offset as usize)?;
        Ok(LocalDoc {
            id: id.to_string(),
            json: bytes,
            deleted: false,
        })
    }

    pub fn save_local_document(&mut self, doc: &LocalDoc) -> Result<()> {
        debug_assert!(!self.read_only, "save_local_document on a read-only handle");
        let pos = self.tree.len()? as usize;
        let offset = self.tree.pwrite_chunk(pos, CHUNK_MAGIC_DOC, &doc.json)? as u64;
        self.pending_locals.push((
            LocalDocIndexEntry {
                id: doc.id.clone(),
                offset,
                deleted: doc.deleted,
            },
            doc.json.clone(),
        ));
        Ok(())
    }

    pub fn close(self) {
        // Dropping `self` releases the file handle; nothing else to flush:
        // `commit` is the only durability boundary this store offers.
    }
}

fn upsert_doc(docs: &mut Vec<DocIndexEntry>, entry: DocIndexEntry) {
    docs.retain(|d| d.id != entry.id);
    docs.push(entry);
}

fn upsert_local(locals: &mut Vec<LocalDocIndexEntry>, entry: LocalDocIndexEntry) {
    locals.retain(|l| l.id != entry.id);
    locals.push(entry);
}

fn to_docinfo(entry: &DocIndexEntry) -> DocInfo {
    DocInfo {
        id: entry.id.clone(),
        rev_seq: entry.rev_seq,
        db_seq: entry.db_seq,
        deleted: entry.deleted,
        content_meta: header::HeaderData::content_meta(entry),
        rev_meta: entry.rev_meta.clone(),
        size: entry.size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docinfo::ContentMeta;

    fn doc(id: &str, data: &[u8], rev_seq: u64, deleted: bool) -> (Doc, DocInfo) {
        (
            Doc {
                id: id.as_bytes().to_vec(),
                data: data.to_vec(),
            },
            DocInfo {
                id: id.as_bytes().to_vec(),
                rev_seq,
                db_seq: 0,
                deleted,
                content_meta: ContentMeta::JSON,
                rev_meta: vec![0u8; 16],
                size: data.len() as u64,
            },
        )
    }

    #[test]
    fn save_commit_reopen_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.couch.1");

        {
            let mut db = Db::open(&path, DBOpenOptions::create()).unwrap();
            let (d, i) = doc("a", b"{\"x\":1}", 1, false);
            db.save_documents(&[d], &[i]).unwrap();
            let pos = db.commit().unwrap();
            assert!(pos > 0 || pos == 0); // header position exists either way
        }

        let mut db = Db::open(&path, DBOpenOptions::read_only()).unwrap();
        let info = db.docinfo_by_id(b"a").unwrap();
        assert_eq!(info.rev_seq, 1);
        let got = db.open_doc_with_docinfo(&info).unwrap();
        assert_eq!(got.data, b"{\"x\":1}");
    }

    #[test]
    fn local_document_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.couch.1");

        let mut db = Db::open(&path, DBOpenOptions::create()).unwrap();
        db.save_local_document(&LocalDoc {
            id: "_local/vbstate".to_string(),
            json: br#"{"state":"active"}"#.to_vec(),
            deleted: false,
        })
        .unwrap();
        db.commit().unwrap();

        let local = db.open_local_document("_local/vbstate").unwrap();
        assert_eq!(local.json, br#"{"state":"active"}"#);

        drop(db);
        let db2 = Db::open(&path, DBOpenOptions::read_only()).unwrap();
        let local2 = db2.open_local_document("_local/vbstate").unwrap();
        assert_eq!(local2.json, br#"{"state":"active"}"#);
    }

    #[test]
    fn missing_local_document_is_doc_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.couch.1");
        let db = Db::open(&path, DBOpenOptions::create()).unwrap();
        match db.open_local_document("_local/vbstate") {
            Err(Error::DocNotFound) => {}
            other => panic!("expected DocNotFound, got {other:?}"),
        }
    }

    #[test]
    fn changes_since_orders_by_sequence_and_respects_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.couch.1");
        let mut db = Db::open(&path, DBOpenOptions::create()).unwrap();

        let (d1, i1) = doc("a", b"1", 1, false);
        let (d2, i2) = doc("b", b"2", 2, false);
        let (d3, i3) = doc("c", b"3", 3, true);
        db.save_documents(&[d1, d2, d3], &[i1, i2, i3]).unwrap();
        db.commit().unwrap();

        let mut seen = Vec::new();
        db.changes_since(0, DocInfosOptions::AllDocs, |_db, info| {
            seen.push(info.id.clone());
            Ok(ChangesAction::Continue)
        })
        .unwrap();
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

        let mut count = 0;
        let result = db.changes_since(0, DocInfosOptions::AllDocs, |_db, _info| {
            count += 1;
            if count == 2 {
                Ok(ChangesAction::Cancel)
            } else {
                Ok(ChangesAction::Continue)
            }
        });
        assert!(matches!(result, Err(Error::Cancel)));
        assert_eq!(count, 2);
    }

    #[test]
    fn deleted_documents_excluded_by_no_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.couch.1");
        let mut db = Db::open(&path, DBOpenOptions::create()).unwrap();

        let (d1, i1) = doc("a", b"1", 1, false);
        let (d2, i2) = doc("b", b"", 2, true);
        db.save_documents(&[d1, d2], &[i1, i2]).unwrap();
        db.commit().unwrap();

        let mut seen = Vec::new();
        db.changes_since(0, DocInfosOptions::NoDeletes, |_db, info| {
            seen.push(info.id.clone());
            Ok(ChangesAction::Continue)
        })
        .unwrap();
        assert_eq!(seen, vec![b"a".to_vec()]);
    }

    #[test]
    fn open_missing_without_create_is_no_such_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.couch.1");
        match Db::open(&path, DBOpenOptions::default()) {
            Err(Error::NoSuchFile) => {}
            other => panic!("expected NoSuchFile, got {other:?}"),
        }
    }
}
