use bitflags::bitflags;

bitflags! {
    /// Per-document content metadata. Only the two low-order semantics are
    /// meaningful to callers; the compressed bit is set internally by the
    /// store when a document body is written and is cleared again on read.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ContentMeta: u8 {
        const JSON        = 0x00;
        const NON_JSON     = 0x01;
        const COMPRESSED  = 0x80;
    }
}

impl ContentMeta {
    pub fn is_json(self) -> bool {
        !self.contains(ContentMeta::NON_JSON)
    }
}

/// Identity and revision metadata for a stored document, independent of its
/// body. Mirrors `DocInfo` in the original store: `rev_meta` is an opaque
/// blob the core controls the layout of (the 16-byte CAS/exptime/flags
/// block), not something this crate interprets.
#[derive(Debug, Clone)]
pub struct DocInfo {
    pub id: Vec<u8>,
    pub rev_seq: u64,
    pub db_seq: u64,
    pub deleted: bool,
    pub content_meta: ContentMeta,
    pub rev_meta: Vec<u8>,
    pub size: u64,
}

/// A document body paired with its id.
#[derive(Debug, Clone)]
pub struct Doc {
    pub id: Vec<u8>,
    pub data: Vec<u8>,
}

/// A `_local/*` document: small, unversioned, not part of the main
/// document sequence, not returned by `changes_since`.
#[derive(Debug, Clone)]
pub struct LocalDoc {
    pub id: String,
    pub json: Vec<u8>,
    pub deleted: bool,
}
