use std::io::{Seek, SeekFrom, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc32c::crc32c;
use serde::{Deserialize, Serialize};

use crate::constants::{CHUNK_MAGIC_DOC, CHUNK_MAGIC_HEADER, FOOTER_MAGIC, FOOTER_SIZE};
use crate::docinfo::ContentMeta;
use crate::error::{Error, Result};
use crate::file::TreeFile;

/// Header fields a caller may want without decoding the whole index.
#[derive(Debug, Clone, Copy, Default)]
pub struct Header {
    pub update_seq: u64,
    pub purge_seq: u64,
    pub header_pos: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DocIndexEntry {
    pub id: Vec<u8>,
    pub offset: u64,
    pub rev_seq: u64,
    pub db_seq: u64,
    pub deleted: bool,
    pub content_meta: u8,
    pub rev_meta: Vec<u8>,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LocalDocIndexEntry {
    pub id: String,
    pub offset: u64,
    pub deleted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct HeaderData {
    pub update_seq: u64,
    pub purge_seq: u64,
    pub docs: Vec<DocIndexEntry>,
    pub locals: Vec<LocalDocIndexEntry>,
}

impl HeaderData {
    pub fn find_doc(&self, id: &[u8]) -> Option<&DocIndexEntry> {
        self.docs.iter().rev().find(|d| d.id == id)
    }

    pub fn find_local(&self, id: &str) -> Option<&LocalDocIndexEntry> {
        self.locals.iter().rev().find(|d| d.id == id && !d.deleted)
    }

    pub fn content_meta(entry: &DocIndexEntry) -> ContentMeta {
        ContentMeta::from_bits_truncate(entry.content_meta)
    }
}

/// Write `data` as a commit header chunk at `pos`, then append a fixed
/// footer record pointing at it so the next open can find it without a
/// full scan. Returns the header's own offset (the file's new "header
/// position").
pub fn write_header(tree: &mut TreeFile, pos: usize, data: &HeaderData) -> Result<u64> {
    let encoded = serde_json::to_vec(data)?;
    let header_offset = pos;
    let next = tree.pwrite_chunk(pos, CHUNK_MAGIC_HEADER, &encoded)?;
    write_footer(tree, next, header_offset as u64)?;
    Ok(header_offset as u64)
}

fn write_footer(tree: &mut TreeFile, pos: usize, header_offset: u64) -> Result<()> {
    let mut buf = [0u8; FOOTER_SIZE];
    {
        let mut cursor = std::io::Cursor::new(&mut buf[..]);
        cursor.write_u64::<BigEndian>(header_offset)?;
        cursor.write_u32::<BigEndian>(crc32c(&header_offset.to_be_bytes()))?;
        cursor.write_u32::<BigEndian>(FOOTER_MAGIC)?;
    }
    tree.file.seek(SeekFrom::Start(pos as u64))?;
    tree.file.write_all(&buf)?;
    tree.file.set_len((pos + FOOTER_SIZE) as u64)?;
    Ok(())
}

/// Locate and decode the most recent commit header. Tries the trailing
/// footer first; falls back to a linear scan from the start of the file
/// (e.g. the footer write was torn by a crash) and returns `Ok(None)` for
/// a brand-new, header-less file.
pub fn read_latest_header(tree: &mut TreeFile) -> Result<Option<(HeaderData, u64)>> {
    let len = tree.len()?;
    if len == 0 {
        return Ok(None);
    }

    if len >= FOOTER_SIZE as u64 {
        if let Some(found) = try_read_footer(tree, len)? {
            return Ok(Some(found));
        }
    }

    scan_for_last_header(tree, len)
}

fn try_read_footer(tree: &mut TreeFile, len: u64) -> Result<Option<(HeaderData, u64)>> {
    let footer_pos = len - FOOTER_SIZE as u64;
    let mut buf = [0u8; FOOTER_SIZE];
    tree.file.seek(SeekFrom::Start(footer_pos))?;
    use std::io::Read;
    tree.file.read_exact(&mut buf)?;

    let mut cursor = std::io::Cursor::new(&buf[..]);
    let header_offset = cursor.read_u64::<BigEndian>()?;
    let crc = cursor.read_u32::<BigEndian>()?;
    let magic = cursor.read_u32::<BigEndian>()?;

    if magic != FOOTER_MAGIC || crc != crc32c(&header_offset.to_be_bytes()) {
        return Ok(None);
    }

    match tree.pread_chunk(header_offset as usize) {
        Ok((CHUNK_MAGIC_HEADER, bytes, _)) => {
            let data: HeaderData = serde_json::from_slice(&bytes)?;
            Ok(Some((data, header_offset)))
        }
        _ => Ok(None),
    }
}

fn scan_for_last_header(tree: &mut TreeFile, len: u64) -> Result<Option<(HeaderData, u64)>> {
    let mut pos = 0usize;
    let mut last: Option<(HeaderData, u64)> = None;

    while (pos as u64) < len {
        let offset = pos;
        let (kind, bytes, next) = match tree.pread_chunk(pos) {
            Ok(v) => v,
            Err(_) => break,
        };
        if kind == CHUNK_MAGIC_HEADER {
            if let Ok(data) = serde_json::from_slice::<HeaderData>(&bytes) {
                last = Some((data, offset as u64));
            }
        } else if kind != CHUNK_MAGIC_DOC {
            return Err(Error::Corrupt(format!("unknown chunk tag {kind} at {offset}")));
        }
        pos = next;
    }

    Ok(last)
}
