/// Block size used for the prefix-skipping framing in [`crate::file::TreeFile`].
///
/// Every multiple-of-`COUCH_BLOCK_SIZE` file offset carries a one-byte
/// prefix that `read_skipping_prefixes`/`write_skipping_prefixes` transparently
/// step over, the same scheme couchstore itself uses to let a reader
/// distinguish live data from block padding.
pub const COUCH_BLOCK_SIZE: usize = 4096;

/// Marks a chunk as a document body chunk.
pub const CHUNK_MAGIC_DOC: u8 = 0x00;
/// Marks a chunk as a commit header chunk.
pub const CHUNK_MAGIC_HEADER: u8 = 0x01;

/// Magic value written into the trailing footer record after each commit so
/// that open() can find the latest header in O(1) without a full file scan.
pub const FOOTER_MAGIC: u32 = 0xC0C4_57AE;
/// Size in bytes of the trailing footer record (offset ‖ crc32 ‖ magic).
pub const FOOTER_SIZE: usize = 16;
