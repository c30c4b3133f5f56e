use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc32c::crc32c;

use crate::constants::COUCH_BLOCK_SIZE;
use crate::error::{Error, Result};

/// Low-level block-framed file access.
///
/// Couchstore never writes raw bytes at arbitrary offsets: every
/// `COUCH_BLOCK_SIZE`-aligned offset carries a one-byte prefix, and every
/// logical chunk is itself prefixed with a 4-byte length (high bit
/// reserved) and a 4-byte CRC32C of its payload. `TreeFile` hides that
/// framing from the rest of the crate.
pub struct TreeFile {
    pub(crate) file: File,
}

impl TreeFile {
    pub fn open(file: File) -> Self {
        Self { file }
    }

    pub fn len(&mut self) -> Result<u64> {
        Ok(self.file.seek(SeekFrom::End(0))?)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Read `buf.len()` bytes starting at `*pos`, transparently stepping
    /// over the one-byte block prefixes. `*pos` is advanced past the read.
    pub fn read_skipping_prefixes(&mut self, pos: &mut usize, mut buf: &mut [u8]) -> Result<()> {
        if *pos % COUCH_BLOCK_SIZE == 0 {
            *pos += 1;
        }

        while !buf.is_empty() {
            let mut read_size = COUCH_BLOCK_SIZE - (*pos % COUCH_BLOCK_SIZE);
            if read_size > buf.len() {
                read_size = buf.len();
            }

            self.file.seek(SeekFrom::Start(*pos as u64))?;
            let got_bytes = self.file.read(&mut buf[..read_size])?;

            if got_bytes == 0 {
                return Err(Error::Corrupt("unexpected end of file".into()));
            }

            *pos += got_bytes;
            buf = &mut buf[got_bytes..];

            if *pos % COUCH_BLOCK_SIZE == 0 {
                *pos += 1;
            }
        }

        Ok(())
    }

    /// Write `buf` starting at `*pos`, inserting the one-byte block
    /// prefixes as needed. `*pos` is advanced past the write.
    pub fn write_skipping_prefixes(&mut self, pos: &mut usize, mut buf: &[u8]) -> Result<()> {
        if *pos % COUCH_BLOCK_SIZE == 0 {
            self.file.seek(SeekFrom::Start(*pos as u64))?;
            self.file.write_all(&[0u8])?;
            *pos += 1;
        }

        while !buf.is_empty() {
            let mut write_size = COUCH_BLOCK_SIZE - (*pos % COUCH_BLOCK_SIZE);
            if write_size > buf.len() {
                write_size = buf.len();
            }

            self.file.seek(SeekFrom::Start(*pos as u64))?;
            self.file.write_all(&buf[..write_size])?;

            *pos += write_size;
            buf = &buf[write_size..];

            if *pos % COUCH_BLOCK_SIZE == 0 {
                self.file.seek(SeekFrom::Start(*pos as u64))?;
                self.file.write_all(&[0u8])?;
                *pos += 1;
            }
        }

        Ok(())
    }

    /// Write `payload` as a framed chunk at `pos`, tagged with `kind` (a
    /// caller-chosen discriminant, see [`crate::constants::CHUNK_MAGIC_DOC`]
    /// and [`crate::constants::CHUNK_MAGIC_HEADER`]), and return the offset
    /// immediately following it.
    pub fn pwrite_chunk(&mut self, pos: usize, kind: u8, payload: &[u8]) -> Result<usize> {
        let mut header = [0u8; 9];
        header[0] = kind;
        {
            let mut cursor = std::io::Cursor::new(&mut header[1..]);
            cursor.write_u32::<BigEndian>(payload.len() as u32)?;
            cursor.write_u32::<BigEndian>(crc32c(payload))?;
        }

        let mut p = pos;
        self.write_skipping_prefixes(&mut p, &header)?;
        self.write_skipping_prefixes(&mut p, payload)?;
        Ok(p)
    }

    /// Read back a chunk written by [`Self::pwrite_chunk`]; returns its
    /// `kind` tag, payload, and the offset immediately following it.
    pub fn pread_chunk(&mut self, pos: usize) -> Result<(u8, Vec<u8>, usize)> {
        let mut info = [0u8; 9];
        let mut p = pos;
        self.read_skipping_prefixes(&mut p, &mut info)?;

        let kind = info[0];
        let mut cursor = std::io::Cursor::new(&info[1..]);
        let chunk_len = cursor.read_u32::<BigEndian>()? & !0x8000_0000;
        let crc32 = cursor.read_u32::<BigEndian>()?;

        let mut buf = vec![0u8; chunk_len as usize];
        self.read_skipping_prefixes(&mut p, &mut buf)?;

        let crc32_calc = crc32c(&buf);
        if crc32 != crc32_calc {
            return Err(Error::ChecksumMismatch { offset: pos as u64 });
        }

        Ok((kind, buf, p))
    }

    /// Compress `payload` with the raw snappy frame (couchstore does not
    /// use the framed snappy format) and write it as a tagged chunk.
    pub fn pwrite_compressed(&mut self, pos: usize, kind: u8, payload: &[u8]) -> Result<usize> {
        let compressed = snap::raw::Encoder::new()
            .compress_vec(payload)
            .map_err(|e| Error::Corrupt(e.to_string()))?;
        self.pwrite_chunk(pos, kind, &compressed)
    }

    pub fn pread_compressed(&mut self, pos: usize) -> Result<(u8, Vec<u8>, usize)> {
        let (kind, compressed, next) = self.pread_chunk(pos)?;
        let payload = snap::raw::Decoder::new()
            .decompress_vec(&compressed)
            .map_err(|e| Error::Corrupt(e.to_string()))?;
        Ok((kind, payload, next))
    }
}
