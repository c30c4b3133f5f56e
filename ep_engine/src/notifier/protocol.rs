//! The memcache-style binary framing used to talk to the compaction
//! manager. Header layout is the standard 24-byte request/response frame;
//! `select_bucket` is the one opcode whose value is fixed by the public
//! wire protocol. The two custom vbucket-notification opcodes are not in
//! the retrieved peer header, so they are assigned from the vendor-private
//! range rather than guessed from the standard command set; see `DESIGN.md`.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Write};

pub const MAGIC_REQUEST: u8 = 0x80;
pub const MAGIC_RESPONSE: u8 = 0x81;

pub const HEADER_LEN: usize = 24;

pub const OPCODE_DEL_VBUCKET: u8 = 0x83;
pub const OPCODE_FLUSH: u8 = 0x08;
pub const OPCODE_SELECT_BUCKET: u8 = 0x89;
pub const OPCODE_NOTIFY_VBUCKET_UPDATE: u8 = 0x3d;
pub const OPCODE_NOTIFY_HEADERPOS_UPDATE: u8 = 0x3e;

pub const STATUS_SUCCESS: u16 = 0x0000;
pub const STATUS_ETMPFAIL: u16 = 0x0086;

/// 32-byte big-endian body of `notify_vbucket_update`.
pub struct NotifyVBucketUpdateBody {
    pub file_version: u64,
    pub header_offset: u64,
    pub state_updated: u32,
    pub state: u32,
    pub checkpoint: u64,
}

impl NotifyVBucketUpdateBody {
    pub fn encode(&self) -> [u8; 32] {
        let mut buf = [0u8; 32];
        {
            let mut cursor = Cursor::new(&mut buf[..]);
            cursor.write_u64::<BigEndian>(self.file_version).unwrap();
            cursor.write_u64::<BigEndian>(self.header_offset).unwrap();
            cursor.write_u32::<BigEndian>(self.state_updated).unwrap();
            cursor.write_u32::<BigEndian>(self.state).unwrap();
            cursor.write_u64::<BigEndian>(self.checkpoint).unwrap();
        }
        buf
    }
}

/// Builds a request frame: 24-byte header, optional extras, optional key,
/// optional body. `opaque` carries the sequence number.
pub fn build_request(opcode: u8, vbucket_id: u16, opaque: u32, extras: &[u8], key: &[u8], body: &[u8]) -> Vec<u8> {
    let total_body_len = extras.len() + key.len() + body.len();
    let mut buf = Vec::with_capacity(HEADER_LEN + total_body_len);

    buf.push(MAGIC_REQUEST);
    buf.push(opcode);
    buf.write_u16::<BigEndian>(key.len() as u16).unwrap();
    buf.push(extras.len() as u8);
    buf.push(0); // data type
    buf.write_u16::<BigEndian>(vbucket_id).unwrap();
    buf.write_u32::<BigEndian>(total_body_len as u32).unwrap();
    buf.write_u32::<BigEndian>(opaque).unwrap();
    buf.write_u64::<BigEndian>(0).unwrap(); // cas

    buf.write_all(extras).unwrap();
    buf.write_all(key).unwrap();
    buf.write_all(body).unwrap();
    buf
}

#[derive(Debug, Clone, Copy)]
pub struct ResponseHeader {
    pub opcode: u8,
    pub key_len: u16,
    pub extra_len: u8,
    pub status: u16,
    pub total_body_len: u32,
    pub opaque: u32,
}

impl ResponseHeader {
    /// Parses a 24-byte response header. Returns `None` on a bad magic byte
    /// so the caller can treat it the same as any other framing error.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        if bytes[0] != MAGIC_RESPONSE {
            return None;
        }
        let mut cursor = Cursor::new(&bytes[1..]);
        let opcode = cursor.read_u8().ok()?;
        let key_len = cursor.read_u16::<BigEndian>().ok()?;
        let extra_len = cursor.read_u8().ok()?;
        let _data_type = cursor.read_u8().ok()?;
        let status = cursor.read_u16::<BigEndian>().ok()?;
        let total_body_len = cursor.read_u32::<BigEndian>().ok()?;
        let opaque = cursor.read_u32::<BigEndian>().ok()?;
        Some(ResponseHeader { opcode, key_len, extra_len, status, total_body_len, opaque })
    }
}

/// Builds a 24-byte response frame with no body, for use by real peers and
/// by the synthetic responder in tests.
pub fn build_response(opcode: u8, opaque: u32, status: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN);
    buf.push(MAGIC_RESPONSE);
    buf.push(opcode);
    buf.write_u16::<BigEndian>(0).unwrap(); // key_len
    buf.push(0); // extra_len
    buf.push(0); // data type
    buf.write_u16::<BigEndian>(status).unwrap();
    buf.write_u32::<BigEndian>(0).unwrap(); // total_body_len
    buf.write_u32::<BigEndian>(opaque).unwrap();
    buf.write_u64::<BigEndian>(0).unwrap(); // cas
    buf
}

/// Attempts to read one complete `header + body` frame from the front of
/// `buf`. Returns the consumed length and the parsed header plus body slice
/// bounds, or `None` if the buffer doesn't yet hold a full frame.
pub fn try_parse_frame(buf: &[u8]) -> io::Result<Option<(usize, ResponseHeader)>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let header = ResponseHeader::decode(&buf[..HEADER_LEN]).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "bad response magic byte")
    })?;
    let frame_len = HEADER_LEN + header.total_body_len as usize;
    if buf.len() < frame_len {
        return Ok(None);
    }
    Ok(Some((frame_len, header)))
}
