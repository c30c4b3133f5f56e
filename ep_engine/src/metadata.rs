use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor};

use couchstore::ContentMeta;

pub const METADATA_SIZE: usize = 16;

/// `cas ‖ exptime ‖ flags`, the fixed 16-byte block persisted alongside every
/// document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ItemMetadata {
    pub cas: u64,
    pub exptime: u32,
    pub flags: u32,
}

impl ItemMetadata {
    pub fn encode(&self) -> [u8; METADATA_SIZE] {
        let mut buf = [0u8; METADATA_SIZE];
        {
            let mut cursor = Cursor::new(&mut buf[..]);
            cursor.write_u64::<BigEndian>(self.cas).unwrap();
            cursor.write_u32::<BigEndian>(self.exptime).unwrap();
            cursor.write_u32::<BigEndian>(self.flags).unwrap();
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> io::Result<Self> {
        if bytes.len() != METADATA_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("item metadata must be {} bytes, got {}", METADATA_SIZE, bytes.len()),
            ));
        }
        let mut cursor = Cursor::new(bytes);
        let cas = cursor.read_u64::<BigEndian>()?;
        let exptime = cursor.read_u32::<BigEndian>()?;
        let flags = cursor.read_u32::<BigEndian>()?;
        Ok(ItemMetadata { cas, exptime, flags })
    }
}

/// Classifies a value payload as JSON or opaque for the `content_meta` byte
/// only; the stored bytes are never rewritten.
pub fn classify_content(bytes: &[u8]) -> ContentMeta {
    let trimmed = bytes.iter().position(|b| !b.is_ascii_whitespace());
    match trimmed {
        Some(i) if bytes[i] == b'{' && serde_json::from_slice::<serde_json::Value>(bytes).is_ok() => {
            ContentMeta::JSON
        }
        _ => ContentMeta::NON_JSON,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn metadata_round_trips() {
        let mut rng = rand::thread_rng();
        for _ in 0..256 {
            let original = ItemMetadata {
                cas: rng.gen(),
                exptime: rng.gen(),
                flags: rng.gen(),
            };
            let encoded = original.encode();
            assert_eq!(encoded.len(), METADATA_SIZE);
            let decoded = ItemMetadata::decode(&encoded).unwrap();
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn decode_rejects_wrong_length() {
        assert!(ItemMetadata::decode(&[0u8; 8]).is_err());
    }

    #[test]
    fn json_classification() {
        assert_eq!(classify_content(b" { }"), ContentMeta::JSON);
        assert_eq!(classify_content(b"{bad"), ContentMeta::NON_JSON);
        assert_eq!(classify_content(b"123"), ContentMeta::NON_JSON);
        assert_eq!(classify_content(b""), ContentMeta::NON_JSON);
    }
}
