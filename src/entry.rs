//! Cache entries and the on-disk record codec.
//!
//! Each cache file is one record:
//!
//! ```text
//! +--------------------------------------+ offset 0
//! | preamble (version, key, timestamp,   |
//! |  checksums, sizes, trailing CRC)     |
//! +--------------------------------------+ header_offset
//! | response header bytes                |
//! +--------------------------------------+
//! | zero fill to the next page boundary  |
//! +--------------------------------------+ body_offset (page aligned)
//! | response body bytes                  |
//! +--------------------------------------+ body_offset + body_size
//! ```
//!
//! All fields are little-endian. The body starts on a page boundary so it
//! can be memory-mapped straight out of the file; the preamble and header
//! are small and are copied into RAM instead. A record that fails any
//! check decodes to `None` and the caller treats the entry as absent.

use crate::data::Data;
use crate::fs::{page_size, round_up_to_page};
use crate::io;
use crate::key::{HASH_SIZE, Key};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{CRC_32_ISCSI, Crc};
use std::fs::File;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// On-disk format version; bump on incompatible codec changes.
pub const VERSION: u32 = 1;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Preamble size excluding the variable-length partition name.
const PREAMBLE_FIXED_SIZE: usize = 4 + 2 + HASH_SIZE + 8 + 4 + 8 + 4 + 8 + 4;

pub(crate) fn checksum(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn timestamp_now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

/// One cached response: key, store time, opaque header and body blobs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    /// The key this entry is stored under.
    pub key: Key,
    /// Wall-clock milliseconds at store time.
    pub timestamp: i64,
    /// Serialized response metadata.
    pub header: Data,
    /// Response payload; may be empty, and after a successful retrieve is a
    /// memory-mapped view of the cache file.
    pub body: Data,
}

impl Entry {
    /// Create an entry stamped with the current wall-clock time.
    pub fn new(key: Key, header: impl Into<Data>, body: impl Into<Data>) -> Self {
        Self::with_timestamp(key, timestamp_now_ms(), header, body)
    }

    /// Create an entry with an explicit timestamp.
    pub fn with_timestamp(
        key: Key,
        timestamp: i64,
        header: impl Into<Data>,
        body: impl Into<Data>,
    ) -> Self {
        Self {
            key,
            timestamp,
            header: header.into(),
            body: body.into(),
        }
    }
}

/// Decoded preamble fields plus the derived offsets.
#[derive(Clone, Debug)]
pub(crate) struct EntryMetadata {
    pub cache_version: u32,
    pub key: Key,
    pub timestamp: i64,
    pub header_checksum: u32,
    pub header_size: u64,
    pub body_checksum: u32,
    pub body_size: u64,
    pub header_offset: u64,
    pub body_offset: u64,
}

fn encode_preamble(entry: &Entry) -> BytesMut {
    let partition = entry.key.partition().as_bytes();
    debug_assert!(partition.len() <= u16::MAX as usize);

    let mut buf =
        BytesMut::with_capacity(PREAMBLE_FIXED_SIZE + partition.len() + entry.header.len());
    buf.put_u32_le(VERSION);
    buf.put_u16_le(partition.len() as u16);
    buf.put_slice(partition);
    buf.put_slice(entry.key.hash());
    buf.put_i64_le(entry.timestamp);
    buf.put_u32_le(checksum(entry.header.as_slice()));
    buf.put_u64_le(entry.header.len() as u64);
    buf.put_u32_le(checksum(entry.body.as_slice()));
    buf.put_u64_le(entry.body.len() as u64);
    let trailing = checksum(&buf);
    buf.put_u32_le(trailing);
    buf
}

fn encode_entry_header_mut(entry: &Entry) -> BytesMut {
    let mut buf = encode_preamble(entry);
    buf.put_slice(entry.header.as_slice());
    let body_offset = round_up_to_page(buf.len() as u64) as usize;
    buf.resize(body_offset, 0);
    buf
}

/// Encode everything before the body: preamble, header, zero fill up to the
/// page boundary the body would start at.
pub(crate) fn encode_entry_header(entry: &Entry) -> Bytes {
    encode_entry_header_mut(entry).freeze()
}

/// Encode the full on-disk record.
pub(crate) fn encode_entry(entry: &Entry) -> Bytes {
    let mut buf = encode_entry_header_mut(entry);
    buf.put_slice(entry.body.as_slice());
    buf.freeze()
}

fn decode_metadata(file_data: &[u8]) -> Option<EntryMetadata> {
    let mut buf = file_data;

    if buf.remaining() < 4 + 2 {
        return None;
    }
    let cache_version = buf.get_u32_le();
    let partition_len = buf.get_u16_le() as usize;
    if partition_len == 0 || buf.remaining() < partition_len + HASH_SIZE {
        return None;
    }
    let partition = std::str::from_utf8(&buf[..partition_len]).ok()?.to_owned();
    buf.advance(partition_len);
    let mut hash = [0u8; HASH_SIZE];
    buf.copy_to_slice(&mut hash);

    if buf.remaining() < 8 + 4 + 8 + 4 + 8 + 4 {
        return None;
    }
    let timestamp = buf.get_i64_le();
    let header_checksum = buf.get_u32_le();
    let header_size = buf.get_u64_le();
    let body_checksum = buf.get_u32_le();
    let body_size = buf.get_u64_le();

    let trailing_offset = file_data.len() - buf.remaining();
    let trailing = buf.get_u32_le();
    if trailing != checksum(&file_data[..trailing_offset]) {
        return None;
    }

    let header_offset = (trailing_offset + 4) as u64;
    let header_end = header_offset.checked_add(header_size)?;
    let body_offset = header_end.checked_next_multiple_of(page_size())?;
    body_offset.checked_add(body_size)?;

    Some(EntryMetadata {
        cache_version,
        key: Key::new(partition, hash),
        timestamp,
        header_checksum,
        header_size,
        body_checksum,
        body_size,
        header_offset,
        body_offset,
    })
}

/// Decode the preamble and header of a record, without touching the body.
///
/// Used by traversal, which reads only the first stretch of each file.
pub(crate) fn decode_entry_header(file_data: &[u8]) -> Option<(EntryMetadata, Data)> {
    let metadata = decode_metadata(file_data)?;
    if metadata.cache_version != VERSION {
        return None;
    }
    // Sizes come straight from file bytes; a corrupt record must decode to
    // None, never overflow.
    let header_end = metadata.header_offset.checked_add(metadata.header_size)?;
    if header_end > metadata.body_offset {
        return None;
    }

    let start = metadata.header_offset as usize;
    let end = start.checked_add(metadata.header_size as usize)?;
    if end > file_data.len() {
        return None;
    }
    let header = &file_data[start..end];
    if checksum(header) != metadata.header_checksum {
        warn!(key = ?metadata.key, "header checksum mismatch");
        return None;
    }
    Some((metadata, Data::from(header)))
}

/// Fully decode a record read from `file`, verifying it against
/// `expected_key`. The body is returned as a memory-mapped view.
pub(crate) fn decode_entry(file_data: &[u8], file: &File, expected_key: &Key) -> Option<Entry> {
    let (metadata, header) = decode_entry_header(file_data)?;

    if metadata.key != *expected_key {
        return None;
    }
    if metadata.body_offset.checked_add(metadata.body_size)? != file_data.len() as u64 {
        return None;
    }

    let body = io::map_file(file, metadata.body_offset, metadata.body_size)?;
    if checksum(&body) != metadata.body_checksum {
        warn!(key = ?metadata.key, "body checksum mismatch");
        return None;
    }

    Some(Entry {
        key: metadata.key,
        timestamp: metadata.timestamp,
        header,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::page_size;
    use std::io::Write;
    use tempfile::tempdir;

    fn test_entry(body: Vec<u8>) -> Entry {
        let key = Key::from_fingerprint("partition", b"https://example.com/");
        Entry::with_timestamp(key, 1_700_000_000_123, vec![1u8, 2, 3, 4, 5], body)
    }

    fn write_record(bytes: &[u8]) -> (tempfile::TempDir, File) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("record");
        let mut file = File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        (dir, File::open(&path).unwrap())
    }

    #[test]
    fn test_encode_layout() {
        let entry = test_entry(vec![9u8; 100]);
        let encoded = encode_entry(&entry);
        let header_part = encode_entry_header(&entry);

        assert_eq!(header_part.len() as u64 % page_size(), 0);
        assert_eq!(encoded.len(), header_part.len() + entry.body.len());
        assert_eq!(&encoded[..header_part.len()], &header_part[..]);
    }

    #[test]
    fn test_round_trip() {
        let body: Vec<u8> = (0..page_size() as usize * 2 + 17)
            .map(|i| (i % 251) as u8)
            .collect();
        let entry = test_entry(body);
        let encoded = encode_entry(&entry);
        let (_dir, file) = write_record(&encoded);

        let decoded = decode_entry(&encoded, &file, &entry.key).unwrap();
        assert_eq!(decoded, entry);
        assert!(decoded.body.is_mapped());
    }

    #[test]
    fn test_round_trip_empty_body() {
        let entry = test_entry(Vec::new());
        let encoded = encode_entry(&entry);
        let (_dir, file) = write_record(&encoded);

        let decoded = decode_entry(&encoded, &file, &entry.key).unwrap();
        assert_eq!(decoded, entry);
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn test_truncated_record_rejected() {
        let entry = test_entry(vec![5u8; 4096]);
        let encoded = encode_entry(&entry);
        let truncated = &encoded[..encoded.len() - 1];
        let (_dir, file) = write_record(truncated);

        assert!(decode_entry(truncated, &file, &entry.key).is_none());
    }

    #[test]
    fn test_corrupt_preamble_rejected() {
        let entry = test_entry(vec![5u8; 64]);
        let mut encoded = encode_entry(&entry).to_vec();
        encoded[0] ^= 0xff;
        let (_dir, file) = write_record(&encoded);

        assert!(decode_entry(&encoded, &file, &entry.key).is_none());
    }

    #[test]
    fn test_corrupt_header_rejected() {
        let entry = test_entry(vec![5u8; 64]);
        let header_offset = encode_preamble(&entry).len();
        let mut encoded = encode_entry(&entry).to_vec();
        encoded[header_offset] ^= 0xff;
        let (_dir, file) = write_record(&encoded);

        assert!(decode_entry(&encoded, &file, &entry.key).is_none());
    }

    #[test]
    fn test_corrupt_body_rejected() {
        let entry = test_entry(vec![5u8; 64]);
        let encoded = encode_entry(&entry).to_vec();
        let mut corrupted = encoded.clone();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xff;
        let (_dir, file) = write_record(&corrupted);

        assert!(decode_entry(&corrupted, &file, &entry.key).is_none());
    }

    #[test]
    fn test_key_mismatch_rejected() {
        let entry = test_entry(vec![5u8; 64]);
        let encoded = encode_entry(&entry);
        let (_dir, file) = write_record(&encoded);

        let other = Key::from_fingerprint("partition", b"https://example.com/other");
        assert!(decode_entry(&encoded, &file, &other).is_none());
        let other_partition = Key::new("elsewhere", *entry.key.hash());
        assert!(decode_entry(&encoded, &file, &other_partition).is_none());
    }

    #[test]
    fn test_header_decodes_from_prefix() {
        // Traversal reads a bounded prefix of the file; the header must
        // decode without the body bytes present.
        let entry = test_entry(vec![3u8; page_size() as usize * 8]);
        let encoded = encode_entry(&entry);
        let prefix = &encoded[..16 * 1024];

        let (metadata, header) = decode_entry_header(prefix).unwrap();
        assert_eq!(metadata.key, entry.key);
        assert_eq!(metadata.timestamp, entry.timestamp);
        assert_eq!(metadata.body_size, entry.body.len() as u64);
        assert_eq!(header, entry.header);
    }

    #[test]
    fn test_empty_input_rejected() {
        assert!(decode_entry_header(&[]).is_none());
        assert!(decode_entry_header(&[0u8; 16]).is_none());
    }

    /// A preamble with a valid trailing checksum but arbitrary size fields,
    /// as a corrupted or crafted record could carry.
    fn raw_preamble(header_size: u64, body_size: u64) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32_le(VERSION);
        buf.put_u16_le(1);
        buf.put_slice(b"p");
        buf.put_slice(&[0u8; HASH_SIZE]);
        buf.put_i64_le(0);
        buf.put_u32_le(checksum(&[]));
        buf.put_u64_le(header_size);
        buf.put_u32_le(checksum(&[]));
        buf.put_u64_le(body_size);
        let trailing = checksum(&buf);
        buf.put_u32_le(trailing);
        buf.to_vec()
    }

    #[test]
    fn test_overflowing_size_fields_rejected() {
        assert!(decode_entry_header(&raw_preamble(u64::MAX - 8, 0)).is_none());
        assert!(decode_entry_header(&raw_preamble(u64::MAX, 0)).is_none());
        assert!(decode_entry_header(&raw_preamble(0, u64::MAX - 8)).is_none());
        assert!(decode_entry_header(&raw_preamble(u64::MAX, u64::MAX)).is_none());
    }
}
