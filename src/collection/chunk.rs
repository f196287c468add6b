//! # Record Chunks
//!
//! A record that does not fit on one page is stored as a chain of chunks.
//! Every chunk ends with the same 9-byte trailer:
//!
//! ```text
//! +------------------+-------------------+---------------------------+
//! | payload          | first_record u8   | next_chunk_pointer i64 LE |
//! +------------------+-------------------+---------------------------+
//!                                          -1 = tail of the chain
//!                                          else page_index << 16 | slot
//! ```
//!
//! ## Entry Layout
//!
//! Concatenating the payloads from the entry-point chunk to the tail yields
//! the record entry:
//!
//! ```text
//! [record_type u8][content_length i32 LE][position i64 LE][content ...]
//!  \________________ metadata, 13 bytes ______________/
//! ```
//!
//! ## Backward Serialization
//!
//! Chunks are produced tail first. Each call to [`serialize_entry_chunk`]
//! takes the last `bytes_to_write` bytes of the entry that are still
//! unwritten and fills the chunk from its end, so the content tail lands
//! next to the trailer. The chunk produced last is the entry point: it holds
//! the whole metadata header and is the only one with `first_record = 1`.
//!
//! The metadata header is never split. When a chunk has room for some but
//! not all of the remaining metadata, it is shrunk to carry content only and
//! the header moves to the next chunk:
//!
//! ```text
//! chunk_size = 20, bytes_to_write = 13 + 4
//!
//! naive:   [meta tail 7][content 4][0][ptr]      header split across chunks
//! shrunk:  [content 4][0][ptr]                   header written whole later
//! ```

use eyre::{bail, ensure, Result};

use crate::config::{CHUNK_POINTER_SLOT_BITS, CHUNK_TRAILER_SIZE, METADATA_SIZE};

/// `next_chunk_pointer` of the last chunk in a chain.
pub(crate) const TAIL_POINTER: i64 = -1;

const SLOT_MASK: i64 = (1 << CHUNK_POINTER_SLOT_BITS) - 1;

pub(crate) fn chunk_pointer(page_index: u32, slot: u16) -> i64 {
    ((page_index as i64) << CHUNK_POINTER_SLOT_BITS) | slot as i64
}

/// Splits a pointer into `(page_index, slot)`, `None` for the tail marker.
pub(crate) fn decode_pointer(pointer: i64) -> Option<(u32, u16)> {
    if pointer < 0 {
        return None;
    }
    Some((
        (pointer >> CHUNK_POINTER_SLOT_BITS) as u32,
        (pointer & SLOT_MASK) as u16,
    ))
}

/// Size of the serialized entry (metadata + content).
pub(crate) fn entry_size(content_len: usize) -> usize {
    content_len + METADATA_SIZE
}

/// Size of a chunk carrying `entry_bytes` of payload.
pub(crate) fn chunk_size(entry_bytes: usize) -> usize {
    entry_bytes + CHUNK_TRAILER_SIZE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordMetadata {
    pub record_type: u8,
    pub content_length: usize,
    pub position: u64,
}

impl RecordMetadata {
    pub fn encode(&self) -> [u8; METADATA_SIZE] {
        let mut out = [0u8; METADATA_SIZE];
        out[0] = self.record_type;
        out[1..5].copy_from_slice(&(self.content_length as i32).to_le_bytes());
        out[5..13].copy_from_slice(&(self.position as i64).to_le_bytes());
        out
    }

    pub fn decode(entry: &[u8]) -> Result<Self> {
        ensure!(
            entry.len() >= METADATA_SIZE,
            "record entry too short for metadata: {} < {}",
            entry.len(),
            METADATA_SIZE
        );

        let mut length = [0u8; 4];
        length.copy_from_slice(&entry[1..5]);
        let content_length = i32::from_le_bytes(length);
        if content_length < 0 {
            bail!("negative content length {}", content_length);
        }

        let mut position = [0u8; 8];
        position.copy_from_slice(&entry[5..13]);

        Ok(Self {
            record_type: entry[0],
            content_length: content_length as usize,
            position: i64::from_le_bytes(position) as u64,
        })
    }
}

/// Read-side view of one stored chunk.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Chunk<'a> {
    bytes: &'a [u8],
}

impl<'a> Chunk<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= CHUNK_TRAILER_SIZE,
            "chunk of {} bytes is shorter than its trailer",
            bytes.len()
        );
        Ok(Self { bytes })
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[..self.bytes.len() - CHUNK_TRAILER_SIZE]
    }

    pub fn is_entry_point(&self) -> bool {
        self.bytes[self.bytes.len() - CHUNK_TRAILER_SIZE] != 0
    }

    pub fn next_pointer(&self) -> i64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes[self.bytes.len() - 8..]);
        i64::from_le_bytes(raw)
    }

    pub fn next(&self) -> Option<(u32, u16)> {
        decode_pointer(self.next_pointer())
    }
}

/// Builds the next chunk (walking backward) of an entry whose last
/// `bytes_to_write` bytes are still unwritten.
///
/// Returns the chunk and the number of entry bytes it carries. The chunk is
/// at most `chunk_size` bytes; it is shorter when the metadata header had to
/// be deferred.
pub(crate) fn serialize_entry_chunk(
    content: &[u8],
    chunk_size: usize,
    bytes_to_write: usize,
    next_pointer: i64,
    metadata: &RecordMetadata,
) -> (Vec<u8>, usize) {
    let mut chunk = vec![0u8; chunk_size];
    let pointer_offset = chunk_size - 8;
    chunk[pointer_offset..].copy_from_slice(&next_pointer.to_le_bytes());

    let offset = pointer_offset - 1;
    let mut flag_offset = offset;
    let mut written = 0;

    let content_left = bytes_to_write.saturating_sub(METADATA_SIZE);
    if content_left > 0 {
        let to_write = content_left.min(offset);
        chunk[offset - to_write..offset]
            .copy_from_slice(&content[content_left - to_write..content_left]);
        written = to_write;
    }

    let space_left = chunk_size - written - CHUNK_TRAILER_SIZE;
    if space_left > 0 {
        let metadata_left = bytes_to_write - written;

        if metadata_left <= space_left {
            let header = metadata.encode();
            chunk[space_left - metadata_left..space_left]
                .copy_from_slice(&header[METADATA_SIZE - metadata_left..]);
            written += metadata_left;
        } else {
            let mut shrunk = vec![0u8; written + CHUNK_TRAILER_SIZE];
            shrunk[..written].copy_from_slice(&chunk[offset - written..offset]);
            shrunk[written + 1..].copy_from_slice(&next_pointer.to_le_bytes());
            chunk = shrunk;
            flag_offset = written;
        }
    }

    if written == bytes_to_write {
        chunk[flag_offset] = 1;
    }

    (chunk, written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn metadata(content: &[u8], position: u64) -> RecordMetadata {
        RecordMetadata {
            record_type: 0x0D,
            content_length: content.len(),
            position,
        }
    }

    /// Serializes `content` with chunk capacities taken from `capacities`
    /// (cycled), then reassembles the entry the way the reader does.
    fn round_trip(content: &[u8], capacities: &[usize]) -> (Vec<u8>, usize) {
        let meta = metadata(content, 42);
        let mut remaining = entry_size(content.len());
        let mut next = TAIL_POINTER;
        let mut chunks: Vec<Vec<u8>> = Vec::new();
        let mut turn = 0;

        while remaining > 0 {
            let available = capacities[turn % capacities.len()];
            turn += 1;

            let needed = if remaining <= METADATA_SIZE {
                METADATA_SIZE + CHUNK_TRAILER_SIZE
            } else {
                CHUNK_TRAILER_SIZE + 1
            };
            if available < needed {
                continue;
            }

            let size = available.min(chunk_size(remaining));
            let (chunk, written) = serialize_entry_chunk(content, size, remaining, next, &meta);
            assert!(written > 0);
            assert!(chunk.len() <= size);
            remaining -= written;
            next = chunk_pointer(chunks.len() as u32, 0);
            chunks.push(chunk);
        }

        let mut entry = Vec::new();
        for (i, bytes) in chunks.iter().rev().enumerate() {
            let chunk = Chunk::new(bytes).unwrap();
            assert_eq!(chunk.is_entry_point(), i == 0);
            entry.extend_from_slice(chunk.payload());
        }
        (entry, chunks.len())
    }

    #[test]
    fn pointer_packs_page_and_slot() {
        let pointer = chunk_pointer(70_000, 513);
        assert_eq!(pointer, (70_000i64 << 16) | 513);
        assert_eq!(decode_pointer(pointer), Some((70_000, 513)));
        assert_eq!(decode_pointer(TAIL_POINTER), None);
    }

    #[test]
    fn metadata_layout() {
        let meta = RecordMetadata {
            record_type: 7,
            content_length: 300,
            position: 5,
        };
        let bytes = meta.encode();
        assert_eq!(bytes[0], 7);
        assert_eq!(&bytes[1..5], &300i32.to_le_bytes());
        assert_eq!(&bytes[5..13], &5i64.to_le_bytes());
        assert_eq!(RecordMetadata::decode(&bytes).unwrap(), meta);
    }

    #[test]
    fn negative_length_is_rejected() {
        let mut bytes = [0u8; METADATA_SIZE];
        bytes[1..5].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(RecordMetadata::decode(&bytes).is_err());
    }

    #[test]
    fn single_chunk_holds_whole_entry() {
        let content = b"hello";
        let meta = metadata(content, 3);
        let bytes = entry_size(content.len());

        let (chunk, written) =
            serialize_entry_chunk(content, chunk_size(bytes), bytes, TAIL_POINTER, &meta);

        assert_eq!(written, bytes);
        let view = Chunk::new(&chunk).unwrap();
        assert!(view.is_entry_point());
        assert_eq!(view.next(), None);
        assert_eq!(&view.payload()[..METADATA_SIZE], &meta.encode());
        assert_eq!(&view.payload()[METADATA_SIZE..], content);
    }

    #[test]
    fn empty_content_is_metadata_only() {
        let (entry, chunks) = round_trip(&[], &[4096]);
        assert_eq!(chunks, 1);
        assert_eq!(entry.len(), METADATA_SIZE);
        assert_eq!(RecordMetadata::decode(&entry).unwrap().content_length, 0);
    }

    #[test]
    fn partial_metadata_room_shrinks_chunk() {
        let content = [0xAB; 4];
        let meta = metadata(&content, 1);
        let bytes = entry_size(content.len());

        let (chunk, written) = serialize_entry_chunk(&content, 20, bytes, TAIL_POINTER, &meta);

        assert_eq!(written, 4);
        assert_eq!(chunk.len(), 4 + CHUNK_TRAILER_SIZE);
        let view = Chunk::new(&chunk).unwrap();
        assert!(!view.is_entry_point());
        assert_eq!(view.payload(), &content);
        assert_eq!(view.next_pointer(), TAIL_POINTER);
    }

    #[test]
    fn large_entry_spans_chunks_in_order() {
        let content: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let (entry, chunks) = round_trip(&content, &[2020]);

        assert!(chunks >= 3);
        let meta = RecordMetadata::decode(&entry).unwrap();
        assert_eq!(meta.position, 42);
        assert_eq!(&entry[METADATA_SIZE..], &content[..]);
    }

    proptest! {
        #[test]
        fn metadata_is_never_split(
            len in 0usize..6000,
            capacities in prop::collection::vec(10usize..2100, 1..8),
        ) {
            let content: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
            prop_assume!(capacities.iter().any(|&c| c >= METADATA_SIZE + CHUNK_TRAILER_SIZE));

            let (entry, _) = round_trip(&content, &capacities);

            let meta = RecordMetadata::decode(&entry).unwrap();
            prop_assert_eq!(meta.content_length, len);
            prop_assert_eq!(meta.position, 42);
            prop_assert_eq!(meta.record_type, 0x0D);
            prop_assert_eq!(&entry[METADATA_SIZE..], &content[..]);
        }
    }
}
