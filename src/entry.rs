//! Log entry representation and the record slot codec.
//!
//! Slot format:
//! - `present`: u8 (0 = empty, 1 = occupied)
//! - `name`: varint length prefix + UTF-8 bytes
//! - `content_type`: varint length prefix + UTF-8 bytes
//! - `term`: u64 (little-endian)
//! - `content_length`: u64 (little-endian)
//! - payload: bytes[content_length]
//!
//! The rest of the slot is padding. The present flag and the explicit
//! content length bound the live bytes, so padding is never read.
//!
//! Length prefixes use the common 7-bit-continuation varint: a single byte
//! for values up to 127, a continuation bit otherwise.

use crate::error::LogError;
use bytes::{BufMut, Bytes, BytesMut};
use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::sync::{Arc, Weak};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

pub(crate) const SLOT_EMPTY: u8 = 0;
pub(crate) const SLOT_OCCUPIED: u8 = 1;

/// Serialized size of an entry with empty name, empty content type, and no
/// payload: present flag, two single-byte length prefixes, term, content
/// length. `max_record_size` must be strictly greater than this.
pub const FIXED_SLOT_OVERHEAD: u64 = 19;

/// Staging-buffer size for streamed payload copies.
pub(crate) const COPY_CHUNK: usize = 64 * 1024;

/// A single log entry.
///
/// Entries appended by the caller carry their payload inline. Entries read
/// back from the log reference the payload bytes inside the owning
/// partition's file and map a fresh read-only view on every access, so they
/// stay readable without holding the log lock and may be re-read any number
/// of times while the log is open. Once the owning partition is closed or
/// removed, payload access fails with [`LogError::Closed`].
#[derive(Debug, Clone)]
pub struct Entry {
    name: String,
    content_type: String,
    term: u64,
    payload: Payload,
}

#[derive(Debug, Clone)]
enum Payload {
    Inline(Bytes),
    Mapped(SlotPayload),
}

/// Back reference into a partition file. The partition owns the file; the
/// entry only holds a weak handle and is invalidated when the partition
/// goes away.
#[derive(Debug, Clone)]
struct SlotPayload {
    file: Weak<File>,
    offset: u64,
    len: u64,
}

impl Entry {
    /// Creates an entry with an inline payload, ready to be appended.
    pub fn new(
        term: u64,
        name: impl Into<String>,
        content_type: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            term,
            payload: Payload::Inline(payload.into()),
        }
    }

    /// The sentinel first entry: zero term, empty name and payload. Returned
    /// whenever index 0 is requested and no real entry has been written
    /// there, so callers can always consult the entry before their append
    /// point.
    pub fn initial() -> Self {
        Self::new(0, "", "", Bytes::new())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    /// Payload length in bytes.
    pub fn len(&self) -> u64 {
        match &self.payload {
            Payload::Inline(bytes) => bytes.len() as u64,
            Payload::Mapped(slot) => slot.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total serialized size of this entry inside a record slot.
    pub fn encoded_len(&self) -> u64 {
        1 + varint_len(self.name.len() as u64)
            + self.name.len() as u64
            + varint_len(self.content_type.len() as u64)
            + self.content_type.len() as u64
            + 16
            + self.len()
    }

    /// Copies the payload into a freshly allocated buffer.
    pub fn read_payload(&self) -> Result<Bytes, LogError> {
        match self.open_payload()? {
            PayloadBytes::Inline(bytes) => Ok(bytes),
            PayloadBytes::View(view) => Ok(Bytes::copy_from_slice(&view)),
        }
    }

    /// Streams the payload into `sink` through a fixed-size staging buffer.
    ///
    /// Cancellation is checked between chunks; a cancelled copy fails with
    /// [`LogError::Cancelled`] and leaves the sink partially written.
    pub async fn copy_payload_to<W: AsyncWrite + Unpin>(
        &self,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<(), LogError> {
        let payload = self.open_payload()?;
        for chunk in payload.as_slice().chunks(COPY_CHUNK) {
            if cancel.is_cancelled() {
                return Err(LogError::Cancelled);
            }
            sink.write_all(chunk).await?;
        }
        Ok(())
    }

    /// Opens the payload bytes for copying, mapping a fresh read-only view
    /// for entries that reference a partition file.
    pub(crate) fn open_payload(&self) -> Result<PayloadBytes, LogError> {
        match &self.payload {
            Payload::Inline(bytes) => Ok(PayloadBytes::Inline(bytes.clone())),
            Payload::Mapped(slot) => {
                let file = slot.file.upgrade().ok_or(LogError::Closed)?;
                if slot.len == 0 {
                    return Ok(PayloadBytes::Inline(Bytes::new()));
                }
                let view = unsafe {
                    MmapOptions::new()
                        .offset(slot.offset)
                        .len(slot.len as usize)
                        .map(&*file)?
                };
                Ok(PayloadBytes::View(view))
            }
        }
    }

    /// Encodes the slot metadata: name, content type, term, and a content
    /// length placeholder. The present flag is not included; the writer
    /// backpatches the real length after streaming the payload and sets the
    /// flag last.
    pub(crate) fn encode_metadata(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_varint(&mut buf, self.name.len() as u64);
        buf.put_slice(self.name.as_bytes());
        encode_varint(&mut buf, self.content_type.len() as u64);
        buf.put_slice(self.content_type.as_bytes());
        buf.put_u64_le(self.term);
        buf.put_u64_le(0);
        buf
    }

    /// Builds an entry from a parsed slot, wiring the payload back reference
    /// to the owning partition's file.
    pub(crate) fn from_parsed(parsed: ParsedSlot, file: &Arc<File>, slot_file_offset: u64) -> Self {
        Self {
            name: parsed.name,
            content_type: parsed.content_type,
            term: parsed.term,
            payload: Payload::Mapped(SlotPayload {
                file: Arc::downgrade(file),
                offset: slot_file_offset + parsed.payload_offset as u64,
                len: parsed.payload_len,
            }),
        }
    }
}

/// Payload bytes opened for a single copy operation.
pub(crate) enum PayloadBytes {
    Inline(Bytes),
    View(Mmap),
}

impl PayloadBytes {
    pub(crate) fn as_slice(&self) -> &[u8] {
        match self {
            PayloadBytes::Inline(bytes) => bytes,
            PayloadBytes::View(view) => view,
        }
    }
}

/// Metadata decoded from an occupied slot.
pub(crate) struct ParsedSlot {
    pub(crate) name: String,
    pub(crate) content_type: String,
    pub(crate) term: u64,
    /// Offset of the payload within the slot.
    pub(crate) payload_offset: usize,
    pub(crate) payload_len: u64,
}

/// Raised when slot bytes do not follow the record format.
pub(crate) struct SlotDecodeError;

/// Decodes a slot view. Returns `None` for an empty slot.
pub(crate) fn parse_slot(view: &[u8]) -> Result<Option<ParsedSlot>, SlotDecodeError> {
    match view.first() {
        Some(&SLOT_OCCUPIED) => {}
        Some(_) | None => return Ok(None),
    }
    let mut cursor = &view[1..];
    let name = decode_string(&mut cursor)?;
    let content_type = decode_string(&mut cursor)?;
    let term = decode_u64(&mut cursor)?;
    let payload_len = decode_u64(&mut cursor)?;
    let payload_offset = view.len() - cursor.len();
    if payload_len > cursor.len() as u64 {
        return Err(SlotDecodeError);
    }
    Ok(Some(ParsedSlot {
        name,
        content_type,
        term,
        payload_offset,
        payload_len,
    }))
}

fn decode_string(cursor: &mut &[u8]) -> Result<String, SlotDecodeError> {
    let len = decode_varint(cursor).ok_or(SlotDecodeError)? as usize;
    if cursor.len() < len {
        return Err(SlotDecodeError);
    }
    let text = std::str::from_utf8(&cursor[..len]).map_err(|_| SlotDecodeError)?;
    let text = text.to_owned();
    *cursor = &cursor[len..];
    Ok(text)
}

fn decode_u64(cursor: &mut &[u8]) -> Result<u64, SlotDecodeError> {
    if cursor.len() < 8 {
        return Err(SlotDecodeError);
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&cursor[..8]);
    *cursor = &cursor[8..];
    Ok(u64::from_le_bytes(buf))
}

/// Number of bytes a varint encoding of `value` occupies.
pub(crate) fn varint_len(mut value: u64) -> u64 {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Encodes a u64 as a varint (LEB128).
pub(crate) fn encode_varint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decodes a varint (LEB128), advancing the cursor.
pub(crate) fn decode_varint(cursor: &mut &[u8]) -> Option<u64> {
    let mut result = 0u64;
    let mut shift = 0;
    loop {
        let (&byte, rest) = cursor.split_first()?;
        *cursor = rest;
        if shift >= 64 {
            return None;
        }
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some(result);
        }
        shift += 7;
    }
}
