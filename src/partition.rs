//! Fixed-capacity, memory-mapped partition files.
//!
//! A partition stores `records` consecutively indexed entries in fixed-size
//! slots, so index-to-offset translation is pure arithmetic and no record
//! index is needed. Layout:
//!
//! - offset 0, 8 bytes: `index_offset`, the global index of this
//!   partition's record 0
//! - offset 8, 8 bytes: `committed_entries`, the count of committed entries
//!   in this partition
//! - offset 16: `records` slots of `slot_size` bytes each
//!
//! The header view is long-lived and touched only under the log's write
//! lock. Slot views are created per operation and released on every exit
//! path. A newly sized file is zero-filled by the filesystem, which doubles
//! as the "empty slot" marker.

use crate::entry::{self, Entry, SLOT_EMPTY, SLOT_OCCUPIED};
use crate::error::LogError;
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub(crate) const HEADER_SIZE: u64 = 16;
const INDEX_OFFSET_RANGE: std::ops::Range<usize> = 0..8;
const COMMITTED_ENTRIES_RANGE: std::ops::Range<usize> = 8..16;

pub(crate) struct Partition {
    number: u64,
    file: Arc<File>,
    headers: MmapMut,
    path: PathBuf,
    records: u64,
    slot_size: u64,
}

impl Partition {
    /// Opens or creates the partition file named by its decimal number.
    ///
    /// The file is sized to hold the headers plus all record slots. A newly
    /// created partition gets its `index_offset` header written and flushed
    /// before the handle is returned.
    pub(crate) fn open(
        dir: &Path,
        number: u64,
        records: u64,
        slot_size: u64,
    ) -> Result<Self, LogError> {
        let path = dir.join(number.to_string());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let expected = HEADER_SIZE + records * slot_size;
        let created = file.metadata()?.len() == 0;
        if file.metadata()?.len() != expected {
            file.set_len(expected)?;
        }

        let mut headers = unsafe {
            MmapOptions::new()
                .len(HEADER_SIZE as usize)
                .map_mut(&file)?
        };
        let index_offset = number * records;
        if created {
            headers[INDEX_OFFSET_RANGE].copy_from_slice(&index_offset.to_le_bytes());
            headers.flush()?;
        } else if read_u64(&headers, INDEX_OFFSET_RANGE) != index_offset {
            tracing::warn!(
                partition = number,
                stored = read_u64(&headers, INDEX_OFFSET_RANGE),
                expected = index_offset,
                "partition index offset does not match its file name"
            );
        }

        Ok(Self {
            number,
            file: Arc::new(file),
            headers,
            path,
            records,
            slot_size,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn index_offset(&self) -> u64 {
        read_u64(&self.headers, INDEX_OFFSET_RANGE)
    }

    pub(crate) fn committed_entries(&self) -> u64 {
        read_u64(&self.headers, COMMITTED_ENTRIES_RANGE)
    }

    /// Updates the committed-entries counter. The caller decides when to
    /// flush; see [`Partition::flush_headers`].
    pub(crate) fn set_committed_entries(&mut self, value: u64) {
        self.headers[COMMITTED_ENTRIES_RANGE].copy_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn flush_headers(&self) -> Result<(), LogError> {
        self.headers.flush()?;
        Ok(())
    }

    fn slot_offset(&self, slot: u64) -> u64 {
        HEADER_SIZE + slot * self.slot_size
    }

    /// Reads the entry at `slot`, or `None` when the slot is empty.
    ///
    /// The returned entry references this partition's file for its payload
    /// and stays readable until the partition is closed.
    pub(crate) fn read_slot(&self, slot: u64) -> Result<Option<Entry>, LogError> {
        let offset = self.slot_offset(slot);
        let view = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(self.slot_size as usize)
                .map(&*self.file)?
        };
        let parsed = entry::parse_slot(&view).map_err(|_| LogError::Malformed {
            partition: self.number,
            slot,
        })?;
        Ok(parsed.map(|parsed| Entry::from_parsed(parsed, &self.file, offset)))
    }

    /// Writes `entry` into `slot`, overwriting any previous occupant.
    ///
    /// Durability order: the present flag is cleared and flushed first, then
    /// metadata and payload are written (the content length is backpatched
    /// after the streamed copy) and flushed, and only then is the present
    /// flag set and flushed. A crash mid-write therefore leaves a slot that
    /// recovery treats as empty, never a partially readable entry.
    pub(crate) async fn write_slot(
        &self,
        slot: u64,
        entry: &Entry,
        cancel: &CancellationToken,
    ) -> Result<(), LogError> {
        let meta = entry.encode_metadata();
        let need = 1 + meta.len() as u64 + entry.len();
        if need > self.slot_size {
            return Err(LogError::EntryTooLarge {
                size: need,
                max: self.slot_size,
            });
        }

        let payload = entry.open_payload()?;
        let offset = self.slot_offset(slot);
        let mut view = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(self.slot_size as usize)
                .map_mut(&*self.file)?
        };

        if view[0] != SLOT_EMPTY {
            view[0] = SLOT_EMPTY;
            view.flush_range(0, 1)?;
        }

        view[1..1 + meta.len()].copy_from_slice(&meta);
        let data_start = 1 + meta.len();
        let mut written = 0usize;
        for chunk in payload.as_slice().chunks(entry::COPY_CHUNK) {
            if cancel.is_cancelled() {
                return Err(LogError::Cancelled);
            }
            view[data_start + written..data_start + written + chunk.len()].copy_from_slice(chunk);
            written += chunk.len();
            tokio::task::yield_now().await;
        }
        view[data_start - 8..data_start].copy_from_slice(&(written as u64).to_le_bytes());
        view.flush()?;

        view[0] = SLOT_OCCUPIED;
        view.flush_range(0, 1)?;
        Ok(())
    }

    /// Counts occupied slots, scanning in order until the first empty one.
    ///
    /// The partition holding global index 0 counts the sentinel first entry
    /// as implicitly occupied: its scan starts at slot 1 and one is added,
    /// so an untouched first partition reports 1.
    pub(crate) fn occupied(&self) -> Result<u64, LogError> {
        let region = self.map_slot_flags()?;
        let first_partition = self.index_offset() == 0;
        let start = if first_partition { 1 } else { 0 };
        let mut count = 0u64;
        for slot in start..self.records {
            if region[(slot * self.slot_size) as usize] != SLOT_OCCUPIED {
                break;
            }
            count += 1;
        }
        Ok(if first_partition { count + 1 } else { count })
    }

    fn map_slot_flags(&self) -> Result<Mmap, LogError> {
        let view = unsafe {
            MmapOptions::new()
                .offset(HEADER_SIZE)
                .len((self.records * self.slot_size) as usize)
                .map(&*self.file)?
        };
        Ok(view)
    }
}

impl Drop for Partition {
    fn drop(&mut self) {
        // Best-effort; close paths flush explicitly and surface errors.
        let _ = self.headers.flush();
    }
}

fn read_u64(map: &[u8], range: std::ops::Range<usize>) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&map[range]);
    u64::from_le_bytes(buf)
}
