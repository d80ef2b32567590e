//! The persistent log façade.
//!
//! Sequences every read, append, commit, term, and vote operation through a
//! single async reader/writer lock and routes each log index to its owning
//! partition. Term and vote updates share the log's exclusive write mode, so
//! a leader transition can never interleave with an append.
//!
//! `last_index` and `commit_index` are kept in watermark atomics updated
//! with release ordering under the write lock; [`PersistentLog::last_index`]
//! and [`PersistentLog::term`] read them with acquire ordering and never
//! block, which means they may trail an in-flight commit. Readers that need
//! a consistent pair take the read lock by calling
//! [`PersistentLog::entries`].

use crate::entry::{Entry, FIXED_SLOT_OVERHEAD};
use crate::error::LogError;
use crate::partition::Partition;
use crate::state::NodeState;
use async_trait::async_trait;
use std::collections::btree_map::{BTreeMap, Entry as MapEntry};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;

/// Configuration for the persistent log.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory holding the partition files and the node-state file.
    /// Created if absent.
    pub dir: PathBuf,
    /// Number of record slots per partition file.
    pub records_per_partition: u64,
    /// Size of one record slot; bounds the serialized size of an entry.
    pub max_record_size: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("raft-log"),
            records_per_partition: 1024,
            max_record_size: 4096,
        }
    }
}

impl LogConfig {
    fn validate(&self) -> Result<(), LogError> {
        if self.records_per_partition == 0 {
            return Err(LogError::InvalidConfig(
                "records_per_partition must be greater than 0".to_string(),
            ));
        }
        if self.max_record_size <= FIXED_SLOT_OVERHEAD {
            return Err(LogError::InvalidConfig(format!(
                "max_record_size must be greater than the {FIXED_SLOT_OVERHEAD} byte record overhead"
            )));
        }
        Ok(())
    }
}

/// What the startup scan found.
#[derive(Debug, Clone)]
pub struct RecoveryInfo {
    /// Partition files opened.
    pub partitions: u64,
    /// Highest log index present on disk.
    pub last_index: u64,
    /// Highest committed log index.
    pub commit_index: u64,
}

/// Notification delivered once per raised commit range, synchronously with
/// the committing call and after all header flushes for the range succeeded.
///
/// Subscribers must not re-enter the log from the receiving task.
#[derive(Debug, Clone)]
pub struct Committed {
    /// First newly committed index.
    pub first_index: u64,
    /// The newly committed entries, in index order.
    pub entries: Vec<Entry>,
}

struct Watermarks {
    last_index: AtomicU64,
    commit_index: AtomicU64,
    term: AtomicU64,
    voted_for: parking_lot::RwLock<Option<SocketAddr>>,
}

struct LogInner {
    dir: PathBuf,
    partitions: BTreeMap<u64, Partition>,
    node: NodeState,
    closed: bool,
}

/// Persistent, partitioned log storage for a Raft node.
///
/// Cheaply cloneable; clones share the same state and lock.
#[derive(Clone)]
pub struct PersistentLog {
    inner: Arc<RwLock<LogInner>>,
    watermarks: Arc<Watermarks>,
    commits: broadcast::Sender<Committed>,
    records_per_partition: u64,
    max_record_size: u64,
}

impl PersistentLog {
    /// Opens the log, scanning the directory and rebuilding the watermarks.
    ///
    /// Any file whose name parses as a non-negative integer is opened as a
    /// partition; everything else (the node-state file included) is ignored.
    /// Partitions below the lowest surviving number were removed by
    /// compaction and count as fully occupied and fully committed.
    pub async fn open(config: LogConfig) -> Result<(Self, RecoveryInfo), LogError> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.dir).await?;

        let mut numbers = Vec::new();
        let mut dir_entries = tokio::fs::read_dir(&config.dir).await?;
        while let Some(dir_entry) = dir_entries.next_entry().await? {
            if let Some(name) = dir_entry.file_name().to_str() {
                if let Ok(number) = name.parse::<u64>() {
                    numbers.push(number);
                }
            }
        }
        numbers.sort_unstable();

        let mut partitions = BTreeMap::new();
        for &number in &numbers {
            let partition = Partition::open(
                &config.dir,
                number,
                config.records_per_partition,
                config.max_record_size,
            )?;
            partitions.insert(number, partition);
        }

        let floor = numbers.first().copied().unwrap_or(0);
        let mut occupied = floor * config.records_per_partition;
        let mut commit_index = occupied.saturating_sub(1);
        for partition in partitions.values() {
            occupied += partition.occupied()?;
            commit_index += partition.committed_entries();
        }
        let last_index = occupied.saturating_sub(1);

        let (node, term, voted_for) = NodeState::open(&config.dir)?;

        tracing::debug!(
            partitions = partitions.len(),
            last_index,
            commit_index,
            term,
            "opened persistent log"
        );

        let recovery = RecoveryInfo {
            partitions: partitions.len() as u64,
            last_index,
            commit_index,
        };
        let (commits, _) = broadcast::channel(64);
        let log = Self {
            inner: Arc::new(RwLock::new(LogInner {
                dir: config.dir,
                partitions,
                node,
                closed: false,
            })),
            watermarks: Arc::new(Watermarks {
                last_index: AtomicU64::new(last_index),
                commit_index: AtomicU64::new(commit_index),
                term: AtomicU64::new(term),
                voted_for: parking_lot::RwLock::new(voted_for),
            }),
            commits,
            records_per_partition: config.records_per_partition,
            max_record_size: config.max_record_size,
        };
        Ok((log, recovery))
    }

    /// Returns the commit watermark when `committed`, the last-index
    /// watermark otherwise. Never blocks.
    pub fn last_index(&self, committed: bool) -> u64 {
        if committed {
            self.watermarks.commit_index.load(Ordering::Acquire)
        } else {
            self.watermarks.last_index.load(Ordering::Acquire)
        }
    }

    /// The sentinel first entry.
    pub fn first(&self) -> Entry {
        Entry::initial()
    }

    /// Subscribes to commit notifications.
    pub fn subscribe_commits(&self) -> broadcast::Receiver<Committed> {
        self.commits.subscribe()
    }

    /// Reads the dense range `[start, min(end, last_index)]` under the
    /// shared read lock, stopping at the first missing slot.
    ///
    /// `end` defaults to the last index. An inverted range yields an empty
    /// list. Index 0 resolves to the sentinel when no real entry is present.
    /// Returned entries carry their own mapped views, so consuming payloads
    /// does not require the lock.
    pub async fn entries(
        &self,
        start: u64,
        end: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Entry>, LogError> {
        let inner = self.read_inner(cancel).await?;
        let last = self.watermarks.last_index.load(Ordering::Acquire);
        let end = end.unwrap_or(last).min(last);
        if end < start {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity((end - start + 1) as usize);
        for index in start..=end {
            let number = index / self.records_per_partition;
            let slot = index % self.records_per_partition;
            let decoded = match inner.partitions.get(&number) {
                Some(partition) => partition.read_slot(slot)?,
                None => None,
            };
            match decoded {
                Some(entry) => out.push(entry),
                None if index == 0 => out.push(Entry::initial()),
                None => break,
            }
        }
        Ok(out)
    }

    /// Appends `entries` at consecutive indices starting at `start`
    /// (defaults to `last_index + 1`), creating partitions on demand.
    ///
    /// Returns the index of the first appended entry. Appending over an
    /// occupied slot overwrites it; leaders use this to rewrite a
    /// conflicting suffix.
    pub async fn append(
        &self,
        entries: Vec<Entry>,
        start: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<u64, LogError> {
        if entries.is_empty() {
            return Err(LogError::EmptyEntrySet);
        }
        let mut inner = self.write_inner(cancel).await?;
        let last = self.watermarks.last_index.load(Ordering::Acquire);
        let first = start.unwrap_or(last + 1);

        let LogInner {
            dir, partitions, ..
        } = &mut *inner;
        for (offset, entry) in entries.iter().enumerate() {
            let index = first + offset as u64;
            let number = index / self.records_per_partition;
            let slot = index % self.records_per_partition;
            let partition = match partitions.entry(number) {
                MapEntry::Occupied(occupied) => occupied.into_mut(),
                MapEntry::Vacant(vacant) => vacant.insert(Partition::open(
                    dir,
                    number,
                    self.records_per_partition,
                    self.max_record_size,
                )?),
            };
            partition.write_slot(slot, entry, cancel).await?;
            if index > self.watermarks.last_index.load(Ordering::Acquire) {
                self.watermarks.last_index.store(index, Ordering::Release);
            }
        }
        Ok(first)
    }

    /// Raises the commit index to `min(end.unwrap_or(last), last)`.
    ///
    /// Every affected partition's committed-entries counter is written and
    /// its header flushed; only after all flushes succeed does the commit
    /// index advance and the [`Committed`] notification fire. When a flush
    /// fails, counters already written by this call are rolled back before
    /// the error surfaces, so a failed commit never leaves a header ahead
    /// of the commit index it reports. Returns the count of newly committed
    /// entries.
    pub async fn commit(
        &self,
        end: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<u64, LogError> {
        let mut inner = self.write_inner(cancel).await?;
        let last = self.watermarks.last_index.load(Ordering::Acquire);
        let previous = self.watermarks.commit_index.load(Ordering::Acquire);
        let target = end.unwrap_or(last).min(last);
        if target <= previous {
            return Ok(0);
        }

        let records = self.records_per_partition;
        let high_partition = target / records;

        // Stage the counter changes before touching any header, so a flush
        // failure can undo whatever this call already made durable. Recovery
        // sums these counters to rebuild the commit index; a partially
        // flushed commit must not survive a restart.
        let mut staged = Vec::new();
        for (&number, partition) in inner.partitions.range(..=high_partition) {
            let current = partition.committed_entries();
            let updated = committed_entries_within(number, records, target);
            if updated != current {
                staged.push((number, current, updated));
            }
        }

        let mut flushed = 0;
        let mut failed = None;
        for &(number, _, updated) in &staged {
            if let Some(partition) = inner.partitions.get_mut(&number) {
                partition.set_committed_entries(updated);
                if let Err(err) = partition.flush_headers() {
                    failed = Some(err);
                    break;
                }
            }
            flushed += 1;
        }
        if let Some(err) = failed {
            // The failing partition's counter may have reached disk even
            // though its flush errored, so restore it as well.
            for &(number, current, _) in staged.iter().take(flushed + 1) {
                if let Some(partition) = inner.partitions.get_mut(&number) {
                    partition.set_committed_entries(current);
                    if let Err(rollback) = partition.flush_headers() {
                        tracing::warn!(
                            partition = number,
                            error = %rollback,
                            "failed to roll back committed-entries counter"
                        );
                    }
                }
            }
            return Err(err);
        }
        self.watermarks
            .commit_index
            .store(target, Ordering::Release);

        let mut committed_entries = Vec::with_capacity((target - previous) as usize);
        for index in previous + 1..=target {
            let number = index / records;
            if let Some(partition) = inner.partitions.get(&number) {
                if let Some(entry) = partition.read_slot(index % records)? {
                    committed_entries.push(entry);
                }
            }
        }
        tracing::debug!(first = previous + 1, upto = target, "commit index raised");
        let _ = self.commits.send(Committed {
            first_index: previous + 1,
            entries: committed_entries,
        });
        Ok(target - previous)
    }

    /// Removes partitions whose every entry is committed, from the low end
    /// only, and returns the count of on-disk entries removed.
    ///
    /// The highest-numbered partition is never removed and removal never
    /// leaves a hole, so the surviving partitions stay contiguous from a
    /// floor and a restart can still rebuild both watermarks.
    pub async fn force_compaction(&self, cancel: &CancellationToken) -> Result<u64, LogError> {
        let mut inner = self.write_inner(cancel).await?;
        let commit = self.watermarks.commit_index.load(Ordering::Acquire);
        let records = self.records_per_partition;
        let mut removed = 0u64;

        loop {
            let bounds = match (
                inner.partitions.keys().next(),
                inner.partitions.keys().next_back(),
            ) {
                (Some(&lowest), Some(&highest)) => (lowest, highest),
                _ => break,
            };
            let (lowest, highest) = bounds;
            if lowest == highest {
                break;
            }
            let full = match inner.partitions.get(&lowest) {
                Some(partition) => partition.occupied()? == records,
                None => break,
            };
            let high_index = (lowest + 1) * records - 1;
            if !full || high_index > commit {
                break;
            }

            if let Some(partition) = inner.partitions.remove(&lowest) {
                let path = partition.path().to_path_buf();
                drop(partition);
                tokio::fs::remove_file(&path).await?;
                removed += if lowest == 0 { records - 1 } else { records };
                tracing::debug!(partition = lowest, "removed fully committed partition");
            }
        }
        Ok(removed)
    }

    /// Current term. Never blocks; reads the cached copy with acquire
    /// ordering.
    pub fn term(&self) -> u64 {
        self.watermarks.term.load(Ordering::Acquire)
    }

    /// Persists a new term under the write lock.
    pub async fn update_term(&self, value: u64, cancel: &CancellationToken) -> Result<(), LogError> {
        let mut inner = self.write_inner(cancel).await?;
        inner.node.set_term(value)?;
        self.watermarks.term.store(value, Ordering::Release);
        Ok(())
    }

    /// Atomically increments the term, persists it, and returns the new
    /// value.
    pub async fn increment_term(&self, cancel: &CancellationToken) -> Result<u64, LogError> {
        let mut inner = self.write_inner(cancel).await?;
        let next = self.watermarks.term.load(Ordering::Acquire) + 1;
        inner.node.set_term(next)?;
        self.watermarks.term.store(next, Ordering::Release);
        Ok(next)
    }

    /// True when no vote is recorded or the recorded endpoint equals
    /// `candidate`. Endpoints compare as (address octets, port).
    pub fn is_voted_for(&self, candidate: &SocketAddr) -> bool {
        match *self.watermarks.voted_for.read() {
            None => true,
            Some(voted) => voted == *candidate,
        }
    }

    /// Persists the voted-for endpoint under the write lock; `None` clears
    /// the vote.
    pub async fn update_voted_for(
        &self,
        candidate: Option<SocketAddr>,
        cancel: &CancellationToken,
    ) -> Result<(), LogError> {
        let mut inner = self.write_inner(cancel).await?;
        inner.node.set_voted_for(candidate)?;
        *self.watermarks.voted_for.write() = candidate;
        Ok(())
    }

    /// Flushes all headers and the node state, drops every mapping and file
    /// handle, and marks the log closed. Idempotent. Subsequent operations
    /// fail with [`LogError::Closed`], as does payload access on entries
    /// read before the close.
    pub async fn close(&self) -> Result<(), LogError> {
        let mut inner = self.inner.write().await;
        if inner.closed {
            return Ok(());
        }
        for partition in inner.partitions.values() {
            partition.flush_headers()?;
        }
        inner.node.flush()?;
        inner.partitions.clear();
        inner.closed = true;
        Ok(())
    }

    async fn read_inner(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RwLockReadGuard<'_, LogInner>, LogError> {
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LogError::Cancelled),
            guard = self.inner.read() => guard,
        };
        if guard.closed {
            return Err(LogError::Closed);
        }
        Ok(guard)
    }

    async fn write_inner(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RwLockWriteGuard<'_, LogInner>, LogError> {
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LogError::Cancelled),
            guard = self.inner.write() => guard,
        };
        if guard.closed {
            return Err(LogError::Closed);
        }
        Ok(guard)
    }
}

/// Committed real entries whose global index lands in partition `number`
/// when the commit index is `commit_index`. The sentinel is excluded, so the
/// per-partition counters sum exactly to the commit index.
fn committed_entries_within(number: u64, records: u64, commit_index: u64) -> u64 {
    let low = (number * records).max(1);
    let high = ((number + 1) * records - 1).min(commit_index);
    if high >= low {
        high - low + 1
    } else {
        0
    }
}

/// The contract the Raft layer consumes.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Commit watermark when `committed`, last-index watermark otherwise.
    fn last_index(&self, committed: bool) -> u64;

    /// The sentinel first entry.
    fn first(&self) -> Entry;

    /// Subscribes to commit notifications.
    fn subscribe_commits(&self) -> broadcast::Receiver<Committed>;

    /// Dense range read; see [`PersistentLog::entries`].
    async fn entries(
        &self,
        start: u64,
        end: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Entry>, LogError>;

    /// Append; see [`PersistentLog::append`].
    async fn append(
        &self,
        entries: Vec<Entry>,
        start: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<u64, LogError>;

    /// Commit; see [`PersistentLog::commit`].
    async fn commit(&self, end: Option<u64>, cancel: &CancellationToken)
        -> Result<u64, LogError>;

    /// Current term.
    fn term(&self) -> u64;

    /// Persist a new term.
    async fn update_term(&self, value: u64, cancel: &CancellationToken) -> Result<(), LogError>;

    /// Increment and persist the term, returning the new value.
    async fn increment_term(&self, cancel: &CancellationToken) -> Result<u64, LogError>;

    /// Whether a vote for `candidate` would be consistent with the
    /// persisted vote.
    fn is_voted_for(&self, candidate: &SocketAddr) -> bool;

    /// Persist the voted-for endpoint.
    async fn update_voted_for(
        &self,
        candidate: Option<SocketAddr>,
        cancel: &CancellationToken,
    ) -> Result<(), LogError>;
}

#[async_trait]
impl LogStore for PersistentLog {
    fn last_index(&self, committed: bool) -> u64 {
        PersistentLog::last_index(self, committed)
    }

    fn first(&self) -> Entry {
        PersistentLog::first(self)
    }

    fn subscribe_commits(&self) -> broadcast::Receiver<Committed> {
        PersistentLog::subscribe_commits(self)
    }

    async fn entries(
        &self,
        start: u64,
        end: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Entry>, LogError> {
        PersistentLog::entries(self, start, end, cancel).await
    }

    async fn append(
        &self,
        entries: Vec<Entry>,
        start: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<u64, LogError> {
        PersistentLog::append(self, entries, start, cancel).await
    }

    async fn commit(
        &self,
        end: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<u64, LogError> {
        PersistentLog::commit(self, end, cancel).await
    }

    fn term(&self) -> u64 {
        PersistentLog::term(self)
    }

    async fn update_term(&self, value: u64, cancel: &CancellationToken) -> Result<(), LogError> {
        PersistentLog::update_term(self, value, cancel).await
    }

    async fn increment_term(&self, cancel: &CancellationToken) -> Result<u64, LogError> {
        PersistentLog::increment_term(self, cancel).await
    }

    fn is_voted_for(&self, candidate: &SocketAddr) -> bool {
        PersistentLog::is_voted_for(self, candidate)
    }

    async fn update_voted_for(
        &self,
        candidate: Option<SocketAddr>,
        cancel: &CancellationToken,
    ) -> Result<(), LogError> {
        PersistentLog::update_voted_for(self, candidate, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> LogConfig {
        LogConfig {
            dir: dir.path().to_path_buf(),
            records_per_partition: 4,
            max_record_size: 256,
        }
    }

    fn text_entry(term: u64, name: &str, payload: &str) -> Entry {
        Entry::new(term, name, "text/plain", payload.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn empty_log_has_only_the_sentinel() {
        let dir = TempDir::new().unwrap();
        let (log, recovery) = PersistentLog::open(test_config(&dir)).await.unwrap();
        let cancel = CancellationToken::new();

        assert_eq!(recovery.partitions, 0);
        assert_eq!(log.last_index(false), 0);
        assert_eq!(log.last_index(true), 0);

        let entries = log.entries(0, Some(0), &cancel).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].term(), 0);
        assert_eq!(entries[0].len(), 0);
    }

    #[tokio::test]
    async fn first_append_lands_at_index_one() {
        let dir = TempDir::new().unwrap();
        let (log, _) = PersistentLog::open(test_config(&dir)).await.unwrap();
        let cancel = CancellationToken::new();

        let first = log
            .append(vec![text_entry(1, "a", "hi")], Some(1), &cancel)
            .await
            .unwrap();
        assert_eq!(first, 1);
        assert_eq!(log.last_index(false), 1);
        assert!(dir.path().join("0").exists());

        let inner = log.inner.read().await;
        let partition = inner.partitions.get(&0).unwrap();
        assert_eq!(partition.index_offset(), 0);
        assert!(partition.read_slot(0).unwrap().is_none());
        assert!(partition.read_slot(1).unwrap().is_some());
    }

    #[tokio::test]
    async fn appends_spill_into_the_next_partition() {
        let dir = TempDir::new().unwrap();
        let (log, _) = PersistentLog::open(test_config(&dir)).await.unwrap();
        let cancel = CancellationToken::new();

        log.append(vec![text_entry(1, "a", "hi")], Some(1), &cancel)
            .await
            .unwrap();
        let batch = vec![
            text_entry(2, "b", "2"),
            text_entry(2, "c", "3"),
            text_entry(3, "d", "4"),
            text_entry(3, "e", "5"),
        ];
        let first = log.append(batch, Some(2), &cancel).await.unwrap();
        assert_eq!(first, 2);
        assert_eq!(log.last_index(false), 5);
        assert!(dir.path().join("1").exists());

        let inner = log.inner.read().await;
        assert_eq!(inner.partitions.get(&1).unwrap().index_offset(), 4);
        drop(inner);

        let entries = log.entries(1, Some(5), &cancel).await.unwrap();
        assert_eq!(entries.len(), 5);
        let terms: Vec<u64> = entries.iter().map(|e| e.term()).collect();
        assert_eq!(terms, [1, 2, 2, 3, 3]);
        assert_eq!(entries[4].read_payload().unwrap().as_ref(), b"5");
    }

    #[tokio::test]
    async fn append_uses_last_index_plus_one_by_default() {
        let dir = TempDir::new().unwrap();
        let (log, _) = PersistentLog::open(test_config(&dir)).await.unwrap();
        let cancel = CancellationToken::new();

        assert_eq!(
            log.append(vec![text_entry(1, "a", "x")], None, &cancel)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            log.append(vec![text_entry(1, "b", "y")], None, &cancel)
                .await
                .unwrap(),
            2
        );
        assert_eq!(log.last_index(false), 2);
    }

    #[tokio::test]
    async fn append_rejects_empty_input() {
        let dir = TempDir::new().unwrap();
        let (log, _) = PersistentLog::open(test_config(&dir)).await.unwrap();
        let err = log
            .append(Vec::new(), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LogError::EmptyEntrySet));
    }

    #[tokio::test]
    async fn inverted_range_reads_empty() {
        let dir = TempDir::new().unwrap();
        let (log, _) = PersistentLog::open(test_config(&dir)).await.unwrap();
        let cancel = CancellationToken::new();
        let entries = log.entries(5, Some(3), &cancel).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn reappend_overwrites_the_slot() {
        let dir = TempDir::new().unwrap();
        let (log, _) = PersistentLog::open(test_config(&dir)).await.unwrap();
        let cancel = CancellationToken::new();

        log.append(vec![text_entry(1, "old", "old")], Some(1), &cancel)
            .await
            .unwrap();
        log.append(vec![text_entry(2, "new", "new")], Some(1), &cancel)
            .await
            .unwrap();

        assert_eq!(log.last_index(false), 1);
        let entries = log.entries(1, Some(1), &cancel).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].term(), 2);
        assert_eq!(entries[0].name(), "new");
        assert_eq!(entries[0].read_payload().unwrap().as_ref(), b"new");
    }

    #[tokio::test]
    async fn commit_raises_the_watermark_and_notifies() {
        let dir = TempDir::new().unwrap();
        let (log, _) = PersistentLog::open(test_config(&dir)).await.unwrap();
        let cancel = CancellationToken::new();
        let mut notifications = log.subscribe_commits();

        log.append(
            vec![
                text_entry(1, "a", "1"),
                text_entry(1, "b", "2"),
                text_entry(1, "c", "3"),
            ],
            None,
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(log.commit(Some(2), &cancel).await.unwrap(), 2);
        assert_eq!(log.last_index(true), 2);
        assert!(log.last_index(true) <= log.last_index(false));

        let notice = notifications.try_recv().unwrap();
        assert_eq!(notice.first_index, 1);
        assert_eq!(notice.entries.len(), 2);
        assert_eq!(notice.entries[1].name(), "b");

        // Committing the same range again is a no-op.
        assert_eq!(log.commit(Some(2), &cancel).await.unwrap(), 0);
        assert!(notifications.try_recv().is_err());

        // Default end commits through the last index, clamped.
        assert_eq!(log.commit(None, &cancel).await.unwrap(), 1);
        assert_eq!(log.last_index(true), 3);
        let notice = notifications.try_recv().unwrap();
        assert_eq!(notice.first_index, 3);
        assert_eq!(notice.entries.len(), 1);
    }

    #[tokio::test]
    async fn commit_clamps_to_last_index() {
        let dir = TempDir::new().unwrap();
        let (log, _) = PersistentLog::open(test_config(&dir)).await.unwrap();
        let cancel = CancellationToken::new();

        log.append(vec![text_entry(1, "a", "1")], None, &cancel)
            .await
            .unwrap();
        assert_eq!(log.commit(Some(100), &cancel).await.unwrap(), 1);
        assert_eq!(log.last_index(true), 1);
    }

    #[tokio::test]
    async fn compaction_removes_only_full_committed_prefix() {
        let dir = TempDir::new().unwrap();
        let (log, _) = PersistentLog::open(test_config(&dir)).await.unwrap();
        let cancel = CancellationToken::new();

        // Fill partitions 0 and 1 (indices 1..=7) and start partition 2.
        let entries: Vec<Entry> = (1..=8).map(|i| text_entry(1, "e", &i.to_string())).collect();
        log.append(entries, Some(1), &cancel).await.unwrap();
        assert_eq!(log.last_index(false), 8);

        // Nothing committed yet: nothing to remove.
        assert_eq!(log.force_compaction(&cancel).await.unwrap(), 0);

        // Commit through partition 1's last index.
        log.commit(Some(7), &cancel).await.unwrap();
        let removed = log.force_compaction(&cancel).await.unwrap();
        // Partition 0 holds three real entries, partition 1 holds four.
        assert_eq!(removed, 7);
        assert!(!dir.path().join("0").exists());
        assert!(!dir.path().join("1").exists());
        assert!(dir.path().join("2").exists());

        // Watermarks are untouched and the surviving tail still reads.
        assert_eq!(log.last_index(false), 8);
        assert_eq!(log.last_index(true), 7);
        let tail = log.entries(8, Some(8), &cancel).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].read_payload().unwrap().as_ref(), b"8");
    }

    #[tokio::test]
    async fn compaction_never_removes_the_highest_partition() {
        let dir = TempDir::new().unwrap();
        let (log, _) = PersistentLog::open(test_config(&dir)).await.unwrap();
        let cancel = CancellationToken::new();

        let entries: Vec<Entry> = (1..=3).map(|i| text_entry(1, "e", &i.to_string())).collect();
        log.append(entries, Some(1), &cancel).await.unwrap();
        log.commit(None, &cancel).await.unwrap();

        // Partition 0 is full and committed but is also the only partition.
        assert_eq!(log.force_compaction(&cancel).await.unwrap(), 0);
        assert!(dir.path().join("0").exists());
    }

    #[tokio::test]
    async fn term_and_vote_updates_take_effect_immediately() {
        let dir = TempDir::new().unwrap();
        let (log, _) = PersistentLog::open(test_config(&dir)).await.unwrap();
        let cancel = CancellationToken::new();

        assert_eq!(log.term(), 0);
        assert_eq!(log.increment_term(&cancel).await.unwrap(), 1);
        assert_eq!(log.increment_term(&cancel).await.unwrap(), 2);
        log.update_term(10, &cancel).await.unwrap();
        assert_eq!(log.term(), 10);

        let candidate: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let other: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        assert!(log.is_voted_for(&candidate));
        assert!(log.is_voted_for(&other));

        log.update_voted_for(Some(candidate), &cancel).await.unwrap();
        assert!(log.is_voted_for(&candidate));
        assert!(!log.is_voted_for(&other));

        log.update_voted_for(None, &cancel).await.unwrap();
        assert!(log.is_voted_for(&other));
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_acquisition() {
        let dir = TempDir::new().unwrap();
        let (log, _) = PersistentLog::open(test_config(&dir)).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = log
            .append(vec![text_entry(1, "a", "x")], None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LogError::Cancelled));
        assert_eq!(log.last_index(false), 0);

        let err = log.entries(0, None, &cancel).await.unwrap_err();
        assert!(matches!(err, LogError::Cancelled));
    }

    #[tokio::test]
    async fn operations_after_close_fail() {
        let dir = TempDir::new().unwrap();
        let (log, _) = PersistentLog::open(test_config(&dir)).await.unwrap();
        let cancel = CancellationToken::new();

        log.append(vec![text_entry(1, "a", "x")], None, &cancel)
            .await
            .unwrap();
        let held = log.entries(1, Some(1), &cancel).await.unwrap();

        log.close().await.unwrap();
        log.close().await.unwrap();

        let err = log
            .append(vec![text_entry(1, "b", "y")], None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LogError::Closed));
        let err = log.entries(0, None, &cancel).await.unwrap_err();
        assert!(matches!(err, LogError::Closed));

        // Entries read before the close lose their backing mapping.
        assert!(matches!(held[0].read_payload(), Err(LogError::Closed)));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let config = LogConfig {
            dir: dir.path().to_path_buf(),
            records_per_partition: 0,
            max_record_size: 256,
        };
        assert!(matches!(
            PersistentLog::open(config).await,
            Err(LogError::InvalidConfig(_))
        ));

        let config = LogConfig {
            dir: dir.path().to_path_buf(),
            records_per_partition: 4,
            max_record_size: FIXED_SLOT_OVERHEAD,
        };
        assert!(matches!(
            PersistentLog::open(config).await,
            Err(LogError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn log_store_trait_object_is_usable() {
        let dir = TempDir::new().unwrap();
        let (log, _) = PersistentLog::open(test_config(&dir)).await.unwrap();
        let cancel = CancellationToken::new();
        let store: Arc<dyn LogStore> = Arc::new(log);

        store
            .append(vec![text_entry(1, "a", "x")], None, &cancel)
            .await
            .unwrap();
        assert_eq!(store.last_index(false), 1);
        assert_eq!(store.commit(None, &cancel).await.unwrap(), 1);
        assert_eq!(store.first().term(), 0);
    }

    #[test]
    fn committed_entries_split_sums_to_the_commit_index() {
        let records = 4;
        for commit_index in 0..20 {
            let total: u64 = (0..8)
                .map(|p| committed_entries_within(p, records, commit_index))
                .sum();
            assert_eq!(total, commit_index);
        }
    }
}
