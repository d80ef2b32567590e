//! Error types for the persistent log.

use thiserror::Error;

/// Errors surfaced by the log. Nothing is recovered internally; every
/// failure propagates to the caller.
#[derive(Debug, Error)]
pub enum LogError {
    /// Mapping, flush, or filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialized entry does not fit into a record slot.
    #[error("entry of {size} bytes exceeds the {max} byte record slot")]
    EntryTooLarge { size: u64, max: u64 },

    /// Append was called with no entries.
    #[error("no entries supplied")]
    EmptyEntrySet,

    /// Cancellation was observed before the operation acquired the lock.
    #[error("operation cancelled")]
    Cancelled,

    /// The log (or the partition backing an entry) has been closed.
    #[error("log has been closed")]
    Closed,

    /// Invalid construction parameters.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A record slot could not be decoded. Unreachable for files written by
    /// this crate; guards against truncated or foreign partition files.
    #[error("malformed record in partition {partition} at slot {slot}")]
    Malformed { partition: u64, slot: u64 },

    /// The node-state file could not be decoded. Unreachable for files
    /// written by this crate.
    #[error("malformed node state: voted-for address length {length}")]
    MalformedNodeState { length: u32 },
}
