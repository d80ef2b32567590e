//! Persistent, partitioned, memory-mapped log storage for a Raft node.
//!
//! Provides the two pieces of state a Raft implementation must keep on
//! stable storage:
//!
//! - the replicated log itself, stored as fixed-capacity partition files of
//!   fixed-size record slots so that index-to-offset translation is pure
//!   arithmetic;
//! - the node's hard state: current term and the endpoint it most recently
//!   voted for.
//!
//! All operations go through a single async reader/writer lock: many
//! concurrent readers or one exclusive writer, with term and vote updates
//! sharing the writer side so they cannot interleave with appends. Slot
//! writes order their flushes so that a crash mid-append never leaves a
//! partially readable entry.
//!
//! # Example
//!
//! ```no_run
//! use partlog::{Entry, LogConfig, PersistentLog};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = LogConfig {
//!         dir: "raft-log".into(),
//!         ..Default::default()
//!     };
//!     let (log, recovery) = PersistentLog::open(config).await?;
//!     println!("recovered up to index {}", recovery.last_index);
//!
//!     let cancel = CancellationToken::new();
//!     let entry = Entry::new(1, "put", "application/octet-stream", &b"value"[..]);
//!     let first = log.append(vec![entry], None, &cancel).await?;
//!     log.commit(Some(first), &cancel).await?;
//!     log.close().await?;
//!     Ok(())
//! }
//! ```

mod entry;
mod error;
mod log;
mod partition;
mod state;

pub use entry::{Entry, FIXED_SLOT_OVERHEAD};
pub use error::LogError;
pub use log::{Committed, LogConfig, LogStore, PersistentLog, RecoveryInfo};
