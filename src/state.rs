//! Durable node state: current term and the most recent vote.
//!
//! Stored in a small memory-mapped file with a fixed, non-numeric name so
//! the startup partition scan skips it. Layout:
//!
//! - offset 0, 8 bytes: current term
//! - offset 8, 4 bytes: voted-for port
//! - offset 12, 4 bytes: voted-for address length (0 = not voted)
//! - offset 16: voted-for address octets (4 for IPv4, 16 for IPv6)
//!
//! The file is zero-filled on first open, which reads back as term 0 and no
//! vote. All mutations happen under the log's exclusive write lock, so a
//! term transition can never interleave with a log append.

use crate::error::LogError;
use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;

/// Fixed file name; never parses as a partition number.
pub(crate) const NODE_STATE_FILE: &str = ".state";

const STATE_FILE_SIZE: u64 = 1024;
const TERM_OFFSET: usize = 0;
const PORT_OFFSET: usize = 8;
const ADDR_LEN_OFFSET: usize = 12;
const ADDR_OFFSET: usize = 16;

pub(crate) struct NodeState {
    map: MmapMut,
}

impl NodeState {
    /// Opens or creates the node-state file, returning the handle together
    /// with the persisted term and voted-for endpoint.
    pub(crate) fn open(dir: &Path) -> Result<(Self, u64, Option<SocketAddr>), LogError> {
        let path = dir.join(NODE_STATE_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        if file.metadata()?.len() != STATE_FILE_SIZE {
            file.set_len(STATE_FILE_SIZE)?;
        }
        let map = unsafe {
            MmapOptions::new()
                .len(STATE_FILE_SIZE as usize)
                .map_mut(&file)?
        };

        let state = Self { map };
        let term = state.term();
        let voted_for = state.voted_for()?;
        Ok((state, term, voted_for))
    }

    fn term(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.map[TERM_OFFSET..TERM_OFFSET + 8]);
        u64::from_le_bytes(buf)
    }

    fn voted_for(&self) -> Result<Option<SocketAddr>, LogError> {
        let mut port = [0u8; 4];
        port.copy_from_slice(&self.map[PORT_OFFSET..PORT_OFFSET + 4]);
        let port = u32::from_le_bytes(port) as u16;
        let mut len = [0u8; 4];
        len.copy_from_slice(&self.map[ADDR_LEN_OFFSET..ADDR_LEN_OFFSET + 4]);
        match u32::from_le_bytes(len) {
            0 => Ok(None),
            4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&self.map[ADDR_OFFSET..ADDR_OFFSET + 4]);
                Ok(Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port)))
            }
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&self.map[ADDR_OFFSET..ADDR_OFFSET + 16]);
                Ok(Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)))
            }
            other => Err(LogError::MalformedNodeState { length: other }),
        }
    }

    /// Persists a new term and flushes before returning.
    pub(crate) fn set_term(&mut self, value: u64) -> Result<(), LogError> {
        self.map[TERM_OFFSET..TERM_OFFSET + 8].copy_from_slice(&value.to_le_bytes());
        self.map.flush_range(TERM_OFFSET, 8)?;
        Ok(())
    }

    /// Persists the voted-for endpoint (`None` clears the vote) and flushes
    /// before returning.
    pub(crate) fn set_voted_for(&mut self, endpoint: Option<SocketAddr>) -> Result<(), LogError> {
        match endpoint {
            None => {
                self.map[PORT_OFFSET..ADDR_OFFSET + 16].fill(0);
            }
            Some(addr) => {
                self.map[PORT_OFFSET..PORT_OFFSET + 4]
                    .copy_from_slice(&(addr.port() as u32).to_le_bytes());
                match addr.ip() {
                    IpAddr::V4(ip) => {
                        self.map[ADDR_LEN_OFFSET..ADDR_LEN_OFFSET + 4]
                            .copy_from_slice(&4u32.to_le_bytes());
                        self.map[ADDR_OFFSET..ADDR_OFFSET + 4].copy_from_slice(&ip.octets());
                    }
                    IpAddr::V6(ip) => {
                        self.map[ADDR_LEN_OFFSET..ADDR_LEN_OFFSET + 4]
                            .copy_from_slice(&16u32.to_le_bytes());
                        self.map[ADDR_OFFSET..ADDR_OFFSET + 16].copy_from_slice(&ip.octets());
                    }
                }
            }
        }
        self.map.flush_range(PORT_OFFSET, 4 + 4 + 16)?;
        Ok(())
    }

    pub(crate) fn flush(&self) -> Result<(), LogError> {
        self.map.flush()?;
        Ok(())
    }
}
