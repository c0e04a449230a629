//! Input log
//!
//! A sharded write-ahead log that keeps acknowledged samples recoverable
//! until their blocks are sealed in the main store. Each concurrent stream
//! owns a ring of fixed-size log volumes and writes CRC-framed batches of
//! samples; replay walks each stream in sequence order and stops at the
//! first damaged frame.

mod frame;
mod reader;
mod writer;

pub use frame::{decode_frame, encode_frame, Frame};
pub use reader::WalReader;
pub use writer::InputLog;

use std::path::PathBuf;

/// WAL sync policy
#[derive(Debug, Clone, Copy)]
pub enum SyncPolicy {
    /// Fsync after every sealed frame (safest, slowest)
    Immediate,
    /// Fsync after every N sealed frames
    EveryN(usize),
    /// Never fsync; the OS decides
    Never,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::Immediate
    }
}

/// WAL configuration
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Master switch; a disabled WAL accepts writes and drops them
    pub enabled: bool,
    /// Directory for log volumes
    pub dir: PathBuf,
    /// Number of independent streams
    pub nconcurrency: usize,
    /// Volumes per stream ring
    pub nvolumes: usize,
    /// Maximum volume size in bytes
    pub volume_size: u64,
    /// Frame buffer threshold in bytes
    pub frame_size: usize,
    /// Sync policy
    pub sync: SyncPolicy,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("data/wal"),
            nconcurrency: crate::config::WAL_CONCURRENCY,
            nvolumes: crate::config::WAL_VOLUMES,
            volume_size: crate::config::WAL_VOLUME_SIZE,
            frame_size: crate::config::WAL_FRAME_SIZE,
            sync: SyncPolicy::default(),
        }
    }
}

fn volume_file_name(stream: u16, seq: u64) -> String {
    format!("wal_{:02}_{:012}.log", stream, seq)
}

fn parse_volume_name(name: &str) -> Option<(u16, u64)> {
    let rest = name.strip_prefix("wal_")?.strip_suffix(".log")?;
    let (stream, seq) = rest.split_once('_')?;
    Some((stream.parse().ok()?, seq.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_name_roundtrip() {
        let name = volume_file_name(3, 42);
        assert_eq!(parse_volume_name(&name), Some((3, 42)));
        assert_eq!(parse_volume_name("wal_xx.log"), None);
        assert_eq!(parse_volume_name("volume_0001.ember"), None);
    }
}
