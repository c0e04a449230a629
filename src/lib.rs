//! EmberDB - Embedded Time-Series Storage Engine
//!
//! An append-heavy store for timestamped float and opaque-event samples
//! across a very large number of series, persisted in compressed 4 KiB
//! blocks and recoverable after a crash.
//!
//! # Architecture
//!
//! - **Block store**: a flat, append-only address space of CRC-checked
//!   blocks over a fixed ring of volumes, one expandable volume, or memory
//! - **Codec**: delta-of-delta timestamps and XOR-packed floats per leaf
//! - **Series trees**: per-series multi-level trees with in-memory open
//!   extents, immutable sealed nodes, and rescue points for recovery
//! - **Column store**: the registry of series trees plus write sessions
//! - **Input log**: a sharded WAL keeping acknowledged writes recoverable
//!   until their blocks seal
//! - **Recovery**: reconciles catalog, block store, and input log at open

pub mod blockstore;
pub mod catalog;
pub mod codec;
pub mod operators;
pub mod store;
pub mod tree;
pub mod wal;

mod checksum;
mod db;
mod error;
mod recovery;
mod types;

pub use db::{BlockStoreKind, Database, DbConfig};
pub use error::{EmberError, Result};
pub use recovery::{run_recovery, RecoveryReport};
pub use types::*;

/// EmberDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Storage block size (4 KiB)
    pub const BLOCK_SIZE: usize = 4 * 1024;

    /// Usable payload per block; the trailer holds crc32 + generation
    pub const BLOCK_PAYLOAD_SIZE: usize = BLOCK_SIZE - 8;

    /// Subtree references per inner tree node before it seals
    pub const TREE_FANOUT: usize = 32;

    /// Concurrent input log streams
    pub const WAL_CONCURRENCY: usize = 4;

    /// Log volumes per stream ring
    pub const WAL_VOLUMES: usize = 4;

    /// Input log volume size (16 MiB)
    pub const WAL_VOLUME_SIZE: u64 = 16 * 1024 * 1024;

    /// Frame buffer threshold (32 KiB)
    pub const WAL_FRAME_SIZE: usize = 32 * 1024;
}
