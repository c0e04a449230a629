//! Block store
//!
//! A flat, append-only address space of fixed-size blocks. Three variants:
//! a fixed ring of volumes that recycles the eldest blocks on wraparound, a
//! single expandable volume that grows on demand, and an in-memory store for
//! tests. Addresses are dense, monotonically assigned, and never reused for
//! different data within a generation; address zero means "no block".

mod volume;

pub use volume::{Volume, VolumeDescriptor, BLOCK_TRAILER_SIZE};

use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use crate::config::BLOCK_PAYLOAD_SIZE;
use crate::error::{EmberError, Result};
use crate::types::{LogicAddr, EMPTY_ADDR};

/// Block store variants
#[derive(Debug)]
pub enum BlockStore {
    /// Fixed ring of volumes, recycles the eldest on wrap
    Fixed(FixedSizeStore),
    /// Single volume growing on demand
    Expandable(ExpandableStore),
    /// In-memory store for tests
    Memory(MemoryStore),
}

impl BlockStore {
    /// Create a fixed ring of `num_volumes` volumes of `capacity` data blocks
    pub fn create_fixed(dir: impl AsRef<Path>, num_volumes: u32, capacity: u32) -> Result<Self> {
        Ok(BlockStore::Fixed(FixedSizeStore::create(
            dir,
            num_volumes,
            capacity,
        )?))
    }

    /// Open a fixed ring from catalog descriptors
    pub fn open_fixed(descriptors: &[VolumeDescriptor]) -> Result<Self> {
        Ok(BlockStore::Fixed(FixedSizeStore::open(descriptors)?))
    }

    /// Create a single expandable volume
    pub fn create_expandable(dir: impl AsRef<Path>) -> Result<Self> {
        Ok(BlockStore::Expandable(ExpandableStore::create(dir)?))
    }

    /// Open an expandable volume from its catalog descriptor
    pub fn open_expandable(desc: &VolumeDescriptor) -> Result<Self> {
        Ok(BlockStore::Expandable(ExpandableStore::open(desc)?))
    }

    /// Create an in-memory store
    pub fn new_memory() -> Self {
        BlockStore::Memory(MemoryStore::new())
    }

    /// Append a payload, returning its logical address.
    ///
    /// The payload must fit `BLOCK_PAYLOAD_SIZE`; shorter payloads are
    /// zero-padded on disk.
    pub fn append(&self, payload: &[u8]) -> Result<LogicAddr> {
        if payload.len() > BLOCK_PAYLOAD_SIZE {
            return Err(EmberError::BadArg(format!(
                "payload of {} bytes exceeds block capacity",
                payload.len()
            )));
        }
        match self {
            BlockStore::Fixed(s) => s.append(payload),
            BlockStore::Expandable(s) => s.append(payload),
            BlockStore::Memory(s) => s.append(payload),
        }
    }

    /// Read the payload at `addr`
    pub fn read_block(&self, addr: LogicAddr) -> Result<Vec<u8>> {
        if addr == EMPTY_ADDR {
            return Err(EmberError::BadArg("read of empty address".into()));
        }
        match self {
            BlockStore::Fixed(s) => s.read_block(addr),
            BlockStore::Expandable(s) => s.read_block(addr),
            BlockStore::Memory(s) => s.read_block(addr),
        }
    }

    /// Flush buffered writes to disk
    pub fn flush(&self) -> Result<()> {
        match self {
            BlockStore::Fixed(s) => s.flush(),
            BlockStore::Expandable(s) => s.flush(),
            BlockStore::Memory(_) => Ok(()),
        }
    }

    /// Number of appends performed since open
    pub fn append_count(&self) -> u64 {
        match self {
            BlockStore::Fixed(s) => s.appends.load(Ordering::Relaxed),
            BlockStore::Expandable(s) => s.appends.load(Ordering::Relaxed),
            BlockStore::Memory(s) => s.appends.load(Ordering::Relaxed),
        }
    }

    /// Volume descriptors for the catalog manifest
    pub fn descriptors(&self) -> Vec<VolumeDescriptor> {
        match self {
            BlockStore::Fixed(s) => s.state.read().volumes.iter().map(|v| v.descriptor()).collect(),
            BlockStore::Expandable(s) => {
                let state = s.state.read();
                vec![state.volume.descriptor()]
            }
            BlockStore::Memory(_) => Vec::new(),
        }
    }
}

#[derive(Debug)]
struct FixedState {
    volumes: Vec<Volume>,
    /// Next address to assign; addresses start at 1
    next_addr: u64,
}

/// Fixed ring of volumes with generation-checked recycling
#[derive(Debug)]
pub struct FixedSizeStore {
    state: RwLock<FixedState>,
    capacity: u32,
    total_blocks: u64,
    appends: AtomicU64,
}

impl FixedSizeStore {
    fn create(dir: impl AsRef<Path>, num_volumes: u32, capacity: u32) -> Result<Self> {
        if num_volumes == 0 || capacity == 0 {
            // A ring with no slots can never accept a write.
            return Err(EmberError::OutOfSpace);
        }
        std::fs::create_dir_all(dir.as_ref())?;
        let mut volumes = Vec::with_capacity(num_volumes as usize);
        for id in 0..num_volumes {
            let path = volume_path(dir.as_ref(), id);
            volumes.push(Volume::create(path, id, capacity)?);
        }
        info!(
            num_volumes,
            capacity, "created fixed block store"
        );
        Ok(Self {
            state: RwLock::new(FixedState {
                volumes,
                next_addr: 1,
            }),
            capacity,
            total_blocks: num_volumes as u64 * capacity as u64,
            appends: AtomicU64::new(0),
        })
    }

    fn open(descriptors: &[VolumeDescriptor]) -> Result<Self> {
        if descriptors.is_empty() {
            return Err(EmberError::BadArg("no volume descriptors".into()));
        }
        let capacity = descriptors[0].capacity;
        let mut volumes = Vec::with_capacity(descriptors.len());
        for desc in descriptors {
            if desc.capacity != capacity {
                return Err(EmberError::BadData(
                    "volumes in a ring must share one capacity".into(),
                ));
            }
            volumes.push(Volume::open(desc)?);
        }
        volumes.sort_by_key(|v| v.id());
        let total_blocks = volumes.len() as u64 * capacity as u64;

        // The write cursor sits in the volume last written to: highest
        // generation, highest id among those. Untouched volumes don't count.
        let next_addr = volumes
            .iter()
            .filter(|v| v.nblocks() > 0)
            .max_by_key(|v| (v.generation(), v.id()))
            .map(|current| {
                current.generation() as u64 * total_blocks
                    + current.id() as u64 * capacity as u64
                    + current.nblocks() as u64
                    + 1
            })
            .unwrap_or(1);

        info!(next_addr, "opened fixed block store");
        Ok(Self {
            state: RwLock::new(FixedState { volumes, next_addr }),
            capacity,
            total_blocks,
            appends: AtomicU64::new(0),
        })
    }

    fn locate(&self, addr: LogicAddr) -> (u32, usize, u32) {
        let seq = addr - 1;
        let generation = (seq / self.total_blocks) as u32;
        let slot = seq % self.total_blocks;
        let volume = (slot / self.capacity as u64) as usize;
        let offset = (slot % self.capacity as u64) as u32;
        (generation, volume, offset)
    }

    fn append(&self, payload: &[u8]) -> Result<LogicAddr> {
        let mut state = self.state.write();
        let addr = state.next_addr;
        let (generation, volume, offset) = self.locate(addr);

        if offset == 0 {
            // Entering a volume starts its next pass; eldest data is gone.
            state.volumes[volume].recycle(generation)?;
        }
        state.volumes[volume].write_block(offset, payload, generation)?;
        state.next_addr += 1;
        self.appends.fetch_add(1, Ordering::Relaxed);
        Ok(addr)
    }

    fn read_block(&self, addr: LogicAddr) -> Result<Vec<u8>> {
        let state = self.state.read();
        if addr >= state.next_addr {
            return Err(EmberError::BadArg(format!(
                "address {:#x} was never allocated",
                addr
            )));
        }
        let (generation, volume, offset) = self.locate(addr);
        state.volumes[volume].read_block(offset, generation, addr)
    }

    fn flush(&self) -> Result<()> {
        let state = self.state.read();
        for volume in &state.volumes {
            volume.sync()?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct ExpandableState {
    volume: Volume,
    next_addr: u64,
}

/// Single volume growing on demand, no recycling
#[derive(Debug)]
pub struct ExpandableStore {
    state: RwLock<ExpandableState>,
    appends: AtomicU64,
}

impl ExpandableStore {
    fn create(dir: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        let volume = Volume::create(volume_path(dir.as_ref(), 0), 0, u32::MAX)?;
        Ok(Self {
            state: RwLock::new(ExpandableState {
                volume,
                next_addr: 1,
            }),
            appends: AtomicU64::new(0),
        })
    }

    fn open(desc: &VolumeDescriptor) -> Result<Self> {
        let volume = Volume::open(desc)?;
        let next_addr = volume.nblocks() as u64 + 1;
        Ok(Self {
            state: RwLock::new(ExpandableState { volume, next_addr }),
            appends: AtomicU64::new(0),
        })
    }

    fn append(&self, payload: &[u8]) -> Result<LogicAddr> {
        let mut state = self.state.write();
        let addr = state.next_addr;
        let offset = (addr - 1) as u32;
        state.volume.write_block(offset, payload, 0)?;
        state.next_addr += 1;
        self.appends.fetch_add(1, Ordering::Relaxed);
        Ok(addr)
    }

    fn read_block(&self, addr: LogicAddr) -> Result<Vec<u8>> {
        let state = self.state.read();
        if addr >= state.next_addr {
            return Err(EmberError::BadArg(format!(
                "address {:#x} was never allocated",
                addr
            )));
        }
        state.volume.read_block((addr - 1) as u32, 0, addr)
    }

    fn flush(&self) -> Result<()> {
        self.state.read().volume.sync()
    }
}

/// In-memory store for tests; counts appends for write-amplification checks
#[derive(Debug)]
pub struct MemoryStore {
    blocks: RwLock<Vec<Vec<u8>>>,
    appends: AtomicU64,
}

impl MemoryStore {
    fn new() -> Self {
        Self {
            blocks: RwLock::new(Vec::new()),
            appends: AtomicU64::new(0),
        }
    }

    fn append(&self, payload: &[u8]) -> Result<LogicAddr> {
        let mut blocks = self.blocks.write();
        let mut stored = payload.to_vec();
        stored.resize(BLOCK_PAYLOAD_SIZE, 0);
        blocks.push(stored);
        self.appends.fetch_add(1, Ordering::Relaxed);
        Ok(blocks.len() as u64)
    }

    fn read_block(&self, addr: LogicAddr) -> Result<Vec<u8>> {
        let blocks = self.blocks.read();
        blocks
            .get(addr as usize - 1)
            .cloned()
            .ok_or_else(|| EmberError::BadArg(format!("address {:#x} was never allocated", addr)))
    }
}

fn volume_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("volume_{:04}.ember", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_roundtrip() {
        let store = BlockStore::new_memory();
        let a = store.append(b"first").unwrap();
        let b = store.append(b"second").unwrap();
        assert_ne!(a, EMPTY_ADDR);
        assert_ne!(a, b);

        assert_eq!(&store.read_block(a).unwrap()[..5], b"first");
        assert_eq!(&store.read_block(b).unwrap()[..6], b"second");
        assert_eq!(store.append_count(), 2);
    }

    #[test]
    fn test_fixed_append_read() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::create_fixed(dir.path(), 2, 4).unwrap();

        let mut addrs = Vec::new();
        for i in 0..6u8 {
            addrs.push(store.append(&[i; 100]).unwrap());
        }
        for (i, addr) in addrs.iter().enumerate() {
            let payload = store.read_block(*addr).unwrap();
            assert_eq!(payload[0], i as u8);
        }
    }

    #[test]
    fn test_wraparound_returns_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::create_fixed(dir.path(), 2, 2).unwrap();

        let first = store.append(b"gen zero").unwrap();
        // Fill the ring twice over so the first slot is recycled twice.
        for i in 0..8u8 {
            store.append(&[i; 8]).unwrap();
        }

        let err = store.read_block(first).unwrap_err();
        assert!(matches!(err, EmberError::Overwrite(_)), "got {:?}", err);
    }

    #[test]
    fn test_zero_capacity_ring_is_out_of_space() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            BlockStore::create_fixed(dir.path(), 0, 4).unwrap_err(),
            EmberError::OutOfSpace
        ));
        assert!(matches!(
            BlockStore::create_fixed(dir.path(), 2, 0).unwrap_err(),
            EmberError::OutOfSpace
        ));
    }

    #[test]
    fn test_unallocated_address_is_bad_arg() {
        let store = BlockStore::new_memory();
        assert!(matches!(
            store.read_block(42).unwrap_err(),
            EmberError::BadArg(_)
        ));
        assert!(matches!(
            store.read_block(EMPTY_ADDR).unwrap_err(),
            EmberError::BadArg(_)
        ));
    }

    #[test]
    fn test_fixed_reopen_continues_addresses() {
        let dir = TempDir::new().unwrap();
        let last_addr;
        let descriptors;
        {
            let store = BlockStore::create_fixed(dir.path(), 2, 4).unwrap();
            let mut addr = 0;
            for i in 0..5u8 {
                addr = store.append(&[i; 16]).unwrap();
            }
            last_addr = addr;
            store.flush().unwrap();
            descriptors = store.descriptors();
        }

        let store = BlockStore::open_fixed(&descriptors).unwrap();
        let next = store.append(b"after reopen").unwrap();
        assert_eq!(next, last_addr + 1);
        assert_eq!(store.read_block(last_addr).unwrap()[0], 4);
        assert_eq!(&store.read_block(next).unwrap()[..12], b"after reopen");
    }
}
