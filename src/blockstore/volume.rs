//! Volume files
//!
//! A volume is a flat file of fixed-size blocks. Block 0 is the volume
//! header; the remaining `capacity` blocks carry opaque payloads with a
//! `{crc32, generation}` trailer in the last eight bytes.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::checksum::crc32;
use crate::config::{BLOCK_PAYLOAD_SIZE, BLOCK_SIZE};
use crate::error::{EmberError, Result};

const VOLUME_MAGIC: u32 = 0x424C4B53;
const VOLUME_VERSION: u16 = 1;

/// Size of the block trailer: crc32 + generation
pub const BLOCK_TRAILER_SIZE: usize = 8;

/// Volume metadata as persisted in the catalog manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDescriptor {
    /// Volume id (position in the ring)
    pub id: u32,
    /// File path
    pub path: PathBuf,
    /// Capacity in data blocks (header block excluded)
    pub capacity: u32,
    /// Ring pass this volume was last written in
    pub generation: u32,
    /// Blocks written in the current generation
    pub nblocks: u32,
    /// On-disk format version
    pub version: u16,
}

/// One open volume file
#[derive(Debug)]
pub struct Volume {
    file: File,
    path: PathBuf,
    id: u32,
    capacity: u32,
    generation: u32,
    nblocks: u32,
}

impl Volume {
    /// Create a fresh volume file with a header block
    pub fn create(path: impl AsRef<Path>, id: u32, capacity: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let volume = Self {
            file,
            path,
            id,
            capacity,
            generation: 0,
            nblocks: 0,
        };
        volume.write_header()?;
        Ok(volume)
    }

    /// Open an existing volume, restoring counters from the descriptor
    pub fn open(desc: &VolumeDescriptor) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&desc.path)?;
        let mut header = vec![0u8; BLOCK_SIZE];
        file.read_exact_at(&mut header, 0)?;

        let mut cursor = &header[..];
        let magic = cursor.get_u32_le();
        if magic != VOLUME_MAGIC {
            return Err(EmberError::Corruption(format!(
                "bad volume magic in {:?}",
                desc.path
            )));
        }
        let version = cursor.get_u16_le();
        if version != VOLUME_VERSION {
            return Err(EmberError::BadData(format!(
                "unsupported volume version {}",
                version
            )));
        }
        let block_size = cursor.get_u32_le();
        if block_size as usize != BLOCK_SIZE {
            return Err(EmberError::BadData(format!(
                "volume block size {} does not match configured {}",
                block_size, BLOCK_SIZE
            )));
        }
        let capacity = cursor.get_u32_le();
        let _generation = cursor.get_u32_le();
        let id = cursor.get_u32_le();
        let expected = cursor.get_u32_le();
        let actual = crc32(&header[..22]);
        if expected != actual {
            return Err(EmberError::ChecksumMismatch { expected, actual });
        }
        if id != desc.id || capacity != desc.capacity {
            return Err(EmberError::BadData(format!(
                "volume {:?} does not match its descriptor",
                desc.path
            )));
        }

        Ok(Self {
            file,
            path: desc.path.clone(),
            id,
            capacity,
            generation: desc.generation,
            nblocks: desc.nblocks,
        })
    }

    fn write_header(&self) -> Result<()> {
        let mut buf = Vec::with_capacity(BLOCK_SIZE);
        buf.put_u32_le(VOLUME_MAGIC);
        buf.put_u16_le(VOLUME_VERSION);
        buf.put_u32_le(BLOCK_SIZE as u32);
        buf.put_u32_le(self.capacity);
        buf.put_u32_le(self.generation);
        buf.put_u32_le(self.id);
        let checksum = crc32(&buf);
        buf.put_u32_le(checksum);
        buf.resize(BLOCK_SIZE, 0);
        self.file.write_all_at(&buf, 0)?;
        Ok(())
    }

    /// Volume id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Capacity in data blocks
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Current generation
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Blocks written in the current generation
    pub fn nblocks(&self) -> u32 {
        self.nblocks
    }

    /// Descriptor snapshot for the catalog manifest
    pub fn descriptor(&self) -> VolumeDescriptor {
        VolumeDescriptor {
            id: self.id,
            path: self.path.clone(),
            capacity: self.capacity,
            generation: self.generation,
            nblocks: self.nblocks,
            version: VOLUME_VERSION,
        }
    }

    /// Start the next generation: rewind the write cursor and stamp the header
    pub fn recycle(&mut self, generation: u32) -> Result<()> {
        self.generation = generation;
        self.nblocks = 0;
        self.write_header()
    }

    /// Write a payload into the block at `offset`, stamping the trailer.
    ///
    /// Grows the file as needed; `offset` is in data blocks.
    pub fn write_block(&mut self, offset: u32, payload: &[u8], generation: u32) -> Result<()> {
        debug_assert!(payload.len() <= BLOCK_PAYLOAD_SIZE);
        let mut block = Vec::with_capacity(BLOCK_SIZE);
        block.extend_from_slice(payload);
        block.resize(BLOCK_PAYLOAD_SIZE, 0);
        let checksum = crc32(&block);
        block.put_u32_le(checksum);
        block.put_u32_le(generation);

        let pos = (offset as u64 + 1) * BLOCK_SIZE as u64;
        self.file.write_all_at(&block, pos)?;
        self.nblocks = self.nblocks.max(offset + 1);
        Ok(())
    }

    /// Read the block at `offset`, verifying generation then checksum
    pub fn read_block(&self, offset: u32, generation: u32, addr: u64) -> Result<Vec<u8>> {
        let pos = (offset as u64 + 1) * BLOCK_SIZE as u64;
        let mut block = vec![0u8; BLOCK_SIZE];
        self.file.read_exact_at(&mut block, pos)?;

        let mut trailer = &block[BLOCK_PAYLOAD_SIZE..];
        let expected = trailer.get_u32_le();
        let stored_generation = trailer.get_u32_le();
        if stored_generation != generation {
            return Err(EmberError::Overwrite(addr));
        }
        let actual = crc32(&block[..BLOCK_PAYLOAD_SIZE]);
        if expected != actual {
            return Err(EmberError::ChecksumMismatch { expected, actual });
        }

        block.truncate(BLOCK_PAYLOAD_SIZE);
        Ok(block)
    }

    /// Flush file contents to disk
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
