//! CRC32 checksums for blocks, nodes, and log frames.
//!
//! The backing implementation (hardware or slice-by-8 software) is picked by
//! `crc32fast` the first time it runs and stays fixed for the process
//! lifetime, so the same bytes always hash the same way within one run.

/// Hash a single buffer
#[inline]
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Incremental CRC32 over several buffers
#[derive(Debug, Default)]
pub struct Crc32 {
    inner: crc32fast::Hasher,
}

impl Crc32 {
    /// Start a fresh checksum
    pub fn new() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }

    /// Feed bytes
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finish and return the digest
    pub fn finalize(self) -> u32 {
        self.inner.finalize()
    }
}
