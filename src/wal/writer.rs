//! Input log writer

use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

use super::frame::encode_frame;
use super::{parse_volume_name, volume_file_name, SyncPolicy, WalConfig};
use crate::error::Result;
use crate::types::Sample;

/// Sharded input log: one single-writer stream per concurrency slot
pub struct InputLog {
    config: WalConfig,
    streams: Vec<Mutex<WalStream>>,
}

struct WalStream {
    id: u16,
    dir: PathBuf,
    file: File,
    seq: u64,
    volume_bytes: u64,
    frame_seq: u64,
    batch: Vec<Sample>,
    batch_bytes: usize,
    seals_since_sync: usize,
}

impl InputLog {
    /// Open the input log, resuming sequence numbers from existing volumes
    pub fn open(config: WalConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let mut streams = Vec::with_capacity(config.nconcurrency);
        for id in 0..config.nconcurrency as u16 {
            streams.push(Mutex::new(WalStream::open(&config, id)?));
        }
        Ok(Self { config, streams })
    }

    /// Number of streams
    pub fn nstreams(&self) -> usize {
        self.streams.len()
    }

    /// Whether any log volume holds sealed frames
    pub fn has_frames(&self) -> Result<bool> {
        if !self.config.dir.exists() {
            return Ok(false);
        }
        for entry in fs::read_dir(&self.config.dir)? {
            let entry = entry?;
            if let Some(name) = entry.path().file_name().and_then(|n| n.to_str()) {
                if parse_volume_name(name).is_some() && entry.metadata()?.len() > 0 {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Buffer a sample into its stream's open frame.
    ///
    /// Returns once the sample sits in the frame buffer; durability comes
    /// with the next seal, forced by `flush` or volume pressure. The
    /// returned flag is true when the stream rotated to a fresh volume:
    /// older log data is about to leave the replay window, so the caller
    /// must seal its open tails into the main store.
    pub fn append(&self, stream: usize, sample: &Sample) -> Result<bool> {
        let mut s = self.streams[stream % self.streams.len()].lock();
        s.push(sample, &self.config)
    }

    /// Seal and fsync the open frame of one stream
    pub fn flush_stream(&self, stream: usize) -> Result<()> {
        let mut s = self.streams[stream % self.streams.len()].lock();
        s.seal(&self.config, true)?;
        Ok(())
    }

    /// Seal and fsync every stream
    pub fn flush(&self) -> Result<()> {
        for stream in &self.streams {
            stream.lock().seal(&self.config, true)?;
        }
        Ok(())
    }

    /// Drop every log volume and restart all streams: a new generation,
    /// used after a completed replay
    pub fn truncate(&self) -> Result<()> {
        let mut guards: Vec<_> = self.streams.iter().map(|s| s.lock()).collect();
        for entry in fs::read_dir(&self.config.dir)? {
            let entry = entry?;
            if let Some(name) = entry.path().file_name().and_then(|n| n.to_str()) {
                if parse_volume_name(name).is_some() {
                    fs::remove_file(entry.path())?;
                }
            }
        }
        for guard in guards.iter_mut() {
            guard.restart()?;
        }
        info!("input log truncated");
        Ok(())
    }
}

impl WalStream {
    fn open(config: &WalConfig, id: u16) -> Result<Self> {
        // Resume after the newest existing volume of this stream.
        let mut max_seq = None;
        for entry in fs::read_dir(&config.dir)? {
            let entry = entry?;
            if let Some(name) = entry.path().file_name().and_then(|n| n.to_str()) {
                if let Some((stream, seq)) = parse_volume_name(name) {
                    if stream == id {
                        max_seq = Some(max_seq.map_or(seq, |m: u64| m.max(seq)));
                    }
                }
            }
        }
        let seq = max_seq.map_or(0, |m| m + 1);
        let file = Self::open_volume(&config.dir, id, seq)?;
        Ok(Self {
            id,
            dir: config.dir.clone(),
            file,
            seq,
            volume_bytes: 0,
            frame_seq: 0,
            batch: Vec::new(),
            batch_bytes: 0,
            seals_since_sync: 0,
        })
    }

    fn open_volume(dir: &PathBuf, id: u16, seq: u64) -> Result<File> {
        let path = dir.join(volume_file_name(id, seq));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(file)
    }

    fn push(&mut self, sample: &Sample, config: &WalConfig) -> Result<bool> {
        // Rough wire size: fixed fields plus the event body.
        let approx = 24
            + match &sample.payload {
                crate::types::Payload::Float(_) => 8,
                crate::types::Payload::Event(data) => 8 + data.len(),
            };
        self.batch.push(sample.clone());
        self.batch_bytes += approx;
        if self.batch_bytes >= config.frame_size {
            return self.seal(config, false);
        }
        Ok(false)
    }

    fn seal(&mut self, config: &WalConfig, force_sync: bool) -> Result<bool> {
        if self.batch.is_empty() {
            if force_sync {
                self.file.sync_all()?;
            }
            return Ok(false);
        }
        let frame = encode_frame(self.id, self.frame_seq, &self.batch)?;
        self.frame_seq += 1;
        self.batch.clear();
        self.batch_bytes = 0;

        let mut rotated = false;
        if self.volume_bytes > 0 && self.volume_bytes + frame.len() as u64 > config.volume_size {
            self.rotate(config)?;
            rotated = true;
        }

        self.file.write_all(&frame)?;
        self.volume_bytes += frame.len() as u64;
        self.seals_since_sync += 1;

        let sync = force_sync
            || match config.sync {
                SyncPolicy::Immediate => true,
                SyncPolicy::EveryN(n) => self.seals_since_sync >= n,
                SyncPolicy::Never => false,
            };
        if sync {
            self.file.sync_all()?;
            self.seals_since_sync = 0;
        }
        Ok(rotated)
    }

    fn rotate(&mut self, config: &WalConfig) -> Result<()> {
        self.file.sync_all()?;
        self.seq += 1;
        self.file = Self::open_volume(&self.dir, self.id, self.seq)?;
        self.volume_bytes = 0;

        // Ring semantics: evict the volume falling out of the window.
        if self.seq >= config.nvolumes as u64 {
            let stale = self.dir.join(volume_file_name(self.id, self.seq - config.nvolumes as u64));
            if stale.exists() {
                fs::remove_file(stale)?;
            }
        }
        Ok(())
    }

    fn restart(&mut self) -> Result<()> {
        self.seq = 0;
        self.frame_seq = 0;
        self.volume_bytes = 0;
        self.batch.clear();
        self.batch_bytes = 0;
        self.file = Self::open_volume(&self.dir, self.id, 0)?;
        Ok(())
    }
}
