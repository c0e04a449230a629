//! Write sessions
//!
//! One session per writer connection. A session routes every write through
//! its WAL stream first, then into the series tree, keeping a private tree
//! cache so repeat writers touch no shared map. Sessions are cheap; create
//! one per thread.

use std::sync::Arc;
use tracing::warn;

use super::{ColumnStore, TreeCache};
use crate::error::Result;
use crate::tree::AppendOutcome;
use crate::types::{LogicAddr, Sample, SeriesId};
use crate::wal::InputLog;

/// Per-writer dispatch handle
pub struct Session {
    cstore: Arc<ColumnStore>,
    cache: TreeCache,
    wal: Option<Arc<InputLog>>,
    stream: usize,
    pending_rescue: Vec<(SeriesId, Vec<LogicAddr>)>,
    closed: bool,
}

impl Session {
    pub(crate) fn new(
        cstore: Arc<ColumnStore>,
        wal: Option<Arc<InputLog>>,
        stream: usize,
    ) -> Self {
        Self {
            cstore,
            cache: TreeCache::new(),
            wal,
            stream,
            pending_rescue: Vec::new(),
            closed: false,
        }
    }

    /// The WAL stream this session writes to
    pub fn stream(&self) -> usize {
        self.stream
    }

    /// Write one sample.
    ///
    /// The sample is buffered in the session's WAL stream before it reaches
    /// the tree, so an acknowledged write survives a crash once the frame
    /// seals. On `OkFlushNeeded` the new rescue points are swapped into
    /// `rescue_points` for the caller to persist. A log volume rotation
    /// evicts the session's open tails first (see `take_rescue_updates`).
    pub fn write(
        &mut self,
        sample: &Sample,
        rescue_points: &mut Vec<LogicAddr>,
    ) -> Result<AppendOutcome> {
        if let Some(wal) = &self.wal {
            let rotated = wal.append(self.stream, sample)?;
            if rotated {
                self.evict_tails()?;
            }
        }
        if let Some(tree) = self.cache.get(&sample.series) {
            let mut guard = tree.lock();
            let outcome = guard.append_sample(sample.timestamp, &sample.payload, false)?;
            if outcome == AppendOutcome::OkFlushNeeded {
                *rescue_points = guard.roots();
            }
            return Ok(outcome);
        }
        self.cstore
            .write(sample, rescue_points, Some(&mut self.cache))
    }

    /// Rescue-point updates produced by log-driven tail eviction, drained
    /// by the caller so it can persist them to the catalog
    pub fn take_rescue_updates(&mut self) -> Vec<(SeriesId, Vec<LogicAddr>)> {
        std::mem::take(&mut self.pending_rescue)
    }

    /// Seal the open leaf of every cached tree so data retiring from the
    /// log's replay window is already redundant in the main store
    fn evict_tails(&mut self) -> Result<()> {
        for (id, tree) in &self.cache {
            let mut guard = tree.lock();
            if let Some(roots) = guard.flush_tail()? {
                self.pending_rescue.push((*id, roots));
            }
        }
        Ok(())
    }

    /// Seal and fsync this session's WAL stream
    pub fn flush(&self) -> Result<()> {
        if let Some(wal) = &self.wal {
            wal.flush_stream(self.stream)?;
        }
        Ok(())
    }

    /// Close the session: drop cached trees and force the WAL frame out
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.cache.clear();
        self.flush()?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                warn!(stream = self.stream, %e, "session close failed on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::BlockStore;
    use crate::error::EmberError;

    #[test]
    fn test_session_write_uses_cache() {
        let cstore = ColumnStore::new(Arc::new(BlockStore::new_memory()));
        cstore.create_new_column(1).unwrap();

        let mut session = Session::new(Arc::clone(&cstore), None, 0);
        let mut rescue = Vec::new();
        for i in 0..10u64 {
            session
                .write(&Sample::float(1, 100 + i, i as f64), &mut rescue)
                .unwrap();
        }
        assert!(session.cache.contains_key(&1));

        let samples: Vec<_> = cstore
            .scan(&[1], 0, 1000)
            .unwrap()
            .remove(0)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(samples.len(), 10);
    }

    #[test]
    fn test_session_unknown_series() {
        let cstore = ColumnStore::new(Arc::new(BlockStore::new_memory()));
        let mut session = Session::new(cstore, None, 0);
        let mut rescue = Vec::new();
        let err = session
            .write(&Sample::float(404, 1, 1.0), &mut rescue)
            .unwrap_err();
        assert!(matches!(err, EmberError::NotFound(404)));
    }
}
