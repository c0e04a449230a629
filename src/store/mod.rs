//! Column store
//!
//! The registry of per-series trees. One instance per database; sessions
//! dispatch writes into it and keep their own tree cache so the hot path
//! stays off the shared map. The map lock only guards the map shape: read
//! operations take shared acquisitions and every tree carries its own lock
//! for its open extents.

mod session;

pub use session::Session;

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::blockstore::BlockStore;
use crate::error::{EmberError, Result};
use crate::operators::{
    filter_aggregates, filter_events, filter_samples, AggregateIter, EventIter, SampleIter,
};
use crate::tree::{AppendOutcome, RepairStatus, SeriesTree};
use crate::types::{
    AggregateFilter, LogicAddr, Sample, SeriesId, Timestamp, ValueFilter,
};

/// Shared handle to one series tree
pub type SharedTree = Arc<Mutex<SeriesTree>>;

/// Per-session tree cache
pub type TreeCache = HashMap<SeriesId, SharedTree>;

/// Central repository of all series trees
pub struct ColumnStore {
    store: Arc<BlockStore>,
    columns: RwLock<HashMap<SeriesId, SharedTree>>,
}

impl ColumnStore {
    /// Create an empty column store over a block store
    pub fn new(store: Arc<BlockStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            columns: RwLock::new(HashMap::new()),
        })
    }

    /// The backing block store
    pub fn block_store(&self) -> Arc<BlockStore> {
        Arc::clone(&self.store)
    }

    /// Open every series from its persisted rescue points, returning the ids
    /// whose open leaves were lost and need WAL replay.
    pub fn open_or_restore(
        &self,
        mapping: HashMap<SeriesId, Vec<LogicAddr>>,
        force_init: bool,
    ) -> Result<Vec<SeriesId>> {
        let mut to_replay = Vec::new();
        for (id, rescue_points) in mapping {
            if rescue_points.is_empty() {
                warn!(series = id, "empty rescue points, series reopens empty");
            }
            let status = SeriesTree::classify(&rescue_points);
            if status == RepairStatus::Repair {
                info!(series = id, "open leaf lost, repair scheduled");
            } else if status == RepairStatus::Lost {
                error!(series = id, "rescue points inconsistent, sealed data lost");
            }

            let tree = Arc::new(Mutex::new(SeriesTree::new(
                id,
                rescue_points,
                Arc::clone(&self.store),
            )));
            {
                let mut columns = self.columns.write();
                if columns.contains_key(&id) {
                    return Err(EmberError::BadArg(format!(
                        "series {} is already open",
                        id
                    )));
                }
                columns.insert(id, Arc::clone(&tree));
            }

            if force_init || status != RepairStatus::Ok {
                tree.lock().force_init()?;
            }
            if status != RepairStatus::Ok {
                to_replay.push(id);
            }
        }
        Ok(to_replay)
    }

    /// Register a fresh series
    pub fn create_new_column(&self, id: SeriesId) -> Result<()> {
        let mut columns = self.columns.write();
        if columns.contains_key(&id) {
            return Err(EmberError::BadArg(format!("series {} already exists", id)));
        }
        let tree = Arc::new(Mutex::new(SeriesTree::new(
            id,
            Vec::new(),
            Arc::clone(&self.store),
        )));
        tree.lock().force_init()?;
        columns.insert(id, tree);
        Ok(())
    }

    /// Seal every open tree and return the rescue points to persist
    pub fn close(&self) -> Result<HashMap<SeriesId, Vec<LogicAddr>>> {
        let columns = self.columns.read();
        info!(columns = columns.len(), "column store close");
        let mut result = HashMap::with_capacity(columns.len());
        for (id, tree) in columns.iter() {
            let mut tree = tree.lock();
            if tree.is_initialized() {
                result.insert(*id, tree.close()?);
            }
        }
        Ok(result)
    }

    /// Seal specific trees and return their new rescue points
    pub fn close_columns(&self, ids: &[SeriesId]) -> Result<HashMap<SeriesId, Vec<LogicAddr>>> {
        let columns = self.columns.read();
        let mut result = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(tree) = columns.get(id) {
                let mut tree = tree.lock();
                if tree.is_initialized() {
                    result.insert(*id, tree.close()?);
                }
            }
        }
        Ok(result)
    }

    /// Look up a tree handle
    pub fn tree(&self, id: SeriesId) -> Option<SharedTree> {
        self.columns.read().get(&id).cloned()
    }

    /// Write a sample.
    ///
    /// On a seal the fresh rescue points are swapped into `rescue_points`
    /// for the caller to persist. A provided cache learns the tree handle so
    /// the session skips this lookup next time.
    pub fn write(
        &self,
        sample: &Sample,
        rescue_points: &mut Vec<LogicAddr>,
        cache: Option<&mut TreeCache>,
    ) -> Result<AppendOutcome> {
        let tree = self
            .tree(sample.series)
            .ok_or(EmberError::NotFound(sample.series))?;
        let outcome = {
            let mut guard = tree.lock();
            let outcome = guard.append_sample(sample.timestamp, &sample.payload, false)?;
            if outcome == AppendOutcome::OkFlushNeeded {
                *rescue_points = guard.roots();
            }
            outcome
        };
        if let Some(cache) = cache {
            cache.insert(sample.series, tree);
        }
        Ok(outcome)
    }

    /// Write during WAL replay, bypassing duplicate rejection
    pub fn recovery_write(&self, sample: &Sample, allow_duplicates: bool) -> Result<AppendOutcome> {
        let tree = self
            .tree(sample.series)
            .ok_or(EmberError::NotFound(sample.series))?;
        let mut guard = tree.lock();
        guard.append_sample(sample.timestamp, &sample.payload, allow_duplicates)
    }

    fn with_tree<T>(
        &self,
        id: SeriesId,
        f: impl FnOnce(&mut SeriesTree) -> Result<T>,
    ) -> Result<T> {
        let tree = self.tree(id).ok_or(EmberError::NotFound(id))?;
        let mut guard = tree.lock();
        f(&mut guard)
    }

    /// One range scan per id, in the requested time order
    pub fn scan(
        &self,
        ids: &[SeriesId],
        begin: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<SampleIter>> {
        let mut out: Vec<SampleIter> = Vec::with_capacity(ids.len());
        for id in ids {
            let iter = self.with_tree(*id, |tree| tree.search(begin, end))?;
            out.push(Box::new(iter));
        }
        Ok(out)
    }

    /// Range scans with per-id value filters; an id missing from `filters`
    /// is an error, an empty filter degrades to a plain scan
    pub fn filter(
        &self,
        ids: &[SeriesId],
        begin: Timestamp,
        end: Timestamp,
        filters: &HashMap<SeriesId, ValueFilter>,
    ) -> Result<Vec<SampleIter>> {
        let mut out: Vec<SampleIter> = Vec::with_capacity(ids.len());
        for id in ids {
            let filter = filters.get(id).copied().ok_or_else(|| {
                error!(series = id, "no filter supplied for series");
                EmberError::BadArg(format!("no filter for series {}", id))
            })?;
            let iter = self.with_tree(*id, |tree| tree.search(begin, end))?;
            if filter.is_empty() {
                out.push(Box::new(iter));
            } else {
                out.push(filter_samples(Box::new(iter), filter));
            }
        }
        Ok(out)
    }

    /// One total aggregate per id over `[begin, end]`
    pub fn aggregate(
        &self,
        ids: &[SeriesId],
        begin: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<AggregateIter>> {
        let mut out: Vec<AggregateIter> = Vec::with_capacity(ids.len());
        for id in ids {
            let agg = self.with_tree(*id, |tree| tree.aggregate(begin, end))?;
            out.push(Box::new(std::iter::once(Ok((begin, agg)))));
        }
        Ok(out)
    }

    /// One step-bucketed aggregate stream per id
    pub fn group_aggregate(
        &self,
        ids: &[SeriesId],
        begin: Timestamp,
        end: Timestamp,
        step: u64,
    ) -> Result<Vec<AggregateIter>> {
        let mut out: Vec<AggregateIter> = Vec::with_capacity(ids.len());
        for id in ids {
            let iter = self.with_tree(*id, |tree| tree.group_aggregate(begin, end, step))?;
            out.push(Box::new(iter));
        }
        Ok(out)
    }

    /// Step-bucketed aggregates with per-id filters on the bucket statistic
    pub fn group_aggfilter(
        &self,
        ids: &[SeriesId],
        begin: Timestamp,
        end: Timestamp,
        step: u64,
        filters: &HashMap<SeriesId, AggregateFilter>,
    ) -> Result<Vec<AggregateIter>> {
        let mut out: Vec<AggregateIter> = Vec::with_capacity(ids.len());
        for id in ids {
            let filter = filters.get(id).copied().ok_or_else(|| {
                error!(series = id, "no aggregate filter supplied for series");
                EmberError::BadArg(format!("no filter for series {}", id))
            })?;
            let iter = self.with_tree(*id, |tree| tree.group_aggregate(begin, end, step))?;
            if filter.filter.is_empty() {
                out.push(Box::new(iter));
            } else {
                out.push(filter_aggregates(Box::new(iter), filter));
            }
        }
        Ok(out)
    }

    /// One event scan per id
    pub fn scan_events(
        &self,
        ids: &[SeriesId],
        begin: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<EventIter>> {
        let mut out: Vec<EventIter> = Vec::with_capacity(ids.len());
        for id in ids {
            let iter = self.with_tree(*id, |tree| tree.search_events(begin, end))?;
            out.push(Box::new(iter));
        }
        Ok(out)
    }

    /// Event scans keeping only bodies that contain `pattern`
    pub fn filter_events(
        &self,
        ids: &[SeriesId],
        begin: Timestamp,
        end: Timestamp,
        pattern: &[u8],
    ) -> Result<Vec<EventIter>> {
        let mut out: Vec<EventIter> = Vec::with_capacity(ids.len());
        for id in ids {
            let iter = self.with_tree(*id, |tree| tree.search_events(begin, end))?;
            out.push(filter_events(Box::new(iter), pattern.to_vec()));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Payload;

    fn memory_cstore() -> Arc<ColumnStore> {
        ColumnStore::new(Arc::new(BlockStore::new_memory()))
    }

    #[test]
    fn test_write_unknown_series_is_not_found() {
        let cstore = memory_cstore();
        let mut rescue = Vec::new();
        let err = cstore
            .write(&Sample::float(1, 10, 1.0), &mut rescue, None)
            .unwrap_err();
        assert!(matches!(err, EmberError::NotFound(1)));
    }

    #[test]
    fn test_create_write_scan() {
        let cstore = memory_cstore();
        cstore.create_new_column(1).unwrap();
        cstore.create_new_column(2).unwrap();

        let mut rescue = Vec::new();
        for i in 0..100u64 {
            cstore
                .write(&Sample::float(1, 100 + i, i as f64), &mut rescue, None)
                .unwrap();
            cstore
                .write(&Sample::float(2, 100 + i, i as f64 * 2.0), &mut rescue, None)
                .unwrap();
        }

        let iters = cstore.scan(&[1, 2], 100, 199).unwrap();
        assert_eq!(iters.len(), 2);
        for (idx, iter) in iters.into_iter().enumerate() {
            let samples: Vec<_> = iter.collect::<Result<Vec<_>>>().unwrap();
            assert_eq!(samples.len(), 100);
            let scale = (idx + 1) as f64;
            assert_eq!(samples[10], (110, 10.0 * scale));
        }
    }

    #[test]
    fn test_write_fills_cache() {
        let cstore = memory_cstore();
        cstore.create_new_column(9).unwrap();

        let mut cache = TreeCache::new();
        let mut rescue = Vec::new();
        cstore
            .write(&Sample::float(9, 1, 0.5), &mut rescue, Some(&mut cache))
            .unwrap();
        assert!(cache.contains_key(&9));

        // The cached handle is the same tree: writes through it are visible.
        cache[&9].lock().append(2, 1.5).unwrap();
        let agg = cstore.with_tree(9, |t| t.aggregate(0, 10)).unwrap();
        assert_eq!(agg.count, 2);
    }

    #[test]
    fn test_open_or_restore_empty_rescue_list() {
        let cstore = memory_cstore();
        let mut mapping = HashMap::new();
        mapping.insert(5u64, Vec::new());
        let to_replay = cstore.open_or_restore(mapping, false).unwrap();
        assert!(to_replay.is_empty());

        // The series exists and accepts writes.
        let mut rescue = Vec::new();
        cstore
            .write(&Sample::float(5, 1, 1.0), &mut rescue, None)
            .unwrap();
    }

    #[test]
    fn test_open_or_restore_flags_repair() {
        let cstore = memory_cstore();
        cstore.create_new_column(3).unwrap();
        let mut rescue = Vec::new();
        let mut state = 7u64;
        for i in 0..30_000u64 {
            state = state.wrapping_mul(2862933555777941757).wrapping_add(3037000493);
            cstore
                .write(
                    &Sample::float(3, 1 + i, (state >> 40) as f64),
                    &mut rescue,
                    None,
                )
                .unwrap();
        }
        assert!(!rescue.is_empty(), "test needs a sealed leaf");

        // Fresh column store over the same blocks, as after a crash.
        let reopened = ColumnStore::new(cstore.block_store());
        let mut mapping = HashMap::new();
        mapping.insert(3u64, rescue);
        let to_replay = reopened.open_or_restore(mapping, false).unwrap();
        assert_eq!(to_replay, vec![3]);

        let out = reopened
            .recovery_write(&Sample::float(3, 1, 0.0), true)
            .unwrap();
        assert_eq!(out, AppendOutcome::Ok);
    }

    #[test]
    fn test_event_series_roundtrip() {
        let id = 6 | (1 << 63);
        let cstore = memory_cstore();
        cstore.create_new_column(id).unwrap();

        let mut rescue = Vec::new();
        for i in 0..50u64 {
            let body = if i % 10 == 0 { "alert: overload" } else { "ok" };
            cstore
                .write(
                    &Sample {
                        series: id,
                        timestamp: 1 + i,
                        payload: Payload::Event(body.as_bytes().to_vec()),
                    },
                    &mut rescue,
                    None,
                )
                .unwrap();
        }

        let all: Vec<_> = cstore
            .scan_events(&[id], 0, 100)
            .unwrap()
            .remove(0)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(all.len(), 50);

        let alerts: Vec<_> = cstore
            .filter_events(&[id], 0, 100, b"alert")
            .unwrap()
            .remove(0)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(alerts.len(), 5);
    }

    #[test]
    fn test_filter_requires_entry_per_id() {
        let cstore = memory_cstore();
        cstore.create_new_column(1).unwrap();
        let filters = HashMap::new();
        let err = cstore.filter(&[1], 0, 100, &filters).err().unwrap();
        assert!(matches!(err, EmberError::BadArg(_)));
    }
}
