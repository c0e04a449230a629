//! Startup recovery
//!
//! Reconciles the catalog, the block store, and the input log once per
//! process start, before any write is accepted. Trees whose open leaves
//! were lost are rebuilt from their sealed levels, the input log is
//! replayed on top, and the advanced rescue points go back to the catalog
//! so the next start is clean.

use std::collections::HashSet;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::error::{EmberError, Result};
use crate::store::ColumnStore;
use crate::types::SeriesId;
use crate::wal::{InputLog, WalConfig, WalReader};

/// What recovery did
#[derive(Debug, Default, Clone)]
pub struct RecoveryReport {
    /// Series that needed their open leaf rebuilt
    pub repaired_series: Vec<SeriesId>,
    /// Samples re-applied from the input log
    pub recovered_samples: usize,
}

/// Run the full recovery protocol.
///
/// On success the column store is open for writing and the input log is
/// empty. On failure the caller must keep the database read-only.
pub fn run_recovery(
    catalog: &dyn Catalog,
    cstore: &ColumnStore,
    input_log: Option<&InputLog>,
    wal_config: &WalConfig,
) -> Result<RecoveryReport> {
    let mapping = catalog.rescue_points();
    let repaired = cstore.open_or_restore(mapping, false)?;
    let mut report = RecoveryReport {
        repaired_series: repaired,
        recovered_samples: 0,
    };

    let log = match input_log {
        Some(log) => log,
        None => {
            if !report.repaired_series.is_empty() {
                // Sealed levels were restored but the tail samples are gone.
                warn!(
                    series = report.repaired_series.len(),
                    "repair without an input log loses unflushed samples"
                );
            }
            return Ok(report);
        }
    };

    if report.repaired_series.is_empty() && !log.has_frames()? {
        return Ok(report);
    }

    // Samples written after a clean flush may still sit in the log, so every
    // stream replays in full regardless of which series were repaired.
    let mut modified: HashSet<SeriesId> = HashSet::new();
    let reader = WalReader::new(wal_config.clone());
    for samples in reader.replay_all()? {
        for sample in samples {
            match cstore.recovery_write(&sample, true) {
                Ok(_) => {
                    report.recovered_samples += 1;
                    modified.insert(sample.series);
                }
                Err(EmberError::NotFound(id)) => {
                    // The series was registered after the last catalog sync;
                    // the log is the only record of it.
                    cstore.create_new_column(id)?;
                    cstore.recovery_write(&sample, true)?;
                    report.recovered_samples += 1;
                    modified.insert(id);
                }
                Err(e) => return Err(e),
            }
        }
    }

    // Seal what replay rebuilt so rescue points move past the recovered
    // data, then retire the log.
    let ids: Vec<SeriesId> = modified.into_iter().collect();
    let new_points = cstore.close_columns(&ids)?;
    for (id, addrs) in new_points {
        catalog.set_rescue_points(id, addrs);
    }
    catalog.set_volumes(cstore.block_store().descriptors());
    catalog.sync()?;
    log.truncate()?;

    info!(
        repaired = report.repaired_series.len(),
        recovered = report.recovered_samples,
        "recovery complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::BlockStore;
    use crate::catalog::MemCatalog;
    use crate::types::Sample;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn wal_config(dir: &TempDir) -> WalConfig {
        WalConfig {
            dir: dir.path().to_path_buf(),
            nconcurrency: 2,
            frame_size: 512,
            sync: crate::wal::SyncPolicy::Never,
            ..Default::default()
        }
    }

    #[test]
    fn test_recovery_without_log_or_repairs_is_noop() {
        let catalog = MemCatalog::new();
        let cstore = ColumnStore::new(Arc::new(BlockStore::new_memory()));
        let report = run_recovery(&catalog, &cstore, None, &WalConfig::default()).unwrap();
        assert!(report.repaired_series.is_empty());
        assert_eq!(report.recovered_samples, 0);
    }

    #[test]
    fn test_replay_restores_unregistered_series() {
        let dir = TempDir::new().unwrap();
        let config = wal_config(&dir);
        {
            let log = InputLog::open(config.clone()).unwrap();
            for i in 0..20u64 {
                log.append(0, &Sample::float(11, 1 + i, i as f64)).unwrap();
            }
            log.flush().unwrap();
        }

        let catalog = MemCatalog::new();
        let cstore = ColumnStore::new(Arc::new(BlockStore::new_memory()));
        let log = InputLog::open(config.clone()).unwrap();
        let report = run_recovery(&catalog, &cstore, Some(&log), &config).unwrap();
        assert_eq!(report.recovered_samples, 20);

        // Replayed data is sealed and its rescue points persisted.
        let points = catalog.rescue_points();
        assert!(points.contains_key(&11));
        assert!(!points[&11].is_empty());

        // The log is gone; a second recovery replays nothing.
        let report = run_recovery(
            &catalog,
            &ColumnStore::new(cstore.block_store()),
            Some(&InputLog::open(config.clone()).unwrap()),
            &config,
        )
        .unwrap();
        assert_eq!(report.recovered_samples, 0);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let config = wal_config(&dir);
        {
            let log = InputLog::open(config.clone()).unwrap();
            for i in 0..50u64 {
                log.append(0, &Sample::float(5, 100 + i, i as f64)).unwrap();
            }
            log.flush().unwrap();
        }

        let cstore = ColumnStore::new(Arc::new(BlockStore::new_memory()));
        cstore.create_new_column(5).unwrap();

        // Apply the same frames twice by hand; duplicates must coalesce.
        let reader = WalReader::new(config.clone());
        for _ in 0..2 {
            for samples in reader.replay_all().unwrap() {
                for sample in samples {
                    cstore.recovery_write(&sample, true).unwrap();
                }
            }
        }

        let aggs = cstore.aggregate(&[5], 0, u64::MAX).unwrap();
        let (_, agg) = aggs.into_iter().next().unwrap().next().unwrap().unwrap();
        assert_eq!(agg.count, 50);
    }
}
