//! Database facade
//!
//! Wires the catalog, block store, column store, and input log together:
//! creates or opens the on-disk layout, runs recovery before accepting
//! writes, hands out write sessions, and exposes the read surface of the
//! column store.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info};

use crate::catalog::{Catalog, FileCatalog, MemCatalog};
use crate::blockstore::BlockStore;
use crate::error::{EmberError, Result};
use crate::operators::{AggregateIter, EventIter, SampleIter};
use crate::recovery::{run_recovery, RecoveryReport};
use crate::store::{ColumnStore, Session};
use crate::tree::AppendOutcome;
use crate::types::{AggregateFilter, Sample, SeriesId, Timestamp, ValueFilter};
use crate::wal::{InputLog, WalConfig};
use std::collections::HashMap;

const MANIFEST_FILE: &str = "manifest.json";
const VOLUMES_DIR: &str = "volumes";

/// Block store flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStoreKind {
    /// Ring of `num_volumes` volumes with `volume_capacity` blocks each;
    /// recycles the eldest blocks when full
    FixedRing {
        num_volumes: u32,
        volume_capacity: u32,
    },
    /// Single volume growing without bound
    Expandable,
    /// In-memory blocks, for tests
    Memory,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database name recorded in the manifest
    pub name: String,
    /// Root directory for manifest, volumes, and log
    pub data_dir: PathBuf,
    /// Block store flavor
    pub blockstore: BlockStoreKind,
    /// Input log settings; `wal.dir` is derived from `data_dir` when empty
    pub wal: WalConfig,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            name: "db".into(),
            data_dir: PathBuf::from("data"),
            blockstore: BlockStoreKind::Expandable,
            wal: WalConfig::default(),
        }
    }
}

impl DbConfig {
    fn wal_config(&self) -> WalConfig {
        let mut wal = self.wal.clone();
        wal.dir = self.data_dir.join("wal");
        wal
    }
}

/// A single EmberDB database
pub struct Database {
    catalog: Arc<dyn Catalog>,
    cstore: Arc<ColumnStore>,
    input_log: Option<Arc<InputLog>>,
    wal_config: WalConfig,
    next_stream: AtomicUsize,
    read_only: bool,
}

impl Database {
    /// Create a new database at `config.data_dir`
    pub fn create(config: DbConfig) -> Result<Self> {
        if config.blockstore != BlockStoreKind::Memory {
            std::fs::create_dir_all(&config.data_dir)?;
        }
        let store = match config.blockstore {
            BlockStoreKind::FixedRing {
                num_volumes,
                volume_capacity,
            } => BlockStore::create_fixed(
                config.data_dir.join(VOLUMES_DIR),
                num_volumes,
                volume_capacity,
            )?,
            BlockStoreKind::Expandable => {
                BlockStore::create_expandable(config.data_dir.join(VOLUMES_DIR))?
            }
            BlockStoreKind::Memory => BlockStore::new_memory(),
        };
        let store = Arc::new(store);

        let catalog: Arc<dyn Catalog> = if config.blockstore == BlockStoreKind::Memory {
            Arc::new(MemCatalog::new())
        } else {
            Arc::new(FileCatalog::create(config.data_dir.join(MANIFEST_FILE))?)
        };
        catalog.set_config("db_name", &config.name);
        catalog.set_config("storage_version", "1");
        let created = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        catalog.set_config("creation_datetime", &created.to_string());
        catalog.set_config(
            "blockstore_type",
            match config.blockstore {
                BlockStoreKind::FixedRing { .. } => "fixed",
                BlockStoreKind::Expandable => "expandable",
                BlockStoreKind::Memory => "memory",
            },
        );
        catalog.set_volumes(store.descriptors());
        catalog.sync()?;

        let wal_config = config.wal_config();
        let input_log = if wal_config.enabled {
            Some(Arc::new(InputLog::open(wal_config.clone())?))
        } else {
            None
        };

        info!(name = %config.name, dir = %config.data_dir.display(), "created database");
        Ok(Self {
            catalog,
            cstore: ColumnStore::new(store),
            input_log,
            wal_config,
            next_stream: AtomicUsize::new(0),
            read_only: false,
        })
    }

    /// Open an existing database and run recovery
    pub fn open(config: DbConfig) -> Result<Self> {
        let catalog: Arc<dyn Catalog> =
            Arc::new(FileCatalog::open(config.data_dir.join(MANIFEST_FILE))?);
        let kind = catalog
            .get_config("blockstore_type")
            .ok_or_else(|| EmberError::BadData("manifest missing blockstore_type".into()))?;
        let volumes = catalog.volumes();
        let store = match kind.as_str() {
            "fixed" => BlockStore::open_fixed(&volumes)?,
            "expandable" => {
                let desc = volumes
                    .first()
                    .ok_or_else(|| EmberError::BadData("manifest has no volumes".into()))?;
                BlockStore::open_expandable(desc)?
            }
            other => {
                return Err(EmberError::BadData(format!(
                    "unknown blockstore type {:?}",
                    other
                )))
            }
        };
        let cstore = ColumnStore::new(Arc::new(store));

        let wal_config = config.wal_config();
        let input_log = if wal_config.enabled {
            Some(Arc::new(InputLog::open(wal_config.clone())?))
        } else {
            None
        };

        let mut db = Self {
            catalog,
            cstore,
            input_log,
            wal_config,
            next_stream: AtomicUsize::new(0),
            read_only: false,
        };
        match db.run_recovery() {
            Ok(report) => {
                if !report.repaired_series.is_empty() || report.recovered_samples > 0 {
                    info!(
                        repaired = report.repaired_series.len(),
                        recovered = report.recovered_samples,
                        "database recovered"
                    );
                }
            }
            Err(e) => {
                // Never drop log data silently: refuse writes, keep reads.
                error!(%e, "recovery failed, database opens read-only");
                db.read_only = true;
            }
        }
        Ok(db)
    }

    fn run_recovery(&self) -> Result<RecoveryReport> {
        run_recovery(
            self.catalog.as_ref(),
            &self.cstore,
            self.input_log.as_deref(),
            &self.wal_config,
        )
    }

    /// Whether recovery failed and writes are refused
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// The column store, for direct query plumbing
    pub fn column_store(&self) -> Arc<ColumnStore> {
        Arc::clone(&self.cstore)
    }

    /// Register a series id assigned by the external name index
    pub fn register_series(&self, id: SeriesId) -> Result<()> {
        if self.read_only {
            return Err(EmberError::BadArg("database is read-only".into()));
        }
        self.cstore.create_new_column(id)?;
        self.catalog.set_rescue_points(id, Vec::new());
        Ok(())
    }

    /// Create a write session bound to one WAL stream
    pub fn create_session(&self) -> Result<Session> {
        if self.read_only {
            return Err(EmberError::BadArg("database is read-only".into()));
        }
        let nstreams = self
            .input_log
            .as_ref()
            .map(|log| log.nstreams())
            .unwrap_or(1);
        let stream = self.next_stream.fetch_add(1, Ordering::Relaxed) % nstreams;
        Ok(Session::new(
            Arc::clone(&self.cstore),
            self.input_log.clone(),
            stream,
        ))
    }

    /// Write through a session, persisting advanced rescue points into the
    /// catalog when a flush happened
    pub fn write(&self, session: &mut Session, sample: &Sample) -> Result<AppendOutcome> {
        let mut rescue_points = Vec::new();
        let outcome = session.write(sample, &mut rescue_points)?;
        for (id, addrs) in session.take_rescue_updates() {
            self.catalog.set_rescue_points(id, addrs);
        }
        if outcome == AppendOutcome::OkFlushNeeded {
            self.catalog
                .set_rescue_points(sample.series, rescue_points);
        }
        Ok(outcome)
    }

    /// Range scan per id
    pub fn scan(
        &self,
        ids: &[SeriesId],
        begin: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<SampleIter>> {
        self.cstore.scan(ids, begin, end)
    }

    /// Filtered range scan per id
    pub fn filter(
        &self,
        ids: &[SeriesId],
        begin: Timestamp,
        end: Timestamp,
        filters: &HashMap<SeriesId, ValueFilter>,
    ) -> Result<Vec<SampleIter>> {
        self.cstore.filter(ids, begin, end, filters)
    }

    /// Total aggregate per id
    pub fn aggregate(
        &self,
        ids: &[SeriesId],
        begin: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<AggregateIter>> {
        self.cstore.aggregate(ids, begin, end)
    }

    /// Step-bucketed aggregates per id
    pub fn group_aggregate(
        &self,
        ids: &[SeriesId],
        begin: Timestamp,
        end: Timestamp,
        step: u64,
    ) -> Result<Vec<AggregateIter>> {
        self.cstore.group_aggregate(ids, begin, end, step)
    }

    /// Step-bucketed aggregates with per-id statistic filters
    pub fn group_aggfilter(
        &self,
        ids: &[SeriesId],
        begin: Timestamp,
        end: Timestamp,
        step: u64,
        filters: &HashMap<SeriesId, AggregateFilter>,
    ) -> Result<Vec<AggregateIter>> {
        self.cstore.group_aggfilter(ids, begin, end, step, filters)
    }

    /// Event scan per id
    pub fn scan_events(
        &self,
        ids: &[SeriesId],
        begin: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<EventIter>> {
        self.cstore.scan_events(ids, begin, end)
    }

    /// Event scan keeping only bodies containing `pattern`
    pub fn filter_events(
        &self,
        ids: &[SeriesId],
        begin: Timestamp,
        end: Timestamp,
        pattern: &[u8],
    ) -> Result<Vec<EventIter>> {
        self.cstore.filter_events(ids, begin, end, pattern)
    }

    /// Flush blocks and the catalog manifest; trees stay open
    pub fn flush(&self) -> Result<()> {
        self.cstore.block_store().flush()?;
        self.catalog.set_volumes(self.cstore.block_store().descriptors());
        self.catalog.sync()?;
        if let Some(log) = &self.input_log {
            log.flush()?;
        }
        Ok(())
    }

    /// Seal every tree, persist the manifest, and retire the input log
    pub fn close(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let rescue_points = self.cstore.close()?;
        for (id, addrs) in rescue_points {
            self.catalog.set_rescue_points(id, addrs);
        }
        self.cstore.block_store().flush()?;
        self.catalog.set_volumes(self.cstore.block_store().descriptors());
        self.catalog.sync()?;
        if let Some(log) = &self.input_log {
            // Everything the log guards is sealed now.
            log.truncate()?;
        }
        info!("database closed");
        Ok(())
    }
}
