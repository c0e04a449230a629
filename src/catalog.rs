//! Metadata catalog interface
//!
//! The catalog keeps the bootstrap state the engine cannot reconstruct from
//! its own blocks: config keys, volume descriptors, and per-series rescue
//! points. It sits off the hot path and is consulted only at open, close,
//! and flush. The engine ships a JSON-manifest implementation plus an
//! in-memory one for tests; production deployments may substitute their own.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::blockstore::VolumeDescriptor;
use crate::error::{EmberError, Result};
use crate::types::{LogicAddr, SeriesId};

/// Catalog operations consumed by the engine
pub trait Catalog: Send + Sync {
    /// Read a config value
    fn get_config(&self, key: &str) -> Option<String>;
    /// Write a config value
    fn set_config(&self, key: &str, value: &str);
    /// All volume descriptors
    fn volumes(&self) -> Vec<VolumeDescriptor>;
    /// Replace the volume descriptors
    fn set_volumes(&self, volumes: Vec<VolumeDescriptor>);
    /// All persisted rescue points
    fn rescue_points(&self) -> HashMap<SeriesId, Vec<LogicAddr>>;
    /// Replace one series' rescue points
    fn set_rescue_points(&self, id: SeriesId, addrs: Vec<LogicAddr>);
    /// Persist pending changes
    fn sync(&self) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    config: BTreeMap<String, String>,
    volumes: Vec<VolumeDescriptor>,
    rescue_points: Vec<RescueEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RescueEntry {
    id: SeriesId,
    addrs: Vec<LogicAddr>,
}

struct CatalogState {
    config: BTreeMap<String, String>,
    volumes: Vec<VolumeDescriptor>,
    rescue_points: HashMap<SeriesId, Vec<LogicAddr>>,
}

impl CatalogState {
    fn from_manifest(manifest: Manifest) -> Self {
        Self {
            config: manifest.config,
            volumes: manifest.volumes,
            rescue_points: manifest
                .rescue_points
                .into_iter()
                .map(|e| (e.id, e.addrs))
                .collect(),
        }
    }

    fn to_manifest(&self) -> Manifest {
        let mut rescue_points: Vec<RescueEntry> = self
            .rescue_points
            .iter()
            .map(|(id, addrs)| RescueEntry {
                id: *id,
                addrs: addrs.clone(),
            })
            .collect();
        rescue_points.sort_by_key(|e| e.id);
        Manifest {
            config: self.config.clone(),
            volumes: self.volumes.clone(),
            rescue_points,
        }
    }
}

/// Catalog persisted as a JSON manifest file, rewritten atomically
pub struct FileCatalog {
    path: PathBuf,
    state: Mutex<CatalogState>,
}

impl FileCatalog {
    /// Create a fresh manifest at `path`
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let catalog = Self {
            path: path.as_ref().to_path_buf(),
            state: Mutex::new(CatalogState::from_manifest(Manifest::default())),
        };
        catalog.sync()?;
        Ok(catalog)
    }

    /// Open an existing manifest
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read(path.as_ref())?;
        let manifest: Manifest = serde_json::from_slice(&data)
            .map_err(|e| EmberError::BadData(format!("manifest: {}", e)))?;
        info!(path = %path.as_ref().display(), "opened catalog manifest");
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            state: Mutex::new(CatalogState::from_manifest(manifest)),
        })
    }
}

impl Catalog for FileCatalog {
    fn get_config(&self, key: &str) -> Option<String> {
        self.state.lock().config.get(key).cloned()
    }

    fn set_config(&self, key: &str, value: &str) {
        self.state.lock().config.insert(key.into(), value.into());
    }

    fn volumes(&self) -> Vec<VolumeDescriptor> {
        self.state.lock().volumes.clone()
    }

    fn set_volumes(&self, volumes: Vec<VolumeDescriptor>) {
        self.state.lock().volumes = volumes;
    }

    fn rescue_points(&self) -> HashMap<SeriesId, Vec<LogicAddr>> {
        self.state.lock().rescue_points.clone()
    }

    fn set_rescue_points(&self, id: SeriesId, addrs: Vec<LogicAddr>) {
        self.state.lock().rescue_points.insert(id, addrs);
    }

    fn sync(&self) -> Result<()> {
        let manifest = self.state.lock().to_manifest();
        let data = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| EmberError::BadData(format!("manifest: {}", e)))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Volatile catalog for tests
#[derive(Default)]
pub struct MemCatalog {
    state: Mutex<CatalogState>,
}

impl Default for CatalogState {
    fn default() -> Self {
        CatalogState::from_manifest(Manifest::default())
    }
}

impl MemCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }
}

impl Catalog for MemCatalog {
    fn get_config(&self, key: &str) -> Option<String> {
        self.state.lock().config.get(key).cloned()
    }

    fn set_config(&self, key: &str, value: &str) {
        self.state.lock().config.insert(key.into(), value.into());
    }

    fn volumes(&self) -> Vec<VolumeDescriptor> {
        self.state.lock().volumes.clone()
    }

    fn set_volumes(&self, volumes: Vec<VolumeDescriptor>) {
        self.state.lock().volumes = volumes;
    }

    fn rescue_points(&self) -> HashMap<SeriesId, Vec<LogicAddr>> {
        self.state.lock().rescue_points.clone()
    }

    fn set_rescue_points(&self, id: SeriesId, addrs: Vec<LogicAddr>) {
        self.state.lock().rescue_points.insert(id, addrs);
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_manifest_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.json");

        {
            let catalog = FileCatalog::create(&path).unwrap();
            catalog.set_config("db_name", "test");
            catalog.set_rescue_points(42, vec![0, 17]);
            catalog.set_rescue_points(7, vec![3]);
            catalog.sync().unwrap();
        }

        let catalog = FileCatalog::open(&path).unwrap();
        assert_eq!(catalog.get_config("db_name").as_deref(), Some("test"));
        let points = catalog.rescue_points();
        assert_eq!(points[&42], vec![0, 17]);
        assert_eq!(points[&7], vec![3]);
        assert!(catalog.get_config("missing").is_none());
    }

    #[test]
    fn test_rescue_points_replaced_not_merged() {
        let catalog = MemCatalog::new();
        catalog.set_rescue_points(1, vec![10, 20]);
        catalog.set_rescue_points(1, vec![30]);
        assert_eq!(catalog.rescue_points()[&1], vec![30]);
    }
}
