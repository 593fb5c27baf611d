//! Database registry and data source builder
//!
//! A `Database` roots a set of tables under one storage directory and keeps
//! a small serialized registry (`metadata.mdb`) of table ids, labels and
//! config blobs. `DataSourceBuilder` is the front door for creating,
//! copying, snapshotting and restoring data sources.
//!
//! ```text
//! <storage_dir>/
//! ├── metadata.mdb          table registry (bincode)
//! └── tables/
//!     ├── accounts/         one table directory per data source
//!     └── tokens/
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::Config;
use crate::datasource::DataSource;
use crate::error::{Result, VirtaError};
use crate::table::TableConfig;

/// Registry file name under the storage directory
const REGISTRY_FILE: &str = "metadata.mdb";

const TABLES_DIR: &str = "tables";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableRecord {
    id: u32,
    /// Logical table name used by callers
    name: String,
    /// Directory name under `tables/`; differs from `name` for copies that
    /// were made active in place of the original
    dir_name: String,
    /// Serialized `TableConfig`
    config: Vec<u8>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Registry {
    next_id: u32,
    tables: Vec<TableRecord>,
}

impl Registry {
    fn find(&self, name: &str) -> Option<&TableRecord> {
        self.tables.iter().find(|t| t.name == name)
    }
}

// =============================================================================
// Database
// =============================================================================

pub struct Database {
    storage_dir: PathBuf,
    config: Config,
    registry: Mutex<Registry>,
}

impl Database {
    /// Open or create a database rooted at `storage_dir`
    pub fn open(storage_dir: impl Into<PathBuf>, config: Config) -> Result<Arc<Self>> {
        let storage_dir = storage_dir.into();
        fs::create_dir_all(storage_dir.join(TABLES_DIR))?;
        let registry_path = storage_dir.join(REGISTRY_FILE);
        let registry = if registry_path.exists() {
            bincode::deserialize(&fs::read(&registry_path)?)
                .map_err(|e| VirtaError::Serialization(e.to_string()))?
        } else {
            Registry::default()
        };
        info!(dir = %storage_dir.display(), tables = registry.tables.len(), "database opened");
        Ok(Arc::new(Self {
            storage_dir,
            config,
            registry: Mutex::new(registry),
        }))
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn table_dir(&self, dir_name: &str) -> PathBuf {
        self.storage_dir.join(TABLES_DIR).join(dir_name)
    }

    fn save_registry(&self, registry: &Registry) -> Result<()> {
        let bytes =
            bincode::serialize(registry).map_err(|e| VirtaError::Serialization(e.to_string()))?;
        crate::table::write_blob(&self.storage_dir.join(REGISTRY_FILE), &bytes)
    }

    /// Create a new table and open its data source. Fails if the name is
    /// already registered.
    pub fn create_data_source(
        &self,
        name: &str,
        table_config: TableConfig,
        enable_compaction: bool,
    ) -> Result<DataSource> {
        let dir = {
            let mut registry = self.registry.lock();
            if registry.find(name).is_some() {
                return Err(VirtaError::InvalidState(format!(
                    "Table {} already exists",
                    name
                )));
            }
            let id = registry.next_id;
            registry.next_id += 1;
            registry.tables.push(TableRecord {
                id,
                name: name.to_string(),
                dir_name: name.to_string(),
                config: table_config.to_bytes(),
            });
            self.save_registry(&registry)?;
            self.table_dir(name)
        };
        DataSource::open(&dir, name, table_config, &self.config, enable_compaction)
    }

    /// Open the data source of an existing table
    pub fn get_data_source(&self, name: &str, enable_compaction: bool) -> Result<DataSource> {
        let (dir, table_config) = {
            let registry = self.registry.lock();
            let record = registry.find(name).ok_or_else(|| {
                VirtaError::InvalidState(format!("Table {} does not exist", name))
            })?;
            (
                self.table_dir(&record.dir_name),
                TableConfig::from_bytes(&record.config)?,
            )
        };
        DataSource::open(&dir, name, table_config, &self.config, enable_compaction)
    }

    /// Drop a table from the registry and delete its directory. The data
    /// source must be closed first.
    pub fn remove_table(&self, name: &str) -> Result<()> {
        let mut registry = self.registry.lock();
        let Some(position) = registry.tables.iter().position(|t| t.name == name) else {
            return Err(VirtaError::InvalidState(format!(
                "Table {} does not exist",
                name
            )));
        };
        let record = registry.tables.remove(position);
        self.save_registry(&registry)?;
        let dir = self.table_dir(&record.dir_name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        info!(table = %name, "table removed");
        Ok(())
    }

    /// Write a self-contained single-table database snapshot of `source`
    /// into `destination`
    pub fn snapshot(&self, destination: &Path, source: &DataSource) -> Result<()> {
        let record = {
            let registry = self.registry.lock();
            registry.find(source.label()).cloned().ok_or_else(|| {
                VirtaError::InvalidState(format!("Table {} does not exist", source.label()))
            })?
        };
        fs::create_dir_all(destination.join(TABLES_DIR))?;
        let snapshot_registry = Registry {
            next_id: record.id + 1,
            tables: vec![TableRecord {
                dir_name: record.name.clone(),
                ..record.clone()
            }],
        };
        let bytes = bincode::serialize(&snapshot_registry)
            .map_err(|e| VirtaError::Serialization(e.to_string()))?;
        crate::table::write_blob(&destination.join(REGISTRY_FILE), &bytes)?;
        source.snapshot(&destination.join(TABLES_DIR).join(&record.name))
    }

    /// Register and open a table copied from a snapshot directory. The
    /// source may be a database snapshot (with its own registry) or a bare
    /// table directory.
    pub fn restore(
        &self,
        name: &str,
        source_dir: &Path,
        enable_compaction: bool,
    ) -> Result<DataSource> {
        let source_registry_path = source_dir.join(REGISTRY_FILE);
        let (table_source_dir, config_bytes) = if source_registry_path.exists() {
            let registry: Registry = bincode::deserialize(&fs::read(&source_registry_path)?)
                .map_err(|e| VirtaError::Serialization(e.to_string()))?;
            let record = registry.tables.first().ok_or_else(|| {
                VirtaError::InvalidState("Snapshot registry holds no tables".to_string())
            })?;
            (
                source_dir.join(TABLES_DIR).join(&record.dir_name),
                record.config.clone(),
            )
        } else {
            let config_bytes =
                fs::read(source_dir.join("table_config")).map_err(VirtaError::Io)?;
            (source_dir.to_path_buf(), config_bytes)
        };
        let table_config = TableConfig::from_bytes(&config_bytes)?;

        let dir = {
            let mut registry = self.registry.lock();
            if registry.find(name).is_some() {
                return Err(VirtaError::InvalidState(format!(
                    "Table {} already exists",
                    name
                )));
            }
            let id = registry.next_id;
            registry.next_id += 1;
            registry.tables.push(TableRecord {
                id,
                name: name.to_string(),
                dir_name: name.to_string(),
                config: config_bytes,
            });
            self.save_registry(&registry)?;
            self.table_dir(name)
        };
        copy_dir_recursive(&table_source_dir, &dir)?;
        info!(table = %name, from = %source_dir.display(), "table restored");
        DataSource::open(&dir, name, table_config, &self.config, enable_compaction)
    }

    /// Duplicate a table's on-disk state into a new registered table. With
    /// `make_active` the copy takes over the source's logical name and the
    /// source keeps running under its old directory.
    pub fn copy_data_source(
        &self,
        source: &DataSource,
        make_active: bool,
        enable_compaction: bool,
    ) -> Result<DataSource> {
        let (copy_name, copy_dir, table_config) = {
            let mut registry = self.registry.lock();
            let record = registry.find(source.label()).cloned().ok_or_else(|| {
                VirtaError::InvalidState(format!("Table {} does not exist", source.label()))
            })?;
            let id = registry.next_id;
            registry.next_id += 1;
            let dir_name = format!("{}-{}", record.name, id);
            let copy_name = if make_active {
                // The copy answers to the original name from now on; the
                // original keeps its directory but loses the name
                let original = registry
                    .tables
                    .iter_mut()
                    .find(|t| t.name == record.name)
                    .ok_or_else(|| {
                        VirtaError::InvalidState(format!("Table {} vanished", record.name))
                    })?;
                original.dir_name = dir_name.clone();
                record.name.clone()
            } else {
                registry.tables.push(TableRecord {
                    id,
                    name: dir_name.clone(),
                    dir_name: dir_name.clone(),
                    config: record.config.clone(),
                });
                dir_name.clone()
            };
            self.save_registry(&registry)?;
            (
                copy_name,
                self.table_dir(&dir_name),
                TableConfig::from_bytes(&record.config)?,
            )
        };
        source.snapshot(&copy_dir)?;
        DataSource::open(
            &copy_dir,
            &copy_name,
            table_config,
            &self.config,
            enable_compaction,
        )
    }
}

fn copy_dir_recursive(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

// =============================================================================
// DataSourceBuilder
// =============================================================================

/// Creates, copies, snapshots and restores data sources against a database
pub struct DataSourceBuilder {
    database: Arc<Database>,
    table_config: Option<TableConfig>,
}

impl DataSourceBuilder {
    pub fn new(database: Arc<Database>) -> Self {
        Self {
            database,
            table_config: None,
        }
    }

    /// Set the table config used by `build`
    pub fn table_config(mut self, config: TableConfig) -> Self {
        self.table_config = Some(config);
        self
    }

    /// Create a fresh table. Fails without a table config.
    pub fn build(&self, label: &str, enable_compaction: bool) -> Result<DataSource> {
        let table_config = self.table_config.clone().ok_or_else(|| {
            VirtaError::InvalidState("No table config supplied to the builder".to_string())
        })?;
        self.database
            .create_data_source(label, table_config, enable_compaction)
    }

    /// Materially duplicate a data source's on-disk state into a new,
    /// independent instance. `offline` copies skip background compaction.
    pub fn copy(
        &self,
        source: &DataSource,
        make_active: bool,
        offline: bool,
    ) -> Result<DataSource> {
        self.database.copy_data_source(source, make_active, !offline)
    }

    /// Snapshot a table into `destination`; delegates to the database so
    /// shared physical storage is copied once
    pub fn snapshot(&self, destination: &Path, source: &DataSource) -> Result<()> {
        self.database.snapshot(destination, source)
    }

    /// Reconstruct a data source from a snapshot directory
    pub fn restore(&self, label: &str, source_dir: &Path) -> Result<DataSource> {
        self.database.restore(label, source_dir, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::DigestType;
    use tempfile::TempDir;

    fn table_config() -> TableConfig {
        TableConfig::new(1, DigestType::Sha384)
            .max_number_of_keys(10_000)
            .unwrap()
    }

    fn open_database(dir: &Path) -> Arc<Database> {
        Database::open(dir, Config::builder().leaf_record_cache_size(64).build()).unwrap()
    }

    #[test]
    fn create_and_reopen_table() {
        let dir = TempDir::new().unwrap();
        {
            let database = open_database(dir.path());
            let source = database
                .create_data_source("accounts", table_config(), false)
                .unwrap();
            source.close(true).unwrap();
        }
        // Registry survives a database reopen
        let database = open_database(dir.path());
        let source = database.get_data_source("accounts", false).unwrap();
        assert_eq!(source.label(), "accounts");
        source.close(true).unwrap();
    }

    #[test]
    fn duplicate_table_name_rejected() {
        let dir = TempDir::new().unwrap();
        let database = open_database(dir.path());
        let source = database
            .create_data_source("accounts", table_config(), false)
            .unwrap();
        assert!(matches!(
            database.create_data_source("accounts", table_config(), false),
            Err(VirtaError::InvalidState(_))
        ));
        source.close(true).unwrap();
    }

    #[test]
    fn missing_table_rejected() {
        let dir = TempDir::new().unwrap();
        let database = open_database(dir.path());
        assert!(database.get_data_source("nope", false).is_err());
        assert!(database.remove_table("nope").is_err());
    }

    #[test]
    fn remove_table_deletes_the_directory() {
        let dir = TempDir::new().unwrap();
        let database = open_database(dir.path());
        let source = database
            .create_data_source("doomed", table_config(), false)
            .unwrap();
        source.close(true).unwrap();
        database.remove_table("doomed").unwrap();
        assert!(!dir.path().join("tables").join("doomed").exists());
        assert!(database.get_data_source("doomed", false).is_err());
    }

    #[test]
    fn builder_requires_a_table_config() {
        let dir = TempDir::new().unwrap();
        let database = open_database(dir.path());
        let builder = DataSourceBuilder::new(database);
        assert!(matches!(
            builder.build("accounts", false),
            Err(VirtaError::InvalidState(_))
        ));
    }

    #[test]
    fn snapshot_and_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let snap_dir = TempDir::new().unwrap();
        let database = open_database(dir.path());
        let builder = DataSourceBuilder::new(database.clone()).table_config(table_config());

        let source = builder.build("accounts", false).unwrap();
        let record = crate::records::LeafRecord::new(
            1,
            bytes::Bytes::from_static(b"alice"),
            5,
            Some(bytes::Bytes::from_static(b"100")),
        );
        source
            .save_records(1, 1, vec![], vec![record.clone()], vec![], false)
            .unwrap();

        let snapshot_path = snap_dir.path().join("snap");
        builder.snapshot(&snapshot_path, &source).unwrap();
        source.close(true).unwrap();

        let restored = builder.restore("accounts-restored", &snapshot_path).unwrap();
        assert_eq!(restored.load_leaf_record(1).unwrap().unwrap(), record);
        restored.close(true).unwrap();
    }

    #[test]
    fn copy_produces_an_independent_table() {
        let dir = TempDir::new().unwrap();
        let database = open_database(dir.path());
        let builder = DataSourceBuilder::new(database.clone()).table_config(table_config());

        let source = builder.build("accounts", false).unwrap();
        let record = crate::records::LeafRecord::new(
            1,
            bytes::Bytes::from_static(b"bob"),
            3,
            Some(bytes::Bytes::from_static(b"7")),
        );
        source
            .save_records(1, 1, vec![], vec![record.clone()], vec![], false)
            .unwrap();

        let copy = builder.copy(&source, false, true).unwrap();
        assert_eq!(copy.load_leaf_record(1).unwrap().unwrap(), record);

        // Writes to the original do not bleed into the copy
        source
            .save_records(-1, -1, vec![], vec![], vec![], false)
            .unwrap();
        assert_eq!(copy.load_leaf_record(1).unwrap().unwrap(), record);

        copy.close(true).unwrap();
        source.close(true).unwrap();
    }
}
