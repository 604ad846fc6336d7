// Tables and the database registry.
//
// A Table owns the schema, settings, the segment registry (the master
// copy partitions sync from), the subscriber registry and the outbound
// change-message queue. Partition-local state lives in TablePartitioned
// objects created on demand per mapped partition.

pub mod properties;

use crate::common::now_ms;
use crate::error::{Error, ErrorCode, Result};
use crate::grid::CullPolicy;
use crate::partition::TablePartitioned;
use crate::query::{self, Macro, SegmentFlags};
use crate::Services;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use properties::Properties;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSettings {
    pub session_time_ms: i64,
    /// event-type names ranked for stamp tie-breaks on insert
    #[serde(default)]
    pub event_order: Vec<String>,
    pub max_rows: usize,
    #[serde(default)]
    pub max_age_ms: Option<i64>,
    pub segment_interval_ms: i64,
    pub maint_interval_ms: i64,
}

impl Default for TableSettings {
    fn default() -> Self {
        Self {
            session_time_ms: crate::grid::DEFAULT_SESSION_TIME_MS,
            event_order: Vec::new(),
            max_rows: 10_000,
            max_age_ms: None,
            segment_interval_ms: 60_000,
            maint_interval_ms: 5 * 60_000,
        }
    }
}

impl TableSettings {
    pub fn cull_policy(&self) -> CullPolicy {
        CullPolicy {
            max_rows: self.max_rows,
            max_age_ms: self.max_age_ms,
        }
    }
}

/// Master copy of one segment definition; partitions sync against
/// `last_modified`.
#[derive(Clone)]
pub struct SegmentDef {
    pub name: String,
    pub script: String,
    pub macros: Arc<Macro>,
    pub flags: SegmentFlags,
    pub last_modified: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentChange {
    Entered,
    Exited,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeMessage {
    pub segment_hash: i64,
    pub segment: String,
    pub state: SegmentChange,
    pub customer_id: String,
    pub stamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub segment: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    /// how long an undeliverable message is retried before being dropped
    pub retention_ms: i64,
}

#[derive(Serialize, Deserialize)]
struct TableConfig {
    properties: Properties,
    settings: TableSettings,
    segments: Vec<(String, String, SegmentFlagsConfig)>,
    subscribers: Vec<Subscriber>,
}

#[derive(Serialize, Deserialize)]
struct SegmentFlagsConfig {
    ttl_ms: i64,
    refresh_ms: i64,
    on_insert: bool,
    z_index: i64,
    use_cached: bool,
}

pub struct Table {
    name: String,
    pub properties: RwLock<Properties>,
    pub settings: RwLock<TableSettings>,
    pub segments: RwLock<HashMap<String, SegmentDef>>,
    pub subscribers: RwLock<Vec<Subscriber>>,
    messages: Mutex<Vec<ChangeMessage>>,
    partitions: Mutex<HashMap<usize, Arc<Mutex<TablePartitioned>>>>,
}

impl Table {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            properties: RwLock::new(Properties::new()),
            settings: RwLock::new(TableSettings::default()),
            segments: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            partitions: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Partition-local objects, created on demand when this node carries
    /// the partition. Creation spawns the partition's standing cells.
    pub fn get_partition_objects(
        &self,
        services: &Arc<Services>,
        partition: usize,
        create: bool,
    ) -> Option<Arc<Mutex<TablePartitioned>>> {
        {
            let mut partitions = self.partitions.lock();
            if let Some(existing) = partitions.get(&partition) {
                return Some(existing.clone());
            }
            if !create {
                return None;
            }
            let mut created = TablePartitioned::new(self, partition);
            // rehydrate the at-rest blobs from a previous run
            if let Some(dir) = &services.config.data_dir {
                let path = dir
                    .join(&self.name)
                    .join("partitions")
                    .join(format!("{partition}.blob"));
                if let Ok(bytes) = std::fs::read(&path) {
                    match bincode::serde::decode_from_slice(&bytes, bincode::config::standard()) {
                        Ok((transfer, _)) => created.from_transfer(transfer),
                        Err(e) => {
                            tracing::error!(table = %self.name, partition, error = %e,
                                "partition blob corrupt; starting empty");
                        }
                    }
                }
            }
            partitions.insert(partition, Arc::new(Mutex::new(created)));
        }
        let parts = self.partitions.lock().get(&partition).cloned()?;

        // stop side-log purging until the insert cell attaches
        services.log.reset_read_head(&self.name, partition);
        crate::cells::spawn_standing_cells(services, &self.name, partition);
        info!(table = %self.name, partition, "partition objects created");
        Some(parts)
    }

    pub fn release_partition(&self, partition: usize) {
        self.partitions.lock().remove(&partition);
    }

    pub fn partition_ids(&self) -> Vec<usize> {
        self.partitions.lock().keys().copied().collect()
    }

    /// Install or replace a segment definition; bumps `last_modified` so
    /// partitions pick up the change on their next sync.
    pub fn set_segment(&self, name: &str, script: &str, macros: Arc<Macro>, flags: SegmentFlags) {
        let mut segments = self.segments.write();
        segments.insert(
            name.to_string(),
            SegmentDef {
                name: name.to_string(),
                script: script.to_string(),
                macros,
                flags,
                last_modified: now_ms(),
            },
        );
    }

    pub fn drop_segment(&self, name: &str) {
        self.segments.write().remove(name);
    }

    pub fn push_messages(&self, mut batch: Vec<ChangeMessage>) {
        if batch.is_empty() {
            return;
        }
        self.messages.lock().append(&mut batch);
    }

    pub fn drain_messages(&self) -> Vec<ChangeMessage> {
        std::mem::take(&mut *self.messages.lock())
    }

    pub fn describe(&self) -> serde_json::Value {
        let properties = self.properties.read();
        let settings = self.settings.read();
        let segments = self.segments.read();
        serde_json::json!({
            "table": self.name,
            "properties": properties.iter().map(|p| serde_json::json!({
                "name": p.name,
                "type": p.ptype,
                "is_set": p.is_set,
                "is_customer": p.is_customer,
            })).collect::<Vec<_>>(),
            "settings": *settings,
            "segments": segments.keys().collect::<Vec<_>>(),
        })
    }

    fn to_config(&self) -> TableConfig {
        TableConfig {
            properties: self.properties.read().clone(),
            settings: self.settings.read().clone(),
            segments: self
                .segments
                .read()
                .values()
                .map(|def| {
                    (
                        def.name.clone(),
                        def.script.clone(),
                        SegmentFlagsConfig {
                            ttl_ms: def.flags.ttl_ms,
                            refresh_ms: def.flags.refresh_ms,
                            on_insert: def.flags.on_insert,
                            z_index: def.flags.z_index,
                            use_cached: def.flags.use_cached,
                        },
                    )
                })
                .collect(),
            subscribers: self.subscribers.read().clone(),
        }
    }

    fn apply_config(&self, config: TableConfig) -> Result<()> {
        let mut properties = config.properties;
        properties.reindex();
        for (name, script, flags) in config.segments {
            let macros = query::compile(&script, &properties)?;
            self.set_segment(
                &name,
                &script,
                macros,
                SegmentFlags {
                    ttl_ms: flags.ttl_ms,
                    refresh_ms: flags.refresh_ms,
                    on_insert: flags.on_insert,
                    z_index: flags.z_index,
                    use_cached: flags.use_cached,
                },
            );
        }
        *self.properties.write() = properties;
        *self.settings.write() = config.settings;
        *self.subscribers.write() = config.subscribers;
        Ok(())
    }
}

pub struct Database {
    tables: DashMap<String, Arc<Table>>,
    data_root: Option<PathBuf>,
}

impl Database {
    pub fn new(data_root: Option<PathBuf>) -> Self {
        Self {
            tables: DashMap::new(),
            data_root,
        }
    }

    fn validate_table_name(name: &str) -> Result<()> {
        let legal = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if legal {
            Ok(())
        } else {
            Err(Error::new(
                crate::error::ErrorClass::Config,
                ErrorCode::GeneralConfigError,
                format!("missing or invalid table name '{name}'"),
            ))
        }
    }

    pub fn create_table(&self, name: &str) -> Result<Arc<Table>> {
        Self::validate_table_name(name)?;
        if self.tables.contains_key(name) {
            return Err(Error::config(format!("table '{name}' already exists")));
        }
        let table = Arc::new(Table::new(name));
        self.tables.insert(name.to_string(), table.clone());
        info!(table = %name, "table created");
        Ok(table)
    }

    pub fn get_table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.get(name).map(|t| t.clone())
    }

    pub fn require_table(&self, name: &str) -> Result<Arc<Table>> {
        self.get_table(name)
            .ok_or_else(|| Error::config(format!("no table '{name}'")))
    }

    pub fn drop_table(&self, name: &str) -> Result<()> {
        self.tables
            .remove(name)
            .map(|_| info!(table = %name, "table dropped"))
            .ok_or_else(|| Error::config(format!("no table '{name}'")))
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.key().clone()).collect()
    }

    pub fn tables(&self) -> Vec<Arc<Table>> {
        self.tables.iter().map(|t| t.value().clone()).collect()
    }

    /// Persist one table's config JSON under the data dir.
    pub fn save_table_config(&self, table: &Table) -> Result<()> {
        let Some(root) = &self.data_root else {
            return Ok(());
        };
        let dir = root.join(table.name());
        std::fs::create_dir_all(&dir)?;
        let config = serde_json::to_vec_pretty(&table.to_config())?;
        std::fs::write(dir.join("table.json"), config)?;
        Ok(())
    }

    /// Load every table config found under the data dir.
    pub fn load_tables(&self) -> Result<()> {
        let Some(root) = &self.data_root else {
            return Ok(());
        };
        let Ok(entries) = std::fs::read_dir(root) else {
            return Ok(());
        };
        for entry in entries.flatten() {
            let config_path = entry.path().join("table.json");
            if !config_path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let bytes = std::fs::read(&config_path)?;
            let config: TableConfig = serde_json::from_slice(&bytes)?;
            let table = self.create_table(&name)?;
            table.apply_config(config)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use properties::PropType;

    #[test]
    fn test_create_and_drop() {
        let db = Database::new(None);
        db.create_table("events").unwrap();
        assert!(db.create_table("events").is_err());
        assert!(db.create_table("Bad-Name").is_err());
        db.drop_table("events").unwrap();
        assert!(db.get_table("events").is_none());
    }

    #[test]
    fn test_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(Some(dir.path().to_path_buf()));
        let table = db.create_table("t").unwrap();
        table
            .properties
            .write()
            .add("plan", PropType::Text, false, true)
            .unwrap();
        let macros = query::compile("where plan == 'a'", &table.properties.read()).unwrap();
        table.set_segment(
            "plan_a",
            "where plan == 'a'",
            macros,
            SegmentFlags::default(),
        );
        db.save_table_config(&table).unwrap();

        let db2 = Database::new(Some(dir.path().to_path_buf()));
        db2.load_tables().unwrap();
        let loaded = db2.get_table("t").unwrap();
        assert!(loaded.properties.read().get("plan").is_some());
        assert!(loaded.segments.read().contains_key("plan_a"));
    }

    #[test]
    fn test_segment_modification_bumps_stamp() {
        let table = Table::new("t");
        let schema = Properties::new();
        let macros = query::compile("each_row { tally() }", &schema).unwrap();
        table.set_segment("s", "x", macros.clone(), SegmentFlags::default());
        let first = table.segments.read().get("s").unwrap().last_modified;
        std::thread::sleep(std::time::Duration::from_millis(5));
        table.set_segment("s", "y", macros, SegmentFlags::default());
        let second = table.segments.read().get("s").unwrap().last_modified;
        assert!(second >= first);
    }
}
