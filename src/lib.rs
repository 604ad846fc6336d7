// CohortDB - partitioned in-memory behavioral event store
// Core library module

pub mod attributes;
pub mod bitmap;
pub mod cells;
pub mod cluster;
pub mod common;
pub mod error;
pub mod grid;
pub mod mem;
pub mod partition;
pub mod query;
pub mod result;
pub mod scheduler;
pub mod segments;
pub mod server;
pub mod sidelog;
pub mod table;

pub use error::{Error, ErrorClass, ErrorCode, Result};

use cluster::Mapper;
use scheduler::AsyncPool;
use sidelog::SideLog;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use table::Database;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine configuration. The timing fields are the cadences the original
/// design hard-coded; they are tunables here with the same defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub external_host: Option<String>,
    pub external_port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    /// per-cell time slice
    pub slice_ms: i64,
    /// background slice divisor while realtime cells are active
    pub bypass_divisor: i64,
    /// worker sleep when no timer is pending
    pub idle_wait_ms: i64,
    /// completed-cell sweep cadence, in loop passes
    pub cleanup_every: u64,
    /// quiescent grace before freed partitions are dropped
    pub zombie_grace_ms: i64,
    pub insert_batch_hot: usize,
    pub insert_batch_bypass: usize,
    /// insert replies stall until backlog drains below this
    pub insert_backlog_limit: usize,
    pub exec_limit: u64,
    /// desired clone count in a full-size cluster
    pub replica_target: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            external_host: None,
            external_port: None,
            data_dir: None,
            slice_ms: 50,
            bypass_divisor: 3,
            idle_wait_ms: 250,
            cleanup_every: 10,
            zombie_grace_ms: 15_000,
            insert_batch_hot: 25,
            insert_batch_bypass: 5,
            insert_backlog_limit: 5_000,
            exec_limit: 1_000_000,
            replica_target: 2,
        }
    }
}

/// The process-wide services struct: every component the cells, the HTTP
/// layer and the sentinel share. Constructed once at start and passed by
/// Arc; there are no ambient globals.
pub struct Services {
    pub config: Config,
    pub db: Database,
    pub log: SideLog,
    pub pool: AsyncPool,
    pub mapper: Mapper,
    running: AtomicBool,
}

impl Services {
    pub fn new(config: Config) -> Arc<Self> {
        let workers = num_cpus::get().max(1);
        Self::with_workers(config, workers)
    }

    pub fn with_workers(config: Config, workers: usize) -> Arc<Self> {
        let db = Database::new(config.data_dir.clone());
        let log = SideLog::new(config.data_dir.clone());
        let pool = AsyncPool::new(workers, &config);
        let mapper = Mapper::new();
        // identity is the advertised address, not the bind address
        let advertised_host = config
            .external_host
            .clone()
            .unwrap_or_else(|| config.host.clone());
        let advertised_port = config.external_port.unwrap_or(config.port);
        mapper.set_identity(&advertised_host, advertised_port);

        Arc::new(Self {
            config,
            db,
            log,
            pool,
            mapper,
            running: AtomicBool::new(true),
        })
    }

    /// Start the worker pool, the sentinel and the subscriber dispatcher.
    pub fn start(self: &Arc<Self>) {
        AsyncPool::start_async(self);
        cluster::sentinel::start(self.clone());
        segments::start_dispatcher(self.clone());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(self: &Arc<Self>) {
        self.persist_partitions();
        self.running.store(false, Ordering::SeqCst);
        self.pool.shutdown();
    }

    /// Write every partition's attribute and grid blobs under the data
    /// dir; the mirror of the load that happens when partition objects
    /// are created.
    pub fn persist_partitions(self: &Arc<Self>) {
        let Some(dir) = &self.config.data_dir else {
            return;
        };
        for table in self.db.tables() {
            for partition in table.partition_ids() {
                let Some(parts) = table.get_partition_objects(self, partition, false) else {
                    continue;
                };
                let transfer = parts.lock().to_transfer(Vec::new());
                let Ok(bytes) =
                    bincode::serde::encode_to_vec(&transfer, bincode::config::standard())
                else {
                    continue;
                };
                let path = dir.join(table.name()).join("partitions");
                let _ = std::fs::create_dir_all(&path);
                let _ = std::fs::write(path.join(format!("{partition}.blob")), bytes);
            }
        }
    }

    /// Single-node bootstrap: take ownership of every partition.
    pub fn init_cluster(self: &Arc<Self>, partitions: usize) -> Result<()> {
        if !(1..=1000).contains(&partitions) {
            return Err(Error::config("partitions must be between 1 and 1000"));
        }
        let node_id = self.mapper.node_id();
        let advertised = self.mapper.node_name();
        let (host, port) = advertised
            .rsplit_once(':')
            .and_then(|(host, port)| Some((host.to_string(), port.parse().ok()?)))
            .unwrap_or_else(|| (self.config.host.clone(), self.config.port));
        self.mapper.add_route(cluster::RouteInfo {
            node_id,
            name: advertised,
            host,
            port,
            failed: false,
            failed_since: 0,
        });
        for partition in 0..partitions {
            self.mapper.partition_map.set_owner(partition, node_id);
        }
        let snapshot = self.mapper.make_snapshot(partitions);
        cluster::apply_map_snapshot(self, &snapshot);
        Ok(())
    }
}
