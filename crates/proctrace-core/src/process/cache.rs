use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    sync::mpsc,
    time::{self, Instant},
};

use crate::{
    config::{ConfigError, ModuleConfig},
    event::ExecId,
    metrics::{ErrorKind, Metrics},
};

use super::{
    DuplicateRelease, KeyedStore, ProcessRecord, Removal,
    gc::Collector,
};

/// Name of the configuration section read by [`CacheConfig`].
pub const CACHE_CONFIG: &str = "process-cache";

const DEFAULT_CAPACITY: usize = 65536;
const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("invalid cache capacity {0}")]
    InvalidCapacity(usize),
    #[error("process {0} not found in cache")]
    NotFound(ExecId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Capacity of both the process store and the PID index.
    pub capacity: usize,
    /// Time between two collector sweeps.
    pub gc_interval: Duration,
    pub duplicate_release: DuplicateRelease,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            gc_interval: DEFAULT_GC_INTERVAL,
            duplicate_release: DuplicateRelease::default(),
        }
    }
}

impl TryFrom<&ModuleConfig> for CacheConfig {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        let gc_interval_secs: u64 =
            config.with_default("gc_interval_secs", DEFAULT_GC_INTERVAL.as_secs())?;
        if gc_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "gc_interval_secs".to_string(),
                value: "0".to_string(),
                err: "interval must be positive".to_string(),
            });
        }
        Ok(Self {
            capacity: config.with_default("capacity", DEFAULT_CAPACITY)?,
            gc_interval: Duration::from_secs(gc_interval_secs),
            duplicate_release: config.with_default("duplicate_release", DuplicateRelease::default())?,
        })
    }
}

/// The two keyed stores, shared by the cache handle and the collector.
#[derive(Debug)]
pub(crate) struct Stores {
    pub(crate) processes: KeyedStore<ExecId, Arc<ProcessRecord>>,
    /// PID to the execution id of the latest process seen with it.
    pub(crate) pids: KeyedStore<u32, ExecId>,
    metrics: Arc<Metrics>,
}

impl Stores {
    pub(crate) fn new(capacity: usize, metrics: Arc<Metrics>) -> Result<Self, CacheError> {
        Ok(Self {
            processes: KeyedStore::new(capacity)?,
            pids: KeyedStore::new(capacity)?,
            metrics,
        })
    }

    /// Remove a record and the PID index entry pointing at it. Returns whether
    /// the record was still cached.
    ///
    /// A newer record cached under the same execution id keeps its PID entry.
    pub(crate) fn remove(&self, record: &ProcessRecord) -> bool {
        let present = match self
            .processes
            .remove_if(record.exec_id(), |cached| std::ptr::eq(&**cached, record))
        {
            Removal::Removed(_) => true,
            Removal::Kept => {
                self.metrics.inc(ErrorKind::CacheMissOnRemove);
                return false;
            }
            Removal::Absent => {
                self.metrics.inc(ErrorKind::CacheMissOnRemove);
                false
            }
        };
        match self
            .pids
            .remove_if(&record.pid(), |exec_id| exec_id == record.exec_id())
        {
            Removal::Removed(_) => {}
            // The PID belongs to a newer process now
            Removal::Kept => {}
            Removal::Absent => self.metrics.inc(ErrorKind::PidMapMissOnRemove),
        }
        present
    }
}

enum CollectorRequest {
    Delete(Arc<ProcessRecord>),
    Stop,
}

/// Start the collector task and return a handle to the process cache.
///
/// Must be called from within a tokio runtime.
pub fn start_process_cache(
    config: CacheConfig,
    metrics: Arc<Metrics>,
) -> Result<ProcessCache, CacheError> {
    let stores = Arc::new(Stores::new(config.capacity, metrics.clone())?);
    let (tx, rx) = mpsc::unbounded_channel();
    let collector = Collector::new(stores.clone(), config.duplicate_release);
    tokio::spawn(run_collector(collector, rx, config.gc_interval));
    log::debug!(
        "process cache started: capacity {}, sweep every {:?}",
        config.capacity,
        config.gc_interval
    );
    Ok(ProcessCache {
        stores,
        tx,
        metrics,
    })
}

async fn run_collector(
    mut collector: Collector,
    mut rx: mpsc::UnboundedReceiver<CollectorRequest>,
    interval: Duration,
) {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    loop {
        tokio::select! {
            biased;
            msg = rx.recv() => match msg {
                Some(CollectorRequest::Delete(record)) => collector.on_delete_request(record),
                Some(CollectorRequest::Stop) | None => break,
            },
            _ = ticker.tick() => {
                collector.sweep();
            }
        }
    }
    log::debug!(
        "process cache collector stopped with {} staged records",
        collector.staged()
    );
}

/// Handle to the process cache. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ProcessCache {
    stores: Arc<Stores>,
    tx: mpsc::UnboundedSender<CollectorRequest>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for CollectorRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectorRequest::Delete(record) => write!(f, "Delete({})", record.exec_id()),
            CollectorRequest::Stop => write!(f, "Stop"),
        }
    }
}

impl ProcessCache {
    pub fn get(&self, exec_id: &ExecId) -> Result<Arc<ProcessRecord>, CacheError> {
        match self.stores.processes.get(exec_id) {
            Some(record) => Ok(record),
            None => {
                log::debug!("process {exec_id} not found in cache");
                self.metrics.inc(ErrorKind::CacheMissOnGet);
                Err(CacheError::NotFound(exec_id.clone()))
            }
        }
    }

    /// Insert a record. Returns whether another record was evicted for it.
    pub fn add(&self, record: Arc<ProcessRecord>) -> bool {
        let exec_id = record.exec_id().clone();
        match self.stores.processes.put(exec_id, record) {
            Some((evicted_id, evicted)) => {
                self.metrics.inc(ErrorKind::CacheEvicted);
                if evicted.refcnt() > 0 {
                    log::warn!(
                        "process {evicted_id} evicted with {} references left",
                        evicted.refcnt()
                    );
                    self.metrics.inc(ErrorKind::CacheEvictedInUse);
                }
                true
            }
            None => false,
        }
    }

    /// Remove a record and its PID index entry. Removing twice is harmless:
    /// the second removal is only counted.
    pub fn remove(&self, record: &ProcessRecord) -> bool {
        self.stores.remove(record)
    }

    pub fn retain(&self, record: &ProcessRecord) {
        record.inc_ref();
    }

    /// Drop a reference. When the count reaches zero the record is handed to
    /// the collector, it stays cached until the collector reclaims it.
    pub fn release(&self, record: &Arc<ProcessRecord>) {
        match record.dec_ref() {
            Ok(0) => {
                if self
                    .tx
                    .send(CollectorRequest::Delete(record.clone()))
                    .is_err()
                {
                    log::debug!(
                        "collector stopped, delete request for {} dropped",
                        record.exec_id()
                    );
                    self.metrics.inc(ErrorKind::DeleteRequestDropped);
                }
            }
            Ok(_) => {}
            Err(_) => {
                log::error!(
                    "reference count underflow on process {}",
                    record.exec_id()
                );
                self.metrics.inc(ErrorKind::RefcntUnderflow);
            }
        }
    }

    /// Execution id of the latest process seen with `pid`.
    pub fn pid_lookup(&self, pid: u32) -> Option<ExecId> {
        let exec_id = self.stores.pids.get(&pid);
        if exec_id.is_none() {
            log::debug!("pid {pid} not found in pid index");
            self.metrics.inc(ErrorKind::PidMapMiss);
        }
        exec_id
    }

    /// Like [`ProcessCache::get`], without counting a miss.
    pub fn find(&self, exec_id: &ExecId) -> Option<Arc<ProcessRecord>> {
        self.stores.processes.get(exec_id)
    }

    /// Like [`ProcessCache::pid_lookup`], without counting a miss. Used where
    /// an unknown PID is the common case, eg. the parent of a first exec.
    pub fn find_pid(&self, pid: u32) -> Option<ExecId> {
        self.stores.pids.get(&pid)
    }

    /// Point `pid` at `exec_id`, overwriting any previous owner. Returns
    /// whether another entry was evicted.
    pub fn put_pid(&self, pid: u32, exec_id: ExecId) -> bool {
        match self.stores.pids.put(pid, exec_id) {
            Some((evicted_pid, _)) => {
                log::warn!("entry for pid {evicted_pid} evicted from pid index");
                self.metrics.inc(ErrorKind::PidMapEvicted);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.stores.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.processes.is_empty()
    }

    pub fn pid_index_len(&self) -> usize {
        self.stores.pids.len()
    }

    pub fn capacity(&self) -> usize {
        self.stores.processes.capacity()
    }

    /// Stop the collector and empty both stores unconditionally.
    pub fn purge(&self) {
        let _ = self.tx.send(CollectorRequest::Stop);
        self.stores.processes.clear();
        self.stores.pids.clear();
    }
}
