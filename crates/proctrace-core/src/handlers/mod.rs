//! Per-kind handlers turning raw kernel messages into normalized events.
//!
//! Handlers are the only callers of `retain`/`release` on the process cache.
//! The counts they keep follow a fixed protocol:
//!
//! - an exec adds a record holding one reference on behalf of the live
//!   process, plus one reference on its parent held on behalf of the child;
//! - an exit drops both of them, each at most once;
//! - a probe or tracepoint hit holds a reference while the event is built.
//!
//! Probe hits and exits of a process not cached yet either produce their
//! event right away, without process information, or wait in the event cache
//! for the exec of their process.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};

use crate::{
    config::{ConfigError, ModuleConfig},
    dns::DnsCache,
    event::{Event, ExecId, Payload, Process},
    message::{MessageKind, TestMessage},
    metrics::{ErrorKind, Metrics},
    process::{ProcessCache, ProcessRecord},
};

mod event_cache;
mod exec;
mod probes;

use event_cache::{Deferred, Entry, EventCache};

pub use exec::ExecHandler;
pub use probes::TracingHandler;

/// Name of the configuration section read by [`ProcessOptions`].
pub const MANAGER_CONFIG: &str = "process-manager";

const DEFAULT_NODE_NAME: &str = "localhost";

/// Options shared by every handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOptions {
    /// Name of this node, part of every execution id.
    pub node_name: String,
    /// Include credentials in normalized events.
    pub enable_process_cred: bool,
    /// Include namespaces in normalized events.
    pub enable_process_ns: bool,
    /// Hold events of unknown processes until their exec shows up.
    pub enable_event_cache: bool,
    /// Maximum number of messages waiting in the event cache.
    pub event_cache_capacity: usize,
    /// Retry ticks a waiting message survives before it is given up on.
    pub event_cache_retries: u32,
    /// Time between two retry ticks.
    pub event_cache_interval: Duration,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            node_name: DEFAULT_NODE_NAME.to_string(),
            enable_process_cred: false,
            enable_process_ns: false,
            enable_event_cache: false,
            event_cache_capacity: event_cache::DEFAULT_CAPACITY,
            event_cache_retries: event_cache::DEFAULT_RETRIES,
            event_cache_interval: event_cache::DEFAULT_RETRY_INTERVAL,
        }
    }
}

impl TryFrom<&ModuleConfig> for ProcessOptions {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        let node_name: String = config.with_default("node_name", DEFAULT_NODE_NAME.to_string())?;
        if node_name.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "node_name".to_string(),
                value: node_name,
                err: "node name cannot be empty".to_string(),
            });
        }
        let event_cache_capacity =
            config.with_default("event_cache_capacity", event_cache::DEFAULT_CAPACITY)?;
        if event_cache_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "event_cache_capacity".to_string(),
                value: "0".to_string(),
                err: "capacity must be positive".to_string(),
            });
        }
        let interval_secs: u64 = config.with_default(
            "event_cache_interval_secs",
            event_cache::DEFAULT_RETRY_INTERVAL.as_secs(),
        )?;
        if interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "event_cache_interval_secs".to_string(),
                value: "0".to_string(),
                err: "interval must be positive".to_string(),
            });
        }
        Ok(Self {
            node_name,
            enable_process_cred: config.with_default("enable_process_cred", false)?,
            enable_process_ns: config.with_default("enable_process_ns", false)?,
            enable_event_cache: config.with_default("enable_event_cache", false)?,
            event_cache_capacity,
            event_cache_retries: config
                .with_default("event_cache_retries", event_cache::DEFAULT_RETRIES)?,
            event_cache_interval: Duration::from_secs(interval_secs),
        })
    }
}

/// What every handler needs: the caches, the options and the counters.
#[derive(Debug)]
pub(crate) struct HandlerContext {
    pub(crate) cache: ProcessCache,
    pub(crate) dns: DnsCache,
    pub(crate) options: ProcessOptions,
    pub(crate) metrics: Arc<Metrics>,
    event_cache: Option<EventCache>,
}

impl HandlerContext {
    pub(crate) fn exec_id(&self, pid: u32, ktime: u64) -> ExecId {
        ExecId::new(&self.options.node_name, ktime, pid)
    }

    /// Find the record of a process, by execution id first, then through the
    /// PID index for messages whose start time does not match an exec.
    pub(crate) fn resolve(&self, pid: u32, ktime: u64) -> Option<Arc<ProcessRecord>> {
        if let Ok(record) = self.cache.get(&self.exec_id(pid, ktime)) {
            return Some(record);
        }
        let exec_id = self.cache.pid_lookup(pid)?;
        self.cache.get(&exec_id).ok()
    }

    /// Like [`HandlerContext::resolve`], without counting misses.
    fn find(&self, pid: u32, ktime: u64) -> Option<Arc<ProcessRecord>> {
        self.cache.find(&self.exec_id(pid, ktime)).or_else(|| {
            let exec_id = self.cache.find_pid(pid)?;
            self.cache.find(&exec_id)
        })
    }

    pub(crate) fn parent_of(&self, record: &ProcessRecord) -> Option<Arc<ProcessRecord>> {
        let parent_id = record.process().parent_exec_id.as_ref()?;
        self.cache.get(parent_id).ok()
    }

    /// Process information as exposed to listeners.
    pub(crate) fn export(&self, record: &ProcessRecord) -> Process {
        let mut process = record.snapshot();
        if !self.options.enable_process_cred {
            process.credentials = None;
        }
        if !self.options.enable_process_ns {
            process.namespaces = None;
        }
        process
    }

    pub(crate) fn missing(&self, what: &str, pid: u32, ktime: u64) {
        log::debug!("{what} for unknown process {pid} (ktime {ktime})");
        self.metrics.inc(ErrorKind::ProcessMissing);
    }

    /// Hand a message of an unknown process to the event cache. Gives it
    /// back when the event cache is disabled or full.
    pub(crate) fn defer(&self, msg: Deferred) -> Result<(), Deferred> {
        let Some(event_cache) = &self.event_cache else {
            return Err(msg);
        };
        let (pid, ktime) = msg.process();
        match event_cache.push(msg, Utc::now()) {
            Ok(()) => {
                log::debug!("waiting for the exec of process {pid} (ktime {ktime})");
                Ok(())
            }
            Err(msg) => {
                log::warn!("event cache full, not waiting for process {pid}");
                self.metrics.inc(ErrorKind::EventCacheFull);
                Err(msg)
            }
        }
    }

    pub(crate) fn event(&self, payload: Payload) -> Event {
        self.event_at(Utc::now(), payload)
    }

    pub(crate) fn event_at(&self, time: DateTime<Utc>, payload: Payload) -> Event {
        Event {
            node_name: self.options.node_name.clone(),
            time,
            payload,
        }
    }
}

/// How [`Handlers::retry_deferred`] treats messages still unresolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Leave them waiting.
    Resolve,
    /// Count a retry tick against them.
    Tick,
    /// Give up on all of them.
    Flush,
}

/// The fixed set of handlers, one per recognized message kind.
#[derive(Debug, Clone)]
pub struct Handlers {
    context: Arc<HandlerContext>,
    exec: ExecHandler,
    tracing: TracingHandler,
}

impl Handlers {
    pub fn new(
        cache: ProcessCache,
        dns: DnsCache,
        options: ProcessOptions,
        metrics: Arc<Metrics>,
    ) -> Self {
        let event_cache = options
            .enable_event_cache
            .then(|| EventCache::new(options.event_cache_capacity, options.event_cache_retries));
        let context = Arc::new(HandlerContext {
            cache,
            dns,
            options,
            metrics,
            event_cache,
        });
        Self {
            exec: ExecHandler::new(context.clone()),
            tracing: TracingHandler::new(context.clone()),
            context,
        }
    }

    pub fn exec(&self) -> &ExecHandler {
        &self.exec
    }

    pub fn tracing(&self) -> &TracingHandler {
        &self.tracing
    }

    /// Test events are forwarded as they are, without touching the cache.
    pub fn handle_test(&self, msg: TestMessage) -> Event {
        self.context.event(Payload::Test {
            arg0: msg.arg0,
            arg1: msg.arg1,
            arg2: msg.arg2,
            arg3: msg.arg3,
        })
    }

    /// Retry the messages waiting in the event cache. Returns the events
    /// produced, with the kind of the message each one comes from.
    ///
    /// A message given up on produces its event without process information,
    /// except for exits which produce nothing.
    pub fn retry_deferred(&self, retry: Retry) -> Vec<(MessageKind, Event)> {
        let Some(event_cache) = &self.context.event_cache else {
            return Vec::new();
        };
        let entries = event_cache.take();
        let mut events = Vec::new();
        let mut kept = Vec::new();
        for mut entry in entries {
            let kind = entry.msg.kind();
            let (pid, ktime) = entry.msg.process();
            if let Some(record) = self.context.find(pid, ktime) {
                events.extend(self.complete(entry, Some(&record)).map(|event| (kind, event)));
                continue;
            }
            if retry == Retry::Tick {
                entry.strikes += 1;
            }
            if retry == Retry::Flush || entry.strikes >= event_cache.retries() {
                self.context.missing(kind.name(), pid, ktime);
                events.extend(self.complete(entry, None).map(|event| (kind, event)));
            } else {
                kept.push(entry);
            }
        }
        event_cache.restore(kept);
        events
    }

    /// Number of messages waiting in the event cache.
    pub fn deferred(&self) -> usize {
        self.context
            .event_cache
            .as_ref()
            .map_or(0, |event_cache| event_cache.len())
    }

    fn complete(&self, entry: Entry, record: Option<&Arc<ProcessRecord>>) -> Option<Event> {
        match (entry.msg, record) {
            (Deferred::Exit(msg), Some(record)) => {
                Some(self.exec.exit_event(msg, record, entry.time))
            }
            (Deferred::Exit(_), None) => None,
            (Deferred::Kprobe(msg), record) => {
                Some(self.tracing.kprobe_event(msg, record, entry.time))
            }
            (Deferred::Tracepoint(msg), record) => {
                Some(self.tracing.tracepoint_event(msg, record, entry.time))
            }
        }
    }

    pub fn options(&self) -> &ProcessOptions {
        &self.context.options
    }

    pub fn cache(&self) -> &ProcessCache {
        &self.context.cache
    }

    pub fn dns(&self) -> &DnsCache {
        &self.context.dns
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::process::{CacheConfig, start_process_cache};

    use super::*;

    pub(crate) const NODE: &str = "node";

    pub(crate) fn handlers(options: ProcessOptions) -> (Handlers, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let cache = start_process_cache(CacheConfig::default(), metrics.clone()).unwrap();
        let dns = DnsCache::new(16).unwrap();
        (Handlers::new(cache, dns, options, metrics.clone()), metrics)
    }

    pub(crate) fn options() -> ProcessOptions {
        ProcessOptions {
            node_name: NODE.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn options_from_config() {
        let mut config = ModuleConfig::default();
        assert_eq!(
            ProcessOptions::try_from(&config).unwrap(),
            ProcessOptions::default()
        );
        config.insert("node_name".to_string(), "worker-3".to_string());
        config.insert("enable_process_cred".to_string(), "true".to_string());
        let options = ProcessOptions::try_from(&config).unwrap();
        assert_eq!(options.node_name, "worker-3");
        assert!(options.enable_process_cred);
        assert!(!options.enable_process_ns);

        config.insert("node_name".to_string(), String::new());
        assert!(ProcessOptions::try_from(&config).is_err());
    }

    #[test]
    fn event_cache_options() {
        let mut config = ModuleConfig::default();
        let options = ProcessOptions::try_from(&config).unwrap();
        assert!(!options.enable_event_cache);
        assert_eq!(options.event_cache_interval, Duration::from_secs(2));

        config.insert("enable_event_cache".to_string(), "true".to_string());
        config.insert("event_cache_capacity".to_string(), "16".to_string());
        config.insert("event_cache_retries".to_string(), "5".to_string());
        config.insert("event_cache_interval_secs".to_string(), "1".to_string());
        let options = ProcessOptions::try_from(&config).unwrap();
        assert!(options.enable_event_cache);
        assert_eq!(options.event_cache_capacity, 16);
        assert_eq!(options.event_cache_retries, 5);
        assert_eq!(options.event_cache_interval, Duration::from_secs(1));

        for (key, value) in [
            ("event_cache_capacity", "0"),
            ("event_cache_interval_secs", "0"),
            ("event_cache_retries", "-1"),
        ] {
            let mut invalid = config.clone();
            invalid.insert(key.to_string(), value.to_string());
            assert!(ProcessOptions::try_from(&invalid).is_err(), "{key}={value}");
        }
    }

    #[tokio::test]
    async fn deferred_hit_keeps_its_arrival_time() {
        let (handlers, _) = handlers(ProcessOptions {
            enable_event_cache: true,
            ..options()
        });
        let before = Utc::now();
        assert!(
            handlers
                .tracing()
                .handle_kprobe(crate::message::KprobeMessage {
                    pid: 100,
                    ktime: 10,
                    function: "tcp_close".to_string(),
                    args: Vec::new(),
                })
                .is_none()
        );
        assert_eq!(handlers.deferred(), 1);

        // nothing to resolve yet
        assert!(handlers.retry_deferred(Retry::Resolve).is_empty());
        let exec = handlers
            .exec()
            .handle_exec(crate::message::ExecMessage {
                pid: 100,
                ppid: 1,
                ktime: 10,
                parent: None,
                binary: "/bin/nc".to_string(),
                args: Vec::new(),
                cwd: "/".to_string(),
                creds: Default::default(),
                namespaces: Default::default(),
                clone: true,
            })
            .unwrap();
        let events = handlers.retry_deferred(Retry::Resolve);
        assert_eq!(events.len(), 1);
        let (kind, event) = &events[0];
        assert_eq!(*kind, MessageKind::Kprobe);
        assert!(event.time >= before && event.time <= exec.time);
        assert_eq!(
            event.process().map(|p| p.exec_id.clone()),
            Some(ExecId::new(NODE, 10, 100))
        );
    }

    #[tokio::test]
    async fn test_events_bypass_the_cache() {
        let (handlers, _) = handlers(options());
        let event = handlers.handle_test(TestMessage {
            arg0: 1,
            arg1: 2,
            arg2: 3,
            arg3: 4,
        });
        assert_eq!(event.node_name, NODE);
        assert_eq!(
            event.payload,
            Payload::Test {
                arg0: 1,
                arg1: 2,
                arg2: 3,
                arg3: 4
            }
        );
        assert!(handlers.cache().is_empty());
    }
}
