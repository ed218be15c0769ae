use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use strum::{EnumCount, EnumIter, IntoEnumIterator, IntoStaticStr};

use crate::{event::PayloadKind, message::MessageKind};

/// Categories of non fatal failures counted by the core.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumCount, EnumIter, IntoStaticStr,
)]
pub enum ErrorKind {
    /// `get` on an execution id which is not cached.
    CacheMissOnGet,
    /// A record was evicted to make room for a new one.
    CacheEvicted,
    /// The evicted record still had outstanding references.
    CacheEvictedInUse,
    /// `remove` on a record which was not cached anymore.
    CacheMissOnRemove,
    /// PID lookup without a known owner.
    PidMapMiss,
    /// PID index entry already gone when its record was removed.
    PidMapMissOnRemove,
    /// A PID index entry was evicted.
    PidMapEvicted,
    /// `release` on a record whose count was already zero.
    RefcntUnderflow,
    /// The collector was not running when a delete request was issued.
    DeleteRequestDropped,
    /// An event referenced a process which could not be resolved.
    ProcessMissing,
    /// A message of an unknown process could not wait in the full event cache.
    EventCacheFull,
    /// A message of an unknown kind reached the manager.
    UnhandledEvent,
    /// A listener failed to accept an event.
    ListenerFailed,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// Counters shared by the cache, the handlers and the manager.
#[derive(Debug)]
pub struct Metrics {
    errors: [AtomicU64; ErrorKind::COUNT],
    processed: Mutex<HashMap<(MessageKind, PayloadKind), u64>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            errors: std::array::from_fn(|_| AtomicU64::new(0)),
            processed: Mutex::new(HashMap::new()),
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, kind: ErrorKind) {
        self.errors[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, kind: ErrorKind) -> u64 {
        self.errors[kind as usize].load(Ordering::Relaxed)
    }

    /// All error counters, in declaration order.
    pub fn errors(&self) -> Vec<(ErrorKind, u64)> {
        ErrorKind::iter().map(|kind| (kind, self.get(kind))).collect()
    }

    /// Record that a raw message of kind `original` produced an event of kind `processed`.
    pub fn processed_event(&self, original: MessageKind, processed: PayloadKind) {
        *self.processed.lock().entry((original, processed)).or_default() += 1;
    }

    pub fn processed(&self, original: MessageKind, processed: PayloadKind) -> u64 {
        self.processed
            .lock()
            .get(&(original, processed))
            .copied()
            .unwrap_or(0)
    }

    /// Processed event counters sorted by kind pair.
    pub fn processed_events(&self) -> Vec<((MessageKind, PayloadKind), u64)> {
        let mut counters: Vec<_> = self
            .processed
            .lock()
            .iter()
            .map(|(key, count)| (*key, *count))
            .collect();
        counters.sort();
        counters
    }
}
