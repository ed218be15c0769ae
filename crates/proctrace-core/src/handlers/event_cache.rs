//! Messages waiting for the exec of their process.
//!
//! A probe hit or an exit may be received before the exec which creates its
//! process record. With the event cache enabled such messages wait here
//! instead of producing a degraded event. They are retried after every exec
//! and on every retry tick of the manager; a message still unresolved after
//! `retries` ticks is given up on.

use std::{collections::VecDeque, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::message::{ExitMessage, KprobeMessage, MessageKind, TracepointMessage};

pub(crate) const DEFAULT_CAPACITY: usize = 4096;
pub(crate) const DEFAULT_RETRIES: u32 = 3;
pub(crate) const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// A message whose process is not cached yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Deferred {
    Exit(ExitMessage),
    Kprobe(KprobeMessage),
    Tracepoint(TracepointMessage),
}

impl Deferred {
    /// PID and start time of the process the message belongs to.
    pub(crate) fn process(&self) -> (u32, u64) {
        match self {
            Deferred::Exit(msg) => (msg.pid, msg.ktime),
            Deferred::Kprobe(msg) => (msg.pid, msg.ktime),
            Deferred::Tracepoint(msg) => (msg.pid, msg.ktime),
        }
    }

    pub(crate) fn kind(&self) -> MessageKind {
        match self {
            Deferred::Exit(_) => MessageKind::Exit,
            Deferred::Kprobe(_) => MessageKind::Kprobe,
            Deferred::Tracepoint(_) => MessageKind::Tracepoint,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Entry {
    pub(crate) msg: Deferred,
    /// When the message was received, used as the time of its event.
    pub(crate) time: DateTime<Utc>,
    /// Retry ticks survived so far.
    pub(crate) strikes: u32,
}

/// Bounded FIFO of deferred messages.
#[derive(Debug)]
pub(crate) struct EventCache {
    entries: Mutex<VecDeque<Entry>>,
    capacity: usize,
    retries: u32,
}

impl EventCache {
    pub(crate) fn new(capacity: usize, retries: u32) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
            retries,
        }
    }

    /// Queue a message. Returns it back when the cache is full.
    pub(crate) fn push(&self, msg: Deferred, time: DateTime<Utc>) -> Result<(), Deferred> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            return Err(msg);
        }
        entries.push_back(Entry {
            msg,
            time,
            strikes: 0,
        });
        Ok(())
    }

    /// Take every queued message, oldest first.
    pub(crate) fn take(&self) -> VecDeque<Entry> {
        std::mem::take(&mut *self.entries.lock())
    }

    /// Put back messages taken with [`EventCache::take`], ahead of the ones
    /// queued since.
    pub(crate) fn restore(&self, kept: Vec<Entry>) {
        let mut entries = self.entries.lock();
        for entry in kept.into_iter().rev() {
            entries.push_front(entry);
        }
    }

    pub(crate) fn retries(&self) -> u32 {
        self.retries
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
