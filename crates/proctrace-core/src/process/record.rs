use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

use crate::event::{ExecId, Process};

use super::gc::Color;

/// A cached process, shared as `Arc<ProcessRecord>` between the cache, the
/// collector and the handlers resolving it.
#[derive(Debug)]
pub struct ProcessRecord {
    process: Process,
    refcnt: AtomicU32,
    /// Only written by the collector task.
    color: AtomicU8,
    /// The reference taken on the parent on behalf of this process is still held.
    parent_held: AtomicBool,
    /// The reference held by the live process itself was dropped.
    exited: AtomicBool,
}

/// The reference count was already zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Underflow;

impl ProcessRecord {
    /// Build a record with no references. Handlers retain it once on behalf
    /// of the live process right after adding it to the cache.
    pub fn new(process: Process) -> Self {
        Self {
            process,
            refcnt: AtomicU32::new(0),
            color: AtomicU8::new(Color::InUse as u8),
            parent_held: AtomicBool::new(false),
            exited: AtomicBool::new(false),
        }
    }

    pub fn exec_id(&self) -> &ExecId {
        &self.process.exec_id
    }

    pub fn pid(&self) -> u32 {
        self.process.pid
    }

    pub fn process(&self) -> &Process {
        &self.process
    }

    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }

    pub fn color(&self) -> Color {
        Color::from_raw(self.color.load(Ordering::Acquire))
    }

    /// Copy of the process information carrying the current reference count.
    pub fn snapshot(&self) -> Process {
        Process {
            refcnt: self.refcnt(),
            ..self.process.clone()
        }
    }

    pub(crate) fn set_color(&self, color: Color) {
        self.color.store(color as u8, Ordering::Release);
    }

    pub(crate) fn hold_parent(&self) {
        self.parent_held.store(true, Ordering::Release);
    }

    /// Returns true if a parent reference was held, at most once.
    pub(crate) fn take_parent(&self) -> bool {
        self.parent_held.swap(false, Ordering::AcqRel)
    }

    /// Returns true the first time only.
    pub(crate) fn mark_exited(&self) -> bool {
        !self.exited.swap(true, Ordering::AcqRel)
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub(crate) fn inc_ref(&self) -> u32 {
        self.refcnt.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement the count, refusing to go below zero. Returns the new count.
    pub(crate) fn dec_ref(&self) -> Result<u32, Underflow> {
        self.refcnt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .map(|previous| previous - 1)
            .map_err(|_| Underflow)
    }
}
