//! Deferred reclamation of process records.
//!
//! A record whose reference count drops to zero is not removed right away.
//! An out of order event (eg. a socket close received after the exit of its
//! process) may still need to resolve it. Instead, a delete request is sent
//! to the collector task, which moves the record through the colors:
//!
//! ```text
//! InUse --request--> DeletePending --sweep--> DeleteReady --sweep--> Deleted
//! ```
//!
//! A record whose count is found nonzero during a sweep is dropped from the
//! staging list: somebody took a reference again. The record goes back to the
//! collector with its next delete request, and starts over as `DeletePending`.
//!
//! Staging is keyed by record identity, not by execution id: a replayed exec
//! may cache a second record under the id of one already staged.
//!
//! Colors are only written by the collector, following [`transition`].

use std::{collections::HashMap, sync::Arc};

use strum::{Display, EnumString};

use super::{ProcessRecord, cache::Stores};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum Color {
    #[default]
    InUse = 0,
    DeletePending = 1,
    DeleteReady = 2,
    Deleted = 3,
}

impl Color {
    pub(crate) fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Color::InUse,
            1 => Color::DeletePending,
            2 => Color::DeleteReady,
            _ => Color::Deleted,
        }
    }
}

/// What to do with a delete request for a record still staged.
///
/// Duplicate requests happen whenever a count bounces through zero more than
/// once between two sweeps. A record no longer staged always starts over at
/// `DeletePending`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, EnumString, Display)]
pub enum DuplicateRelease {
    /// Restart the grace period: the record goes back to `DeletePending`.
    #[default]
    #[strum(to_string = "reset")]
    ResetGrace,
    /// Keep the current stage.
    #[strum(to_string = "keep")]
    KeepStage,
}

/// Inputs of the color state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcInput {
    /// A release dropped the reference count to zero. `staged` tells whether
    /// the record is still in the staging list.
    DeleteRequest { staged: bool },
    /// Periodic sweep over a staged record, with its current count.
    Sweep { refcnt: u32 },
}

/// What the collector must do with the record after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcAction {
    /// Make sure the record is in the staging list.
    Stage,
    /// Leave it staged for another interval.
    Keep,
    /// Drop it from the staging list, it is referenced again.
    Unstage,
    /// Drop it from the staging list and from the cache.
    Remove,
    Ignore,
}

/// The color state machine. Pure: it neither reads the clock nor the record.
pub fn transition(color: Color, input: GcInput, policy: DuplicateRelease) -> (Color, GcAction) {
    match (input, color) {
        (GcInput::DeleteRequest { .. }, Color::Deleted) => (Color::Deleted, GcAction::Ignore),
        (GcInput::DeleteRequest { staged: false }, _)
        | (GcInput::DeleteRequest { .. }, Color::InUse) => (Color::DeletePending, GcAction::Stage),
        (GcInput::DeleteRequest { staged: true }, pending_or_ready) => match policy {
            DuplicateRelease::ResetGrace => (Color::DeletePending, GcAction::Stage),
            DuplicateRelease::KeepStage => (pending_or_ready, GcAction::Stage),
        },
        (GcInput::Sweep { refcnt }, color) if refcnt != 0 => (color, GcAction::Unstage),
        (GcInput::Sweep { .. }, Color::DeleteReady) => (Color::Deleted, GcAction::Remove),
        (GcInput::Sweep { .. }, Color::Deleted) => (Color::Deleted, GcAction::Unstage),
        (GcInput::Sweep { .. }, Color::DeletePending | Color::InUse) => {
            (Color::DeleteReady, GcAction::Keep)
        }
    }
}

/// Staging state of the collector task.
///
/// Driven by [`Collector::on_delete_request`] and [`Collector::sweep`]; the
/// task only adds the channel and the timer around it.
pub(crate) struct Collector {
    stores: Arc<Stores>,
    policy: DuplicateRelease,
    staged: HashMap<usize, Arc<ProcessRecord>>,
}

/// Identity of a record, stable while the collector holds it.
fn identity(record: &Arc<ProcessRecord>) -> usize {
    Arc::as_ptr(record) as usize
}

impl Collector {
    pub(crate) fn new(stores: Arc<Stores>, policy: DuplicateRelease) -> Self {
        Self {
            stores,
            policy,
            staged: HashMap::new(),
        }
    }

    pub(crate) fn on_delete_request(&mut self, record: Arc<ProcessRecord>) {
        let key = identity(&record);
        let input = GcInput::DeleteRequest {
            staged: self.staged.contains_key(&key),
        };
        let (color, action) = transition(record.color(), input, self.policy);
        record.set_color(color);
        match action {
            GcAction::Stage => {
                self.staged.entry(key).or_insert(record);
            }
            _ => log::debug!(
                "ignoring delete request for {} in color {}",
                record.exec_id(),
                color
            ),
        }
    }

    /// One periodic pass over the staged records. Returns how many were removed.
    pub(crate) fn sweep(&mut self) -> usize {
        let mut removed = 0;
        let policy = self.policy;
        let stores = &self.stores;
        self.staged.retain(|_, record| {
            let input = GcInput::Sweep {
                refcnt: record.refcnt(),
            };
            let (color, action) = transition(record.color(), input, policy);
            record.set_color(color);
            match action {
                GcAction::Keep | GcAction::Stage => true,
                GcAction::Remove => {
                    log::trace!("reclaiming process {}", record.exec_id());
                    if stores.remove(record) {
                        removed += 1;
                    }
                    false
                }
                GcAction::Unstage | GcAction::Ignore => false,
            }
        });
        log::trace!(
            "process cache sweep: {removed} removed, {} staged, {} cached",
            self.staged.len(),
            self.stores.processes.len()
        );
        removed
    }

    pub(crate) fn staged(&self) -> usize {
        self.staged.len()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use crate::{metrics::Metrics, process::record::tests::process};

    use super::*;

    const RESET: DuplicateRelease = DuplicateRelease::ResetGrace;
    const KEEP: DuplicateRelease = DuplicateRelease::KeepStage;

    const REQUEST: GcInput = GcInput::DeleteRequest { staged: false };
    const DUPLICATE: GcInput = GcInput::DeleteRequest { staged: true };

    #[test]
    fn first_request_stages() {
        assert_eq!(
            transition(Color::InUse, REQUEST, RESET),
            (Color::DeletePending, GcAction::Stage)
        );
    }

    #[test]
    fn duplicate_request_policies() {
        assert_eq!(
            transition(Color::DeleteReady, DUPLICATE, RESET),
            (Color::DeletePending, GcAction::Stage)
        );
        assert_eq!(
            transition(Color::DeleteReady, DUPLICATE, KEEP),
            (Color::DeleteReady, GcAction::Stage)
        );
        assert_eq!(
            transition(Color::DeletePending, DUPLICATE, KEEP),
            (Color::DeletePending, GcAction::Stage)
        );
        for policy in [RESET, KEEP] {
            for input in [REQUEST, DUPLICATE] {
                assert_eq!(
                    transition(Color::Deleted, input, policy),
                    (Color::Deleted, GcAction::Ignore)
                );
            }
        }
    }

    #[test]
    fn unstaged_records_start_a_full_grace_period() {
        for policy in [RESET, KEEP] {
            assert_eq!(
                transition(Color::DeleteReady, REQUEST, policy),
                (Color::DeletePending, GcAction::Stage)
            );
        }
    }

    #[test]
    fn sweeps_take_two_ticks() {
        let (color, action) = transition(Color::DeletePending, GcInput::Sweep { refcnt: 0 }, RESET);
        assert_eq!((color, action), (Color::DeleteReady, GcAction::Keep));
        let (color, action) = transition(color, GcInput::Sweep { refcnt: 0 }, RESET);
        assert_eq!((color, action), (Color::Deleted, GcAction::Remove));
    }

    #[test]
    fn referenced_records_are_unstaged_without_color_change() {
        for color in [Color::DeletePending, Color::DeleteReady] {
            assert_eq!(
                transition(color, GcInput::Sweep { refcnt: 1 }, RESET),
                (color, GcAction::Unstage)
            );
        }
    }

    #[test]
    fn color_names() {
        assert_eq!(Color::from_str("delete_ready"), Ok(Color::DeleteReady));
        assert!(Color::from_str("purple").is_err());
        assert_eq!(
            DuplicateRelease::from_str("keep"),
            Ok(DuplicateRelease::KeepStage)
        );
        assert_eq!(
            DuplicateRelease::from_str("reset"),
            Ok(DuplicateRelease::ResetGrace)
        );
        assert!(DuplicateRelease::from_str("never").is_err());
    }

    fn setup(policy: DuplicateRelease) -> (Arc<Stores>, Collector) {
        let stores = Arc::new(Stores::new(16, Arc::new(Metrics::new())).unwrap());
        let collector = Collector::new(stores.clone(), policy);
        (stores, collector)
    }

    fn cached(stores: &Stores, exec_id: &str, pid: u32) -> Arc<ProcessRecord> {
        let record = Arc::new(ProcessRecord::new(process(exec_id, pid)));
        stores.processes.put(record.exec_id().clone(), record.clone());
        stores.pids.put(pid, record.exec_id().clone());
        record
    }

    #[test]
    fn collector_removes_after_two_sweeps() {
        let (stores, mut collector) = setup(RESET);
        let record = cached(&stores, "E1", 100);
        collector.on_delete_request(record.clone());
        assert_eq!(record.color(), Color::DeletePending);
        assert_eq!(collector.sweep(), 0);
        assert_eq!(record.color(), Color::DeleteReady);
        assert!(stores.processes.contains(record.exec_id()));
        assert_eq!(collector.sweep(), 1);
        assert_eq!(record.color(), Color::Deleted);
        assert!(!stores.processes.contains(record.exec_id()));
        assert!(!stores.pids.contains(&100));
        assert_eq!(collector.staged(), 0);
    }

    #[test]
    fn collector_spares_rereferenced_records() {
        let (stores, mut collector) = setup(RESET);
        let record = cached(&stores, "E1", 100);
        collector.on_delete_request(record.clone());
        collector.sweep();
        record.inc_ref();
        assert_eq!(collector.sweep(), 0);
        assert_eq!(collector.staged(), 0);
        assert_eq!(record.color(), Color::DeleteReady);
        assert!(stores.processes.contains(record.exec_id()));

        // released again: staged again and reclaimed after the grace period
        record.dec_ref().unwrap();
        collector.on_delete_request(record.clone());
        assert_eq!(record.color(), Color::DeletePending);
        assert_eq!(collector.staged(), 1);
        assert_eq!(collector.sweep(), 0);
        assert_eq!(collector.sweep(), 1);
        assert!(!stores.processes.contains(record.exec_id()));
    }

    #[test]
    fn duplicate_requests_restart_grace_period() {
        let (stores, mut collector) = setup(RESET);
        let record = cached(&stores, "E1", 100);
        collector.on_delete_request(record.clone());
        collector.sweep();
        collector.on_delete_request(record.clone());
        assert_eq!(collector.staged(), 1);
        assert_eq!(record.color(), Color::DeletePending);
        assert_eq!(collector.sweep(), 0);
        assert_eq!(collector.sweep(), 1);
    }

    #[test]
    fn duplicate_requests_keep_stage() {
        let (stores, mut collector) = setup(KEEP);
        let record = cached(&stores, "E1", 100);
        collector.on_delete_request(record.clone());
        collector.sweep();
        collector.on_delete_request(record.clone());
        assert_eq!(record.color(), Color::DeleteReady);
        assert_eq!(collector.sweep(), 1);
    }

    #[test]
    fn rereferenced_records_get_a_full_grace_period_when_keeping_stage() {
        let (stores, mut collector) = setup(KEEP);
        let record = cached(&stores, "E1", 100);
        collector.on_delete_request(record.clone());
        collector.sweep();
        record.inc_ref();
        collector.sweep();
        assert_eq!(collector.staged(), 0);
        assert_eq!(record.color(), Color::DeleteReady);

        record.dec_ref().unwrap();
        collector.on_delete_request(record.clone());
        assert_eq!(record.color(), Color::DeletePending);
        assert_eq!(collector.sweep(), 0);
        assert!(stores.processes.contains(record.exec_id()));
        assert_eq!(collector.sweep(), 1);
        assert!(!stores.processes.contains(record.exec_id()));
    }

    #[test]
    fn records_sharing_an_exec_id_are_staged_apart() {
        let (stores, mut collector) = setup(RESET);
        let old = cached(&stores, "E1", 100);
        collector.on_delete_request(old.clone());
        collector.sweep();

        // a replayed exec caches a second record under the same id
        let new = cached(&stores, "E1", 100);
        collector.on_delete_request(new.clone());
        assert_eq!(new.color(), Color::DeletePending);
        assert_eq!(collector.staged(), 2);

        // the old record is gone already, the new one keeps its pid entry
        assert_eq!(collector.sweep(), 0);
        assert_eq!(old.color(), Color::Deleted);
        assert!(stores.processes.contains(new.exec_id()));
        assert!(stores.pids.contains(&100));

        assert_eq!(collector.sweep(), 1);
        assert_eq!(new.color(), Color::Deleted);
        assert!(!stores.processes.contains(new.exec_id()));
        assert!(!stores.pids.contains(&100));
        assert_eq!(collector.staged(), 0);
    }

    #[test]
    fn deleted_records_are_ignored() {
        let (stores, mut collector) = setup(RESET);
        let record = cached(&stores, "E1", 100);
        collector.on_delete_request(record.clone());
        collector.sweep();
        collector.sweep();
        collector.on_delete_request(record.clone());
        assert_eq!(record.color(), Color::Deleted);
        assert_eq!(collector.staged(), 0);
    }
}
