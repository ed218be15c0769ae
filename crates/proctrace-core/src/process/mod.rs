//! Reference counted process records and their cache.
//!
//! The [`ProcessCache`] owns two [`KeyedStore`]s: one holding the
//! [`ProcessRecord`]s by execution id, the other mapping each PID to the
//! execution id of the latest process seen with it.
//!
//! Records are reclaimed by a background collector. Every record carries a
//! [`Color`], written only by the collector, tracking how far it went
//! towards deletion. See [`gc`] for the transition rules.

mod cache;
pub mod gc;
mod record;
mod store;

pub use cache::{CACHE_CONFIG, CacheConfig, CacheError, ProcessCache, start_process_cache};
pub use gc::{Color, DuplicateRelease};
pub use record::ProcessRecord;
pub use store::{KeyedStore, Removal};
