//! In-memory process lifecycle tracking for kernel event pipelines.
//!
//! Raw [kernel messages](crate::message) are dispatched by the
//! [`ProcessManager`](crate::manager::ProcessManager) to per-kind
//! [handlers](crate::handlers), which correlate them with long lived
//! [process records](crate::process) and produce normalized
//! [events](crate::event). Every produced event is fanned out to the set of
//! registered [`Listener`](crate::manager::Listener)s.
//!
//! Process records are reference counted. A record whose count drops to zero
//! is not removed right away: a background collector task holds it for two
//! sweep intervals, so that kernel events delivered out of order can still
//! resolve it.

pub mod config;
pub mod dns;
pub mod event;
pub mod handlers;
pub mod manager;
pub mod message;
pub mod metrics;
pub mod process;
