//! The Warden admission engine
//!
//! The engine keeps an in-memory image of all quota objects and admitted
//! workloads, and decides on each scheduler pass which pending workloads
//! may reserve quota, which flavors they land on, and which victims must
//! be preempted to make room.

mod args;
mod libs;

pub use args::Args;
pub use libs::cache::snapshot::Snapshot;
pub use libs::cache::Cache;
pub use libs::fairshare;
pub use libs::flavors::{self, AssignmentMode, AssignmentPlan};
pub use libs::preemption::{self, Victim};
pub use libs::scheduler::{Intent, PassOutcome, Scheduler};
pub use libs::store::{funnel_events, MemoryStore, ObjectStore};
