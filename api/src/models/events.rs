//! The typed event streams the cache consumes from its watchers

use super::checks::AdmissionCheck;
use super::cohorts::Cohort;
use super::flavors::{ResourceFlavor, Topology};
use super::queues::{ClusterQueue, LocalQueue};
use super::workloads::Workload;

/// One observation from an object store watcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEvent<T> {
    /// The entity was first observed
    Added(T),
    /// The entity changed
    Modified(T),
    /// The entity was deleted
    Deleted(T),
}

impl<T> WatchEvent<T> {
    /// Borrow the entity inside this event
    pub fn entity(&self) -> &T {
        match self {
            WatchEvent::Added(entity) | WatchEvent::Modified(entity) | WatchEvent::Deleted(entity) => {
                entity
            }
        }
    }
}

/// An event for any of the entity kinds the cache tracks
///
/// Watchers for each kind funnel into a single serialized channel so the
/// cache observes one totally ordered sequence of states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityEvent {
    /// A cluster queue event
    ClusterQueue(WatchEvent<ClusterQueue>),
    /// A cohort event
    Cohort(WatchEvent<Cohort>),
    /// A resource flavor event
    Flavor(WatchEvent<ResourceFlavor>),
    /// A topology event
    Topology(WatchEvent<Topology>),
    /// An admission check event
    Check(WatchEvent<AdmissionCheck>),
    /// A local queue event
    LocalQueue(WatchEvent<LocalQueue>),
    /// A workload event
    Workload(WatchEvent<Workload>),
}
