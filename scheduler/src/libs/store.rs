//! The object store collaborator seam
//!
//! The engine's only externally visible side effects are intent writes:
//! workload condition transitions, admission records, and queue status.
//! The trait below is that seam; the in-memory implementation backs the
//! test suite and dry runs, while real deployments plug in their own
//! store client. Watch events flow the other way, funneled into the
//! cache through one serialized channel.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{event, Level};
use warden::models::workloads::{Admission, ConditionType};
use warden::models::{ActiveReason, ClusterQueueStatus, EntityEvent, WatchEvent, Workload};
use warden::Error;

use super::cache::Cache;

/// The writes the engine can make against the external object store
///
/// Writes are idempotent: re-emitting an intent that was already applied
/// is a no-op. An optimistic concurrency conflict surfaces as
/// `Error::Conflict` and the caller drops the intent; the watchers will
/// deliver whatever state won.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Record a quota reservation on a workload
    ///
    /// # Arguments
    ///
    /// * `key` - The workload's namespace/name key
    /// * `admission` - The admission record to write
    async fn reserve_quota(&self, key: &str, admission: &Admission) -> Result<(), Error>;

    /// Record an eviction on a workload
    ///
    /// # Arguments
    ///
    /// * `key` - The workload's namespace/name key
    /// * `reason` - The camel case reason code
    /// * `message` - The human readable message
    async fn evict_workload(&self, key: &str, reason: &str, message: &str) -> Result<(), Error>;

    /// Write a cluster queue's readiness condition
    ///
    /// # Arguments
    ///
    /// * `queue` - The queue to update
    /// * `status` - The derived readiness
    /// * `reason` - The reason code for the Active condition
    /// * `message` - The human readable message
    async fn update_queue_status(
        &self,
        queue: &str,
        status: ClusterQueueStatus,
        reason: ActiveReason,
        message: &str,
    ) -> Result<(), Error>;
}

/// The mutable state behind the in-memory store
#[derive(Debug, Default)]
struct MemoryState {
    /// The workloads the store holds
    workloads: HashMap<String, Workload>,
    /// The queue statuses last written
    queue_statuses: HashMap<String, (ClusterQueueStatus, ActiveReason, String)>,
    /// The watch events not yet consumed
    events: VecDeque<EntityEvent>,
    /// How many upcoming writes should fail transiently
    fail_next: u32,
}

/// An in-memory object store for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// The state behind the lock
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Create an empty in-memory store
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Seed a workload, emitting an Added event
    ///
    /// # Arguments
    ///
    /// * `workload` - The workload to seed
    pub fn seed_workload(&self, workload: Workload) {
        let mut state = self.state.lock().unwrap();
        state.workloads.insert(workload.key(), workload.clone());
        state.events.push_back(EntityEvent::Workload(WatchEvent::Added(workload)));
    }

    /// Make the next writes fail with a transient error
    ///
    /// # Arguments
    ///
    /// * `count` - How many writes should fail
    pub fn fail_next(&self, count: u32) {
        self.state.lock().unwrap().fail_next = count;
    }

    /// Get a workload as the store sees it
    ///
    /// # Arguments
    ///
    /// * `key` - The workload's namespace/name key
    pub fn workload(&self, key: &str) -> Option<Workload> {
        self.state.lock().unwrap().workloads.get(key).cloned()
    }

    /// The queue status last written, if any
    ///
    /// # Arguments
    ///
    /// * `queue` - The queue to look up
    pub fn queue_status(&self, queue: &str) -> Option<(ClusterQueueStatus, ActiveReason, String)> {
        self.state.lock().unwrap().queue_statuses.get(queue).cloned()
    }

    /// Apply every pending watch event to a cache
    ///
    /// Tests use this instead of the funnel task to stay deterministic.
    ///
    /// # Arguments
    ///
    /// * `cache` - The cache to apply events to
    pub fn drain_into(&self, cache: &Cache) {
        loop {
            let next = self.state.lock().unwrap().events.pop_front();
            match next {
                Some(entity) => apply_event(cache, entity),
                None => break,
            }
        }
    }

    /// Fail the call if a transient failure was injected
    fn maybe_fail(state: &mut MemoryState) -> Result<(), Error> {
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(Error::Store("injected transient store failure".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn reserve_quota(&self, key: &str, admission: &Admission) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        MemoryStore::maybe_fail(&mut state)?;
        let Some(workload) = state.workloads.get_mut(key) else {
            return Err(Error::UnknownWorkload(key.to_owned()));
        };
        match &workload.status.admission {
            // re-emitting the same reservation is a no-op
            Some(current) if current == admission => return Ok(()),
            // someone else won the race for this workload
            Some(current) => {
                return Err(Error::Conflict(format!(
                    "workload {key} is already admitted to {}",
                    current.cluster_queue
                )));
            }
            None => {}
        }
        workload.status.admission = Some(admission.clone());
        workload.set_condition(
            ConditionType::QuotaReserved,
            true,
            "QuotaReserved",
            format!("quota reserved in cluster queue {}", admission.cluster_queue),
        );
        let updated = workload.clone();
        state.events.push_back(EntityEvent::Workload(WatchEvent::Modified(updated)));
        Ok(())
    }

    async fn evict_workload(&self, key: &str, reason: &str, message: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        MemoryStore::maybe_fail(&mut state)?;
        let Some(workload) = state.workloads.get_mut(key) else {
            return Err(Error::UnknownWorkload(key.to_owned()));
        };
        let mut changed = workload.set_condition(ConditionType::Evicted, true, reason, message);
        if workload.status.admission.is_some() {
            workload.status.admission = None;
            changed = true;
        }
        if changed {
            let updated = workload.clone();
            state.events.push_back(EntityEvent::Workload(WatchEvent::Modified(updated)));
        }
        Ok(())
    }

    async fn update_queue_status(
        &self,
        queue: &str,
        status: ClusterQueueStatus,
        reason: ActiveReason,
        message: &str,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        MemoryStore::maybe_fail(&mut state)?;
        state
            .queue_statuses
            .insert(queue.to_owned(), (status, reason, message.to_owned()));
        Ok(())
    }
}

/// Apply one watch event to the cache
///
/// Handler errors are reconciliation failures: they are logged with
/// context and never abort the stream.
///
/// # Arguments
///
/// * `cache` - The cache to apply the event to
/// * `entity` - The observed event
pub fn apply_event(cache: &Cache, entity: EntityEvent) {
    let outcome = match entity {
        EntityEvent::ClusterQueue(WatchEvent::Added(cq))
        | EntityEvent::ClusterQueue(WatchEvent::Modified(cq)) => {
            cache.add_or_update_cluster_queue(cq)
        }
        EntityEvent::ClusterQueue(WatchEvent::Deleted(cq)) => {
            cache.delete_cluster_queue(&cq.name);
            Ok(())
        }
        EntityEvent::Cohort(WatchEvent::Added(cohort))
        | EntityEvent::Cohort(WatchEvent::Modified(cohort)) => cache.add_or_update_cohort(cohort),
        EntityEvent::Cohort(WatchEvent::Deleted(cohort)) => {
            cache.delete_cohort(&cohort.name);
            Ok(())
        }
        EntityEvent::Flavor(WatchEvent::Added(flavor))
        | EntityEvent::Flavor(WatchEvent::Modified(flavor)) => {
            cache.add_or_update_flavor(flavor);
            Ok(())
        }
        EntityEvent::Flavor(WatchEvent::Deleted(flavor)) => {
            cache.delete_flavor(&flavor.name);
            Ok(())
        }
        EntityEvent::Topology(WatchEvent::Added(topology))
        | EntityEvent::Topology(WatchEvent::Modified(topology)) => {
            cache.add_or_update_topology(topology);
            Ok(())
        }
        EntityEvent::Topology(WatchEvent::Deleted(topology)) => {
            cache.delete_topology(&topology.name);
            Ok(())
        }
        EntityEvent::Check(WatchEvent::Added(check))
        | EntityEvent::Check(WatchEvent::Modified(check)) => {
            cache.add_or_update_check(check);
            Ok(())
        }
        EntityEvent::Check(WatchEvent::Deleted(check)) => {
            cache.delete_check(&check.name);
            Ok(())
        }
        EntityEvent::LocalQueue(WatchEvent::Added(queue))
        | EntityEvent::LocalQueue(WatchEvent::Modified(queue)) => cache.add_local_queue(queue),
        EntityEvent::LocalQueue(WatchEvent::Deleted(queue)) => {
            cache.delete_local_queue(&queue.key());
            Ok(())
        }
        EntityEvent::Workload(WatchEvent::Added(workload))
        | EntityEvent::Workload(WatchEvent::Modified(workload)) => {
            cache.add_or_update_workload(workload)
        }
        EntityEvent::Workload(WatchEvent::Deleted(workload)) => cache.delete_workload(&workload.key()),
    };
    if let Err(err) = outcome {
        event!(Level::WARN, error = %err, "failed to reconcile a watch event");
    }
}

/// Funnel watch events into the cache until the channel closes
///
/// Each watched kind gets its own watcher task; they all send into this
/// one channel so the cache observes a single totally ordered stream.
///
/// # Arguments
///
/// * `rx` - The event channel to drain
/// * `cache` - The cache to apply events to
pub async fn funnel_events(mut rx: mpsc::Receiver<EntityEvent>, cache: std::sync::Arc<Cache>) {
    while let Some(entity) = rx.recv().await {
        apply_event(&cache, entity);
    }
    event!(Level::INFO, "watch funnel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden::models::workloads::PodSet;
    use warden::models::CPU;

    /// build a pending workload
    fn pending(name: &str) -> Workload {
        Workload::new("team-a", name, "main").pod_set(PodSet::new("main", 1).request(CPU, 1000))
    }

    #[tokio::test]
    async fn reserve_is_idempotent() {
        let store = MemoryStore::new();
        let wl = pending("train");
        store.seed_workload(wl.clone());
        let admission = Admission {
            cluster_queue: "queue-a".into(),
            pod_set_assignments: Vec::new(),
        };
        store.reserve_quota(&wl.key(), &admission).await.unwrap();
        let stamp = store
            .workload(&wl.key())
            .unwrap()
            .condition(ConditionType::QuotaReserved)
            .unwrap()
            .last_transition;
        // re-emitting the same intent changes nothing
        store.reserve_quota(&wl.key(), &admission).await.unwrap();
        let after = store.workload(&wl.key()).unwrap();
        assert_eq!(after.condition(ConditionType::QuotaReserved).unwrap().last_transition, stamp);
    }

    #[tokio::test]
    async fn conflicting_reservation_is_rejected() {
        let store = MemoryStore::new();
        let wl = pending("train");
        store.seed_workload(wl.clone());
        let first = Admission {
            cluster_queue: "queue-a".into(),
            pod_set_assignments: Vec::new(),
        };
        let second = Admission {
            cluster_queue: "queue-b".into(),
            pod_set_assignments: Vec::new(),
        };
        store.reserve_quota(&wl.key(), &first).await.unwrap();
        match store.reserve_quota(&wl.key(), &second).await {
            Err(Error::Conflict(_)) => {}
            other => panic!("expected a conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let store = MemoryStore::new();
        let wl = pending("train");
        store.seed_workload(wl.clone());
        store.fail_next(1);
        let admission = Admission {
            cluster_queue: "queue-a".into(),
            pod_set_assignments: Vec::new(),
        };
        let err = store.reserve_quota(&wl.key(), &admission).await.unwrap_err();
        assert!(err.is_transient());
        // the next attempt goes through
        store.reserve_quota(&wl.key(), &admission).await.unwrap();
    }
}
