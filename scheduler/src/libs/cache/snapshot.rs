//! A point in time copy of the cache used by one scheduling pass

use std::collections::HashMap;

use warden::models::{FlavorName, ResourceFlavor, Workload};
use warden::Features;

use super::cohorts::{self, CohortState};
use super::queues::QueueState;

/// An immutable copy of the cache tree that a scheduling pass may mutate
/// locally to try hypothetical admissions
///
/// Snapshots are owned by a single pass and are not threadsafe. Adding
/// and removing the same workload is idempotent per key and restores the
/// snapshot to exactly its prior value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// The cluster queues at the time of the snapshot
    pub queues: HashMap<String, QueueState>,
    /// The cohort forest at the time of the snapshot
    pub cohorts: HashMap<String, CohortState>,
    /// The flavors at the time of the snapshot
    pub flavors: HashMap<FlavorName, ResourceFlavor>,
    /// The feature flags the cache was running with
    pub features: Features,
    /// The cache generation this snapshot was taken at
    pub generation: u64,
}

impl Snapshot {
    /// Charge a workload's usage against its queue and cohort chain
    ///
    /// The workload must carry an admission record; workloads without one
    /// have no flavor assignment and so nothing to charge. Re-adding a
    /// workload whose reservation is already accounted is a no-op, while
    /// a pending copy of the same key is replaced by the reserving one.
    ///
    /// # Arguments
    ///
    /// * `workload` - The workload to add
    pub fn add_workload(&mut self, workload: &Workload) -> bool {
        let Some(admission) = &workload.status.admission else {
            return false;
        };
        let key = workload.key();
        let lending = self.features.lending_limit;
        let Some(queue) = self.queues.get_mut(&admission.cluster_queue) else {
            return false;
        };
        if let Some(existing) = queue.workloads.get(&key) {
            if existing.has_quota_reservation() {
                return true;
            }
            queue.workloads.remove(&key);
        }
        queue.workloads.insert(key, workload.clone());
        let (usage, _) = queue.apply_usage(workload, 1, false);
        let deltas = cohorts::upward_deltas(&queue.node, &usage, 1, lending);
        let cohort = queue.spec.cohort.clone();
        cohorts::propagate_usage(&mut self.cohorts, cohort.as_ref(), deltas, lending);
        true
    }

    /// Charge or release raw usage against a queue and its cohort chain
    ///
    /// Used by the decision engines to try hypothetical placements
    /// without materializing a workload.
    ///
    /// # Arguments
    ///
    /// * `queue_name` - The queue to charge
    /// * `usage` - The usage to apply
    /// * `sign` - +1 to charge or -1 to release
    pub(crate) fn charge(&mut self, queue_name: &str, usage: &warden::models::Quantities, sign: i64) {
        let lending = self.features.lending_limit;
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        if sign > 0 {
            queue.node.usage.add_all(usage);
        } else {
            queue.node.usage.sub_all(usage);
        }
        let deltas = cohorts::upward_deltas(&queue.node, usage, sign, lending);
        let cohort = queue.spec.cohort.clone();
        cohorts::propagate_usage(&mut self.cohorts, cohort.as_ref(), deltas, lending);
    }

    /// Release a workload's usage and drop it from the snapshot
    ///
    /// Removing a workload that is not in the snapshot is a no-op.
    ///
    /// # Arguments
    ///
    /// * `queue_name` - The queue the workload was charged to
    /// * `key` - The workload's namespace/name key
    pub fn remove_workload(&mut self, queue_name: &str, key: &str) -> Option<Workload> {
        let lending = self.features.lending_limit;
        let queue = self.queues.get_mut(queue_name)?;
        let workload = queue.workloads.remove(key)?;
        // workloads deferred for topology accounting were never charged
        if workload.has_quota_reservation() && !queue.deferred_tas.contains(key) {
            let (usage, _) = queue.apply_usage(&workload, -1, false);
            let deltas = cohorts::upward_deltas(&queue.node, &usage, -1, lending);
            let cohort = queue.spec.cohort.clone();
            cohorts::propagate_usage(&mut self.cohorts, cohort.as_ref(), deltas, lending);
        }
        Some(workload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden::models::queues::{FlavorQuotas, ResourceGroup};
    use warden::models::workloads::{Admission, PodSet, PodSetAssignment};
    use warden::models::{ClusterQueue, CPU};

    /// build a snapshot with one standalone queue
    fn snapshot() -> Snapshot {
        let mut spec = ClusterQueue::new("queue-a");
        spec.resource_groups.push(ResourceGroup {
            covered: [CPU.to_string()].into_iter().collect(),
            flavors: vec![FlavorQuotas::new("default").quota(CPU, 4000)],
        });
        let mut snap = Snapshot::default();
        snap.queues.insert("queue-a".to_string(), QueueState::new(spec));
        snap
    }

    /// build a reserving workload bound to queue-a
    fn reserving(name: &str, cpu: i64) -> Workload {
        let mut wl = Workload::new("team-a", name, "main")
            .pod_set(PodSet::new("main", 1).request(CPU, cpu));
        wl.status.admission = Some(Admission {
            cluster_queue: "queue-a".into(),
            pod_set_assignments: vec![PodSetAssignment {
                name: "main".into(),
                flavors: [(CPU.to_string(), "default".to_string())].into_iter().collect(),
                count: 1,
            }],
        });
        wl
    }

    #[test]
    fn add_then_remove_is_bitwise_identity() {
        let mut snap = snapshot();
        let before = snap.clone();
        let wl = reserving("train", 3000);
        assert!(snap.add_workload(&wl));
        assert_ne!(snap, before);
        snap.remove_workload("queue-a", &wl.key());
        assert_eq!(snap, before);
    }

    #[test]
    fn repeated_add_and_remove_are_no_ops() {
        let mut snap = snapshot();
        let wl = reserving("train", 3000);
        assert!(snap.add_workload(&wl));
        let once = snap.clone();
        // a second add of the same key changes nothing
        assert!(snap.add_workload(&wl));
        assert_eq!(snap, once);
        snap.remove_workload("queue-a", &wl.key());
        let gone = snap.clone();
        assert!(snap.remove_workload("queue-a", &wl.key()).is_none());
        assert_eq!(snap, gone);
    }

    #[test]
    fn pending_workloads_are_rejected() {
        let mut snap = snapshot();
        let wl = Workload::new("team-a", "idle", "main");
        assert!(!snap.add_workload(&wl));
    }
}
