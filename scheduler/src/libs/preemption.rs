//! The preemption engine
//!
//! When flavor assignment says a workload fits the quota shape but not
//! the current usage, this engine picks a minimal set of victims to
//! evict: lower priority workloads in the same queue, and workloads in
//! borrowing sibling queues whose capacity can be reclaimed.

use chrono::{DateTime, Utc};
use tracing::{event, Level};
use warden::conf::{FairShareStrategy, RequeuingStrategy};
use warden::models::{PreemptionPolicy, Quantities, Workload};

use super::cache::cohorts;
use super::cache::snapshot::Snapshot;
use super::fairshare;

/// One workload selected for eviction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Victim {
    /// The victim's namespace/name key
    pub key: String,
    /// The cluster queue the victim is admitted in
    pub queue: String,
}

/// A candidate victim under consideration
#[derive(Debug, Clone)]
struct Candidate {
    /// The candidate's namespace/name key
    key: String,
    /// The cluster queue the candidate is admitted in
    queue: String,
    /// The candidate's priority
    priority: i32,
    /// When the candidate was granted its reservation
    admitted_at: DateTime<Utc>,
    /// Whether the candidate sits in a borrowing queue
    borrower: bool,
}

/// Select victims so the target workload would fit
///
/// The target must carry its desired admission so its demand is known,
/// and must not have been added to the snapshot yet. On success the
/// snapshot is left with the victims removed; on failure it is restored
/// untouched and no victim set is returned.
///
/// # Arguments
///
/// * `snap` - The snapshot to mutate
/// * `target` - The workload trying to get in
/// * `strategy` - The fair share guard strategy
/// * `requeuing` - How eligibility timestamps are derived
pub fn find_victims(
    snap: &mut Snapshot,
    target: &Workload,
    strategy: FairShareStrategy,
    requeuing: RequeuingStrategy,
) -> Option<Vec<Victim>> {
    let demand = target.usage();
    let Some(admission) = &target.status.admission else {
        return None;
    };
    let target_queue = admission.cluster_queue.clone();
    snap.queues.get(&target_queue)?;
    let fair_sharing = snap.features.fair_sharing;
    let mut candidates = collect_candidates(snap, target, &target_queue, &demand, requeuing);
    // reclaim victims first, then lowest priority, then newest
    candidates.sort_by(|a, b| {
        b.borrower
            .cmp(&a.borrower)
            .then(a.priority.cmp(&b.priority))
            .then(b.admitted_at.cmp(&a.admitted_at))
            .then(a.key.cmp(&b.key))
    });
    // greedily evict until the target fits
    let mut removed: Vec<Workload> = Vec::new();
    for candidate in candidates {
        if demand_fits(snap, &target_queue, &demand) {
            break;
        }
        if fair_sharing && candidate.queue != target_queue {
            if !fair_share_allows(snap, &target_queue, &candidate, &demand, strategy) {
                continue;
            }
        }
        if let Some(workload) = snap.remove_workload(&candidate.queue, &candidate.key) {
            removed.push(workload);
        }
    }
    if !demand_fits(snap, &target_queue, &demand) {
        // restore the snapshot, preemption failed with no side effects
        for workload in &removed {
            snap.add_workload(workload);
        }
        event!(
            Level::DEBUG,
            workload = target.key(),
            queue = target_queue,
            "no victim set can free enough capacity",
        );
        return None;
    }
    // prune victims that later picks made unnecessary
    let mut victims = Vec::with_capacity(removed.len());
    for workload in removed {
        snap.add_workload(&workload);
        let admission = workload.status.admission.as_ref().unwrap();
        if demand_fits(snap, &target_queue, &demand) {
            continue;
        }
        snap.remove_workload(&admission.cluster_queue, &workload.key());
        victims.push(Victim {
            key: workload.key(),
            queue: admission.cluster_queue.clone(),
        });
    }
    Some(victims)
}

/// Whether a demand fits a queue's available capacity right now
///
/// # Arguments
///
/// * `snap` - The snapshot to evaluate against
/// * `queue_name` - The queue the demand lands on
/// * `demand` - The demand per flavor/resource
pub fn demand_fits(snap: &Snapshot, queue_name: &str, demand: &Quantities) -> bool {
    let Some(queue) = snap.queues.get(queue_name) else {
        return false;
    };
    let lending = snap.features.lending_limit;
    demand
        .iter()
        .all(|(key, quantity)| quantity <= cohorts::available(&snap.cohorts, queue, key, lending))
}

/// Collect every workload the policies allow evicting
fn collect_candidates(
    snap: &Snapshot,
    target: &Workload,
    target_queue: &str,
    demand: &Quantities,
    requeuing: RequeuingStrategy,
) -> Vec<Candidate> {
    let Some(queue) = snap.queues.get(target_queue) else {
        return Vec::new();
    };
    let policy = queue.spec.preemption;
    let eligible_at = target.eligible_at(requeuing);
    let target_root = queue
        .spec
        .cohort
        .as_ref()
        .map(|cohort| cohorts::root_of(&snap.cohorts, cohort));
    let mut candidates = Vec::new();
    for (name, state) in &snap.queues {
        let same_queue = name == target_queue;
        if same_queue {
            // victims in the target's own queue, by the within queue policy
            for workload in state.workloads.values() {
                if !workload.has_quota_reservation() || workload.key() == target.key() {
                    continue;
                }
                let allowed = match policy.within_cluster_queue {
                    PreemptionPolicy::Never => false,
                    PreemptionPolicy::Any => true,
                    PreemptionPolicy::LowerPriority => workload.priority < target.priority,
                    PreemptionPolicy::LowerOrNewerEqualPriority => {
                        workload.priority < target.priority
                            || (workload.priority == target.priority
                                && workload.admitted_at() > eligible_at)
                    }
                };
                if allowed {
                    candidates.push(Candidate {
                        key: workload.key(),
                        queue: name.clone(),
                        priority: workload.priority,
                        admitted_at: workload.admitted_at(),
                        borrower: false,
                    });
                }
            }
            continue;
        }
        // reclaim candidates must share the cohort tree and be borrowing
        // one of the flavor/resources the target wants
        let Some(target_root) = &target_root else {
            continue;
        };
        let same_tree = state
            .spec
            .cohort
            .as_ref()
            .map(|cohort| cohorts::root_of(&snap.cohorts, cohort) == *target_root)
            .unwrap_or(false);
        if !same_tree {
            continue;
        }
        let borrowed_keys: Vec<_> =
            demand.keys().filter(|key| state.is_borrowing(key)).collect();
        if borrowed_keys.is_empty() {
            continue;
        }
        for workload in state.workloads.values() {
            if !workload.has_quota_reservation() {
                continue;
            }
            // evicting only helps if the victim holds a contended key
            let usage = workload.usage();
            if !borrowed_keys.iter().any(|key| usage.get(key) > 0) {
                continue;
            }
            let allowed = match policy.reclaim_within_cohort {
                PreemptionPolicy::Never => false,
                PreemptionPolicy::Any => true,
                PreemptionPolicy::LowerPriority => workload.priority < target.priority,
                PreemptionPolicy::LowerOrNewerEqualPriority => {
                    workload.priority < target.priority
                        || (workload.priority == target.priority
                            && workload.admitted_at() > eligible_at)
                }
            };
            if allowed {
                candidates.push(Candidate {
                    key: workload.key(),
                    queue: name.clone(),
                    priority: workload.priority,
                    admitted_at: workload.admitted_at(),
                    borrower: true,
                });
            }
        }
    }
    candidates
}

/// Whether the fair share guard lets a cross queue candidate be evicted
fn fair_share_allows(
    snap: &mut Snapshot,
    target_queue: &str,
    candidate: &Candidate,
    demand: &Quantities,
    strategy: FairShareStrategy,
) -> bool {
    let victim_before = fairshare::dominant_share(snap, &candidate.queue, None);
    // project both sides with the candidate hypothetically gone
    let Some(workload) = snap.remove_workload(&candidate.queue, &candidate.key) else {
        return false;
    };
    let preemptor_after = fairshare::dominant_share(snap, target_queue, Some(demand));
    let victim_after = fairshare::dominant_share(snap, &candidate.queue, None);
    snap.add_workload(&workload);
    match strategy {
        FairShareStrategy::LessThanOrEqualToFinalShare => {
            preemptor_after.value < victim_after.value
                || (preemptor_after.value == victim_after.value
                    && target_queue < candidate.queue.as_str())
        }
        FairShareStrategy::LessThanInitialShare => preemptor_after.value < victim_before.value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::cache::cohorts::CohortState;
    use crate::libs::cache::queues::QueueState;
    use warden::models::queues::{FlavorQuotas, PreemptionSpec, ResourceGroup};
    use warden::models::workloads::{Admission, ConditionType, PodSet, PodSetAssignment};
    use warden::models::{ClusterQueue, FlavorResource, CPU};

    /// build a snapshot with two queues sharing a cohort
    fn cohort_snapshot(preemption: PreemptionSpec) -> Snapshot {
        let mut snap = Snapshot::default();
        for name in ["queue-a", "queue-b"] {
            let mut spec = ClusterQueue::new(name);
            spec.cohort = Some("pool".to_string());
            spec.preemption = preemption;
            spec.resource_groups.push(ResourceGroup {
                covered: [CPU.to_string()].into_iter().collect(),
                flavors: vec![FlavorQuotas::new("default").quota(CPU, 4000)],
            });
            snap.queues.insert(name.to_string(), QueueState::new(spec));
        }
        let mut pool = CohortState::implicit("pool");
        pool.child_queues.insert("queue-a".to_string());
        pool.child_queues.insert("queue-b".to_string());
        snap.cohorts.insert("pool".to_string(), pool);
        cohorts::refresh_subtree(&mut snap.cohorts, &snap.queues, "pool", true);
        snap
    }

    /// build a reserving workload charged to a queue
    fn admitted(name: &str, queue: &str, cpu: i64, priority: i32) -> Workload {
        let mut wl = Workload::new("team-a", name, "main")
            .pod_set(PodSet::new("main", 1).request(CPU, cpu))
            .priority(priority);
        wl.status.admission = Some(Admission {
            cluster_queue: queue.into(),
            pod_set_assignments: vec![PodSetAssignment {
                name: "main".into(),
                flavors: [(CPU.to_string(), "default".to_string())].into_iter().collect(),
                count: 1,
            }],
        });
        wl.set_condition(ConditionType::QuotaReserved, true, "Reserved", "quota granted");
        wl
    }

    /// the default strategies used by most tests
    fn run(snap: &mut Snapshot, target: &Workload) -> Option<Vec<Victim>> {
        find_victims(
            snap,
            target,
            FairShareStrategy::LessThanOrEqualToFinalShare,
            RequeuingStrategy::CreationTimestamp,
        )
    }

    #[test]
    fn reclaims_from_borrowing_sibling() {
        let policy = PreemptionSpec {
            within_cluster_queue: PreemptionPolicy::Never,
            reclaim_within_cohort: PreemptionPolicy::Any,
        };
        let mut snap = cohort_snapshot(policy);
        // queue-a borrows deep into queue-b's nominal
        let borrower = admitted("greedy", "queue-a", 7000, 0);
        snap.add_workload(&borrower);
        let target = admitted("reclaim", "queue-b", 4000, 1);
        let victims = run(&mut snap, &target).expect("expected a victim set");
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].key, borrower.key());
        assert_eq!(victims[0].queue, "queue-a");
        // the snapshot is left with the victim removed
        assert!(snap.queues["queue-a"].workloads.is_empty());
        assert!(demand_fits(&snap, "queue-b", &target.usage()));
    }

    #[test]
    fn empty_pool_fails_without_side_effects() {
        let policy = PreemptionSpec {
            within_cluster_queue: PreemptionPolicy::Never,
            reclaim_within_cohort: PreemptionPolicy::Never,
        };
        let mut snap = cohort_snapshot(policy);
        let borrower = admitted("greedy", "queue-a", 7000, 0);
        snap.add_workload(&borrower);
        let before = snap.clone();
        let target = admitted("reclaim", "queue-b", 4000, 1);
        assert!(run(&mut snap, &target).is_none());
        assert_eq!(snap, before);
    }

    /// build a snapshot with a single standalone queue
    fn standalone_snapshot(preemption: PreemptionSpec) -> Snapshot {
        let mut spec = ClusterQueue::new("queue-a");
        spec.preemption = preemption;
        spec.resource_groups.push(ResourceGroup {
            covered: [CPU.to_string()].into_iter().collect(),
            flavors: vec![FlavorQuotas::new("default").quota(CPU, 4000)],
        });
        let mut snap = Snapshot::default();
        snap.queues.insert("queue-a".to_string(), QueueState::new(spec));
        snap
    }

    #[test]
    fn within_queue_respects_priority_policy() {
        let policy = PreemptionSpec {
            within_cluster_queue: PreemptionPolicy::LowerPriority,
            reclaim_within_cohort: PreemptionPolicy::Never,
        };
        let mut snap = standalone_snapshot(policy);
        let low = admitted("low", "queue-a", 4000, 0);
        snap.add_workload(&low);
        // an equal priority target may not evict it
        let peer = admitted("peer", "queue-a", 4000, 0);
        assert!(run(&mut snap, &peer).is_none());
        // a higher priority target may
        let high = admitted("high", "queue-a", 4000, 5);
        let victims = run(&mut snap, &high).expect("expected a victim set");
        assert_eq!(victims[0].key, low.key());
    }

    #[test]
    fn prunes_unneeded_victims() {
        let policy = PreemptionSpec {
            within_cluster_queue: PreemptionPolicy::LowerPriority,
            reclaim_within_cohort: PreemptionPolicy::Never,
        };
        let mut snap = standalone_snapshot(policy);
        // two small victims and one big one that sorts first on priority;
        // evicting the big one alone is enough for the target
        let small_a = admitted("small-a", "queue-a", 1000, 1);
        let small_b = admitted("small-b", "queue-a", 1000, 1);
        let big = admitted("big", "queue-a", 2000, 0);
        snap.add_workload(&small_a);
        snap.add_workload(&small_b);
        snap.add_workload(&big);
        let target = admitted("target", "queue-a", 2000, 5);
        let victims = run(&mut snap, &target).expect("expected a victim set");
        // the minimal cover is a single victim freeing 2000
        assert_eq!(victims, vec![Victim { key: big.key(), queue: "queue-a".to_string() }]);
    }

    #[test]
    fn fair_share_guard_blocks_unfair_reclaim() {
        let policy = PreemptionSpec {
            within_cluster_queue: PreemptionPolicy::Never,
            reclaim_within_cohort: PreemptionPolicy::Any,
        };
        let mut snap = cohort_snapshot(policy);
        snap.features.fair_sharing = true;
        // queue-b barely borrows while queue-a wants to grab far more
        let modest = admitted("modest", "queue-b", 4100, 0);
        snap.add_workload(&modest);
        let greedy = admitted("greedy", "queue-a", 8000, 1);
        assert!(run(&mut snap, &greedy).is_none());
        // the snapshot was restored
        assert_eq!(snap.queues["queue-b"].workloads.len(), 1);
        assert_eq!(
            snap.queues["queue-b"].node.usage.get(&FlavorResource::new("default", CPU)),
            4100
        );
    }
}
