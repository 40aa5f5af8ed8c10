//! The flavor assignment engine
//!
//! For a pending workload the engine walks each resource group's flavor
//! list in declaration order and decides, per pod set, which flavor can
//! carry each covered resource and whether that takes borrowing or
//! preemption. All arithmetic is exact integer millicore math.

use std::collections::BTreeMap;

use tracing::{event, Level};
use warden::models::workloads::{Admission, PodSet, PodSetAssignment};
use warden::models::{FlavorName, FlavorResource, Quantities, ResourceName, Workload};

use super::cache::cohorts;
use super::cache::queues::QueueState;
use super::cache::snapshot::Snapshot;

/// How a workload can land on a flavor set, from worst to best
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AssignmentMode {
    /// No flavor can carry the demand even with preemption
    NoFit,
    /// The demand fits the quota shape but needs victims evicted first
    Preempt,
    /// The demand fits the available capacity outright
    Fit,
}

/// Why a pod set could not be assigned, from least to most informative
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum NoFitReason {
    /// The demand would need preemption but policy forbids it
    PreemptionDisallowed(String),
    /// No flavor has enough quota for the demand
    InsufficientQuota(String),
    /// A requested resource is covered by no resource group
    ResourceNotCovered(String),
    /// A referenced flavor is not in the cache
    MissingFlavor(String),
}

impl NoFitReason {
    /// The human readable message for this reason
    fn message(&self) -> &str {
        match self {
            NoFitReason::PreemptionDisallowed(msg)
            | NoFitReason::InsufficientQuota(msg)
            | NoFitReason::ResourceNotCovered(msg)
            | NoFitReason::MissingFlavor(msg) => msg,
        }
    }
}

/// The flavors and pod count chosen for one pod set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodSetPlan {
    /// The pod set this plan is for
    pub name: String,
    /// The flavor chosen for each requested resource
    pub flavors: BTreeMap<ResourceName, FlavorName>,
    /// The pod count this plan admits
    pub count: u32,
    /// Whether this plan draws on cohort capacity beyond nominal
    pub borrows: bool,
}

/// The engine's answer for a whole workload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentPlan {
    /// The plan for each pod set, in pod set order
    pub pod_sets: Vec<PodSetPlan>,
    /// The worst mode across pod sets
    pub mode: Option<AssignmentMode>,
    /// Whether any pod set borrows
    pub borrows: bool,
    /// Why the workload cannot be scheduled, when mode is NoFit
    pub reason: String,
}

impl AssignmentPlan {
    /// Build the admission record this plan describes
    ///
    /// # Arguments
    ///
    /// * `queue` - The cluster queue the workload lands on
    pub fn admission(&self, queue: &str) -> Admission {
        Admission {
            cluster_queue: queue.to_owned(),
            pod_set_assignments: self
                .pod_sets
                .iter()
                .map(|plan| PodSetAssignment {
                    name: plan.name.clone(),
                    flavors: plan.flavors.clone(),
                    count: plan.count,
                })
                .collect(),
        }
    }

    /// The usage this plan would charge, given the workload's requests
    ///
    /// # Arguments
    ///
    /// * `workload` - The workload this plan assigns
    pub fn usage(&self, workload: &Workload) -> Quantities {
        let mut usage = Quantities::new();
        for plan in &self.pod_sets {
            let Some(pod_set) = workload.pod_sets.iter().find(|ps| ps.name == plan.name) else {
                continue;
            };
            for (resource, flavor) in &plan.flavors {
                let per_pod = pod_set.requests.get(resource).copied().unwrap_or(0);
                let key = FlavorResource::new(flavor.clone(), resource.clone());
                usage.add(&key, per_pod * i64::from(plan.count));
            }
        }
        usage
    }
}

/// Compute a flavor assignment for a pending workload
///
/// Pod sets are evaluated in order and each tentatively charges the
/// snapshot so later pod sets see its demand; all tentative usage is
/// rolled back before returning.
///
/// # Arguments
///
/// * `snap` - The snapshot to decide against
/// * `queue_name` - The cluster queue the workload targets
/// * `workload` - The pending workload
pub fn assign(snap: &mut Snapshot, queue_name: &str, workload: &Workload) -> AssignmentPlan {
    let partial = snap.features.partial_admission;
    let mut plans = Vec::with_capacity(workload.pod_sets.len());
    let mut reasons: Vec<NoFitReason> = Vec::new();
    let mut mode: Option<AssignmentMode> = None;
    // (queue, usage) charges to roll back before returning
    let mut tentative: Vec<Quantities> = Vec::new();
    for pod_set in &workload.pod_sets {
        let outcome = assign_pod_set(snap, queue_name, pod_set, partial);
        match outcome {
            Ok((plan, set_mode)) => {
                // charge this pod set so its siblings contend with it
                let usage = pod_set_usage(pod_set, &plan);
                snap.charge(queue_name, &usage, 1);
                tentative.push(usage);
                mode = Some(mode.map_or(set_mode, |current| current.min(set_mode)));
                plans.push(plan);
            }
            Err(reason) => {
                event!(
                    Level::DEBUG,
                    workload = workload.key(),
                    pod_set = pod_set.name,
                    reason = reason.message(),
                );
                reasons.push(reason);
                mode = Some(AssignmentMode::NoFit);
            }
        }
    }
    // roll the tentative charges back, the caller owns real mutations
    for usage in &tentative {
        snap.charge(queue_name, usage, -1);
    }
    if mode == Some(AssignmentMode::NoFit) {
        // surface the most informative reason
        reasons.sort();
        let reason = reasons
            .last()
            .map(|reason| reason.message().to_owned())
            .unwrap_or_else(|| "no pod sets requested any resources".to_owned());
        return AssignmentPlan {
            pod_sets: Vec::new(),
            mode,
            borrows: false,
            reason,
        };
    }
    AssignmentPlan {
        borrows: plans.iter().any(|plan| plan.borrows),
        pod_sets: plans,
        mode,
        reason: String::new(),
    }
}

/// The usage one pod set plan charges
fn pod_set_usage(pod_set: &PodSet, plan: &PodSetPlan) -> Quantities {
    let mut usage = Quantities::new();
    for (resource, flavor) in &plan.flavors {
        let per_pod = pod_set.requests.get(resource).copied().unwrap_or(0);
        let key = FlavorResource::new(flavor.clone(), resource.clone());
        usage.add(&key, per_pod * i64::from(plan.count));
    }
    usage
}

/// Assign one pod set, shrinking it if partial admission allows
fn assign_pod_set(
    snap: &Snapshot,
    queue_name: &str,
    pod_set: &PodSet,
    partial: bool,
) -> Result<(PodSetPlan, AssignmentMode), NoFitReason> {
    match evaluate(snap, queue_name, pod_set, pod_set.count) {
        Ok((flavors, mode, borrows)) => Ok((
            PodSetPlan {
                name: pod_set.name.clone(),
                flavors,
                count: pod_set.count,
                borrows,
            },
            mode,
        )),
        Err(reason) => {
            // try the largest reduced count the quota can still take
            let Some(min_count) = pod_set.min_count.filter(|_| partial) else {
                return Err(reason);
            };
            let Some(count) = largest_fitting_count(snap, queue_name, pod_set, min_count) else {
                return Err(reason);
            };
            match evaluate(snap, queue_name, pod_set, count) {
                Ok((flavors, mode, borrows)) => Ok((
                    PodSetPlan {
                        name: pod_set.name.clone(),
                        flavors,
                        count,
                        borrows,
                    },
                    mode,
                )),
                Err(reason) => Err(reason),
            }
        }
    }
}

/// Binary search the largest pod count that still gets an assignment
///
/// # Arguments
///
/// * `snap` - The snapshot to decide against
/// * `queue_name` - The cluster queue the workload targets
/// * `pod_set` - The pod set being shrunk
/// * `min_count` - The fewest pods the set can run with
fn largest_fitting_count(
    snap: &Snapshot,
    queue_name: &str,
    pod_set: &PodSet,
    min_count: u32,
) -> Option<u32> {
    let admissible =
        |count: u32| evaluate(snap, queue_name, pod_set, count).is_ok();
    if !admissible(min_count) {
        return None;
    }
    let mut low = min_count;
    let mut high = pod_set.count;
    while low < high {
        let mid = low + (high - low).div_ceil(2);
        if admissible(mid) {
            low = mid;
        } else {
            high = mid - 1;
        }
    }
    Some(low)
}

/// Evaluate one pod set at a fixed count
///
/// Returns the chosen flavor per resource, the mode, and whether the
/// choice borrows.
fn evaluate(
    snap: &Snapshot,
    queue_name: &str,
    pod_set: &PodSet,
    count: u32,
) -> Result<(BTreeMap<ResourceName, FlavorName>, AssignmentMode, bool), NoFitReason> {
    let Some(queue) = snap.queues.get(queue_name) else {
        return Err(NoFitReason::InsufficientQuota(format!(
            "cluster queue {queue_name} is not in the snapshot"
        )));
    };
    let mut flavors = BTreeMap::new();
    let mut mode = AssignmentMode::Fit;
    let mut borrows = false;
    let mut covered: Vec<&ResourceName> = Vec::new();
    // pick a flavor per resource group
    for group in &queue.spec.resource_groups {
        let requested: Vec<(&ResourceName, i64)> = pod_set
            .requests
            .iter()
            .filter(|(resource, _)| group.covered.contains(*resource))
            .map(|(resource, per_pod)| (resource, *per_pod))
            .collect();
        if requested.is_empty() {
            continue;
        }
        covered.extend(requested.iter().map(|(resource, _)| *resource));
        let (flavor, group_mode, group_borrows) =
            pick_flavor(snap, queue, group, &requested, count)?;
        for (resource, _) in &requested {
            flavors.insert((*resource).clone(), flavor.clone());
        }
        mode = mode.min(group_mode);
        borrows |= group_borrows;
    }
    // resources covered by no group cannot be admitted at all
    for resource in pod_set.requests.keys() {
        if !covered.contains(&resource) {
            return Err(NoFitReason::ResourceNotCovered(format!(
                "resource {resource} is not covered by any resource group"
            )));
        }
    }
    Ok((flavors, mode, borrows))
}

/// Pick the first acceptable flavor of one resource group
fn pick_flavor(
    snap: &Snapshot,
    queue: &QueueState,
    group: &warden::models::ResourceGroup,
    requested: &[(&ResourceName, i64)],
    count: u32,
) -> Result<(FlavorName, AssignmentMode, bool), NoFitReason> {
    let lending = snap.features.lending_limit;
    let fungibility = queue.spec.flavor_fungibility;
    let preemption = queue.spec.preemption;
    let preemption_possible = preemption.within_cluster_queue
        != warden::models::PreemptionPolicy::Never
        || preemption.reclaim_within_cohort != warden::models::PreemptionPolicy::Never;
    // the best fallback seen so far and the most informative failure
    let mut fallback: Option<(FlavorName, AssignmentMode, bool)> = None;
    let mut failure: Option<NoFitReason> = None;
    for flavor_quotas in &group.flavors {
        if !snap.flavors.contains_key(&flavor_quotas.name) {
            let reason = NoFitReason::MissingFlavor(format!(
                "resource flavor {} was not found",
                flavor_quotas.name
            ));
            failure = failure.max(Some(reason));
            continue;
        }
        let mut flavor_mode = AssignmentMode::Fit;
        let mut flavor_borrows = false;
        for (resource, per_pod) in requested {
            let demand = per_pod * i64::from(count);
            let key = FlavorResource::new(flavor_quotas.name.clone(), (*resource).clone());
            let headroom = cohorts::available(&snap.cohorts, queue, &key, lending);
            if demand <= headroom {
                // still a fit, but note when it dips into the cohort
                if queue.node.usage.get(&key) + demand > queue.node.nominal(&key) {
                    flavor_borrows = true;
                }
                continue;
            }
            let potential = cohorts::potential_available(&snap.cohorts, queue, &key, lending);
            if demand <= potential && preemption_possible {
                flavor_mode = flavor_mode.min(AssignmentMode::Preempt);
            } else if demand <= potential {
                flavor_mode = AssignmentMode::NoFit;
                let reason = NoFitReason::PreemptionDisallowed(format!(
                    "flavor {} could fit {resource} only by preempting, which policy forbids",
                    flavor_quotas.name
                ));
                failure = failure.max(Some(reason));
                break;
            } else {
                flavor_mode = AssignmentMode::NoFit;
                let reason = NoFitReason::InsufficientQuota(format!(
                    "insufficient quota for {resource} on flavor {} ({demand} requested, {headroom} available)",
                    flavor_quotas.name
                ));
                failure = failure.max(Some(reason));
                break;
            }
        }
        match flavor_mode {
            AssignmentMode::Fit if !flavor_borrows => {
                return Ok((flavor_quotas.name.clone(), AssignmentMode::Fit, false));
            }
            AssignmentMode::Fit => {
                // borrowing fit: take it now or keep it while scanning for
                // a borrow free flavor later in the list
                if fungibility.when_can_borrow == warden::models::WhenCanBorrow::Borrow {
                    return Ok((flavor_quotas.name.clone(), AssignmentMode::Fit, true));
                }
                if fallback.as_ref().map(|(_, mode, _)| *mode < AssignmentMode::Fit).unwrap_or(true) {
                    fallback = Some((flavor_quotas.name.clone(), AssignmentMode::Fit, true));
                }
            }
            AssignmentMode::Preempt => {
                // preempt here immediately or remember it as a last resort
                if fungibility.when_can_preempt == warden::models::WhenCanPreempt::Preempt
                    && fallback.is_none()
                {
                    return Ok((flavor_quotas.name.clone(), AssignmentMode::Preempt, flavor_borrows));
                }
                if fallback.is_none() {
                    fallback = Some((flavor_quotas.name.clone(), AssignmentMode::Preempt, flavor_borrows));
                }
            }
            AssignmentMode::NoFit => {}
        }
    }
    match fallback {
        Some(choice) => Ok(choice),
        None => Err(failure.unwrap_or_else(|| {
            NoFitReason::InsufficientQuota("the resource group has no usable flavors".to_owned())
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::cache::cohorts::CohortState;
    use warden::models::queues::{FlavorQuotas, ResourceGroup, ResourceQuota, WhenCanBorrow};
    use warden::models::{ClusterQueue, PreemptionPolicy, ResourceFlavor, CPU};

    /// build a one queue snapshot with the given flavors in one group
    fn snapshot_with(flavors: Vec<FlavorQuotas>) -> Snapshot {
        let mut spec = ClusterQueue::new("queue-a");
        spec.cohort = Some("pool".to_string());
        spec.resource_groups.push(ResourceGroup {
            covered: [CPU.to_string()].into_iter().collect(),
            flavors,
        });
        let mut snap = Snapshot::default();
        for quota in &spec.resource_groups[0].flavors {
            snap.flavors.insert(quota.name.clone(), ResourceFlavor::new(quota.name.clone()));
        }
        snap.queues.insert("queue-a".to_string(), QueueState::new(spec));
        let mut pool = CohortState::implicit("pool");
        pool.child_queues.insert("queue-a".to_string());
        snap.cohorts.insert("pool".to_string(), pool);
        cohorts::refresh_subtree(&mut snap.cohorts, &snap.queues, "pool", true);
        snap
    }

    /// build a pending workload with one pod set
    fn pending(count: u32, cpu: i64) -> Workload {
        Workload::new("team-a", "train", "main")
            .pod_set(PodSet::new("main", count).request(CPU, cpu))
    }

    #[test]
    fn exact_nominal_demand_fits() {
        let mut snap = snapshot_with(vec![FlavorQuotas::new("default").quota(CPU, 4000)]);
        let plan = assign(&mut snap, "queue-a", &pending(4, 1000));
        assert_eq!(plan.mode, Some(AssignmentMode::Fit));
        assert!(!plan.borrows);
        assert_eq!(plan.pod_sets[0].flavors[CPU], "default");
    }

    #[test]
    fn one_millicore_over_with_zero_borrowing_is_nofit() {
        let quota = ResourceQuota {
            nominal: 4000,
            borrowing_limit: Some(0),
            lending_limit: None,
        };
        let mut snap = snapshot_with(vec![FlavorQuotas::new("default").full_quota(CPU, quota)]);
        let plan = assign(&mut snap, "queue-a", &pending(1, 4001));
        assert_eq!(plan.mode, Some(AssignmentMode::NoFit));
        assert!(plan.reason.contains("insufficient quota"));
    }

    #[test]
    fn try_next_flavor_prefers_borrow_free_fit() {
        // queue-a owns 1000 of spot; a sibling lends 4000 more, so spot
        // can fit the demand but only by borrowing
        let mut snap = snapshot_with(vec![
            FlavorQuotas::new("spot").quota(CPU, 1000),
            FlavorQuotas::new("on-demand").quota(CPU, 4000),
        ]);
        let mut sibling = ClusterQueue::new("queue-b");
        sibling.cohort = Some("pool".to_string());
        sibling.resource_groups.push(ResourceGroup {
            covered: [CPU.to_string()].into_iter().collect(),
            flavors: vec![FlavorQuotas::new("spot").quota(CPU, 4000)],
        });
        snap.queues.insert("queue-b".to_string(), QueueState::new(sibling));
        snap.cohorts.get_mut("pool").unwrap().child_queues.insert("queue-b".to_string());
        cohorts::refresh_subtree(&mut snap.cohorts, &snap.queues, "pool", true);
        snap.queues.get_mut("queue-a").unwrap().spec.flavor_fungibility.when_can_borrow =
            WhenCanBorrow::TryNextFlavor;
        let plan = assign(&mut snap, "queue-a", &pending(2, 1000));
        assert_eq!(plan.mode, Some(AssignmentMode::Fit));
        assert_eq!(plan.pod_sets[0].flavors[CPU], "on-demand");
        assert!(!plan.borrows);
        // the default policy takes the borrowing fit right away
        snap.queues.get_mut("queue-a").unwrap().spec.flavor_fungibility.when_can_borrow =
            WhenCanBorrow::Borrow;
        let plan = assign(&mut snap, "queue-a", &pending(2, 1000));
        assert_eq!(plan.pod_sets[0].flavors[CPU], "spot");
        assert!(plan.borrows);
    }

    #[test]
    fn preempt_mode_requires_policy() {
        let mut snap = snapshot_with(vec![FlavorQuotas::new("default").quota(CPU, 4000)]);
        // saturate the queue so new demand could only preempt
        let usage: Quantities =
            [(FlavorResource::new("default", CPU), 4000)].into_iter().collect();
        snap.charge("queue-a", &usage, 1);
        let plan = assign(&mut snap, "queue-a", &pending(1, 1000));
        assert_eq!(plan.mode, Some(AssignmentMode::NoFit));
        assert!(plan.reason.contains("policy forbids"));
        // with a preemption policy the same demand becomes Preempt
        snap.queues.get_mut("queue-a").unwrap().spec.preemption.within_cluster_queue =
            PreemptionPolicy::LowerPriority;
        let plan = assign(&mut snap, "queue-a", &pending(1, 1000));
        assert_eq!(plan.mode, Some(AssignmentMode::Preempt));
    }

    #[test]
    fn partial_admission_shrinks_to_largest_fit() {
        let mut snap = snapshot_with(vec![FlavorQuotas::new("default").quota(CPU, 4000)]);
        snap.features.partial_admission = true;
        let mut wl = pending(8, 1000);
        wl.pod_sets[0].min_count = Some(2);
        let plan = assign(&mut snap, "queue-a", &wl);
        assert_eq!(plan.mode, Some(AssignmentMode::Fit));
        assert_eq!(plan.pod_sets[0].count, 4);
    }

    #[test]
    fn uncovered_resources_are_rejected() {
        let mut snap = snapshot_with(vec![FlavorQuotas::new("default").quota(CPU, 4000)]);
        let wl = Workload::new("team-a", "train", "main")
            .pod_set(PodSet::new("main", 1).request("nvidia.com/gpu", 1));
        let plan = assign(&mut snap, "queue-a", &wl);
        assert_eq!(plan.mode, Some(AssignmentMode::NoFit));
        assert!(plan.reason.contains("not covered"));
    }

    #[test]
    fn later_pod_sets_contend_with_earlier_ones() {
        let mut snap = snapshot_with(vec![FlavorQuotas::new("default").quota(CPU, 4000)]);
        let wl = Workload::new("team-a", "train", "main")
            .pod_set(PodSet::new("driver", 1).request(CPU, 3000))
            .pod_set(PodSet::new("workers", 1).request(CPU, 3000));
        let before = snap.clone();
        let plan = assign(&mut snap, "queue-a", &wl);
        // together the pod sets exceed quota even though each alone fits
        assert_eq!(plan.mode, Some(AssignmentMode::NoFit));
        // and the tentative charges were rolled back
        assert_eq!(snap, before);
    }
}
