//! The internal cluster queue state tracked by the cache

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{event, Level};
use warden::models::{
    ActiveReason, AdmissionCheck, ClusterQueue, ClusterQueueStatus, FlavorName, FlavorResource,
    LocalQueue, Quantities, ResourceFlavor, Topology, Workload,
};
use warden::Features;

use super::node::ResourceNode;

/// The usage counters a local queue carries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalQueueCounts {
    /// How many workloads from this queue hold a reservation
    pub reserving: i64,
    /// How many workloads from this queue are admitted
    pub admitted: i64,
    /// The usage reserved by this queue's workloads
    pub usage: Quantities,
    /// The usage of this queue's admitted workloads
    pub admitted_usage: Quantities,
}

impl LocalQueueCounts {
    /// Apply one workload's usage to these counters
    ///
    /// # Arguments
    ///
    /// * `usage` - The workload's usage
    /// * `admitted` - Whether the workload is admitted
    /// * `sign` - +1 to charge or -1 to release
    pub fn apply(&mut self, usage: &Quantities, admitted: bool, sign: i64) {
        if sign > 0 {
            self.reserving += 1;
            self.usage.add_all(usage);
            if admitted {
                self.admitted += 1;
                self.admitted_usage.add_all(usage);
            }
        } else {
            self.reserving = (self.reserving - 1).max(0);
            self.usage.sub_all(usage);
            if admitted {
                self.admitted = (self.admitted - 1).max(0);
                self.admitted_usage.sub_all(usage);
            }
        }
    }
}

/// The internal state of one cluster queue
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueState {
    /// The observed spec of this queue
    pub spec: ClusterQueue,
    /// This queue's quota and usage ledger
    pub node: ResourceNode,
    /// The usage of admitted workloads only
    pub admitted_usage: Quantities,
    /// How many workloads are admitted
    pub admitted_count: i64,
    /// Every workload assigned to this queue, pending or reserving
    pub workloads: HashMap<String, Workload>,
    /// The derived readiness of this queue
    pub status: ClusterQueueStatus,
    /// Bumped whenever more capacity could be allocatable, so stale
    /// scheduling attempts can be recognized
    pub generation: u64,
    /// Whether the cohort chain above this queue holds a rejected cycle
    pub cohort_cycle: bool,
    /// The counters for each local queue feeding this queue
    pub local_queues: HashMap<String, LocalQueueCounts>,
    /// Referenced flavors the cache has never seen
    pub missing_flavors: Vec<FlavorName>,
    /// Referenced checks the cache has never seen
    pub missing_checks: Vec<String>,
    /// Referenced checks that are inactive
    pub inactive_checks: Vec<String>,
    /// Referenced multikueue checks
    pub multikueue_checks: Vec<String>,
    /// Multikueue checks scoped to individual flavors
    pub per_flavor_multikueue_checks: Vec<String>,
    /// Referenced provisioning checks
    pub provisioning_checks: Vec<String>,
    /// Single instance controllers referenced by more than one check
    pub multi_single_instance_checks: BTreeMap<String, Vec<String>>,
    /// Flavor independent checks scoped to individual flavors
    pub flavor_independent_per_flavor: Vec<String>,
    /// The topology each referenced flavor takes part in
    pub tas_flavors: BTreeMap<FlavorName, String>,
    /// Topologies referenced by flavors but never observed
    pub missing_topologies: Vec<String>,
    /// Workloads on topology flavors whose placement cache is not synced
    /// yet, so their usage is not accounted
    pub deferred_tas: BTreeSet<String>,
}

impl QueueState {
    /// Create the internal state for a newly observed queue
    ///
    /// # Arguments
    ///
    /// * `spec` - The observed queue spec
    pub fn new(spec: ClusterQueue) -> Self {
        let mut state = QueueState {
            node: ResourceNode::from_specs(
                spec.resource_groups.iter().flat_map(|group| group.flavors.iter()),
            ),
            spec,
            ..QueueState::default()
        };
        state.node.reset_subtree();
        state
    }

    /// Replace this queue's spec, rederiving quotas
    ///
    /// Returns true if the resource shape changed, which obliges the
    /// caller to bump generations and recompute subtree totals.
    ///
    /// # Arguments
    ///
    /// * `spec` - The new queue spec
    pub fn refresh_spec(&mut self, spec: ClusterQueue) -> bool {
        let quotas = ResourceNode::from_specs(
            spec.resource_groups.iter().flat_map(|group| group.flavors.iter()),
        )
        .quotas;
        let changed =
            self.generation == 0 || quotas != self.node.quotas || spec.resource_groups != self.spec.resource_groups;
        self.node.quotas = quotas;
        self.node.reset_subtree();
        self.spec = spec;
        changed
    }

    /// Whether this queue can admit workloads
    pub fn is_active(&self) -> bool {
        self.status == ClusterQueueStatus::Active
    }

    /// Whether this queue is borrowing for a flavor/resource
    ///
    /// # Arguments
    ///
    /// * `key` - The flavor/resource to check
    pub fn is_borrowing(&self, key: &FlavorResource) -> bool {
        self.node.usage.get(key) > self.node.nominal(key)
    }

    /// Recompute which referenced flavors, topologies, and checks are
    /// missing or misconfigured
    ///
    /// # Arguments
    ///
    /// * `flavors` - The flavors the cache knows
    /// * `topologies` - The topologies the cache knows
    /// * `checks` - The admission checks the cache knows
    /// * `features` - The runtime feature flags
    pub fn refresh_validation(
        &mut self,
        flavors: &HashMap<FlavorName, ResourceFlavor>,
        topologies: &HashMap<String, Topology>,
        checks: &HashMap<String, AdmissionCheck>,
        features: &Features,
    ) {
        // rescan the referenced flavors
        self.missing_flavors.clear();
        self.tas_flavors.clear();
        self.missing_topologies.clear();
        for name in self.spec.flavor_names() {
            match flavors.get(name) {
                Some(flavor) => {
                    if let Some(topology) = &flavor.topology {
                        self.tas_flavors.insert(name.clone(), topology.clone());
                        if features.topology_aware_scheduling && !topologies.contains_key(topology) {
                            self.missing_topologies.push(topology.clone());
                        }
                    }
                }
                None => self.missing_flavors.push(name.clone()),
            }
        }
        self.missing_flavors.sort();
        self.missing_flavors.dedup();
        self.missing_topologies.sort();
        self.missing_topologies.dedup();
        // rescan the referenced checks
        self.missing_checks.clear();
        self.inactive_checks.clear();
        self.multikueue_checks.clear();
        self.per_flavor_multikueue_checks.clear();
        self.provisioning_checks.clear();
        self.multi_single_instance_checks.clear();
        self.flavor_independent_per_flavor.clear();
        let mut per_controller: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut single_instance: BTreeSet<String> = BTreeSet::new();
        for check_ref in &self.spec.admission_checks {
            let Some(check) = checks.get(&check_ref.name) else {
                self.missing_checks.push(check_ref.name.clone());
                continue;
            };
            if !check.active {
                self.inactive_checks.push(check_ref.name.clone());
            }
            per_controller.entry(check.controller.clone()).or_default().push(check_ref.name.clone());
            if check.single_instance_in_cluster_queue {
                single_instance.insert(check.controller.clone());
            }
            if check.flavor_independent && !check_ref.flavors.is_empty() {
                self.flavor_independent_per_flavor.push(check_ref.name.clone());
            }
            if check.is_provisioning() {
                self.provisioning_checks.push(check_ref.name.clone());
            }
            if check.is_multikueue() {
                self.multikueue_checks.push(check_ref.name.clone());
                if !check_ref.flavors.is_empty() {
                    self.per_flavor_multikueue_checks.push(check_ref.name.clone());
                }
            }
        }
        self.missing_checks.sort();
        self.inactive_checks.sort();
        self.multikueue_checks.sort();
        self.per_flavor_multikueue_checks.sort();
        self.provisioning_checks.sort();
        self.flavor_independent_per_flavor.sort();
        // only controllers with two or more single instance checks violate
        per_controller.retain(|controller, names| names.len() > 1 && single_instance.contains(controller));
        for names in per_controller.values_mut() {
            names.sort();
        }
        // the single instance and flavor independent rules are opt-in
        if features.admission_check_validation_rules {
            self.multi_single_instance_checks = per_controller;
        } else {
            self.flavor_independent_per_flavor.clear();
        }
    }

    /// Whether topology aware scheduling rules out admission here
    ///
    /// # Arguments
    ///
    /// * `features` - The runtime feature flags
    fn tas_violated(&self, features: &Features) -> bool {
        if !features.topology_aware_scheduling || self.tas_flavors.is_empty() {
            return false;
        }
        !self.multikueue_checks.is_empty()
            || !self.provisioning_checks.is_empty()
            || !self.missing_topologies.is_empty()
    }

    /// Rederive this queue's readiness from its validation scratch state
    ///
    /// Terminating is sticky: a deleted queue stays terminating until it
    /// drains no matter what else changes.
    ///
    /// # Arguments
    ///
    /// * `features` - The runtime feature flags
    pub fn refresh_status(&mut self, features: &Features) {
        if self.status == ClusterQueueStatus::Terminating {
            return;
        }
        let pending = self.spec.is_stopped()
            || !self.missing_flavors.is_empty()
            || !self.missing_checks.is_empty()
            || !self.inactive_checks.is_empty()
            || !self.multi_single_instance_checks.is_empty()
            || !self.flavor_independent_per_flavor.is_empty()
            || self.tas_violated(features)
            || self.multikueue_checks.len() > 1
            || !self.per_flavor_multikueue_checks.is_empty()
            || self.cohort_cycle;
        let status = if pending { ClusterQueueStatus::Pending } else { ClusterQueueStatus::Active };
        if status != self.status {
            event!(
                Level::DEBUG,
                queue = self.spec.name,
                old_status = ?self.status,
                new_status = ?status,
            );
            self.status = status;
        }
    }

    /// The readiness of this queue with a reason code and a message that
    /// enumerates every cause in a deterministic order
    ///
    /// # Arguments
    ///
    /// * `features` - The runtime feature flags
    pub fn readiness(&self, features: &Features) -> (ClusterQueueStatus, ActiveReason, String) {
        match self.status {
            ClusterQueueStatus::Active => (
                ClusterQueueStatus::Active,
                ActiveReason::Ready,
                "Can admit new workloads".to_owned(),
            ),
            ClusterQueueStatus::Terminating => (
                ClusterQueueStatus::Terminating,
                ActiveReason::Terminating,
                "Can't admit new workloads; the queue is terminating".to_owned(),
            ),
            ClusterQueueStatus::Pending => {
                let mut reasons = Vec::new();
                let mut messages = Vec::new();
                if self.spec.is_stopped() {
                    reasons.push(ActiveReason::Stopped);
                    messages.push("is stopped".to_owned());
                }
                if !self.missing_flavors.is_empty() {
                    reasons.push(ActiveReason::FlavorNotFound);
                    messages.push(format!(
                        "references missing resource flavors: {}",
                        self.missing_flavors.join(", ")
                    ));
                }
                if !self.missing_checks.is_empty() {
                    reasons.push(ActiveReason::AdmissionCheckNotFound);
                    messages.push(format!(
                        "references missing admission checks: {}",
                        self.missing_checks.join(", ")
                    ));
                }
                if !self.inactive_checks.is_empty() {
                    reasons.push(ActiveReason::AdmissionCheckInactive);
                    messages.push(format!(
                        "references inactive admission checks: {}",
                        self.inactive_checks.join(", ")
                    ));
                }
                if self.multikueue_checks.len() > 1 {
                    reasons.push(ActiveReason::MultipleMultiKueueAdmissionChecks);
                    messages.push(format!(
                        "only one multikueue admission check may be referenced, found: {}",
                        self.multikueue_checks.join(", ")
                    ));
                }
                if !self.per_flavor_multikueue_checks.is_empty() {
                    reasons.push(ActiveReason::MultiKueueAdmissionCheckAppliedPerFlavor);
                    messages.push(format!(
                        "multikueue admission checks cannot be scoped to flavors, found: {}",
                        self.per_flavor_multikueue_checks.join(", ")
                    ));
                }
                if !self.multi_single_instance_checks.is_empty() {
                    reasons.push(ActiveReason::MultipleSingleInstanceControllerAdmissionChecks);
                    for (controller, names) in &self.multi_single_instance_checks {
                        messages.push(format!(
                            "only one admission check of {} can be referenced for controller {controller}",
                            names.join(", ")
                        ));
                    }
                }
                if !self.flavor_independent_per_flavor.is_empty() {
                    reasons.push(ActiveReason::FlavorIndependentAdmissionCheckAppliedPerFlavor);
                    messages.push(format!(
                        "admission checks {} cannot be scoped to flavors",
                        self.flavor_independent_per_flavor.join(", ")
                    ));
                }
                if features.topology_aware_scheduling && !self.tas_flavors.is_empty() {
                    if !self.multikueue_checks.is_empty() {
                        reasons.push(ActiveReason::NotSupportedWithTopologyAwareScheduling);
                        messages.push(
                            "topology aware scheduling is not supported with multikueue admission checks"
                                .to_owned(),
                        );
                    }
                    if !self.provisioning_checks.is_empty() {
                        reasons.push(ActiveReason::NotSupportedWithTopologyAwareScheduling);
                        messages.push(
                            "topology aware scheduling is not supported with provisioning admission checks"
                                .to_owned(),
                        );
                    }
                    if !self.missing_topologies.is_empty() {
                        reasons.push(ActiveReason::TopologyNotFound);
                        messages.push(format!(
                            "references missing topologies: {}",
                            self.missing_topologies.join(", ")
                        ));
                    }
                }
                if self.cohort_cycle {
                    reasons.push(ActiveReason::CohortCycle);
                    messages.push("the cohort chain above this queue contains a cycle".to_owned());
                }
                if reasons.is_empty() {
                    return (
                        ClusterQueueStatus::Pending,
                        ActiveReason::Unknown,
                        "Can't admit new workloads.".to_owned(),
                    );
                }
                let message = format!("Can't admit new workloads: {}.", messages.join(", "));
                (ClusterQueueStatus::Pending, reasons[0], message)
            }
        }
    }

    /// Charge or release one workload's usage against this queue
    ///
    /// Returns the usage that was applied and whether releasing clamped
    /// at zero, which signals a bookkeeping invariant violation.
    ///
    /// # Arguments
    ///
    /// * `workload` - The workload to account
    /// * `sign` - +1 to charge or -1 to release
    /// * `lq_metrics` - Whether to report local queue counters
    pub fn apply_usage(&mut self, workload: &Workload, sign: i64, lq_metrics: bool) -> (Quantities, bool) {
        let usage = workload.usage();
        let mut clamped = false;
        if sign > 0 {
            self.node.usage.add_all(&usage);
        } else {
            clamped = self.node.usage.sub_all(&usage);
        }
        let admitted = workload.is_admitted();
        if admitted {
            if sign > 0 {
                self.admitted_usage.add_all(&usage);
                self.admitted_count += 1;
            } else {
                self.admitted_usage.sub_all(&usage);
                self.admitted_count = (self.admitted_count - 1).max(0);
            }
        }
        // keep the local queue counters in step
        let lq_key = format!("{}/{}", workload.namespace, workload.queue);
        if let Some(counts) = self.local_queues.get_mut(&lq_key) {
            counts.apply(&usage, admitted, sign);
            if lq_metrics {
                event!(
                    Level::INFO,
                    local_queue = lq_key,
                    reserving = counts.reserving,
                    admitted = counts.admitted,
                );
            }
        }
        (usage, clamped)
    }

    /// Register a local queue and back-fill its counters from workloads
    /// observed before the queue itself
    ///
    /// # Arguments
    ///
    /// * `queue` - The local queue spec to register
    pub fn add_local_queue(&mut self, queue: &LocalQueue) {
        let mut counts = LocalQueueCounts::default();
        for workload in self.workloads.values() {
            if workload.namespace == queue.namespace && workload.queue == queue.name {
                if workload.has_quota_reservation() && !self.deferred_tas.contains(&workload.key()) {
                    counts.apply(&workload.usage(), workload.is_admitted(), 1);
                }
            }
        }
        self.local_queues.insert(queue.key(), counts);
    }

    /// Recompute this queue's usage ledgers from its workload set
    ///
    /// Used to self-heal after an invariant violation. Returns the usage
    /// total before and after the rebuild so the caller can fix the
    /// cohort chain.
    pub fn rebuild_usage(&mut self, lq_metrics: bool) -> (Quantities, Quantities) {
        let before = self.node.usage.clone();
        self.node.usage = Quantities::new();
        self.admitted_usage = Quantities::new();
        self.admitted_count = 0;
        for counts in self.local_queues.values_mut() {
            *counts = LocalQueueCounts::default();
        }
        // re-account every reserving workload that is not deferred
        let workloads: Vec<Workload> = self.workloads.values().cloned().collect();
        for workload in &workloads {
            if workload.has_quota_reservation() && !self.deferred_tas.contains(&workload.key()) {
                self.apply_usage(workload, 1, lq_metrics);
            }
        }
        (before, self.node.usage.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden::models::queues::{CheckRef, FlavorQuotas, ResourceGroup, StopPolicy};
    use warden::models::CPU;

    /// build a queue spec with a single default flavor
    fn queue_spec(name: &str) -> ClusterQueue {
        let mut spec = ClusterQueue::new(name);
        spec.resource_groups.push(ResourceGroup {
            covered: [CPU.to_string()].into_iter().collect(),
            flavors: vec![FlavorQuotas::new("default").quota(CPU, 4000)],
        });
        spec
    }

    #[test]
    fn missing_flavor_makes_queue_pending() {
        let mut state = QueueState::new(queue_spec("queue-a"));
        let features = Features::default();
        state.refresh_validation(&HashMap::new(), &HashMap::new(), &HashMap::new(), &features);
        state.refresh_status(&features);
        let (status, reason, message) = state.readiness(&features);
        assert_eq!(status, ClusterQueueStatus::Pending);
        assert_eq!(reason, ActiveReason::FlavorNotFound);
        assert!(message.contains("default"));
    }

    #[test]
    fn healthy_queue_is_active() {
        let mut state = QueueState::new(queue_spec("queue-a"));
        let features = Features::default();
        let mut flavors = HashMap::new();
        flavors.insert("default".to_string(), ResourceFlavor::new("default"));
        state.refresh_validation(&flavors, &HashMap::new(), &HashMap::new(), &features);
        state.refresh_status(&features);
        let (status, reason, message) = state.readiness(&features);
        assert_eq!(status, ClusterQueueStatus::Active);
        assert_eq!(reason, ActiveReason::Ready);
        assert_eq!(message, "Can admit new workloads");
    }

    #[test]
    fn stopped_reason_comes_first() {
        let mut spec = queue_spec("queue-a");
        spec.stop_policy = StopPolicy::Hold;
        spec.admission_checks.push(CheckRef::new("ghost-check"));
        let mut state = QueueState::new(spec);
        let features = Features::default();
        state.refresh_validation(&HashMap::new(), &HashMap::new(), &HashMap::new(), &features);
        state.refresh_status(&features);
        let (_, reason, message) = state.readiness(&features);
        // the message enumerates every cause but the code is the first one
        assert_eq!(reason, ActiveReason::Stopped);
        assert!(message.contains("is stopped"));
        assert!(message.contains("ghost-check"));
        assert!(message.contains("default"));
    }

    #[test]
    fn tas_with_multikueue_is_unsupported() {
        use warden::models::{AdmissionCheck, MULTIKUEUE_CONTROLLER};
        let mut spec = queue_spec("queue-a");
        spec.admission_checks.push(CheckRef::new("dispatch"));
        let mut state = QueueState::new(spec);
        let features = Features {
            topology_aware_scheduling: true,
            ..Features::default()
        };
        let mut flavors = HashMap::new();
        flavors.insert(
            "default".to_string(),
            ResourceFlavor::new("default").topology("racks"),
        );
        let mut topologies = HashMap::new();
        topologies.insert("racks".to_string(), Topology::default());
        let mut checks = HashMap::new();
        checks.insert(
            "dispatch".to_string(),
            AdmissionCheck::new("dispatch", MULTIKUEUE_CONTROLLER),
        );
        state.refresh_validation(&flavors, &topologies, &checks, &features);
        state.refresh_status(&features);
        let (status, reason, _) = state.readiness(&features);
        assert_eq!(status, ClusterQueueStatus::Pending);
        assert_eq!(reason, ActiveReason::NotSupportedWithTopologyAwareScheduling);
    }
}
