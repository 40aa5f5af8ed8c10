//! Wrappers for workloads within Warden

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::conf::RequeuingStrategy;

use super::checks::CheckState;
use super::resources::{FlavorName, FlavorResource, Quantities, ResourceName};

/// The reason set on workloads evicted to make room for another workload
pub const REASON_PREEMPTED: &str = "Preempted";

/// The reason set on workloads evicted after being deactivated
pub const REASON_INACTIVE: &str = "InactiveWorkload";

/// The reason set on workloads evicted because their queue stopped
pub const REASON_QUEUE_STOPPED: &str = "ClusterQueueStopped";

/// The reason set on workloads evicted after a check rejection
pub const REASON_CHECK_REJECTED: &str = "AdmissionCheckRejected";

/// A homogeneous group of pods inside a workload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSet {
    /// The name of this pod set
    pub name: String,
    /// How many pods this set wants
    pub count: u32,
    /// The fewest pods this set can run with, enabling partial admission
    #[serde(default)]
    pub min_count: Option<u32>,
    /// The resources each pod requests
    pub requests: BTreeMap<ResourceName, i64>,
    /// The topology level this set wants to be packed within, if any
    #[serde(default)]
    pub topology_request: Option<String>,
}

impl PodSet {
    /// Create a new pod set
    ///
    /// # Arguments
    ///
    /// * `name` - The name of this pod set
    /// * `count` - How many pods this set wants
    pub fn new<N: Into<String>>(name: N, count: u32) -> Self {
        PodSet {
            name: name.into(),
            count,
            min_count: None,
            requests: BTreeMap::default(),
            topology_request: None,
        }
    }

    /// Add a per pod resource request
    ///
    /// # Arguments
    ///
    /// * `resource` - The resource to request
    /// * `quantity` - The amount each pod requests
    pub fn request<R: Into<ResourceName>>(mut self, resource: R, quantity: i64) -> Self {
        self.requests.insert(resource.into(), quantity);
        self
    }

    /// The total demand of this set at a given pod count
    ///
    /// # Arguments
    ///
    /// * `count` - The pod count to scale requests by
    pub fn demand_at(&self, count: u32) -> BTreeMap<ResourceName, i64> {
        self.requests
            .iter()
            .map(|(resource, quantity)| (resource.clone(), quantity * i64::from(count)))
            .collect()
    }
}

/// The flavors and effective pod count chosen for one pod set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSetAssignment {
    /// The pod set this assignment is for
    pub name: String,
    /// The flavor chosen for each requested resource
    pub flavors: BTreeMap<ResourceName, FlavorName>,
    /// The pod count actually admitted
    pub count: u32,
}

/// The decision record binding a workload to a cluster queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admission {
    /// The cluster queue the workload was admitted to
    pub cluster_queue: String,
    /// The assignment for each pod set, in pod set order
    pub pod_set_assignments: Vec<PodSetAssignment>,
}

/// The condition types that appear on a workload's status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConditionType {
    /// Quota was reserved for this workload
    QuotaReserved,
    /// All admission checks passed and the workload may run
    Admitted,
    /// The workload's pods all became ready
    PodsReady,
    /// The workload was evicted
    Evicted,
    /// The workload went back to pending after an eviction
    Requeued,
    /// The workload finished
    Finished,
}

impl ConditionType {
    /// The wire visible string for this condition type
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::QuotaReserved => "QuotaReserved",
            ConditionType::Admitted => "Admitted",
            ConditionType::PodsReady => "PodsReady",
            ConditionType::Evicted => "Evicted",
            ConditionType::Requeued => "Requeued",
            ConditionType::Finished => "Finished",
        }
    }
}

/// One entry in a workload's condition ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// The condition type
    pub kind: ConditionType,
    /// Whether the condition currently holds
    pub status: bool,
    /// A camel case reason code
    pub reason: String,
    /// A human readable message
    pub message: String,
    /// When the condition last changed status
    pub last_transition: DateTime<Utc>,
}

/// The mutable status of a workload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    /// The admission decision, present once quota is reserved
    #[serde(default)]
    pub admission: Option<Admission>,
    /// The condition ledger, one entry per condition type
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// The state each referenced admission check reported
    #[serde(default)]
    pub check_states: BTreeMap<String, CheckState>,
}

/// A generic admission object, one per tracked job of any kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    /// The namespace this workload lives in
    pub namespace: String,
    /// The name of this workload
    pub name: String,
    /// A unique id for this workload
    pub uid: Uuid,
    /// The local queue this workload was submitted to
    pub queue: String,
    /// The priority of this workload, higher first
    pub priority: i32,
    /// When this workload was created
    pub created: DateTime<Utc>,
    /// Whether this workload is still seeking admission
    #[serde(default = "default_active")]
    pub active: bool,
    /// The pod sets this workload runs
    pub pod_sets: Vec<PodSet>,
    /// The mutable status of this workload
    #[serde(default)]
    pub status: WorkloadStatus,
}

/// Helps serde default a workload to active
fn default_active() -> bool {
    true
}

impl Workload {
    /// Create a new pending workload
    ///
    /// # Arguments
    ///
    /// * `namespace` - The namespace this workload lives in
    /// * `name` - The name of this workload
    /// * `queue` - The local queue this workload was submitted to
    pub fn new<S: Into<String>, N: Into<String>, Q: Into<String>>(
        namespace: S,
        name: N,
        queue: Q,
    ) -> Self {
        Workload {
            namespace: namespace.into(),
            name: name.into(),
            uid: Uuid::new_v4(),
            queue: queue.into(),
            priority: 0,
            created: Utc::now(),
            active: true,
            pod_sets: Vec::default(),
            status: WorkloadStatus::default(),
        }
    }

    /// Set the priority of this workload
    ///
    /// # Arguments
    ///
    /// * `priority` - The priority to set
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Add a pod set to this workload
    ///
    /// # Arguments
    ///
    /// * `pod_set` - The pod set to add
    pub fn pod_set(mut self, pod_set: PodSet) -> Self {
        self.pod_sets.push(pod_set);
        self
    }

    /// The namespace/name key for this workload
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Get a condition from the ledger if it was ever set
    ///
    /// # Arguments
    ///
    /// * `kind` - The condition type to look up
    pub fn condition(&self, kind: ConditionType) -> Option<&Condition> {
        self.status.conditions.iter().find(|cond| cond.kind == kind)
    }

    /// Whether a condition currently holds
    ///
    /// # Arguments
    ///
    /// * `kind` - The condition type to check
    pub fn condition_true(&self, kind: ConditionType) -> bool {
        self.condition(kind).map(|cond| cond.status).unwrap_or(false)
    }

    /// Upsert a condition, keeping the ledger idempotent
    ///
    /// Returns true if anything changed; re-applying an identical
    /// condition is a no-op so intents can be re-emitted safely.
    ///
    /// # Arguments
    ///
    /// * `kind` - The condition type to set
    /// * `status` - Whether the condition holds
    /// * `reason` - The camel case reason code
    /// * `message` - The human readable message
    pub fn set_condition<R: Into<String>, M: Into<String>>(
        &mut self,
        kind: ConditionType,
        status: bool,
        reason: R,
        message: M,
    ) -> bool {
        let reason = reason.into();
        let message = message.into();
        // update in place if this condition was set before
        if let Some(cond) = self.status.conditions.iter_mut().find(|cond| cond.kind == kind) {
            if cond.status == status && cond.reason == reason {
                return false;
            }
            if cond.status != status {
                cond.last_transition = Utc::now();
            }
            cond.status = status;
            cond.reason = reason;
            cond.message = message;
            return true;
        }
        self.status.conditions.push(Condition {
            kind,
            status,
            reason,
            message,
            last_transition: Utc::now(),
        });
        true
    }

    /// Whether this workload holds a quota reservation
    pub fn has_quota_reservation(&self) -> bool {
        self.status.admission.is_some()
    }

    /// Whether this workload cleared all its admission checks
    pub fn is_admitted(&self) -> bool {
        self.condition_true(ConditionType::Admitted)
    }

    /// Whether this workload finished
    pub fn is_finished(&self) -> bool {
        self.condition_true(ConditionType::Finished)
    }

    /// Whether this workload is waiting for a quota reservation
    pub fn is_pending(&self) -> bool {
        self.active && !self.has_quota_reservation() && !self.is_finished()
    }

    /// When this workload was granted its current reservation
    pub fn admitted_at(&self) -> DateTime<Utc> {
        self.condition(ConditionType::QuotaReserved)
            .filter(|cond| cond.status)
            .map(|cond| cond.last_transition)
            .unwrap_or(self.created)
    }

    /// The timestamp FIFO and fair share ordering age this workload by
    ///
    /// # Arguments
    ///
    /// * `strategy` - How requeued workloads are re-aged
    pub fn eligible_at(&self, strategy: RequeuingStrategy) -> DateTime<Utc> {
        match strategy {
            RequeuingStrategy::CreationTimestamp => self.created,
            RequeuingStrategy::EvictionTimestamp => self
                .condition(ConditionType::Evicted)
                .map(|cond| cond.last_transition)
                .unwrap_or(self.created),
        }
    }

    /// The usage this workload counts against its queue, derived from its
    /// admission record
    ///
    /// Pending workloads have no flavor assignment yet and so no usage.
    pub fn usage(&self) -> Quantities {
        let mut usage = Quantities::new();
        let Some(admission) = &self.status.admission else {
            return usage;
        };
        // scale each pod set's requests by its admitted count under its
        // assigned flavors
        for assignment in &admission.pod_set_assignments {
            let Some(pod_set) = self.pod_sets.iter().find(|ps| ps.name == assignment.name) else {
                continue;
            };
            for (resource, flavor) in &assignment.flavors {
                let per_pod = pod_set.requests.get(resource).copied().unwrap_or(0);
                let key = FlavorResource::new(flavor.clone(), resource.clone());
                usage.add(&key, per_pod * i64::from(assignment.count));
            }
        }
        usage
    }

    /// Whether every named check reported ready
    ///
    /// # Arguments
    ///
    /// * `checks` - The check names that must be ready
    pub fn all_checks_ready<'a, I: IntoIterator<Item = &'a String>>(&self, checks: I) -> bool {
        checks
            .into_iter()
            .all(|name| self.status.check_states.get(name) == Some(&CheckState::Ready))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::resources::CPU;

    /// build a small admitted workload for tests
    fn admitted() -> Workload {
        let mut wl = Workload::new("team-a", "train", "main")
            .pod_set(PodSet::new("workers", 3).request(CPU, 1000));
        wl.status.admission = Some(Admission {
            cluster_queue: "queue-a".into(),
            pod_set_assignments: vec![PodSetAssignment {
                name: "workers".into(),
                flavors: [(CPU.to_string(), "default".to_string())].into_iter().collect(),
                count: 3,
            }],
        });
        wl
    }

    #[test]
    fn usage_scales_by_admitted_count() {
        let mut wl = admitted();
        let usage = wl.usage();
        assert_eq!(usage.get(&FlavorResource::new("default", CPU)), 3000);
        // partial admission reduces the effective count
        wl.status.admission.as_mut().unwrap().pod_set_assignments[0].count = 2;
        assert_eq!(wl.usage().get(&FlavorResource::new("default", CPU)), 2000);
    }

    #[test]
    fn pending_workloads_have_no_usage() {
        let wl = Workload::new("team-a", "train", "main")
            .pod_set(PodSet::new("workers", 3).request(CPU, 1000));
        assert!(wl.is_pending());
        assert!(wl.usage().is_empty());
    }

    #[test]
    fn set_condition_is_idempotent() {
        let mut wl = admitted();
        assert!(wl.set_condition(ConditionType::QuotaReserved, true, "Reserved", "quota granted"));
        let stamp = wl.condition(ConditionType::QuotaReserved).unwrap().last_transition;
        // re-applying the same condition must change nothing
        assert!(!wl.set_condition(ConditionType::QuotaReserved, true, "Reserved", "quota granted"));
        assert_eq!(wl.condition(ConditionType::QuotaReserved).unwrap().last_transition, stamp);
    }

    #[test]
    fn eviction_timestamp_re_ages() {
        let mut wl = admitted();
        assert_eq!(wl.eligible_at(RequeuingStrategy::EvictionTimestamp), wl.created);
        wl.set_condition(ConditionType::Evicted, true, REASON_PREEMPTED, "made room");
        let evicted_at = wl.condition(ConditionType::Evicted).unwrap().last_transition;
        assert_eq!(wl.eligible_at(RequeuingStrategy::EvictionTimestamp), evicted_at);
        // creation strategy keeps the original age
        assert_eq!(wl.eligible_at(RequeuingStrategy::CreationTimestamp), wl.created);
    }
}
