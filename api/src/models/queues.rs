//! Wrappers for cluster queues and local queues within Warden

use std::collections::{BTreeMap, BTreeSet};

use super::resources::{FlavorName, ResourceName};

/// Helps serde default the fair weight to 1.0 in milli units
fn default_fair_weight() -> u64 {
    1000
}

/// The quota for one resource under one flavor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuota {
    /// The capacity this queue owns outright
    pub nominal: i64,
    /// The most this queue may draw from its cohort on top of nominal
    ///
    /// Unset means unlimited borrowing within the cohort's capacity.
    #[serde(default)]
    pub borrowing_limit: Option<i64>,
    /// The most of nominal this queue lets siblings draw
    ///
    /// Unset means the full nominal is lendable. Must not exceed nominal
    /// when set; guaranteed capacity is nominal minus the lending limit.
    #[serde(default)]
    pub lending_limit: Option<i64>,
}

impl ResourceQuota {
    /// Create a quota with just a nominal amount
    ///
    /// # Arguments
    ///
    /// * `nominal` - The capacity this queue owns outright
    pub fn new(nominal: i64) -> Self {
        ResourceQuota {
            nominal,
            borrowing_limit: None,
            lending_limit: None,
        }
    }
}

/// The quotas one flavor contributes to a resource group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlavorQuotas {
    /// The flavor these quotas draw from
    pub name: FlavorName,
    /// The quota per covered resource
    pub resources: BTreeMap<ResourceName, ResourceQuota>,
}

impl FlavorQuotas {
    /// Create quotas for a flavor
    ///
    /// # Arguments
    ///
    /// * `name` - The flavor these quotas draw from
    pub fn new<N: Into<FlavorName>>(name: N) -> Self {
        FlavorQuotas {
            name: name.into(),
            resources: BTreeMap::default(),
        }
    }

    /// Add a nominal-only quota for a resource
    ///
    /// # Arguments
    ///
    /// * `resource` - The resource to set quota for
    /// * `nominal` - The nominal capacity
    pub fn quota<R: Into<ResourceName>>(mut self, resource: R, nominal: i64) -> Self {
        self.resources.insert(resource.into(), ResourceQuota::new(nominal));
        self
    }

    /// Add a full quota for a resource
    ///
    /// # Arguments
    ///
    /// * `resource` - The resource to set quota for
    /// * `quota` - The quota to set
    pub fn full_quota<R: Into<ResourceName>>(mut self, resource: R, quota: ResourceQuota) -> Self {
        self.resources.insert(resource.into(), quota);
        self
    }
}

/// A set of resources served by an ordered list of flavors
///
/// A workload's demand for any covered resource must be satisfied by a
/// single flavor chosen from the list; different groups are independent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroup {
    /// The resources this group covers
    pub covered: BTreeSet<ResourceName>,
    /// The flavors to try, in declaration order
    pub flavors: Vec<FlavorQuotas>,
}

/// The policies for preempting workloads admitted in the same queue or
/// cohort
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreemptionPolicy {
    /// Never preempt
    #[default]
    Never,
    /// Preempt any candidate
    Any,
    /// Preempt only strictly lower priority candidates
    LowerPriority,
    /// Preempt lower priority candidates, or equal priority candidates
    /// admitted after this workload became eligible
    LowerOrNewerEqualPriority,
}

/// The preemption policy of a cluster queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreemptionSpec {
    /// The policy for victims admitted in the same cluster queue
    #[serde(default)]
    pub within_cluster_queue: PreemptionPolicy,
    /// The policy for reclaiming lent capacity from borrowing siblings
    #[serde(default)]
    pub reclaim_within_cohort: PreemptionPolicy,
}

/// What to do when a flavor only fits by borrowing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WhenCanBorrow {
    /// Borrow from the cohort right away
    #[default]
    Borrow,
    /// Prefer a later flavor that fits without borrowing
    TryNextFlavor,
}

/// What to do when a flavor only fits by preempting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WhenCanPreempt {
    /// Preempt on this flavor without trying later ones
    Preempt,
    /// Prefer a later flavor that fits outright
    #[default]
    TryNextFlavor,
}

/// How eagerly the flavor assigner moves past a flavor that would need
/// borrowing or preemption
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlavorFungibility {
    /// What to do when a flavor only fits by borrowing
    #[serde(default)]
    pub when_can_borrow: WhenCanBorrow,
    /// What to do when a flavor only fits by preempting
    #[serde(default)]
    pub when_can_preempt: WhenCanPreempt,
}

/// How pending workloads in one queue are ordered against each other
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueingStrategy {
    /// The head blocks: nothing behind an unadmittable head is considered
    StrictFifo,
    /// Workloads behind an unadmittable head may still be admitted
    #[default]
    BestEffortFifo,
}

/// Whether a queue is accepting and running workloads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopPolicy {
    /// The queue admits workloads normally
    #[default]
    None,
    /// The queue stops admitting new workloads
    Hold,
    /// The queue stops admitting and evicts what it already admitted
    HoldAndDrain,
}

/// A reference from a cluster queue to an admission check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRef {
    /// The name of the referenced check
    pub name: String,
    /// The flavors the check applies to, empty meaning all
    #[serde(default)]
    pub flavors: BTreeSet<FlavorName>,
}

impl CheckRef {
    /// Create a reference that applies to all flavors
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the referenced check
    pub fn new<N: Into<String>>(name: N) -> Self {
        CheckRef {
            name: name.into(),
            flavors: BTreeSet::default(),
        }
    }
}

/// The admission unit owning quota for a set of flavors
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterQueue {
    /// The name of this queue
    pub name: String,
    /// The cohort this queue draws shared capacity from, if any
    #[serde(default)]
    pub cohort: Option<String>,
    /// The resource groups this queue owns
    #[serde(default)]
    pub resource_groups: Vec<ResourceGroup>,
    /// Labels a namespace must carry for its local queues to use this
    /// queue, empty meaning any namespace
    #[serde(default)]
    pub namespace_selector: BTreeMap<String, String>,
    /// The ordering strategy for pending workloads
    #[serde(default)]
    pub queueing_strategy: QueueingStrategy,
    /// The preemption policy
    #[serde(default)]
    pub preemption: PreemptionSpec,
    /// The flavor fungibility policy
    #[serde(default)]
    pub flavor_fungibility: FlavorFungibility,
    /// The fair sharing weight in milli units
    #[serde(default = "default_fair_weight")]
    pub fair_weight_millis: u64,
    /// The admission checks workloads must clear
    #[serde(default)]
    pub admission_checks: Vec<CheckRef>,
    /// Whether this queue is stopped
    #[serde(default)]
    pub stop_policy: StopPolicy,
}

impl ClusterQueue {
    /// Create an empty cluster queue
    ///
    /// # Arguments
    ///
    /// * `name` - The name of this queue
    pub fn new<N: Into<String>>(name: N) -> Self {
        ClusterQueue {
            name: name.into(),
            fair_weight_millis: default_fair_weight(),
            ..ClusterQueue::default()
        }
    }

    /// Whether this queue is stopped
    pub fn is_stopped(&self) -> bool {
        self.stop_policy != StopPolicy::None
    }

    /// All flavor names referenced by this queue's resource groups
    pub fn flavor_names(&self) -> impl Iterator<Item = &FlavorName> {
        self.resource_groups
            .iter()
            .flat_map(|group| group.flavors.iter())
            .map(|flavor| &flavor.name)
    }
}

/// The derived readiness of a cluster queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterQueueStatus {
    /// The queue can admit workloads
    Active,
    /// The queue exists but cannot admit workloads yet
    #[default]
    Pending,
    /// The queue was deleted and is draining its workloads
    Terminating,
}

/// The reason codes emitted on a cluster queue's Active condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActiveReason {
    /// The queue can admit workloads
    Ready,
    /// The queue is draining after deletion
    Terminating,
    /// The queue is stopped by its stop policy
    Stopped,
    /// The queue references a flavor the cache has never seen
    FlavorNotFound,
    /// The queue references a check the cache has never seen
    AdmissionCheckNotFound,
    /// The queue references an inactive check
    AdmissionCheckInactive,
    /// The queue references more than one multikueue check
    MultipleMultiKueueAdmissionChecks,
    /// A multikueue check was scoped to individual flavors
    MultiKueueAdmissionCheckAppliedPerFlavor,
    /// More than one check of a single instance controller was referenced
    MultipleSingleInstanceControllerAdmissionChecks,
    /// A flavor independent check was scoped to individual flavors
    FlavorIndependentAdmissionCheckAppliedPerFlavor,
    /// The queue mixes topology aware flavors with an incompatible check
    NotSupportedWithTopologyAwareScheduling,
    /// A topology aware flavor references a topology the cache has never
    /// seen
    TopologyNotFound,
    /// The queue's cohort chain contains a rejected cycle
    CohortCycle,
    /// The queue is pending for no enumerable reason
    Unknown,
}

impl ActiveReason {
    /// The wire visible string for this reason
    pub fn as_str(&self) -> &'static str {
        match self {
            ActiveReason::Ready => "Ready",
            ActiveReason::Terminating => "Terminating",
            ActiveReason::Stopped => "Stopped",
            ActiveReason::FlavorNotFound => "FlavorNotFound",
            ActiveReason::AdmissionCheckNotFound => "AdmissionCheckNotFound",
            ActiveReason::AdmissionCheckInactive => "AdmissionCheckInactive",
            ActiveReason::MultipleMultiKueueAdmissionChecks => "MultipleMultiKueueAdmissionChecks",
            ActiveReason::MultiKueueAdmissionCheckAppliedPerFlavor => {
                "MultiKueueAdmissionCheckAppliedPerFlavor"
            }
            ActiveReason::MultipleSingleInstanceControllerAdmissionChecks => {
                "MultipleSingleInstanceControllerAdmissionChecks"
            }
            ActiveReason::FlavorIndependentAdmissionCheckAppliedPerFlavor => {
                "FlavorIndependentAdmissionCheckAppliedPerFlavor"
            }
            ActiveReason::NotSupportedWithTopologyAwareScheduling => {
                "NotSupportedWithTopologyAwareScheduling"
            }
            ActiveReason::TopologyNotFound => "TopologyNotFound",
            ActiveReason::CohortCycle => "CohortCycle",
            ActiveReason::Unknown => "Unknown",
        }
    }
}

/// A namespace scoped handle onto a cluster queue
///
/// Local queues carry no policy of their own; they exist so workloads in
/// a namespace can name a submission point without knowing the cluster
/// level topology.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalQueue {
    /// The namespace this queue lives in
    pub namespace: String,
    /// The name of this queue
    pub name: String,
    /// The cluster queue this queue feeds
    pub cluster_queue: String,
}

impl LocalQueue {
    /// Create a new local queue
    ///
    /// # Arguments
    ///
    /// * `namespace` - The namespace this queue lives in
    /// * `name` - The name of this queue
    /// * `cluster_queue` - The cluster queue this queue feeds
    pub fn new<S: Into<String>, N: Into<String>, C: Into<String>>(
        namespace: S,
        name: N,
        cluster_queue: C,
    ) -> Self {
        LocalQueue {
            namespace: namespace.into(),
            name: name.into(),
            cluster_queue: cluster_queue.into(),
        }
    }

    /// The namespace/name key for this queue
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}
