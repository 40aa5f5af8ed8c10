//! Wrappers for all objects within Warden

pub mod adapters;
pub mod checks;
pub mod cohorts;
pub mod events;
pub mod flavors;
pub mod queues;
pub mod resources;
pub mod workloads;

pub use adapters::{AdapterRegistry, JobAdapter};
pub use checks::{AdmissionCheck, CheckState, MULTIKUEUE_CONTROLLER, PROVISIONING_CONTROLLER};
pub use cohorts::Cohort;
pub use events::{EntityEvent, WatchEvent};
pub use flavors::{ResourceFlavor, Topology};
pub use queues::{
    ActiveReason, ClusterQueue, ClusterQueueStatus, FlavorFungibility, FlavorQuotas, LocalQueue,
    PreemptionPolicy, PreemptionSpec, QueueingStrategy, ResourceGroup, ResourceQuota, StopPolicy,
    WhenCanBorrow, WhenCanPreempt,
};
pub use resources::{FlavorName, FlavorResource, Quantities, ResourceName, CPU, MEMORY};
pub use workloads::{
    Admission, Condition, ConditionType, PodSet, PodSetAssignment, Workload, WorkloadStatus,
};
