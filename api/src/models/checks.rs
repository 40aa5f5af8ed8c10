//! Wrappers for admission checks within Warden

/// The controller name for multi cluster dispatch checks
pub const MULTIKUEUE_CONTROLLER: &str = "warden.io/multikueue";

/// The controller name for provisioning request checks
pub const PROVISIONING_CONTROLLER: &str = "warden.io/provisioning-request";

/// An asynchronous gate a workload must clear between quota reservation
/// and admission
///
/// The admission core only tracks check state; the controllers that
/// actually evaluate checks are external collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionCheck {
    /// The name of this check
    pub name: String,
    /// The controller that evaluates this check
    pub controller: String,
    /// Whether this check is currently active
    #[serde(default = "default_active")]
    pub active: bool,
    /// Whether only one check of this controller may be used per cluster
    /// queue
    #[serde(default)]
    pub single_instance_in_cluster_queue: bool,
    /// Whether this check may not be scoped to individual flavors
    #[serde(default)]
    pub flavor_independent: bool,
}

/// Helps serde default a check to active
fn default_active() -> bool {
    true
}

impl AdmissionCheck {
    /// Create a new active admission check
    ///
    /// # Arguments
    ///
    /// * `name` - The name of this check
    /// * `controller` - The controller that evaluates it
    pub fn new<N: Into<String>, C: Into<String>>(name: N, controller: C) -> Self {
        AdmissionCheck {
            name: name.into(),
            controller: controller.into(),
            active: true,
            single_instance_in_cluster_queue: false,
            flavor_independent: false,
        }
    }

    /// Whether this check is a multi cluster dispatch check
    pub fn is_multikueue(&self) -> bool {
        self.controller == MULTIKUEUE_CONTROLLER
    }

    /// Whether this check is a provisioning request check
    pub fn is_provisioning(&self) -> bool {
        self.controller == PROVISIONING_CONTROLLER
    }
}

/// The state an admission check controller reported for one workload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckState {
    /// The controller has not decided yet
    #[default]
    Pending,
    /// The check passed
    Ready,
    /// The check failed transiently and the workload should be requeued
    Retry,
    /// The check failed permanently and the workload must not be admitted
    Rejected,
}
