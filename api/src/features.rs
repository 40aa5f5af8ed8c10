//! The runtime feature flags for Warden

/// Helps serde default a feature to enabled
fn default_true() -> bool {
    true
}

/// The feature flags that gate optional Warden behavior
///
/// These are runtime flags loaded from the config file rather than compile
/// time cargo features so that a single build can be toggled in the field.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Features {
    /// Whether flavors referencing a topology take part in topology aware
    /// scheduling
    #[serde(default)]
    pub topology_aware_scheduling: bool,
    /// Whether lending limits on quotas are honored
    #[serde(default = "default_true")]
    pub lending_limit: bool,
    /// Whether per local queue usage counters are reported
    #[serde(default)]
    pub local_queue_metrics: bool,
    /// Whether the extended admission check validation rules are applied
    #[serde(default)]
    pub admission_check_validation_rules: bool,
    /// Whether queues are ordered and preemption is guarded by dominant
    /// resource shares
    #[serde(default)]
    pub fair_sharing: bool,
    /// Whether pod counts may be reduced to admit a workload partially
    #[serde(default)]
    pub partial_admission: bool,
}

impl Default for Features {
    fn default() -> Self {
        Features {
            topology_aware_scheduling: false,
            lending_limit: true,
            local_queue_metrics: false,
            admission_check_validation_rules: false,
            fair_sharing: false,
            partial_admission: false,
        }
    }
}
