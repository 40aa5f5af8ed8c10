//! The shared config for Warden

use std::path::Path;

use crate::errors::Error;
use crate::features::Features;

/// Helps serde default the scheduler tick to 1 second
fn default_tick_millis() -> u64 {
    1000
}

/// Helps serde default the number of intent emission attempts to 5
fn default_intent_attempts() -> u32 {
    5
}

/// Helps serde default the base intent retry backoff to 100ms
fn default_intent_backoff_millis() -> u64 {
    100
}

/// How the eligibility timestamp of a requeued workload is derived
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequeuingStrategy {
    /// Requeued workloads keep their creation time and so return to their
    /// original place in the queue
    #[default]
    CreationTimestamp,
    /// Requeued workloads take the time of their last eviction and so go to
    /// the back of the queue
    EvictionTimestamp,
}

/// The strategy guarding fair sharing preemptions
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FairShareStrategy {
    /// The preemptor's projected share must not exceed the victim queue's
    /// share after the eviction
    #[default]
    LessThanOrEqualToFinalShare,
    /// The preemptor's projected share must stay below the victim queue's
    /// share before the eviction
    LessThanInitialShare,
}

/// Settings for the pods ready gate
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitForPodsReady {
    /// Whether admission waits on pods becoming ready at all
    #[serde(default)]
    pub enable: bool,
    /// Whether a workload with pods not yet ready blocks later admissions
    #[serde(default)]
    pub block_admission: bool,
    /// How requeued workloads are re-aged
    #[serde(default)]
    pub requeuing_strategy: RequeuingStrategy,
}

/// Settings for the scheduler loop
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduler {
    /// How often the scheduler takes a pass in milliseconds
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
    /// How many times an intent emission is attempted before it is dropped
    #[serde(default = "default_intent_attempts")]
    pub intent_attempts: u32,
    /// The base backoff between intent emission attempts in milliseconds
    ///
    /// The backoff doubles on each failed attempt.
    #[serde(default = "default_intent_backoff_millis")]
    pub intent_backoff_millis: u64,
    /// The strategy guarding fair sharing preemptions
    #[serde(default)]
    pub fair_share_strategy: FairShareStrategy,
    /// The pods ready gate settings
    #[serde(default)]
    pub wait_for_pods_ready: WaitForPodsReady,
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler {
            tick_millis: default_tick_millis(),
            intent_attempts: default_intent_attempts(),
            intent_backoff_millis: default_intent_backoff_millis(),
            fair_share_strategy: FairShareStrategy::default(),
            wait_for_pods_ready: WaitForPodsReady::default(),
        }
    }
}

/// The log levels Warden can log at
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    /// Do not log anything
    Off,
    /// Log errors only
    Error,
    /// Log warnings and up
    Warn,
    /// Log info and up
    #[default]
    Info,
    /// Log debug and up
    Debug,
    /// Log everything
    Trace,
}

/// Settings for tracing
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tracing {
    /// The level to log at
    #[serde(default)]
    pub level: LogLevel,
    /// Whether to log as single line json instead of human readable lines
    #[serde(default)]
    pub json: bool,
}

/// The shared config for Warden
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Conf {
    /// The scheduler loop settings
    #[serde(default)]
    pub scheduler: Scheduler,
    /// The tracing settings
    #[serde(default)]
    pub tracing: Tracing,
    /// The runtime feature flags
    #[serde(default)]
    pub features: Features,
}

impl Conf {
    /// Load a config from a file with env var overrides
    ///
    /// Environment variables prefixed with `WARDEN__` override file values,
    /// with `__` as the section separator.
    ///
    /// # Arguments
    ///
    /// * `path` - The path to load the config file from
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        // build the path to our config file
        let path = path.as_ref().to_string_lossy();
        // load our config file and overlay any env vars
        let conf = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(config::Environment::with_prefix("WARDEN").separator("__"))
            .build()?;
        // deserialize our settings
        Ok(conf.try_deserialize()?)
    }
}
