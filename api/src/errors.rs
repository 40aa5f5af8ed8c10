//! The errors that can be returned by Warden

use std::fmt;

/// An error from Warden
#[derive(Debug)]
pub enum Error {
    /// A generic error with a message
    Generic(String),
    /// A cohort update would introduce a cycle in the cohort forest
    CohortCycle {
        /// The cohort whose update was rejected
        cohort: String,
        /// The parent that would have closed the cycle
        parent: String,
    },
    /// A workload is already tracked by a different cluster queue
    WorkloadAlreadyExists {
        /// The key of the offending workload
        workload: String,
        /// The cluster queue that already tracks it
        cluster_queue: String,
    },
    /// A local queue was registered twice
    QueueAlreadyExists(String),
    /// A cluster queue that is not in the cache was named
    UnknownQueue(String),
    /// A cohort that is not in the cache was named
    UnknownCohort(String),
    /// A workload that is not in the cache was named
    UnknownWorkload(String),
    /// A resource flavor that is not in the cache was named
    UnknownFlavor(String),
    /// No adapter is registered for this job kind
    UnknownKind(String),
    /// An optimistic concurrency conflict from the object store
    Conflict(String),
    /// A transient error from the object store
    Store(String),
    /// An error from loading a config
    Config(config::ConfigError),
    /// An error from converting a value with serde
    Serde(serde_json::Error),
    /// An error from converting a value with serde to YAML
    SerdeYaml(serde_yaml::Error),
    /// An IO error
    IO(std::io::Error),
    /// An error from parsing a timestamp/date
    ChronoParse(chrono::ParseError),
    /// An error from joining a tokio task
    Join(tokio::task::JoinError),
}

impl Error {
    /// Create a new generic error
    ///
    /// # Arguments
    ///
    /// * `msg` - The error message to set
    pub fn new<T: Into<String>>(msg: T) -> Self {
        Error::Generic(msg.into())
    }

    /// Whether retrying the operation that produced this error may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Store(_))
    }

    /// Get the message from this error if one exists
    pub fn msg(&self) -> Option<String> {
        match self {
            Error::Generic(msg) | Error::Conflict(msg) | Error::Store(msg) => Some(msg.clone()),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Generic(msg) => write!(f, "{msg}"),
            Error::CohortCycle { cohort, parent } => {
                write!(f, "setting parent {parent} on cohort {cohort} would create a cycle")
            }
            Error::WorkloadAlreadyExists { workload, cluster_queue } => {
                write!(f, "workload {workload} already exists in cluster queue {cluster_queue}")
            }
            Error::QueueAlreadyExists(queue) => write!(f, "queue {queue} already exists"),
            Error::UnknownQueue(queue) => write!(f, "unknown cluster queue {queue}"),
            Error::UnknownCohort(cohort) => write!(f, "unknown cohort {cohort}"),
            Error::UnknownWorkload(workload) => write!(f, "unknown workload {workload}"),
            Error::UnknownFlavor(flavor) => write!(f, "unknown resource flavor {flavor}"),
            Error::UnknownKind(kind) => write!(f, "no adapter registered for kind {kind}"),
            Error::Conflict(msg) => write!(f, "conflict: {msg}"),
            Error::Store(msg) => write!(f, "store error: {msg}"),
            Error::Config(err) => write!(f, "{err}"),
            Error::Serde(err) => write!(f, "{err}"),
            Error::SerdeYaml(err) => write!(f, "{err}"),
            Error::IO(err) => write!(f, "{err}"),
            Error::ChronoParse(err) => write!(f, "{err}"),
            Error::Join(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::SerdeYaml(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err)
    }
}

impl From<chrono::ParseError> for Error {
    fn from(err: chrono::ParseError) -> Self {
        Error::ChronoParse(err)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Join(err)
    }
}
