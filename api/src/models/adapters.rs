//! The adapter seam between concrete job kinds and generic workloads
//!
//! Each supported job kind registers an adapter at startup; the admission
//! core never inspects job objects itself and interacts with jobs only
//! through these three operations.

use std::collections::HashMap;

use crate::errors::Error;

use super::workloads::Workload;

/// Translates one concrete job kind into the generic workload model
pub trait JobAdapter: Send + Sync {
    /// The kind of job this adapter handles
    fn kind(&self) -> &str;

    /// Extract a workload from a raw job object
    ///
    /// # Arguments
    ///
    /// * `obj` - The raw job object
    fn to_workload(&self, obj: &serde_json::Value) -> Result<Workload, Error>;

    /// Build the patch that blocks or unblocks execution of a job
    ///
    /// # Arguments
    ///
    /// * `obj` - The raw job object
    /// * `admit` - Whether the job may start running
    fn suspend_gate(&self, obj: &serde_json::Value, admit: bool) -> Result<serde_json::Value, Error>;

    /// The workload keys to forget when a job is deleted
    ///
    /// # Arguments
    ///
    /// * `obj` - The raw job object
    fn finalize_on_deletion(&self, obj: &serde_json::Value) -> Result<Vec<String>, Error>;
}

/// The adapters registered at startup, keyed by job kind
#[derive(Default)]
pub struct AdapterRegistry {
    /// The registered adapters
    adapters: HashMap<String, Box<dyn JobAdapter>>,
}

impl AdapterRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        AdapterRegistry::default()
    }

    /// Register an adapter for its kind
    ///
    /// # Arguments
    ///
    /// * `adapter` - The adapter to register
    pub fn register(&mut self, adapter: Box<dyn JobAdapter>) {
        self.adapters.insert(adapter.kind().to_owned(), adapter);
    }

    /// Get the adapter for a kind
    ///
    /// Unknown kinds are not an error for the core; callers log a
    /// structured event and skip the object.
    ///
    /// # Arguments
    ///
    /// * `kind` - The job kind to look up
    pub fn get(&self, kind: &str) -> Result<&dyn JobAdapter, Error> {
        match self.adapters.get(kind) {
            Some(adapter) => Ok(adapter.as_ref()),
            None => Err(Error::UnknownKind(kind.to_owned())),
        }
    }
}
