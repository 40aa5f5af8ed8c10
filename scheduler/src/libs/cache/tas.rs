//! Tracking for the pluggable topology aware scheduling module
//!
//! The admission core reserves and releases capacity at flavor
//! granularity only; placing pods into topology domains belongs to the
//! TAS module. The cache just needs to know which topology flavors that
//! module has synced so it can defer accounting for workloads it cannot
//! attribute yet.

use std::collections::HashSet;

use warden::models::FlavorName;

/// The sync state of the topology aware scheduling module
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TasCache {
    /// The topology flavors the TAS module has synced
    synced: HashSet<FlavorName>,
}

impl TasCache {
    /// Whether a topology flavor has been synced
    ///
    /// # Arguments
    ///
    /// * `flavor` - The flavor to check
    pub fn is_synced(&self, flavor: &FlavorName) -> bool {
        self.synced.contains(flavor)
    }

    /// Mark a topology flavor as synced
    ///
    /// # Arguments
    ///
    /// * `flavor` - The flavor the TAS module finished syncing
    pub fn set_synced<F: Into<FlavorName>>(&mut self, flavor: F) {
        self.synced.insert(flavor.into());
    }

    /// Drop a flavor from the synced set
    ///
    /// # Arguments
    ///
    /// * `flavor` - The flavor that went away
    pub fn forget(&mut self, flavor: &FlavorName) {
        self.synced.remove(flavor);
    }
}
