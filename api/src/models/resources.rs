//! The resource algebra used to track quota and usage in Warden
//!
//! All quantities are integers in canonical units: millicores for cpu,
//! mebibytes for memory, and plain counts for extended resources like
//! gpus. Floats never enter the math so comparisons are exact down to a
//! single millicore.

use std::collections::BTreeMap;
use std::ops::AddAssign;

/// The name of a resource like cpu or memory
pub type ResourceName = String;

/// The name of a resource flavor
pub type FlavorName = String;

/// The canonical cpu resource name
pub const CPU: &str = "cpu";

/// The canonical memory resource name
pub const MEMORY: &str = "memory";

/// The key all quota and usage is tracked under
///
/// A workload consumes capacity for a resource out of exactly one flavor,
/// so every ledger in Warden is keyed by the pair.
#[derive(
    Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct FlavorResource {
    /// The flavor capacity is drawn from
    pub flavor: FlavorName,
    /// The resource being consumed
    pub resource: ResourceName,
}

impl FlavorResource {
    /// Create a new flavor/resource key
    ///
    /// # Arguments
    ///
    /// * `flavor` - The flavor capacity is drawn from
    /// * `resource` - The resource being consumed
    pub fn new<F: Into<FlavorName>, R: Into<ResourceName>>(flavor: F, resource: R) -> Self {
        FlavorResource {
            flavor: flavor.into(),
            resource: resource.into(),
        }
    }
}

/// A ledger of quantities keyed by (flavor, resource)
///
/// Subtraction saturates at zero and entries that reach zero are pruned,
/// so adding a workload's usage and then removing it restores the ledger
/// to exactly its prior value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quantities {
    /// The tracked quantities
    map: BTreeMap<FlavorResource, i64>,
}

impl Quantities {
    /// Create an empty ledger
    pub fn new() -> Self {
        Quantities::default()
    }

    /// Get the quantity for a key, defaulting to zero
    ///
    /// # Arguments
    ///
    /// * `key` - The flavor/resource to look up
    pub fn get(&self, key: &FlavorResource) -> i64 {
        self.map.get(key).copied().unwrap_or(0)
    }

    /// Set the quantity for a key, pruning zero entries
    ///
    /// # Arguments
    ///
    /// * `key` - The flavor/resource to set
    /// * `quantity` - The quantity to set
    pub fn set(&mut self, key: FlavorResource, quantity: i64) {
        if quantity == 0 {
            self.map.remove(&key);
        } else {
            self.map.insert(key, quantity);
        }
    }

    /// Add a quantity for a key
    ///
    /// # Arguments
    ///
    /// * `key` - The flavor/resource to add to
    /// * `quantity` - The quantity to add
    pub fn add(&mut self, key: &FlavorResource, quantity: i64) {
        let total = self.get(key) + quantity;
        self.set(key.clone(), total);
    }

    /// Subtract a quantity for a key, saturating at zero
    ///
    /// Returns true if the subtraction clamped, meaning the ledger would
    /// have gone negative. Callers treat that as an invariant violation.
    ///
    /// # Arguments
    ///
    /// * `key` - The flavor/resource to subtract from
    /// * `quantity` - The quantity to subtract
    pub fn sub(&mut self, key: &FlavorResource, quantity: i64) -> bool {
        let current = self.get(key);
        let clamped = quantity > current;
        self.set(key.clone(), current.saturating_sub(quantity).max(0));
        clamped
    }

    /// Add every entry of another ledger to this one
    ///
    /// # Arguments
    ///
    /// * `other` - The ledger to add
    pub fn add_all(&mut self, other: &Quantities) {
        for (key, quantity) in &other.map {
            self.add(key, *quantity);
        }
    }

    /// Subtract every entry of another ledger from this one
    ///
    /// Returns true if any entry clamped at zero.
    ///
    /// # Arguments
    ///
    /// * `other` - The ledger to subtract
    pub fn sub_all(&mut self, other: &Quantities) -> bool {
        let mut clamped = false;
        for (key, quantity) in &other.map {
            clamped |= self.sub(key, *quantity);
        }
        clamped
    }

    /// Whether every entry of another ledger fits within this one
    ///
    /// # Arguments
    ///
    /// * `other` - The demand to check
    pub fn fits(&self, other: &Quantities) -> bool {
        other.map.iter().all(|(key, quantity)| self.get(key) >= *quantity)
    }

    /// Whether this ledger has no entries
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate over the tracked entries
    pub fn iter(&self) -> impl Iterator<Item = (&FlavorResource, i64)> {
        self.map.iter().map(|(key, quantity)| (key, *quantity))
    }

    /// The keys tracked by this ledger
    pub fn keys(&self) -> impl Iterator<Item = &FlavorResource> {
        self.map.keys()
    }

    /// Sum the tracked quantities per resource across all flavors
    pub fn by_resource(&self) -> BTreeMap<ResourceName, i64> {
        let mut totals = BTreeMap::new();
        for (key, quantity) in &self.map {
            *totals.entry(key.resource.clone()).or_insert(0) += quantity;
        }
        totals
    }
}

impl AddAssign<&Quantities> for Quantities {
    fn add_assign(&mut self, other: &Quantities) {
        self.add_all(other);
    }
}

impl FromIterator<(FlavorResource, i64)> for Quantities {
    fn from_iter<I: IntoIterator<Item = (FlavorResource, i64)>>(iter: I) -> Self {
        let mut quantities = Quantities::new();
        for (key, quantity) in iter {
            quantities.add(&key, quantity);
        }
        quantities
    }
}

/// Convert whole cores to millicores
///
/// # Arguments
///
/// * `cores` - The number of whole cores
pub fn millis(cores: i64) -> i64 {
    cores * 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    /// build a key for the default flavor
    fn fr(resource: &str) -> FlavorResource {
        FlavorResource::new("default", resource)
    }

    #[test]
    fn add_then_sub_restores() {
        let mut ledger = Quantities::new();
        ledger.add(&fr(CPU), 3000);
        ledger.add(&fr(MEMORY), 512);
        let before = ledger.clone();
        let usage: Quantities =
            [(fr(CPU), 1500), (fr(MEMORY), 256), (fr("nvidia.com/gpu"), 2)]
                .into_iter()
                .collect();
        ledger.add_all(&usage);
        assert!(!ledger.sub_all(&usage));
        // the ledger must be bitwise equal, including pruned zero entries
        assert_eq!(ledger, before);
    }

    #[test]
    fn sub_saturates_and_reports() {
        let mut ledger = Quantities::new();
        ledger.add(&fr(CPU), 100);
        assert!(ledger.sub(&fr(CPU), 200));
        assert_eq!(ledger.get(&fr(CPU)), 0);
        assert!(ledger.is_empty());
    }

    #[test]
    fn fits_respects_millis() {
        let mut capacity = Quantities::new();
        capacity.add(&fr(CPU), millis(4));
        let exact: Quantities = [(fr(CPU), 4000)].into_iter().collect();
        let over: Quantities = [(fr(CPU), 4001)].into_iter().collect();
        assert!(capacity.fits(&exact));
        assert!(!capacity.fits(&over));
    }

    #[test]
    fn by_resource_sums_flavors() {
        let usage: Quantities = [
            (FlavorResource::new("spot", CPU), 1000),
            (FlavorResource::new("on-demand", CPU), 500),
            (FlavorResource::new("spot", MEMORY), 64),
        ]
        .into_iter()
        .collect();
        let totals = usage.by_resource();
        assert_eq!(totals.get(CPU), Some(&1500));
        assert_eq!(totals.get(MEMORY), Some(&64));
    }
}
