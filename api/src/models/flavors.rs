//! Wrappers for resource flavors and topologies within Warden

use std::collections::BTreeMap;

use super::resources::FlavorName;

/// A named bucket of fungible capacity
///
/// Cluster queues reference flavors by name in their resource groups; a
/// queue referencing a flavor the cache has never seen goes Pending with
/// reason `FlavorNotFound`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFlavor {
    /// The name of this flavor
    pub name: FlavorName,
    /// Node labels that downstream placement matches on
    #[serde(default)]
    pub node_labels: BTreeMap<String, String>,
    /// The topology this flavor takes part in, if any
    #[serde(default)]
    pub topology: Option<String>,
}

impl ResourceFlavor {
    /// Create a new flavor with just a name
    ///
    /// # Arguments
    ///
    /// * `name` - The name of this flavor
    pub fn new<N: Into<FlavorName>>(name: N) -> Self {
        ResourceFlavor {
            name: name.into(),
            node_labels: BTreeMap::default(),
            topology: None,
        }
    }

    /// Set the topology this flavor takes part in
    ///
    /// # Arguments
    ///
    /// * `topology` - The name of the topology
    pub fn topology<T: Into<String>>(mut self, topology: T) -> Self {
        self.topology = Some(topology.into());
        self
    }
}

/// An ordered list of topology levels like rack or block
///
/// Only the topology aware scheduling module reads the levels; the
/// admission core just tracks which flavors reference which topology.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// The name of this topology
    pub name: String,
    /// The node label for each level, outermost first
    pub levels: Vec<String>,
}
