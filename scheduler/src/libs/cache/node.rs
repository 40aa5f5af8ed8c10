//! The per queue and per cohort record of quota, usage, and subtree totals

use std::collections::BTreeMap;

use warden::models::{FlavorQuotas, FlavorResource, Quantities};

/// The limits on one (flavor, resource) pair of a single node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaLimits {
    /// The capacity this node owns outright
    pub nominal: i64,
    /// The most this node may draw from its parent beyond nominal
    pub borrowing_limit: Option<i64>,
    /// The most of nominal this node lets its siblings draw
    pub lending_limit: Option<i64>,
}

/// The quota ledger one queue or cohort carries
///
/// `subtree_quota` is the bottom-up aggregate: for a queue it is its own
/// nominal, for a cohort it is the cohort's own nominal plus every
/// child's lendable part. Usage counts the whole subtree and is kept in
/// sync incrementally as workloads come and go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceNode {
    /// The quota per (flavor, resource) pair
    pub quotas: BTreeMap<FlavorResource, QuotaLimits>,
    /// The usage currently charged to this subtree
    pub usage: Quantities,
    /// The aggregated requestable capacity of this subtree
    pub subtree_quota: Quantities,
}

impl ResourceNode {
    /// Build the quota map from a list of per flavor quota specs
    ///
    /// # Arguments
    ///
    /// * `flavor_quotas` - The quota specs to flatten
    pub fn from_specs<'a, I: IntoIterator<Item = &'a FlavorQuotas>>(flavor_quotas: I) -> Self {
        let mut node = ResourceNode::default();
        // flatten each spec into one entry per (flavor, resource)
        for spec in flavor_quotas {
            for (resource, quota) in &spec.resources {
                let key = FlavorResource::new(spec.name.clone(), resource.clone());
                node.quotas.insert(
                    key,
                    QuotaLimits {
                        nominal: quota.nominal,
                        borrowing_limit: quota.borrowing_limit,
                        lending_limit: quota.lending_limit,
                    },
                );
            }
        }
        node
    }

    /// The nominal capacity for a key, defaulting to zero
    ///
    /// # Arguments
    ///
    /// * `key` - The flavor/resource to look up
    pub fn nominal(&self, key: &FlavorResource) -> i64 {
        self.quotas.get(key).map(|limits| limits.nominal).unwrap_or(0)
    }

    /// The borrowing limit for a key, unset meaning unlimited
    ///
    /// # Arguments
    ///
    /// * `key` - The flavor/resource to look up
    pub fn borrowing_limit(&self, key: &FlavorResource) -> Option<i64> {
        self.quotas.get(key).and_then(|limits| limits.borrowing_limit)
    }

    /// The capacity this node keeps for itself no matter what siblings do
    ///
    /// Guaranteed capacity is nominal minus the lending limit when one is
    /// set; with no lending limit everything is lendable.
    ///
    /// # Arguments
    ///
    /// * `key` - The flavor/resource to look up
    /// * `lending_enabled` - Whether lending limits are honored at all
    pub fn guaranteed(&self, key: &FlavorResource, lending_enabled: bool) -> i64 {
        if lending_enabled {
            if let Some(limits) = self.quotas.get(key) {
                if let Some(lending) = limits.lending_limit {
                    return limits.nominal.saturating_sub(lending);
                }
            }
        }
        0
    }

    /// Reset the subtree quota to this node's own nominal capacity
    pub fn reset_subtree(&mut self) {
        self.subtree_quota = Quantities::new();
        for (key, limits) in &self.quotas {
            self.subtree_quota.add(key, limits.nominal);
        }
    }

    /// Add a child's lendable part to this node's subtree quota
    ///
    /// # Arguments
    ///
    /// * `child` - The child node to absorb
    /// * `lending_enabled` - Whether lending limits are honored at all
    pub fn absorb_child(&mut self, child: &ResourceNode, lending_enabled: bool) {
        // a child's lendable part is its subtree total minus whatever it
        // guarantees to itself
        for (key, quantity) in child.subtree_quota.iter() {
            let lendable = quantity - child.guaranteed(key, lending_enabled);
            self.subtree_quota.add(key, lendable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden::models::queues::ResourceQuota;
    use warden::models::CPU;

    /// build a quota spec with a lending limit
    fn spec(nominal: i64, lending: Option<i64>) -> FlavorQuotas {
        FlavorQuotas::new("default").full_quota(
            CPU,
            ResourceQuota {
                nominal,
                borrowing_limit: None,
                lending_limit: lending,
            },
        )
    }

    #[test]
    fn guaranteed_requires_lending_limit() {
        let key = FlavorResource::new("default", CPU);
        let node = ResourceNode::from_specs([&spec(4000, None)]);
        // no lending limit means everything is lendable
        assert_eq!(node.guaranteed(&key, true), 0);
        let node = ResourceNode::from_specs([&spec(4000, Some(1000))]);
        assert_eq!(node.guaranteed(&key, true), 3000);
        // with the feature off the limit is ignored
        assert_eq!(node.guaranteed(&key, false), 0);
    }

    #[test]
    fn subtree_absorbs_lendable_parts() {
        let key = FlavorResource::new("default", CPU);
        let mut parent = ResourceNode::default();
        parent.reset_subtree();
        let mut child = ResourceNode::from_specs([&spec(4000, Some(1000))]);
        child.reset_subtree();
        parent.absorb_child(&child, true);
        // only the lending limit worth of capacity is shared upward
        assert_eq!(parent.subtree_quota.get(&key), 1000);
        parent.absorb_child(&child, false);
        // lending disabled shares the full nominal
        assert_eq!(parent.subtree_quota.get(&key), 5000);
    }
}
