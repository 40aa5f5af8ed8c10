//! Dominant resource shares for fair sharing
//!
//! A queue's share of a resource is the usage it draws from its cohort's
//! lendable pool, weighted by its fair weight. The dominant share is the
//! worst of those ratios and is what orders queues against each other and
//! guards preemptions.

use std::collections::BTreeMap;

use warden::models::{Quantities, ResourceName};

use super::cache::cohorts;
use super::cache::snapshot::Snapshot;

/// Shares are reported in parts per million of lendable capacity per
/// unit of fair weight
const SHARE_SCALE: u128 = 1_000_000;

/// The dominant resource share of one queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DominantShare {
    /// The share value, scaled to parts per million
    pub value: u64,
    /// The resource that dominates, if any usage is above guarantees
    pub resource: Option<ResourceName>,
}

/// Compute the dominant resource share of a queue
///
/// Only usage above the queue's guaranteed floors counts, so a queue
/// living entirely within its guarantee has a share of zero. A queue with
/// zero fair weight shares nothing and always sorts last.
///
/// # Arguments
///
/// * `snap` - The snapshot to evaluate against
/// * `queue_name` - The queue to evaluate
/// * `extra` - Hypothetical extra usage, for projecting an admission
pub fn dominant_share(snap: &Snapshot, queue_name: &str, extra: Option<&Quantities>) -> DominantShare {
    let Some(queue) = snap.queues.get(queue_name) else {
        return DominantShare::default();
    };
    // standalone queues have nothing to share against
    let Some(cohort) = &queue.spec.cohort else {
        return DominantShare::default();
    };
    if queue.spec.fair_weight_millis == 0 {
        return DominantShare {
            value: u64::MAX,
            resource: None,
        };
    }
    let lending = snap.features.lending_limit;
    // the lendable pool lives at the root of the cohort tree
    let root = cohorts::root_of(&snap.cohorts, cohort);
    let lendable: BTreeMap<ResourceName, i64> = snap
        .cohorts
        .get(&root)
        .map(|root| root.node.subtree_quota.by_resource())
        .unwrap_or_default();
    // sum the usage above guarantees per resource
    let mut projected = queue.node.usage.clone();
    if let Some(extra) = extra {
        projected.add_all(extra);
    }
    let mut above: BTreeMap<ResourceName, i64> = BTreeMap::new();
    for (key, quantity) in projected.iter() {
        let surplus = quantity - queue.node.guaranteed(key, lending);
        if surplus > 0 {
            *above.entry(key.resource.clone()).or_insert(0) += surplus;
        }
    }
    // the dominant share is the worst ratio across resources
    let mut dominant = DominantShare::default();
    for (resource, surplus) in above {
        let Some(pool) = lendable.get(&resource).copied().filter(|pool| *pool > 0) else {
            continue;
        };
        let ratio = (surplus as u128 * SHARE_SCALE * 1000)
            / (queue.spec.fair_weight_millis as u128 * pool as u128);
        let ratio = ratio.min(u64::MAX as u128) as u64;
        if ratio > dominant.value {
            dominant = DominantShare {
                value: ratio,
                resource: Some(resource),
            };
        }
    }
    dominant
}
