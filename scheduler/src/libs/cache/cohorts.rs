//! The cohort forest and the hierarchical capacity math

use std::collections::{BTreeSet, HashMap, HashSet};

use warden::models::{Cohort, FlavorResource, Quantities};

use super::node::ResourceNode;
use super::queues::QueueState;

/// The internal state of one cohort
///
/// Cohorts may be observed explicitly or spring into existence implicitly
/// when a cluster queue names one that has no spec yet. An implicit
/// cohort is a root with no quota of its own.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CohortState {
    /// The name of this cohort
    pub name: String,
    /// The observed spec, if this cohort was created explicitly
    pub spec: Option<Cohort>,
    /// The installed parent edge
    pub parent: Option<String>,
    /// A spec parent that was rejected because it would close a cycle
    ///
    /// While set, every queue under this cohort reports `CohortCycle`.
    pub rejected_parent: Option<String>,
    /// The child cohorts attached to this cohort
    pub child_cohorts: BTreeSet<String>,
    /// The cluster queues attached to this cohort
    pub child_queues: BTreeSet<String>,
    /// This cohort's own quota and the subtree aggregates
    pub node: ResourceNode,
}

impl CohortState {
    /// Create an implicit root cohort
    ///
    /// # Arguments
    ///
    /// * `name` - The name of this cohort
    pub fn implicit<N: Into<String>>(name: N) -> Self {
        CohortState {
            name: name.into(),
            ..CohortState::default()
        }
    }

    /// Whether anything still references this cohort
    pub fn in_use(&self) -> bool {
        self.spec.is_some() || !self.child_cohorts.is_empty() || !self.child_queues.is_empty()
    }
}

/// Walk from a cohort to the root of its tree
///
/// The walk carries a visited set so a corrupt parent chain cannot spin
/// forever; on a revisit the last unvisited cohort is treated as the root.
///
/// # Arguments
///
/// * `cohorts` - The cohort forest
/// * `start` - The cohort to start from
pub fn root_of(cohorts: &HashMap<String, CohortState>, start: &str) -> String {
    let mut current = start.to_owned();
    let mut visited = HashSet::new();
    while visited.insert(current.clone()) {
        match cohorts.get(&current).and_then(|cohort| cohort.parent.clone()) {
            Some(parent) => current = parent,
            None => break,
        }
    }
    current
}

/// Whether installing `child -> parent` would close a cycle
///
/// Walks upward from the candidate parent; if the walk reaches the child
/// the edge is rejected.
///
/// # Arguments
///
/// * `cohorts` - The cohort forest
/// * `parent` - The candidate parent
/// * `child` - The cohort being attached
pub fn creates_cycle(cohorts: &HashMap<String, CohortState>, parent: &str, child: &str) -> bool {
    let mut current = parent.to_owned();
    let mut visited = HashSet::new();
    loop {
        if current == child {
            return true;
        }
        if !visited.insert(current.clone()) {
            // the chain above is already corrupt; refuse to extend it
            return true;
        }
        match cohorts.get(&current).and_then(|cohort| cohort.parent.clone()) {
            Some(next) => current = next,
            None => return false,
        }
    }
}

/// Whether the chain from a cohort to its root holds a rejected cycle
///
/// # Arguments
///
/// * `cohorts` - The cohort forest
/// * `start` - The cohort to start from, if any
pub fn cycle_in_chain(cohorts: &HashMap<String, CohortState>, start: Option<&String>) -> bool {
    let Some(start) = start else {
        return false;
    };
    let mut current = start.clone();
    let mut visited = HashSet::new();
    while visited.insert(current.clone()) {
        let Some(cohort) = cohorts.get(&current) else {
            return false;
        };
        if cohort.rejected_parent.is_some() {
            return true;
        }
        match &cohort.parent {
            Some(parent) => current = parent.clone(),
            None => return false,
        }
    }
    // the walk revisited a cohort, the chain itself is a cycle
    true
}

/// Charge or release usage along a cohort chain
///
/// Only usage above a node's guaranteed floor draws on its parent's pool,
/// so the deltas shrink as they climb: a queue consuming nothing but its
/// guarantee never shows up in the cohort's ledger at all. Returns true
/// if any release clamped at zero.
///
/// # Arguments
///
/// * `cohorts` - The cohort forest
/// * `start` - The first cohort to charge, if any
/// * `deltas` - The signed per key deltas the child pushed upward
/// * `lending_enabled` - Whether lending limits are honored
pub fn propagate_usage(
    cohorts: &mut HashMap<String, CohortState>,
    start: Option<&String>,
    mut deltas: Vec<(FlavorResource, i64)>,
    lending_enabled: bool,
) -> bool {
    let mut clamped = false;
    let mut current = start.cloned();
    let mut visited = HashSet::new();
    while let Some(name) = current {
        if deltas.is_empty() || !visited.insert(name.clone()) {
            break;
        }
        let Some(cohort) = cohorts.get_mut(&name) else {
            break;
        };
        let mut next = Vec::with_capacity(deltas.len());
        for (key, delta) in deltas {
            let before = cohort.node.usage.get(&key);
            let after = before + delta;
            if after < 0 {
                clamped = true;
            }
            cohort.node.usage.set(key.clone(), after.max(0));
            // clip the delta at this node's guaranteed floor before it
            // climbs further
            let guaranteed = cohort.node.guaranteed(&key, lending_enabled);
            let upward = (after.max(0) - guaranteed).max(0) - (before - guaranteed).max(0);
            if upward != 0 {
                next.push((key, upward));
            }
        }
        deltas = next;
        current = cohort.parent.clone();
    }
    clamped
}

/// The signed deltas a child pushes to its parent for one usage change
///
/// # Arguments
///
/// * `node` - The child node after the change was applied
/// * `usage` - The usage that was applied
/// * `sign` - +1 if it was charged or -1 if released
/// * `lending_enabled` - Whether lending limits are honored
pub fn upward_deltas(
    node: &ResourceNode,
    usage: &Quantities,
    sign: i64,
    lending_enabled: bool,
) -> Vec<(FlavorResource, i64)> {
    let mut deltas = Vec::new();
    for (key, quantity) in usage.iter() {
        let after = node.usage.get(key);
        let before = (after - sign * quantity).max(0);
        let guaranteed = node.guaranteed(key, lending_enabled);
        let upward = (after - guaranteed).max(0) - (before - guaranteed).max(0);
        if upward != 0 {
            deltas.push((key.clone(), upward));
        }
    }
    deltas
}

/// The usage a node draws from its parent's pool
///
/// # Arguments
///
/// * `node` - The node to measure
/// * `lending_enabled` - Whether lending limits are honored
pub fn contribution(node: &ResourceNode, lending_enabled: bool) -> Quantities {
    let mut usage = Quantities::new();
    for (key, quantity) in node.usage.iter() {
        let above = (quantity - node.guaranteed(key, lending_enabled)).max(0);
        if above != 0 {
            usage.add(key, above);
        }
    }
    usage
}

/// Recompute the subtree aggregates for a whole cohort tree
///
/// Children are folded bottom-up: a queue contributes its nominal minus
/// its guaranteed floor to the subtree quota, and its usage above the
/// floor to the cohort's usage. Recomputing usage here (rather than only
/// propagating increments) keeps the ledgers honest across quota changes
/// that move guaranteed floors.
///
/// # Arguments
///
/// * `cohorts` - The cohort forest
/// * `queues` - The cluster queues
/// * `root` - The root of the tree to recompute
/// * `lending_enabled` - Whether lending limits are honored
pub fn refresh_subtree(
    cohorts: &mut HashMap<String, CohortState>,
    queues: &HashMap<String, QueueState>,
    root: &str,
    lending_enabled: bool,
) {
    // build a post-order list of the cohorts in this tree
    let mut order = Vec::new();
    let mut stack = vec![root.to_owned()];
    let mut visited = HashSet::new();
    while let Some(name) = stack.pop() {
        if !visited.insert(name.clone()) {
            continue;
        }
        order.push(name.clone());
        if let Some(cohort) = cohorts.get(&name) {
            stack.extend(cohort.child_cohorts.iter().cloned());
        }
    }
    // fold children bottom-up
    for name in order.into_iter().rev() {
        let Some(cohort) = cohorts.get(&name) else {
            continue;
        };
        let mut node = cohort.node.clone();
        node.reset_subtree();
        node.usage = Quantities::new();
        for queue_name in &cohort.child_queues {
            if let Some(queue) = queues.get(queue_name) {
                node.absorb_child(&queue.node, lending_enabled);
                node.usage.add_all(&contribution(&queue.node, lending_enabled));
            }
        }
        let children: Vec<String> = cohort.child_cohorts.iter().cloned().collect();
        for child_name in children {
            if let Some(child) = cohorts.get(&child_name) {
                let child_node = child.node.clone();
                node.absorb_child(&child_node, lending_enabled);
                node.usage.add_all(&contribution(&child_node, lending_enabled));
            }
        }
        if let Some(cohort) = cohorts.get_mut(&name) {
            cohort.node = node;
        }
    }
}

/// Recompute the tree containing a cohort, if one was named
///
/// # Arguments
///
/// * `cohorts` - The cohort forest
/// * `queues` - The cluster queues
/// * `from` - The cohort whose tree changed, if any
/// * `lending_enabled` - Whether lending limits are honored
pub fn refresh_tree_for(
    cohorts: &mut HashMap<String, CohortState>,
    queues: &HashMap<String, QueueState>,
    from: Option<&String>,
    lending_enabled: bool,
) {
    if let Some(from) = from {
        let root = root_of(cohorts, from);
        refresh_subtree(cohorts, queues, &root, lending_enabled);
    }
}

/// How much of a flavor/resource a cohort subtree can still hand out
///
/// # Arguments
///
/// * `cohorts` - The cohort forest
/// * `name` - The cohort to evaluate
/// * `key` - The flavor/resource to evaluate
/// * `lending_enabled` - Whether lending limits are honored
/// * `ignore_usage` - Whether to compute raw capacity instead
fn cohort_available(
    cohorts: &HashMap<String, CohortState>,
    name: &str,
    key: &FlavorResource,
    lending_enabled: bool,
    ignore_usage: bool,
    visited: &mut HashSet<String>,
) -> i64 {
    let Some(cohort) = cohorts.get(name) else {
        return 0;
    };
    if !visited.insert(name.to_owned()) {
        return 0;
    }
    let usage = if ignore_usage { 0 } else { cohort.node.usage.get(key) };
    match &cohort.parent {
        // at the root everything left in the subtree is available
        None => cohort.node.subtree_quota.get(key) - usage,
        Some(parent) => {
            let guaranteed = cohort.node.guaranteed(key, lending_enabled);
            let local = (guaranteed - usage).max(0);
            let mut from_parent =
                cohort_available(cohorts, parent, key, lending_enabled, ignore_usage, visited);
            if let Some(limit) = cohort.node.borrowing_limit(key) {
                // the draw on the parent is capped by what this subtree
                // stored there plus its borrowing limit
                let stored = cohort.node.subtree_quota.get(key) - guaranteed;
                let drawn = (usage - guaranteed).max(0);
                from_parent = from_parent.min(stored - drawn + limit);
            }
            local + from_parent.max(0)
        }
    }
}

/// How much of a flavor/resource a queue can still consume, counting what
/// it can draw from its cohort tree
///
/// # Arguments
///
/// * `cohorts` - The cohort forest
/// * `queue` - The queue to evaluate
/// * `key` - The flavor/resource to evaluate
/// * `lending_enabled` - Whether lending limits are honored
pub fn available(
    cohorts: &HashMap<String, CohortState>,
    queue: &QueueState,
    key: &FlavorResource,
    lending_enabled: bool,
) -> i64 {
    queue_headroom(cohorts, queue, key, lending_enabled, false)
}

/// How much of a flavor/resource a queue could reach if every workload in
/// its tree were preempted
///
/// # Arguments
///
/// * `cohorts` - The cohort forest
/// * `queue` - The queue to evaluate
/// * `key` - The flavor/resource to evaluate
/// * `lending_enabled` - Whether lending limits are honored
pub fn potential_available(
    cohorts: &HashMap<String, CohortState>,
    queue: &QueueState,
    key: &FlavorResource,
    lending_enabled: bool,
) -> i64 {
    queue_headroom(cohorts, queue, key, lending_enabled, true)
}

/// The shared headroom walk behind available and potential available
fn queue_headroom(
    cohorts: &HashMap<String, CohortState>,
    queue: &QueueState,
    key: &FlavorResource,
    lending_enabled: bool,
    ignore_usage: bool,
) -> i64 {
    let usage = if ignore_usage { 0 } else { queue.node.usage.get(key) };
    match &queue.spec.cohort {
        // standalone queues just have their nominal quota
        None => queue.node.nominal(key) - usage,
        Some(parent) => {
            let guaranteed = queue.node.guaranteed(key, lending_enabled);
            let local = (guaranteed - usage).max(0);
            let mut visited = HashSet::new();
            let mut from_parent =
                cohort_available(cohorts, parent, key, lending_enabled, ignore_usage, &mut visited);
            if let Some(limit) = queue.node.borrowing_limit(key) {
                let stored = queue.node.nominal(key) - guaranteed;
                let drawn = (usage - guaranteed).max(0);
                from_parent = from_parent.min(stored - drawn + limit);
            }
            local + from_parent.max(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden::models::queues::{FlavorQuotas, ResourceGroup, ResourceQuota};
    use warden::models::{ClusterQueue, CPU};

    /// build a queue attached to a cohort with a cpu quota
    fn queue(name: &str, cohort: &str, quota: ResourceQuota) -> QueueState {
        let mut spec = ClusterQueue::new(name);
        spec.cohort = Some(cohort.to_owned());
        spec.resource_groups.push(ResourceGroup {
            covered: [CPU.to_string()].into_iter().collect(),
            flavors: vec![FlavorQuotas::new("default").full_quota(CPU, quota)],
        });
        QueueState::new(spec)
    }

    /// wire two queues under one root cohort and refresh the tree
    fn cohort_pair(
        quota_a: ResourceQuota,
        quota_b: ResourceQuota,
    ) -> (HashMap<String, QueueState>, HashMap<String, CohortState>) {
        let mut queues = HashMap::new();
        queues.insert("a".to_string(), queue("a", "pool", quota_a));
        queues.insert("b".to_string(), queue("b", "pool", quota_b));
        let mut root = CohortState::implicit("pool");
        root.child_queues.insert("a".to_string());
        root.child_queues.insert("b".to_string());
        let mut cohorts = HashMap::new();
        cohorts.insert("pool".to_string(), root);
        refresh_subtree(&mut cohorts, &queues, "pool", true);
        (queues, cohorts)
    }

    #[test]
    fn borrowing_reaches_sibling_capacity() {
        let (queues, cohorts) = cohort_pair(ResourceQuota::new(4000), ResourceQuota::new(4000));
        let key = FlavorResource::new("default", CPU);
        // with nothing lent out the full pool is reachable
        assert_eq!(available(&cohorts, &queues["a"], &key, true), 8000);
    }

    #[test]
    fn zero_borrowing_limit_caps_at_nominal() {
        let quota = ResourceQuota {
            nominal: 4000,
            borrowing_limit: Some(0),
            lending_limit: None,
        };
        let (queues, cohorts) = cohort_pair(quota, ResourceQuota::new(4000));
        let key = FlavorResource::new("default", CPU);
        assert_eq!(available(&cohorts, &queues["a"], &key, true), 4000);
    }

    #[test]
    fn lending_limit_holds_back_guaranteed_capacity() {
        let quota_b = ResourceQuota {
            nominal: 4000,
            borrowing_limit: None,
            lending_limit: Some(1000),
        };
        let (queues, cohorts) = cohort_pair(ResourceQuota::new(4000), quota_b);
        let key = FlavorResource::new("default", CPU);
        // a can reach its own 4000 plus only the 1000 b lends
        assert_eq!(available(&cohorts, &queues["a"], &key, true), 5000);
        // with lending limits disabled the full pool comes back
        let mut cohorts = cohorts;
        refresh_subtree(&mut cohorts, &queues, "pool", false);
        assert_eq!(available(&cohorts, &queues["a"], &key, false), 8000);
    }

    #[test]
    fn usage_reduces_cohort_availability() {
        let (mut queues, mut cohorts) = cohort_pair(ResourceQuota::new(4000), ResourceQuota::new(4000));
        let key = FlavorResource::new("default", CPU);
        // charge 7000 to a, as if one big workload borrowed from b
        let usage: Quantities = [(key.clone(), 7000)].into_iter().collect();
        let queue_a = queues.get_mut("a").unwrap();
        queue_a.node.usage.add_all(&usage);
        let deltas = upward_deltas(&queue_a.node, &usage, 1, true);
        propagate_usage(&mut cohorts, Some(&"pool".to_string()), deltas, true);
        assert_eq!(available(&cohorts, &queues["a"], &key, true), 1000);
        assert_eq!(available(&cohorts, &queues["b"], &key, true), 1000);
        // potential capacity ignores usage entirely
        assert_eq!(potential_available(&cohorts, &queues["b"], &key, true), 8000);
    }

    #[test]
    fn cycle_detection_walks_upward() {
        let mut cohorts = HashMap::new();
        let mut top = CohortState::implicit("top");
        let mut mid = CohortState::implicit("mid");
        mid.parent = Some("top".to_string());
        top.child_cohorts.insert("mid".to_string());
        cohorts.insert("top".to_string(), top);
        cohorts.insert("mid".to_string(), mid);
        // top -> mid would close the loop, mid -> top already exists
        assert!(creates_cycle(&cohorts, "mid", "top"));
        assert!(!creates_cycle(&cohorts, "top", "fresh"));
        assert_eq!(root_of(&cohorts, "mid"), "top");
    }
}
