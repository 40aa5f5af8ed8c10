//! The process wide quota cache for Warden
//!
//! The cache is the sole owner of mutable quota state. Watchers apply
//! add/update/delete deltas through its handlers under a single write
//! lock, so every observer sees one totally ordered sequence of states;
//! the scheduler takes the read lock only long enough to clone a
//! snapshot and decides everything else lock free.

pub mod cohorts;
pub mod node;
pub mod queues;
pub mod snapshot;
pub mod tas;

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::{event, Level};
use warden::models::{
    ActiveReason, AdmissionCheck, CheckState, ClusterQueue, ClusterQueueStatus, Cohort, FlavorName,
    LocalQueue, ResourceFlavor, Topology, Workload,
};
use warden::models::workloads::{ConditionType, REASON_CHECK_REJECTED};
use warden::{Conf, Error, Features};

use self::cohorts::CohortState;
use self::queues::QueueState;
use self::snapshot::Snapshot;
use self::tas::TasCache;

/// The mutable state behind the cache lock
#[derive(Debug, Default)]
struct CacheInner {
    /// The runtime feature flags
    features: Features,
    /// The resource flavors observed so far
    flavors: HashMap<FlavorName, ResourceFlavor>,
    /// The topologies observed so far
    topologies: HashMap<String, Topology>,
    /// The admission checks observed so far
    checks: HashMap<String, AdmissionCheck>,
    /// The cohort forest
    cohorts: HashMap<String, CohortState>,
    /// The cluster queues
    queues: HashMap<String, QueueState>,
    /// The local queue specs by namespace/name key
    local_queues: HashMap<String, LocalQueue>,
    /// Which cluster queue each workload key is tracked by
    workload_index: HashMap<String, String>,
    /// Bumped whenever capacity may have been freed anywhere
    generation: u64,
    /// The topology aware scheduling sync state
    tas: TasCache,
}

/// The process wide quota cache
#[derive(Debug, Default)]
pub struct Cache {
    /// The state behind the lock
    inner: RwLock<CacheInner>,
}

impl Cache {
    /// Create a cache with the configured feature flags
    ///
    /// # Arguments
    ///
    /// * `conf` - The Warden config
    pub fn new(conf: &Conf) -> Self {
        Cache {
            inner: RwLock::new(CacheInner {
                features: conf.features,
                ..CacheInner::default()
            }),
        }
    }

    /// Take a point in time snapshot for one scheduling pass
    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.read().unwrap();
        Snapshot {
            queues: inner.queues.clone(),
            cohorts: inner.cohorts.clone(),
            flavors: inner.flavors.clone(),
            features: inner.features,
            generation: inner.generation,
        }
    }

    /// The current cache generation
    pub fn generation(&self) -> u64 {
        self.inner.read().unwrap().generation
    }

    /// The allocatable generation of one queue, used to recognize stale
    /// scheduling attempts
    ///
    /// # Arguments
    ///
    /// * `queue` - The queue to look up
    pub fn queue_generation(&self, queue: &str) -> Option<u64> {
        self.inner.read().unwrap().queues.get(queue).map(|state| state.generation)
    }

    /// Add or update a resource flavor
    ///
    /// # Arguments
    ///
    /// * `flavor` - The observed flavor
    pub fn add_or_update_flavor(&self, flavor: ResourceFlavor) {
        let mut inner = self.inner.write().unwrap();
        inner.flavors.insert(flavor.name.clone(), flavor);
        inner.refresh_all_statuses();
    }

    /// Delete a resource flavor
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the deleted flavor
    pub fn delete_flavor(&self, name: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.flavors.remove(name);
        inner.tas.forget(&name.to_owned());
        inner.refresh_all_statuses();
    }

    /// Add or update a topology
    ///
    /// # Arguments
    ///
    /// * `topology` - The observed topology
    pub fn add_or_update_topology(&self, topology: Topology) {
        let mut inner = self.inner.write().unwrap();
        inner.topologies.insert(topology.name.clone(), topology);
        inner.refresh_all_statuses();
    }

    /// Delete a topology
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the deleted topology
    pub fn delete_topology(&self, name: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.topologies.remove(name);
        inner.refresh_all_statuses();
    }

    /// Add or update an admission check
    ///
    /// # Arguments
    ///
    /// * `check` - The observed check
    pub fn add_or_update_check(&self, check: AdmissionCheck) {
        let mut inner = self.inner.write().unwrap();
        inner.checks.insert(check.name.clone(), check);
        inner.refresh_all_statuses();
    }

    /// Delete an admission check
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the deleted check
    pub fn delete_check(&self, name: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.checks.remove(name);
        inner.refresh_all_statuses();
    }

    /// Add or update a cohort
    ///
    /// A parent edge that would close a cycle is rejected: the old edge
    /// stays installed, the update fails with `CohortCycle`, and every
    /// queue under the rejected cohort flips to Pending until the
    /// configuration is fixed.
    ///
    /// # Arguments
    ///
    /// * `cohort` - The observed cohort
    pub fn add_or_update_cohort(&self, cohort: Cohort) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap();
        inner.upsert_cohort(cohort)
    }

    /// Delete a cohort
    ///
    /// A cohort still referenced by queues or child cohorts reverts to an
    /// implicit root with no quota of its own.
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the deleted cohort
    pub fn delete_cohort(&self, name: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.remove_cohort(name);
    }

    /// Add or update a cluster queue
    ///
    /// # Arguments
    ///
    /// * `spec` - The observed queue spec
    pub fn add_or_update_cluster_queue(&self, spec: ClusterQueue) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap();
        inner.upsert_cluster_queue(spec)
    }

    /// Mark a cluster queue terminating and remove it once drained
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the deleted queue
    pub fn delete_cluster_queue(&self, name: &str) {
        let mut guard = self.inner.write().unwrap();
        let inner = &mut *guard;
        let Some(queue) = inner.queues.get_mut(name) else {
            return;
        };
        queue.status = ClusterQueueStatus::Terminating;
        let drained = queue.workloads.is_empty();
        inner.generation += 1;
        if drained {
            inner.remove_cluster_queue(name);
        }
    }

    /// Register a local queue and back-fill its counters
    ///
    /// # Arguments
    ///
    /// * `queue` - The observed local queue
    pub fn add_local_queue(&self, queue: LocalQueue) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap();
        let key = queue.key();
        if inner.local_queues.contains_key(&key) {
            return Err(Error::QueueAlreadyExists(key));
        }
        if let Some(state) = inner.queues.get_mut(&queue.cluster_queue) {
            state.add_local_queue(&queue);
        }
        inner.local_queues.insert(key, queue);
        Ok(())
    }

    /// Drop a local queue
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key of the deleted queue
    pub fn delete_local_queue(&self, key: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(queue) = inner.local_queues.remove(key) {
            if let Some(state) = inner.queues.get_mut(&queue.cluster_queue) {
                state.local_queues.remove(key);
            }
        }
    }

    /// Add or update a workload, keeping usage ledgers in step
    ///
    /// # Arguments
    ///
    /// * `workload` - The observed workload
    pub fn add_or_update_workload(&self, workload: Workload) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap();
        inner.upsert_workload(workload)
    }

    /// Delete a workload, releasing its usage
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key of the deleted workload
    pub fn delete_workload(&self, key: &str) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap();
        inner.remove_workload(key)
    }

    /// Record the state an admission check controller reported
    ///
    /// A rejection deactivates and evicts the workload; once every check
    /// referenced by the queue is ready the workload is admitted.
    ///
    /// # Arguments
    ///
    /// * `key` - The workload's namespace/name key
    /// * `check` - The check that reported
    /// * `state` - The reported state
    pub fn set_check_state(&self, key: &str, check: &str, state: CheckState) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap();
        let cq = inner.queue_of(key)?;
        let mut workload = inner.detach_workload(&cq, key)?;
        workload.status.check_states.insert(check.to_owned(), state);
        match state {
            CheckState::Rejected => {
                workload.active = false;
                workload.status.admission = None;
                let message = format!("admission check {check} rejected this workload");
                workload.set_condition(ConditionType::Evicted, true, REASON_CHECK_REJECTED, &message);
                workload.set_condition(ConditionType::Admitted, false, REASON_CHECK_REJECTED, &message);
                inner.generation += 1;
            }
            CheckState::Retry => {
                workload.status.admission = None;
                let message = format!("admission check {check} asked for a retry");
                workload.set_condition(ConditionType::Evicted, true, REASON_CHECK_REJECTED, &message);
                workload.set_condition(ConditionType::Admitted, false, REASON_CHECK_REJECTED, &message);
                workload.set_condition(ConditionType::Requeued, true, "Requeued", "workload requeued");
                inner.generation += 1;
            }
            CheckState::Ready | CheckState::Pending => {
                // admit once every referenced check is ready
                let check_names: Vec<String> = inner
                    .queues
                    .get(&cq)
                    .map(|queue| {
                        queue.spec.admission_checks.iter().map(|check| check.name.clone()).collect()
                    })
                    .unwrap_or_default();
                if workload.has_quota_reservation() && workload.all_checks_ready(check_names.iter())
                {
                    workload.set_condition(
                        ConditionType::Admitted,
                        true,
                        "Admitted",
                        "all admission checks passed",
                    );
                }
            }
        }
        inner.attach_workload(&cq, workload);
        Ok(())
    }

    /// Mark a workload admitted, moving it into the admitted ledgers
    ///
    /// # Arguments
    ///
    /// * `key` - The workload's namespace/name key
    pub fn admit_workload(&self, key: &str) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap();
        let cq = inner.queue_of(key)?;
        let mut workload = inner.detach_workload(&cq, key)?;
        if !workload.has_quota_reservation() {
            inner.attach_workload(&cq, workload);
            return Err(Error::new(format!("workload {key} holds no quota reservation")));
        }
        workload.set_condition(ConditionType::Admitted, true, "Admitted", "all admission checks passed");
        inner.attach_workload(&cq, workload);
        Ok(())
    }

    /// Evict a workload, releasing its reservation
    ///
    /// # Arguments
    ///
    /// * `key` - The workload's namespace/name key
    /// * `reason` - The camel case reason code
    /// * `message` - The human readable message
    pub fn evict_workload(&self, key: &str, reason: &str, message: &str) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap();
        let cq = inner.queue_of(key)?;
        let mut workload = inner.detach_workload(&cq, key)?;
        workload.status.admission = None;
        workload.set_condition(ConditionType::Evicted, true, reason, message);
        workload.set_condition(ConditionType::Admitted, false, reason, message);
        // eviction frees capacity, so older failed attempts are stale now
        inner.generation += 1;
        if let Some(queue) = inner.queues.get_mut(&cq) {
            queue.generation += 1;
        }
        inner.attach_workload(&cq, workload);
        Ok(())
    }

    /// Return an evicted workload to the pending pool
    ///
    /// # Arguments
    ///
    /// * `key` - The workload's namespace/name key
    pub fn requeue_workload(&self, key: &str) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap();
        let cq = inner.queue_of(key)?;
        let mut workload = inner.detach_workload(&cq, key)?;
        workload.set_condition(ConditionType::Requeued, true, "Requeued", "workload requeued");
        inner.attach_workload(&cq, workload);
        Ok(())
    }

    /// Record that a workload finished and stop tracking it
    ///
    /// # Arguments
    ///
    /// * `key` - The workload's namespace/name key
    pub fn finish_workload(&self, key: &str) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap();
        inner.remove_workload(key)
    }

    /// Mark a topology flavor synced and account deferred workloads
    ///
    /// # Arguments
    ///
    /// * `flavor` - The flavor the TAS module finished syncing
    pub fn set_tas_synced(&self, flavor: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.tas.set_synced(flavor.to_owned());
        inner.account_deferred();
    }

    /// The readiness of a cluster queue with its reason and message
    ///
    /// # Arguments
    ///
    /// * `name` - The queue to report on
    pub fn cluster_queue_readiness(
        &self,
        name: &str,
    ) -> Result<(ClusterQueueStatus, ActiveReason, String), Error> {
        let inner = self.inner.read().unwrap();
        match inner.queues.get(name) {
            Some(queue) => Ok(queue.readiness(&inner.features)),
            None => Err(Error::UnknownQueue(name.to_owned())),
        }
    }
}

impl CacheInner {
    /// The cluster queue a workload is tracked by
    fn queue_of(&self, key: &str) -> Result<String, Error> {
        match self.workload_index.get(key) {
            Some(cq) => Ok(cq.clone()),
            None => Err(Error::UnknownWorkload(key.to_owned())),
        }
    }

    /// Recompute validation and status for every queue
    fn refresh_all_statuses(&mut self) {
        let features = self.features;
        for queue in self.queues.values_mut() {
            queue.cohort_cycle = cohorts::cycle_in_chain(&self.cohorts, queue.spec.cohort.as_ref());
            queue.refresh_validation(&self.flavors, &self.topologies, &self.checks, &features);
            queue.refresh_status(&features);
        }
    }

    /// Charge or release a workload against its queue and cohort chain
    ///
    /// Self-heals by rebuilding the queue's ledgers from its workload set
    /// if a release would drive usage negative.
    fn charge(&mut self, cq_name: &str, workload: &Workload, sign: i64) {
        let lending = self.features.lending_limit;
        let lq_metrics = self.features.local_queue_metrics;
        let Some(queue) = self.queues.get_mut(cq_name) else {
            return;
        };
        let (usage, clamped) = queue.apply_usage(workload, sign, lq_metrics);
        let deltas = cohorts::upward_deltas(&queue.node, &usage, sign, lending);
        let cohort = queue.spec.cohort.clone();
        let chain_clamped =
            cohorts::propagate_usage(&mut self.cohorts, cohort.as_ref(), deltas, lending);
        if clamped || chain_clamped {
            event!(
                Level::ERROR,
                queue = cq_name,
                workload = workload.key(),
                "usage went negative, rebuilding the queue ledgers",
            );
            self.rebuild_queue(cq_name);
        }
    }

    /// Rebuild one queue's ledgers from its workload set
    fn rebuild_queue(&mut self, name: &str) {
        let lending = self.features.lending_limit;
        let lq_metrics = self.features.local_queue_metrics;
        let Some(queue) = self.queues.get_mut(name) else {
            return;
        };
        let cohort = queue.spec.cohort.clone();
        queue.rebuild_usage(lq_metrics);
        // the tree recompute fixes the cohort ledgers above
        cohorts::refresh_tree_for(&mut self.cohorts, &self.queues, cohort.as_ref(), lending);
    }

    /// Whether accounting for a workload must wait on the TAS module
    fn must_defer(&self, cq: &QueueState, workload: &Workload) -> bool {
        if !self.features.topology_aware_scheduling || cq.tas_flavors.is_empty() {
            return false;
        }
        let Some(admission) = &workload.status.admission else {
            return false;
        };
        // defer if any assigned topology flavor has not synced yet
        admission
            .pod_set_assignments
            .iter()
            .flat_map(|assignment| assignment.flavors.values())
            .any(|flavor| cq.tas_flavors.contains_key(flavor) && !self.tas.is_synced(flavor))
    }

    /// Insert a workload into its queue and charge it if accountable
    ///
    /// A reservation whose referenced checks are all ready, vacuously so
    /// for queues with no checks, is admitted on the spot.
    fn attach_workload(&mut self, cq_name: &str, mut workload: Workload) {
        if workload.active && workload.has_quota_reservation() && !workload.is_admitted() {
            let checks_ready = self
                .queues
                .get(cq_name)
                .map(|queue| {
                    let names: Vec<String> = queue
                        .spec
                        .admission_checks
                        .iter()
                        .map(|check| check.name.clone())
                        .collect();
                    workload.all_checks_ready(names.iter())
                })
                .unwrap_or(false);
            if checks_ready {
                workload.set_condition(
                    ConditionType::Admitted,
                    true,
                    "Admitted",
                    "all admission checks passed",
                );
            }
        }
        let key = workload.key();
        let defer = self
            .queues
            .get(cq_name)
            .map(|queue| self.must_defer(queue, &workload))
            .unwrap_or(false);
        let Some(queue) = self.queues.get_mut(cq_name) else {
            return;
        };
        let reserving = workload.has_quota_reservation();
        queue.workloads.insert(key.clone(), workload.clone());
        self.workload_index.insert(key.clone(), cq_name.to_owned());
        if reserving {
            if defer {
                event!(
                    Level::DEBUG,
                    workload = key,
                    "deferring usage accounting until the topology cache syncs",
                );
                self.queues.get_mut(cq_name).unwrap().deferred_tas.insert(key);
            } else {
                self.charge(cq_name, &workload, 1);
            }
        }
    }

    /// Pull a workload out of its queue, releasing any charged usage
    fn detach_workload(&mut self, cq_name: &str, key: &str) -> Result<Workload, Error> {
        let Some(queue) = self.queues.get_mut(cq_name) else {
            return Err(Error::UnknownQueue(cq_name.to_owned()));
        };
        let Some(workload) = queue.workloads.remove(key) else {
            return Err(Error::UnknownWorkload(key.to_owned()));
        };
        let deferred = queue.deferred_tas.remove(key);
        if workload.has_quota_reservation() && !deferred {
            self.charge(cq_name, &workload, -1);
        }
        self.workload_index.remove(key);
        Ok(workload)
    }

    /// Upsert a workload observed by the watchers
    fn upsert_workload(&mut self, workload: Workload) -> Result<(), Error> {
        let key = workload.key();
        // resolve the target cluster queue through the local queue
        let lq_key = format!("{}/{}", workload.namespace, workload.queue);
        let Some(local_queue) = self.local_queues.get(&lq_key) else {
            return Err(Error::UnknownQueue(lq_key));
        };
        let cq_name = local_queue.cluster_queue.clone();
        if !self.queues.contains_key(&cq_name) {
            return Err(Error::UnknownQueue(cq_name));
        }
        // a workload moves queues only through a delete then an add
        if let Some(current) = self.workload_index.get(&key).cloned() {
            if current != cq_name {
                return Err(Error::WorkloadAlreadyExists {
                    workload: key,
                    cluster_queue: current,
                });
            }
            let _ = self.detach_workload(&cq_name, &key)?;
        }
        self.attach_workload(&cq_name, workload);
        Ok(())
    }

    /// Remove a workload and release its usage
    fn remove_workload(&mut self, key: &str) -> Result<(), Error> {
        let cq = self.queue_of(key)?;
        let _ = self.detach_workload(&cq, key)?;
        // deletions free capacity, so bump the allocatable generations
        self.generation += 1;
        if let Some(queue) = self.queues.get_mut(&cq) {
            queue.generation += 1;
        }
        // a terminating queue is removed once its last workload drains
        let drained = self
            .queues
            .get(&cq)
            .map(|queue| queue.status == ClusterQueueStatus::Terminating && queue.workloads.is_empty())
            .unwrap_or(false);
        if drained {
            self.remove_cluster_queue(&cq);
        }
        Ok(())
    }

    /// Re-account deferred workloads whose topology flavors are synced
    fn account_deferred(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            let ready: Vec<String> = {
                let Some(queue) = self.queues.get(&name) else {
                    continue;
                };
                queue
                    .deferred_tas
                    .iter()
                    .filter(|key| {
                        queue
                            .workloads
                            .get(*key)
                            .map(|workload| !self.must_defer(queue, workload))
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect()
            };
            for key in ready {
                let Some(queue) = self.queues.get_mut(&name) else {
                    continue;
                };
                queue.deferred_tas.remove(&key);
                if let Some(workload) = queue.workloads.get(&key).cloned() {
                    self.charge(&name, &workload, 1);
                }
            }
        }
    }

    /// Upsert a cohort observed by the watchers
    fn upsert_cohort(&mut self, cohort: Cohort) -> Result<(), Error> {
        let name = cohort.name.clone();
        let lending = self.features.lending_limit;
        // reject a parent edge that would close a cycle before touching
        // anything else
        if let Some(parent) = &cohort.parent {
            if cohorts::creates_cycle(&self.cohorts, parent, &name) {
                let state = self
                    .cohorts
                    .entry(name.clone())
                    .or_insert_with(|| CohortState::implicit(name.clone()));
                state.rejected_parent = Some(parent.clone());
                state.spec = Some(cohort.clone());
                self.refresh_all_statuses();
                return Err(Error::CohortCycle {
                    cohort: name,
                    parent: parent.clone(),
                });
            }
        }
        let state = self
            .cohorts
            .entry(name.clone())
            .or_insert_with(|| CohortState::implicit(name.clone()));
        let old_parent = state.parent.clone();
        state.spec = Some(cohort.clone());
        state.rejected_parent = None;
        state.node.quotas = node::ResourceNode::from_specs(cohort.quotas.iter()).quotas;
        state.node.reset_subtree();
        if old_parent != cohort.parent {
            // rewire the parent edge; the tree refreshes fix the ledgers
            if let Some(old) = &old_parent {
                if let Some(old_state) = self.cohorts.get_mut(old) {
                    old_state.child_cohorts.remove(&name);
                }
            }
            if let Some(new) = &cohort.parent {
                let parent = self
                    .cohorts
                    .entry(new.clone())
                    .or_insert_with(|| CohortState::implicit(new.clone()));
                parent.child_cohorts.insert(name.clone());
            }
            self.cohorts.get_mut(&name).unwrap().parent = cohort.parent.clone();
            cohorts::refresh_tree_for(&mut self.cohorts, &self.queues, old_parent.as_ref(), lending);
        }
        cohorts::refresh_tree_for(&mut self.cohorts, &self.queues, Some(&name), lending);
        self.bump_tree_generations(&name);
        self.refresh_all_statuses();
        Ok(())
    }

    /// Drop a cohort's spec, keeping an implicit root while referenced
    fn remove_cohort(&mut self, name: &str) {
        let lending = self.features.lending_limit;
        let Some(state) = self.cohorts.get(name) else {
            return;
        };
        let old_parent = state.parent.clone();
        // detach from the parent either way
        if let Some(old) = &old_parent {
            if let Some(old_state) = self.cohorts.get_mut(old) {
                old_state.child_cohorts.remove(name);
            }
        }
        let in_use = {
            let state = self.cohorts.get_mut(name).unwrap();
            state.spec = None;
            state.parent = None;
            state.rejected_parent = None;
            state.node.quotas.clear();
            state.node.reset_subtree();
            state.in_use()
        };
        if in_use {
            cohorts::refresh_tree_for(
                &mut self.cohorts,
                &self.queues,
                Some(&name.to_owned()),
                lending,
            );
        } else {
            self.cohorts.remove(name);
        }
        cohorts::refresh_tree_for(&mut self.cohorts, &self.queues, old_parent.as_ref(), lending);
        self.refresh_all_statuses();
    }

    /// Upsert a cluster queue observed by the watchers
    fn upsert_cluster_queue(&mut self, spec: ClusterQueue) -> Result<(), Error> {
        let name = spec.name.clone();
        let lending = self.features.lending_limit;
        if !self.queues.contains_key(&name) {
            let mut state = QueueState::new(spec.clone());
            state.generation = 1;
            // back-fill any local queues observed before this queue
            let locals: Vec<LocalQueue> = self
                .local_queues
                .values()
                .filter(|queue| queue.cluster_queue == name)
                .cloned()
                .collect();
            for local in &locals {
                state.add_local_queue(local);
            }
            self.queues.insert(name.clone(), state);
            if let Some(cohort) = spec.cohort.clone() {
                self.attach_queue(&name, &cohort);
            }
            cohorts::refresh_tree_for(&mut self.cohorts, &self.queues, spec.cohort.as_ref(), lending);
        } else {
            let (old_cohort, shape_changed) = {
                let state = self.queues.get_mut(&name).unwrap();
                let old_cohort = state.spec.cohort.clone();
                (old_cohort, state.refresh_spec(spec.clone()))
            };
            if old_cohort != spec.cohort {
                if let Some(old) = old_cohort.clone() {
                    self.detach_queue(&name, &old);
                }
                if let Some(new) = spec.cohort.clone() {
                    self.attach_queue(&name, &new);
                }
                cohorts::refresh_tree_for(&mut self.cohorts, &self.queues, old_cohort.as_ref(), lending);
            }
            if shape_changed {
                self.generation += 1;
                if let Some(state) = self.queues.get_mut(&name) {
                    state.generation += 1;
                }
            }
            cohorts::refresh_tree_for(&mut self.cohorts, &self.queues, spec.cohort.as_ref(), lending);
        }
        self.refresh_all_statuses();
        Ok(())
    }

    /// Attach a queue to a cohort, creating an implicit one if needed
    ///
    /// The caller refreshes the affected trees afterwards, which settles
    /// both the subtree quotas and the cohort usage ledgers.
    fn attach_queue(&mut self, queue_name: &str, cohort_name: &str) {
        let cohort = self
            .cohorts
            .entry(cohort_name.to_owned())
            .or_insert_with(|| CohortState::implicit(cohort_name.to_owned()));
        cohort.child_queues.insert(queue_name.to_owned());
    }

    /// Detach a queue from a cohort, dropping unused implicit cohorts
    fn detach_queue(&mut self, queue_name: &str, cohort_name: &str) {
        let drop_cohort = match self.cohorts.get_mut(cohort_name) {
            Some(cohort) => {
                cohort.child_queues.remove(queue_name);
                !cohort.in_use() && cohort.parent.is_none()
            }
            None => false,
        };
        if drop_cohort {
            self.cohorts.remove(cohort_name);
        }
    }

    /// Physically remove a drained cluster queue
    fn remove_cluster_queue(&mut self, name: &str) {
        let cohort = self.queues.get(name).and_then(|queue| queue.spec.cohort.clone());
        if let Some(cohort) = &cohort {
            self.detach_queue(name, cohort);
        }
        self.queues.remove(name);
        let lending = self.features.lending_limit;
        cohorts::refresh_tree_for(&mut self.cohorts, &self.queues, cohort.as_ref(), lending);
        self.generation += 1;
    }

    /// Bump the allocatable generation of every queue in one cohort tree
    fn bump_tree_generations(&mut self, cohort: &str) {
        let root = cohorts::root_of(&self.cohorts, cohort);
        let mut stack = vec![root];
        let mut seen = std::collections::HashSet::new();
        self.generation += 1;
        while let Some(name) = stack.pop() {
            if !seen.insert(name.clone()) {
                continue;
            }
            let Some(cohort) = self.cohorts.get(&name) else {
                continue;
            };
            let queues: Vec<String> = cohort.child_queues.iter().cloned().collect();
            stack.extend(cohort.child_cohorts.iter().cloned());
            for queue_name in queues {
                if let Some(queue) = self.queues.get_mut(&queue_name) {
                    queue.generation += 1;
                }
            }
        }
    }
}
