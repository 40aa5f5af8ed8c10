//! The scheduler loop
//!
//! Each tick snapshots the cache, walks the pending workloads in fairness
//! order, and turns decisions into idempotent intents against the object
//! store. The loop never holds the cache lock while deciding or emitting.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{event, instrument, Level};
use warden::models::workloads::{Admission, ConditionType, REASON_PREEMPTED};
use warden::models::{QueueingStrategy, Workload};
use warden::{Conf, Error};

use super::cache::snapshot::Snapshot;
use super::cache::Cache;
use super::fairshare;
use super::flavors::{self, AssignmentMode};
use super::preemption;
use super::store::ObjectStore;

/// One externally visible side effect of a scheduling pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// Reserve quota for a workload
    Reserve {
        /// The workload's namespace/name key
        key: String,
        /// The cluster queue the reservation lands in
        queue: String,
        /// The queue generation the decision was made against
        generation: u64,
        /// The admission record to write
        admission: Admission,
    },
    /// Evict a victim to make room
    Evict {
        /// The victim's namespace/name key
        key: String,
        /// The cluster queue the victim held quota in
        queue: String,
        /// The human readable message
        message: String,
    },
}

/// What one scheduling pass decided
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassOutcome {
    /// The workloads that got reservations, in decision order
    pub reserved: Vec<String>,
    /// The victims selected for eviction
    pub evicted: Vec<String>,
    /// Why each unadmitted workload could not be scheduled
    pub unschedulable: BTreeMap<String, String>,
}

/// A queue head under consideration in one pass
#[derive(Debug, Clone)]
struct Head {
    /// The cluster queue this head leads
    queue: String,
    /// The pending workload itself
    workload: Workload,
    /// When the workload became eligible
    eligible: DateTime<Utc>,
    /// The queue's dominant share, when fair sharing orders heads
    share: u64,
}

/// The admission decision loop
pub struct Scheduler {
    /// The cache to snapshot
    cache: Arc<Cache>,
    /// The store intents are emitted against
    store: Arc<dyn ObjectStore>,
    /// The Warden config
    conf: Conf,
    /// Compute decisions but emit nothing
    dry_run: bool,
    /// The shutdown signal, checked between head attempts
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    /// Create a new scheduler loop
    ///
    /// # Arguments
    ///
    /// * `cache` - The cache to snapshot
    /// * `store` - The store intents are emitted against
    /// * `conf` - The Warden config
    /// * `shutdown` - The shutdown signal
    pub fn new(
        cache: Arc<Cache>,
        store: Arc<dyn ObjectStore>,
        conf: Conf,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Scheduler {
            cache,
            store,
            conf,
            dry_run: false,
            shutdown,
        }
    }

    /// Compute decisions without emitting intents
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    /// Run scheduling passes until shutdown
    pub async fn start(&mut self) -> Result<(), Error> {
        let mut shutdown = self.shutdown.clone();
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.conf.scheduler.tick_millis));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // pass errors end the pass, the next tick starts fresh
                    if let Err(error) = self.pass().await {
                        event!(Level::ERROR, %error, "scheduling pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        event!(Level::INFO, "scheduler shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Take one scheduling pass over a fresh snapshot
    #[instrument(name = "Scheduler::pass", skip_all)]
    pub async fn pass(&self) -> Result<PassOutcome, Error> {
        let mut snap = self.cache.snapshot();
        let mut outcome = PassOutcome::default();
        let mut intents = Vec::new();
        // each pending workload is attempted at most once per pass, and a
        // strict fifo queue stops at its first unadmittable head
        let mut attempted: HashSet<String> = HashSet::new();
        let mut blocked: HashSet<String> = HashSet::new();
        'pass: loop {
            let heads = self.heads(&snap, &attempted, &blocked);
            if heads.is_empty() {
                break;
            }
            for head in heads {
                if *self.shutdown.borrow() {
                    break 'pass;
                }
                attempted.insert(head.workload.key());
                self.attempt(&mut snap, &head, &mut intents, &mut outcome, &mut blocked);
            }
        }
        if !self.dry_run {
            self.emit(&intents).await;
            self.sync_queue_statuses(&snap).await;
        }
        event!(
            Level::INFO,
            reserved = outcome.reserved.len(),
            evicted = outcome.evicted.len(),
            unschedulable = outcome.unschedulable.len(),
        );
        Ok(outcome)
    }

    /// Write every queue's readiness condition to the store
    ///
    /// The writes are idempotent upserts, so re-emitting an unchanged
    /// status each pass is harmless.
    async fn sync_queue_statuses(&self, snap: &Snapshot) {
        for (name, queue) in &snap.queues {
            let (status, reason, message) = queue.readiness(&snap.features);
            if let Err(error) = self.store.update_queue_status(name, status, reason, &message).await
            {
                event!(Level::DEBUG, %error, queue = name, "failed to write a queue status");
            }
        }
    }

    /// Try to admit one head, recording intents and reasons
    fn attempt(
        &self,
        snap: &mut Snapshot,
        head: &Head,
        intents: &mut Vec<Intent>,
        outcome: &mut PassOutcome,
        blocked: &mut HashSet<String>,
    ) {
        let key = head.workload.key();
        let plan = flavors::assign(snap, &head.queue, &head.workload);
        match plan.mode {
            Some(AssignmentMode::Fit) => {
                let admission = plan.admission(&head.queue);
                self.reserve(snap, head, admission, intents, outcome);
            }
            Some(AssignmentMode::Preempt) => {
                let admission = plan.admission(&head.queue);
                // the victim hunt works on a hypothetical reservation
                let mut hypothetical = head.workload.clone();
                hypothetical.status.admission = Some(admission.clone());
                let victims = preemption::find_victims(
                    snap,
                    &hypothetical,
                    self.conf.scheduler.fair_share_strategy,
                    self.conf.scheduler.wait_for_pods_ready.requeuing_strategy,
                );
                match victims {
                    Some(victims) => {
                        for victim in victims {
                            intents.push(Intent::Evict {
                                key: victim.key.clone(),
                                queue: victim.queue,
                                message: format!("preempted to accommodate {key}"),
                            });
                            outcome.evicted.push(victim.key);
                        }
                        self.reserve(snap, head, admission, intents, outcome);
                    }
                    None => {
                        let reason = "preemption could not free enough capacity".to_owned();
                        outcome.unschedulable.insert(key.clone(), reason);
                        self.block_if_strict(snap, head, &key, outcome, blocked);
                    }
                }
            }
            Some(AssignmentMode::NoFit) | None => {
                outcome.unschedulable.insert(key.clone(), plan.reason.clone());
                self.block_if_strict(snap, head, &key, outcome, blocked);
            }
        }
    }

    /// Apply a reservation to the snapshot and record its intent
    fn reserve(
        &self,
        snap: &mut Snapshot,
        head: &Head,
        admission: Admission,
        intents: &mut Vec<Intent>,
        outcome: &mut PassOutcome,
    ) {
        let key = head.workload.key();
        let mut reserved = head.workload.clone();
        reserved.status.admission = Some(admission.clone());
        reserved.set_condition(
            ConditionType::QuotaReserved,
            true,
            "QuotaReserved",
            format!("quota reserved in cluster queue {}", head.queue),
        );
        snap.add_workload(&reserved);
        let generation = snap.queues.get(&head.queue).map(|queue| queue.generation).unwrap_or(0);
        intents.push(Intent::Reserve {
            key: key.clone(),
            queue: head.queue.clone(),
            generation,
            admission,
        });
        outcome.reserved.push(key);
    }

    /// On a strict fifo queue, a failed head blocks everything behind it
    fn block_if_strict(
        &self,
        snap: &Snapshot,
        head: &Head,
        head_key: &str,
        outcome: &mut PassOutcome,
        blocked: &mut HashSet<String>,
    ) {
        let Some(queue) = snap.queues.get(&head.queue) else {
            return;
        };
        if queue.spec.queueing_strategy != QueueingStrategy::StrictFifo {
            return;
        }
        blocked.insert(head.queue.clone());
        for workload in queue.workloads.values() {
            let key = workload.key();
            if workload.is_pending() && key != head_key {
                outcome.unschedulable.insert(
                    key,
                    format!("blocked by head-of-line workload {head_key}"),
                );
            }
        }
    }

    /// Collect the current head of every admissible queue, in order
    fn heads(&self, snap: &Snapshot, attempted: &HashSet<String>, blocked: &HashSet<String>) -> Vec<Head> {
        let strategy = self.conf.scheduler.wait_for_pods_ready.requeuing_strategy;
        let fair = snap.features.fair_sharing;
        let mut heads = Vec::new();
        for (name, queue) in &snap.queues {
            if !queue.is_active() || blocked.contains(name) {
                continue;
            }
            // the head is the best pending workload not yet attempted
            let mut pending: Vec<&Workload> = queue
                .workloads
                .values()
                .filter(|workload| workload.is_pending() && !attempted.contains(&workload.key()))
                .collect();
            pending.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.eligible_at(strategy).cmp(&b.eligible_at(strategy)))
                    .then(a.name.cmp(&b.name))
            });
            if let Some(workload) = pending.first() {
                heads.push(Head {
                    queue: name.clone(),
                    workload: (*workload).clone(),
                    eligible: workload.eligible_at(strategy),
                    share: if fair {
                        fairshare::dominant_share(snap, name, None).value
                    } else {
                        0
                    },
                });
            }
        }
        // cross queue ordering: fairness first when enabled, then age
        heads.sort_by(|a, b| {
            a.share
                .cmp(&b.share)
                .then(a.eligible.cmp(&b.eligible))
                .then(a.workload.name.cmp(&b.workload.name))
        });
        heads
    }

    /// Emit intents with retries, dropping stale and conflicted ones
    async fn emit(&self, intents: &[Intent]) {
        for intent in intents {
            // a decision made against an outdated queue generation is
            // recomputed on the next pass instead of being applied
            if let Intent::Reserve { queue, generation, .. } = intent {
                if self.cache.queue_generation(queue) != Some(*generation) {
                    event!(Level::WARN, queue, "dropping a stale reservation intent");
                    continue;
                }
            }
            let mut delay = Duration::from_millis(self.conf.scheduler.intent_backoff_millis);
            for attempt in 0..self.conf.scheduler.intent_attempts {
                match self.apply(intent).await {
                    Ok(()) => break,
                    Err(Error::Conflict(msg)) => {
                        // the store is the conflict resolution authority
                        event!(Level::WARN, conflict = msg, "dropping a conflicted intent");
                        break;
                    }
                    Err(error) if error.is_transient() && attempt + 1 < self.conf.scheduler.intent_attempts => {
                        event!(Level::DEBUG, %error, attempt, "retrying intent emission");
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                    Err(error) => {
                        event!(Level::ERROR, %error, "failed to emit an intent");
                        break;
                    }
                }
            }
        }
    }

    /// Apply one intent against the store
    async fn apply(&self, intent: &Intent) -> Result<(), Error> {
        match intent {
            Intent::Reserve { key, admission, .. } => self.store.reserve_quota(key, admission).await,
            Intent::Evict { key, message, .. } => {
                self.store.evict_workload(key, REASON_PREEMPTED, message).await
            }
        }
    }
}
