//! End to end admission scenarios against a real cache and store

use std::sync::Arc;

use tokio::sync::watch;
use warden::models::queues::{
    CheckRef, FlavorQuotas, PreemptionPolicy, QueueingStrategy, ResourceGroup,
};
use warden::models::workloads::{
    Admission, ConditionType, PodSet, PodSetAssignment, REASON_PREEMPTED,
};
use warden::models::{
    ActiveReason, AdmissionCheck, ClusterQueue, ClusterQueueStatus, Cohort, FlavorResource,
    LocalQueue, ResourceFlavor, Topology, CPU, MULTIKUEUE_CONTROLLER,
};
use warden::Conf;
use warden_scheduler::{Cache, MemoryStore, ObjectStore, Scheduler};

/// build a cluster queue spec with one cpu flavor
fn queue_spec(name: &str, cohort: Option<&str>, cpu: i64) -> ClusterQueue {
    let mut spec = ClusterQueue::new(name);
    spec.cohort = cohort.map(String::from);
    spec.resource_groups.push(ResourceGroup {
        covered: [CPU.to_string()].into_iter().collect(),
        flavors: vec![FlavorQuotas::new("default").quota(CPU, cpu)],
    });
    spec
}

/// build a pending workload submitted through a local queue
fn pending(name: &str, local_queue: &str, cpu: i64, priority: i32) -> warden::models::Workload {
    warden::models::Workload::new("team-a", name, local_queue)
        .pod_set(PodSet::new("main", 1).request(CPU, cpu))
        .priority(priority)
}

/// build a workload that already holds a reservation in a queue
fn reserving(name: &str, local_queue: &str, cq: &str, cpu: i64) -> warden::models::Workload {
    let mut wl = pending(name, local_queue, cpu, 0);
    wl.status.admission = Some(Admission {
        cluster_queue: cq.into(),
        pod_set_assignments: vec![PodSetAssignment {
            name: "main".into(),
            flavors: [(CPU.to_string(), "default".to_string())].into_iter().collect(),
            count: 1,
        }],
    });
    wl.set_condition(ConditionType::QuotaReserved, true, "QuotaReserved", "quota granted");
    wl
}

/// wire a scheduler over a cache and store
fn scheduler(cache: &Arc<Cache>, store: &Arc<MemoryStore>, conf: Conf) -> Scheduler {
    // the sender may drop, pass() only polls the current value
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let store: Arc<dyn ObjectStore> = store.clone();
    Scheduler::new(cache.clone(), store, conf, shutdown_rx)
}

/// the cpu key on the default flavor
fn cpu_key() -> FlavorResource {
    FlavorResource::new("default", CPU)
}

#[tokio::test]
async fn scenario_independent_queues() {
    let conf = Conf::default();
    let cache = Arc::new(Cache::new(&conf));
    let store = Arc::new(MemoryStore::new());
    cache.add_or_update_flavor(ResourceFlavor::new("default"));
    cache.add_or_update_cluster_queue(queue_spec("a", None, 4000)).unwrap();
    cache.add_or_update_cluster_queue(queue_spec("b", None, 4000)).unwrap();
    cache.add_local_queue(LocalQueue::new("team-a", "submit-a", "a")).unwrap();
    store.seed_workload(pending("x", "submit-a", 3000, 0));
    store.drain_into(&cache);
    let engine = scheduler(&cache, &store, conf);
    let outcome = engine.pass().await.unwrap();
    assert_eq!(outcome.reserved, vec!["team-a/x".to_string()]);
    store.drain_into(&cache);
    let snap = cache.snapshot();
    assert_eq!(snap.queues["a"].node.usage.get(&cpu_key()), 3000);
    assert!(snap.queues["b"].node.usage.is_empty());
    // the store recorded the reservation condition and queue readiness
    let stored = store.workload("team-a/x").unwrap();
    assert!(stored.condition_true(ConditionType::QuotaReserved));
    let (status, reason, message) = store.queue_status("a").unwrap();
    assert_eq!(status, ClusterQueueStatus::Active);
    assert_eq!(reason, ActiveReason::Ready);
    assert_eq!(message, "Can admit new workloads");
}

#[tokio::test]
async fn scenario_borrowing_across_cohort() {
    let conf = Conf::default();
    let cache = Arc::new(Cache::new(&conf));
    let store = Arc::new(MemoryStore::new());
    cache.add_or_update_flavor(ResourceFlavor::new("default"));
    cache.add_or_update_cohort(Cohort::new("pool")).unwrap();
    cache.add_or_update_cluster_queue(queue_spec("a", Some("pool"), 4000)).unwrap();
    cache.add_or_update_cluster_queue(queue_spec("b", Some("pool"), 4000)).unwrap();
    cache.add_local_queue(LocalQueue::new("team-a", "submit-a", "a")).unwrap();
    store.seed_workload(pending("x", "submit-a", 7000, 0));
    store.drain_into(&cache);
    let engine = scheduler(&cache, &store, conf);
    let outcome = engine.pass().await.unwrap();
    assert_eq!(outcome.reserved, vec!["team-a/x".to_string()]);
    store.drain_into(&cache);
    let snap = cache.snapshot();
    assert_eq!(snap.queues["a"].node.usage.get(&cpu_key()), 7000);
    assert_eq!(snap.cohorts["pool"].node.usage.get(&cpu_key()), 7000);
    // one cpu unit remains in the cohort
    assert_eq!(snap.cohorts["pool"].node.subtree_quota.get(&cpu_key()) - 7000, 1000);
}

#[tokio::test]
async fn scenario_preemption_on_reclaim() {
    let conf = Conf::default();
    let cache = Arc::new(Cache::new(&conf));
    let store = Arc::new(MemoryStore::new());
    cache.add_or_update_flavor(ResourceFlavor::new("default"));
    cache.add_or_update_cohort(Cohort::new("pool")).unwrap();
    cache.add_or_update_cluster_queue(queue_spec("a", Some("pool"), 4000)).unwrap();
    let mut spec_b = queue_spec("b", Some("pool"), 4000);
    spec_b.preemption.reclaim_within_cohort = PreemptionPolicy::Any;
    cache.add_or_update_cluster_queue(spec_b).unwrap();
    cache.add_local_queue(LocalQueue::new("team-a", "submit-a", "a")).unwrap();
    cache.add_local_queue(LocalQueue::new("team-a", "submit-b", "b")).unwrap();
    // x already borrows deep into b's nominal
    let x = reserving("x", "submit-a", "a", 7000);
    store.seed_workload(x.clone());
    store.drain_into(&cache);
    // y arrives in b at higher priority wanting its nominal back
    store.seed_workload(pending("y", "submit-b", 4000, 5));
    store.drain_into(&cache);
    let engine = scheduler(&cache, &store, conf);
    let outcome = engine.pass().await.unwrap();
    assert_eq!(outcome.reserved, vec!["team-a/y".to_string()]);
    assert_eq!(outcome.evicted, vec!["team-a/x".to_string()]);
    store.drain_into(&cache);
    let snap = cache.snapshot();
    assert_eq!(snap.queues["b"].node.usage.get(&cpu_key()), 4000);
    assert!(snap.queues["a"].node.usage.is_empty());
    // the victim carries the preemption reason on its eviction
    let evicted = store.workload("team-a/x").unwrap();
    let condition = evicted.condition(ConditionType::Evicted).unwrap();
    assert!(condition.status);
    assert_eq!(condition.reason, REASON_PREEMPTED);
}

#[tokio::test]
async fn scenario_strict_fifo_head_of_line() {
    let conf = Conf::default();
    let cache = Arc::new(Cache::new(&conf));
    let store = Arc::new(MemoryStore::new());
    cache.add_or_update_flavor(ResourceFlavor::new("default"));
    let mut spec = queue_spec("a", None, 4000);
    spec.queueing_strategy = QueueingStrategy::StrictFifo;
    cache.add_or_update_cluster_queue(spec).unwrap();
    cache.add_local_queue(LocalQueue::new("team-a", "submit-a", "a")).unwrap();
    // the head cannot fit, the later workload could
    store.seed_workload(pending("w1", "submit-a", 6000, 1));
    store.seed_workload(pending("w2", "submit-a", 1000, 1));
    store.drain_into(&cache);
    let engine = scheduler(&cache, &store, conf);
    let outcome = engine.pass().await.unwrap();
    assert!(outcome.reserved.is_empty());
    assert!(outcome.unschedulable["team-a/w1"].contains("insufficient quota"));
    // the blocked workload's reason names the blocking head
    assert!(outcome.unschedulable["team-a/w2"].contains("head-of-line"));
    assert!(outcome.unschedulable["team-a/w2"].contains("team-a/w1"));
}

#[tokio::test]
async fn scenario_fair_share_ordering() {
    let mut conf = Conf::default();
    conf.features.fair_sharing = true;
    let cache = Arc::new(Cache::new(&conf));
    let store = Arc::new(MemoryStore::new());
    cache.add_or_update_flavor(ResourceFlavor::new("default"));
    cache.add_or_update_cohort(Cohort::new("pool")).unwrap();
    let mut spec_a = queue_spec("a", Some("pool"), 10000);
    spec_a.fair_weight_millis = 1000;
    let mut spec_b = queue_spec("b", Some("pool"), 10000);
    spec_b.fair_weight_millis = 3000;
    cache.add_or_update_cluster_queue(spec_a).unwrap();
    cache.add_or_update_cluster_queue(spec_b).unwrap();
    cache.add_local_queue(LocalQueue::new("team-a", "submit-a", "a")).unwrap();
    cache.add_local_queue(LocalQueue::new("team-a", "submit-b", "b")).unwrap();
    // a already uses 5 of the lendable 20, b uses 3 at triple weight
    store.seed_workload(reserving("a-used", "submit-a", "a", 5000));
    store.seed_workload(reserving("b-used", "submit-b", "b", 3000));
    store.seed_workload(pending("a-head", "submit-a", 1000, 0));
    store.seed_workload(pending("b-head", "submit-b", 1000, 0));
    store.drain_into(&cache);
    let engine = scheduler(&cache, &store, conf);
    let outcome = engine.pass().await.unwrap();
    // the lighter share wins the tick even though a's head is older
    assert_eq!(
        outcome.reserved,
        vec!["team-a/b-head".to_string(), "team-a/a-head".to_string()]
    );
}

#[tokio::test]
async fn scenario_tas_with_multikueue_is_unsupported() {
    let mut conf = Conf::default();
    conf.features.topology_aware_scheduling = true;
    let cache = Arc::new(Cache::new(&conf));
    let store = Arc::new(MemoryStore::new());
    cache.add_or_update_topology(Topology {
        name: "racks".to_string(),
        levels: vec!["block".to_string(), "rack".to_string()],
    });
    cache.add_or_update_flavor(ResourceFlavor::new("default").topology("racks"));
    cache.add_or_update_check(AdmissionCheck::new("dispatch", MULTIKUEUE_CONTROLLER));
    let mut spec = queue_spec("a", None, 4000);
    spec.admission_checks.push(CheckRef::new("dispatch"));
    cache.add_or_update_cluster_queue(spec).unwrap();
    let (status, reason, message) = cache.cluster_queue_readiness("a").unwrap();
    assert_eq!(status, ClusterQueueStatus::Pending);
    assert_eq!(reason, ActiveReason::NotSupportedWithTopologyAwareScheduling);
    assert!(message.contains("not supported"));
    // a pending queue admits nothing
    cache.add_local_queue(LocalQueue::new("team-a", "submit-a", "a")).unwrap();
    store.seed_workload(pending("x", "submit-a", 1000, 0));
    store.drain_into(&cache);
    let engine = scheduler(&cache, &store, conf);
    let outcome = engine.pass().await.unwrap();
    assert!(outcome.reserved.is_empty());
}

#[tokio::test]
async fn transient_store_failures_are_retried() {
    let mut conf = Conf::default();
    conf.scheduler.intent_backoff_millis = 1;
    let cache = Arc::new(Cache::new(&conf));
    let store = Arc::new(MemoryStore::new());
    cache.add_or_update_flavor(ResourceFlavor::new("default"));
    cache.add_or_update_cluster_queue(queue_spec("a", None, 4000)).unwrap();
    cache.add_local_queue(LocalQueue::new("team-a", "submit-a", "a")).unwrap();
    store.seed_workload(pending("x", "submit-a", 1000, 0));
    store.drain_into(&cache);
    // the first write fails transiently, the retry lands it
    store.fail_next(1);
    let engine = scheduler(&cache, &store, conf);
    let outcome = engine.pass().await.unwrap();
    assert_eq!(outcome.reserved, vec!["team-a/x".to_string()]);
    let stored = store.workload("team-a/x").unwrap();
    assert!(stored.condition_true(ConditionType::QuotaReserved));
}
