use clap::Parser;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{event, Level};

mod args;
mod libs;

use libs::cache::Cache;
use libs::scheduler::Scheduler;
use libs::store::{funnel_events, MemoryStore};

/// The Warden admission engine
#[tokio::main]
async fn main() {
    // get command line args
    let args = args::Args::parse();
    // try to load a config file
    let mut conf = warden::Conf::new(&args.config).expect("Failed to load config");
    if let Some(tick_millis) = args.tick_millis {
        conf.scheduler.tick_millis = tick_millis;
    }
    // setup our tracer
    warden::utils::trace::setup("WardenScheduler", &conf.tracing);
    // build the cache and the store seam the watchers write through
    let cache = Arc::new(Cache::new(&conf));
    let store = Arc::new(MemoryStore::new());
    // funnel all watch events into the cache through one channel
    let (events_tx, events_rx) = mpsc::channel(1024);
    let funnel = tokio::spawn(funnel_events(events_rx, cache.clone()));
    // start the scheduler loop
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut scheduler = Scheduler::new(cache, store, conf, shutdown_rx);
    if args.dry_run {
        scheduler = scheduler.dry_run();
    }
    let loop_handle = tokio::spawn(async move { scheduler.start().await });
    // shut everything down on ctrl-c
    tokio::signal::ctrl_c().await.expect("Failed to listen for ctrl-c");
    event!(Level::INFO, "shutting down");
    let _ = shutdown_tx.send(true);
    drop(events_tx);
    let _ = funnel.await;
    loop_handle
        .await
        .expect("Scheduler task panicked")
        .expect("Scheduler crashed");
}
