//! Sets up tracing for Warden on stdout

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

use crate::conf::{LogLevel, Tracing};

/// Convert our log level to a tracing level filter
///
/// # Arguments
///
/// * `level` - The configured log level
fn to_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Off => LevelFilter::OFF,
        LogLevel::Error => LevelFilter::ERROR,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Trace => LevelFilter::TRACE,
    }
}

/// Setup our tracer
///
/// Tracing setup failures are surfaced by panic since no work should
/// proceed without observability.
///
/// # Arguments
///
/// * `name` - The name of the service to trace
/// * `conf` - The tracing settings to use
pub fn setup(name: &str, conf: &Tracing) {
    // get the level to filter events at
    let filter = to_filter(conf.level);
    // build either a json or a human readable stdout layer
    if conf.json {
        let layer = tracing_subscriber::fmt::layer().json().with_filter(filter);
        tracing_subscriber::registry().with(layer).init();
    } else {
        let layer = tracing_subscriber::fmt::layer().with_filter(filter);
        tracing_subscriber::registry().with(layer).init();
    }
    tracing::event!(tracing::Level::INFO, service = name, "tracing initialized");
}
