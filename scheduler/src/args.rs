use clap::Parser;

/// The command line args to pass to the admission engine
#[derive(Parser, Debug, Clone)]
#[clap(version, author)]
pub struct Args {
    /// The path to load the config file from
    #[clap(short, long, default_value = "warden.yml")]
    pub config: String,
    /// Override how often the scheduler takes a pass in milliseconds
    #[clap(long)]
    pub tick_millis: Option<u64>,
    /// Compute decisions but do not emit any intents
    #[clap(long, default_value_t)]
    pub dry_run: bool,
}
