use clap::{Parser, Subcommand};
use osprey_common::args::{
    AwsArgs, QueueArgs, SinkArgs, StagingArgs, TableArgs, TopicArgs, WorkerArgs,
};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the worker process: consume image and region requests
    Run(RunArgs),

    /// Enqueue an image processing request
    Submit(SubmitArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub aws: AwsArgs,

    #[command(flatten)]
    pub tables: TableArgs,

    #[command(flatten)]
    pub queues: QueueArgs,

    #[command(flatten)]
    pub topics: TopicArgs,

    #[command(flatten)]
    pub workers: WorkerArgs,

    #[command(flatten)]
    pub sinks: SinkArgs,

    #[command(flatten)]
    pub staging: StagingArgs,

    /// Seconds a stale region lease may age before the reaper requeues it
    #[arg(long, env = "REGION_LEASE_TIMEOUT", default_value_t = 30 * 60)]
    pub region_lease_timeout: u64,

    /// Seconds between reaper scans (0 disables the reaper)
    #[arg(long, env = "REAPER_INTERVAL", default_value_t = 60)]
    pub reaper_interval: u64,
}

#[derive(Parser, Debug, Clone)]
pub struct SubmitArgs {
    #[command(flatten)]
    pub aws: AwsArgs,

    /// Queue of incoming image processing requests
    #[arg(long, env = "IMAGE_QUEUE", required = true)]
    pub image_queue: String,

    /// Path to a JSON image request, or `-` for stdin
    #[arg(long, default_value = "-")]
    pub request: String,
}
