use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct AwsArgs {
    /// AWS region all service clients are built for
    #[arg(long, env = "AWS_DEFAULT_REGION", default_value = "us-west-2")]
    pub region: String,

    /// Endpoint override for S3-compatible object storage
    #[arg(long, env = "S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct TableArgs {
    /// Table holding one record per image request
    #[arg(long, env = "IMAGE_REQUEST_TABLE", default_value = "image-requests")]
    pub image_request_table: String,

    /// Table holding one record per region request
    #[arg(long, env = "REGION_REQUEST_TABLE", default_value = "region-requests")]
    pub region_request_table: String,

    /// Table holding outstanding (in-flight async) tile requests keyed by inference id
    #[arg(
        long,
        env = "OUTSTANDING_IMAGE_REQUEST_TABLE",
        default_value = "outstanding-requests"
    )]
    pub outstanding_table: String,

    /// Table holding per-endpoint capacity statistics
    #[arg(long, env = "ENDPOINT_TABLE", default_value = "endpoint-statistics")]
    pub endpoint_table: String,

    /// Table holding detected features bucketed by image and tile
    #[arg(long, env = "FEATURE_TABLE", default_value = "features")]
    pub feature_table: String,
}

#[derive(Parser, Debug, Clone)]
pub struct QueueArgs {
    /// Queue of incoming image processing requests
    #[arg(long, env = "IMAGE_QUEUE", required = true)]
    pub image_queue: String,

    /// Dead-letter queue for image requests that cannot be parsed or processed
    #[arg(long, env = "IMAGE_DLQ")]
    pub image_dlq: Option<String>,

    /// Queue of region processing requests fanned out by the scheduler
    #[arg(long, env = "REGION_QUEUE", required = true)]
    pub region_queue: String,

    /// Queue of async inference completion events (unused in sync-only deployments)
    #[arg(long, env = "TILE_RESULTS_QUEUE")]
    pub tile_results_queue: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct TopicArgs {
    /// Topic receiving image lifecycle transitions
    #[arg(long, env = "IMAGE_STATUS_TOPIC")]
    pub image_status_topic: Option<String>,

    /// Topic receiving region lifecycle transitions
    #[arg(long, env = "REGION_STATUS_TOPIC")]
    pub region_status_topic: Option<String>,

    /// Topic receiving tile lifecycle transitions
    #[arg(long, env = "TILE_STATUS_TOPIC")]
    pub tile_status_topic: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct WorkerArgs {
    /// Fixed tile worker count; overrides the per-cpu calculation when set
    #[arg(long, env = "WORKERS")]
    pub workers: Option<usize>,

    /// Tile workers to run per available cpu
    #[arg(long, env = "WORKERS_PER_CPU", default_value_t = 1)]
    pub workers_per_cpu: usize,

    /// Gate new image work on endpoint capacity
    #[arg(
        long,
        env = "SCHEDULER_THROTTLING_ENABLED",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub scheduler_throttling_enabled: bool,

    /// Concurrent invocations a single model instance is assumed to handle
    #[arg(long, env = "DEFAULT_INSTANCE_CONCURRENCY", default_value_t = 2)]
    pub default_instance_concurrency: usize,

    /// Concurrency assumed for self-hosted HTTP endpoints
    #[arg(long, env = "DEFAULT_HTTP_ENDPOINT_CONCURRENCY", default_value_t = 10)]
    pub default_http_endpoint_concurrency: usize,

    /// Registered instances per model endpoint
    #[arg(long, env = "TILE_WORKERS_PER_INSTANCE", default_value_t = 4)]
    pub tile_workers_per_instance: usize,

    /// Fraction of theoretical endpoint capacity the scheduler may use
    #[arg(long, env = "CAPACITY_TARGET_PERCENTAGE", default_value_t = 1.0)]
    pub capacity_target_percentage: f64,

    /// Maximum attempts for a transiently failing endpoint invocation
    #[arg(long, env = "MAX_RETRIES", default_value_t = 3)]
    pub max_retries: usize,

    /// Fraction of failed tiles above which a region counts as errored
    #[arg(long, env = "REGION_FAILURE_THRESHOLD", default_value_t = 0.0)]
    pub region_failure_threshold: f64,

    /// Maximum region edge length in pixels
    #[arg(long, env = "REGION_SIZE", default_value_t = 8192)]
    pub region_size: u64,
}

#[derive(Parser, Debug, Clone)]
pub struct SinkArgs {
    /// Upper bound on a single event-stream record in bytes
    #[arg(long, env = "KINESIS_MAX_RECORD_SIZE", default_value_t = 1024 * 1024)]
    pub kinesis_max_record_size: usize,
}

#[derive(Parser, Debug, Clone)]
pub struct StagingArgs {
    /// Bucket where async-invoke tile payloads are staged
    #[arg(long, env = "ASYNC_STAGING_BUCKET")]
    pub async_staging_bucket: Option<String>,

    /// Key prefix for staged async-invoke payloads
    #[arg(long, env = "ASYNC_STAGING_PREFIX", default_value = "async-inference/input")]
    pub async_staging_prefix: String,
}
