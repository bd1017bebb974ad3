//! Process-scoped wiring.
//!
//! Everything stateful lives on [`Runtime`]: the state store, queues,
//! status topics, sink and detector factories, raster access, and the
//! per-image caches. It is built once at startup and handed to every task;
//! there is no global mutable state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::api::ModelInvokeMode;
use crate::args::RunArgs;
use crate::aws::{s3_client, sdk_config};
use crate::imagery::{ObjectRasterSource, ObjectStore, RasterSource, S3ObjectStore};
use crate::inference::{AwsDetectorFactory, DetectorFactory};
use crate::queue::{RequestQueue, SqsRequestQueue};
use crate::sensor::SensorModelCache;
use crate::sink::{AwsSinkFactory, SinkFactory};
use crate::status::{SnsStatusPublisher, StatusMonitor};
use crate::store::{DynamoStateStore, StateStore};

/// Immutable knobs distilled from the parsed arguments.
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub workers: usize,
    pub scheduler_throttling_enabled: bool,
    pub default_instance_concurrency: usize,
    pub default_http_endpoint_concurrency: usize,
    pub tile_workers_per_instance: usize,
    pub capacity_target_percentage: f64,
    pub max_retries: usize,
    pub region_failure_threshold: f64,
    pub region_size: u64,
    pub queue_wait: Duration,
    pub queue_visibility: Duration,
    pub region_lease_timeout: Duration,
    pub reaper_interval: Duration,
}

impl RunnerConfig {
    pub fn from_args(args: &RunArgs) -> Self {
        let workers = args
            .workers
            .workers
            .unwrap_or_else(|| num_cpus::get() * args.workers.workers_per_cpu)
            .max(1);
        Self {
            workers,
            scheduler_throttling_enabled: args.workers.scheduler_throttling_enabled,
            default_instance_concurrency: args.workers.default_instance_concurrency,
            default_http_endpoint_concurrency: args.workers.default_http_endpoint_concurrency,
            tile_workers_per_instance: args.workers.tile_workers_per_instance,
            capacity_target_percentage: args.workers.capacity_target_percentage,
            max_retries: args.workers.max_retries,
            region_failure_threshold: args.workers.region_failure_threshold,
            region_size: args.workers.region_size,
            queue_wait: crate::queue::DEFAULT_WAIT,
            queue_visibility: crate::queue::DEFAULT_VISIBILITY,
            region_lease_timeout: Duration::from_secs(args.region_lease_timeout),
            reaper_interval: Duration::from_secs(args.reaper_interval),
        }
    }

    /// Theoretical endpoint budget per spec: instance concurrency times
    /// registered instances, scaled by the capacity target. A non-positive
    /// target falls back to 1.0.
    pub fn max_in_progress(&self, mode: ModelInvokeMode) -> u64 {
        let pct = if self.capacity_target_percentage <= 0.0 {
            tracing::warn!(
                configured = self.capacity_target_percentage,
                "capacity target percentage must be positive, using 1.0"
            );
            1.0
        } else {
            self.capacity_target_percentage
        };
        let base = match mode {
            ModelInvokeMode::SmEndpoint => {
                self.default_instance_concurrency * self.tile_workers_per_instance
            }
            ModelInvokeMode::HttpEndpoint => self.default_http_endpoint_concurrency,
        };
        ((base as f64 * pct) as u64).max(1)
    }
}

/// Shared handles for one worker process.
pub struct Runtime {
    pub config: RunnerConfig,
    pub store: Arc<dyn StateStore>,
    pub image_queue: Arc<dyn RequestQueue>,
    pub image_dlq: Option<Arc<dyn RequestQueue>>,
    pub region_queue: Arc<dyn RequestQueue>,
    pub tile_results_queue: Option<Arc<dyn RequestQueue>>,
    pub status: StatusMonitor,
    pub raster: Arc<dyn RasterSource>,
    pub detectors: Arc<dyn DetectorFactory>,
    pub sinks: Arc<dyn SinkFactory>,
    pub object_store: Arc<dyn ObjectStore>,
    pub sensor_cache: SensorModelCache,
}

impl Runtime {
    /// Wire the runtime against real AWS services.
    pub async fn from_args(args: &RunArgs) -> Result<Arc<Runtime>> {
        let config = RunnerConfig::from_args(args);
        let sdk = sdk_config(&args.aws.region).await;

        let sqs = aws_sdk_sqs::Client::new(&sdk);
        let image_queue: Arc<dyn RequestQueue> =
            Arc::new(SqsRequestQueue::new(sqs.clone(), &args.queues.image_queue));
        let image_dlq = args.queues.image_dlq.as_ref().map(|url| {
            Arc::new(SqsRequestQueue::new(sqs.clone(), url)) as Arc<dyn RequestQueue>
        });
        let region_queue: Arc<dyn RequestQueue> =
            Arc::new(SqsRequestQueue::new(sqs.clone(), &args.queues.region_queue));
        let tile_results_queue = args.queues.tile_results_queue.as_ref().map(|url| {
            Arc::new(SqsRequestQueue::new(sqs.clone(), url)) as Arc<dyn RequestQueue>
        });

        let status = StatusMonitor::new(Arc::new(SnsStatusPublisher::new(
            aws_sdk_sns::Client::new(&sdk),
            args.topics.image_status_topic.clone(),
            args.topics.region_status_topic.clone(),
            args.topics.tile_status_topic.clone(),
        )));

        let store: Arc<dyn StateStore> = Arc::new(DynamoStateStore::new(
            aws_sdk_dynamodb::Client::new(&sdk),
            &args.tables,
        ));

        let s3_endpoint = args.aws.s3_endpoint.clone();
        let raster: Arc<dyn RasterSource> =
            Arc::new(ObjectRasterSource::new(sdk.clone(), s3_endpoint.clone()));
        let object_store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(s3_client(
            &sdk,
            s3_endpoint.as_deref(),
        )));
        let detectors: Arc<dyn DetectorFactory> = Arc::new(AwsDetectorFactory::new(
            sdk.clone(),
            s3_endpoint.clone(),
            args.staging.clone(),
        ));
        let sinks: Arc<dyn SinkFactory> = Arc::new(AwsSinkFactory::new(
            sdk,
            s3_endpoint,
            args.sinks.kinesis_max_record_size,
        ));

        Ok(Arc::new(Runtime {
            config,
            store,
            image_queue,
            image_dlq,
            region_queue,
            tile_results_queue,
            status,
            raster,
            detectors,
            sinks,
            object_store,
            sensor_cache: SensorModelCache::new(),
        }))
    }
}
