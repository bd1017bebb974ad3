//! In-memory collaborators for the end-to-end scenarios: a state store and
//! queues with the same conditional semantics as the real backends, plus
//! scripted detectors, a synthetic raster, and recording sinks/topics.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use geojson::Feature;
use osprey_common::types::{ImageDimensions, ImageRegion, RequestStatus};
use uuid::Uuid;

use osprey_runner::api::{RegionRequest, TileCompression, TileFormat};
use osprey_runner::imagery::{ObjectStore, OpenRaster, RasterSource};
use osprey_runner::inference::{
    Detector, DetectorFactory, InvocationError, InvocationOutcome, classify_status,
};
use osprey_runner::queue::{ReceivedMessage, RequestQueue};
use osprey_runner::runtime::{Runtime, RunnerConfig};
use osprey_runner::sensor::{SensorModel, SensorModelCache};
use osprey_runner::sink::{Sink, SinkFactory};
use osprey_runner::status::{StatusMessage, StatusMonitor, StatusPublisher, StatusScope};
use osprey_runner::store::{
    EndpointStatisticsItem, ImageRequestItem, RegionRequestItem, StartOutcome, StateStore,
    TileRequestItem, now_ms,
};

// ---------------------------------------------------------------------------
// State store

#[derive(Default)]
struct StoreInner {
    images: HashMap<String, ImageRequestItem>,
    regions: HashMap<(String, String), RegionRequestItem>,
    tiles: HashMap<String, TileRequestItem>,
    endpoints: HashMap<String, EndpointStatisticsItem>,
    features: HashMap<String, BTreeMap<String, Vec<Feature>>>,
    in_progress_high_water: HashMap<String, u64>,
}

#[derive(Clone, Default)]
pub struct MemoryStateStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn image(&self, image_id: &str) -> Option<ImageRequestItem> {
        self.inner.lock().unwrap().images.get(image_id).cloned()
    }

    pub fn region(&self, image_id: &str, region_id: &str) -> Option<RegionRequestItem> {
        self.inner
            .lock()
            .unwrap()
            .regions
            .get(&(image_id.to_string(), region_id.to_string()))
            .cloned()
    }

    pub fn regions_of(&self, image_id: &str) -> Vec<RegionRequestItem> {
        let mut regions: Vec<RegionRequestItem> = self
            .inner
            .lock()
            .unwrap()
            .regions
            .values()
            .filter(|region| region.image_id == image_id)
            .cloned()
            .collect();
        regions.sort_by(|a, b| a.region_id.cmp(&b.region_id));
        regions
    }

    pub fn outstanding_tiles(&self) -> Vec<TileRequestItem> {
        self.inner.lock().unwrap().tiles.values().cloned().collect()
    }

    pub fn endpoint(&self, name: &str) -> Option<EndpointStatisticsItem> {
        self.inner.lock().unwrap().endpoints.get(name).cloned()
    }

    /// Highest `in_progress` value ever observed for the endpoint.
    pub fn in_progress_high_water(&self, name: &str) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .in_progress_high_water
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Backdate a region's lease, as if its worker died long ago.
    pub fn age_region(&self, image_id: &str, region_id: &str, age: Duration) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(region) = inner
            .regions
            .get_mut(&(image_id.to_string(), region_id.to_string()))
        {
            region.start_time = now_ms() - age.as_millis() as i64;
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn start_image(&self, item: ImageRequestItem) -> Result<StartOutcome> {
        let mut inner = self.inner.lock().unwrap();
        if inner.images.contains_key(&item.image_id) {
            return Ok(StartOutcome::AlreadyStarted);
        }
        inner.images.insert(item.image_id.clone(), item);
        Ok(StartOutcome::Started)
    }

    async fn get_image(&self, image_id: &str) -> Result<Option<ImageRequestItem>> {
        Ok(self.inner.lock().unwrap().images.get(image_id).cloned())
    }

    async fn set_region_count(&self, image_id: &str, count: u64, acquired: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let image = inner
            .images
            .get_mut(image_id)
            .with_context(|| format!("image {image_id} has no record"))?;
        image.region_count = Some(count);
        image.capacity_acquired = acquired;
        Ok(())
    }

    async fn complete_region(&self, image_id: &str, failed: bool) -> Result<ImageRequestItem> {
        let mut inner = self.inner.lock().unwrap();
        let image = inner
            .images
            .get_mut(image_id)
            .with_context(|| format!("image {image_id} has no record"))?;
        let count = image
            .region_count
            .with_context(|| format!("image {image_id} has no region count"))?;
        if image.region_success + image.region_error >= count {
            return Ok(image.clone());
        }
        if failed {
            image.region_error += 1;
        } else {
            image.region_success += 1;
        }
        Ok(image.clone())
    }

    async fn end_image(&self, image_id: &str, end_time: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(image) = inner.images.get_mut(image_id)
            && image.end_time.is_none_or(|current| current < end_time)
        {
            image.end_time = Some(end_time);
        }
        Ok(())
    }

    async fn put_region(&self, item: RegionRequestItem) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = (item.image_id.clone(), item.region_id.clone());
        match inner.regions.get_mut(&key) {
            Some(existing) => existing.start_time = now_ms(),
            None => {
                inner.regions.insert(key, item);
            }
        }
        Ok(())
    }

    async fn get_region(
        &self,
        image_id: &str,
        region_id: &str,
    ) -> Result<Option<RegionRequestItem>> {
        Ok(self.region(image_id, region_id))
    }

    async fn regions_by_image(&self, image_id: &str) -> Result<Vec<RegionRequestItem>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .regions
            .values()
            .filter(|region| region.image_id == image_id)
            .cloned()
            .collect())
    }

    async fn set_total_tiles(&self, image_id: &str, region_id: &str, total: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let region = inner
            .regions
            .get_mut(&(image_id.to_string(), region_id.to_string()))
            .with_context(|| format!("region {image_id}/{region_id} has no record"))?;
        region.total_tiles = Some(total);
        Ok(())
    }

    async fn record_tile_outcome(
        &self,
        image_id: &str,
        region_id: &str,
        tile_id: &str,
        failed: bool,
    ) -> Result<RegionRequestItem> {
        let mut inner = self.inner.lock().unwrap();
        let region = inner
            .regions
            .get_mut(&(image_id.to_string(), region_id.to_string()))
            .with_context(|| format!("region {image_id}/{region_id} has no record"))?;
        let already = region.succeeded_tiles.iter().any(|t| t == tile_id)
            || region.failed_tiles.iter().any(|t| t == tile_id);
        if !already {
            if failed {
                region.failed_tiles.push(tile_id.to_string());
            } else {
                region.succeeded_tiles.push(tile_id.to_string());
            }
        }
        Ok(region.clone())
    }

    async fn finish_region(
        &self,
        image_id: &str,
        region_id: &str,
        duration_ms: i64,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let region = inner
            .regions
            .get_mut(&(image_id.to_string(), region_id.to_string()))
            .with_context(|| format!("region {image_id}/{region_id} has no record"))?;
        if region.end_time.is_some() {
            return Ok(false);
        }
        region.end_time = Some(now_ms());
        region.processing_duration = Some(duration_ms);
        Ok(true)
    }

    async fn list_stale_regions(&self, cutoff_ms: i64) -> Result<Vec<RegionRequestItem>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .regions
            .values()
            .filter(|region| region.end_time.is_none() && region.start_time < cutoff_ms)
            .cloned()
            .collect())
    }

    async fn put_outstanding_tile(&self, item: TileRequestItem) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .tiles
            .insert(item.inference_id.clone(), item);
        Ok(())
    }

    async fn get_outstanding_tile(&self, inference_id: &str) -> Result<Option<TileRequestItem>> {
        Ok(self.inner.lock().unwrap().tiles.get(inference_id).cloned())
    }

    async fn update_tile_status(
        &self,
        inference_id: &str,
        status: RequestStatus,
        output_location: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let tile = inner
            .tiles
            .get_mut(inference_id)
            .with_context(|| format!("outstanding tile {inference_id} has no record"))?;
        tile.tile_status = status;
        if output_location.is_some() {
            tile.output_location = output_location;
        }
        Ok(())
    }

    async fn upsert_endpoint(&self, endpoint_name: &str, max_in_progress: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .endpoints
            .entry(endpoint_name.to_string())
            .and_modify(|stats| stats.max_in_progress = max_in_progress)
            .or_insert_with(|| EndpointStatisticsItem {
                endpoint_name: endpoint_name.to_string(),
                max_in_progress,
                in_progress: 0,
            });
        Ok(())
    }

    async fn get_endpoint(&self, endpoint_name: &str) -> Result<Option<EndpointStatisticsItem>> {
        Ok(self.endpoint(endpoint_name))
    }

    async fn try_acquire_endpoint(&self, endpoint_name: &str, count: u64) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(stats) = inner.endpoints.get_mut(endpoint_name) else {
            return Ok(false);
        };
        if stats.in_progress + count > stats.max_in_progress {
            return Ok(false);
        }
        stats.in_progress += count;
        let observed = stats.in_progress;
        let high = inner
            .in_progress_high_water
            .entry(endpoint_name.to_string())
            .or_insert(0);
        *high = (*high).max(observed);
        Ok(true)
    }

    async fn release_endpoint(&self, endpoint_name: &str, count: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(stats) = inner.endpoints.get_mut(endpoint_name) {
            stats.in_progress = stats.in_progress.saturating_sub(count);
        }
        Ok(())
    }

    async fn add_features(
        &self,
        image_id: &str,
        rows: BTreeMap<String, Vec<Feature>>,
        _expire_time: i64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let image_rows = inner.features.entry(image_id.to_string()).or_default();
        for (key, mut features) in rows {
            image_rows.entry(key).or_default().append(&mut features);
        }
        Ok(())
    }

    async fn features_by_image(&self, image_id: &str) -> Result<Vec<Vec<Feature>>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .features
            .get(image_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Queue

struct QueueMessage {
    id: String,
    body: String,
    visible_at: Instant,
    deleted: bool,
}

#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Mutex<VecDeque<QueueMessage>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .filter(|m| !m.deleted)
            .count()
    }

    /// Count of messages currently leased or delayed.
    pub fn invisible_len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .lock()
            .unwrap()
            .iter()
            .filter(|m| !m.deleted && m.visible_at > now)
            .count()
    }

    /// Expire every lease, as if visibility timeouts had lapsed.
    pub fn make_all_visible(&self) {
        let now = Instant::now();
        for message in self.inner.lock().unwrap().iter_mut() {
            message.visible_at = now;
        }
    }
}

#[async_trait]
impl RequestQueue for MemoryQueue {
    async fn receive(
        &self,
        _wait: Duration,
        visibility: Duration,
        max: usize,
    ) -> Result<Vec<ReceivedMessage>> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let mut received = Vec::new();
        for message in inner.iter_mut() {
            if received.len() >= max.max(1) {
                break;
            }
            if message.deleted || message.visible_at > now {
                continue;
            }
            message.visible_at = now + visibility;
            received.push(ReceivedMessage {
                receipt: message.id.clone(),
                body: message.body.clone(),
            });
        }
        Ok(received)
    }

    async fn finish(&self, receipt: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let message = inner
            .iter_mut()
            .find(|m| m.id == receipt)
            .with_context(|| format!("unknown receipt {receipt}"))?;
        message.deleted = true;
        Ok(())
    }

    async fn reset(&self, receipt: &str, visibility: Duration) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let message = inner
            .iter_mut()
            .find(|m| m.id == receipt)
            .with_context(|| format!("unknown receipt {receipt}"))?;
        message.visible_at = Instant::now() + visibility;
        Ok(())
    }

    async fn send(&self, body: &str) -> Result<()> {
        self.inner.lock().unwrap().push_back(QueueMessage {
            id: Uuid::new_v4().to_string(),
            body: body.to_string(),
            visible_at: Instant::now(),
            deleted: false,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Raster

/// Raster whose crops encode their own bounds as JSON so scripted
/// detectors can tell tiles apart.
pub struct SyntheticRasterSource {
    pub width: u64,
    pub height: u64,
    pub sensor: Option<Arc<dyn SensorModel>>,
    pub fail_open: bool,
}

impl SyntheticRasterSource {
    pub fn new(width: u64, height: u64) -> Self {
        Self {
            width,
            height,
            sensor: None,
            fail_open: false,
        }
    }
}

#[async_trait]
impl RasterSource for SyntheticRasterSource {
    async fn open(
        &self,
        image_url: &str,
        _read_role: Option<&str>,
    ) -> Result<Arc<dyn OpenRaster>> {
        if self.fail_open {
            bail!("cannot open raster {image_url}");
        }
        Ok(Arc::new(SyntheticRaster {
            width: self.width,
            height: self.height,
            sensor: self.sensor.clone(),
        }))
    }
}

pub struct SyntheticRaster {
    width: u64,
    height: u64,
    sensor: Option<Arc<dyn SensorModel>>,
}

impl OpenRaster for SyntheticRaster {
    fn dimensions(&self) -> ImageDimensions {
        (self.width, self.height)
    }

    fn crop(
        &self,
        bounds: ImageRegion,
        _format: TileFormat,
        _compression: TileCompression,
    ) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(&bounds)?))
    }

    fn sensor_model(&self) -> Option<Arc<dyn SensorModel>> {
        self.sensor.clone()
    }
}

pub fn payload_bounds(payload: &Bytes) -> ImageRegion {
    serde_json::from_slice(payload).expect("payload is a synthetic crop")
}

// ---------------------------------------------------------------------------
// Detector

/// What the scripted detector does with each tile.
pub enum DetectorScript {
    /// Return the same detections (tile-local bounds) for every tile.
    Features(Vec<[f64; 4]>),
    /// As `Features`, but answer 500 for tiles whose upper-left column
    /// matches.
    FailColumn {
        features: Vec<[f64; 4]>,
        column: u64,
    },
    /// Return a body that is not a FeatureCollection.
    InvalidSchema,
    /// Accept the payload for async processing.
    Queue,
}

pub struct ScriptedDetector {
    script: DetectorScript,
    pub invocations: AtomicUsize,
    current: AtomicUsize,
    pub max_concurrent: AtomicUsize,
}

impl ScriptedDetector {
    pub fn new(script: DetectorScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            invocations: AtomicUsize::new(0),
            current: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
        })
    }

    fn feature_collection(bounds: &[[f64; 4]]) -> Vec<Feature> {
        bounds
            .iter()
            .map(|b| {
                let mut feature = Feature::default();
                feature.set_property("bounds_imcoords", b.to_vec());
                feature.set_property("detection_score", 0.9);
                feature.set_property("feature_types", serde_json::json!({"vehicle": 0.9}));
                feature
            })
            .collect()
    }
}

#[async_trait]
impl Detector for ScriptedDetector {
    fn endpoint_name(&self) -> &str {
        "scripted"
    }

    async fn find_features(&self, payload: Bytes) -> Result<InvocationOutcome, InvocationError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(current, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let result = match &self.script {
            DetectorScript::Features(bounds) => {
                Ok(InvocationOutcome::Features(Self::feature_collection(bounds)))
            }
            DetectorScript::FailColumn { features, column } => {
                if payload_bounds(&payload).ul_col() == *column {
                    Err(classify_status(500)(anyhow!("internal server error")))
                } else {
                    Ok(InvocationOutcome::Features(Self::feature_collection(
                        features,
                    )))
                }
            }
            DetectorScript::InvalidSchema => Err(InvocationError::permanent(anyhow!(
                "model response failed schema check: {{\"invalid_key\": 1}}"
            ))),
            DetectorScript::Queue => {
                let inference_id = Uuid::new_v4().to_string();
                Ok(InvocationOutcome::Queued {
                    input_location: format!("s3://staging/input/{inference_id}"),
                    output_location: Some(format!("s3://artifacts/output/{inference_id}.out")),
                    inference_id,
                })
            }
        };
        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub struct ScriptedDetectorFactory {
    pub detector: Arc<ScriptedDetector>,
}

#[async_trait]
impl DetectorFactory for ScriptedDetectorFactory {
    async fn for_request(&self, _request: &RegionRequest) -> Result<Arc<dyn Detector>> {
        Ok(self.detector.clone())
    }
}

// ---------------------------------------------------------------------------
// Sink, status topic, object store

#[derive(Clone, Default)]
pub struct CollectingSink {
    pub writes: Arc<Mutex<Vec<(String, Vec<Feature>)>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> Vec<(String, Vec<Feature>)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sink for CollectingSink {
    fn name(&self) -> &'static str {
        "S3"
    }

    async fn write(&self, image_id: &str, features: &[Feature]) -> Result<()> {
        self.writes
            .lock()
            .unwrap()
            .push((image_id.to_string(), features.to_vec()));
        Ok(())
    }
}

pub struct CollectingSinkFactory {
    pub sink: CollectingSink,
}

#[async_trait]
impl SinkFactory for CollectingSinkFactory {
    async fn build(
        &self,
        _specs: &[osprey_runner::api::SinkSpec],
    ) -> Result<Vec<Box<dyn Sink>>> {
        Ok(vec![Box::new(self.sink.clone())])
    }
}

#[derive(Clone, Default)]
pub struct RecordingPublisher {
    pub events: Arc<Mutex<Vec<(StatusScope, StatusMessage)>>>,
}

impl RecordingPublisher {
    pub fn events(&self) -> Vec<(StatusScope, StatusMessage)> {
        self.events.lock().unwrap().clone()
    }

    pub fn statuses(&self, scope: StatusScope) -> Vec<RequestStatus> {
        self.events()
            .into_iter()
            .filter(|(s, _)| *s == scope)
            .map(|(_, m)| m.status)
            .collect()
    }
}

#[async_trait]
impl StatusPublisher for RecordingPublisher {
    async fn publish(&self, scope: StatusScope, message: &StatusMessage) -> Result<()> {
        self.events.lock().unwrap().push((scope, message.clone()));
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<Mutex<HashMap<String, Bytes>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, url: &str) -> Result<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .with_context(|| format!("no object at {url}"))
    }

    async fn put(&self, url: &str, body: Bytes) -> Result<()> {
        self.objects.lock().unwrap().insert(url.to_string(), body);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness

pub struct TestHarness {
    pub runtime: Arc<Runtime>,
    pub store: MemoryStateStore,
    pub image_queue: MemoryQueue,
    pub region_queue: MemoryQueue,
    pub tile_results_queue: MemoryQueue,
    pub sink: CollectingSink,
    pub publisher: RecordingPublisher,
    pub object_store: MemoryObjectStore,
    pub detector: Arc<ScriptedDetector>,
}

pub fn test_config() -> RunnerConfig {
    RunnerConfig {
        workers: 4,
        scheduler_throttling_enabled: true,
        default_instance_concurrency: 2,
        default_http_endpoint_concurrency: 10,
        tile_workers_per_instance: 4,
        capacity_target_percentage: 1.0,
        max_retries: 1,
        region_failure_threshold: 0.0,
        region_size: 8192,
        queue_wait: Duration::from_millis(10),
        queue_visibility: Duration::from_secs(1800),
        region_lease_timeout: Duration::from_secs(1800),
        reaper_interval: Duration::from_secs(60),
    }
}

pub fn harness(
    config: RunnerConfig,
    raster: SyntheticRasterSource,
    detector: Arc<ScriptedDetector>,
) -> TestHarness {
    let store = MemoryStateStore::new();
    let image_queue = MemoryQueue::new();
    let region_queue = MemoryQueue::new();
    let tile_results_queue = MemoryQueue::new();
    let sink = CollectingSink::new();
    let publisher = RecordingPublisher::default();
    let object_store = MemoryObjectStore::new();

    let runtime = Arc::new(Runtime {
        config,
        store: Arc::new(store.clone()),
        image_queue: Arc::new(image_queue.clone()),
        image_dlq: None,
        region_queue: Arc::new(region_queue.clone()),
        tile_results_queue: Some(Arc::new(tile_results_queue.clone())),
        status: StatusMonitor::new(Arc::new(publisher.clone())),
        raster: Arc::new(raster),
        detectors: Arc::new(ScriptedDetectorFactory {
            detector: detector.clone(),
        }),
        sinks: Arc::new(CollectingSinkFactory { sink: sink.clone() }),
        object_store: Arc::new(object_store.clone()),
        sensor_cache: SensorModelCache::new(),
    });

    TestHarness {
        runtime,
        store,
        image_queue,
        region_queue,
        tile_results_queue,
        sink,
        publisher,
        object_store,
        detector,
    }
}

impl TestHarness {
    /// Handle every visible image request once.
    pub async fn drain_image_queue(&self) -> Result<()> {
        loop {
            let messages = self
                .image_queue
                .receive(Duration::ZERO, Duration::from_secs(1800), 10)
                .await?;
            if messages.is_empty() {
                return Ok(());
            }
            for message in messages {
                osprey_runner::worker::handle_image_message(&self.runtime, &message).await?;
            }
        }
    }

    /// Handle every visible region request once.
    pub async fn drain_region_queue(&self) -> Result<()> {
        loop {
            let messages = self
                .region_queue
                .receive(Duration::ZERO, Duration::from_secs(1800), 10)
                .await?;
            if messages.is_empty() {
                return Ok(());
            }
            for message in messages {
                osprey_runner::worker::handle_region_message(&self.runtime, &message).await?;
            }
        }
    }

    /// Handle every visible tile result event once.
    pub async fn drain_results_queue(&self) -> Result<()> {
        loop {
            let messages = self
                .tile_results_queue
                .receive(Duration::ZERO, Duration::from_secs(1800), 10)
                .await?;
            if messages.is_empty() {
                return Ok(());
            }
            for message in messages {
                osprey_runner::worker::handle_result_message(&self.runtime, &message).await?;
            }
        }
    }
}

/// A standard request body in the external queue format.
pub fn image_request_body(job_id: &str, invoke_mode: &str) -> String {
    serde_json::json!({
        "jobArn": format!("arn:aws:osprey:us-west-2:123456789012:job/{job_id}"),
        "jobId": job_id,
        "imageUrls": ["s3://bucket/img.tif"],
        "imageProcessor": {"name": "detector", "type": invoke_mode},
        "imageProcessorTileSize": 1024,
        "imageProcessorTileOverlap": 50,
        "imageProcessorTileFormat": "PNG",
        "outputs": [{"type": "S3", "bucket": "out", "prefix": "results"}]
    })
    .to_string()
}
