//! Durable keyed state shared by every worker process.
//!
//! All counter mutations are conditional updates and all list appends are
//! atomic; conditional-update conflicts are retried internally after
//! re-reading state and never surface to callers.

mod dynamo;
mod records;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use geojson::Feature;
use osprey_common::types::RequestStatus;

pub use dynamo::DynamoStateStore;
pub use records::{
    EndpointStatisticsItem, FEATURE_TTL_MS, ImageRequestItem, RegionRequestItem, TileRequestItem,
    image_terminal_status, now_ms,
};

/// Result of attempting to claim an image for processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// This caller inserted the record and owns first dispatch.
    Started,
    /// Another caller got there first; stop without dispatching.
    AlreadyStarted,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    // Image lifecycle

    /// Insert the image record if absent. Exactly one concurrent caller wins.
    async fn start_image(&self, item: ImageRequestItem) -> Result<StartOutcome>;

    async fn get_image(&self, image_id: &str) -> Result<Option<ImageRequestItem>>;

    /// Record the region partition size and the capacity credits held.
    async fn set_region_count(&self, image_id: &str, count: u64, acquired: u64) -> Result<()>;

    /// Count one region as finished, either successfully or not. Never lets
    /// `region_success + region_error` exceed `region_count`. Returns the
    /// updated record.
    async fn complete_region(&self, image_id: &str, failed: bool) -> Result<ImageRequestItem>;

    /// Monotonic close: sets `end_time` when unset or when `end_time` is
    /// later than the stored value.
    async fn end_image(&self, image_id: &str, end_time: i64) -> Result<()>;

    async fn is_image_complete(&self, image_id: &str) -> Result<bool> {
        Ok(self
            .get_image(image_id)
            .await?
            .map(|item| item.is_complete())
            .unwrap_or(false))
    }

    // Region lifecycle

    /// Create the region record if absent; refresh `start_time` if present
    /// (a requeued region is being picked up again).
    async fn put_region(&self, item: RegionRequestItem) -> Result<()>;

    async fn get_region(&self, image_id: &str, region_id: &str)
    -> Result<Option<RegionRequestItem>>;

    async fn regions_by_image(&self, image_id: &str) -> Result<Vec<RegionRequestItem>>;

    async fn set_total_tiles(&self, image_id: &str, region_id: &str, total: u64) -> Result<()>;

    /// Append the tile to exactly one of the terminal lists. Appending the
    /// same tile twice is a no-op. Returns the updated record.
    async fn record_tile_outcome(
        &self,
        image_id: &str,
        region_id: &str,
        tile_id: &str,
        failed: bool,
    ) -> Result<RegionRequestItem>;

    /// Close the region record. Returns true for exactly one caller; later
    /// calls observe an already-closed region and return false.
    async fn finish_region(
        &self,
        image_id: &str,
        region_id: &str,
        duration_ms: i64,
    ) -> Result<bool>;

    /// Regions with no `end_time` whose `start_time` predates the cutoff;
    /// input for the lease reaper.
    async fn list_stale_regions(&self, cutoff_ms: i64) -> Result<Vec<RegionRequestItem>>;

    // Outstanding (async) tile requests

    async fn put_outstanding_tile(&self, item: TileRequestItem) -> Result<()>;

    async fn get_outstanding_tile(&self, inference_id: &str) -> Result<Option<TileRequestItem>>;

    /// Update an outstanding tile's status. Records expire via their TTL
    /// once the image terminates; there is no explicit purge.
    async fn update_tile_status(
        &self,
        inference_id: &str,
        status: RequestStatus,
        output_location: Option<String>,
    ) -> Result<()>;

    // Endpoint capacity

    async fn upsert_endpoint(&self, endpoint_name: &str, max_in_progress: u64) -> Result<()>;

    async fn get_endpoint(&self, endpoint_name: &str) -> Result<Option<EndpointStatisticsItem>>;

    /// Atomically add `n` to `in_progress` iff the result stays within
    /// `max_in_progress`. Returns whether the capacity was granted.
    async fn try_acquire_endpoint(&self, endpoint_name: &str, n: u64) -> Result<bool>;

    /// Atomically subtract `n` from `in_progress`, floored at zero.
    async fn release_endpoint(&self, endpoint_name: &str, n: u64) -> Result<()>;

    // Features

    /// Atomically append features to their bucket rows. `rows` maps the
    /// tile-bucket range key to the features that belong in it.
    async fn add_features(
        &self,
        image_id: &str,
        rows: BTreeMap<String, Vec<Feature>>,
        expire_time: i64,
    ) -> Result<()>;

    /// All feature rows for an image, one inner vec per bucket row.
    async fn features_by_image(&self, image_id: &str) -> Result<Vec<Vec<Feature>>>;
}
