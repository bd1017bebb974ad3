use chrono::Utc;
use osprey_common::types::{ImageDimensions, ImageRegion, RequestStatus};
use serde::{Deserialize, Serialize};

use crate::api::{ImageRequest, RegionRequest};

/// How long feature rows live after creation. Jobs take minutes; a day of
/// retention leaves room to debug without accumulating state.
pub const FEATURE_TTL_MS: i64 = 24 * 60 * 60 * 1000;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Durable record of one image request, keyed by `image_id`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ImageRequestItem {
    pub image_id: String,
    pub job_id: String,
    pub image_url: String,
    pub start_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_count: Option<u64>,
    #[serde(default)]
    pub region_success: u64,
    #[serde(default)]
    pub region_error: u64,
    /// Endpoint capacity credits held while the image is in flight.
    #[serde(default)]
    pub capacity_acquired: u64,
    /// Echo of the originating request.
    pub request: ImageRequest,
}

impl ImageRequestItem {
    pub fn new(request: ImageRequest) -> Self {
        Self {
            image_id: request.image_id.clone(),
            job_id: request.job_id.clone(),
            image_url: request.image_url.clone(),
            start_time: now_ms(),
            end_time: None,
            region_count: None,
            region_success: 0,
            region_error: 0,
            capacity_acquired: 0,
            request,
        }
    }

    /// An image is complete once the region count is known and every region
    /// has terminated one way or the other.
    pub fn is_complete(&self) -> bool {
        match self.region_count {
            Some(count) => self.region_success + self.region_error == count,
            None => false,
        }
    }

    pub fn processing_duration_ms(&self) -> Option<i64> {
        self.end_time.map(|end| end - self.start_time)
    }
}

/// Durable record of one region request, keyed by `(image_id, region_id)`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RegionRequestItem {
    pub image_id: String,
    pub region_id: String,
    pub job_id: String,
    pub model_name: String,
    pub start_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tiles: Option<u64>,
    #[serde(default)]
    pub succeeded_tiles: Vec<String>,
    #[serde(default)]
    pub failed_tiles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_duration: Option<i64>,
    /// Echo of the region request so any process can resume completion.
    pub request: RegionRequest,
}

impl RegionRequestItem {
    pub fn new(request: RegionRequest) -> Self {
        Self {
            image_id: request.image_id.clone(),
            region_id: request.region_id.clone(),
            job_id: request.job_id.clone(),
            model_name: request.model_name.clone(),
            start_time: now_ms(),
            end_time: None,
            total_tiles: None,
            succeeded_tiles: Vec::new(),
            failed_tiles: Vec::new(),
            processing_duration: None,
            request,
        }
    }

    pub fn is_complete(&self) -> bool {
        match self.total_tiles {
            Some(total) => (self.succeeded_tiles.len() + self.failed_tiles.len()) as u64 == total,
            None => false,
        }
    }

    pub fn terminal_status(&self) -> RequestStatus {
        RequestStatus::from_counts(
            self.succeeded_tiles.len(),
            self.failed_tiles.len(),
            self.total_tiles.unwrap_or(0) as usize,
        )
    }

    pub fn failed_fraction(&self) -> f64 {
        match self.total_tiles {
            Some(total) if total > 0 => self.failed_tiles.len() as f64 / total as f64,
            _ => 0.0,
        }
    }

    /// Tiles that never reached a terminal state; the reaper charges these
    /// back to the endpoint when it requeues a stale region.
    pub fn unreleased_tiles(&self) -> u64 {
        let done = (self.succeeded_tiles.len() + self.failed_tiles.len()) as u64;
        self.total_tiles.unwrap_or(0).saturating_sub(done)
    }
}

/// In-flight async tile invocation, keyed by `inference_id`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TileRequestItem {
    pub inference_id: String,
    pub tile_id: String,
    pub region_id: String,
    pub image_id: String,
    pub job_id: String,
    pub image_url: String,
    /// Staged payload location (an object-store url in async mode).
    pub image_path: String,
    pub tile_bounds: ImageRegion,
    pub tile_size: ImageDimensions,
    pub tile_overlap: ImageDimensions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_location: Option<String>,
    pub tile_status: RequestStatus,
    #[serde(default)]
    pub retry_count: u32,
    pub expire_time: i64,
}

/// Capacity bookkeeping for one model endpoint, keyed by name.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EndpointStatisticsItem {
    pub endpoint_name: String,
    pub max_in_progress: u64,
    pub in_progress: u64,
}

/// Terminal status of an image derived from its regions' outcomes.
pub fn image_terminal_status(regions: &[RegionRequestItem]) -> RequestStatus {
    if regions.is_empty() {
        return RequestStatus::Success;
    }
    let statuses: Vec<RequestStatus> = regions.iter().map(|r| r.terminal_status()).collect();
    if statuses.iter().all(|s| *s == RequestStatus::Success) {
        RequestStatus::Success
    } else if statuses.iter().all(|s| *s == RequestStatus::Failed) {
        RequestStatus::Failed
    } else {
        RequestStatus::Partial
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ImageRequest;

    fn region_item(succeeded: usize, failed: usize, total: u64) -> RegionRequestItem {
        let request = ImageRequest::from_message(
            r#"{
                "jobArn": "arn:aws:osprey:us-west-2:123456789012:job/j1",
                "jobId": "j1",
                "imageUrls": ["s3://bucket/img.tif"],
                "imageProcessor": {"name": "detector", "type": "SM_ENDPOINT"},
                "outputs": [{"type": "S3", "bucket": "out", "prefix": "r"}]
            }"#,
        )
        .unwrap();
        let region = RegionRequest::from_image_request(
            &request,
            osprey_common::types::ImageRegion::new(0, 0, 100, 100),
            1,
        );
        let mut item = RegionRequestItem::new(region);
        item.total_tiles = Some(total);
        item.succeeded_tiles = (0..succeeded).map(|i| format!("s{i}")).collect();
        item.failed_tiles = (0..failed).map(|i| format!("f{i}")).collect();
        item
    }

    #[test]
    fn region_status_over_tiles() {
        assert_eq!(region_item(3, 0, 3).terminal_status(), RequestStatus::Success);
        assert_eq!(region_item(0, 3, 3).terminal_status(), RequestStatus::Failed);
        assert_eq!(region_item(2, 1, 3).terminal_status(), RequestStatus::Partial);
        assert_eq!(
            region_item(1, 0, 3).terminal_status(),
            RequestStatus::InProgress
        );
    }

    #[test]
    fn image_status_over_regions() {
        assert_eq!(
            image_terminal_status(&[region_item(2, 0, 2), region_item(3, 0, 3)]),
            RequestStatus::Success
        );
        assert_eq!(
            image_terminal_status(&[region_item(0, 2, 2), region_item(0, 3, 3)]),
            RequestStatus::Failed
        );
        assert_eq!(
            image_terminal_status(&[region_item(2, 0, 2), region_item(2, 1, 3)]),
            RequestStatus::Partial
        );
    }

    #[test]
    fn unreleased_tile_accounting() {
        let item = region_item(2, 1, 5);
        assert_eq!(item.unreleased_tiles(), 2);
    }
}
