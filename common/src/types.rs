use serde::{Deserialize, Serialize};

/// Pixel coordinate as (row, column).
pub type ImageCoord = (u64, u64);

/// 2D pixel extent as (width, height).
pub type ImageDimensions = (u64, u64);

/// A rectangular pixel window: upper-left corner (row, column) plus
/// dimensions (width, height).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageRegion {
    pub ul: ImageCoord,
    pub size: ImageDimensions,
}

impl ImageRegion {
    pub fn new(ul_r: u64, ul_c: u64, w: u64, h: u64) -> Self {
        Self {
            ul: (ul_r, ul_c),
            size: (w, h),
        }
    }

    pub fn ul_row(&self) -> u64 {
        self.ul.0
    }

    pub fn ul_col(&self) -> u64 {
        self.ul.1
    }

    pub fn width(&self) -> u64 {
        self.size.0
    }

    pub fn height(&self) -> u64 {
        self.size.1
    }

    /// Exclusive lower-right corner as (row, column).
    pub fn lr(&self) -> ImageCoord {
        (self.ul.0 + self.size.1, self.ul.1 + self.size.0)
    }

    pub fn intersects(&self, other: &ImageRegion) -> bool {
        let (r1, c1) = self.ul;
        let (r2, c2) = self.lr();
        let (or1, oc1) = other.ul;
        let (or2, oc2) = other.lr();
        r1 < or2 && or1 < r2 && c1 < oc2 && oc1 < c2
    }

    /// Stable identifier used in region ids and log fields.
    pub fn label(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.ul.0, self.ul.1, self.size.0, self.size.1
        )
    }
}

/// Lifecycle status shared by image, region, and tile records.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    InProgress,
    Success,
    Partial,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::InProgress => "IN_PROGRESS",
            RequestStatus::Success => "SUCCESS",
            RequestStatus::Partial => "PARTIAL",
            RequestStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Success | RequestStatus::Partial | RequestStatus::Failed
        )
    }

    /// Derive a terminal status from success/failure counts. IN_PROGRESS is
    /// the answer whenever the counts do not yet cover the total; an empty
    /// total is trivially successful.
    pub fn from_counts(succeeded: usize, failed: usize, total: usize) -> RequestStatus {
        if succeeded + failed < total {
            RequestStatus::InProgress
        } else if failed == 0 {
            RequestStatus::Success
        } else if succeeded == 0 {
            RequestStatus::Failed
        } else {
            RequestStatus::Partial
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifiers threaded explicitly through every operation so structured log
/// entries and status events can pull their fields from one place.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct RequestContext {
    pub job_id: String,
    pub image_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tile_id: Option<String>,
}

impl RequestContext {
    pub fn image(job_id: &str, image_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            image_id: image_id.to_string(),
            region_id: None,
            tile_id: None,
        }
    }

    pub fn with_region(&self, region_id: &str) -> Self {
        let mut ctx = self.clone();
        ctx.region_id = Some(region_id.to_string());
        ctx
    }

    pub fn with_tile(&self, tile_id: &str) -> Self {
        let mut ctx = self.clone();
        ctx.tile_id = Some(tile_id.to_string());
        ctx
    }
}
