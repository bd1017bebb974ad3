use anyhow::{Result, bail};
use osprey_common::types::{ImageDimensions, ImageRegion};
use serde::{Deserialize, Serialize};

use super::{ImageRequest, ModelInvokeMode, SinkSpec, TileCompression, TileFormat};

/// A request to process one region of an image, carried on the region queue.
///
/// The message echoes everything a worker process needs so that any process
/// in the fleet can pick it up without consulting the image record first.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RegionRequest {
    pub job_id: String,
    pub image_id: String,
    pub image_url: String,
    pub region_id: String,
    pub region_bounds: ImageRegion,
    pub tile_size: ImageDimensions,
    pub tile_overlap: ImageDimensions,
    pub tile_format: TileFormat,
    pub tile_compression: TileCompression,
    pub model_name: String,
    pub model_invoke_mode: ModelInvokeMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_invocation_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_read_role: Option<String>,
    pub outputs: Vec<SinkSpec>,
    /// Endpoint capacity credits held by the image this region belongs to.
    /// Bounds the per-region worker pool.
    #[serde(default)]
    pub endpoint_share: u64,
}

impl RegionRequest {
    pub fn from_image_request(
        request: &ImageRequest,
        bounds: ImageRegion,
        endpoint_share: u64,
    ) -> RegionRequest {
        RegionRequest {
            job_id: request.job_id.clone(),
            image_id: request.image_id.clone(),
            image_url: request.image_url.clone(),
            region_id: bounds.label(),
            region_bounds: bounds,
            tile_size: request.tile_size,
            tile_overlap: request.tile_overlap,
            tile_format: request.tile_format,
            tile_compression: request.tile_compression,
            model_name: request.model_name.clone(),
            model_invoke_mode: request.model_invoke_mode,
            model_invocation_role: request.model_invocation_role.clone(),
            image_read_role: request.image_read_role.clone(),
            outputs: request.outputs.clone(),
            endpoint_share,
        }
    }

    pub fn from_message(body: &str) -> Result<RegionRequest> {
        let request: RegionRequest = serde_json::from_str(body)?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<()> {
        if self.image_id.is_empty() || self.region_id.is_empty() {
            bail!("region request is missing identifiers");
        }
        if self.region_bounds.width() == 0 || self.region_bounds.height() == 0 {
            bail!("region bounds are degenerate: {:?}", self.region_bounds);
        }
        if self.tile_overlap.0 >= self.tile_size.0 || self.tile_overlap.1 >= self.tile_size.1 {
            bail!(
                "tile overlap {:?} must be smaller than tile size {:?}",
                self.tile_overlap,
                self.tile_size
            );
        }
        Ok(())
    }
}
