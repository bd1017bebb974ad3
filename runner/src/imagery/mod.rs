//! Raster access seam.
//!
//! Reading and cropping source rasters is a collaborator concern; the
//! orchestrator only depends on the traits here. The bundled
//! [`ObjectRasterSource`] handles rasters the `image` crate can decode
//! (JPEG, PNG, GeoTIFF) by fetching the whole object; deployments with
//! sensor-format needs substitute their own implementation.

mod reader;
mod s3;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use osprey_common::types::{ImageDimensions, ImageRegion};

use crate::api::{TileCompression, TileFormat};
use crate::sensor::SensorModel;

pub use reader::{DecodedRaster, ObjectRasterSource};
pub use s3::S3ObjectStore;

/// Whole-object access to an object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, url: &str) -> Result<Bytes>;
    async fn put(&self, url: &str, body: Bytes) -> Result<()>;
}

/// Opens rasters named by image requests.
#[async_trait]
pub trait RasterSource: Send + Sync {
    async fn open(
        &self,
        image_url: &str,
        read_role: Option<&str>,
    ) -> Result<Arc<dyn OpenRaster>>;
}

/// An opened raster, shared read-only by the tile workers of one region.
pub trait OpenRaster: Send + Sync {
    /// Full image extent as (width, height).
    fn dimensions(&self) -> ImageDimensions;

    /// Crop a window and encode it as a tile payload.
    fn crop(
        &self,
        bounds: ImageRegion,
        format: TileFormat,
        compression: TileCompression,
    ) -> Result<Bytes>;

    /// The raster's sensor model, when it carries one.
    fn sensor_model(&self) -> Option<Arc<dyn SensorModel>>;
}
