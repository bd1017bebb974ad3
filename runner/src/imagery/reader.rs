use std::io::Cursor;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use aws_config::SdkConfig;
use bytes::Bytes;
use image::DynamicImage;
use osprey_common::types::{ImageDimensions, ImageRegion};

use super::{OpenRaster, RasterSource};
use crate::api::{TileCompression, TileFormat};
use crate::aws::{assumed_role_config, parse_s3_url, s3_client};
use crate::sensor::SensorModel;

/// Raster source that fetches the whole object and decodes it in memory.
///
/// Suitable for the formats the `image` crate reads; sensor formats (NITF)
/// need an external reader. The declared read role, when present, scopes
/// the fetch.
pub struct ObjectRasterSource {
    base_config: SdkConfig,
    s3_endpoint: Option<String>,
}

impl ObjectRasterSource {
    pub fn new(base_config: SdkConfig, s3_endpoint: Option<String>) -> Self {
        Self {
            base_config,
            s3_endpoint,
        }
    }
}

#[async_trait]
impl RasterSource for ObjectRasterSource {
    async fn open(
        &self,
        image_url: &str,
        read_role: Option<&str>,
    ) -> Result<Arc<dyn OpenRaster>> {
        let config = match read_role {
            Some(role) => assumed_role_config(&self.base_config, role, "osprey-image-read").await,
            None => self.base_config.clone(),
        };
        let client = s3_client(&config, self.s3_endpoint.as_deref());
        let (bucket, key) = parse_s3_url(image_url)?;
        let response = client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("get raster {image_url}"))?;
        let body = response
            .body
            .collect()
            .await
            .with_context(|| format!("read raster body {image_url}"))?;
        let image = image::load_from_memory(&body.into_bytes())
            .with_context(|| format!("decode raster {image_url}"))?;
        tracing::info!(
            url = image_url,
            width = image.width(),
            height = image.height(),
            "opened raster"
        );
        Ok(Arc::new(DecodedRaster::new(image, None)))
    }
}

/// An in-memory decoded raster.
pub struct DecodedRaster {
    image: DynamicImage,
    sensor: Option<Arc<dyn SensorModel>>,
}

impl DecodedRaster {
    pub fn new(image: DynamicImage, sensor: Option<Arc<dyn SensorModel>>) -> Self {
        Self { image, sensor }
    }
}

impl OpenRaster for DecodedRaster {
    fn dimensions(&self) -> ImageDimensions {
        (self.image.width() as u64, self.image.height() as u64)
    }

    fn crop(
        &self,
        bounds: ImageRegion,
        format: TileFormat,
        compression: TileCompression,
    ) -> Result<Bytes> {
        let (width, height) = self.dimensions();
        if bounds.ul_col() + bounds.width() > width || bounds.ul_row() + bounds.height() > height {
            bail!("crop {bounds:?} exceeds raster extent {width}x{height}");
        }
        let window = self.image.crop_imm(
            bounds.ul_col() as u32,
            bounds.ul_row() as u32,
            bounds.width() as u32,
            bounds.height() as u32,
        );
        encode_tile(&window, format, compression)
    }

    fn sensor_model(&self) -> Option<Arc<dyn SensorModel>> {
        self.sensor.clone()
    }
}

fn encode_tile(
    window: &DynamicImage,
    format: TileFormat,
    compression: TileCompression,
) -> Result<Bytes> {
    let mut buffer = Cursor::new(Vec::new());
    match (format, compression) {
        (TileFormat::Jpeg, _) | (TileFormat::Nitf, TileCompression::Jpeg) => {
            window
                .to_rgb8()
                .write_to(&mut buffer, image::ImageFormat::Jpeg)
                .context("encode jpeg tile")?;
        }
        (TileFormat::Png, _) => {
            window
                .write_to(&mut buffer, image::ImageFormat::Png)
                .context("encode png tile")?;
        }
        (TileFormat::Gtiff, _) => {
            window
                .write_to(&mut buffer, image::ImageFormat::Tiff)
                .context("encode tiff tile")?;
        }
        (TileFormat::Nitf, _) => {
            bail!("the built-in raster reader cannot encode NITF tiles");
        }
    }
    Ok(Bytes::from(buffer.into_inner()))
}
