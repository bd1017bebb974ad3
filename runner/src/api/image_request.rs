use anyhow::{Context, Result, bail};
use geo::Polygon;
use osprey_common::types::ImageDimensions;
use serde::{Deserialize, Serialize};
use wkt::TryFromWkt;

pub const DEFAULT_TILE_SIZE: u64 = 1024;
pub const DEFAULT_TILE_OVERLAP: u64 = 50;

/// How the model endpoint is hosted and invoked. SageMaker endpoints are
/// invoked synchronously; self-hosted HTTP endpoints follow the async
/// stage-and-poll contract.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelInvokeMode {
    #[serde(rename = "SM_ENDPOINT")]
    SmEndpoint,
    #[serde(rename = "HTTP_ENDPOINT")]
    HttpEndpoint,
}

impl ModelInvokeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelInvokeMode::SmEndpoint => "SM_ENDPOINT",
            ModelInvokeMode::HttpEndpoint => "HTTP_ENDPOINT",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TileFormat {
    #[serde(rename = "NITF")]
    Nitf,
    #[serde(rename = "JPEG")]
    Jpeg,
    #[serde(rename = "PNG")]
    Png,
    #[serde(rename = "GTIFF")]
    Gtiff,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TileCompression {
    #[serde(rename = "NONE")]
    None,
    #[serde(rename = "JPEG")]
    Jpeg,
    #[serde(rename = "J2K")]
    J2k,
    #[serde(rename = "LZW")]
    Lzw,
}

/// One configured result destination.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum SinkSpec {
    S3 {
        bucket: String,
        prefix: String,
        #[serde(
            rename = "assumedRole",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        assumed_role: Option<String>,
    },
    Kinesis {
        stream: String,
        #[serde(rename = "batchSize", default)]
        batch_size: Option<usize>,
        #[serde(
            rename = "assumedRole",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        assumed_role: Option<String>,
    },
}

/// Wire shape of a message on the image request queue.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ExternalImageRequest {
    job_arn: String,
    job_id: String,
    image_urls: Vec<String>,
    #[serde(default)]
    image_read_role: Option<String>,
    image_processor: ExternalImageProcessor,
    #[serde(default)]
    image_processor_tile_size: Option<u64>,
    #[serde(default)]
    image_processor_tile_overlap: Option<u64>,
    #[serde(default)]
    image_processor_tile_format: Option<TileFormat>,
    #[serde(default)]
    image_processor_tile_compression: Option<TileCompression>,
    #[serde(default)]
    region_of_interest: Option<String>,
    #[serde(default)]
    outputs: Option<Vec<SinkSpec>>,
    #[serde(default)]
    output_bucket: Option<String>,
    #[serde(default)]
    output_prefix: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ExternalImageProcessor {
    name: String,
    #[serde(rename = "type")]
    kind: ModelInvokeMode,
    #[serde(rename = "assumedRole", default)]
    assumed_role: Option<String>,
}

/// A fully parsed and validated request to process one image.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ImageRequest {
    pub job_id: String,
    pub job_arn: String,
    pub image_id: String,
    pub image_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_read_role: Option<String>,
    pub model_name: String,
    pub model_invoke_mode: ModelInvokeMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_invocation_role: Option<String>,
    pub tile_size: ImageDimensions,
    pub tile_overlap: ImageDimensions,
    pub tile_format: TileFormat,
    pub tile_compression: TileCompression,
    /// Region of interest as a WKT polygon in world coordinates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roi: Option<String>,
    pub outputs: Vec<SinkSpec>,
}

impl ImageRequest {
    /// Parse a queue message body. The legacy `outputBucket`/`outputPrefix`
    /// pair is mapped to a single S3 output.
    pub fn from_message(body: &str) -> Result<ImageRequest> {
        let external: ExternalImageRequest =
            serde_json::from_str(body).context("image request is not valid JSON")?;

        let image_url = external
            .image_urls
            .first()
            .cloned()
            .context("image request contains no image urls")?;

        let outputs = match external.outputs {
            Some(outputs) if !outputs.is_empty() => outputs,
            _ => match (external.output_bucket, external.output_prefix) {
                (Some(bucket), Some(prefix)) => vec![SinkSpec::S3 {
                    bucket,
                    prefix,
                    assumed_role: None,
                }],
                _ => Vec::new(),
            },
        };

        let tile_size = external
            .image_processor_tile_size
            .unwrap_or(DEFAULT_TILE_SIZE);
        let tile_overlap = external
            .image_processor_tile_overlap
            .unwrap_or(DEFAULT_TILE_OVERLAP);

        let request = ImageRequest {
            image_id: format!("{}:{}", external.job_id, image_url),
            job_id: external.job_id,
            job_arn: external.job_arn,
            image_url,
            image_read_role: external.image_read_role,
            model_name: external.image_processor.name,
            model_invoke_mode: external.image_processor.kind,
            model_invocation_role: external.image_processor.assumed_role,
            tile_size: (tile_size, tile_size),
            tile_overlap: (tile_overlap, tile_overlap),
            tile_format: external.image_processor_tile_format.unwrap_or(TileFormat::Nitf),
            tile_compression: external
                .image_processor_tile_compression
                .unwrap_or(TileCompression::None),
            roi: external.region_of_interest,
            outputs,
        };
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<()> {
        if self.job_id.is_empty() || self.job_arn.is_empty() {
            bail!("image request is missing job identifiers");
        }
        if !self.image_url.starts_with("s3://") {
            bail!("image url must use the s3:// scheme: {}", self.image_url);
        }
        if self.outputs.is_empty() {
            bail!("image request declares no output sinks");
        }
        if self.tile_overlap.0 >= self.tile_size.0 || self.tile_overlap.1 >= self.tile_size.1 {
            bail!(
                "tile overlap {:?} must be smaller than tile size {:?}",
                self.tile_overlap,
                self.tile_size
            );
        }
        if let Some(roi) = &self.roi {
            Polygon::<f64>::try_from_wkt_str(roi)
                .map_err(|e| anyhow::anyhow!("region of interest is not a WKT polygon: {e}"))?;
        }
        Ok(())
    }

    /// The parsed region of interest, when one was supplied.
    pub fn roi_polygon(&self) -> Option<Polygon<f64>> {
        self.roi
            .as_ref()
            .and_then(|roi| Polygon::try_from_wkt_str(roi).ok())
    }
}
