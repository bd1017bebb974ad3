//! Result destinations for aggregated detections.
//!
//! Every sink runs in aggregate mode: one write per image. Sinks fail
//! independently; the image's results count as delivered when at least one
//! sink accepted them.

mod kinesis;
mod s3;

use anyhow::Result;
use async_trait::async_trait;
use aws_config::SdkConfig;
use geojson::{Feature, FeatureCollection};

use crate::api::SinkSpec;
use crate::aws::{assumed_role_config, s3_client};

pub use kinesis::KinesisSink;
pub use s3::S3Sink;

#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn write(&self, image_id: &str, features: &[Feature]) -> Result<()>;
}

#[async_trait]
pub trait SinkFactory: Send + Sync {
    async fn build(&self, specs: &[SinkSpec]) -> Result<Vec<Box<dyn Sink>>>;
}

pub fn feature_collection_body(features: &[Feature]) -> Result<String> {
    let collection = FeatureCollection {
        bbox: None,
        features: features.to_vec(),
        foreign_members: None,
    };
    Ok(serde_json::to_string(&collection)?)
}

/// Write to every sink, returning how many accepted the results.
pub async fn write_all(sinks: &[Box<dyn Sink>], image_id: &str, features: &[Feature]) -> usize {
    let mut delivered = 0;
    for sink in sinks {
        match sink.write(image_id, features).await {
            Ok(()) => delivered += 1,
            Err(err) => {
                tracing::error!(
                    sink = sink.name(),
                    image_id = image_id,
                    error = ?err,
                    "sink write failed"
                );
            }
        }
    }
    delivered
}

/// Builds sinks against real AWS destinations, assuming the per-sink role
/// when one is declared.
pub struct AwsSinkFactory {
    base_config: SdkConfig,
    s3_endpoint: Option<String>,
    kinesis_max_record_size: usize,
}

impl AwsSinkFactory {
    pub fn new(
        base_config: SdkConfig,
        s3_endpoint: Option<String>,
        kinesis_max_record_size: usize,
    ) -> Self {
        Self {
            base_config,
            s3_endpoint,
            kinesis_max_record_size,
        }
    }
}

#[async_trait]
impl SinkFactory for AwsSinkFactory {
    async fn build(&self, specs: &[SinkSpec]) -> Result<Vec<Box<dyn Sink>>> {
        let mut sinks: Vec<Box<dyn Sink>> = Vec::with_capacity(specs.len());
        for spec in specs {
            match spec {
                SinkSpec::S3 {
                    bucket,
                    prefix,
                    assumed_role,
                } => {
                    let config = match assumed_role.as_deref() {
                        Some(role) => {
                            assumed_role_config(&self.base_config, role, "osprey-sink").await
                        }
                        None => self.base_config.clone(),
                    };
                    sinks.push(Box::new(S3Sink::new(
                        s3_client(&config, self.s3_endpoint.as_deref()),
                        bucket,
                        prefix,
                    )));
                }
                SinkSpec::Kinesis {
                    stream,
                    batch_size,
                    assumed_role,
                } => {
                    let config = match assumed_role.as_deref() {
                        Some(role) => {
                            assumed_role_config(&self.base_config, role, "osprey-sink").await
                        }
                        None => self.base_config.clone(),
                    };
                    sinks.push(Box::new(KinesisSink::new(
                        aws_sdk_kinesis::Client::new(&config),
                        stream,
                        *batch_size,
                        self.kinesis_max_record_size,
                    )));
                }
            }
        }
        Ok(sinks)
    }
}
