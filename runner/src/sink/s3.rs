use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::types::ObjectCannedAcl;
use geojson::Feature;
use osprey_common::image_basename;

use super::{Sink, feature_collection_body};

/// Writes the aggregate FeatureCollection as one GeoJSON object.
pub struct S3Sink {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl S3Sink {
    pub fn new(
        client: aws_sdk_s3::Client,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    pub fn object_key(&self, image_id: &str) -> String {
        format!(
            "{}/{}.geojson",
            self.prefix.trim_end_matches('/'),
            image_basename(image_id)
        )
    }
}

#[async_trait]
impl Sink for S3Sink {
    fn name(&self) -> &'static str {
        "S3"
    }

    async fn write(&self, image_id: &str, features: &[Feature]) -> Result<()> {
        let key = self.object_key(image_id);
        let body = feature_collection_body(features)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body.into_bytes().into())
            .content_type("application/geo+json")
            .acl(ObjectCannedAcl::BucketOwnerFullControl)
            .send()
            .await
            .with_context(|| format!("write results to s3://{}/{}", self.bucket, key))?;
        tracing::info!(
            image_id = image_id,
            bucket = %self.bucket,
            key = %key,
            count = features.len(),
            "wrote aggregate feature collection"
        );
        Ok(())
    }
}
