use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_kinesis::primitives::Blob;
use geojson::Feature;
use osprey_common::image_basename;

use super::{Sink, feature_collection_body};

/// Streams the aggregate detections as FeatureCollection records, batched
/// by count or by the record byte cap, whichever fills first.
pub struct KinesisSink {
    client: aws_sdk_kinesis::Client,
    stream: String,
    batch_size: Option<usize>,
    max_record_size: usize,
}

impl KinesisSink {
    pub fn new(
        client: aws_sdk_kinesis::Client,
        stream: impl Into<String>,
        batch_size: Option<usize>,
        max_record_size: usize,
    ) -> Self {
        Self {
            client,
            stream: stream.into(),
            batch_size,
            max_record_size,
        }
    }

    async fn flush(&self, partition_key: &str, features: &[Feature]) -> Result<()> {
        let record = feature_collection_body(features)?;
        self.client
            .put_record()
            .stream_name(&self.stream)
            .partition_key(partition_key)
            .data(Blob::new(record.into_bytes()))
            .send()
            .await
            .with_context(|| format!("put record to stream {}", self.stream))?;
        Ok(())
    }

    /// Split features into record-sized batches without sending them.
    fn plan_batches<'a>(&self, features: &'a [Feature]) -> Result<Vec<Vec<&'a Feature>>> {
        let mut batches: Vec<Vec<&Feature>> = Vec::new();
        let mut pending: Vec<&Feature> = Vec::new();
        let mut pending_size = 0usize;
        for feature in features {
            if self.batch_size == Some(1) {
                batches.push(vec![feature]);
                continue;
            }
            let size = serde_json::to_string(feature)?.len();
            let count_full = self
                .batch_size
                .is_some_and(|batch| !pending.is_empty() && pending.len() >= batch);
            let bytes_full = !pending.is_empty() && pending_size + size > self.max_record_size;
            if count_full || bytes_full {
                batches.push(std::mem::take(&mut pending));
                pending_size = 0;
            }
            pending.push(feature);
            pending_size += size;
        }
        if !pending.is_empty() {
            batches.push(pending);
        }
        Ok(batches)
    }
}

#[async_trait]
impl Sink for KinesisSink {
    fn name(&self) -> &'static str {
        "Kinesis"
    }

    async fn write(&self, image_id: &str, features: &[Feature]) -> Result<()> {
        let partition_key = image_basename(image_id);
        let batches = self.plan_batches(features)?;
        for batch in &batches {
            let owned: Vec<Feature> = batch.iter().map(|f| (*f).clone()).collect();
            self.flush(partition_key, &owned).await?;
        }
        tracing::info!(
            image_id = image_id,
            stream = %self.stream,
            count = features.len(),
            records = batches.len(),
            "wrote features to stream"
        );
        Ok(())
    }
}
