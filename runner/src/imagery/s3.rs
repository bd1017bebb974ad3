use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;

use super::ObjectStore;
use crate::aws::parse_s3_url;

#[derive(Clone)]
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, url: &str) -> Result<Bytes> {
        let (bucket, key) = parse_s3_url(url)?;
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("get object {url}"))?;
        let body = response
            .body
            .collect()
            .await
            .with_context(|| format!("read object body {url}"))?;
        Ok(body.into_bytes())
    }

    async fn put(&self, url: &str, body: Bytes) -> Result<()> {
        let (bucket, key) = parse_s3_url(url)?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body.into())
            .send()
            .await
            .with_context(|| format!("put object {url}"))?;
        Ok(())
    }
}
