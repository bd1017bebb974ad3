use std::sync::Arc;
use std::time::Instant;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_sagemakerruntime::error::SdkError;
use aws_sdk_sagemakerruntime::primitives::Blob;
use bytes::Bytes;
use metrics::{counter, histogram};
use osprey_common::args::StagingArgs;
use serde_json::{Value, json};
use uuid::Uuid;

use super::retry::{InvocationError, classify_status};
use super::schema::parse_feature_collection;
use super::{Detector, DetectorFactory, InvocationOutcome};
use crate::api::{ModelInvokeMode, RegionRequest};
use crate::aws::{assumed_role_config, s3_client};
use crate::imagery::{ObjectStore, S3ObjectStore};

fn classify_sdk_error<E>(err: SdkError<E>, what: &str) -> InvocationError
where
    SdkError<E>: std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let wrapped = anyhow::Error::new(err).context(what.to_string());
    match status {
        Some(status) => classify_status(status)(wrapped),
        // No response at all: dispatch failure or timeout.
        None => InvocationError::Transient(wrapped),
    }
}

/// Synchronous SageMaker endpoint.
pub struct SmDetector {
    client: aws_sdk_sagemakerruntime::Client,
    endpoint_name: String,
}

impl SmDetector {
    pub fn new(client: aws_sdk_sagemakerruntime::Client, endpoint_name: impl Into<String>) -> Self {
        Self {
            client,
            endpoint_name: endpoint_name.into(),
        }
    }
}

#[async_trait]
impl Detector for SmDetector {
    fn endpoint_name(&self) -> &str {
        &self.endpoint_name
    }

    async fn find_features(&self, payload: Bytes) -> Result<InvocationOutcome, InvocationError> {
        counter!("model_invocations_total", "endpoint" => self.endpoint_name.clone()).increment(1);
        let started = Instant::now();

        let response = self
            .client
            .invoke_endpoint()
            .endpoint_name(&self.endpoint_name)
            .content_type("application/octet-stream")
            .body(Blob::new(payload.to_vec()))
            .send()
            .await
            .map_err(|err| {
                counter!("model_errors_total", "endpoint" => self.endpoint_name.clone())
                    .increment(1);
                classify_sdk_error(err, "invoke model endpoint")
            })?;

        histogram!("endpoint_latency_seconds", "endpoint" => self.endpoint_name.clone())
            .record(started.elapsed().as_secs_f64());

        let body = response.body.unwrap_or_default().into_inner();
        let value: Value = serde_json::from_slice(&body).map_err(|err| {
            counter!("model_errors_total", "endpoint" => self.endpoint_name.clone()).increment(1);
            InvocationError::permanent(anyhow!(err).context("decode model response"))
        })?;
        let features = parse_feature_collection(value).map_err(|err| {
            counter!("model_errors_total", "endpoint" => self.endpoint_name.clone()).increment(1);
            InvocationError::Permanent(err.context("model response failed schema check"))
        })?;
        Ok(InvocationOutcome::Features(features))
    }
}

/// Asynchronous self-hosted HTTP endpoint: the payload is staged to the
/// object store and the endpoint is told where to find it; detections
/// arrive later through the tile-results queue.
pub struct HttpDetector {
    url: String,
    staging_bucket: String,
    staging_prefix: String,
    object_store: Arc<dyn ObjectStore>,
    http: reqwest::Client,
}

impl HttpDetector {
    pub fn new(
        url: impl Into<String>,
        staging_bucket: impl Into<String>,
        staging_prefix: impl Into<String>,
        object_store: Arc<dyn ObjectStore>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            url: url.into(),
            staging_bucket: staging_bucket.into(),
            staging_prefix: staging_prefix.into(),
            object_store,
            http,
        }
    }
}

#[async_trait]
impl Detector for HttpDetector {
    fn endpoint_name(&self) -> &str {
        &self.url
    }

    async fn find_features(&self, payload: Bytes) -> Result<InvocationOutcome, InvocationError> {
        counter!("model_invocations_total", "endpoint" => self.url.clone()).increment(1);
        let started = Instant::now();

        let inference_id = Uuid::new_v4().to_string();
        let input_location = format!(
            "s3://{}/{}/{}",
            self.staging_bucket,
            self.staging_prefix.trim_matches('/'),
            inference_id
        );
        self.object_store
            .put(&input_location, payload)
            .await
            .map_err(|err| InvocationError::Transient(err.context("stage tile payload")))?;

        let response = self
            .http
            .post(&self.url)
            .json(&json!({
                "inferenceId": inference_id,
                "inputLocation": input_location,
            }))
            .send()
            .await
            .map_err(|err| {
                counter!("model_errors_total", "endpoint" => self.url.clone()).increment(1);
                InvocationError::transient(anyhow!(err).context("invoke http endpoint"))
            })?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            counter!("model_errors_total", "endpoint" => self.url.clone()).increment(1);
            return Err(classify_status(status)(anyhow!(
                "endpoint {} answered {status}",
                self.url
            )));
        }

        histogram!("endpoint_latency_seconds", "endpoint" => self.url.clone())
            .record(started.elapsed().as_secs_f64());

        let body: Value = response.json().await.map_err(|err| {
            counter!("model_errors_total", "endpoint" => self.url.clone()).increment(1);
            InvocationError::permanent(anyhow!(err).context("decode async-invoke response"))
        })?;
        let inference_id = body
            .get("inferenceId")
            .and_then(Value::as_str)
            .unwrap_or(&inference_id)
            .to_string();
        let output_location = body
            .get("outputLocation")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(InvocationOutcome::Queued {
            inference_id,
            input_location,
            output_location,
        })
    }
}

/// Builds detectors for region requests against real AWS endpoints.
pub struct AwsDetectorFactory {
    base_config: SdkConfig,
    s3_endpoint: Option<String>,
    staging: StagingArgs,
    http: reqwest::Client,
}

impl AwsDetectorFactory {
    pub fn new(base_config: SdkConfig, s3_endpoint: Option<String>, staging: StagingArgs) -> Self {
        Self {
            base_config,
            s3_endpoint,
            staging,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl DetectorFactory for AwsDetectorFactory {
    async fn for_request(&self, request: &RegionRequest) -> Result<Arc<dyn Detector>> {
        let config = match request.model_invocation_role.as_deref() {
            Some(role) => {
                assumed_role_config(&self.base_config, role, "osprey-model-invoke").await
            }
            None => self.base_config.clone(),
        };
        match request.model_invoke_mode {
            ModelInvokeMode::SmEndpoint => {
                let client = aws_sdk_sagemakerruntime::Client::new(&config);
                Ok(Arc::new(SmDetector::new(client, &request.model_name)))
            }
            ModelInvokeMode::HttpEndpoint => {
                let Some(bucket) = self.staging.async_staging_bucket.clone() else {
                    bail!(
                        "HTTP endpoint {} requires a staging bucket for async payloads",
                        request.model_name
                    );
                };
                let store = S3ObjectStore::new(s3_client(&config, self.s3_endpoint.as_deref()));
                Ok(Arc::new(HttpDetector::new(
                    &request.model_name,
                    bucket,
                    self.staging.async_staging_prefix.clone(),
                    Arc::new(store),
                    self.http.clone(),
                )))
            }
        }
    }
}
