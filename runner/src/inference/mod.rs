//! Inference endpoint invocation.
//!
//! The orchestrator talks to endpoints through the [`Detector`] capability;
//! concrete transports are selected by the request's invoke-mode tag.
//! SageMaker endpoints answer synchronously with a feature collection;
//! HTTP endpoints follow the staged async contract and answer with an
//! inference id that a completion event later references.

mod endpoint;
mod retry;
mod schema;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use geojson::Feature;

use crate::api::{ModelInvokeMode, RegionRequest};

pub use endpoint::{AwsDetectorFactory, HttpDetector, SmDetector};
pub use retry::{InvocationError, backoff_delay, classify_status, with_backoff};
pub use schema::{parse_feature_collection, validate_response};

/// What one endpoint invocation produced.
#[derive(Debug)]
pub enum InvocationOutcome {
    /// Synchronous endpoints: schema-validated detections for the tile.
    Features(Vec<Feature>),
    /// Asynchronous endpoints: the invocation was accepted; a completion
    /// event will reference the inference id.
    Queued {
        inference_id: String,
        input_location: String,
        output_location: Option<String>,
    },
}

#[async_trait]
pub trait Detector: Send + Sync {
    fn endpoint_name(&self) -> &str;

    /// Send one tile payload to the endpoint.
    async fn find_features(&self, payload: Bytes) -> Result<InvocationOutcome, InvocationError>;
}

/// Builds the detector for a region request; one detector serves every tile
/// of the region.
#[async_trait]
pub trait DetectorFactory: Send + Sync {
    async fn for_request(&self, request: &RegionRequest) -> Result<Arc<dyn Detector>>;
}
