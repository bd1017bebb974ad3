//! The in-process tile worker pool.
//!
//! Each region spins up a bounded pool of workers draining one unbounded
//! channel of tile descriptors. Closing the channel is the shutdown
//! sentinel: workers drain what is queued and exit. A failure inside a
//! worker marks that single tile FAILED and never crosses to its siblings.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use osprey_common::types::{ImageRegion, RequestContext, RequestStatus};

use super::completion::{finalize_tile, persist_tile_features};
use crate::api::RegionRequest;
use crate::imagery::OpenRaster;
use crate::inference::{Detector, InvocationError, InvocationOutcome, with_backoff};
use crate::runtime::Runtime;
use crate::status::StatusScope;
use crate::store::{FEATURE_TTL_MS, TileRequestItem, now_ms};

/// Ceiling on one endpoint invocation, replies included.
const INVOKE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct TileWork {
    pub tile_id: String,
    pub bounds: ImageRegion,
}

/// Process every crop of a region through a worker pool sized by
/// `min(configured workers, endpoint share)`.
pub async fn run_pool(
    rt: &Arc<Runtime>,
    request: &RegionRequest,
    raster: Arc<dyn OpenRaster>,
    detector: Arc<dyn Detector>,
    crops: Vec<ImageRegion>,
) -> Result<()> {
    let pool_size = rt
        .config
        .workers
        .min(request.endpoint_share.max(1) as usize)
        .max(1);
    let (tx, rx) = async_channel::unbounded::<TileWork>();

    let mut workers = Vec::with_capacity(pool_size);
    for worker in 0..pool_size {
        let rx = rx.clone();
        let rt = rt.clone();
        let request = request.clone();
        let raster = raster.clone();
        let detector = detector.clone();
        workers.push(tokio::spawn(async move {
            while let Ok(work) = rx.recv().await {
                if let Err(err) = process_tile(&rt, &request, &*raster, &*detector, &work).await {
                    tracing::error!(
                        worker = worker,
                        tile_id = %work.tile_id,
                        error = ?err,
                        "tile bookkeeping failed"
                    );
                }
            }
        }));
    }

    for bounds in crops {
        tx.send(TileWork {
            tile_id: bounds.label(),
            bounds,
        })
        .await
        .context("tile channel closed early")?;
    }
    drop(tx);

    for worker in workers {
        worker.await.context("tile worker panicked")?;
    }
    Ok(())
}

/// Crop, invoke, and record one tile. Returns Err only when the terminal
/// state itself could not be recorded.
async fn process_tile(
    rt: &Arc<Runtime>,
    request: &RegionRequest,
    raster: &dyn OpenRaster,
    detector: &dyn Detector,
    work: &TileWork,
) -> Result<()> {
    let payload = match raster.crop(work.bounds, request.tile_format, request.tile_compression) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!(tile_id = %work.tile_id, error = ?err, "failed to crop tile");
            return finalize_tile(rt, request, &work.tile_id, true, "tile crop failed").await;
        }
    };

    let outcome = with_backoff(&request.model_name, rt.config.max_retries, || {
        let payload = payload.clone();
        async move {
            match tokio::time::timeout(INVOKE_TIMEOUT, detector.find_features(payload)).await {
                Ok(result) => result,
                Err(_) => Err(InvocationError::transient(anyhow!(
                    "endpoint invocation timed out"
                ))),
            }
        }
    })
    .await;

    match outcome {
        Ok(InvocationOutcome::Features(features)) => {
            match persist_tile_features(
                rt,
                &request.image_id,
                &work.tile_id,
                work.bounds,
                request.tile_size,
                request.tile_overlap,
                features,
            )
            .await
            {
                Ok(count) => {
                    tracing::debug!(tile_id = %work.tile_id, features = count, "tile processed");
                    finalize_tile(rt, request, &work.tile_id, false, "tile processed").await
                }
                Err(err) => {
                    tracing::error!(tile_id = %work.tile_id, error = ?err, "failed to persist features");
                    finalize_tile(rt, request, &work.tile_id, true, "feature persistence failed")
                        .await
                }
            }
        }
        Ok(InvocationOutcome::Queued {
            inference_id,
            input_location,
            output_location,
        }) => {
            let item = TileRequestItem {
                inference_id: inference_id.clone(),
                tile_id: work.tile_id.clone(),
                region_id: request.region_id.clone(),
                image_id: request.image_id.clone(),
                job_id: request.job_id.clone(),
                image_url: request.image_url.clone(),
                image_path: input_location,
                tile_bounds: work.bounds,
                tile_size: request.tile_size,
                tile_overlap: request.tile_overlap,
                output_location,
                tile_status: RequestStatus::InProgress,
                retry_count: 0,
                expire_time: now_ms() + FEATURE_TTL_MS,
            };
            rt.store.put_outstanding_tile(item).await?;
            let ctx = RequestContext::image(&request.job_id, &request.image_id)
                .with_region(&request.region_id)
                .with_tile(&work.tile_id);
            rt.status
                .emit(
                    StatusScope::Tile,
                    &ctx,
                    RequestStatus::InProgress,
                    None,
                    &format!("awaiting async inference {inference_id}"),
                )
                .await;
            Ok(())
        }
        Err(err) => {
            tracing::warn!(tile_id = %work.tile_id, error = %err, "tile invocation failed");
            finalize_tile(rt, request, &work.tile_id, true, &format!("{err}")).await
        }
    }
}
