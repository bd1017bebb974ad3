//! Region request consumer: computes the tile grid, drives the worker
//! pool, and rolls the region outcome up into the image record.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use osprey_common::types::{ImageRegion, RequestContext, RequestStatus};
use tokio_util::sync::CancellationToken;

use super::completion::{finalize_tile, maybe_finish_region};
use super::tile_worker::run_pool;
use crate::api::RegionRequest;
use crate::queue::ReceivedMessage;
use crate::runtime::Runtime;
use crate::status::StatusScope;
use crate::store::RegionRequestItem;
use crate::tiling::generate_crops;

pub async fn run_region_loop(rt: Arc<Runtime>, cancel: CancellationToken) {
    tracing::info!("region processor listening");
    loop {
        let received = tokio::select! {
            () = cancel.cancelled() => break,
            received = rt.region_queue.receive(
                rt.config.queue_wait,
                rt.config.queue_visibility,
                1,
            ) => received,
        };
        let messages = match received {
            Ok(messages) => messages,
            Err(err) => {
                tracing::error!(error = ?err, "region queue receive failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        for message in messages {
            if let Err(err) = handle_region_message(&rt, &message).await {
                // Leave the lease in place; the message reappears after the
                // visibility timeout and the handler is idempotent.
                tracing::error!(error = ?err, "region processing failed");
            }
        }
    }
    tracing::info!("region processor stopped");
}

pub async fn handle_region_message(rt: &Arc<Runtime>, message: &ReceivedMessage) -> Result<()> {
    let request = match RegionRequest::from_message(&message.body) {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(error = ?err, "discarding malformed region request");
            rt.region_queue.finish(&message.receipt).await?;
            return Ok(());
        }
    };
    let ctx =
        RequestContext::image(&request.job_id, &request.image_id).with_region(&request.region_id);
    tracing::info!(
        image_id = %request.image_id,
        region_id = %request.region_id,
        bounds = ?request.region_bounds,
        "processing region"
    );

    rt.store
        .put_region(RegionRequestItem::new(request.clone()))
        .await?;
    let crops = generate_crops(
        request.region_bounds,
        request.tile_size,
        request.tile_overlap,
    );
    rt.store
        .set_total_tiles(&request.image_id, &request.region_id, crops.len() as u64)
        .await?;
    rt.status
        .emit(
            StatusScope::Region,
            &ctx,
            RequestStatus::InProgress,
            None,
            &format!("processing {} tiles", crops.len()),
        )
        .await;

    match rt
        .raster
        .open(&request.image_url, request.image_read_role.as_deref())
        .await
    {
        Ok(raster) => {
            if let Some(sensor) = raster.sensor_model() {
                rt.sensor_cache.insert(&request.image_id, sensor);
            }
            match rt.detectors.for_request(&request).await {
                Ok(detector) => {
                    run_pool(rt, &request, raster, detector, crops).await?;
                }
                Err(err) => {
                    tracing::error!(error = ?err, "cannot build detector for region");
                    fail_all_tiles(rt, &request, &crops, "detector construction failed").await?;
                }
            }
        }
        Err(err) => {
            tracing::error!(
                image_url = %request.image_url,
                error = ?err,
                "failed to open raster for region"
            );
            fail_all_tiles(rt, &request, &crops, "raster open failed").await?;
        }
    }

    maybe_finish_region(rt, &request).await?;
    rt.region_queue.finish(&message.receipt).await?;
    Ok(())
}

async fn fail_all_tiles(
    rt: &Arc<Runtime>,
    request: &RegionRequest,
    crops: &[ImageRegion],
    reason: &str,
) -> Result<()> {
    for bounds in crops {
        finalize_tile(rt, request, &bounds.label(), true, reason).await?;
    }
    Ok(())
}
