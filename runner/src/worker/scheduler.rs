//! Image request consumer: claims the image, partitions it into regions,
//! and fans the regions out, gated by endpoint capacity.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics::counter;
use osprey_common::types::{RequestContext, RequestStatus};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::completion::{complete_image, fail_image};
use crate::api::{ImageRequest, RegionRequest};
use crate::queue::ReceivedMessage;
use crate::runtime::Runtime;
use crate::status::StatusScope;
use crate::store::{ImageRequestItem, StartOutcome};
use crate::tiling::{filter_regions_by_roi, partition_regions, roi_to_image_space, tile_count};

pub async fn run_image_loop(rt: Arc<Runtime>, cancel: CancellationToken) {
    tracing::info!("image scheduler listening");
    loop {
        let received = tokio::select! {
            () = cancel.cancelled() => break,
            received = rt.image_queue.receive(
                rt.config.queue_wait,
                rt.config.queue_visibility,
                1,
            ) => received,
        };
        let messages = match received {
            Ok(messages) => messages,
            Err(err) => {
                tracing::error!(error = ?err, "image queue receive failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        for message in messages {
            if let Err(err) = handle_image_message(&rt, &message).await {
                tracing::error!(error = ?err, "image scheduling failed");
            }
        }
    }
    tracing::info!("image scheduler stopped");
}

pub async fn handle_image_message(rt: &Arc<Runtime>, message: &ReceivedMessage) -> Result<()> {
    let request = match ImageRequest::from_message(&message.body) {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(error = ?err, "invalid image request");
            counter!("invalid_image_requests_total").increment(1);
            if let Some(dlq) = &rt.image_dlq {
                if let Err(err) = dlq.send(&message.body).await {
                    tracing::error!(error = ?err, "failed to forward request to dead-letter queue");
                }
            }
            rt.image_queue.finish(&message.receipt).await?;
            return Ok(());
        }
    };

    let ctx = RequestContext::image(&request.job_id, &request.image_id);
    tracing::info!(
        image_id = %request.image_id,
        model = %request.model_name,
        "scheduling image"
    );

    // The raster has to be open before anything else: the partition and the
    // capacity estimate both need its extent.
    let raster = match rt
        .raster
        .open(&request.image_url, request.image_read_role.as_deref())
        .await
    {
        Ok(raster) => raster,
        Err(err) => {
            tracing::error!(image_url = %request.image_url, error = ?err, "failed to open raster");
            fail_image(rt, &request, "raster open failed").await?;
            rt.image_queue.finish(&message.receipt).await?;
            return Ok(());
        }
    };
    if let Some(sensor) = raster.sensor_model() {
        rt.sensor_cache.insert(&request.image_id, sensor);
    }

    let (width, height) = raster.dimensions();
    let mut regions = partition_regions(width, height, rt.config.region_size);
    if let Some(roi) = request.roi_polygon() {
        let sensor = rt.sensor_cache.get(&request.image_id);
        let roi = roi_to_image_space(&roi, sensor.as_deref());
        let before = regions.len();
        regions = filter_regions_by_roi(regions, &roi);
        tracing::info!(
            image_id = %request.image_id,
            kept = regions.len(),
            dropped = before - regions.len(),
            "applied region of interest"
        );
    }
    let estimated_tiles: u64 = regions
        .iter()
        .map(|region| tile_count(*region, request.tile_size, request.tile_overlap))
        .sum();

    // Capacity gate: the grant never exceeds the endpoint budget, and the
    // per-region pool is bounded by the grant.
    let mut acquired = 0;
    if rt.config.scheduler_throttling_enabled && estimated_tiles > 0 {
        let max_in_progress = rt.config.max_in_progress(request.model_invoke_mode);
        rt.store
            .upsert_endpoint(&request.model_name, max_in_progress)
            .await?;
        let want = estimated_tiles.min(max_in_progress);
        if !rt
            .store
            .try_acquire_endpoint(&request.model_name, want)
            .await?
        {
            let delay = Duration::from_secs(rand::rng().random_range(5..=30));
            tracing::info!(
                image_id = %request.image_id,
                endpoint = %request.model_name,
                retry_in = ?delay,
                "endpoint at capacity, returning image to the queue"
            );
            counter!("throttled_image_requests_total").increment(1);
            rt.image_queue.reset(&message.receipt, delay).await?;
            return Ok(());
        }
        acquired = want;
    }
    // Without throttling the pool is bounded only by the worker count.
    let endpoint_share = if acquired > 0 {
        acquired
    } else {
        estimated_tiles
    };

    match rt
        .store
        .start_image(ImageRequestItem::new(request.clone()))
        .await?
    {
        StartOutcome::Started => {}
        StartOutcome::AlreadyStarted => {
            // Duplicate delivery: hand back what this attempt acquired and
            // leave the image to its owner.
            tracing::info!(image_id = %request.image_id, "image already started elsewhere");
            if acquired > 0 {
                rt.store
                    .release_endpoint(&request.model_name, acquired)
                    .await?;
            }
            rt.image_queue.finish(&message.receipt).await?;
            return Ok(());
        }
    }

    rt.status
        .emit(
            StatusScope::Image,
            &ctx,
            RequestStatus::InProgress,
            None,
            "image processing started",
        )
        .await;

    rt.store
        .set_region_count(&request.image_id, regions.len() as u64, acquired)
        .await?;
    for bounds in &regions {
        let region_request = RegionRequest::from_image_request(&request, *bounds, endpoint_share);
        let body =
            serde_json::to_string(&region_request).context("serialize region request")?;
        rt.region_queue.send(&body).await?;
    }
    tracing::info!(
        image_id = %request.image_id,
        regions = regions.len(),
        estimated_tiles = estimated_tiles,
        acquired = acquired,
        "dispatched regions"
    );

    if regions.is_empty() {
        // Nothing intersects the ROI: the image is trivially complete.
        complete_image(rt, &request.image_id).await?;
    }

    rt.image_queue.finish(&message.receipt).await?;
    Ok(())
}
