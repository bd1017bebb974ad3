//! Terminal-state bookkeeping shared by the synchronous tile pool and the
//! async results reader: feature persistence, tile finalization, region
//! close-out, and the image completion path (aggregate, sink, end).

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use geojson::Feature;
use metrics::{counter, histogram};
use osprey_common::types::{ImageDimensions, ImageRegion, RequestContext, RequestStatus};

use crate::api::{ImageRequest, RegionRequest};
use crate::features::{annotate_tile_feature, group_by_bucket};
use crate::nms::{DEFAULT_IOU_THRESHOLD, suppress};
use crate::runtime::Runtime;
use crate::sensor::geolocate_feature;
use crate::sink::write_all;
use crate::status::StatusScope;
use crate::store::{FEATURE_TTL_MS, ImageRequestItem, StartOutcome, image_terminal_status, now_ms};

/// Translate tile-local detections into the image frame, geolocate them
/// when a sensor model is cached, and append them to their bucket rows.
pub async fn persist_tile_features(
    rt: &Arc<Runtime>,
    image_id: &str,
    tile_id: &str,
    tile_bounds: ImageRegion,
    tile_size: ImageDimensions,
    tile_overlap: ImageDimensions,
    mut features: Vec<Feature>,
) -> Result<usize> {
    let started = Instant::now();
    let sensor = rt.sensor_cache.get(image_id);
    for feature in &mut features {
        annotate_tile_feature(
            feature,
            (tile_bounds.ul_col(), tile_bounds.ul_row()),
            image_id,
            tile_id,
        )?;
        if let Some(sensor) = &sensor {
            geolocate_feature(feature, sensor.as_ref())?;
        }
    }
    let count = features.len();
    if count > 0 {
        let rows = group_by_bucket(features, tile_size, tile_overlap)?;
        rt.store
            .add_features(image_id, rows, now_ms() + FEATURE_TTL_MS)
            .await
            .context("persist tile features")?;
    }
    histogram!("feature_store_latency_seconds").record(started.elapsed().as_secs_f64());
    Ok(count)
}

/// Record a tile's terminal state on its region, return its endpoint
/// credit, and publish the transition.
pub async fn finalize_tile(
    rt: &Arc<Runtime>,
    request: &RegionRequest,
    tile_id: &str,
    failed: bool,
    message: &str,
) -> Result<()> {
    rt.store
        .record_tile_outcome(&request.image_id, &request.region_id, tile_id, failed)
        .await?;
    rt.store.release_endpoint(&request.model_name, 1).await?;

    let outcome = if failed { "failed" } else { "success" };
    counter!("tiles_processed_total", "outcome" => outcome).increment(1);
    if failed {
        counter!("tile_processing_errors_total").increment(1);
    }

    let ctx = RequestContext::image(&request.job_id, &request.image_id)
        .with_region(&request.region_id)
        .with_tile(tile_id);
    let status = if failed {
        RequestStatus::Failed
    } else {
        RequestStatus::Success
    };
    rt.status
        .emit(StatusScope::Tile, &ctx, status, None, message)
        .await;
    Ok(())
}

/// Close the region if every tile has terminated. Exactly one caller wins
/// the close and rolls the outcome up into the image record; when that
/// makes the image complete, the completion path runs here too.
pub async fn maybe_finish_region(rt: &Arc<Runtime>, request: &RegionRequest) -> Result<()> {
    let Some(item) = rt
        .store
        .get_region(&request.image_id, &request.region_id)
        .await?
    else {
        return Ok(());
    };
    if !item.is_complete() {
        return Ok(());
    }
    let duration = now_ms() - item.start_time;
    if !rt
        .store
        .finish_region(&request.image_id, &request.region_id, duration)
        .await?
    {
        return Ok(());
    }

    counter!("regions_processed_total").increment(1);
    histogram!("region_latency_seconds").record(duration as f64 / 1000.0);

    let ctx =
        RequestContext::image(&request.job_id, &request.image_id).with_region(&request.region_id);
    let status = item.terminal_status();
    rt.status
        .emit(
            StatusScope::Region,
            &ctx,
            status,
            Some(duration),
            &format!(
                "{} of {} tiles succeeded",
                item.succeeded_tiles.len(),
                item.succeeded_tiles.len() + item.failed_tiles.len()
            ),
        )
        .await;

    let failed = item.failed_fraction() > rt.config.region_failure_threshold;
    let image = rt.store.complete_region(&request.image_id, failed).await?;
    if image.is_complete() {
        complete_image(rt, &image.image_id).await?;
    }
    Ok(())
}

/// Aggregate, deduplicate, sink, and close a completed image.
pub async fn complete_image(rt: &Arc<Runtime>, image_id: &str) -> Result<()> {
    let Some(image) = rt.store.get_image(image_id).await? else {
        return Ok(());
    };
    if image.end_time.is_some() {
        return Ok(());
    }

    let regions = rt.store.regions_by_image(image_id).await?;
    let mut status = image_terminal_status(&regions);
    let ctx = RequestContext::image(&image.job_id, &image.image_id);

    if status != RequestStatus::Failed {
        let aggregation_started = Instant::now();
        let rows = rt.store.features_by_image(image_id).await?;
        let mut features = Vec::new();
        for row in rows {
            features.extend(suppress(row, DEFAULT_IOU_THRESHOLD)?);
        }
        histogram!("feature_agg_latency_seconds")
            .record(aggregation_started.elapsed().as_secs_f64());
        tracing::info!(
            image_id = image_id,
            features = features.len(),
            regions = regions.len(),
            "aggregated image features"
        );

        let sinks = rt.sinks.build(&image.request.outputs).await?;
        let delivered = write_all(&sinks, image_id, &features).await;
        if delivered == 0 {
            tracing::error!(image_id = image_id, "no sink accepted the results");
            counter!("image_processing_errors_total").increment(1);
            status = RequestStatus::Failed;
        }
    }

    let end_time = now_ms();
    rt.store.end_image(image_id, end_time).await?;
    rt.sensor_cache.evict(image_id);

    counter!("images_processed_total", "status" => status.as_str()).increment(1);
    rt.status
        .emit(
            StatusScope::Image,
            &ctx,
            status,
            Some(end_time - image.start_time),
            "image processing complete",
        )
        .await;
    Ok(())
}

/// Record a fatal pre-dispatch failure: claim the image if nobody has,
/// close it, and publish the terminal event.
pub async fn fail_image(rt: &Arc<Runtime>, request: &ImageRequest, reason: &str) -> Result<()> {
    counter!("image_processing_errors_total").increment(1);
    let ctx = RequestContext::image(&request.job_id, &request.image_id);
    match rt
        .store
        .start_image(ImageRequestItem::new(request.clone()))
        .await?
    {
        StartOutcome::Started => {
            rt.store.end_image(&request.image_id, now_ms()).await?;
            rt.status
                .emit(StatusScope::Image, &ctx, RequestStatus::Failed, None, reason)
                .await;
        }
        StartOutcome::AlreadyStarted => {
            tracing::warn!(
                image_id = %request.image_id,
                reason = reason,
                "fatal error on an image another process owns"
            );
        }
    }
    Ok(())
}
