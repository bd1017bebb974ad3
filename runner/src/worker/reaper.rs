//! Stale-lease reaper.
//!
//! A worker process that dies mid-region leaves its region record open and
//! its unreleased tile credits charged against the endpoint. The reaper
//! periodically finds regions whose lease has lapsed, returns the
//! unreleased capacity, and requeues the region request.

use std::sync::Arc;

use anyhow::Result;
use metrics::counter;
use tokio_util::sync::CancellationToken;

use crate::runtime::Runtime;
use crate::store::now_ms;

pub async fn run_reaper(rt: Arc<Runtime>, cancel: CancellationToken) {
    if rt.config.reaper_interval.is_zero() {
        tracing::info!("reaper disabled");
        return;
    }
    tracing::info!(interval = ?rt.config.reaper_interval, "reaper running");
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(rt.config.reaper_interval) => {}
        }
        if let Err(err) = sweep(&rt).await {
            tracing::error!(error = ?err, "reaper sweep failed");
        }
    }
    tracing::info!("reaper stopped");
}

pub async fn sweep(rt: &Arc<Runtime>) -> Result<()> {
    let cutoff = now_ms() - rt.config.region_lease_timeout.as_millis() as i64;
    let stale = rt.store.list_stale_regions(cutoff).await?;
    for region in stale {
        let unreleased = region.unreleased_tiles();
        tracing::warn!(
            image_id = %region.image_id,
            region_id = %region.region_id,
            unreleased_tiles = unreleased,
            "requeueing stale region"
        );
        if unreleased > 0 {
            rt.store
                .release_endpoint(&region.model_name, unreleased)
                .await?;
        }
        // Refresh the lease before requeueing so the next sweep does not
        // pick the same region up again immediately.
        rt.store.put_region(region.clone()).await?;
        let body = serde_json::to_string(&region.request)?;
        rt.region_queue.send(&body).await?;
        counter!("reaped_regions_total").increment(1);
    }
    Ok(())
}
