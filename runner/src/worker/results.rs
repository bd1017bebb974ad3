//! Async inference completion reader.
//!
//! HTTP-endpoint invocations finish out of band: the endpoint (or the
//! staging bucket) emits an event naming the inference id and the output
//! object. This loop correlates events with outstanding tile records,
//! fetches and validates the detections, and resumes the same persistence
//! and completion path a synchronous tile takes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use osprey_common::types::RequestStatus;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::completion::{finalize_tile, maybe_finish_region, persist_tile_features};
use crate::inference::parse_feature_collection;
use crate::queue::ReceivedMessage;
use crate::runtime::Runtime;
use crate::store::TileRequestItem;

/// One parsed completion event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileResultEvent {
    Completed {
        inference_id: String,
        output_location: String,
    },
    Failed {
        inference_id: String,
        reason: String,
    },
}

pub async fn run_results_loop(rt: Arc<Runtime>, cancel: CancellationToken) {
    let Some(queue) = rt.tile_results_queue.clone() else {
        tracing::info!("no tile results queue configured, async reader disabled");
        return;
    };
    tracing::info!("tile results reader listening");
    loop {
        let received = tokio::select! {
            () = cancel.cancelled() => break,
            received = queue.receive(rt.config.queue_wait, rt.config.queue_visibility, 10) => received,
        };
        let messages = match received {
            Ok(messages) => messages,
            Err(err) => {
                tracing::error!(error = ?err, "tile results receive failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        for message in messages {
            if let Err(err) = handle_result_message(&rt, &message).await {
                tracing::error!(error = ?err, "tile result handling failed");
            }
        }
    }
    tracing::info!("tile results reader stopped");
}

/// Decode a completion event. Accepts object-store notifications (direct
/// or topic-wrapped) and inference-result events carrying
/// `responseParameters.outputLocation`.
pub fn parse_result_event(body: &str) -> Result<TileResultEvent> {
    let value: Value = serde_json::from_str(body).context("result event is not JSON")?;
    parse_result_value(&value)
}

fn parse_result_value(value: &Value) -> Result<TileResultEvent> {
    // Topic-wrapped: the real event is a JSON string under "Message".
    if let Some(message) = value.get("Message").and_then(Value::as_str) {
        let inner: Value =
            serde_json::from_str(message).context("wrapped result event is not JSON")?;
        return parse_result_value(&inner);
    }

    // Inference-result event from the endpoint.
    if value.get("responseParameters").is_some() || value.get("invocationStatus").is_some() {
        let inference_id = value
            .get("inferenceId")
            .and_then(Value::as_str)
            .context("inference event has no inferenceId")?
            .to_string();
        if value.get("invocationStatus").and_then(Value::as_str) == Some("Failed") {
            let reason = value
                .get("failureReason")
                .and_then(Value::as_str)
                .unwrap_or("async invocation failed")
                .to_string();
            return Ok(TileResultEvent::Failed {
                inference_id,
                reason,
            });
        }
        let output_location = value
            .pointer("/responseParameters/outputLocation")
            .and_then(Value::as_str)
            .context("inference event has no output location")?
            .to_string();
        return Ok(TileResultEvent::Completed {
            inference_id,
            output_location,
        });
    }

    // Object-store notification: derive the inference id from the object
    // basename ("{inference_id}.out").
    if let Some(records) = value.get("Records").and_then(Value::as_array) {
        for record in records {
            let Some(s3) = record.get("s3") else { continue };
            let bucket = s3
                .pointer("/bucket/name")
                .and_then(Value::as_str)
                .context("object event has no bucket")?;
            let key = s3
                .pointer("/object/key")
                .and_then(Value::as_str)
                .context("object event has no key")?;
            let basename = key.rsplit('/').next().unwrap_or(key);
            let inference_id = basename.strip_suffix(".out").unwrap_or(basename).to_string();
            return Ok(TileResultEvent::Completed {
                inference_id,
                output_location: format!("s3://{bucket}/{key}"),
            });
        }
        bail!("object event contains no s3 records");
    }

    bail!("unrecognized tile result event");
}

pub async fn handle_result_message(rt: &Arc<Runtime>, message: &ReceivedMessage) -> Result<()> {
    let Some(queue) = &rt.tile_results_queue else {
        return Ok(());
    };
    let event = match parse_result_event(&message.body) {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(error = ?err, "discarding unrecognized tile result event");
            queue.finish(&message.receipt).await?;
            return Ok(());
        }
    };

    let inference_id = match &event {
        TileResultEvent::Completed { inference_id, .. }
        | TileResultEvent::Failed { inference_id, .. } => inference_id.clone(),
    };
    let Some(tile) = rt.store.get_outstanding_tile(&inference_id).await? else {
        tracing::warn!(inference_id = %inference_id, "no outstanding tile for event");
        queue.finish(&message.receipt).await?;
        return Ok(());
    };
    if tile.tile_status.is_terminal() {
        // Duplicate completion event.
        queue.finish(&message.receipt).await?;
        return Ok(());
    }

    let Some(region) = rt.store.get_region(&tile.image_id, &tile.region_id).await? else {
        bail!(
            "outstanding tile {} references unknown region {}/{}",
            inference_id,
            tile.image_id,
            tile.region_id
        );
    };
    let request = region.request;

    match event {
        TileResultEvent::Completed {
            output_location, ..
        } => match fetch_and_persist(rt, &tile, &output_location).await {
            Ok(count) => {
                tracing::info!(
                    inference_id = %inference_id,
                    tile_id = %tile.tile_id,
                    features = count,
                    "async tile completed"
                );
                rt.store
                    .update_tile_status(
                        &inference_id,
                        RequestStatus::Success,
                        Some(output_location),
                    )
                    .await?;
                finalize_tile(rt, &request, &tile.tile_id, false, "async tile processed").await?;
            }
            Err(err) => {
                tracing::error!(
                    inference_id = %inference_id,
                    error = ?err,
                    "async tile output unusable"
                );
                rt.store
                    .update_tile_status(&inference_id, RequestStatus::Failed, None)
                    .await?;
                finalize_tile(rt, &request, &tile.tile_id, true, "async output unusable").await?;
            }
        },
        TileResultEvent::Failed { reason, .. } => {
            rt.store
                .update_tile_status(&inference_id, RequestStatus::Failed, None)
                .await?;
            finalize_tile(rt, &request, &tile.tile_id, true, &reason).await?;
        }
    }

    maybe_finish_region(rt, &request).await?;
    queue.finish(&message.receipt).await?;
    Ok(())
}

async fn fetch_and_persist(
    rt: &Arc<Runtime>,
    tile: &TileRequestItem,
    output_location: &str,
) -> Result<usize> {
    let body = rt
        .object_store
        .get(output_location)
        .await
        .with_context(|| format!("fetch async output {output_location}"))?;
    let value: Value = serde_json::from_slice(&body).context("decode async output")?;
    let features = parse_feature_collection(value).context("async output failed schema check")?;
    persist_tile_features(
        rt,
        &tile.image_id,
        &tile.tile_id,
        tile.tile_bounds,
        tile.tile_size,
        tile.tile_overlap,
        features,
    )
    .await
}
