//! Greedy non-maximum suppression over pixel-space bounding boxes.
//!
//! The ordering is fully deterministic: candidates are sorted by their `y2`
//! edge with feature-id as the tie break, survivors are taken from the back,
//! and anything overlapping a survivor past the threshold is discarded.
//! Running the pass twice yields the same survivor set.

use anyhow::Result;
use geojson::Feature;

use crate::features::{bounds_of, feature_id};

pub const DEFAULT_IOU_THRESHOLD: f64 = 0.75;

/// Inclusive pixel area of a box: a degenerate box still covers one pixel.
fn area(b: &[f64; 4]) -> f64 {
    (b[2] - b[0] + 1.0) * (b[3] - b[1] + 1.0)
}

pub fn iou(a: &[f64; 4], b: &[f64; 4]) -> f64 {
    let xx1 = a[0].max(b[0]);
    let yy1 = a[1].max(b[1]);
    let xx2 = a[2].min(b[2]);
    let yy2 = a[3].min(b[3]);

    let w = (xx2 - xx1 + 1.0).max(0.0);
    let h = (yy2 - yy1 + 1.0).max(0.0);
    let intersection = w * h;

    let union = area(a) + area(b) - intersection;
    if union <= 0.0 {
        return 0.0;
    }
    intersection / union
}

/// Suppress duplicate detections, returning the surviving features.
pub fn suppress(features: Vec<Feature>, threshold: f64) -> Result<Vec<Feature>> {
    if features.is_empty() {
        return Ok(features);
    }

    let mut candidates: Vec<(String, [f64; 4], Feature)> = features
        .into_iter()
        .map(|f| {
            let bounds = bounds_of(&f)?;
            Ok((feature_id(&f), bounds, f))
        })
        .collect::<Result<_>>()?;

    candidates.sort_by(|a, b| {
        a.1[3]
            .partial_cmp(&b.1[3])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });

    let mut survivors = Vec::new();
    while let Some((_, bounds, feature)) = candidates.pop() {
        candidates.retain(|(_, other, _)| iou(&bounds, other) <= threshold);
        survivors.push(feature);
    }
    Ok(survivors)
}
