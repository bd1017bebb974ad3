//! Detection feature bookkeeping: coordinate translation into the full
//! image frame and the tile-bucket keying that clusters overlapping
//! detections into shared storage rows.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use geojson::Feature;
use osprey_common::types::ImageDimensions;
use uuid::Uuid;

/// Pixel-space bounding box `[x1, y1, x2, y2]` stored on every feature.
pub const BOUNDS_PROPERTY: &str = "bounds_imcoords";

pub fn bounds_of(feature: &Feature) -> Result<[f64; 4]> {
    let value = feature
        .property(BOUNDS_PROPERTY)
        .context("feature has no bounds_imcoords")?;
    let values: Vec<f64> = value
        .as_array()
        .context("bounds_imcoords is not an array")?
        .iter()
        .map(|v| v.as_f64().context("bounds_imcoords entry is not numeric"))
        .collect::<Result<_>>()?;
    if values.len() != 4 {
        anyhow::bail!("bounds_imcoords must have four entries");
    }
    Ok([values[0], values[1], values[2], values[3]])
}

pub fn set_bounds(feature: &mut Feature, bounds: [f64; 4]) {
    feature.set_property(BOUNDS_PROPERTY, bounds.to_vec());
}

pub fn feature_id(feature: &Feature) -> String {
    match &feature.id {
        Some(geojson::feature::Id::String(id)) => id.clone(),
        Some(geojson::feature::Id::Number(id)) => id.to_string(),
        None => String::new(),
    }
}

/// Translate a tile-local detection into full-image pixel coordinates and
/// stamp the identifiers the aggregation side keys on. Features without an
/// id get one; the NMS tie-break needs ids to be present.
pub fn annotate_tile_feature(
    feature: &mut Feature,
    tile_ul: (u64, u64),
    image_id: &str,
    tile_id: &str,
) -> Result<()> {
    let (ul_x, ul_y) = (tile_ul.0 as f64, tile_ul.1 as f64);
    let bounds = bounds_of(feature)?;
    set_bounds(
        feature,
        [
            bounds[0] + ul_x,
            bounds[1] + ul_y,
            bounds[2] + ul_x,
            bounds[3] + ul_y,
        ],
    );
    feature.set_property("image_id", image_id);
    feature.set_property("tile_id", tile_id);
    if feature.id.is_none() {
        feature.id = Some(geojson::feature::Id::String(Uuid::new_v4().to_string()));
    }
    Ok(())
}

/// Range key of the storage row a feature belongs to.
///
/// The key is the span of tile indices the bbox touches, computed against
/// the stride of unique pixels per tile. A bbox whose minimum edge falls
/// inside the overlap band of the previous tile is pulled back one index so
/// detections of the same object from adjacent tiles share a row.
pub fn tile_bucket_key(
    bounds: [f64; 4],
    tile_size: ImageDimensions,
    overlap: ImageDimensions,
) -> String {
    let stride_x = (tile_size.0 - overlap.0) as i64;
    let stride_y = (tile_size.1 - overlap.1) as i64;

    let min_x = bounds[0] as i64;
    let min_y = bounds[1] as i64;
    let mut min_i = min_x / stride_x;
    let mut min_j = min_y / stride_y;
    let max_i = bounds[2] as i64 / stride_x;
    let max_j = bounds[3] as i64 / stride_y;

    if min_x % stride_x < overlap.0 as i64 && min_i > 0 {
        min_i -= 1;
    }
    if min_y % stride_y < overlap.1 as i64 && min_j > 0 {
        min_j -= 1;
    }

    format!("{min_i}:{max_i}:{min_j}:{max_j}")
}

/// Group features into their storage rows.
pub fn group_by_bucket(
    features: Vec<Feature>,
    tile_size: ImageDimensions,
    overlap: ImageDimensions,
) -> Result<BTreeMap<String, Vec<Feature>>> {
    let mut rows: BTreeMap<String, Vec<Feature>> = BTreeMap::new();
    for feature in features {
        let key = tile_bucket_key(bounds_of(&feature)?, tile_size, overlap);
        rows.entry(key).or_default().push(feature);
    }
    Ok(rows)
}
