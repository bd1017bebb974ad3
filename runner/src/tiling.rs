//! Deterministic tile and region geometry.
//!
//! Regions partition an image so region-level workers can parallelize across
//! machines; tiles partition a region for the in-process worker pool. Both
//! grids are pure functions of the request parameters so every process in
//! the fleet derives identical geometry.

use geo::{Coord, Intersects, LineString, Polygon, Rect, coord};
use osprey_common::types::{ImageDimensions, ImageRegion};

use crate::sensor::SensorModel;

fn ceildiv(a: u64, b: u64) -> u64 {
    a.div_ceil(b)
}

/// Overlapping tile crops covering `region`, upper-left first, row major.
///
/// Crops are spaced by `tile_size - overlap` and clipped at the region's far
/// edge. Trailing slivers no wider or taller than the overlap are skipped:
/// their pixels are already covered by the previous crop.
pub fn generate_crops(
    region: ImageRegion,
    tile_size: ImageDimensions,
    overlap: ImageDimensions,
) -> Vec<ImageRegion> {
    assert!(
        overlap.0 < tile_size.0 && overlap.1 < tile_size.1,
        "overlap {overlap:?} must be smaller than tile size {tile_size:?}"
    );

    let stride_x = tile_size.0 - overlap.0;
    let stride_y = tile_size.1 - overlap.1;
    let num_x = ceildiv(region.width(), stride_x);
    let num_y = ceildiv(region.height(), stride_y);

    let mut crops = Vec::new();
    for r in 0..num_y {
        for c in 0..num_x {
            let ul_x = region.ul_col() + c * stride_x;
            let ul_y = region.ul_row() + r * stride_y;
            let w = tile_size.0.min(region.ul_col() + region.width() - ul_x);
            let h = tile_size.1.min(region.ul_row() + region.height() - ul_y);
            if w > overlap.0 && h > overlap.1 {
                crops.push(ImageRegion::new(ul_y, ul_x, w, h));
            }
        }
    }
    crops
}

pub fn tile_count(
    region: ImageRegion,
    tile_size: ImageDimensions,
    overlap: ImageDimensions,
) -> u64 {
    generate_crops(region, tile_size, overlap).len() as u64
}

/// Non-overlapping regions of at most `region_size` per edge covering the
/// full image extent.
pub fn partition_regions(width: u64, height: u64, region_size: u64) -> Vec<ImageRegion> {
    let region_size = region_size.max(1);
    let mut regions = Vec::new();
    let mut row = 0;
    while row < height {
        let h = region_size.min(height - row);
        let mut col = 0;
        while col < width {
            let w = region_size.min(width - col);
            regions.push(ImageRegion::new(row, col, w, h));
            col += region_size;
        }
        row += region_size;
    }
    regions
}

/// Project a world-space region of interest into image space.
///
/// Without a sensor model the polygon is taken to be in image coordinates
/// already and is passed through unchanged.
pub fn roi_to_image_space(roi: &Polygon<f64>, sensor: Option<&dyn SensorModel>) -> Polygon<f64> {
    let Some(sensor) = sensor else {
        return roi.clone();
    };
    let project = |c: &Coord<f64>| -> Coord<f64> {
        let (x, y) = sensor.world_to_image((c.x, c.y));
        coord! { x: x, y: y }
    };
    let exterior = LineString::from(
        roi.exterior()
            .coords()
            .map(|c| project(c))
            .collect::<Vec<_>>(),
    );
    let interiors = roi
        .interiors()
        .iter()
        .map(|ring| LineString::from(ring.coords().map(|c| project(c)).collect::<Vec<_>>()))
        .collect();
    Polygon::new(exterior, interiors)
}

/// Keep only the regions whose image-space footprint intersects the ROI.
pub fn filter_regions_by_roi(
    regions: Vec<ImageRegion>,
    roi_image_space: &Polygon<f64>,
) -> Vec<ImageRegion> {
    regions
        .into_iter()
        .filter(|region| {
            let rect = Rect::new(
                coord! { x: region.ul_col() as f64, y: region.ul_row() as f64 },
                coord! {
                    x: (region.ul_col() + region.width()) as f64,
                    y: (region.ul_row() + region.height()) as f64,
                },
            );
            roi_image_space.intersects(&rect)
        })
        .collect()
}
