//! Pixel to world projection.
//!
//! Sensor models are supplied by a collaborator library; this module owns
//! the seam (the `SensorModel` trait), a per-process cache keyed by image
//! id, and the routine that rewrites feature geometry into lon/lat space.
//! The affine model covers rasters that carry a plain geotransform.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use geojson::{Feature, Geometry, Value};

use crate::features::bounds_of;

/// Projection between image pixel coordinates `(x, y)` and world
/// coordinates `(lon, lat)`.
pub trait SensorModel: Send + Sync {
    fn image_to_world(&self, pixel: (f64, f64)) -> (f64, f64);
    fn world_to_image(&self, world: (f64, f64)) -> (f64, f64);
}

/// Six-parameter affine geotransform in the GDAL convention:
/// `lon = c[0] + x*c[1] + y*c[2]`, `lat = c[3] + x*c[4] + y*c[5]`.
#[derive(Clone, Copy, Debug)]
pub struct AffineSensorModel {
    coefficients: [f64; 6],
}

impl AffineSensorModel {
    pub fn new(coefficients: [f64; 6]) -> Self {
        Self { coefficients }
    }
}

impl SensorModel for AffineSensorModel {
    fn image_to_world(&self, (x, y): (f64, f64)) -> (f64, f64) {
        let c = &self.coefficients;
        (c[0] + x * c[1] + y * c[2], c[3] + x * c[4] + y * c[5])
    }

    fn world_to_image(&self, (lon, lat): (f64, f64)) -> (f64, f64) {
        let c = &self.coefficients;
        let det = c[1] * c[5] - c[2] * c[4];
        if det.abs() < f64::EPSILON {
            return (0.0, 0.0);
        }
        let dx = lon - c[0];
        let dy = lat - c[3];
        ((dx * c[5] - dy * c[2]) / det, (dy * c[1] - dx * c[4]) / det)
    }
}

/// Per-process sensor model cache. Entries are inserted when an image is
/// opened and evicted when the image terminates; nothing is shared across
/// processes.
#[derive(Clone, Default)]
pub struct SensorModelCache {
    inner: Arc<Mutex<HashMap<String, Arc<dyn SensorModel>>>>,
}

impl SensorModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, image_id: &str, model: Arc<dyn SensorModel>) {
        self.inner
            .lock()
            .expect("sensor cache poisoned")
            .insert(image_id.to_string(), model);
    }

    pub fn get(&self, image_id: &str) -> Option<Arc<dyn SensorModel>> {
        self.inner
            .lock()
            .expect("sensor cache poisoned")
            .get(image_id)
            .cloned()
    }

    pub fn evict(&self, image_id: &str) {
        self.inner
            .lock()
            .expect("sensor cache poisoned")
            .remove(image_id);
    }
}

/// Replace a feature's geometry with the lon/lat polygon of its pixel
/// bounding box and record the center coordinates.
pub fn geolocate_feature(feature: &mut Feature, sensor: &dyn SensorModel) -> Result<()> {
    let b = bounds_of(feature)?;
    let corners = [
        (b[0], b[1]),
        (b[2], b[1]),
        (b[2], b[3]),
        (b[0], b[3]),
        (b[0], b[1]),
    ];
    let ring: Vec<Vec<f64>> = corners
        .iter()
        .map(|&(x, y)| {
            let (lon, lat) = sensor.image_to_world((x, y));
            vec![lon, lat]
        })
        .collect();
    let (center_lon, center_lat) =
        sensor.image_to_world(((b[0] + b[2]) / 2.0, (b[1] + b[3]) / 2.0));

    let fold = |pick: fn(f64, f64) -> f64, axis: usize| {
        ring.iter()
            .map(|c| c[axis])
            .fold(ring[0][axis], pick)
    };
    feature.bbox = Some(vec![
        fold(f64::min, 0),
        fold(f64::min, 1),
        fold(f64::max, 0),
        fold(f64::max, 1),
    ]);
    feature.geometry = Some(Geometry::new(Value::Polygon(vec![ring])));
    feature.set_property("center_longitude", center_lon);
    feature.set_property("center_latitude", center_lat);
    Ok(())
}
