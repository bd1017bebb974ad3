use anyhow::{Result, bail};
use geojson::Feature;
use serde_json::Value;

/// Check that a model response is a plausible FeatureCollection before any
/// deserialization: a `FeatureCollection` type tag, a `features` array, and
/// per feature a `type`, a `geometry` or `imageGeometry`, and `properties`.
pub fn validate_response(value: &Value) -> Result<()> {
    let Some(object) = value.as_object() else {
        bail!("model response is not a JSON object");
    };
    if object.get("type").and_then(Value::as_str) != Some("FeatureCollection") {
        bail!("model response is not a FeatureCollection");
    }
    let Some(features) = object.get("features").and_then(Value::as_array) else {
        bail!("model response has no features array");
    };
    for (index, feature) in features.iter().enumerate() {
        let Some(feature) = feature.as_object() else {
            bail!("feature {index} is not an object");
        };
        if !feature.contains_key("type") {
            bail!("feature {index} has no type");
        }
        if !feature.contains_key("geometry") && !feature.contains_key("imageGeometry") {
            bail!("feature {index} has neither geometry nor imageGeometry");
        }
        if !feature.contains_key("properties") {
            bail!("feature {index} has no properties");
        }
    }
    Ok(())
}

/// Validate and decode a model response into its features.
pub fn parse_feature_collection(mut value: Value) -> Result<Vec<Feature>> {
    validate_response(&value)?;
    let features = value
        .get_mut("features")
        .and_then(Value::as_array_mut)
        .map(std::mem::take)
        .unwrap_or_default();
    features
        .into_iter()
        .map(|mut feature| {
            // Models reporting pixel-space geometry use `imageGeometry` and
            // may omit `geometry` entirely; normalize for the decoder.
            if let Some(object) = feature.as_object_mut()
                && !object.contains_key("geometry")
            {
                object.insert("geometry".to_string(), Value::Null);
            }
            Ok(serde_json::from_value::<Feature>(feature)?)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_valid_collection() {
        let value = json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "geometry": null,
                "properties": {"bounds_imcoords": [1, 2, 3, 4], "detection_score": 0.9}
            }]
        });
        assert!(validate_response(&value).is_ok());
        assert_eq!(parse_feature_collection(value).unwrap().len(), 1);
    }

    #[test]
    fn accepts_image_geometry_without_geometry() {
        let value = json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "imageGeometry": {"type": "Point", "coordinates": [1, 2]},
                "properties": {}
            }]
        });
        assert_eq!(parse_feature_collection(value).unwrap().len(), 1);
    }

    #[test]
    fn accepts_empty_features() {
        let value = json!({"type": "FeatureCollection", "features": []});
        assert!(parse_feature_collection(value).unwrap().is_empty());
    }

    #[test]
    fn rejects_unknown_shapes() {
        assert!(validate_response(&json!({"invalid_key": 1})).is_err());
        assert!(validate_response(&json!([1, 2, 3])).is_err());
        assert!(validate_response(&json!({"type": "FeatureCollection"})).is_err());
        assert!(
            validate_response(&json!({
                "type": "FeatureCollection",
                "features": [{"type": "Feature", "properties": {}}]
            }))
            .is_err()
        );
    }
}
