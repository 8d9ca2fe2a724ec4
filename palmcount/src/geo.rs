//! Pixel-to-map projection through ESRI world files, and the GeoJSON document
//! built from the projected detections.

use anyhow::{Context, Result};
use geojson::{Feature, FeatureCollection, Geometry, JsonObject, Value};
use std::path::{Path, PathBuf};

use crate::detection_obj::{ClassNames, Detection};

/// Six-parameter affine transform read from a `.tfw` world file.
///
/// The file lists the parameters one per line in the order
/// `pixel_size_x, rotation_y, rotation_x, pixel_size_y, origin_x, origin_y`
/// (A, D, B, E, C, F), where `origin` is the map position of the center of the
/// top-left pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldTransform {
    pub pixel_size_x: f64,
    pub rotation_y: f64,
    pub rotation_x: f64,
    pub pixel_size_y: f64,
    pub origin_x: f64,
    pub origin_y: f64,
}

impl WorldTransform {
    /// Parse whitespace or newline separated values; extra trailing tokens are ignored
    pub fn parse(text: &str) -> Result<Self> {
        let values = text
            .split_whitespace()
            .take(6)
            .map(|token| {
                token
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| anyhow::anyhow!("invalid world file value '{token}'"))
            })
            .collect::<Result<Vec<f64>>>()?;

        let [a, d, b, e, c, f] = values[..] else {
            return Err(anyhow::anyhow!(
                "world file needs 6 values, found {}",
                values.len()
            ));
        };

        Ok(Self {
            pixel_size_x: a,
            rotation_y: d,
            rotation_x: b,
            pixel_size_y: e,
            origin_x: c,
            origin_y: f,
        })
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Malformed world file {}", path.display()))
    }

    pub fn pixel_to_map(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.pixel_size_x * x + self.rotation_x * y + self.origin_x,
            self.rotation_y * x + self.pixel_size_y * y + self.origin_y,
        )
    }

    fn determinant(&self) -> f64 {
        self.pixel_size_x * self.pixel_size_y - self.rotation_x * self.rotation_y
    }

    pub fn is_invertible(&self) -> bool {
        self.determinant().abs() > f64::EPSILON
    }

    /// Inverse projection, `None` when the transform is singular
    pub fn map_to_pixel(&self, map_x: f64, map_y: f64) -> Option<(f64, f64)> {
        if !self.is_invertible() {
            return None;
        }
        let det = self.determinant();
        let dx = map_x - self.origin_x;
        let dy = map_y - self.origin_y;
        Some((
            (self.pixel_size_y * dx - self.rotation_x * dy) / det,
            (self.pixel_size_x * dy - self.rotation_y * dx) / det,
        ))
    }
}

/// `{image_stem}.tfw` beside the image
pub fn world_file_path(image_path: &Path) -> PathBuf {
    image_path.with_extension("tfw")
}

/// Read the image's world file if there is one.
///
/// A malformed file is reported and treated like a missing one.
pub fn load_world_transform(image_path: &Path) -> Option<WorldTransform> {
    let tfw_path = world_file_path(image_path);
    if !tfw_path.is_file() {
        return None;
    }
    match WorldTransform::read(&tfw_path) {
        Ok(transform) => Some(transform),
        Err(e) => {
            log::warn!("{}{e:#}", crate::color_utils::symbols::warning());
            None
        }
    }
}

/// Why geospatial output was not produced for an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoSkip {
    MissingWorldFile,
    NoDetections,
}

impl std::fmt::Display for GeoSkip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GeoSkip::MissingWorldFile => f.write_str(
                "Shapefile, KML, and GeoJSON require a .tfw file next to the TIFF \
                 (same base name, e.g. UPE.tfw for UPE.tif). Skipping geospatial output.",
            ),
            GeoSkip::NoDetections => f.write_str("No detections; skipping geospatial output."),
        }
    }
}

/// Decide whether vector output is produced: needs both a transform and detections
pub fn plan_geo_output(
    world: Option<WorldTransform>,
    detections: &[Detection],
) -> Result<WorldTransform, GeoSkip> {
    let world = world.ok_or(GeoSkip::MissingWorldFile)?;
    if detections.is_empty() {
        return Err(GeoSkip::NoDetections);
    }
    Ok(world)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedPoint {
    pub map_x: f64,
    pub map_y: f64,
    pub class_id: u32,
    pub confidence: f32,
    pub label: String,
}

/// Project detection centroids into map coordinates
pub fn project(
    detections: &[Detection],
    world: &WorldTransform,
    names: &ClassNames,
) -> Vec<ProjectedPoint> {
    detections
        .iter()
        .map(|detection| {
            let (cx, cy) = detection.centroid();
            let (map_x, map_y) = world.pixel_to_map(cx, cy);
            ProjectedPoint {
                map_x,
                map_y,
                class_id: detection.class_id,
                confidence: detection.confidence,
                label: names.label(detection.class_id),
            }
        })
        .collect()
}

/// FeatureCollection of Points with `{label, confidence, class_id}` properties
pub fn feature_collection(points: &[ProjectedPoint]) -> FeatureCollection {
    let features = points
        .iter()
        .map(|point| {
            let mut properties = JsonObject::new();
            properties.insert("label".to_string(), point.label.clone().into());
            properties.insert(
                "confidence".to_string(),
                serde_json::json!(round_confidence(point.confidence)),
            );
            properties.insert("class_id".to_string(), point.class_id.into());

            Feature {
                bbox: None,
                geometry: Some(Geometry::new(Value::Point(vec![point.map_x, point.map_y]))),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();

    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

/// f32 confidences widened to f64 pick up noise digits (0.87 -> 0.8700000047683716)
fn round_confidence(confidence: f32) -> f64 {
    (confidence as f64 * 1e6).round() / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn scenario_transform() -> WorldTransform {
        WorldTransform::parse("0.5\n0\n0\n-0.5\n1000\n2000\n").unwrap()
    }

    #[test]
    fn test_parse_file_order() {
        let t = WorldTransform::parse("1.0 2.0 3.0 4.0 5.0 6.0").unwrap();
        assert_eq!(t.pixel_size_x, 1.0);
        assert_eq!(t.rotation_y, 2.0);
        assert_eq!(t.rotation_x, 3.0);
        assert_eq!(t.pixel_size_y, 4.0);
        assert_eq!(t.origin_x, 5.0);
        assert_eq!(t.origin_y, 6.0);
    }

    #[test]
    fn test_parse_rejects_short_or_bad_files() {
        assert!(WorldTransform::parse("1 0 0 -1 5").is_err());
        assert!(WorldTransform::parse("1 0 zero -1 5 6").is_err());
        assert!(WorldTransform::parse("1 0 0 -1 5 NaN").is_err());
        assert!(WorldTransform::parse("").is_err());
    }

    #[test]
    fn test_scenario_centroid_projection() {
        let world = scenario_transform();
        let detections = vec![Detection::new(10.0, 10.0, 30.0, 30.0, 0.9, 0)];
        let points = project(&detections, &world, &ClassNames::default_palm());

        assert_eq!(points.len(), 1);
        assert_eq!(points[0].map_x, 1010.0);
        assert_eq!(points[0].map_y, 1990.0);
        assert_eq!(points[0].label, "abnormal");
    }

    #[test]
    fn test_rotated_transform_uses_all_terms() {
        let world = WorldTransform::parse("2 0.5 0.25 -2 100 200").unwrap();
        let (x, y) = world.pixel_to_map(10.0, 4.0);
        assert_eq!(x, 2.0 * 10.0 + 0.25 * 4.0 + 100.0);
        assert_eq!(y, 0.5 * 10.0 - 2.0 * 4.0 + 200.0);
    }

    #[test]
    fn test_inverse_round_trip_recovers_centroid() {
        for world in [
            scenario_transform(),
            WorldTransform::parse("2 0.5 0.25 -2 100 200").unwrap(),
            WorldTransform::parse("0.1 -0.03 0.07 -0.1 500000 9000000").unwrap(),
        ] {
            for (cx, cy) in [(0.0, 0.0), (20.0, 20.0), (1234.5, 987.25)] {
                let (mx, my) = world.pixel_to_map(cx, cy);
                let (px, py) = world.map_to_pixel(mx, my).unwrap();
                assert!((px - cx).abs() < 1e-6, "{px} vs {cx}");
                assert!((py - cy).abs() < 1e-6, "{py} vs {cy}");
            }
        }
    }

    #[test]
    fn test_singular_transform_has_no_inverse() {
        let world = WorldTransform::parse("1 1 1 1 0 0").unwrap();
        assert!(!world.is_invertible());
        assert!(world.map_to_pixel(1.0, 1.0).is_none());
    }

    #[test]
    fn test_skip_reasons_are_distinct() {
        let detections = vec![Detection::new(0.0, 0.0, 1.0, 1.0, 0.5, 1)];
        assert_eq!(
            plan_geo_output(None, &detections),
            Err(GeoSkip::MissingWorldFile)
        );
        assert_eq!(
            plan_geo_output(Some(scenario_transform()), &[]),
            Err(GeoSkip::NoDetections)
        );
        assert!(plan_geo_output(Some(scenario_transform()), &detections).is_ok());
        assert_ne!(
            GeoSkip::MissingWorldFile.to_string(),
            GeoSkip::NoDetections.to_string()
        );
    }

    #[test]
    fn test_feature_collection_properties() {
        let points = vec![
            ProjectedPoint {
                map_x: 1.0,
                map_y: 2.0,
                class_id: 0,
                confidence: 0.87,
                label: "abnormal".to_string(),
            },
            ProjectedPoint {
                map_x: 3.0,
                map_y: 4.0,
                class_id: 5,
                confidence: 0.5,
                label: "class_5".to_string(),
            },
        ];
        let fc = feature_collection(&points);
        assert_eq!(fc.features.len(), 2);

        let props = fc.features[0].properties.as_ref().unwrap();
        assert_eq!(props["label"], "abnormal");
        assert_eq!(props["class_id"], 0);
        assert_eq!(props["confidence"].as_f64().unwrap(), 0.87);

        match &fc.features[1].geometry.as_ref().unwrap().value {
            Value::Point(coords) => assert_eq!(coords, &vec![3.0, 4.0]),
            other => panic!("expected point, got {other:?}"),
        }
    }

    #[test]
    fn test_load_world_transform_from_sidecar() {
        let dir = tempdir().unwrap();
        let image = dir.path().join("UPE.tif");
        assert!(load_world_transform(&image).is_none());

        std::fs::write(dir.path().join("UPE.tfw"), "0.5\n0\n0\n-0.5\n1000\n2000\n").unwrap();
        assert_eq!(load_world_transform(&image), Some(scenario_transform()));

        std::fs::write(dir.path().join("UPE.tfw"), "garbage").unwrap();
        assert!(load_world_transform(&image).is_none());
    }
}
