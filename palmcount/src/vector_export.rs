//! Vector artifacts: the canonical GeoJSON and the KML / Shapefile conversions
//! derived from it.
//!
//! Derived formats are always produced by re-reading the canonical file, never
//! from in-memory detections, so all three describe the same features.

use anyhow::{Context, Result};
use geojson::{FeatureCollection, GeoJson};
use shapefile::dbase::{FieldName, FieldValue, Record, TableWriterBuilder};
use std::path::{Path, PathBuf};

use crate::color_utils::symbols;
use crate::config::OutputToggles;
use crate::output_manager::{derived_group_path, derived_path};

/// Paths written for one image
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorOutputs {
    pub geojson: Option<PathBuf>,
    pub kml: Option<PathBuf>,
    pub shapefile: Option<PathBuf>,
}

/// Write the canonical GeoJSON to `path`
pub fn write_geojson(collection: &FeatureCollection, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(collection)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

/// Read a GeoJSON file back as a FeatureCollection
pub fn read_feature_collection(path: &Path) -> Result<FeatureCollection> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let geojson: GeoJson = text
        .parse()
        .with_context(|| format!("Invalid GeoJSON in {}", path.display()))?;
    FeatureCollection::try_from(geojson)
        .with_context(|| format!("{} is not a FeatureCollection", path.display()))
}

/// One Point feature with its exported attributes
struct PointRecord {
    x: f64,
    y: f64,
    label: String,
    confidence: f64,
    class_id: i64,
}

fn point_records(collection: &FeatureCollection) -> Vec<PointRecord> {
    collection
        .features
        .iter()
        .filter_map(|feature| {
            let geometry = feature.geometry.as_ref()?;
            let geojson::Value::Point(coords) = &geometry.value else {
                return None;
            };
            if coords.len() < 2 {
                return None;
            }
            let props = feature.properties.as_ref();
            Some(PointRecord {
                x: coords[0],
                y: coords[1],
                label: props
                    .and_then(|p| p.get("label"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("Unnamed")
                    .to_string(),
                confidence: props
                    .and_then(|p| p.get("confidence"))
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0),
                class_id: props
                    .and_then(|p| p.get("class_id"))
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0),
            })
        })
        .collect()
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Render a KML document with one Placemark per point
pub fn render_kml(collection: &FeatureCollection, document_name: &str) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str("<kml xmlns=\"http://www.opengis.net/kml/2.2\">\n");
    xml.push_str("  <Document>\n");
    xml.push_str(&format!("    <name>{}</name>\n", escape_xml(document_name)));

    for record in point_records(collection) {
        let description = format!(
            "Confidence: {:.2}, Class ID: {}",
            record.confidence, record.class_id
        );
        xml.push_str("    <Placemark>\n");
        xml.push_str(&format!("      <name>{}</name>\n", escape_xml(&record.label)));
        xml.push_str(&format!(
            "      <description>{}</description>\n",
            escape_xml(&description)
        ));
        xml.push_str("      <Point>\n");
        xml.push_str(&format!(
            "        <coordinates>{},{},0</coordinates>\n",
            record.x, record.y
        ));
        xml.push_str("      </Point>\n");
        xml.push_str("    </Placemark>\n");
    }

    xml.push_str("  </Document>\n");
    xml.push_str("</kml>\n");
    xml
}

/// Convert the canonical GeoJSON into a KML file next to it
pub fn geojson_to_kml(canonical: &Path) -> Result<PathBuf> {
    let collection = read_feature_collection(canonical)?;
    let kml_path = derived_path(canonical, "kml");
    let document_name = canonical
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    std::fs::write(&kml_path, render_kml(&collection, &document_name))
        .with_context(|| format!("Failed to write {}", kml_path.display()))?;
    Ok(kml_path)
}

fn field_name(name: &str) -> Result<FieldName> {
    FieldName::try_from(name).map_err(|e| anyhow::anyhow!("Invalid DBF field name {name}: {e:?}"))
}

/// Convert the canonical GeoJSON into an ESRI Shapefile (`.shp/.shx/.dbf`) next to it
pub fn geojson_to_shapefile(canonical: &Path) -> Result<PathBuf> {
    let collection = read_feature_collection(canonical)?;
    let records = point_records(&collection);
    if records.is_empty() {
        return Err(anyhow::anyhow!(
            "{} has no point features",
            canonical.display()
        ));
    }

    let shp_path = derived_group_path(canonical, &["shp", "shx", "dbf"]);
    let table_builder = TableWriterBuilder::new()
        .add_character_field(field_name("label")?, 64)
        .add_numeric_field(field_name("class_id")?, 10, 0)
        .add_float_field(field_name("confidence")?, 10, 4);

    let mut writer = shapefile::Writer::from_path(&shp_path, table_builder)
        .with_context(|| format!("Failed to create {}", shp_path.display()))?;

    for record in records {
        let point = shapefile::Point::new(record.x, record.y);
        let mut row = Record::default();
        row.insert(
            "label".to_string(),
            FieldValue::Character(Some(record.label)),
        );
        row.insert(
            "class_id".to_string(),
            FieldValue::Numeric(Some(record.class_id as f64)),
        );
        row.insert(
            "confidence".to_string(),
            FieldValue::Float(Some(record.confidence as f32)),
        );
        writer
            .write_shape_and_record(&point, &row)
            .with_context(|| format!("Failed to write record to {}", shp_path.display()))?;
    }

    Ok(shp_path)
}

/// Write the canonical GeoJSON and the enabled derived formats.
///
/// Only a canonical write failure is an error; derived-format failures are
/// logged and leave their slot empty.
pub fn write_vector_outputs(
    collection: &FeatureCollection,
    canonical: &Path,
    toggles: &OutputToggles,
) -> Result<VectorOutputs> {
    write_geojson(collection, canonical)?;
    log::info!(
        "  {} GeoJSON saved: {}",
        symbols::artifact_saved(),
        file_name(canonical)
    );

    let mut outputs = VectorOutputs {
        geojson: Some(canonical.to_path_buf()),
        ..Default::default()
    };

    if toggles.convert_kml {
        match geojson_to_kml(canonical) {
            Ok(path) => {
                log::info!("  {} KML saved: {}", symbols::artifact_saved(), file_name(&path));
                outputs.kml = Some(path);
            }
            Err(e) => log::warn!(
                "  {} KML conversion failed: {e:#}",
                symbols::operation_failed()
            ),
        }
    }

    if toggles.convert_shp {
        match geojson_to_shapefile(canonical) {
            Ok(path) => {
                log::info!(
                    "  {} Shapefile saved: {}",
                    symbols::artifact_saved(),
                    file_name(&path)
                );
                outputs.shapefile = Some(path);
            }
            Err(e) => log::warn!(
                "  {} Shapefile conversion failed: {e:#}",
                symbols::operation_failed()
            ),
        }
    }

    Ok(outputs)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{feature_collection, ProjectedPoint};
    use tempfile::TempDir;

    fn sample_collection() -> FeatureCollection {
        feature_collection(&[
            ProjectedPoint {
                map_x: 1010.0,
                map_y: 1990.0,
                class_id: 0,
                confidence: 0.87,
                label: "abnormal".to_string(),
            },
            ProjectedPoint {
                map_x: 1020.5,
                map_y: 1980.25,
                class_id: 1,
                confidence: 0.5,
                label: "normal & <healthy>".to_string(),
            },
        ])
    }

    fn toggles(kml: bool, shp: bool) -> OutputToggles {
        OutputToggles {
            convert_kml: kml,
            convert_shp: shp,
            ..OutputToggles::default()
        }
    }

    #[test]
    fn test_geojson_round_trip_keeps_feature_count() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("plot.geojson");
        write_geojson(&sample_collection(), &path).unwrap();

        let read = read_feature_collection(&path).unwrap();
        assert_eq!(read.features.len(), 2);
    }

    #[test]
    fn test_render_kml_escapes_and_formats() {
        let kml = render_kml(&sample_collection(), "plot");
        assert_eq!(kml.matches("<Placemark>").count(), 2);
        assert!(kml.contains("<name>abnormal</name>"));
        assert!(kml.contains("<name>normal &amp; &lt;healthy&gt;</name>"));
        assert!(kml.contains("<description>Confidence: 0.87, Class ID: 0</description>"));
        assert!(kml.contains("<coordinates>1010,1990,0</coordinates>"));
        assert!(kml.contains("<coordinates>1020.5,1980.25,0</coordinates>"));
    }

    #[test]
    fn test_kml_avoids_name_collisions() {
        let temp_dir = TempDir::new().unwrap();
        let canonical = temp_dir.path().join("plot.geojson");
        write_geojson(&sample_collection(), &canonical).unwrap();

        assert_eq!(
            geojson_to_kml(&canonical).unwrap(),
            temp_dir.path().join("plot.kml")
        );
        assert_eq!(
            geojson_to_kml(&canonical).unwrap(),
            temp_dir.path().join("plot_1.kml")
        );
    }

    #[test]
    fn test_shapefile_writes_all_parts() {
        let temp_dir = TempDir::new().unwrap();
        let canonical = temp_dir.path().join("plot.geojson");
        write_geojson(&sample_collection(), &canonical).unwrap();

        let shp = geojson_to_shapefile(&canonical).unwrap();
        assert_eq!(shp, temp_dir.path().join("plot.shp"));
        assert!(temp_dir.path().join("plot.shx").exists());
        assert!(temp_dir.path().join("plot.dbf").exists());

        let mut reader = shapefile::Reader::from_path(&shp).unwrap();
        let rows: Vec<_> = reader
            .iter_shapes_and_records()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(rows.len(), 2);
        match rows[0].1.get("label") {
            Some(FieldValue::Character(Some(label))) => assert_eq!(label, "abnormal"),
            other => panic!("unexpected label field {other:?}"),
        }
    }

    #[test]
    fn test_shapefile_leaves_existing_sidecars_alone() {
        let temp_dir = TempDir::new().unwrap();
        let canonical = temp_dir.path().join("plot.geojson");
        write_geojson(&sample_collection(), &canonical).unwrap();
        let stale_dbf = temp_dir.path().join("plot.dbf");
        std::fs::write(&stale_dbf, "kept").unwrap();

        let shp = geojson_to_shapefile(&canonical).unwrap();
        assert_eq!(shp, temp_dir.path().join("plot_1.shp"));
        assert!(temp_dir.path().join("plot_1.shx").exists());
        assert!(temp_dir.path().join("plot_1.dbf").exists());
        assert!(!temp_dir.path().join("plot.shp").exists());
        assert_eq!(std::fs::read_to_string(&stale_dbf).unwrap(), "kept");
    }

    #[test]
    fn test_write_vector_outputs_respects_toggles() {
        let temp_dir = TempDir::new().unwrap();
        let canonical = temp_dir.path().join("plot.geojson");

        let outputs =
            write_vector_outputs(&sample_collection(), &canonical, &toggles(false, false)).unwrap();
        assert_eq!(outputs.geojson.as_deref(), Some(canonical.as_path()));
        assert!(outputs.kml.is_none());
        assert!(outputs.shapefile.is_none());

        let second = temp_dir.path().join("plot_1.geojson");
        let outputs =
            write_vector_outputs(&sample_collection(), &second, &toggles(true, true)).unwrap();
        assert_eq!(outputs.kml, Some(temp_dir.path().join("plot_1.kml")));
        assert_eq!(outputs.shapefile, Some(temp_dir.path().join("plot_1.shp")));
    }

    #[test]
    fn test_derived_failure_is_not_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let canonical = temp_dir.path().join("plot.geojson");
        // A directory where the index file goes makes the shapefile writer fail
        std::fs::create_dir(temp_dir.path().join("plot.shx")).unwrap();

        let outputs =
            write_vector_outputs(&sample_collection(), &canonical, &toggles(false, true)).unwrap();
        assert!(outputs.geojson.is_some());
        assert!(outputs.shapefile.is_none());
    }
}
