//! Core data models shared by the survey index and the hook pipeline.
//!
//! Two families of types live here: the GeoJSON-shaped [`SurveyFeature`]
//! records persisted by [`crate::index::SurveyIndex`], and the [`Entry`] /
//! [`Item`] records that flow through [`crate::pipeline::Pipeline`].

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::traits::Connector;

/// Flat property map of a survey feature.
pub type Properties = Map<String, Value>;

/// Fixed metadata schema copied from ingestion sources.
pub const SCHEMA: &[&str] = &[
    "Name",
    "ID",
    "Date",
    "Agency",
    "MetadataLink",
    "MetadataDate",
    "DataLink",
    "IndexLink",
    "Link",
    "DataType",
    "DataSource",
    "Resolution",
    "HorizontalDatum",
    "VerticalDatum",
    "LastUpdate",
    "Etcetera",
    "Info",
];

// ═══════════════════════════════════════════════════════════════════════
// Survey features
// ═══════════════════════════════════════════════════════════════════════

/// A GeoJSON position. Only `x` and `y` are read; any `z` is carried along.
pub type Position = Vec<f64>;

/// Footprint geometry of a survey.
///
/// Geometry types without a typed variant (or with coordinates that do not
/// fit one) are kept verbatim in [`Geometry::Other`] so they survive a
/// load/save cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Point(Position),
    MultiPoint(Vec<Position>),
    LineString(Vec<Position>),
    MultiLineString(Vec<Vec<Position>>),
    /// Exterior ring first, then holes. Rings are closed.
    Polygon(Vec<Vec<Position>>),
    MultiPolygon(Vec<Vec<Vec<Position>>>),
    #[serde(untagged)]
    Other(Value),
}

impl Geometry {
    /// Axis-aligned rectangle with the ring ordered SW → SE → NE → NW → SW.
    pub fn rectangle(west: f64, east: f64, south: f64, north: f64) -> Self {
        Geometry::Polygon(vec![vec![
            vec![west, south],
            vec![east, south],
            vec![east, north],
            vec![west, north],
            vec![west, south],
        ]])
    }
}

fn feature_kind() -> String {
    "Feature".to_string()
}

fn collection_kind() -> String {
    "FeatureCollection".to_string()
}

/// GeoJSON allows `"properties": null`.
fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Properties, D::Error> {
    Ok(Option::<Properties>::deserialize(deserializer)?.unwrap_or_default())
}

/// One dataset footprint plus its metadata.
///
/// `geometry` is `None` for features stored with `"geometry": null`; the
/// spatial filter never excludes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyFeature {
    #[serde(rename = "type", default = "feature_kind")]
    pub kind: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub properties: Properties,
    #[serde(default)]
    pub geometry: Option<Geometry>,
}

impl SurveyFeature {
    pub fn new(geometry: Geometry, properties: Properties) -> Self {
        Self {
            kind: feature_kind(),
            properties,
            geometry: Some(geometry),
        }
    }

    /// Returns a property as a string slice, if it is a JSON string.
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }
}

/// On-disk shape of a survey index file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type", default = "collection_kind")]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub features: Vec<SurveyFeature>,
}

// ═══════════════════════════════════════════════════════════════════════
// Pipeline entries
// ═══════════════════════════════════════════════════════════════════════

/// Derived files recorded by hooks, keyed by the producing hook's name.
///
/// Deserializes either a single path or an ordered list of paths per hook.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Artifacts(BTreeMap<String, Vec<PathBuf>>);

impl Artifacts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one path under `hook`.
    pub fn record(&mut self, hook: &str, path: impl Into<PathBuf>) {
        self.0.entry(hook.to_string()).or_default().push(path.into());
    }

    /// Paths recorded by `hook`, in recording order.
    pub fn get(&self, hook: &str) -> &[PathBuf] {
        self.0.get(hook).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, hook: &str) -> bool {
        self.0.contains_key(hook)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<PathBuf>)> {
        self.0.iter()
    }
}

impl<'de> Deserialize<'de> for Artifacts {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            One(PathBuf),
            Many(Vec<PathBuf>),
        }

        let raw = BTreeMap::<String, OneOrMany>::deserialize(deserializer)?;
        Ok(Artifacts(
            raw.into_iter()
                .map(|(k, v)| match v {
                    OneOrMany::One(p) => (k, vec![p]),
                    OneOrMany::Many(ps) => (k, ps),
                })
                .collect(),
        ))
    }
}

/// The mutable per-item record that flows through the pipeline.
///
/// `status` is `None` until the transport has attempted the transfer;
/// `Some(0)` means success and any other value is a failure. Keys the
/// pipeline does not know about live in `extra` and are passed through
/// untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_fn: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_fn: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Artifacts::is_empty")]
    pub artifacts: Artifacts,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entry {
    /// Status written by the pipeline when a transport call errors out.
    pub const TRANSFER_FAILED: i32 = -1;

    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_dst(mut self, dst_fn: impl Into<PathBuf>) -> Self {
        self.dst_fn = Some(dst_fn.into());
        self
    }

    pub fn with_data_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = Some(data_type.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.extra.insert(key.into(), value.into());
    }

    /// Basename of `dst_fn`, or an empty string.
    pub fn file_name(&self) -> String {
        self.dst_fn
            .as_deref()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// A result entry paired with the connector that produced it.
#[derive(Clone)]
pub struct Item {
    pub connector: Arc<dyn Connector>,
    pub entry: Entry,
}

impl Item {
    pub fn new(connector: Arc<dyn Connector>, entry: Entry) -> Self {
        Self { connector, entry }
    }

    /// Same connector, different entry.
    pub fn derive(&self, entry: Entry) -> Self {
        Self {
            connector: Arc::clone(&self.connector),
            entry,
        }
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("connector", &self.connector.name())
            .field("entry", &self.entry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rectangle_ring_order() {
        let g = Geometry::rectangle(-10.0, 10.0, -5.0, 5.0);
        let Geometry::Polygon(rings) = g else {
            panic!("expected polygon");
        };
        assert_eq!(
            rings[0],
            vec![
                vec![-10.0, -5.0],
                vec![10.0, -5.0],
                vec![10.0, 5.0],
                vec![-10.0, 5.0],
                vec![-10.0, -5.0]
            ]
        );
    }

    #[test]
    fn geometry_uses_geojson_shape() {
        let g = Geometry::rectangle(0.0, 1.0, 0.0, 1.0);
        let v = serde_json::to_value(&g).unwrap();
        assert_eq!(v["type"], "Polygon");
        assert_eq!(v["coordinates"][0][2], json!([1.0, 1.0]));
    }

    #[test]
    fn three_d_positions_and_other_types_round_trip() {
        let poly = json!({"type": "Polygon", "coordinates": [[[0, 0, 5], [1, 0, 5], [1, 1, 5], [0, 0, 5]]]});
        let g: Geometry = serde_json::from_value(poly.clone()).unwrap();
        let Geometry::Polygon(rings) = &g else {
            panic!("expected polygon, got {g:?}");
        };
        assert_eq!(rings[0][1], vec![1.0, 0.0, 5.0]);
        assert_eq!(serde_json::to_value(&g).unwrap(), json!({"type": "Polygon", "coordinates": [[[0.0, 0.0, 5.0], [1.0, 0.0, 5.0], [1.0, 1.0, 5.0], [0.0, 0.0, 5.0]]]}));

        let collection = json!({
            "type": "GeometryCollection",
            "geometries": [{"type": "Point", "coordinates": [1.0, 2.0]}]
        });
        let g: Geometry = serde_json::from_value(collection.clone()).unwrap();
        assert_eq!(g, Geometry::Other(collection.clone()));
        assert_eq!(serde_json::to_value(&g).unwrap(), collection);
    }

    #[test]
    fn null_geometry_and_properties_are_accepted() {
        let f: SurveyFeature = serde_json::from_value(json!({
            "type": "Feature",
            "geometry": null,
            "properties": null
        }))
        .unwrap();
        assert_eq!(f.geometry, None);
        assert!(f.properties.is_empty());
        assert_eq!(serde_json::to_value(&f).unwrap()["geometry"], Value::Null);
    }

    #[test]
    fn artifacts_accept_single_path_or_list() {
        let e: Entry = serde_json::from_value(json!({
            "url": "file:///a",
            "artifacts": { "stack": "/out/a.tif", "tiles": ["/t/1.tif", "/t/2.tif"] }
        }))
        .unwrap();
        assert_eq!(e.artifacts.get("stack"), &[PathBuf::from("/out/a.tif")]);
        assert_eq!(e.artifacts.get("tiles").len(), 2);
        assert!(e.artifacts.get("missing").is_empty());
    }

    #[test]
    fn unknown_keys_are_kept_in_extra() {
        let e: Entry = serde_json::from_value(json!({
            "url": "http://x/y.tif",
            "status": 0,
            "agency": "NOAA"
        }))
        .unwrap();
        assert!(e.is_success());
        assert_eq!(e.get("agency"), Some(&json!("NOAA")));

        let back = serde_json::to_value(&e).unwrap();
        assert_eq!(back["agency"], "NOAA");
        assert!(back.get("dst_fn").is_none());
    }
}
