//! Bulk ingestion of file listings into a [`SurveyIndex`].
//!
//! Accepts delimited tables (`.csv`, `.tsv`) with a header row, or JSON
//! documents holding either a bare array of records or an object with a
//! `files` / `items` array. Each record becomes one rectangular footprint.
//!
//! Per record:
//!
//! 1. Schema fields are copied (key match is case-insensitive).
//! 2. Caller renames (`field_map`, source key → schema key) are applied.
//! 3. `DataLink` is taken from the first key containing `url`, `link` or
//!    `path` if it is still missing.
//! 4. Links that are not `http*`, `ftp*` or `file://` become
//!    `file://<absolute path>`.
//! 5. Bounds are found through [`BOUND_ALIASES`].
//!
//! Records without a link or with any bound missing are skipped and
//! counted; the batch never aborts.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::index::SurveyIndex;
use crate::models::{Geometry, Properties, SCHEMA};

/// Accepted key aliases for W, E, S, N, compared case-insensitively.
pub const BOUND_ALIASES: [&[&str]; 4] = [
    &["w", "west", "xmin", "min_lon", "min_x", "left"],
    &["e", "east", "xmax", "max_lon", "max_x", "right"],
    &["s", "south", "ymin", "min_lat", "min_y", "bottom"],
    &["n", "north", "ymax", "max_lat", "max_y", "top"],
];

/// Outcome of one [`SurveyIndex::ingest`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub added: usize,
    pub skipped: usize,
}

type Record = Map<String, Value>;

impl SurveyIndex {
    /// Load records from `source` and append one feature per valid record.
    ///
    /// With `wipe`, existing features are discarded once the source has
    /// been read. The index is saved once at the end. An unreadable or
    /// unsupported source is logged and leaves the index untouched.
    pub fn ingest(
        &mut self,
        source: &Path,
        field_map: &BTreeMap<String, String>,
        wipe: bool,
    ) -> IngestReport {
        let records = match read_records(source) {
            Ok(records) => records,
            Err(e) => {
                error!(source = %source.display(), error = %format!("{e:#}"), "Cannot ingest source");
                return IngestReport::default();
            }
        };

        if wipe {
            self.clear();
        }

        info!(index = %self.name(), count = records.len(), source = %source.display(), "Ingesting records");

        let mut report = IngestReport::default();
        for record in records {
            let Value::Object(record) = record else {
                warn!("Skipping non-object record");
                report.skipped += 1;
                continue;
            };
            match record_to_survey(&record, field_map) {
                Ok((geometry, props)) => {
                    self.add_survey(geometry, props);
                    report.added += 1;
                }
                Err(reason) => {
                    warn!(record = %display_name(&record), reason, "Skipping record");
                    report.skipped += 1;
                }
            }
        }

        info!(index = %self.name(), added = report.added, skipped = report.skipped, "Ingest complete");
        self.save();
        report
    }
}

fn read_records(source: &Path) -> Result<Vec<Value>> {
    let ext = source
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match ext.as_str() {
        "csv" => read_table(source, b','),
        "tsv" => read_table(source, b'\t'),
        "json" => {
            let content = std::fs::read_to_string(source)
                .with_context(|| format!("Failed to read {}", source.display()))?;
            let doc: Value = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", source.display()))?;
            Ok(match doc {
                Value::Array(items) => items,
                Value::Object(mut obj) => match obj.remove("files").or_else(|| obj.remove("items")) {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                },
                _ => Vec::new(),
            })
        }
        other => anyhow::bail!("Unsupported source format '{other}'; use csv, tsv or json"),
    }
}

fn read_table(source: &Path, delimiter: u8) -> Result<Vec<Value>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_path(source)
        .with_context(|| format!("Failed to open {}", source.display()))?;

    let headers = reader.headers()?.clone();
    let mut rows = Vec::new();
    for row in reader.records() {
        let row = row.with_context(|| format!("Malformed row in {}", source.display()))?;
        let record: Record = headers
            .iter()
            .zip(row.iter())
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect();
        rows.push(Value::Object(record));
    }
    Ok(rows)
}

fn record_to_survey(
    record: &Record,
    field_map: &BTreeMap<String, String>,
) -> std::result::Result<(Geometry, Properties), &'static str> {
    let mut props = Properties::new();

    for field in SCHEMA {
        if let Some(v) = lookup(record, field) {
            props.insert(field.to_string(), v.clone());
        }
    }

    for (src, dst) in field_map {
        if let Some(v) = record.get(src) {
            props.insert(dst.clone(), v.clone());
        }
    }

    let link = props
        .get("DataLink")
        .and_then(link_text)
        .or_else(|| {
            record
                .iter()
                .find(|(k, _)| {
                    let k = k.to_ascii_lowercase();
                    k.contains("url") || k.contains("link") || k.contains("path")
                })
                .and_then(|(_, v)| link_text(v))
        })
        .ok_or("no DataLink/URL found")?;
    props.insert("DataLink".to_string(), Value::String(canonical_link(&link)));

    let mut bounds = [0.0f64; 4];
    for (slot, aliases) in bounds.iter_mut().zip(BOUND_ALIASES) {
        *slot = aliases
            .iter()
            .find_map(|alias| lookup(record, alias))
            .and_then(as_number)
            .ok_or("missing spatial bounds")?;
    }
    let [w, e, s, n] = bounds;

    Ok((Geometry::rectangle(w, e, s, n), props))
}

/// Exact key first, then a case-insensitive match.
fn lookup<'a>(record: &'a Record, key: &str) -> Option<&'a Value> {
    record.get(key).or_else(|| {
        record
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    })
}

fn link_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|f: &f64| f.is_finite())
}

/// Network and `file://` links pass through; anything else is treated as
/// a local path and made absolute.
pub(crate) fn canonical_link(link: &str) -> String {
    if link.starts_with("http") || link.starts_with("ftp") || link.starts_with("file://") {
        return link.to_string();
    }
    format!("file://{}", absolute(Path::new(link)).display())
}

pub(crate) fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

fn display_name(record: &Record) -> String {
    lookup(record, "Name")
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| "<unnamed>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn index_in(tmp: &TempDir) -> SurveyIndex {
        SurveyIndex::at_path("ingest", tmp.path().join("ingest.geojson"))
    }

    #[test]
    fn csv_with_aliases_and_case_insensitive_schema() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("list.csv");
        fs::write(
            &src,
            "name,agency,file_url,xmin,XMAX,min_y,TOP\n\
             tile1,NOAA,https://a/t1.tif,-10,-9,30,31\n\
             tile2,NOAA,https://a/t2.tif,-9,-8,30,31\n",
        )
        .unwrap();

        let mut idx = index_in(&tmp);
        let report = idx.ingest(&src, &BTreeMap::new(), false);
        assert_eq!(report, IngestReport { added: 2, skipped: 0 });

        let f = &idx.features()[0];
        assert_eq!(f.property_str("Name"), Some("tile1"));
        assert_eq!(f.property_str("Agency"), Some("NOAA"));
        assert_eq!(f.property_str("DataLink"), Some("https://a/t1.tif"));
        assert_eq!(f.geometry, Some(Geometry::rectangle(-10.0, -9.0, 30.0, 31.0)));

        // persisted once at the end
        assert_eq!(SurveyIndex::at_path("ingest", idx.path()).len(), 2);
    }

    #[test]
    fn record_without_bounds_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("list.json");
        fs::write(&src, r#"[{"name": "x", "url": "http://a/b.tif"}]"#).unwrap();

        let mut idx = index_in(&tmp);
        let report = idx.ingest(&src, &BTreeMap::new(), false);
        assert_eq!(report, IngestReport { added: 0, skipped: 1 });
        assert!(idx.is_empty());
    }

    #[test]
    fn json_items_key_field_map_and_local_links() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("list.json");
        fs::write(
            &src,
            json!({
                "items": [
                    {"title": "a", "href": "/data/a.laz", "west": 1, "east": 2, "south": 3, "north": 4},
                    {"title": "b", "west": 1, "east": 2, "south": 3, "north": 4},
                    "not-an-object"
                ]
            })
            .to_string(),
        )
        .unwrap();

        let mut map = BTreeMap::new();
        map.insert("title".to_string(), "Name".to_string());
        map.insert("href".to_string(), "DataLink".to_string());

        let mut idx = index_in(&tmp);
        let report = idx.ingest(&src, &map, false);
        assert_eq!(report, IngestReport { added: 1, skipped: 2 });
        let f = &idx.features()[0];
        assert_eq!(f.property_str("Name"), Some("a"));
        assert_eq!(f.property_str("DataLink"), Some("file:///data/a.laz"));
    }

    #[test]
    fn tsv_and_wipe() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("list.tsv");
        fs::write(
            &src,
            "Name\tDataLink\tw\te\ts\tn\nz\tftp://h/z.xyz\t0\t1\t0\t1\n",
        )
        .unwrap();

        let mut idx = index_in(&tmp);
        idx.ingest(&src, &BTreeMap::new(), false);
        idx.ingest(&src, &BTreeMap::new(), false);
        assert_eq!(idx.len(), 2);

        idx.ingest(&src, &BTreeMap::new(), true);
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.features()[0].property_str("DataLink"), Some("ftp://h/z.xyz"));
    }

    #[test]
    fn non_numeric_bounds_and_unsupported_format() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("list.csv");
        fs::write(&src, "url,w,e,s,n\nhttp://a,zero,1,0,1\n").unwrap();
        let mut idx = index_in(&tmp);
        assert_eq!(idx.ingest(&src, &BTreeMap::new(), false).skipped, 1);

        let xml = tmp.path().join("list.xml");
        fs::write(&xml, "<x/>").unwrap();
        assert_eq!(
            idx.ingest(&xml, &BTreeMap::new(), false),
            IngestReport::default()
        );
    }

    #[test]
    fn canonical_links() {
        assert_eq!(canonical_link("https://x/y"), "https://x/y");
        assert_eq!(canonical_link("file:///x/y"), "file:///x/y");
        assert_eq!(canonical_link("/x/y"), "file:///x/y");
        assert!(canonical_link("rel/y").ends_with("/rel/y"));
    }
}
