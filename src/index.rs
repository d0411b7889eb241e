//! File-backed survey index.
//!
//! A [`SurveyIndex`] is a named list of [`SurveyFeature`]s persisted as a
//! compact GeoJSON `FeatureCollection`. It is loaded eagerly on open and
//! written back only on an explicit [`SurveyIndex::save`].
//!
//! # Path resolution
//!
//! `open(name, local)` looks for `<name>.geojson` in this order:
//!
//! | # | Location | When |
//! |---|----------|------|
//! | 1 | `./<name>.geojson` | `local = true` |
//! | 2 | `<data_dir>/<name>.geojson` | file exists |
//! | 3 | `<config dir>/indices/<name>.geojson` | file exists |
//! | 4 | `./<name>.geojson` | fallback |
//!
//! Bulk population lives in [`crate::ingest`] and [`crate::scan`].

use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::models::{FeatureCollection, Geometry, Properties, SurveyFeature};
use crate::spatial::{self, Region};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("failed to read or write index {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed index {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A named, file-backed collection of dataset footprints.
#[derive(Debug, Clone)]
pub struct SurveyIndex {
    name: String,
    path: PathBuf,
    features: Vec<SurveyFeature>,
    spatial: bool,
}

impl SurveyIndex {
    /// Resolve and load the index called `name`.
    ///
    /// A missing or corrupt backing file yields an empty index.
    pub fn open(name: &str, local: bool, config: &Config) -> Self {
        let path = Self::resolve_path(name, local, config);
        Self::at_path(name, path)
    }

    /// Load an index from an explicit backing file.
    pub fn at_path(name: &str, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let features = if path.exists() {
            match read_features(&path) {
                Ok(features) => {
                    if !features.is_empty() {
                        info!(index = %name, count = features.len(), "Loaded index");
                    }
                    features
                }
                Err(e) => {
                    error!(index = %name, error = %e, "Corrupt index, starting empty");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        Self {
            name: name.to_string(),
            path,
            features,
            spatial: true,
        }
    }

    pub fn resolve_path(name: &str, local: bool, config: &Config) -> PathBuf {
        let filename = format!("{name}.geojson");
        if local {
            return PathBuf::from(filename);
        }

        let candidates = config
            .data_dir()
            .into_iter()
            .chain(std::iter::once(config.indices_dir()))
            .map(|dir| dir.join(&filename));
        for candidate in candidates {
            if candidate.exists() {
                return candidate;
            }
        }
        PathBuf::from(filename)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn features(&self) -> &[SurveyFeature] {
        &self.features
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Drop every feature (in memory only).
    pub fn clear(&mut self) {
        self.features.clear();
    }

    /// Enable or disable the geometry engine for [`search`](Self::search).
    pub fn set_spatial(&mut self, enabled: bool) {
        self.spatial = enabled;
    }

    /// Append a feature, stamping `LastUpdate` with today's local date.
    ///
    /// No duplicate check is performed.
    pub fn add_survey(&mut self, geometry: Geometry, mut properties: Properties) {
        properties.insert("LastUpdate".to_string(), Value::String(today()));
        self.features.push(SurveyFeature::new(geometry, properties));
    }

    /// Persist to the backing file. Failures are logged, never raised.
    pub fn save(&self) {
        match self.write() {
            Ok(()) => info!(index = %self.name, path = %self.path.display(), "Saved index"),
            Err(e) => error!(index = %self.name, error = %e, "Failed to save index"),
        }
    }

    /// Persist to the backing file, creating parent directories.
    pub fn write(&self) -> Result<(), IndexError> {
        let io_err = |source| IndexError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let doc = FeatureCollection {
            kind: "FeatureCollection".to_string(),
            name: self.name.clone(),
            features: self.features.clone(),
        };
        let bytes = serde_json::to_vec(&doc).map_err(|source| IndexError::Json {
            path: self.path.clone(),
            source,
        })?;
        std::fs::write(&self.path, bytes).map_err(io_err)
    }

    /// Properties of every feature passing all supplied filters, in
    /// insertion order.
    ///
    /// - `layer` must equal the `DataSource` property.
    /// - each `key=value` clause must match (clauses without `=` are ignored).
    /// - `region` must intersect the footprint, when a geometry engine is
    ///   available; otherwise the spatial filter is skipped. Features without
    ///   a readable geometry always pass.
    pub fn search(
        &self,
        region: Option<&Region>,
        clauses: &[String],
        layer: Option<&str>,
    ) -> Vec<&Properties> {
        let clauses: Vec<(&str, &str)> = clauses.iter().filter_map(|c| parse_clause(c)).collect();
        if let Some(r) = region {
            debug!(index = %self.name, region = %r, "Searching index");
        }

        let results: Vec<&Properties> = self
            .features
            .iter()
            .filter(|f| layer.map_or(true, |l| f.property_str("DataSource") == Some(l)))
            .filter(|f| {
                clauses
                    .iter()
                    .all(|(k, v)| value_matches(f.properties.get(*k), v))
            })
            .filter(|f| match (region, self.spatial, &f.geometry) {
                (Some(r), true, Some(g)) => spatial::intersects(g, r).unwrap_or(true),
                _ => true,
            })
            .map(|f| &f.properties)
            .collect();

        info!(index = %self.name, count = results.len(), "Search complete");
        results
    }

    /// Distinct non-empty values of `field`, first-seen order.
    pub fn unique_values(&self, field: &str) -> Vec<Value> {
        let mut seen: Vec<Value> = Vec::new();
        for value in self.features.iter().filter_map(|f| f.properties.get(field)) {
            let empty = match value {
                Value::Null => true,
                Value::String(s) => s.is_empty(),
                _ => false,
            };
            if !empty && !seen.contains(value) {
                seen.push(value.clone());
            }
        }
        seen
    }
}

fn read_features(path: &Path) -> Result<Vec<SurveyFeature>, IndexError> {
    let content = std::fs::read_to_string(path).map_err(|source| IndexError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let doc: FeatureCollection =
        serde_json::from_str(&content).map_err(|source| IndexError::Json {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(doc.features)
}

/// Split `key=value`, trimming whitespace then quotes from both halves.
fn parse_clause<'a>(clause: &'a str) -> Option<(&'a str, &'a str)> {
    let (k, v) = clause.split_once('=')?;
    let clean = |s: &'a str| -> &'a str { s.trim().trim_matches('\'').trim_matches('"') };
    Some((clean(k), clean(v)))
}

fn value_matches(value: Option<&Value>, expected: &str) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => s == expected,
        Some(other) => other.to_string() == expected,
    }
}

pub(crate) fn today() -> String {
    chrono::Local::now().format("%Y-%m-%d").to_string()
}
