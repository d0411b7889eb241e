//! Connector over a local [`SurveyIndex`].
//!
//! Queries the index with a region, attribute clauses and an optional
//! layer, then emits one [`Entry`] per matching `DataLink`.
//!
//! | Mode | `dst_fn` for local links |
//! |------|--------------------------|
//! | `reference` | the existing file, nothing is copied |
//! | `copy` | `<outdir>/<basename>`, staged by the transport |
//!
//! Non-local links always target `<outdir>/<basename>`.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::index::SurveyIndex;
use crate::models::Entry;
use crate::spatial::Region;
use crate::traits::Connector;
use crate::transport_fs::local_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalMode {
    #[default]
    Reference,
    Copy,
}

impl FromStr for LocalMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "reference" | "ref" => Ok(LocalMode::Reference),
            "copy" => Ok(LocalMode::Copy),
            other => anyhow::bail!("unknown local mode '{other}' (use reference or copy)"),
        }
    }
}

impl fmt::Display for LocalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LocalMode::Reference => "reference",
            LocalMode::Copy => "copy",
        })
    }
}

pub struct LocalIndexConnector {
    index: SurveyIndex,
    outdir: PathBuf,
    region: Option<Region>,
    clauses: Vec<String>,
    layer: Option<String>,
    mode: LocalMode,
}

impl LocalIndexConnector {
    pub fn new(index: SurveyIndex, outdir: impl Into<PathBuf>) -> Self {
        Self {
            index,
            outdir: outdir.into(),
            region: None,
            clauses: Vec::new(),
            layer: None,
            mode: LocalMode::default(),
        }
    }

    pub fn with_region(mut self, region: Option<Region>) -> Self {
        self.region = region;
        self
    }

    pub fn with_where(mut self, clauses: Vec<String>) -> Self {
        self.clauses = clauses;
        self
    }

    pub fn with_layer(mut self, layer: Option<String>) -> Self {
        self.layer = layer;
        self
    }

    pub fn with_mode(mut self, mode: LocalMode) -> Self {
        self.mode = mode;
        self
    }

    fn entry_for(&self, link: &str, props: &serde_json::Map<String, Value>) -> Entry {
        let local = local_path(link);
        let basename = local
            .as_deref()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| link.rsplit('/').next().unwrap_or_default().to_string());

        let dst = match (self.mode, local) {
            (LocalMode::Reference, Some(path)) => path,
            _ => self.outdir.join(&basename),
        };

        let mut entry = Entry::new(link).with_dst(dst);
        if let Some(dt) = props.get("DataType").and_then(Value::as_str) {
            entry.data_type = Some(dt.to_string());
        }
        for (prop, key) in [("Name", "title"), ("Agency", "agency"), ("Date", "date")] {
            if let Some(v) = props.get(prop).filter(|v| !v.is_null()) {
                entry.set(key, v.clone());
            }
        }
        entry
    }
}

#[async_trait]
impl Connector for LocalIndexConnector {
    fn name(&self) -> &str {
        "local"
    }

    fn description(&self) -> &str {
        "Datasets listed in a local survey index"
    }

    fn outdir(&self) -> &Path {
        &self.outdir
    }

    fn tags(&self) -> Vec<String> {
        vec!["local".to_string(), self.index.name().to_string()]
    }

    async fn enumerate(&self) -> Result<Vec<Entry>> {
        let hits = self
            .index
            .search(self.region.as_ref(), &self.clauses, self.layer.as_deref());
        Ok(hits
            .into_iter()
            .filter_map(|props| {
                let link = props.get("DataLink").and_then(Value::as_str)?;
                Some(self.entry_for(link, props))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Geometry, Properties};
    use serde_json::json;
    use tempfile::TempDir;

    fn index(tmp: &TempDir) -> SurveyIndex {
        let mut idx = SurveyIndex::at_path("l", tmp.path().join("l.geojson"));
        let mut add = |link: &str, agency: &str| {
            let props: Properties = json!({"Name": link, "DataLink": link, "Agency": agency, "DataType": "tif"})
                .as_object()
                .cloned()
                .unwrap();
            idx.add_survey(Geometry::rectangle(0.0, 1.0, 0.0, 1.0), props);
        };
        add("file:///data/a.tif", "NOAA");
        add("https://h/b.tif", "USGS");
        idx
    }

    #[tokio::test]
    async fn reference_mode_points_at_existing_files() {
        let tmp = TempDir::new().unwrap();
        let conn = LocalIndexConnector::new(index(&tmp), "/out/local");
        let entries = conn.enumerate().await.unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].dst_fn, Some(PathBuf::from("/data/a.tif")));
        assert_eq!(entries[0].data_type.as_deref(), Some("tif"));
        assert_eq!(entries[0].get("agency"), Some(&json!("NOAA")));
        assert_eq!(entries[1].dst_fn, Some(PathBuf::from("/out/local/b.tif")));
    }

    #[tokio::test]
    async fn copy_mode_and_where_clause() {
        let tmp = TempDir::new().unwrap();
        let conn = LocalIndexConnector::new(index(&tmp), "/out/local")
            .with_mode(LocalMode::Copy)
            .with_where(vec!["Agency=NOAA".to_string()]);
        let entries = conn.enumerate().await.unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].dst_fn, Some(PathBuf::from("/out/local/a.tif")));
    }

    #[test]
    fn mode_parses() {
        assert_eq!("copy".parse::<LocalMode>().unwrap(), LocalMode::Copy);
        assert_eq!("Reference".parse::<LocalMode>().unwrap(), LocalMode::Reference);
        assert!("move".parse::<LocalMode>().is_err());
    }
}
