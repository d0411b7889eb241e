//! Populate a [`SurveyIndex`] by scanning local files.
//!
//! Walks a directory, keeps files whose extension is in the allow-list and
//! asks a chain of [`MetadataExtractor`]s for each file's bounds. The
//! first extractor that handles the extension and returns metadata wins.
//!
//! Default chain:
//!
//! | Extractor | Formats | Source |
//! |-----------|---------|--------|
//! | [`GdalInfo`] | raster | `gdalinfo -json` |
//! | [`AsciiGrid`] | `.asc` | native header reader |
//! | [`PdalInfo`] | `.las`, `.laz` | `pdal info --metadata` |
//! | [`LasHeader`] | `.las`, `.laz` | native public header reader |
//! | [`Multibeam`] | `.mb58`, `.all` | not implemented, always empty |
//!
//! Files that no extractor can read are counted as skipped; the walk never
//! aborts on a single file.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::Command;
use tracing::{debug, error, info};
use walkdir::WalkDir;

use crate::index::SurveyIndex;
use crate::ingest::absolute;
use crate::models::{Geometry, Properties};

const RASTER_EXTS: &[&str] = &["tif", "tiff", "gtif", "asc", "img"];
const LIDAR_EXTS: &[&str] = &["las", "laz"];
const SONAR_EXTS: &[&str] = &["mb58", "all"];

/// What an extractor learned about one file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileMetadata {
    /// `[west, east, south, north]`.
    pub bounds: [f64; 4],
    pub resolution: Option<f64>,
    pub date: Option<String>,
    pub h_datum: Option<String>,
    pub v_datum: Option<String>,
}

impl FileMetadata {
    pub fn with_bounds(west: f64, east: f64, south: f64, north: f64) -> Self {
        Self {
            bounds: [west, east, south, north],
            ..Default::default()
        }
    }
}

/// A reader that derives bounds from one family of file formats.
pub trait MetadataExtractor: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this extractor should be tried for a lower-case extension
    /// (no leading dot).
    fn handles(&self, ext: &str) -> bool;

    /// `Ok(None)` means the file was readable but yielded no bounds.
    fn extract(&self, path: &Path) -> Result<Option<FileMetadata>>;
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Lower-case extensions, with or without the leading dot.
    pub extensions: Vec<String>,
    pub recursive: bool,
    /// Globs matched against the path relative to the scan root.
    pub exclude: Vec<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            extensions: [RASTER_EXTS, LIDAR_EXTS, SONAR_EXTS, &["xyz"]]
                .concat()
                .into_iter()
                .map(String::from)
                .collect(),
            recursive: true,
            exclude: Vec::new(),
        }
    }
}

/// Outcome of one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub indexed: usize,
    pub skipped: usize,
}

pub fn default_extractors() -> Vec<Box<dyn MetadataExtractor>> {
    vec![
        Box::new(GdalInfo),
        Box::new(AsciiGrid),
        Box::new(PdalInfo),
        Box::new(LasHeader),
        Box::new(Multibeam),
    ]
}

impl SurveyIndex {
    /// Scan `dir` with the default extractor chain.
    pub fn scan(&mut self, dir: &Path, options: &ScanOptions) -> ScanReport {
        self.scan_with(dir, options, &default_extractors())
    }

    /// Scan `dir` with a caller-supplied extractor chain.
    ///
    /// Features are tagged `DataSource = "local_scan"`. The index is saved
    /// once at the end. A missing directory or bad exclude glob is logged
    /// and the call is a no-op.
    pub fn scan_with(
        &mut self,
        dir: &Path,
        options: &ScanOptions,
        extractors: &[Box<dyn MetadataExtractor>],
    ) -> ScanReport {
        let root = absolute(dir);
        if !root.is_dir() {
            error!(dir = %root.display(), "Directory not found");
            return ScanReport::default();
        }
        let exclude = match build_globset(&options.exclude) {
            Ok(set) => set,
            Err(e) => {
                error!(error = %format!("{e:#}"), "Invalid exclude pattern");
                return ScanReport::default();
            }
        };
        let extensions: Vec<String> = options
            .extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect();

        info!(dir = %root.display(), extensions = ?extensions, "Scanning");

        let mut report = ScanReport::default();
        let walker = WalkDir::new(&root)
            .max_depth(if options.recursive { usize::MAX } else { 1 })
            .sort_by_file_name();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(error = %e, "Unreadable directory entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(&root).unwrap_or(path);
            if exclude.is_match(relative) {
                continue;
            }
            let ext = extension_of(path);
            if !extensions.contains(&ext) {
                continue;
            }

            match extract_with(extractors, path, &ext) {
                Some(meta) => {
                    let [w, e, s, n] = meta.bounds;
                    self.add_survey(Geometry::rectangle(w, e, s, n), scan_properties(path, &ext, meta));
                    report.indexed += 1;
                }
                None => report.skipped += 1,
            }
        }

        self.save();
        info!(indexed = report.indexed, skipped = report.skipped, "Scan complete");
        report
    }
}

fn extract_with(
    extractors: &[Box<dyn MetadataExtractor>],
    path: &Path,
    ext: &str,
) -> Option<FileMetadata> {
    for extractor in extractors.iter().filter(|x| x.handles(ext)) {
        match extractor.extract(path) {
            Ok(Some(meta)) if meta.bounds.iter().all(|v| v.is_finite()) => return Some(meta),
            Ok(_) => debug!(extractor = extractor.name(), file = %path.display(), "No bounds"),
            Err(e) => {
                debug!(extractor = extractor.name(), file = %path.display(), error = %format!("{e:#}"), "Extraction failed")
            }
        }
    }
    None
}

fn scan_properties(path: &Path, ext: &str, meta: FileMetadata) -> Properties {
    let mut props = Properties::new();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    props.insert("Name".into(), name.into());
    props.insert("DataLink".into(), format!("file://{}", path.display()).into());
    props.insert("DataType".into(), ext.into());
    props.insert("DataSource".into(), "local_scan".into());
    props.insert("Agency".into(), "Local".into());
    if let Some(r) = meta.resolution {
        props.insert("Resolution".into(), r.into());
    }
    if let Some(d) = meta.date {
        props.insert("Date".into(), d.into());
    }
    if let Some(h) = meta.h_datum {
        props.insert("HorizontalDatum".into(), h.into());
    }
    if let Some(v) = meta.v_datum {
        props.insert("VerticalDatum".into(), v.into());
    }
    props
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

fn run_json(program: &str, args: &[&str], path: &Path) -> Result<Value> {
    let output = Command::new(program)
        .args(args)
        .arg(path)
        .output()
        .with_context(|| format!("Failed to run {program}"))?;
    if !output.status.success() {
        bail!("{program} exited with {}", output.status);
    }
    serde_json::from_slice(&output.stdout).with_context(|| format!("{program} printed invalid JSON"))
}

// ═══════════════════════════════════════════════════════════════════════
// Raster
// ═══════════════════════════════════════════════════════════════════════

/// Reads raster bounds through `gdalinfo -json`.
pub struct GdalInfo;

impl MetadataExtractor for GdalInfo {
    fn name(&self) -> &str {
        "gdalinfo"
    }

    fn handles(&self, ext: &str) -> bool {
        RASTER_EXTS.contains(&ext)
    }

    fn extract(&self, path: &Path) -> Result<Option<FileMetadata>> {
        let info = run_json("gdalinfo", &["-json"], path)?;
        Ok(parse_gdalinfo(&info))
    }
}

/// Bounds from `cornerCoordinates`, resolution from `geoTransform[1]`.
pub fn parse_gdalinfo(info: &Value) -> Option<FileMetadata> {
    let corners = info.get("cornerCoordinates")?;
    let point = |key: &str| -> Option<(f64, f64)> {
        let p = corners.get(key)?;
        Some((p.get(0)?.as_f64()?, p.get(1)?.as_f64()?))
    };
    let (west, north) = point("upperLeft")?;
    let (east, south) = point("lowerRight")?;

    let mut meta = FileMetadata::with_bounds(west, east, south, north);
    meta.resolution = info
        .get("geoTransform")
        .and_then(|gt| gt.get(1))
        .and_then(Value::as_f64)
        .map(f64::abs);
    meta.h_datum = info
        .pointer("/coordinateSystem/wkt")
        .and_then(Value::as_str)
        .and_then(wkt_name);
    Some(meta)
}

/// First quoted name in a WKT string, e.g. `PROJCRS["NAD83 / UTM 15N", ...`.
fn wkt_name(wkt: &str) -> Option<String> {
    let start = wkt.find('"')? + 1;
    let len = wkt[start..].find('"')?;
    Some(wkt[start..start + len].to_string()).filter(|s| !s.is_empty())
}

/// Native reader for ESRI ASCII grid headers.
pub struct AsciiGrid;

impl MetadataExtractor for AsciiGrid {
    fn name(&self) -> &str {
        "ascii-grid"
    }

    fn handles(&self, ext: &str) -> bool {
        ext == "asc"
    }

    fn extract(&self, path: &Path) -> Result<Option<FileMetadata>> {
        let file = std::fs::File::open(path)?;
        let mut ncols = None;
        let mut nrows = None;
        let mut x = None;
        let mut y = None;
        let mut cellsize = None;
        let mut centered = false;

        for line in BufReader::new(file).lines().take(8) {
            let line = line?;
            let mut parts = line.split_whitespace();
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            let Ok(value) = value.parse::<f64>() else {
                break;
            };
            match key.to_ascii_lowercase().as_str() {
                "ncols" => ncols = Some(value),
                "nrows" => nrows = Some(value),
                "xllcorner" => x = Some(value),
                "yllcorner" => y = Some(value),
                "xllcenter" => {
                    x = Some(value);
                    centered = true;
                }
                "yllcenter" => y = Some(value),
                "cellsize" => cellsize = Some(value),
                _ => {}
            }
        }

        let (Some(ncols), Some(nrows), Some(x), Some(y), Some(cs)) = (ncols, nrows, x, y, cellsize)
        else {
            return Ok(None);
        };
        let (west, south) = if centered {
            (x - cs / 2.0, y - cs / 2.0)
        } else {
            (x, y)
        };
        let mut meta = FileMetadata::with_bounds(west, west + ncols * cs, south, south + nrows * cs);
        meta.resolution = Some(cs);
        Ok(Some(meta))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Lidar
// ═══════════════════════════════════════════════════════════════════════

/// Reads point-cloud bounds through `pdal info --metadata`.
pub struct PdalInfo;

impl MetadataExtractor for PdalInfo {
    fn name(&self) -> &str {
        "pdal"
    }

    fn handles(&self, ext: &str) -> bool {
        LIDAR_EXTS.contains(&ext)
    }

    fn extract(&self, path: &Path) -> Result<Option<FileMetadata>> {
        let info = run_json("pdal", &["info", "--metadata"], path)?;
        Ok(parse_pdal(&info))
    }
}

pub fn parse_pdal(info: &Value) -> Option<FileMetadata> {
    let m = info.get("metadata")?;
    let num = |k: &str| m.get(k).and_then(Value::as_f64);
    let mut meta = FileMetadata::with_bounds(num("minx")?, num("maxx")?, num("miny")?, num("maxy")?);
    meta.h_datum = m
        .pointer("/srs/horizontal")
        .and_then(Value::as_str)
        .and_then(wkt_name);
    meta.v_datum = m
        .pointer("/srs/vertical")
        .and_then(Value::as_str)
        .and_then(wkt_name);
    Some(meta)
}

/// Native reader for the LAS public header block. LAZ files carry the
/// same uncompressed header.
pub struct LasHeader;

const LAS_HEADER_LEN: usize = 227;

impl MetadataExtractor for LasHeader {
    fn name(&self) -> &str {
        "las-header"
    }

    fn handles(&self, ext: &str) -> bool {
        LIDAR_EXTS.contains(&ext)
    }

    fn extract(&self, path: &Path) -> Result<Option<FileMetadata>> {
        let mut header = [0u8; LAS_HEADER_LEN];
        std::fs::File::open(path)?
            .read_exact(&mut header)
            .context("LAS header truncated")?;
        if &header[..4] != b"LASF" {
            bail!("not a LAS file");
        }

        let f64_at = |off: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&header[off..off + 8]);
            f64::from_le_bytes(b)
        };
        let max_x = f64_at(179);
        let min_x = f64_at(187);
        let max_y = f64_at(195);
        let min_y = f64_at(203);

        let day = u16::from_le_bytes([header[90], header[91]]);
        let year = u16::from_le_bytes([header[92], header[93]]);

        let mut meta = FileMetadata::with_bounds(min_x, max_x, min_y, max_y);
        meta.date = chrono::NaiveDate::from_yo_opt(i32::from(year), u32::from(day))
            .map(|d| d.format("%Y-%m-%d").to_string());
        Ok(Some(meta))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Sonar
// ═══════════════════════════════════════════════════════════════════════

/// Placeholder for multibeam formats; never yields bounds.
pub struct Multibeam;

impl MetadataExtractor for Multibeam {
    fn name(&self) -> &str {
        "multibeam"
    }

    fn handles(&self, ext: &str) -> bool {
        SONAR_EXTS.contains(&ext)
    }

    fn extract(&self, _path: &Path) -> Result<Option<FileMetadata>> {
        Ok(None)
    }
}
