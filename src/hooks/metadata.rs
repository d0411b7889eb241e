//! Metadata and reporting hooks.
//!
//! | Hook | Stage | Effect |
//! |------|-------|--------|
//! | `list` | pre | prints URLs |
//! | `inventory` | pre | prints a JSON/CSV inventory |
//! | `set_weight` | pre | `weight` from rules |
//! | `checksum` | file | `<algo>_hash`, `local_size`, `verification` |
//! | `enrich` | file | `created_at`, `modified_at`, `mime_type` |
//! | `sidecar` | file | writes `<file>.meta.json` |
//! | `set_datatype` | file | overrides `data_type` |
//! | `audit` | post | writes a run summary file |

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use serde_json::{json, Map, Value};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, error, warn};

use super::registry::{Builtin, HookRegistry};
use super::{emit, Hook, HookArgs, HookInfo, Stage};
use crate::models::Item;

pub(crate) fn register(registry: &mut HookRegistry) {
    registry.register_builtin::<List>();
    registry.register_builtin::<Inventory>();
    registry.register_builtin::<SetWeight>();
    registry.register_builtin::<Checksum>();
    registry.register_builtin::<Enrich>();
    registry.register_builtin::<Sidecar>();
    registry.register_builtin::<SetDataType>();
    registry.register_builtin::<Audit>();
}

/// Existing file behind a successful entry.
fn downloaded(item: &Item) -> Option<&Path> {
    item.entry
        .dst_fn
        .as_deref()
        .filter(|p| item.entry.is_success() && p.is_file())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Csv,
    Text,
}

impl Format {
    fn parse(s: &str, allowed: &[Format]) -> Result<Self> {
        let f = match s.to_ascii_lowercase().as_str() {
            "json" => Format::Json,
            "csv" => Format::Csv,
            "text" | "txt" => Format::Text,
            other => bail!("unknown format '{other}'"),
        };
        if !allowed.contains(&f) {
            bail!("format '{s}' is not supported here");
        }
        Ok(f)
    }
}

/// CSV text with one column per header; scalars print bare, other values
/// as JSON.
fn to_csv(headers: &[String], rows: &[Map<String, Value>]) -> Result<String> {
    let mut w = csv::Writer::from_writer(Vec::new());
    w.write_record(headers)?;
    for row in rows {
        w.write_record(headers.iter().map(|h| match row.get(h) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }))?;
    }
    let bytes = w.into_inner().context("Failed to flush CSV")?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

// ═══════════════════════════════════════════════════════════════════════
// list / inventory
// ═══════════════════════════════════════════════════════════════════════

pub struct List {
    info: HookInfo,
}

impl Builtin for List {
    fn describe() -> HookInfo {
        HookInfo::new("list", "Print discovered URLs to stdout", Stage::Pre, "metadata")
    }

    fn build(info: HookInfo, _args: &HookArgs) -> Result<Self> {
        Ok(Self { info })
    }
}

impl Hook for List {
    fn info(&self) -> &HookInfo {
        &self.info
    }

    fn run(&self, items: Vec<Item>) -> Result<Vec<Item>> {
        emit(items.iter().map(|i| &i.entry.url));
        Ok(items)
    }
}

pub struct Inventory {
    info: HookInfo,
    format: Format,
}

impl Builtin for Inventory {
    fn describe() -> HookInfo {
        HookInfo::new("inventory", "Print a metadata inventory of the queue", Stage::Pre, "metadata")
            .option("format", "json", "json or csv")
    }

    fn build(info: HookInfo, args: &HookArgs) -> Result<Self> {
        let format = Format::parse(&args.str_or("format", "json"), &[Format::Json, Format::Csv])?;
        Ok(Self { info, format })
    }
}

impl Inventory {
    const COLUMNS: [&'static str; 5] = ["module", "filename", "url", "data_type", "date"];

    fn rows(items: &[Item]) -> Vec<Map<String, Value>> {
        items
            .iter()
            .map(|i| {
                let e = &i.entry;
                let row = json!({
                    "module": i.connector.name(),
                    "filename": e.dst_fn,
                    "url": e.url,
                    "data_type": e.data_type,
                    "date": e.get("date").cloned().unwrap_or_else(|| json!("")),
                });
                match row {
                    Value::Object(map) => map,
                    _ => Map::new(),
                }
            })
            .collect()
    }

    fn render(&self, items: &[Item]) -> Result<String> {
        let rows = Self::rows(items);
        match self.format {
            Format::Csv => {
                let headers: Vec<String> = Self::COLUMNS.iter().map(|c| c.to_string()).collect();
                to_csv(&headers, &rows)
            }
            _ => Ok(serde_json::to_string_pretty(&rows)?),
        }
    }
}

impl Hook for Inventory {
    fn info(&self) -> &HookInfo {
        &self.info
    }

    fn run(&self, items: Vec<Item>) -> Result<Vec<Item>> {
        emit([self.render(&items)?]);
        Ok(items)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// set_weight
// ═══════════════════════════════════════════════════════════════════════

/// Assigns `weight` from the first rule matching, in order, the connector
/// name, the data type, or the file extension.
pub struct SetWeight {
    info: HookInfo,
    default: f64,
    rules: BTreeMap<String, f64>,
}

impl Builtin for SetWeight {
    fn describe() -> HookInfo {
        HookInfo::new("set_weight", "Assign weights to entries by rule", Stage::Pre, "metadata")
            .option("default", 1.0, "Weight when no rule matches")
            .option("rules", json!({}), "key:weight pairs, or a table in config")
    }

    fn build(info: HookInfo, args: &HookArgs) -> Result<Self> {
        let default = args.f64_or("default", 1.0)?;
        let rules = match args.get("rules") {
            None => BTreeMap::new(),
            Some(Value::Object(map)) => {
                let mut rules = BTreeMap::new();
                for (k, v) in map {
                    let w = HookArgs::new().with("w", v.clone()).f64_or("w", 0.0)?;
                    rules.insert(k.to_ascii_lowercase(), w);
                }
                rules
            }
            Some(Value::String(s)) => parse_rules(s)?,
            Some(other) => bail!("set_weight rules must be a table or key:weight list, got {other}"),
        };
        Ok(Self { info, default, rules })
    }
}

/// `"lidar:5,csb:0.5"`
fn parse_rules(s: &str) -> Result<BTreeMap<String, f64>> {
    s.split([',', ';'])
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|pair| {
            let (k, v) = pair
                .split_once(':')
                .with_context(|| format!("set_weight rule {pair:?} is not key:weight"))?;
            let w: f64 = v
                .trim()
                .parse()
                .with_context(|| format!("set_weight rule {pair:?} has a non-numeric weight"))?;
            Ok((k.trim().to_ascii_lowercase(), w))
        })
        .collect()
}

impl Hook for SetWeight {
    fn info(&self) -> &HookInfo {
        &self.info
    }

    fn run(&self, mut items: Vec<Item>) -> Result<Vec<Item>> {
        for item in &mut items {
            let mut keys = vec![item.connector.name().to_ascii_lowercase()];
            if let Some(dt) = &item.entry.data_type {
                keys.push(dt.to_ascii_lowercase());
            }
            if let Some(ext) = item.entry.dst_fn.as_deref().and_then(Path::extension) {
                keys.push(ext.to_string_lossy().to_ascii_lowercase());
            }
            let weight = keys
                .iter()
                .find_map(|k| self.rules.get(k).copied())
                .unwrap_or(self.default);
            item.entry.set("weight", weight);
        }
        Ok(items)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// checksum
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq)]
enum Algo {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl Algo {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "md5" => Some(Algo::Md5),
            "sha1" => Some(Algo::Sha1),
            "sha256" => Some(Algo::Sha256),
            "sha512" => Some(Algo::Sha512),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Algo::Md5 => "md5",
            Algo::Sha1 => "sha1",
            Algo::Sha256 => "sha256",
            Algo::Sha512 => "sha512",
        }
    }
}

pub struct Checksum {
    info: HookInfo,
    algo: Algo,
    key: String,
}

impl Builtin for Checksum {
    fn describe() -> HookInfo {
        HookInfo::new("checksum", "Calculate file checksums", Stage::File, "metadata")
            .option("algo", "md5", "md5, sha1, sha256 or sha512")
    }

    fn build(info: HookInfo, args: &HookArgs) -> Result<Self> {
        let requested = args.str_or("algo", "md5").to_ascii_lowercase();
        let algo = Algo::parse(&requested).unwrap_or_else(|| {
            warn!(algo = %requested, "Unsupported checksum algorithm, using md5");
            Algo::Md5
        });
        Ok(Self {
            info,
            algo,
            key: format!("{}_hash", algo.name()),
        })
    }
}

fn digest_file<D: Digest>(path: &Path) -> std::io::Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = D::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

impl Hook for Checksum {
    fn info(&self) -> &HookInfo {
        &self.info
    }

    fn run(&self, mut items: Vec<Item>) -> Result<Vec<Item>> {
        for item in &mut items {
            let Some(path) = downloaded(item).map(Path::to_path_buf) else {
                item.entry.set(self.key.clone(), Value::Null);
                item.entry.set("local_size", 0);
                continue;
            };
            let result = match self.algo {
                Algo::Md5 => digest_file::<Md5>(&path),
                Algo::Sha1 => digest_file::<Sha1>(&path),
                Algo::Sha256 => digest_file::<Sha256>(&path),
                Algo::Sha512 => digest_file::<Sha512>(&path),
            };
            let (hash, size) = match result {
                Ok(r) => r,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Checksum failed");
                    continue;
                }
            };
            item.entry.set(self.key.clone(), hash);
            item.entry.set("local_size", size);

            let remote = match item.entry.get("remote_size") {
                Some(Value::Number(n)) => n.as_u64(),
                Some(Value::String(s)) => s.trim().parse().ok(),
                _ => None,
            };
            if let Some(remote) = remote.filter(|r| *r > 0) {
                let verdict = if remote == size { "passed" } else { "failed" };
                if remote != size {
                    warn!(file = %path.display(), local = size, remote, "Size mismatch");
                }
                item.entry.set("verification", verdict);
            }
        }
        Ok(items)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// enrich
// ═══════════════════════════════════════════════════════════════════════

pub struct Enrich {
    info: HookInfo,
}

impl Builtin for Enrich {
    fn describe() -> HookInfo {
        HookInfo::new("enrich", "Add file timestamps and mime types", Stage::File, "metadata")
    }

    fn build(info: HookInfo, _args: &HookArgs) -> Result<Self> {
        Ok(Self { info })
    }
}

fn iso_local(t: SystemTime) -> String {
    DateTime::<Local>::from(t).format("%Y-%m-%dT%H:%M:%S").to_string()
}

fn mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "tif" | "tiff" | "gtif" => "image/tiff",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "zip" => "application/zip",
        "gz" | "tgz" => "application/gzip",
        "json" => "application/json",
        "geojson" => "application/geo+json",
        "xml" => "application/xml",
        "nc" => "application/x-netcdf",
        "csv" => "text/csv",
        "txt" | "xyz" | "asc" | "dat" => "text/plain",
        "html" | "htm" => "text/html",
        _ => "application/octet-stream",
    }
}

impl Hook for Enrich {
    fn info(&self) -> &HookInfo {
        &self.info
    }

    fn run(&self, mut items: Vec<Item>) -> Result<Vec<Item>> {
        for item in &mut items {
            let Some(path) = downloaded(item).map(Path::to_path_buf) else {
                continue;
            };
            match std::fs::metadata(&path) {
                Ok(meta) => {
                    if let Ok(created) = meta.created() {
                        item.entry.set("created_at", iso_local(created));
                    }
                    if let Ok(modified) = meta.modified() {
                        item.entry.set("modified_at", iso_local(modified));
                    }
                    item.entry.set("mime_type", mime_type(&path));
                }
                Err(e) => warn!(file = %path.display(), error = %e, "Metadata enrichment failed"),
            }
        }
        Ok(items)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// sidecar
// ═══════════════════════════════════════════════════════════════════════

pub struct Sidecar {
    info: HookInfo,
}

impl Builtin for Sidecar {
    fn describe() -> HookInfo {
        HookInfo::new("sidecar", "Write a .meta.json provenance file per download", Stage::File, "metadata")
    }

    fn build(info: HookInfo, _args: &HookArgs) -> Result<Self> {
        Ok(Self { info })
    }
}

fn sidecar_path(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_os_string();
    name.push(".meta.json");
    PathBuf::from(name)
}

impl Hook for Sidecar {
    fn info(&self) -> &HookInfo {
        &self.info
    }

    fn run(&self, mut items: Vec<Item>) -> Result<Vec<Item>> {
        for item in &mut items {
            let Some(path) = downloaded(item).map(Path::to_path_buf) else {
                continue;
            };

            let mut extra = item.entry.extra.clone();
            if let Some(dt) = &item.entry.data_type {
                extra.insert("data_type".into(), json!(dt));
            }
            if let Some(src) = &item.entry.src_fn {
                extra.insert("src_fn".into(), json!(src));
            }
            let meta = json!({
                "source_module": item.connector.name(),
                "source_url": item.entry.url,
                "download_date": Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
                "original_filename": item.entry.file_name(),
                "tags": item.connector.tags(),
                "extra": extra,
            });

            let out = sidecar_path(&path);
            let written = serde_json::to_string_pretty(&meta)
                .map_err(anyhow::Error::from)
                .and_then(|s| std::fs::write(&out, s).map_err(anyhow::Error::from));
            match written {
                Ok(()) => item.entry.artifacts.record(&self.info.name, out),
                Err(e) => warn!(file = %path.display(), error = %e, "Failed to write sidecar"),
            }
        }
        Ok(items)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// set_datatype
// ═══════════════════════════════════════════════════════════════════════

pub struct SetDataType {
    info: HookInfo,
    data_type: Option<String>,
}

impl Builtin for SetDataType {
    fn describe() -> HookInfo {
        HookInfo::new("set_datatype", "Override the data_type of downloaded entries", Stage::File, "metadata")
            .option("data_type", "", "New data type (alias: type)")
    }

    fn build(info: HookInfo, args: &HookArgs) -> Result<Self> {
        Ok(Self {
            info,
            data_type: args.str("data_type").or_else(|| args.str("type")),
        })
    }
}

impl Hook for SetDataType {
    fn info(&self) -> &HookInfo {
        &self.info
    }

    fn run(&self, mut items: Vec<Item>) -> Result<Vec<Item>> {
        let Some(dt) = &self.data_type else {
            return Ok(items);
        };
        for item in items.iter_mut().filter(|i| i.entry.is_success()) {
            debug!(from = ?item.entry.data_type, to = %dt, "Changed data_type");
            item.entry.data_type = Some(dt.clone());
        }
        Ok(items)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// audit
// ═══════════════════════════════════════════════════════════════════════

/// Writes every final entry to `file`.
pub struct Audit {
    info: HookInfo,
    file: PathBuf,
    format: Format,
}

impl Builtin for Audit {
    fn describe() -> HookInfo {
        HookInfo::new("audit", "Save a run summary to a file", Stage::Post, "metadata")
            .option("file", "audit.json", "Output path")
            .option("format", "json", "json, csv or text")
    }

    fn build(info: HookInfo, args: &HookArgs) -> Result<Self> {
        let format = Format::parse(
            &args.str_or("format", "json"),
            &[Format::Json, Format::Csv, Format::Text],
        )?;
        Ok(Self {
            info,
            file: PathBuf::from(args.str_or("file", "audit.json")),
            format,
        })
    }
}

impl Audit {
    fn render(&self, items: &[Item]) -> Result<String> {
        match self.format {
            Format::Text => Ok(items
                .iter()
                .map(|i| {
                    let status = if i.entry.is_success() { "OK" } else { "FAIL" };
                    let dst = i
                        .entry
                        .dst_fn
                        .as_deref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default();
                    format!("[{status}] {dst} < {}\n", i.entry.url)
                })
                .collect()),
            Format::Json | Format::Csv => {
                let rows: Vec<Map<String, Value>> = items
                    .iter()
                    .map(|i| match serde_json::to_value(&i.entry) {
                        Ok(Value::Object(map)) => Ok(map),
                        Ok(_) => Ok(Map::new()),
                        Err(e) => Err(e),
                    })
                    .collect::<std::result::Result<_, _>>()?;
                if self.format == Format::Json {
                    return Ok(serde_json::to_string_pretty(&rows)?);
                }
                let headers: Vec<String> = rows
                    .iter()
                    .flat_map(|r| r.keys().cloned())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                to_csv(&headers, &rows)
            }
        }
    }
}

impl Hook for Audit {
    fn info(&self) -> &HookInfo {
        &self.info
    }

    fn run(&self, items: Vec<Item>) -> Result<Vec<Item>> {
        if items.is_empty() {
            return Ok(items);
        }
        let written = self
            .render(&items)
            .and_then(|body| std::fs::write(&self.file, body).map_err(anyhow::Error::from));
        match written {
            Ok(()) => emit([format!("Audit log written to {}", self.file.display())]),
            Err(e) => error!(file = %self.file.display(), error = %format!("{e:#}"), "Failed to write audit log"),
        }
        Ok(items)
    }
}
