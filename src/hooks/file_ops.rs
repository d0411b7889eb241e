//! File-operation hooks: `flatten`, `rename`, `filename_filter`, `unzip`,
//! `exec`.
//!
//! `flatten` and `rename` only rewrite `dst_fn` before anything is
//! transferred. The others act on finished downloads and touch the disk.

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use regex::Regex;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use tracing::{debug, error, info, warn};

use super::registry::{Builtin, HookRegistry};
use super::{Hook, HookArgs, HookInfo, Stage};
use crate::ingest::absolute;
use crate::models::Item;

pub(crate) fn register(registry: &mut HookRegistry) {
    registry.register_builtin::<Flatten>();
    registry.register_builtin::<Rename>();
    registry.register_builtin::<FilenameFilter>();
    registry.register_builtin::<Unzip>();
    registry.register_builtin::<Exec>();
}

// ═══════════════════════════════════════════════════════════════════════
// flatten
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlattenMode {
    /// `<connector outdir>/<file>`
    Module,
    /// `<base outdir>/<file>`
    Root,
    /// `./<file>`
    Cwd,
}

pub struct Flatten {
    info: HookInfo,
    mode: FlattenMode,
}

impl Builtin for Flatten {
    fn describe() -> HookInfo {
        HookInfo::new("flatten", "Flatten the output directory structure", Stage::Pre, "file-op")
            .option("mode", "module", "module, root or cwd")
    }

    fn build(info: HookInfo, args: &HookArgs) -> Result<Self> {
        let mode = match args.str_or("mode", "module").to_ascii_lowercase().as_str() {
            "module" => FlattenMode::Module,
            "root" => FlattenMode::Root,
            "cwd" => FlattenMode::Cwd,
            other => bail!("unknown flatten mode '{other}' (use module, root or cwd)"),
        };
        Ok(Self { info, mode })
    }
}

impl Hook for Flatten {
    fn info(&self) -> &HookInfo {
        &self.info
    }

    fn run(&self, mut items: Vec<Item>) -> Result<Vec<Item>> {
        for item in &mut items {
            let Some(name) = item.entry.dst_fn.as_deref().and_then(Path::file_name) else {
                continue;
            };
            let dir = match self.mode {
                FlattenMode::Module => item.connector.outdir().to_path_buf(),
                FlattenMode::Root => item.connector.base_outdir(),
                FlattenMode::Cwd => std::env::current_dir().context("No working directory")?,
            };
            let flat = dir.join(name);
            item.entry.dst_fn = Some(flat);
        }
        Ok(items)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// rename
// ═══════════════════════════════════════════════════════════════════════

/// Regex substitution on the destination basename.
pub struct Rename {
    info: HookInfo,
    pattern: Option<Regex>,
    replace: String,
}

impl Builtin for Rename {
    fn describe() -> HookInfo {
        HookInfo::new("rename", "Rename files with a regex before download", Stage::Pre, "file-op")
            .option("match", "", "Regex matched against the file name")
            .option("replace", "", "Replacement; \\1 and ${1} both refer to groups")
    }

    fn build(info: HookInfo, args: &HookArgs) -> Result<Self> {
        let pattern = args
            .str("match")
            .map(|p| Regex::new(&p).with_context(|| format!("Invalid rename pattern {p:?}")))
            .transpose()?;
        Ok(Self {
            info,
            pattern,
            replace: backrefs_to_dollar(&args.str_or("replace", "")),
        })
    }
}

/// `\1` → `${1}`
fn backrefs_to_dollar(replace: &str) -> String {
    let mut out = String::with_capacity(replace.len());
    let mut chars = replace.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek().is_some_and(|n| n.is_ascii_digit()) {
            out.push_str("${");
            while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                out.push(d);
                chars.next();
            }
            out.push('}');
        } else {
            out.push(c);
        }
    }
    out
}

impl Hook for Rename {
    fn info(&self) -> &HookInfo {
        &self.info
    }

    fn run(&self, mut items: Vec<Item>) -> Result<Vec<Item>> {
        let Some(pattern) = &self.pattern else {
            return Ok(items);
        };
        for item in &mut items {
            let Some(dst) = item.entry.dst_fn.as_deref() else {
                continue;
            };
            let Some(base) = dst.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            let renamed = pattern.replace_all(&base, self.replace.as_str());
            if *renamed != *base {
                debug!(from = %base, to = %renamed, "Renamed");
                item.entry.dst_fn = Some(dst.with_file_name(&*renamed));
            }
        }
        Ok(items)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// filename_filter
// ═══════════════════════════════════════════════════════════════════════

enum NameTest {
    Contains(String),
    Pattern(Regex),
}

impl NameTest {
    fn new(s: String, regex: bool) -> Result<Self> {
        if regex {
            Ok(NameTest::Pattern(
                Regex::new(&s).with_context(|| format!("Invalid filter pattern {s:?}"))?,
            ))
        } else {
            Ok(NameTest::Contains(s))
        }
    }

    fn is_match(&self, name: &str) -> bool {
        match self {
            NameTest::Contains(s) => name.contains(s.as_str()),
            NameTest::Pattern(re) => re.is_match(name),
        }
    }
}

pub struct FilenameFilter {
    info: HookInfo,
    keep: Option<NameTest>,
    drop: Option<NameTest>,
}

impl Builtin for FilenameFilter {
    fn describe() -> HookInfo {
        HookInfo::new("filename_filter", "Filter results by file name", Stage::File, "pipeline")
            .option("match", "", "Keep only names containing this")
            .option("exclude", "", "Drop names containing this")
            .option("regex", false, "Treat match/exclude as regular expressions")
            .option("stage", "file", "Stage to run in (pre, file or post)")
    }

    fn build(mut info: HookInfo, args: &HookArgs) -> Result<Self> {
        info.stage = args.stage_or(info.stage)?;
        let regex = args.bool_or("regex", false);
        Ok(Self {
            info,
            keep: args.str("match").map(|s| NameTest::new(s, regex)).transpose()?,
            drop: args.str("exclude").map(|s| NameTest::new(s, regex)).transpose()?,
        })
    }
}

impl Hook for FilenameFilter {
    fn info(&self) -> &HookInfo {
        &self.info
    }

    fn run(&self, items: Vec<Item>) -> Result<Vec<Item>> {
        let before = items.len();
        let kept: Vec<Item> = items
            .into_iter()
            .filter(|item| {
                let name = item.entry.file_name();
                self.keep.as_ref().map_or(true, |t| t.is_match(&name))
                    && !self.drop.as_ref().is_some_and(|t| t.is_match(&name))
            })
            .collect();
        debug!(kept = kept.len(), dropped = before - kept.len(), "Filtered by file name");
        Ok(kept)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// unzip
// ═══════════════════════════════════════════════════════════════════════

/// Extracts archive downloads next to the archive.
///
/// Handles `.zip`, `.tar`, `.tar.gz`/`.tgz` and single-file `.gz`. One input
/// entry becomes one entry per extracted file. With `overwrite=false` an
/// archive whose outputs all exist already is not re-extracted, but the
/// entries are still produced. Members with absolute paths or `..` are
/// skipped.
pub struct Unzip {
    info: HookInfo,
    overwrite: bool,
    remove: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
    Gz,
}

impl ArchiveKind {
    fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if name.ends_with(".tar") {
            Some(ArchiveKind::Tar)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else if name.ends_with(".gz") {
            Some(ArchiveKind::Gz)
        } else {
            None
        }
    }
}

enum Extraction {
    Fresh(Vec<PathBuf>),
    Existing(Vec<PathBuf>),
}

impl Builtin for Unzip {
    fn describe() -> HookInfo {
        HookInfo::new(
            "unzip",
            "Extract .zip, .tar, .tar.gz and .gz downloads",
            Stage::File,
            "file-op",
        )
        .option("overwrite", false, "Re-extract even when outputs exist")
        .option("remove", false, "Delete the archive after extraction")
    }

    fn build(info: HookInfo, args: &HookArgs) -> Result<Self> {
        Ok(Self {
            info,
            overwrite: args.bool_or("overwrite", false),
            remove: args.bool_or("remove", false),
        })
    }
}

/// `rel` as a relative path that stays inside the extraction directory.
fn enclosed(rel: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for part in rel.components() {
        match part {
            Component::Normal(p) => out.push(p),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

fn open_tar(archive: &Path, gz: bool) -> Result<tar::Archive<Box<dyn Read>>> {
    let file = File::open(archive).with_context(|| format!("Failed to open {}", archive.display()))?;
    let reader: Box<dyn Read> = if gz {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(tar::Archive::new(reader))
}

fn create_parent(out: &Path) -> Result<()> {
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(())
}

impl Unzip {
    /// Extract `archive` into its directory, returning output paths.
    fn extract(&self, archive: &Path, kind: ArchiveKind) -> Result<Vec<PathBuf>> {
        let dir = archive.parent().map(Path::to_path_buf).unwrap_or_default();
        let extraction = match kind {
            ArchiveKind::Zip => self.extract_zip(archive, &dir)?,
            ArchiveKind::Tar => self.extract_tar(archive, &dir, false)?,
            ArchiveKind::TarGz => self.extract_tar(archive, &dir, true)?,
            ArchiveKind::Gz => self.gunzip(archive)?,
        };

        match extraction {
            Extraction::Existing(paths) => {
                debug!(archive = %archive.display(), "Outputs exist, skipping extraction");
                Ok(paths)
            }
            Extraction::Fresh(paths) => {
                info!(archive = %archive.display(), files = paths.len(), "Extracted");
                if self.remove {
                    if let Err(e) = std::fs::remove_file(archive) {
                        warn!(archive = %archive.display(), error = %e, "Failed to remove archive");
                    }
                }
                Ok(paths)
            }
        }
    }

    fn extract_zip(&self, archive: &Path, dir: &Path) -> Result<Extraction> {
        let file = File::open(archive).with_context(|| format!("Failed to open {}", archive.display()))?;
        let mut zip = zip::ZipArchive::new(file)
            .with_context(|| format!("Not a zip archive: {}", archive.display()))?;

        let mut members = Vec::new();
        for i in 0..zip.len() {
            let member = zip.by_index(i)?;
            if member.is_dir() {
                continue;
            }
            match member.enclosed_name() {
                Some(rel) => members.push((i, dir.join(rel))),
                None => warn!(archive = %archive.display(), member = %member.name(), "Skipping unsafe member path"),
            }
        }
        let paths = members.iter().map(|(_, p)| p.clone()).collect();
        if !self.overwrite && members.iter().all(|(_, p)| p.exists()) {
            return Ok(Extraction::Existing(paths));
        }

        for (i, out) in &members {
            create_parent(out)?;
            let mut member = zip.by_index(*i)?;
            let mut target =
                File::create(out).with_context(|| format!("Failed to create {}", out.display()))?;
            std::io::copy(&mut member, &mut target)?;
        }
        Ok(Extraction::Fresh(paths))
    }

    /// Tar streams cannot seek, so members are listed in one pass and
    /// unpacked in a second.
    fn extract_tar(&self, archive: &Path, dir: &Path, gz: bool) -> Result<Extraction> {
        let mut paths = Vec::new();
        let mut listing = open_tar(archive, gz)?;
        for entry in listing.entries()? {
            let entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let raw = entry.path()?.into_owned();
            match enclosed(&raw) {
                Some(rel) => paths.push(dir.join(rel)),
                None => warn!(archive = %archive.display(), member = %raw.display(), "Skipping unsafe member path"),
            }
        }
        if !self.overwrite && paths.iter().all(|p| p.exists()) {
            return Ok(Extraction::Existing(paths));
        }

        let mut unpacking = open_tar(archive, gz)?;
        for entry in unpacking.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let Some(rel) = enclosed(&entry.path()?) else {
                continue;
            };
            let out = dir.join(rel);
            create_parent(&out)?;
            entry
                .unpack(&out)
                .with_context(|| format!("Failed to write {}", out.display()))?;
        }
        Ok(Extraction::Fresh(paths))
    }

    /// `name.ext.gz` decompresses to `name.ext` beside it.
    fn gunzip(&self, archive: &Path) -> Result<Extraction> {
        let out = archive.with_extension("");
        if !self.overwrite && out.exists() {
            return Ok(Extraction::Existing(vec![out]));
        }
        let file = File::open(archive).with_context(|| format!("Failed to open {}", archive.display()))?;
        let mut target =
            File::create(&out).with_context(|| format!("Failed to create {}", out.display()))?;
        std::io::copy(&mut GzDecoder::new(file), &mut target)
            .with_context(|| format!("Not a gzip file: {}", archive.display()))?;
        Ok(Extraction::Fresh(vec![out]))
    }
}

impl Hook for Unzip {
    fn info(&self) -> &HookInfo {
        &self.info
    }

    fn run(&self, items: Vec<Item>) -> Result<Vec<Item>> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let target = match item.entry.dst_fn.as_deref() {
                Some(p) if item.entry.is_success() => {
                    ArchiveKind::detect(p).map(|kind| (p.to_path_buf(), kind))
                }
                _ => None,
            };
            let Some((archive, kind)) = target else {
                out.push(item);
                continue;
            };

            match self.extract(&archive, kind) {
                Ok(paths) => {
                    let mut base = item.entry.clone();
                    for p in &paths {
                        base.artifacts.record(&self.info.name, p);
                    }
                    for p in paths {
                        let mut derived = base.clone();
                        derived.dst_fn = Some(p);
                        derived.status = Some(0);
                        derived.src_fn = Some(archive.clone());
                        out.push(item.derive(derived));
                    }
                }
                Err(e) => {
                    error!(archive = %archive.display(), error = %format!("{e:#}"), "Unzip failed");
                    out.push(item);
                }
            }
        }
        Ok(out)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// exec
// ═══════════════════════════════════════════════════════════════════════

/// Runs a command for every successful download.
///
/// | Placeholder | Value |
/// |-------------|-------|
/// | `{file}` | absolute path |
/// | `{url}` | source URL |
/// | `{dir}` | containing directory |
/// | `{filename}` | basename |
/// | `{name}` | basename without extension |
pub struct Exec {
    info: HookInfo,
    template: Option<String>,
}

impl Builtin for Exec {
    fn describe() -> HookInfo {
        HookInfo::new("exec", "Run a command on each file", Stage::File, "file-op")
            .option("cmd", "", "Command template, e.g. \"gdalinfo {file}\"")
    }

    fn build(info: HookInfo, args: &HookArgs) -> Result<Self> {
        Ok(Self {
            info,
            template: args.str("cmd"),
        })
    }
}

impl Exec {
    fn render(template: &str, file: &Path, url: &str) -> String {
        let dir = file.parent().map(|d| d.display().to_string()).unwrap_or_default();
        let filename = file.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        let stem = file.file_stem().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        template
            .replace("{file}", &file.display().to_string())
            .replace("{url}", url)
            .replace("{dir}", &dir)
            .replace("{filename}", &filename)
            .replace("{name}", &stem)
    }
}

impl Hook for Exec {
    fn info(&self) -> &HookInfo {
        &self.info
    }

    fn run(&self, items: Vec<Item>) -> Result<Vec<Item>> {
        let Some(template) = &self.template else {
            return Ok(items);
        };
        for item in items.iter().filter(|i| i.entry.is_success()) {
            let Some(dst) = item.entry.dst_fn.as_deref() else {
                continue;
            };
            let command = Exec::render(template, &absolute(dst), &item.entry.url);
            let argv = split_command(&command);
            let Some((program, rest)) = argv.split_first() else {
                continue;
            };
            info!(command = %command, "Exec");
            match Command::new(program).args(rest).status() {
                Ok(status) if status.success() => {}
                Ok(status) => error!(command = %command, %status, "Exec command failed"),
                Err(e) => error!(command = %command, error = %e, "Exec command could not start"),
            }
        }
        Ok(items)
    }
}

/// Whitespace split honouring single quotes, double quotes and backslash
/// escapes.
fn split_command(s: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') => {
                if let Some(n) = chars.next() {
                    current.push(n);
                }
            }
            (Some(_), c) => current.push(c),
            (None, '"' | '\'') => {
                quote = Some(c);
                in_word = true;
            }
            (None, '\\') => {
                if let Some(n) = chars.next() {
                    current.push(n);
                    in_word = true;
                }
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Entry;
    use crate::traits::testing::StubConnector;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn build<T: Builtin>(args: HookArgs) -> T {
        T::build(T::describe(), &args).unwrap()
    }

    fn done(path: &Path) -> Entry {
        let mut e = Entry::new(format!("http://h/{}", path.file_name().unwrap().to_string_lossy()))
            .with_dst(path);
        e.status = Some(0);
        e
    }

    fn tar_bytes(members: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, body) in members {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            builder.append_data(&mut header, name, body.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn gzip(path: &Path, bytes: &[u8]) {
        let mut gz = GzEncoder::new(File::create(path).unwrap(), Compression::default());
        gz.write_all(bytes).unwrap();
        gz.finish().unwrap();
    }

    fn write_zip(path: &Path, members: &[(&str, &str)]) {
        let mut zw = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, body) in members {
            zw.start_file(*name, SimpleFileOptions::default()).unwrap();
            zw.write_all(body.as_bytes()).unwrap();
        }
        zw.finish().unwrap();
    }

    #[test]
    fn flatten_modes() {
        let c = StubConnector::new("m", "/out/m").arc();
        let item = Item::new(c, Entry::new("u").with_dst("/out/m/a/b/c.tif"));

        let out = build::<Flatten>(HookArgs::new()).run(vec![item.clone()]).unwrap();
        assert_eq!(out[0].entry.dst_fn, Some(PathBuf::from("/out/m/c.tif")));

        let out = build::<Flatten>(HookArgs::new().with("mode", "root")).run(vec![item]).unwrap();
        assert_eq!(out[0].entry.dst_fn, Some(PathBuf::from("/out/c.tif")));

        assert!(Flatten::build(Flatten::describe(), &HookArgs::new().with("mode", "up")).is_err());
    }

    #[test]
    fn rename_with_backrefs() {
        let c = StubConnector::new("m", "/o").arc();
        let item = Item::new(c, Entry::new("u").with_dst("/o/export_42.xyz"));
        let hook = build::<Rename>(
            HookArgs::new().with("match", r"export_(\d+)").with("replace", r"site_\1"),
        );
        let out = hook.run(vec![item]).unwrap();
        assert_eq!(out[0].entry.dst_fn, Some(PathBuf::from("/o/site_42.xyz")));
        assert_eq!(backrefs_to_dollar(r"a\12b\x"), r"a${12}b\x");
    }

    #[test]
    fn filename_filter_match_and_exclude() {
        let c = StubConnector::new("m", "/o").arc();
        let items: Vec<Item> = ["a.tif", "a.tif.aux", "b.laz"]
            .iter()
            .map(|n| Item::new(c.clone(), Entry::new("u").with_dst(format!("/o/{n}"))))
            .collect();

        let hook = build::<FilenameFilter>(HookArgs::new().with("match", ".tif").with("exclude", "aux"));
        let out = hook.run(items.clone()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].entry.file_name(), "a.tif");

        let hook = build::<FilenameFilter>(
            HookArgs::new().with("match", r"\.la[sz]$").with("regex", "true").with("stage", "pre"),
        );
        assert_eq!(hook.stage(), Stage::Pre);
        assert_eq!(hook.run(items).unwrap().len(), 1);
    }

    #[test]
    fn unzip_expands_archive_into_members() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("pack.zip");
        write_zip(&archive, &[("a.txt", "A"), ("sub/b.txt", "B")]);

        let c = StubConnector::new("m", tmp.path()).arc();
        let out = build::<Unzip>(HookArgs::new())
            .run(vec![Item::new(c, done(&archive))])
            .unwrap();

        assert_eq!(out.len(), 2);
        let a = tmp.path().join("a.txt");
        let b = tmp.path().join("sub").join("b.txt");
        assert_eq!(out[0].entry.dst_fn.as_deref(), Some(a.as_path()));
        assert_eq!(out[1].entry.dst_fn.as_deref(), Some(b.as_path()));
        assert_eq!(out[0].entry.src_fn.as_deref(), Some(archive.as_path()));
        assert_eq!(out[0].entry.artifacts.get("unzip").len(), 2);
        assert_eq!(std::fs::read_to_string(&b).unwrap(), "B");
        assert!(archive.exists());
    }

    #[test]
    fn unzip_skips_existing_members_but_yields_entries() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("pack.zip");
        write_zip(&archive, &[("a.txt", "new"), ("b.txt", "new")]);
        std::fs::write(tmp.path().join("a.txt"), "old").unwrap();
        std::fs::write(tmp.path().join("b.txt"), "old").unwrap();

        let c = StubConnector::new("m", tmp.path()).arc();
        let out = build::<Unzip>(HookArgs::new())
            .run(vec![Item::new(c, done(&archive))])
            .unwrap();

        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|i| i.entry.is_success()));
        assert_eq!(std::fs::read_to_string(tmp.path().join("a.txt")).unwrap(), "old");
    }

    #[test]
    fn unzip_remove_and_bad_archive() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("pack.zip");
        write_zip(&archive, &[("a.txt", "A")]);
        let bogus = tmp.path().join("bogus.zip");
        std::fs::write(&bogus, "not a zip").unwrap();

        let c = StubConnector::new("m", tmp.path()).arc();
        let hook = build::<Unzip>(HookArgs::new().with("remove", true));
        let out = hook
            .run(vec![Item::new(c.clone(), done(&archive)), Item::new(c, done(&bogus))])
            .unwrap();

        assert_eq!(out.len(), 2);
        assert!(!archive.exists());
        assert_eq!(out[1].entry.dst_fn.as_deref(), Some(bogus.as_path()));
    }

    #[test]
    fn unzip_extracts_tar_and_tgz() {
        let tmp = TempDir::new().unwrap();
        let members = [("a.txt", "A"), ("sub/b.txt", "B")];
        let plain_dir = tmp.path().join("plain");
        let gz_dir = tmp.path().join("gz");
        std::fs::create_dir_all(&plain_dir).unwrap();
        std::fs::create_dir_all(&gz_dir).unwrap();
        let tarball = plain_dir.join("pack.tar");
        std::fs::write(&tarball, tar_bytes(&members)).unwrap();
        let tgz = gz_dir.join("pack.tgz");
        gzip(&tgz, &tar_bytes(&members));

        let c = StubConnector::new("m", tmp.path()).arc();
        let out = build::<Unzip>(HookArgs::new())
            .run(vec![Item::new(c.clone(), done(&tarball)), Item::new(c, done(&tgz))])
            .unwrap();

        assert_eq!(out.len(), 4);
        for (dir, archive, pair) in [(&plain_dir, &tarball, &out[..2]), (&gz_dir, &tgz, &out[2..])] {
            assert_eq!(pair[0].entry.dst_fn.as_deref(), Some(dir.join("a.txt").as_path()));
            assert_eq!(pair[1].entry.dst_fn.as_deref(), Some(dir.join("sub").join("b.txt").as_path()));
            assert_eq!(pair[0].entry.src_fn.as_deref(), Some(archive.as_path()));
            assert_eq!(pair[1].entry.artifacts.get("unzip").len(), 2);
            assert_eq!(std::fs::read_to_string(dir.join("sub").join("b.txt")).unwrap(), "B");
        }
    }

    #[test]
    fn unzip_gunzips_single_files() {
        let tmp = TempDir::new().unwrap();
        let gz = tmp.path().join("survey.xyz.gz");
        gzip(&gz, b"1 2 3\n");

        let c = StubConnector::new("m", tmp.path()).arc();
        let hook = build::<Unzip>(HookArgs::new());
        let out = hook.run(vec![Item::new(c.clone(), done(&gz))]).unwrap();

        let xyz = tmp.path().join("survey.xyz");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].entry.dst_fn.as_deref(), Some(xyz.as_path()));
        assert_eq!(out[0].entry.src_fn.as_deref(), Some(gz.as_path()));
        assert_eq!(out[0].entry.artifacts.get("unzip"), &[xyz.clone()]);
        assert_eq!(std::fs::read_to_string(&xyz).unwrap(), "1 2 3\n");

        // existing output is left alone without overwrite
        std::fs::write(&xyz, "edited").unwrap();
        let out = hook.run(vec![Item::new(c, done(&gz))]).unwrap();
        assert_eq!(out[0].entry.dst_fn.as_deref(), Some(xyz.as_path()));
        assert_eq!(std::fs::read_to_string(&xyz).unwrap(), "edited");
    }

    #[test]
    fn unzip_skips_tar_members_escaping_the_directory() {
        let tmp = TempDir::new().unwrap();
        let inner = tmp.path().join("inner");
        std::fs::create_dir_all(&inner).unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        let mut evil = tar::Header::new_gnu();
        let name = b"../evil.txt";
        evil.as_old_mut().name[..name.len()].copy_from_slice(name);
        evil.set_size(4);
        evil.set_mode(0o644);
        evil.set_entry_type(tar::EntryType::Regular);
        evil.set_cksum();
        builder.append(&evil, &b"evil"[..]).unwrap();
        let mut ok = tar::Header::new_gnu();
        ok.set_size(2);
        ok.set_mode(0o644);
        builder.append_data(&mut ok, "ok.txt", &b"ok"[..]).unwrap();
        let archive = inner.join("mixed.tar");
        std::fs::write(&archive, builder.into_inner().unwrap()).unwrap();

        let c = StubConnector::new("m", tmp.path()).arc();
        let out = build::<Unzip>(HookArgs::new())
            .run(vec![Item::new(c, done(&archive))])
            .unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].entry.dst_fn.as_deref(), Some(inner.join("ok.txt").as_path()));
        assert!(!tmp.path().join("evil.txt").exists());
        assert_eq!(enclosed(Path::new("/etc/passwd")), None);
        assert_eq!(enclosed(Path::new("./a/b")), Some(PathBuf::from("a/b")));
    }

    #[test]
    fn exec_template_and_split() {
        let cmd = Exec::render("echo {filename} {name} {dir} {url}", Path::new("/d/x.tif"), "http://h/x");
        assert_eq!(cmd, "echo x.tif x /d http://h/x");
        assert_eq!(
            split_command(r#"gdal_translate -co "A B" 'c d' e\ f"#),
            vec!["gdal_translate", "-co", "A B", "c d", "e f"]
        );
        assert_eq!(split_command("  "), Vec::<String>::new());
    }

    #[cfg(unix)]
    #[test]
    fn exec_runs_command() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("x.txt");
        std::fs::write(&file, "x").unwrap();
        let marker = tmp.path().join("x.done");

        let c = StubConnector::new("m", tmp.path()).arc();
        let hook = build::<Exec>(HookArgs::new().with("cmd", "touch {dir}/{name}.done"));
        let out = hook.run(vec![Item::new(c, done(&file))]).unwrap();
        assert_eq!(out.len(), 1);
        assert!(marker.exists());
    }
}
