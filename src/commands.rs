//! Command implementations behind the `fetchez` binary.
//!
//! Each `run_*` function takes the loaded [`Config`] plus already-parsed
//! arguments, prints human-facing output to stdout, and logs the rest.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::connector_local::{LocalIndexConnector, LocalMode};
use crate::hooks::{emit, parse_hook_spec, Hook, HookRegistry, Origin};
use crate::index::SurveyIndex;
use crate::pipeline::{collect_entries, Pipeline, RunSummary};
use crate::presets::{init_presets, PresetCatalog};
use crate::scan::ScanOptions;
use crate::spatial::Region;
use crate::traits::ConnectorRegistry;
use crate::transport_fs::LocalTransport;

/// `index ingest`
pub fn run_ingest(
    config: &Config,
    name: &str,
    source: &Path,
    field_map: &[(String, String)],
    wipe: bool,
    local: bool,
) -> Result<()> {
    let mut index = SurveyIndex::open(name, local, config);
    let map: BTreeMap<String, String> = field_map.iter().cloned().collect();
    let report = index.ingest(source, &map, wipe);
    println!(
        "{}: added {}, skipped {} ({} total) -> {}",
        index.name(),
        report.added,
        report.skipped,
        index.len(),
        index.path().display()
    );
    Ok(())
}

/// `index scan`
pub fn run_scan(
    config: &Config,
    name: &str,
    dir: &Path,
    extensions: Vec<String>,
    recursive: bool,
    exclude: Vec<String>,
    local: bool,
) -> Result<()> {
    if !dir.is_dir() {
        bail!("Not a directory: {}", dir.display());
    }
    let mut options = ScanOptions {
        recursive,
        exclude,
        ..ScanOptions::default()
    };
    if !extensions.is_empty() {
        options.extensions = extensions;
    }

    let mut index = SurveyIndex::open(name, local, config);
    let report = index.scan(dir, &options);
    println!(
        "{}: indexed {}, skipped {} -> {}",
        index.name(),
        report.indexed,
        report.skipped,
        index.path().display()
    );
    Ok(())
}

/// `index search`: one JSON object per hit.
pub fn run_search(
    config: &Config,
    name: &str,
    region: Option<&str>,
    clauses: &[String],
    layer: Option<&str>,
    local: bool,
) -> Result<()> {
    let region = region.map(str::parse::<Region>).transpose()?;
    let index = SurveyIndex::open(name, local, config);
    if index.is_empty() {
        warn!(index = %name, path = %index.path().display(), "Index is empty");
    }
    let hits = index.search(region.as_ref(), clauses, layer);
    for props in &hits {
        println!("{}", serde_json::to_string(props)?);
    }
    info!(index = %name, hits = hits.len(), "Search complete");
    Ok(())
}

/// `hooks list`
pub fn list_hooks(registry: &HookRegistry) {
    println!("{:<16} {:<6} {:<10} {:<12} DESCRIPTION", "NAME", "STAGE", "CATEGORY", "ORIGIN");
    for reg in registry.iter() {
        let origin = match &reg.origin {
            Origin::Script(_) => "script",
            Origin::Builtin => "builtin",
            Origin::Custom => "custom",
        };
        println!(
            "{:<16} {:<6} {:<10} {:<12} {}",
            reg.info.name, reg.info.stage, reg.info.category, origin, reg.info.desc
        );
        if let Origin::Script(path) = &reg.origin {
            println!("{:<16}   ({})", "", path.display());
        }
        for opt in &reg.info.options {
            let help = if opt.help.is_empty() { String::new() } else { format!("  {}", opt.help) };
            println!("{:<16}   {}={}{}", "", opt.name, opt.default, help);
        }
    }
}

/// `presets list`
pub fn list_presets(config: &Config, connector: Option<&str>) {
    let catalog = PresetCatalog::from_config(config);
    let available = catalog.available(connector);
    if available.is_empty() {
        println!("No presets. Run `fetchez presets init` to create the defaults.");
        return;
    }
    for (name, preset) in &available {
        let hooks: Vec<&str> = preset.hooks.iter().map(|h| h.name.as_str()).collect();
        println!("{name:<20} {}", preset.help);
        println!("{:<20} hooks: {}", "", hooks.join(", "));
    }
}

/// `presets init`
pub fn run_init_presets(path: &Path) -> Result<()> {
    if init_presets(path)? {
        println!("Wrote default presets to {}", path.display());
    } else {
        println!("{} already exists", path.display());
    }
    Ok(())
}

/// Arguments of the `local` command.
#[derive(Debug, Clone, Default)]
pub struct LocalRun {
    pub index: String,
    pub region: Option<String>,
    pub clauses: Vec<String>,
    pub layer: Option<String>,
    pub mode: LocalMode,
    pub outdir: PathBuf,
    pub hooks: Vec<String>,
    pub presets: Vec<String>,
    pub workers: Option<usize>,
    pub local_index: bool,
}

/// Presets first, then `--hook` specs, in command-line order.
pub fn resolve_hooks(
    registry: &HookRegistry,
    catalog: &PresetCatalog,
    connector: &str,
    presets: &[String],
    specs: &[String],
) -> Result<Vec<Box<dyn Hook>>> {
    let mut hooks = Vec::new();
    for name in presets {
        match catalog.compose(name, Some(connector), registry) {
            Some(composed) => hooks.extend(composed),
            None => bail!("Unknown preset '{name}'"),
        }
    }
    for spec in specs {
        let (name, args) = parse_hook_spec(spec)?;
        hooks.push(registry.create(&name, &args)?);
    }
    Ok(hooks)
}

/// `local`: run the local-index connector through the full pipeline.
pub async fn run_local(config: &Config, run: LocalRun) -> Result<RunSummary> {
    let region = run
        .region
        .as_deref()
        .map(str::parse::<Region>)
        .transpose()
        .context("Invalid region")?;

    let index = SurveyIndex::open(&run.index, run.local_index, config);
    let connector = LocalIndexConnector::new(index, run.outdir.join("local"))
        .with_region(region)
        .with_where(run.clauses)
        .with_layer(run.layer)
        .with_mode(run.mode);

    let mut connectors = ConnectorRegistry::new();
    connectors.register(Arc::new(connector));

    let registry = HookRegistry::discover(config);
    let catalog = PresetCatalog::from_config(config);
    let hooks = resolve_hooks(&registry, &catalog, "local", &run.presets, &run.hooks)?;

    let pipeline = Pipeline::new(hooks)
        .with_policy(config.pipeline.on_hook_error)
        .with_workers(run.workers.unwrap_or(config.pipeline.workers));

    let items = collect_entries(&connectors).await;
    info!(entries = items.len(), "Enumerated local index");
    let summary = pipeline.run(items, Arc::new(LocalTransport)).await?;
    emit([format!(
        "queued {}, transferred {}, succeeded {}, failed {}",
        summary.queued, summary.transferred, summary.succeeded, summary.failed
    )]);
    Ok(summary)
}
