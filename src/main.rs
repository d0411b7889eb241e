//! # Fetchez CLI (`fetchez`)
//!
//! The `fetchez` binary drives survey indices and the hook pipeline from the
//! command line.
//!
//! ## Usage
//!
//! ```bash
//! fetchez [--config ~/.fetchez/config.toml] [-v] <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fetchez index ingest <name> <source>` | Load a CSV/TSV/JSON table into an index |
//! | `fetchez index scan <name> <dir>` | Index local raster and lidar files |
//! | `fetchez index search <name>` | Query an index by region, attributes and layer |
//! | `fetchez hooks list` | Show every registered hook |
//! | `fetchez presets list` | Show presets, optionally for one connector |
//! | `fetchez presets init` | Write the default presets file |
//! | `fetchez local <index>` | Run the local index through the hook pipeline |
//!
//! ## Examples
//!
//! ```bash
//! # Build an index from a directory of GeoTIFFs
//! fetchez index scan coast ./tiles --ext tif
//!
//! # Everything inside a region, as JSON lines
//! fetchez index search coast -R -90/-89/29/30
//!
//! # Unpack archives, checksum and print the extracted paths
//! fetchez local coast -R -90/-89/29/30 --mode copy --outdir ./out \
//!     --hook unzip --hook checksum:algo=sha512 --hook focus:target=unzip --hook pipe
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fetchez::commands::{self, LocalRun};
use fetchez::config::{config_dir, load_user_config};
use fetchez::connector_local::LocalMode;
use fetchez::hooks::HookRegistry;

/// Fetchez: survey indices and a staged hook pipeline for geospatial data.
#[derive(Parser)]
#[command(name = "fetchez", version)]
struct Cli {
    /// Configuration file (TOML or JSON).
    ///
    /// Defaults to `$FETCHEZ_HOME/config.toml`, then `presets.json`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and query survey indices.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Inspect registered hooks.
    Hooks {
        #[command(subcommand)]
        action: HooksAction,
    },

    /// Inspect or initialize presets.
    Presets {
        #[command(subcommand)]
        action: PresetsAction,
    },

    /// Run a local index through the pipeline.
    ///
    /// Hooks run in the order given: every `--preset` expansion first, then
    /// each `--hook`. Specs look like `name:key=value,key=value`.
    Local {
        /// Index name.
        index: String,

        /// Region as W/E/S/N.
        #[arg(short = 'R', long, allow_hyphen_values = true)]
        region: Option<String>,

        /// Attribute filter `KEY=VALUE`, repeatable.
        #[arg(long = "where")]
        clauses: Vec<String>,

        /// Restrict to one DataSource.
        #[arg(long)]
        layer: Option<String>,

        /// `reference` points at files in place, `copy` stages them.
        #[arg(long, default_value = "reference")]
        mode: String,

        /// Base output directory.
        #[arg(long, default_value = ".")]
        outdir: PathBuf,

        /// Hook spec, repeatable.
        #[arg(long = "hook")]
        hooks: Vec<String>,

        /// Preset name, repeatable.
        #[arg(long = "preset")]
        presets: Vec<String>,

        /// Transfer workers (overrides `[pipeline] workers`).
        #[arg(long)]
        workers: Option<usize>,

        /// Only look for the index in the current directory.
        #[arg(long)]
        local: bool,
    },
}

#[derive(Subcommand)]
enum IndexAction {
    /// Load records from a .csv, .tsv or .json table.
    Ingest {
        name: String,
        source: PathBuf,

        /// Column rename `SRC=DST`, repeatable.
        #[arg(long = "map", value_parser = parse_key_val)]
        field_map: Vec<(String, String)>,

        /// Start from an empty index.
        #[arg(long)]
        wipe: bool,

        /// Write the index to the current directory.
        #[arg(long)]
        local: bool,
    },

    /// Index raster and lidar files found under a directory.
    Scan {
        name: String,
        dir: PathBuf,

        /// Extension to include, repeatable (defaults cover common rasters and lidar).
        #[arg(long = "ext")]
        extensions: Vec<String>,

        /// Only look at the top level of `dir`.
        #[arg(long)]
        no_recursive: bool,

        /// Glob of relative paths to skip, repeatable.
        #[arg(long)]
        exclude: Vec<String>,

        #[arg(long)]
        local: bool,
    },

    /// Print matching features as JSON lines.
    Search {
        name: String,

        #[arg(short = 'R', long, allow_hyphen_values = true)]
        region: Option<String>,

        #[arg(long = "where")]
        clauses: Vec<String>,

        #[arg(long)]
        layer: Option<String>,

        #[arg(long)]
        local: bool,
    },
}

#[derive(Subcommand)]
enum HooksAction {
    /// List built-in and user hooks.
    List,
}

#[derive(Subcommand)]
enum PresetsAction {
    /// List presets usable globally or by one connector.
    List {
        #[arg(long)]
        connector: Option<String>,
    },
    /// Write the default presets file into the configuration directory.
    Init,
}

/// Parse a `key=value` pair for `--map` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cfg = load_user_config(cli.config.as_deref());

    match cli.command {
        Commands::Index { action } => match action {
            IndexAction::Ingest {
                name,
                source,
                field_map,
                wipe,
                local,
            } => commands::run_ingest(&cfg, &name, &source, &field_map, wipe, local)?,
            IndexAction::Scan {
                name,
                dir,
                extensions,
                no_recursive,
                exclude,
                local,
            } => commands::run_scan(&cfg, &name, &dir, extensions, !no_recursive, exclude, local)?,
            IndexAction::Search {
                name,
                region,
                clauses,
                layer,
                local,
            } => commands::run_search(
                &cfg,
                &name,
                region.as_deref(),
                &clauses,
                layer.as_deref(),
                local,
            )?,
        },
        Commands::Hooks {
            action: HooksAction::List,
        } => commands::list_hooks(&HookRegistry::discover(&cfg)),
        Commands::Presets { action } => match action {
            PresetsAction::List { connector } => commands::list_presets(&cfg, connector.as_deref()),
            PresetsAction::Init => commands::run_init_presets(&config_dir().join("presets.json"))?,
        },
        Commands::Local {
            index,
            region,
            clauses,
            layer,
            mode,
            outdir,
            hooks,
            presets,
            workers,
            local,
        } => {
            let run = LocalRun {
                index,
                region,
                clauses,
                layer,
                mode: mode.parse::<LocalMode>()?,
                outdir,
                hooks,
                presets,
                workers,
                local_index: local,
            };
            commands::run_local(&cfg, run).await?;
        }
    }

    Ok(())
}
