//! Named hook macros.
//!
//! A preset expands into an ordered list of hook instances. Presets come
//! from two places, plugin registration and the user config, and exist
//! either globally or scoped to one connector. [`PresetCatalog::available`]
//! merges them, later layers winning on name collisions:
//!
//! ```text
//! plugin globals → user globals → plugin scoped → user scoped
//! ```

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

use crate::config::{Config, HookCall, ModuleConfig, PresetDef};
use crate::hooks::{Hook, HookArgs, HookRegistry};

#[derive(Debug, Clone, Default)]
pub struct PresetCatalog {
    plugin_global: BTreeMap<String, PresetDef>,
    plugin_scoped: BTreeMap<String, BTreeMap<String, PresetDef>>,
    user_global: BTreeMap<String, PresetDef>,
    user_scoped: BTreeMap<String, BTreeMap<String, PresetDef>>,
}

impl PresetCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog seeded with the user config's `presets` and `modules`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            user_global: config.presets.clone(),
            user_scoped: config
                .modules
                .iter()
                .map(|(name, module)| (name.clone(), module.presets.clone()))
                .collect(),
            ..Self::default()
        }
    }

    pub fn register_global(&mut self, name: &str, preset: PresetDef) {
        self.plugin_global.insert(name.to_string(), preset);
    }

    pub fn register_scoped(&mut self, connector: &str, name: &str, preset: PresetDef) {
        self.plugin_scoped
            .entry(connector.to_string())
            .or_default()
            .insert(name.to_string(), preset);
    }

    /// Every preset usable for `connector` (or globally when `None`).
    pub fn available(&self, connector: Option<&str>) -> BTreeMap<String, PresetDef> {
        let mut merged = self.plugin_global.clone();
        merged.extend(self.user_global.clone());
        if let Some(connector) = connector {
            for layer in [&self.plugin_scoped, &self.user_scoped] {
                if let Some(scoped) = layer.get(connector) {
                    merged.extend(scoped.clone());
                }
            }
        }
        merged
    }

    /// Instantiate preset `name`. Returns `None` when no such preset
    /// exists; hooks that are unknown or fail to configure are logged and
    /// left out.
    pub fn compose(
        &self,
        name: &str,
        connector: Option<&str>,
        registry: &HookRegistry,
    ) -> Option<Vec<Box<dyn Hook>>> {
        let available = self.available(connector);
        let Some(preset) = available.get(name) else {
            warn!(preset = %name, "Unknown preset");
            return None;
        };

        let hooks = preset
            .hooks
            .iter()
            .filter_map(|call| {
                if !registry.contains(&call.name) {
                    warn!(preset = %name, hook = %call.name, "Preset references unknown hook, skipped");
                    return None;
                }
                match registry.create(&call.name, &HookArgs::from_map(call.args.clone())) {
                    Ok(hook) => Some(hook),
                    Err(e) => {
                        warn!(preset = %name, hook = %call.name, error = %format!("{e:#}"), "Preset hook failed to configure, skipped");
                        None
                    }
                }
            })
            .collect();
        Some(hooks)
    }
}

/// On-disk shape of the presets file written by [`init_presets`].
#[derive(Debug, Clone, Serialize)]
pub struct PresetFile {
    pub presets: BTreeMap<String, PresetDef>,
    pub modules: BTreeMap<String, ModuleConfig>,
}

/// Starter presets offered to new users.
pub fn default_presets() -> PresetFile {
    let mut presets = BTreeMap::new();
    presets.insert(
        "audit-full".to_string(),
        PresetDef {
            help: "Generate SHA256 hashes, enrichment, and a full JSON audit log.".to_string(),
            hooks: vec![
                HookCall::new("checksum").arg("algo", "sha256"),
                HookCall::new("enrich"),
                HookCall::new("audit").arg("file", "audit_full.json"),
            ],
        },
    );
    presets.insert(
        "clean-download".to_string(),
        PresetDef {
            help: "Unzip files and remove the original archive.".to_string(),
            hooks: vec![HookCall::new("unzip").arg("remove", "true")],
        },
    );

    let mut multibeam = ModuleConfig::default();
    multibeam.presets.insert(
        "inf_only".to_string(),
        PresetDef {
            help: "multibeam only: fetch only .inf files".to_string(),
            hooks: vec![HookCall::new("filename_filter")
                .arg("match", ".inf")
                .arg("stage", "pre")],
        },
    );

    let mut modules = BTreeMap::new();
    modules.insert("multibeam".to_string(), multibeam);
    PresetFile { presets, modules }
}

/// Write [`default_presets`] to `path` as pretty JSON unless it exists.
/// Returns whether a file was written.
pub fn init_presets(path: &Path) -> Result<bool> {
    if path.exists() {
        info!(path = %path.display(), "Presets file already exists, leaving it alone");
        return Ok(false);
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let body = serde_json::to_string_pretty(&default_presets())?;
    std::fs::write(path, body).with_context(|| format!("Failed to write {}", path.display()))?;
    info!(path = %path.display(), "Wrote default presets");
    Ok(true)
}
