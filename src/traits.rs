//! Extension traits at the edges of the pipeline.
//!
//! The pipeline itself neither enumerates datasets nor moves bytes. Both
//! jobs belong to collaborators plugged in through the traits here:
//!
//! ```text
//! ┌──────────────────┐   enumerate()   ┌──────────┐   fetch()   ┌──────────────┐
//! │ ConnectorRegistry│ ──────────────▶ │ Pipeline │ ──────────▶ │  Transport   │
//! │ local / custom   │   Vec<Entry>    │ pre/file │  per Entry  │ local / HTTP │
//! └──────────────────┘                 │   /post  │             └──────────────┘
//!                                      └──────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use fetchez::traits::ConnectorRegistry;
//!
//! let mut connectors = ConnectorRegistry::new();
//! // connectors.register(Arc::new(MyConnector::new()));
//! assert!(connectors.is_empty());
//! ```

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::models::Entry;

// ═══════════════════════════════════════════════════════════════════════
// Connector Trait
// ═══════════════════════════════════════════════════════════════════════

/// A data source that turns query parameters into candidate downloads.
///
/// # Lifecycle
///
/// 1. The connector is registered via [`ConnectorRegistry::register`].
/// 2. [`enumerate`](Connector::enumerate) is called once per run.
/// 3. Each returned [`Entry`] is paired with the connector and flows
///    through the hook stages.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use anyhow::Result;
/// use std::path::Path;
/// use fetchez::models::Entry;
/// use fetchez::traits::Connector;
///
/// pub struct StaticList {
///     urls: Vec<String>,
/// }
///
/// #[async_trait]
/// impl Connector for StaticList {
///     fn name(&self) -> &str { "static" }
///     fn description(&self) -> &str { "A fixed list of URLs" }
///     fn outdir(&self) -> &Path { Path::new("static") }
///
///     async fn enumerate(&self) -> Result<Vec<Entry>> {
///         Ok(self.urls.iter().map(Entry::new).collect())
///     }
/// }
/// ```
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connector name (e.g. `"local"`, `"multibeam"`).
    ///
    /// Scoped presets and hook rules key on this value.
    fn name(&self) -> &str;

    /// One-line description.
    fn description(&self) -> &str;

    /// Directory this connector's files are written into.
    fn outdir(&self) -> &Path;

    /// Root output directory shared by all connectors. Defaults to the
    /// parent of [`outdir`](Connector::outdir).
    fn base_outdir(&self) -> PathBuf {
        self.outdir()
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Free-form tags for listings.
    fn tags(&self) -> Vec<String> {
        Vec::new()
    }

    /// Produce the candidate entries for this run.
    ///
    /// Each entry should carry `url` and usually `dst_fn`; `status` is left
    /// unset for the transport to fill in.
    async fn enumerate(&self) -> Result<Vec<Entry>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Transport Trait
// ═══════════════════════════════════════════════════════════════════════

/// Moves one entry's bytes to local storage.
///
/// Implementations set `status` (0 on success) and `dst_fn` on the entry.
/// Returning `Err` is treated by the pipeline as a failed transfer
/// (`status = -1`); the entry still flows into the file stage.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, entry: &mut Entry, connector: &dyn Connector) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Registry for connectors participating in a run.
pub struct ConnectorRegistry {
    connectors: Vec<Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    /// Create an empty connector registry.
    pub fn new() -> Self {
        Self {
            connectors: Vec::new(),
        }
    }

    /// Register a connector.
    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors.push(connector);
    }

    /// All registered connectors, in registration order.
    pub fn connectors(&self) -> &[Arc<dyn Connector>] {
        &self.connectors
    }

    /// Find a connector by name.
    pub fn find(&self, name: &str) -> Option<&Arc<dyn Connector>> {
        self.connectors.iter().find(|c| c.name() == name)
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
