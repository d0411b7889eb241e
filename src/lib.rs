//! # Fetchez
//!
//! Survey indices and a staged hook pipeline for fetching geospatial data.
//!
//! A survey index is a GeoJSON FeatureCollection describing datasets by
//! footprint and attributes. Connectors turn index queries into download
//! entries; the pipeline transfers them and threads them through user- and
//! preset-supplied hooks in three stages.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌──────────────────────────────┐
//! │ Survey index │──▶│ Connectors  │──▶│          Pipeline            │
//! │ ingest/scan  │   │ enumerate() │   │ pre ─▶ transfer+file ─▶ post │
//! └──────────────┘   └─────────────┘   └──────────────┬───────────────┘
//!                                                     │
//!                        ┌────────────────────────────┤
//!                        ▼                            ▼
//!                 ┌─────────────┐              ┌─────────────┐
//!                 │  built-in   │              │  Lua user   │
//!                 │   hooks     │              │   hooks     │
//!                 └─────────────┘              └─────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | User configuration and presets file |
//! | [`models`] | Entries, items and GeoJSON types |
//! | [`spatial`] | Region parsing and footprint tests |
//! | [`index`] | Survey index load, search and persistence |
//! | [`ingest`] | Building indices from tables |
//! | [`scan`] | Building indices from local files |
//! | [`traits`] | `Connector` and `Transport` seams |
//! | [`connector_local`] | Connector over a survey index |
//! | [`transport_fs`] | `file://` transport |
//! | [`hooks`] | Hook contract, registry and built-ins |
//! | [`hook_script`] | Lua user hooks |
//! | [`presets`] | Named hook macros |
//! | [`pipeline`] | Staged execution engine |
//! | [`commands`] | CLI command bodies |

pub mod commands;
pub mod config;
pub mod connector_local;
pub mod hook_script;
pub mod hooks;
pub mod index;
pub mod ingest;
mod lua_runtime;
pub mod models;
pub mod pipeline;
pub mod presets;
pub mod scan;
pub mod spatial;
pub mod traits;
pub mod transport_fs;
