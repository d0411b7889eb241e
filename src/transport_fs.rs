//! Local filesystem transport.
//!
//! Satisfies `file://` and bare-path URLs by copying the source into the
//! entry's `dst_fn`. Network schemes are refused; moving bytes over the
//! network is left to other [`Transport`] implementations.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::models::Entry;
use crate::traits::{Connector, Transport};

/// Copies local files into place.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalTransport;

#[async_trait]
impl Transport for LocalTransport {
    async fn fetch(&self, entry: &mut Entry, connector: &dyn Connector) -> Result<()> {
        let Some(src) = local_path(&entry.url) else {
            bail!("unsupported URL scheme for local transport: {}", entry.url);
        };

        let dst = match &entry.dst_fn {
            Some(dst) => dst.clone(),
            None => connector.outdir().join(src.file_name().context("source has no file name")?),
        };

        if !tokio::fs::try_exists(&src).await.unwrap_or(false) {
            bail!("source file not found: {}", src.display());
        }

        if same_file(&src, &dst).await {
            debug!(file = %dst.display(), "Source is destination, nothing to copy");
        } else {
            if let Some(parent) = dst.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            tokio::fs::copy(&src, &dst)
                .await
                .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
            debug!(src = %src.display(), dst = %dst.display(), "Copied");
        }

        entry.dst_fn = Some(dst);
        entry.status = Some(0);
        Ok(())
    }
}

/// Filesystem path behind a `file://` or scheme-less URL.
pub fn local_path(url: &str) -> Option<PathBuf> {
    if let Some(rest) = url.strip_prefix("file://") {
        return Some(PathBuf::from(rest));
    }
    if url.contains("://") || url.is_empty() {
        return None;
    }
    Some(PathBuf::from(url))
}

async fn same_file(a: &Path, b: &Path) -> bool {
    match (tokio::fs::canonicalize(a).await, tokio::fs::canonicalize(b).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::testing::StubConnector;
    use tempfile::TempDir;

    #[test]
    fn local_path_forms() {
        assert_eq!(local_path("file:///a/b.tif"), Some(PathBuf::from("/a/b.tif")));
        assert_eq!(local_path("rel/b.tif"), Some(PathBuf::from("rel/b.tif")));
        assert_eq!(local_path("https://h/b.tif"), None);
        assert_eq!(local_path(""), None);
    }

    #[tokio::test]
    async fn copies_into_connector_outdir() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src.xyz");
        std::fs::write(&src, b"1 2 3\n").unwrap();
        let conn = StubConnector::new("c", tmp.path().join("out"));

        let mut entry = Entry::new(format!("file://{}", src.display()));
        LocalTransport.fetch(&mut entry, &conn).await.unwrap();

        let dst = tmp.path().join("out").join("src.xyz");
        assert_eq!(entry.dst_fn.as_deref(), Some(dst.as_path()));
        assert!(entry.is_success());
        assert_eq!(std::fs::read(&dst).unwrap(), b"1 2 3\n");
    }

    #[tokio::test]
    async fn same_source_and_destination_is_noop() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("a.tif");
        std::fs::write(&src, b"x").unwrap();
        let conn = StubConnector::new("c", tmp.path());

        let mut entry = Entry::new(src.display().to_string()).with_dst(&src);
        LocalTransport.fetch(&mut entry, &conn).await.unwrap();
        assert!(entry.is_success());
        assert_eq!(std::fs::read(&src).unwrap(), b"x");
    }

    #[tokio::test]
    async fn network_scheme_and_missing_source_fail() {
        let tmp = TempDir::new().unwrap();
        let conn = StubConnector::new("c", tmp.path());

        let mut remote = Entry::new("https://example.com/a.tif");
        assert!(LocalTransport.fetch(&mut remote, &conn).await.is_err());
        assert_eq!(remote.status, None);

        let mut missing = Entry::new(format!("file://{}", tmp.path().join("gone").display()));
        assert!(LocalTransport.fetch(&mut missing, &conn).await.is_err());
    }
}
