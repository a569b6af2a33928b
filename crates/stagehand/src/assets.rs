//! Asset syncer: reconcile the show's referenced assets against the local
//! assets directory.
//!
//! Missing files are copied from a configured source directory or streamed
//! from a source URL into a temp file and atomically renamed into place.
//! Called as part of the assignment flow; a failure here aborts the whole
//! assignment before anything is persisted.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;

pub struct Syncer {
    pub assets_dir: PathBuf,
    pub source_dir: Option<PathBuf>,
    pub source_url: Option<String>,
}

impl Syncer {
    /// Make every required asset present locally.
    pub async fn ensure_assets(&self, required: &[String]) -> Result<()> {
        let mut missing = Vec::new();
        for asset in required {
            let path = self.assets_dir.join(asset);
            match tokio::fs::metadata(&path).await {
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    missing.push(asset.clone());
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("stat failed for {}", asset));
                }
            }
        }
        for asset in &missing {
            self.fetch(asset).await?;
        }
        Ok(())
    }

    /// Delete every file under the assets root not on the required list.
    /// Traversal failures abort.
    pub fn cleanup_assets(&self, required: &[String]) -> Result<()> {
        let required: std::collections::HashSet<PathBuf> =
            required.iter().map(PathBuf::from).collect();
        let mut pending = vec![self.assets_dir.clone()];
        while let Some(dir) = pending.pop() {
            let entries = std::fs::read_dir(&dir)
                .with_context(|| format!("walk failed at {}", dir.display()))?;
            for entry in entries {
                let entry = entry.context("walk failed")?;
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                let relative = path
                    .strip_prefix(&self.assets_dir)
                    .context("walk escaped assets root")?;
                if !required.contains(relative) {
                    std::fs::remove_file(&path)
                        .with_context(|| format!("delete failed for {}", path.display()))?;
                    tracing::info!(asset = %relative.display(), "pruned unreferenced asset");
                }
            }
        }
        Ok(())
    }

    async fn fetch(&self, asset: &str) -> Result<()> {
        if let Some(source_dir) = &self.source_dir {
            return self.copy_from_dir(source_dir, asset).await;
        }
        if let Some(source_url) = &self.source_url {
            return self.download(source_url, asset).await;
        }
        bail!("asset missing and no source configured: {}", asset)
    }

    async fn copy_from_dir(&self, source_dir: &Path, asset: &str) -> Result<()> {
        let src = source_dir.join(asset);
        let dst = self.assets_dir.join(asset);
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&src, &dst)
            .await
            .with_context(|| format!("copy failed for {}", asset))?;
        tracing::info!(asset = %asset, "asset copied from source dir");
        Ok(())
    }

    /// 2xx responses stream to a temp file that is renamed into place, so a
    /// dropped download never leaves a half-written asset.
    async fn download(&self, source_url: &str, asset: &str) -> Result<()> {
        let url = format!("{}/{}", source_url.trim_end_matches('/'), asset);
        let response = reqwest::get(&url)
            .await
            .with_context(|| format!("download failed for {}", asset))?;
        if !response.status().is_success() {
            bail!("asset download failed: {} ({})", asset, response.status());
        }

        let dst = self.assets_dir.join(asset);
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = dst.with_extension("download.tmp");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("temp create failed for {}", asset))?;
        let mut stream = response;
        while let Some(chunk) = stream.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &dst)
            .await
            .with_context(|| format!("rename failed for {}", asset))?;
        tracing::info!(asset = %asset, url = %url, "asset downloaded");
        Ok(())
    }
}
