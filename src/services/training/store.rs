use crate::models::ModelParameters;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// Versioned storage for full model parameter sets.
#[async_trait::async_trait]
pub trait ModelStore: Send + Sync {
    async fn save(&self, params: &ModelParameters) -> Result<()>;

    async fn load(&self, version: &str) -> Result<ModelParameters>;

    /// Stored versions, oldest first.
    async fn versions(&self) -> Result<Vec<String>>;

    async fn latest_version(&self) -> Result<Option<String>> {
        Ok(self.versions().await?.pop())
    }
}

/// One JSON document per version under a directory.
pub struct FileModelStore {
    dir: PathBuf,
}

impl FileModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, version: &str) -> Result<PathBuf> {
        let valid = !version.is_empty()
            && version
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !version.starts_with('.');
        if !valid {
            anyhow::bail!("invalid model version name: {:?}", version);
        }
        Ok(self.dir.join(format!("{}.json", version)))
    }
}

#[async_trait::async_trait]
impl ModelStore for FileModelStore {
    async fn save(&self, params: &ModelParameters) -> Result<()> {
        let path = self.path_for(&params.version)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating model directory {}", self.dir.display()))?;

        let payload = serde_json::to_vec(params)?;
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, payload).await?;
        tokio::fs::rename(&staging, &path).await?;

        info!("Saved model version {} to {}", params.version, path.display());
        Ok(())
    }

    async fn load(&self, version: &str) -> Result<ModelParameters> {
        let path = self.path_for(version)?;
        let payload = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading model version {}", version))?;
        Ok(serde_json::from_slice(&payload)?)
    }

    async fn versions(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut versions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                versions.push(stem.to_string());
            }
        }
        // Shorter names first so "v10" sorts after "v9".
        versions.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
        Ok(versions)
    }
}
