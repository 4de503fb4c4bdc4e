use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs;

/// Owns the on-disk lifecycle of uploaded PDF files. Keys are flat file
/// names (`<owner>_<uuid>_<filename>`); the returned path is what gets
/// persisted on the document row and handed back for reads and removal.
#[async_trait]
pub trait FileStorage: Send + Sync + 'static {
    async fn save(&self, key: &str, bytes: &[u8]) -> Result<String>;

    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    async fn remove(&self, path: &str) -> Result<()>;
}

pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates the upload directory if it does not exist yet.
    pub async fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create upload dir {}", self.root.display()))
    }
}

#[async_trait]
impl FileStorage for LocalStorage {
    async fn save(&self, key: &str, bytes: &[u8]) -> Result<String> {
        // Keys are derived from client-supplied filenames; strip any path
        // components so writes cannot escape the upload directory.
        let safe_name = Path::new(key)
            .file_name()
            .context("storage key resolves to an empty file name")?;
        let path = self.root.join(safe_name);

        fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;

        Ok(path.to_string_lossy().into_owned())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        fs::read(path)
            .await
            .with_context(|| format!("failed to read {path}"))
    }

    async fn remove(&self, path: &str) -> Result<()> {
        fs::remove_file(path)
            .await
            .with_context(|| format!("failed to remove {path}"))
    }
}
