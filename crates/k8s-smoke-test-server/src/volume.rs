//! Volume mount access
//!
//! Every request path is resolved relative to a mount root and must stay
//! inside it.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// A directory a volume is mounted at
#[derive(Debug, Clone)]
pub struct Volume {
    root: PathBuf,
}

impl Volume {
    /// Wrap the mount point at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Mount point
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a request path to a file under the mount.
    ///
    /// Absolute paths, `..` components and empty paths are rejected.
    pub fn resolve(&self, requested: &str) -> Result<PathBuf> {
        let relative = Path::new(requested);
        let mut resolved = self.root.clone();
        let mut segments = 0usize;

        for component in relative.components() {
            match component {
                Component::Normal(segment) => {
                    resolved.push(segment);
                    segments += 1;
                }
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(Error::BadPath(requested.to_string()));
                }
            }
        }

        if segments == 0 {
            return Err(Error::BadPath(requested.to_string()));
        }
        Ok(resolved)
    }

    /// Read a file from the mount
    pub async fn read(&self, requested: &str) -> Result<Vec<u8>> {
        let path = self.resolve(requested)?;
        match tokio::fs::read(&path).await {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::NotFound(requested.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Write `contents` to a file on the mount, creating parent directories
    pub async fn write(&self, requested: &str, contents: &[u8]) -> Result<PathBuf> {
        let path = self.resolve(requested)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, contents).await?;
        debug!(path = %path.display(), bytes = contents.len(), "Wrote file");
        Ok(path)
    }
}
