// Persisted leaf / heatmap / overlay images and their public URLs

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::core::errors::{ArtifactError, ArtifactResult};

/// Artifact store collaborator: `put(bytes, unique_name) -> reachable URL`.
pub trait ArtifactStore: Send + Sync {
    fn put(&self, bytes: &[u8], name: &str) -> ArtifactResult<String>;
}

/// Writes into the directory served at `/static`.
pub struct StaticDirStore {
    dir: PathBuf,
    base_url: String,
}

impl StaticDirStore {
    /// Creates `dir` if it does not exist yet.
    pub fn new(dir: impl Into<PathBuf>, base_url: &str) -> ArtifactResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| ArtifactError::Write {
            path: dir.display().to_string(),
            source,
        })?;
        Ok(Self {
            dir,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ArtifactStore for StaticDirStore {
    fn put(&self, bytes: &[u8], name: &str) -> ArtifactResult<String> {
        let path = self.dir.join(name);
        std::fs::write(&path, bytes).map_err(|source| ArtifactError::Write {
            path: path.display().to_string(),
            source,
        })?;
        debug!("Saved artifact {} ({} bytes)", name, bytes.len());
        Ok(format!("{}/static/{}", self.base_url, name))
    }
}

/// File names for one leaf's artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactNames {
    pub leaf: String,
    pub heatmap: String,
    pub overlay: String,
}

/// Hands out unique artifact names.
///
/// The counter is incremented and read under one lock, so concurrent requests
/// never share a sequence number even when their timestamps collide.
#[derive(Debug, Default)]
pub struct ArtifactNamer {
    counter: Mutex<u64>,
}

impl ArtifactNamer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> ArtifactNames {
        let n = {
            let mut counter = self.counter.lock();
            *counter += 1;
            *counter
        };
        let millis = chrono::Utc::now().timestamp_millis();
        ArtifactNames {
            leaf: format!("leaf_{}_{}.jpg", n, millis),
            heatmap: format!("heatmap_{}_{}.jpg", n, millis),
            overlay: format!("overlay_{}_{}.jpg", n, millis),
        }
    }

    pub fn issued(&self) -> u64 {
        *self.counter.lock()
    }
}
