//! Standard filesystem paths for Manifold.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for Manifold data.
pub static MANIFOLD_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("MANIFOLD_ROOT").map_or_else(
        |_| {
            dirs::data_local_dir()
                .map(|d| d.join("manifold"))
                .unwrap_or_else(|| PathBuf::from("/var/lib/manifold"))
        },
        PathBuf::from,
    )
});

/// Default scratch directory for build contexts and intermediate layouts.
pub static MANIFOLD_TMPDIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("MANIFOLD_TMPDIR")
        .map_or_else(|_| std::env::temp_dir(), PathBuf::from)
});

/// Standard paths used by Manifold.
#[derive(Debug, Clone)]
pub struct ManifoldPaths {
    /// Root data directory.
    pub root: PathBuf,
    /// Scratch directory (default: the system temp dir).
    pub tmp: PathBuf,
}

impl ManifoldPaths {
    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let tmp = root.join("tmp");
        Self { root, tmp }
    }

    /// Local image store directory.
    #[must_use]
    pub fn storage(&self) -> PathBuf {
        self.root.join("storage")
    }

    /// Image record table of the local store.
    #[must_use]
    pub fn images_file(&self) -> PathBuf {
        self.storage().join("images.json")
    }

    /// Content-addressable storage for blobs.
    #[must_use]
    pub fn blobs(&self) -> PathBuf {
        self.storage().join("blobs")
    }

    /// Blob file by digest.
    #[must_use]
    pub fn blob(&self, algorithm: &str, hash: &str) -> PathBuf {
        self.blobs().join(algorithm).join(hash)
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(&self.tmp)?;
        std::fs::create_dir_all(self.storage())?;
        std::fs::create_dir_all(self.blobs().join("sha256"))?;
        Ok(())
    }
}

impl Default for ManifoldPaths {
    fn default() -> Self {
        Self {
            root: MANIFOLD_ROOT.clone(),
            tmp: MANIFOLD_TMPDIR.clone(),
        }
    }
}
