//! Artifact lifecycle.
//!
//! [`StoreHandle`] owns the run's local store and shuts it down exactly
//! once: explicitly through [`StoreHandle::release`], or on drop if the run
//! never got that far. [`ArtifactLifecycle`] decides what happens to the
//! run's images once the outcome is known.

use std::fmt;
use std::sync::Arc;

use manifold_common::ImageId;
use manifold_image::{ImageStore, LocalStore, StoreOptions};

use crate::config::CleanupPolicy;
use crate::error::PipelineResult;

/// The run's local store, released exactly once.
pub struct StoreHandle {
    store: Arc<dyn ImageStore>,
    released: bool,
}

impl StoreHandle {
    /// Open a local store.
    ///
    /// # Errors
    ///
    /// Returns a store error if the store cannot be opened.
    pub fn open(options: StoreOptions) -> PipelineResult<Self> {
        let store = LocalStore::open(options)?;
        tracing::debug!(root = %store.root().display(), "Local store opened");
        Ok(Self::new(Arc::new(store)))
    }

    /// Take ownership of an already opened store.
    #[must_use]
    pub fn new(store: Arc<dyn ImageStore>) -> Self {
        Self {
            store,
            released: false,
        }
    }

    /// The store.
    #[must_use]
    pub const fn store(&self) -> &Arc<dyn ImageStore> {
        &self.store
    }

    /// Shut the store down.
    ///
    /// # Errors
    ///
    /// Returns a store error if shutdown fails.
    pub fn release(mut self) -> PipelineResult<()> {
        self.released = true;
        self.store.shutdown(false)?;
        tracing::debug!("Local store released");
        Ok(())
    }
}

impl Drop for StoreHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.store.shutdown(true) {
            tracing::warn!(error = %e, "Failed to shut down local store");
        }
    }
}

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle")
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

/// An artifact that could not be removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFailure {
    /// The image left behind.
    pub id: ImageId,
    /// Why deletion failed.
    pub error: String,
}

/// What happened to the run's local artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupStatus {
    /// Every artifact was removed.
    Complete {
        /// Removed images, manifest list first.
        removed: Vec<ImageId>,
    },
    /// Some artifacts could not be removed.
    Incomplete {
        /// Removed images.
        removed: Vec<ImageId>,
        /// Images left behind.
        failures: Vec<CleanupFailure>,
    },
    /// Artifacts were kept on purpose.
    Retained {
        /// Images kept in the store.
        ids: Vec<ImageId>,
    },
}

impl CleanupStatus {
    /// Whether nothing is left in the store.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }

    /// Images still in the store.
    #[must_use]
    pub fn leftover(&self) -> Vec<ImageId> {
        match self {
            Self::Complete { .. } => Vec::new(),
            Self::Incomplete { failures, .. } => failures.iter().map(|f| f.id.clone()).collect(),
            Self::Retained { ids } => ids.clone(),
        }
    }
}

/// Owns the store handle and the cleanup policy for one run.
#[derive(Debug)]
pub struct ArtifactLifecycle {
    handle: StoreHandle,
    policy: CleanupPolicy,
}

impl ArtifactLifecycle {
    /// Create a lifecycle manager.
    #[must_use]
    pub const fn new(handle: StoreHandle, policy: CleanupPolicy) -> Self {
        Self { handle, policy }
    }

    /// The store.
    #[must_use]
    pub const fn store(&self) -> &Arc<dyn ImageStore> {
        self.handle.store()
    }

    /// Remove the manifest list and its images after a successful push.
    ///
    /// Deletion is best-effort; failures are reported, never raised.
    #[must_use]
    pub fn on_success(&self, manifest_list: &ImageId, instances: &[ImageId]) -> CleanupStatus {
        self.remove(Some(manifest_list), instances)
    }

    /// Keep or remove the run's artifacts after a failure, per policy.
    #[must_use]
    pub fn on_failure(
        &self,
        manifest_list: Option<&ImageId>,
        instances: &[ImageId],
    ) -> CleanupStatus {
        if self.policy.retain_on_failure {
            let ids: Vec<ImageId> = manifest_list
                .into_iter()
                .chain(instances)
                .cloned()
                .collect();
            if !ids.is_empty() {
                tracing::info!(count = ids.len(), "Keeping artifacts for inspection");
            }
            return CleanupStatus::Retained { ids };
        }
        self.remove(manifest_list, instances)
    }

    fn remove(&self, manifest_list: Option<&ImageId>, instances: &[ImageId]) -> CleanupStatus {
        let store = self.handle.store();
        let mut removed = Vec::new();
        let mut failures = Vec::new();

        // The list goes first; it pins its instances.
        for id in manifest_list.into_iter().chain(instances) {
            match store.delete_image(id, false) {
                Ok(()) => removed.push(id.clone()),
                Err(e) => {
                    tracing::warn!(id = %id.short(), error = %e, "Failed to remove artifact");
                    failures.push(CleanupFailure {
                        id: id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if failures.is_empty() {
            tracing::info!(removed = removed.len(), "Local artifacts removed");
            CleanupStatus::Complete { removed }
        } else {
            CleanupStatus::Incomplete { removed, failures }
        }
    }

    /// Release the store handle.
    ///
    /// # Errors
    ///
    /// Returns a store error if shutdown fails.
    pub fn release(self) -> PipelineResult<()> {
        self.handle.release()
    }
}
