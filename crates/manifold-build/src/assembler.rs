//! Manifest list assembly.

use std::collections::BTreeMap;

use manifold_common::ImageId;
use manifold_image::ImageStore;
use manifold_oci::{ImageIndex, ManifestDescriptor};

use crate::config::IndexSettings;
use crate::coordinator::BuildRunResult;
use crate::error::{PipelineError, PipelineResult};

/// A manifest list written to the local store.
#[derive(Debug, Clone)]
pub struct AssembledManifest {
    /// Store ID of the manifest list.
    pub id: ImageId,
    /// The index document.
    pub index: ImageIndex,
    /// Per-platform images it lists, in build order.
    pub instances: Vec<ImageId>,
}

/// Combines per-platform images into one manifest list.
///
/// Assembly is all-or-nothing: a run with any failed platform is refused.
pub struct Assembler<'a> {
    store: &'a dyn ImageStore,
    media_type: String,
    annotations: BTreeMap<String, String>,
}

impl<'a> Assembler<'a> {
    /// Create an assembler writing into `store` for images built as `output_format`.
    #[must_use]
    pub fn new(store: &'a dyn ImageStore, settings: &IndexSettings, output_format: &str) -> Self {
        Self {
            store,
            media_type: settings.media_type_for(output_format),
            annotations: settings.annotations.clone(),
        }
    }

    /// Assemble the run's images into a manifest list named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Precondition`] unless every job in `run`
    /// succeeded, and [`PipelineError::Store`] if the store refuses the list.
    pub fn assemble(&self, run: &BuildRunResult, name: &str) -> PipelineResult<AssembledManifest> {
        if run.jobs().is_empty() {
            return Err(PipelineError::Precondition {
                message: "build run has no jobs".to_string(),
            });
        }
        if !run.succeeded() {
            let failed = run.failures().len();
            return Err(PipelineError::Precondition {
                message: format!(
                    "{failed} of {} platform builds did not succeed",
                    run.jobs().len()
                ),
            });
        }

        let mut index = ImageIndex::new(self.media_type.clone());
        index.annotations.clone_from(&self.annotations);
        let mut instances = Vec::with_capacity(run.jobs().len());

        for job in run.jobs() {
            let Some(id) = job.image() else {
                continue;
            };
            let image = self.store.image(id)?;
            index.add(ManifestDescriptor {
                descriptor: image.descriptor(),
                platform: Some(job.platform.clone()),
            });
            instances.push(id.clone());
        }

        if index.manifests.len() != run.jobs().len() {
            return Err(PipelineError::Precondition {
                message: format!(
                    "index lists {} platforms, expected {}",
                    index.manifests.len(),
                    run.jobs().len()
                ),
            });
        }

        let stored = self.store.create_manifest_list(name, &index, &instances)?;
        tracing::info!(
            id = %stored.id.short(),
            name,
            platforms = instances.len(),
            "Manifest list assembled"
        );

        Ok(AssembledManifest {
            id: stored.id,
            index,
            instances,
        })
    }
}
