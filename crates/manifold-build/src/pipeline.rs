//! Pipeline driver.
//!
//! Runs the stages in order (prepare, build, assemble, push, cleanup) and
//! owns the local store for the duration of the run.

use std::sync::Arc;

use manifold_common::{Digest, ImageId};
use manifold_image::{ImageStore, RegistryClient};
use manifold_oci::Platform;
use miette::Diagnostic;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::assembler::Assembler;
use crate::builder::ImageBuilder;
use crate::config::RunConfig;
use crate::context::BuildContext;
use crate::coordinator::Coordinator;
use crate::error::{PipelineError, Stage};
use crate::lifecycle::{ArtifactLifecycle, CleanupStatus, StoreHandle};
use crate::push::{PushAttempt, PushRetrier};

/// A published manifest list.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Local store ID the manifest list had.
    pub manifest_list: ImageId,
    /// Destination reference.
    pub destination: String,
    /// Registry digest of the pushed index.
    pub digest: Digest,
    /// Platforms in the manifest list.
    pub platforms: Vec<Platform>,
    /// Every push attempt.
    pub attempts: Vec<PushAttempt>,
    /// What happened to the local artifacts.
    pub cleanup: CleanupStatus,
    /// Problems that did not affect the published digest.
    pub warnings: Vec<String>,
}

/// A failed run.
#[derive(Error, Diagnostic, Debug)]
#[error("Run failed in {stage} stage")]
#[diagnostic(code(manifold::pipeline::run))]
pub struct RunFailure {
    /// Stage that failed.
    pub stage: Stage,
    /// Underlying error.
    #[source]
    #[diagnostic_source]
    pub error: PipelineError,
    /// Images left in the local store.
    pub retained: Vec<ImageId>,
}

/// Artifacts created so far, for cleanup after a failure.
#[derive(Debug, Default)]
struct Progress {
    images: Vec<ImageId>,
    manifest_list: Option<ImageId>,
}

struct Published {
    manifest_list: ImageId,
    instances: Vec<ImageId>,
    digest: Digest,
    attempts: Vec<PushAttempt>,
}

/// One build-and-publish run.
pub struct Pipeline {
    config: RunConfig,
    builder: Arc<dyn ImageBuilder>,
    registry: Arc<dyn RegistryClient>,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Create a pipeline.
    pub fn new(
        config: RunConfig,
        builder: Arc<dyn ImageBuilder>,
        registry: Arc<dyn RegistryClient>,
    ) -> Self {
        Self {
            config,
            builder,
            registry,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally controlled cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels this run.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run configuration.
    #[must_use]
    pub const fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run against the configured local store.
    ///
    /// # Errors
    ///
    /// Returns a [`RunFailure`] naming the failed stage.
    pub async fn run(&self) -> Result<RunReport, RunFailure> {
        let setup = |error: PipelineError| RunFailure {
            stage: Stage::Setup,
            error,
            retained: Vec::new(),
        };
        self.config.validate().map_err(setup)?;
        let handle = StoreHandle::open(self.config.store_options()).map_err(setup)?;
        self.execute(handle).await
    }

    /// Run against an already opened store, releasing it at the end.
    ///
    /// # Errors
    ///
    /// Returns a [`RunFailure`] naming the failed stage.
    pub async fn run_with(&self, handle: StoreHandle) -> Result<RunReport, RunFailure> {
        if let Err(error) = self.config.validate() {
            return Err(RunFailure {
                stage: Stage::Setup,
                error,
                retained: Vec::new(),
            });
        }
        self.execute(handle).await
    }

    async fn execute(&self, handle: StoreHandle) -> Result<RunReport, RunFailure> {
        let lifecycle = ArtifactLifecycle::new(handle, self.config.cleanup);
        let mut progress = Progress::default();
        let outcome = self.drive(lifecycle.store(), &mut progress).await;

        match outcome {
            Ok(published) => {
                let cleanup = lifecycle.on_success(&published.manifest_list, &published.instances);
                let mut warnings = Vec::new();
                if let CleanupStatus::Incomplete { failures, .. } = &cleanup {
                    tracing::warn!(
                        leftover = failures.len(),
                        "Manifest list published but local artifacts remain"
                    );
                    warnings.extend(failures.iter().map(|f| format!("{}: {}", f.id, f.error)));
                }
                if let Err(e) = lifecycle.release() {
                    tracing::warn!(error = %e, "Failed to release local store");
                    warnings.push(format!("store release: {e}"));
                }

                tracing::info!(
                    id = %published.manifest_list.short(),
                    destination = %self.config.manifest,
                    digest = %published.digest,
                    "Run complete"
                );

                Ok(RunReport {
                    manifest_list: published.manifest_list,
                    destination: self.config.manifest.clone(),
                    digest: published.digest,
                    platforms: self.config.platforms.clone(),
                    attempts: published.attempts,
                    cleanup,
                    warnings,
                })
            }
            Err((stage, error)) => {
                tracing::error!(%stage, error = %error, "Run failed");
                let status =
                    lifecycle.on_failure(progress.manifest_list.as_ref(), &progress.images);
                if let Err(e) = lifecycle.release() {
                    tracing::warn!(error = %e, "Failed to release local store");
                }
                Err(RunFailure {
                    stage,
                    error,
                    retained: status.leftover(),
                })
            }
        }
    }

    async fn drive(
        &self,
        store: &Arc<dyn ImageStore>,
        progress: &mut Progress,
    ) -> Result<Published, (Stage, PipelineError)> {
        let config = &self.config;
        let at = |stage: Stage| move |error: PipelineError| (stage, error);

        if self.cancel.is_cancelled() {
            return Err((Stage::Prepare, PipelineError::Cancelled { stage: Stage::Prepare }));
        }

        tracing::info!(source = %config.source, manifest = %config.manifest, "Preparing build context");
        let template = config.template.load().map_err(at(Stage::Prepare))?;
        let context = BuildContext::prepare(&template, &config.template_params(), &config.context_files)
            .map_err(at(Stage::Prepare))?;

        let coordinator = Coordinator::new(
            Arc::clone(&self.builder),
            Arc::clone(store),
            config.build.clone(),
            config.manifest.clone(),
        )
        .with_cancellation(self.cancel.clone());
        let run = coordinator
            .build(&config.platforms, config.jobs, context.definition(), context.dir())
            .await
            .map_err(at(Stage::Build))?;
        progress.images = run.images();

        if let Err(e) = context.close() {
            tracing::warn!(error = %e, "Failed to remove build context");
        }

        if self.cancel.is_cancelled() {
            return Err((Stage::Build, PipelineError::Cancelled { stage: Stage::Build }));
        }
        let run = run.into_success().map_err(at(Stage::Build))?;

        let assembled = Assembler::new(store.as_ref(), &config.index, &config.build.output_format)
            .assemble(&run, &config.manifest)
            .map_err(at(Stage::Assemble))?;
        progress.manifest_list = Some(assembled.id.clone());

        let outcome = PushRetrier::new(self.registry.as_ref(), config.retry_policy())
            .with_cancellation(self.cancel.clone())
            .push(
                store.as_ref(),
                &assembled.id,
                &config.manifest,
                &config.push,
                &config.registry.system_context(),
            )
            .await
            .map_err(at(Stage::Push))?;

        Ok(Published {
            manifest_list: assembled.id,
            instances: assembled.instances,
            digest: outcome.digest,
            attempts: outcome.attempts,
        })
    }
}
