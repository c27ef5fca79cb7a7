//! Platform build coordinator.
//!
//! One job per platform, at most `jobs` running at a time. The coordinator
//! waits for every job to finish before reporting, so later stages only ever
//! see a complete [`BuildRunResult`]. A failing platform never cancels its
//! siblings.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use manifold_common::ImageId;
use manifold_image::ImageStore;
use manifold_oci::Platform;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::builder::{BuildError, BuildRequest, ImageBuilder};
use crate::config::BuildSettings;
use crate::error::{PipelineError, PipelineResult, PlatformFailure};

/// State of a build job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// Waiting for a slot.
    Pending,
    /// The builder is running.
    Running,
    /// The image is in the store.
    Succeeded {
        /// Store ID of the built image.
        image: ImageId,
    },
    /// The build failed or never started.
    Failed {
        /// Why.
        cause: BuildError,
    },
}

impl JobStatus {
    /// Whether the job has finished.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Failed { .. })
    }
}

/// One platform's build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildJob {
    /// Target platform.
    pub platform: Platform,
    /// Build definition used.
    pub definition: PathBuf,
    status: JobStatus,
}

impl BuildJob {
    fn new(platform: Platform, definition: PathBuf) -> Self {
        Self {
            platform,
            definition,
            status: JobStatus::Pending,
        }
    }

    fn start(&mut self) {
        debug_assert_eq!(self.status, JobStatus::Pending);
        self.status = JobStatus::Running;
    }

    fn finish(&mut self, result: Result<ImageId, BuildError>) {
        debug_assert!(!self.status.is_terminal());
        self.status = match result {
            Ok(image) => JobStatus::Succeeded { image },
            Err(cause) => JobStatus::Failed { cause },
        };
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> &JobStatus {
        &self.status
    }

    /// Built image, if the job succeeded.
    #[must_use]
    pub const fn image(&self) -> Option<&ImageId> {
        match &self.status {
            JobStatus::Succeeded { image } => Some(image),
            _ => None,
        }
    }

    /// Failure cause, if the job failed.
    #[must_use]
    pub const fn failure(&self) -> Option<&BuildError> {
        match &self.status {
            JobStatus::Failed { cause } => Some(cause),
            _ => None,
        }
    }
}

/// Every job of a build run, one per requested platform, in request order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRunResult {
    jobs: Vec<BuildJob>,
}

impl BuildRunResult {
    /// All jobs.
    #[must_use]
    pub fn jobs(&self) -> &[BuildJob] {
        &self.jobs
    }

    /// Whether every job succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        !self.jobs.is_empty() && self.jobs.iter().all(|j| j.image().is_some())
    }

    /// Every failed platform with its cause.
    #[must_use]
    pub fn failures(&self) -> Vec<PlatformFailure> {
        self.jobs
            .iter()
            .filter_map(|job| {
                job.failure().map(|cause| PlatformFailure {
                    platform: job.platform.clone(),
                    cause: cause.clone(),
                })
            })
            .collect()
    }

    /// Images of the successful jobs.
    #[must_use]
    pub fn images(&self) -> Vec<ImageId> {
        self.jobs.iter().filter_map(BuildJob::image).cloned().collect()
    }

    /// Convert into an error unless every job succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Build`] carrying every failure.
    pub fn into_success(self) -> PipelineResult<Self> {
        if self.succeeded() {
            Ok(self)
        } else {
            Err(PipelineError::Build {
                failures: self.failures(),
            })
        }
    }
}

/// Runs one build per platform with bounded concurrency.
#[derive(Clone)]
pub struct Coordinator {
    builder: Arc<dyn ImageBuilder>,
    store: Arc<dyn ImageStore>,
    settings: Arc<BuildSettings>,
    name: String,
    cancel: CancellationToken,
}

impl Coordinator {
    /// Create a coordinator writing images named `name` into `store`.
    pub fn new(
        builder: Arc<dyn ImageBuilder>,
        store: Arc<dyn ImageStore>,
        settings: BuildSettings,
        name: impl Into<String>,
    ) -> Self {
        Self {
            builder,
            store,
            settings: Arc::new(settings),
            name: name.into(),
            cancel: CancellationToken::new(),
        }
    }

    /// Stop starting new jobs when `cancel` fires.
    ///
    /// Jobs already running are left to finish.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Build every platform and wait for all of them.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a zero concurrency limit or a
    /// platform listed twice. Build failures are reported inside the result.
    pub async fn build(
        &self,
        platforms: &[Platform],
        limit: usize,
        definition: &Path,
        context_dir: &Path,
    ) -> PipelineResult<BuildRunResult> {
        if platforms.is_empty() {
            return Err(PipelineError::config("at least one platform is required"));
        }
        if limit == 0 {
            return Err(PipelineError::config("concurrency limit must be at least 1"));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = platforms.iter().find(|p| !seen.insert(*p)) {
            return Err(PipelineError::config(format!(
                "platform {dup} requested more than once"
            )));
        }

        tracing::info!(platforms = platforms.len(), jobs = limit, "Starting platform builds");

        let semaphore = Arc::new(Semaphore::new(limit));
        let mut handles = Vec::with_capacity(platforms.len());

        for platform in platforms {
            let mut job = BuildJob::new(platform.clone(), definition.to_path_buf());
            let semaphore = Arc::clone(&semaphore);
            let builder = Arc::clone(&self.builder);
            let store = Arc::clone(&self.store);
            let settings = Arc::clone(&self.settings);
            let cancel = self.cancel.clone();
            let name = self.name.clone();
            let context_dir = context_dir.to_path_buf();

            handles.push(tokio::spawn(async move {
                let permit = tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    tracing::info!(platform = %job.platform, "Platform build not started");
                    job.finish(Err(BuildError::new("cancelled before start")));
                    return job;
                };

                job.start();
                tracing::info!(platform = %job.platform, "Platform build started");

                let request = BuildRequest {
                    definition: &job.definition,
                    context_dir: &context_dir,
                    platform: &job.platform,
                    settings: &settings,
                    store: store.as_ref(),
                    name: &name,
                };
                let result = builder.build(request).await;

                match &result {
                    Ok(image) => {
                        tracing::info!(platform = %job.platform, image = %image.short(), "Platform build succeeded");
                    }
                    Err(e) => {
                        tracing::warn!(platform = %job.platform, error = %e, "Platform build failed");
                    }
                }
                job.finish(result);
                job
            }));
        }

        let mut jobs = Vec::with_capacity(handles.len());
        for (handle, platform) in handles.into_iter().zip(platforms) {
            let job = match handle.await {
                Ok(job) => job,
                Err(e) => {
                    tracing::error!(%platform, error = %e, "Platform build task aborted");
                    let mut job = BuildJob::new(platform.clone(), definition.to_path_buf());
                    job.finish(Err(BuildError::new(format!("build task aborted: {e}"))));
                    job
                }
            };
            jobs.push(job);
        }

        let result = BuildRunResult { jobs };
        tracing::info!(
            succeeded = result.images().len(),
            failed = result.failures().len(),
            "Platform builds finished"
        );
        Ok(result)
    }
}
