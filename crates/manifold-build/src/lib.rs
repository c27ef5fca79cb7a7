//! # manifold-build
//!
//! Multi-platform image build pipeline for Manifold.
//!
//! A run builds one image per target platform in parallel, assembles the
//! results into a single manifest list, pushes it to a registry with bounded
//! retries and then cleans up the local store:
//! - Build context preparation from a `{{ .Key }}` template
//! - Platform builds with a concurrency limit and a wait-for-all barrier
//! - All-or-nothing manifest list assembly
//! - Push with retryable/fatal failure classification and backoff
//! - Local artifact cleanup and store release

#![warn(missing_docs)]

pub mod assembler;
pub mod builder;
pub mod cli;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod lifecycle;
pub mod pipeline;
pub mod push;

pub use assembler::{AssembledManifest, Assembler};
pub use builder::{BuildError, BuildRequest, BuildahBuilder, ImageBuilder};
pub use config::{BuildSettings, CleanupPolicy, RunConfig};
pub use context::BuildContext;
pub use coordinator::{BuildJob, BuildRunResult, Coordinator, JobStatus};
pub use error::{PipelineError, PipelineResult, PlatformFailure, PushFailureKind, Stage};
pub use lifecycle::{ArtifactLifecycle, CleanupStatus, StoreHandle};
pub use pipeline::{Pipeline, RunFailure, RunReport};
pub use push::{AttemptOutcome, Backoff, PushAttempt, PushOutcome, PushRetrier, RetryPolicy};
