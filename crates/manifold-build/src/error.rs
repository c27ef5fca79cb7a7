//! Pipeline error types.

use std::fmt;

use manifold_common::ManifoldError;
use manifold_oci::Platform;
use miette::Diagnostic;
use thiserror::Error;

use crate::builder::BuildError;
use crate::push::PushAttempt;

/// Result type alias using [`PipelineError`].
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Configuration validation and store acquisition.
    Setup,
    /// Build context preparation.
    Prepare,
    /// Per-platform builds.
    Build,
    /// Manifest list assembly.
    Assemble,
    /// Registry push.
    Push,
    /// Artifact cleanup and store release.
    Cleanup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Setup => "setup",
            Self::Prepare => "prepare",
            Self::Build => "build",
            Self::Assemble => "assemble",
            Self::Push => "push",
            Self::Cleanup => "cleanup",
        };
        f.write_str(s)
    }
}

/// How the final push attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushFailureKind {
    /// Every attempt failed with a transient error.
    Retryable,
    /// An attempt failed with an error that retrying cannot fix.
    Fatal,
}

impl fmt::Display for PushFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retryable => f.write_str("retryable"),
            Self::Fatal => f.write_str("fatal"),
        }
    }
}

/// One platform's build failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformFailure {
    /// The platform that failed.
    pub platform: Platform,
    /// Why it failed, as reported by the builder.
    pub cause: BuildError,
}

impl fmt::Display for PlatformFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.platform, self.cause)
    }
}

/// Errors produced by the build pipeline.
#[derive(Error, Diagnostic, Debug)]
pub enum PipelineError {
    /// The build context could not be created or written.
    #[error("Failed to prepare build context: {message}")]
    #[diagnostic(code(manifold::pipeline::preparation))]
    Preparation {
        /// What went wrong.
        message: String,
    },

    /// One or more platform builds failed.
    #[error("{} platform build(s) failed: {}", .failures.len(), join(.failures))]
    #[diagnostic(
        code(manifold::pipeline::build),
        help("Artifacts from successful platforms are kept in the local store")
    )]
    Build {
        /// Every platform failure, in request order.
        failures: Vec<PlatformFailure>,
    },

    /// Assembly was attempted without a fully successful build run.
    #[error("Manifest assembly preconditions not met: {message}")]
    #[diagnostic(code(manifold::pipeline::precondition))]
    Precondition {
        /// Which precondition failed.
        message: String,
    },

    /// The manifest list could not be pushed.
    #[error(
        "Failed to push {destination} ({kind}) after {} attempt(s): {reason}",
        .attempts.len()
    )]
    #[diagnostic(code(manifold::pipeline::push))]
    Push {
        /// Destination reference as configured.
        destination: String,
        /// Classification of the final failure.
        kind: PushFailureKind,
        /// Cause of the final failure.
        reason: String,
        /// Every attempt made, in order.
        attempts: Vec<PushAttempt>,
    },

    /// Local store failure.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] ManifoldError),

    /// Invalid run configuration.
    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(manifold::pipeline::config))]
    Config {
        /// What is wrong.
        message: String,
    },

    /// The run was cancelled.
    #[error("Run cancelled during {stage}")]
    #[diagnostic(code(manifold::pipeline::cancelled))]
    Cancelled {
        /// Stage that observed the cancellation.
        stage: Stage,
    },
}

impl PipelineError {
    /// Create a preparation error.
    pub fn preparation(message: impl Into<String>) -> Self {
        Self::Preparation {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// The stage this error belongs to, where it is tied to one.
    #[must_use]
    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::Preparation { .. } => Some(Stage::Prepare),
            Self::Build { .. } => Some(Stage::Build),
            Self::Precondition { .. } => Some(Stage::Assemble),
            Self::Push { .. } => Some(Stage::Push),
            Self::Cancelled { stage } => Some(*stage),
            Self::Store(_) | Self::Config { .. } => None,
        }
    }

    /// Whether this is a push failure of the given kind.
    #[must_use]
    pub fn is_push(&self, expected: PushFailureKind) -> bool {
        matches!(self, Self::Push { kind, .. } if *kind == expected)
    }
}

fn join(failures: &[PlatformFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
