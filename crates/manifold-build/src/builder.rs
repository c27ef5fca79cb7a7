//! Image builder collaborator.
//!
//! The pipeline treats the builder as a black box: one invocation per
//! platform either leaves one image in the local store or fails.
//! [`BuildahBuilder`] drives the `buildah` command line and imports the
//! result through an OCI layout.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use manifold_common::ImageId;
use manifold_common::paths::MANIFOLD_TMPDIR;
use manifold_image::ImageStore;
use manifold_image::layout::import_oci_layout;
use manifold_oci::{Platform, media_types};
use miette::Diagnostic;
use thiserror::Error;
use tokio::process::Command;

use crate::config::BuildSettings;

/// A single platform build failure, as reported by the builder.
#[derive(Error, Diagnostic, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
#[diagnostic(code(manifold::builder::failed))]
pub struct BuildError {
    /// Failure description.
    pub message: String,
}

impl BuildError {
    /// Create a build error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Inputs for one platform build.
#[derive(Clone, Copy)]
pub struct BuildRequest<'a> {
    /// Rendered build definition.
    pub definition: &'a Path,
    /// Build context directory.
    pub context_dir: &'a Path,
    /// Target platform.
    pub platform: &'a Platform,
    /// Shared build settings, passed through unmodified.
    pub settings: &'a BuildSettings,
    /// Store the built image is written to.
    pub store: &'a dyn ImageStore,
    /// Name recorded on the stored image.
    pub name: &'a str,
}

/// Builds one image for one platform.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build the image and return its store ID.
    async fn build(&self, request: BuildRequest<'_>) -> Result<ImageId, BuildError>;
}

/// Image builder backed by the `buildah` CLI.
#[derive(Debug, Clone)]
pub struct BuildahBuilder {
    program: PathBuf,
    scratch: PathBuf,
}

impl Default for BuildahBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildahBuilder {
    /// Use `buildah` from `PATH` with the standard scratch directory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("buildah"),
            scratch: MANIFOLD_TMPDIR.clone(),
        }
    }

    /// Use a different buildah binary.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Write intermediate layouts under a different directory.
    #[must_use]
    pub fn with_scratch(mut self, scratch: impl Into<PathBuf>) -> Self {
        self.scratch = scratch.into();
        self
    }

    /// Arguments for `buildah build`.
    #[must_use]
    pub fn build_args(request: &BuildRequest<'_>, iidfile: &Path) -> Vec<String> {
        let settings = request.settings;
        let mut args = vec![
            "build".to_string(),
            "--quiet".to_string(),
            format!("--platform={}", request.platform),
            format!("--file={}", request.definition.display()),
            format!("--iidfile={}", iidfile.display()),
            format!("--isolation={}", settings.isolation.as_arg()),
            format!("--runtime={}", settings.runtime),
            format!("--network={}", settings.network.as_arg()),
            format!("--pull={}", settings.pull.as_arg()),
            format!("--format={}", build_format(&settings.output_format)),
            format!("--layers={}", settings.layers),
            format!("--retry={}", settings.retries),
        ];

        args.extend(settings.runtime_args.iter().map(|a| format!("--runtime-flag={a}")));
        args.extend(settings.add_capabilities.iter().map(|c| format!("--cap-add={c}")));
        args.extend(settings.drop_capabilities.iter().map(|c| format!("--cap-drop={c}")));

        if settings.cache.disabled {
            args.push("--no-cache".to_string());
        }
        args.extend(settings.cache.from.iter().map(|c| format!("--cache-from={c}")));
        args.extend(settings.cache.to.iter().map(|c| format!("--cache-to={c}")));
        if let Some(ttl) = &settings.cache.ttl {
            args.push(format!("--cache-ttl={ttl}"));
        }

        if settings.squash {
            args.push("--squash".to_string());
        }
        if let Some(key) = &settings.sign_by {
            args.push(format!("--sign-by={key}"));
        }
        args.extend(settings.labels.iter().map(|(k, v)| format!("--label={k}={v}")));
        args.extend(
            settings
                .annotations
                .iter()
                .map(|(k, v)| format!("--annotation={k}={v}")),
        );

        args.push(request.context_dir.display().to_string());
        args
    }

    async fn run(&self, args: &[String]) -> Result<String, BuildError> {
        let subcommand = args.first().map_or("", String::as_str);
        tracing::debug!(program = %self.program.display(), ?args, "Running builder");

        let output = Command::new(&self.program)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                BuildError::new(format!("Failed to run {}: {e}", self.program.display()))
            })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no output");
        Err(BuildError::new(format!(
            "{} {subcommand} failed ({}): {}",
            self.program.display(),
            output.status,
            reason.trim()
        )))
    }
}

#[async_trait]
impl ImageBuilder for BuildahBuilder {
    async fn build(&self, request: BuildRequest<'_>) -> Result<ImageId, BuildError> {
        let platform = request.platform;

        let scratch = tempfile::Builder::new()
            .prefix(&format!("manifold-{}-", platform.slug()))
            .tempdir_in(&self.scratch)
            .map_err(|e| BuildError::new(format!("Failed to create scratch directory: {e}")))?;
        let iidfile = scratch.path().join("iid");
        let layout = scratch.path().join("layout");

        self.run(&Self::build_args(&request, &iidfile)).await?;

        let builder_id = fs::read_to_string(&iidfile)
            .map_err(|e| BuildError::new(format!("Builder did not report an image ID: {e}")))?
            .trim()
            .to_string();

        let push_args = vec![
            "push".to_string(),
            "--quiet".to_string(),
            format!("--format={}", push_format(&request.settings.output_format)),
            builder_id.clone(),
            format!("oci:{}", layout.display()),
        ];
        self.run(&push_args).await?;

        if let Err(e) = self.run(&["rmi".to_string(), builder_id]).await {
            tracing::debug!(%platform, error = %e, "Could not remove builder-side image");
        }

        let stored = import_oci_layout(request.store, &layout, request.name, platform)
            .map_err(|e| BuildError::new(format!("Failed to import built image: {e}")))?;

        tracing::debug!(%platform, id = %stored.id.short(), "Image imported");
        Ok(stored.id)
    }
}

fn build_format(output_format: &str) -> &'static str {
    if output_format == media_types::DOCKER_MANIFEST {
        "docker"
    } else {
        "oci"
    }
}

fn push_format(output_format: &str) -> &'static str {
    if output_format == media_types::DOCKER_MANIFEST {
        "v2s2"
    } else {
        "oci"
    }
}

#[cfg(test)]
mod tests {
    use manifold_image::{LocalStore, StoreOptions};

    use super::*;

    #[test]
    fn buildah_arguments_carry_settings() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(StoreOptions::with_root(dir.path())).unwrap();
        let mut settings = BuildSettings {
            add_capabilities: vec!["CAP_CHOWN".into()],
            drop_capabilities: vec!["CAP_NET_RAW".into()],
            ..BuildSettings::default()
        };
        settings.labels.insert("team".into(), "catalog".into());

        let platform = Platform::parse("linux/arm64").unwrap();
        let request = BuildRequest {
            definition: Path::new("/ctx/Containerfile"),
            context_dir: Path::new("/ctx"),
            platform: &platform,
            settings: &settings,
            store: &store,
            name: "localhost:5000/org/app:v1",
        };

        let args = BuildahBuilder::build_args(&request, Path::new("/scratch/iid"));
        insta::assert_snapshot!(args.join("\n"), @r"
        build
        --quiet
        --platform=linux/arm64
        --file=/ctx/Containerfile
        --iidfile=/scratch/iid
        --isolation=rootless
        --runtime=crun
        --network=none
        --pull=always
        --format=oci
        --layers=false
        --retry=2
        --cap-add=CAP_CHOWN
        --cap-drop=CAP_NET_RAW
        --no-cache
        --label=team=catalog
        /ctx
        ");
    }

    #[tokio::test]
    async fn failing_builder_reports_build_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(StoreOptions::with_root(dir.path().join("store"))).unwrap();
        let settings = BuildSettings::default();
        let platform = Platform::linux_amd64();
        let request = BuildRequest {
            definition: Path::new("Containerfile"),
            context_dir: dir.path(),
            platform: &platform,
            settings: &settings,
            store: &store,
            name: "app",
        };

        let builder = BuildahBuilder::new()
            .with_program("false")
            .with_scratch(dir.path());
        let err = builder.build(request).await.unwrap_err();
        assert!(err.message.starts_with("false build failed"), "{err}");
    }

    #[tokio::test]
    async fn missing_program_reports_build_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(StoreOptions::with_root(dir.path().join("store"))).unwrap();
        let settings = BuildSettings::default();
        let platform = Platform::linux_amd64();
        let request = BuildRequest {
            definition: Path::new("Containerfile"),
            context_dir: dir.path(),
            platform: &platform,
            settings: &settings,
            store: &store,
            name: "app",
        };

        let builder = BuildahBuilder::new()
            .with_program("/nonexistent/buildah")
            .with_scratch(dir.path());
        let err = builder.build(request).await.unwrap_err();
        assert!(err.message.contains("Failed to run"), "{err}");
    }
}
