//! Manifold CLI.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::eyre::Result;
use manifold_image::{DistributionClient, ImageKind, ImageStore, LocalStore, StoreOptions, StoredImage};
use manifold_oci::Platform;
use tabled::{Table, Tabled};

use crate::builder::BuildahBuilder;
use crate::config::RunConfig;
use crate::context::render;
use crate::error::{PipelineError, PipelineResult};
use crate::lifecycle::CleanupStatus;
use crate::pipeline::{Pipeline, RunFailure, RunReport};

/// Manifold - multi-platform image builder and manifest publisher
#[derive(Parser)]
#[command(name = "manifold")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// Run configuration file plus command line overrides.
#[derive(Debug, Default, Args)]
pub struct RunArgs {
    /// Run configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "MANIFOLD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Target platform (os/arch[/variant]); repeatable or comma separated
    #[arg(long = "platform", value_delimiter = ',')]
    pub platforms: Vec<String>,

    /// Maximum concurrent platform builds
    #[arg(short, long, env = "MANIFOLD_JOBS")]
    pub jobs: Option<usize>,

    /// Push retries after the first attempt
    #[arg(long, env = "MANIFOLD_MAX_RETRIES")]
    pub max_retries: Option<u32>,

    /// Destination manifest list reference
    #[arg(long, env = "MANIFOLD_MANIFEST")]
    pub manifest: Option<String>,

    /// Source image reference
    #[arg(long, env = "MANIFOLD_SOURCE")]
    pub source: Option<String>,

    /// Skip registry TLS verification
    #[arg(long, env = "MANIFOLD_INSECURE", num_args = 0..=1, default_missing_value = "true")]
    pub insecure: Option<bool>,

    /// Local store root
    #[arg(long, env = "MANIFOLD_ROOT")]
    pub store_root: Option<PathBuf>,
}

impl RunArgs {
    /// Load the configuration file (or defaults) and apply overrides.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the file is unreadable, an override
    /// is malformed, or the result does not validate.
    pub fn load(&self) -> PipelineResult<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_file(path)?,
            None => RunConfig::default(),
        };

        if !self.platforms.is_empty() {
            config.platforms = self
                .platforms
                .iter()
                .map(|p| Platform::parse(p).map_err(|e| PipelineError::config(e.to_string())))
                .collect::<PipelineResult<_>>()?;
        }
        if let Some(jobs) = self.jobs {
            config.jobs = jobs;
        }
        if let Some(retries) = self.max_retries {
            config.max_push_retries = retries;
        }
        if let Some(manifest) = &self.manifest {
            config.manifest.clone_from(manifest);
        }
        if let Some(source) = &self.source {
            config.source.clone_from(source);
        }
        if let Some(insecure) = self.insecure {
            config.registry.insecure = insecure;
        }
        if let Some(root) = &self.store_root {
            config.store.root = Some(root.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

/// Manifold commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Build every platform, assemble a manifest list and push it
    Build {
        /// Run configuration.
        #[command(flatten)]
        run: RunArgs,

        /// buildah binary
        #[arg(long, env = "MANIFOLD_BUILDAH", default_value = "buildah")]
        buildah: PathBuf,
    },

    /// Print the rendered build definition
    Render {
        /// Run configuration.
        #[command(flatten)]
        run: RunArgs,
    },

    /// Print the configured target platforms
    Platforms {
        /// Run configuration.
        #[command(flatten)]
        run: RunArgs,
    },

    /// List images in the local store
    Images {
        /// Local store root
        #[arg(long, env = "MANIFOLD_ROOT")]
        store_root: Option<PathBuf>,

        /// Format output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove images from the local store
    Rmi {
        /// Image IDs, ID prefixes or names
        #[arg(required = true)]
        images: Vec<String>,

        /// Remove even if a manifest list references the image
        #[arg(short, long)]
        force: bool,

        /// Local store root
        #[arg(long, env = "MANIFOLD_ROOT")]
        store_root: Option<PathBuf>,
    },
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Build { run, buildah } => {
                let config = run.load()?;
                tracing::info!(
                    manifest = %config.manifest,
                    platforms = config.platforms.len(),
                    jobs = config.jobs,
                    "Starting run"
                );

                let registry = DistributionClient::new()
                    .with_timeout(config.registry.timeout())
                    .with_plain_http(config.registry.plain_http);
                let pipeline = Pipeline::new(
                    config,
                    Arc::new(BuildahBuilder::new().with_program(buildah)),
                    Arc::new(registry),
                );

                let cancel = pipeline.cancellation_token();
                let signal = tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::warn!("Interrupted, waiting for running builds to finish");
                        cancel.cancel();
                    }
                });

                let result = pipeline.run().await;
                signal.abort();

                match result {
                    Ok(report) => {
                        print_report(&report);
                        Ok(())
                    }
                    Err(failure) => {
                        print_failure(&failure);
                        Err(failure.into())
                    }
                }
            }

            Commands::Render { run } => {
                let config = run.load()?;
                let template = config.template.load()?;
                print!("{}", render(&template, &config.template_params())?);
                Ok(())
            }

            Commands::Platforms { run } => {
                let config = run.load()?;
                for platform in &config.platforms {
                    println!("{platform}");
                }
                Ok(())
            }

            Commands::Images { store_root, json } => {
                let store = LocalStore::open(store_options(store_root))?;
                let images = store.images()?;
                let total = store.total_size();
                store.shutdown(false)?;

                if json {
                    println!("{}", serde_json::to_string_pretty(&images)?);
                    return Ok(());
                }

                if images.is_empty() {
                    println!("No images");
                    return Ok(());
                }

                let rows: Vec<ImageRow> = images.iter().map(ImageRow::from).collect();
                println!("{}", Table::new(rows));
                println!("{} image(s), {total} bytes on disk", images.len());
                Ok(())
            }

            Commands::Rmi {
                images,
                force,
                store_root,
            } => {
                let store = LocalStore::open(store_options(store_root))?;
                let result = remove_images(&store, &images, force);
                store.shutdown(true)?;
                result
            }
        }
    }
}

fn remove_images(store: &LocalStore, images: &[String], force: bool) -> Result<()> {
    for name in images {
        let image = store.lookup(name)?;
        store.delete_image(&image.id, force)?;
        println!("{}", image.id);
    }
    Ok(())
}

fn store_options(root: Option<PathBuf>) -> StoreOptions {
    root.map_or_else(StoreOptions::default, StoreOptions::with_root)
}

fn print_report(report: &RunReport) {
    println!(
        "manifest list id = {}, ref = {}",
        report.manifest_list, report.destination
    );
    println!("digest result {}", report.digest);
    println!("  Platforms: {}", join(&report.platforms));
    println!("  Attempts:  {}", report.attempts.len());
    match &report.cleanup {
        CleanupStatus::Complete { removed } => {
            println!("  Cleanup:   removed {} local image(s)", removed.len());
        }
        status => {
            println!("  Cleanup:   incomplete, left in local store:");
            for id in status.leftover() {
                println!("    {id}");
            }
        }
    }
    for warning in &report.warnings {
        println!("  Warning:   {warning}");
    }
}

fn print_failure(failure: &RunFailure) {
    if failure.retained.is_empty() {
        return;
    }
    eprintln!("Local artifacts kept for inspection:");
    for id in &failure.retained {
        eprintln!("  {id}");
    }
}

fn join(platforms: &[Platform]) -> String {
    platforms
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Tabled)]
struct ImageRow {
    #[tabled(rename = "IMAGE ID")]
    id: String,
    #[tabled(rename = "KIND")]
    kind: String,
    #[tabled(rename = "PLATFORM")]
    platform: String,
    #[tabled(rename = "NAMES")]
    names: String,
    #[tabled(rename = "CREATED")]
    created: String,
}

impl From<&StoredImage> for ImageRow {
    fn from(image: &StoredImage) -> Self {
        let (kind, platform) = match &image.kind {
            ImageKind::Image { platform, .. } => ("image".to_string(), platform.to_string()),
            ImageKind::ManifestList { instances } => {
                (format!("list ({})", instances.len()), String::new())
            }
        };
        Self {
            id: image.id.short().to_string(),
            kind,
            platform,
            names: image.names.join(", "),
            created: image.created.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn overrides_replace_file_values() {
        let cli = Cli::try_parse_from([
            "manifold",
            "build",
            "--platform",
            "linux/amd64,linux/arm64/v8",
            "--jobs",
            "2",
            "--max-retries",
            "5",
            "--manifest",
            "localhost:5000/org/app:v2",
            "--insecure",
            "false",
        ])
        .unwrap();

        let Commands::Build { run, .. } = cli.command else {
            panic!("expected build");
        };
        let config = run.load().unwrap();
        assert_eq!(config.platforms.len(), 2);
        assert_eq!(config.platforms[1].variant.as_deref(), Some("v8"));
        assert_eq!(config.jobs, 2);
        assert_eq!(config.max_push_retries, 5);
        assert_eq!(config.manifest, "localhost:5000/org/app:v2");
        assert!(!config.registry.insecure);
    }

    #[test]
    fn invalid_override_is_rejected() {
        let run = RunArgs {
            jobs: Some(0),
            ..RunArgs::default()
        };
        assert!(run.load().is_err());

        let run = RunArgs {
            platforms: vec!["linux".into()],
            ..RunArgs::default()
        };
        assert!(run.load().is_err());
    }
}
