//! Run configuration.
//!
//! A run is described by a [`RunConfig`], loaded from a TOML, YAML or JSON
//! file (chosen by extension) and then overridden from the command line.
//!
//! # Example (YAML)
//!
//! ```yaml
//! source: registry.redhat.io/redhat/redhat-operator-index:v4.15
//! manifest: localhost:5000/redhat/redhat-operator-index:v4.15
//! platforms: [linux/amd64, linux/arm64]
//! jobs: 4
//! max_push_retries: 3
//! backoff:
//!   kind: exponential
//!   initial_ms: 500
//!   multiplier: 2.0
//!   max_ms: 10000
//! context_files: [./configs]
//! build:
//!   isolation: oci-rootless
//!   pull: always
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use manifold_image::{PushOptions, RegistryAuth, StoreOptions, SystemContext};
use manifold_oci::{Platform, media_types};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::push::{Backoff, RetryPolicy};

/// Build definition used when none is configured.
pub const DEFAULT_TEMPLATE: &str = r"
FROM {{ .Catalog }} AS builder
USER root
RUN rm -fr /configs
COPY ./configs /configs
USER 1001
RUN rm -fr /tmp/cache/*
RUN /bin/opm serve /configs --cache-only --cache-dir=/tmp/cache

FROM {{ .Catalog }}
USER root
RUN rm -fr /configs
COPY ./configs /configs
USER 1001
RUN rm -fr /tmp/cache/*
COPY --from=builder /tmp/cache /tmp/cache
";

/// Capabilities granted to root inside build containers by default.
pub const DEFAULT_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_NET_BIND_SERVICE",
    "CAP_SETFCAP",
    "CAP_SETGID",
    "CAP_SETPCAP",
    "CAP_SETUID",
    "CAP_SYS_CHROOT",
];

/// Full description of one build-and-publish run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Source image the build definition starts from.
    pub source: String,
    /// Destination manifest list reference.
    pub manifest: String,
    /// Target platforms, in order.
    #[serde(with = "platform_strings")]
    pub platforms: Vec<Platform>,
    /// Maximum concurrent platform builds.
    pub jobs: usize,
    /// Push retries after the first attempt.
    pub max_push_retries: u32,
    /// Delay between push attempts.
    pub backoff: Backoff,
    /// Build definition template.
    pub template: TemplateSource,
    /// Template parameters.
    pub params: BTreeMap<String, String>,
    /// Files and directories copied into the build context.
    pub context_files: Vec<PathBuf>,
    /// Settings handed to the image builder.
    pub build: BuildSettings,
    /// Manifest list media type and annotations.
    pub index: IndexSettings,
    /// Push options handed to the registry client.
    pub push: PushOptions,
    /// Registry transport settings.
    pub registry: RegistrySettings,
    /// Local store location.
    pub store: StoreSettings,
    /// What happens to local artifacts when a run ends.
    pub cleanup: CleanupPolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            source: "registry.redhat.io/redhat/redhat-operator-index:v4.15".to_string(),
            manifest: "localhost:5000/redhat/redhat-operator-index:v4.15".to_string(),
            platforms: default_platforms(),
            jobs: 4,
            max_push_retries: 3,
            backoff: Backoff::default(),
            template: TemplateSource::default(),
            params: BTreeMap::new(),
            context_files: vec![PathBuf::from("configs")],
            build: BuildSettings::default(),
            index: IndexSettings::default(),
            push: PushOptions::default(),
            registry: RegistrySettings::default(),
            store: StoreSettings::default(),
            cleanup: CleanupPolicy::default(),
        }
    }
}

fn default_platforms() -> Vec<Platform> {
    ["amd64", "arm64", "ppc64le", "s390x"]
        .iter()
        .map(|arch| Platform::new("linux", arch, None))
        .collect()
}

impl RunConfig {
    /// Load from a file, choosing the format by extension.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> PipelineResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::config(format!("Failed to read {}: {e}", path.display()))
        })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("yaml");

        match ext.to_lowercase().as_str() {
            "toml" => Self::from_toml(&content),
            "json" => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Parse from YAML.
    ///
    /// # Errors
    ///
    /// Returns a configuration error on malformed input.
    pub fn from_yaml(content: &str) -> PipelineResult<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| PipelineError::config(format!("Failed to parse YAML: {e}")))
    }

    /// Parse from TOML.
    ///
    /// # Errors
    ///
    /// Returns a configuration error on malformed input.
    pub fn from_toml(content: &str) -> PipelineResult<Self> {
        toml::from_str(content)
            .map_err(|e| PipelineError::config(format!("Failed to parse TOML: {e}")))
    }

    /// Parse from JSON.
    ///
    /// # Errors
    ///
    /// Returns a configuration error on malformed input.
    pub fn from_json(content: &str) -> PipelineResult<Self> {
        serde_json::from_str(content)
            .map_err(|e| PipelineError::config(format!("Failed to parse JSON: {e}")))
    }

    /// Check the configuration for values no run can succeed with.
    ///
    /// The destination reference is only checked for presence; it is
    /// resolved by the push stage.
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first problem found.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.jobs == 0 {
            return Err(PipelineError::config("jobs must be at least 1"));
        }
        if self.platforms.is_empty() {
            return Err(PipelineError::config("at least one platform is required"));
        }
        let mut seen = HashSet::new();
        for platform in &self.platforms {
            if !seen.insert(platform) {
                return Err(PipelineError::config(format!(
                    "platform {platform} listed more than once"
                )));
            }
        }
        if self.manifest.trim().is_empty() {
            return Err(PipelineError::config("manifest reference is empty"));
        }
        if self.source.trim().is_empty() {
            return Err(PipelineError::config("source reference is empty"));
        }
        if let Some(media_type) = &self.index.media_type {
            if !media_types::is_index(media_type) {
                return Err(PipelineError::config(format!(
                    "{media_type} is not a manifest list media type"
                )));
            }
        }
        if let Backoff::Exponential { multiplier, .. } = self.backoff {
            if multiplier.is_nan() || multiplier < 1.0 {
                return Err(PipelineError::config(format!(
                    "backoff multiplier must be at least 1.0, got {multiplier}"
                )));
            }
        }
        Ok(())
    }

    /// Template parameters with the source image exposed as `Catalog` and `Source`.
    #[must_use]
    pub fn template_params(&self) -> BTreeMap<String, String> {
        let mut params = self.params.clone();
        for key in ["Catalog", "Source"] {
            params
                .entry(key.to_string())
                .or_insert_with(|| self.source.clone());
        }
        params
    }

    /// Retry policy for the push stage.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_push_retries,
            backoff: self.backoff.clone(),
        }
    }

    /// Store options for the local store.
    #[must_use]
    pub fn store_options(&self) -> StoreOptions {
        self.store
            .root
            .as_ref()
            .map_or_else(StoreOptions::default, StoreOptions::with_root)
    }
}

/// Where the build definition template comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateSource {
    /// Template text given directly.
    Inline(String),
    /// Template read from a file.
    File(PathBuf),
}

impl Default for TemplateSource {
    fn default() -> Self {
        Self::Inline(DEFAULT_TEMPLATE.to_string())
    }
}

impl TemplateSource {
    /// Template text.
    ///
    /// # Errors
    ///
    /// Returns a preparation error if a template file cannot be read.
    pub fn load(&self) -> PipelineResult<String> {
        match self {
            Self::Inline(text) => Ok(text.clone()),
            Self::File(path) => fs::read_to_string(path).map_err(|e| {
                PipelineError::preparation(format!(
                    "Failed to read template {}: {e}",
                    path.display()
                ))
            }),
        }
    }
}

/// Network mode for build containers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkMode {
    /// No network access.
    #[default]
    Disabled,
    /// A private network namespace.
    Private,
    /// The host network.
    Host,
}

impl NetworkMode {
    /// Builder argument value.
    #[must_use]
    pub const fn as_arg(self) -> &'static str {
        match self {
            Self::Disabled => "none",
            Self::Private => "private",
            Self::Host => "host",
        }
    }
}

/// When base images are pulled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    /// Always pull, even when present.
    #[default]
    Always,
    /// Pull only when missing.
    Missing,
    /// Pull when the remote is newer.
    Newer,
    /// Never pull.
    Never,
}

impl PullPolicy {
    /// Builder argument value.
    #[must_use]
    pub const fn as_arg(self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::Missing => "missing",
            Self::Newer => "newer",
            Self::Never => "never",
        }
    }
}

/// Process isolation used for build steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Isolation {
    /// Rootless OCI runtime.
    #[default]
    OciRootless,
    /// OCI runtime.
    Oci,
    /// chroot.
    Chroot,
}

impl Isolation {
    /// Builder argument value.
    #[must_use]
    pub const fn as_arg(self) -> &'static str {
        match self {
            Self::OciRootless => "rootless",
            Self::Oci => "oci",
            Self::Chroot => "chroot",
        }
    }
}

/// Layer cache directives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Disable the layer cache entirely.
    pub disabled: bool,
    /// Remote cache sources.
    pub from: Vec<String>,
    /// Remote cache destinations.
    pub to: Vec<String>,
    /// Maximum age of cached layers (e.g. `24h`).
    pub ttl: Option<String>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            disabled: true,
            from: Vec::new(),
            to: Vec::new(),
            ttl: None,
        }
    }
}

/// Settings shared by every platform build.
///
/// The pipeline passes these to the image builder unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    /// Capabilities granted to build containers.
    pub add_capabilities: Vec<String>,
    /// Capabilities removed from build containers.
    pub drop_capabilities: Vec<String>,
    /// Network mode.
    pub network: NetworkMode,
    /// Base image pull policy.
    pub pull: PullPolicy,
    /// Layer cache directives.
    pub cache: CacheSettings,
    /// Process isolation.
    pub isolation: Isolation,
    /// OCI runtime binary.
    pub runtime: String,
    /// Extra runtime flags.
    pub runtime_args: Vec<String>,
    /// Manifest media type of built images.
    pub output_format: String,
    /// Image labels.
    pub labels: BTreeMap<String, String>,
    /// Manifest annotations.
    pub annotations: BTreeMap<String, String>,
    /// Keep intermediate layers.
    pub layers: bool,
    /// Squash all layers into one.
    pub squash: bool,
    /// Key to sign built images with.
    pub sign_by: Option<String>,
    /// Retries for base image pulls and pushes inside the builder.
    pub retries: u32,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            add_capabilities: DEFAULT_CAPABILITIES.iter().map(ToString::to_string).collect(),
            drop_capabilities: Vec::new(),
            network: NetworkMode::default(),
            pull: PullPolicy::default(),
            cache: CacheSettings::default(),
            isolation: Isolation::default(),
            runtime: "crun".to_string(),
            runtime_args: Vec::new(),
            output_format: media_types::MANIFEST.to_string(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            layers: false,
            squash: false,
            sign_by: None,
            retries: 2,
        }
    }
}

/// Manifest list settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    /// Media type of the manifest list; follows the build output format when unset.
    pub media_type: Option<String>,
    /// Annotations on the manifest list.
    pub annotations: BTreeMap<String, String>,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            media_type: None,
            annotations: BTreeMap::new(),
        }
    }
}

impl IndexSettings {
    /// Manifest list media type for images built as `output_format`.
    #[must_use]
    pub fn media_type_for(&self, output_format: &str) -> String {
        self.media_type
            .clone()
            .unwrap_or_else(|| media_types::index_for(output_format).to_string())
    }
}

/// Registry transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// Skip TLS verification and allow plain HTTP.
    pub insecure: bool,
    /// Always use plain HTTP.
    pub plain_http: bool,
    /// Architecture override hint.
    pub architecture_choice: Option<String>,
    /// OS override hint.
    pub os_choice: Option<String>,
    /// Variant override hint.
    pub variant_choice: Option<String>,
    /// Registry username.
    pub username: Option<String>,
    /// Registry password.
    pub password: Option<String>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            insecure: true,
            plain_http: false,
            architecture_choice: None,
            os_choice: None,
            variant_choice: None,
            username: None,
            password: None,
            timeout_secs: 300,
        }
    }
}

impl RegistrySettings {
    /// Per-request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Transport context for the registry client.
    #[must_use]
    pub fn system_context(&self) -> SystemContext {
        SystemContext {
            insecure_skip_tls_verify: self.insecure,
            architecture_choice: self.architecture_choice.clone(),
            os_choice: self.os_choice.clone(),
            variant_choice: self.variant_choice.clone(),
            auth: self.username.as_ref().map(|username| RegistryAuth {
                username: username.clone(),
                password: self.password.clone().unwrap_or_default(),
            }),
        }
    }
}

/// Local store location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Store root; the standard data directory when unset.
    pub root: Option<PathBuf>,
}

/// Artifact handling at the end of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupPolicy {
    /// Keep local artifacts when the run fails.
    pub retain_on_failure: bool,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            retain_on_failure: true,
        }
    }
}

mod platform_strings {
    use manifold_oci::Platform;
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _, ser::SerializeSeq};

    pub fn serialize<S: Serializer>(platforms: &[Platform], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(platforms.len()))?;
        for platform in platforms {
            seq.serialize_element(&platform.to_string())?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Platform>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|s| Platform::parse(s).map_err(D::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_publisher_settings() {
        let config = RunConfig::default();
        assert_eq!(config.jobs, 4);
        assert_eq!(config.max_push_retries, 3);
        assert_eq!(config.platforms.len(), 4);
        assert_eq!(config.platforms[3].to_string(), "linux/s390x");
        assert_eq!(config.build.runtime, "crun");
        assert_eq!(config.build.isolation, Isolation::OciRootless);
        assert_eq!(config.build.pull, PullPolicy::Always);
        assert_eq!(config.build.network, NetworkMode::Disabled);
        assert!(config.build.cache.disabled);
        assert_eq!(config.build.retries, 2);
        assert!(config.registry.insecure);
        assert!(config.push.remove_signatures);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_yaml() {
        let yaml = r"
source: quay.io/org/base:1
manifest: localhost:5000/org/app:v1
platforms: [linux/amd64, linux/arm/v7]
jobs: 2
backoff:
  kind: fixed
  delay_ms: 250
build:
  isolation: chroot
  network: host
push:
  selection: index-only
";
        let config = RunConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.platforms[1].variant.as_deref(), Some("v7"));
        assert_eq!(config.jobs, 2);
        assert_eq!(config.backoff, Backoff::Fixed { delay_ms: 250 });
        assert_eq!(config.build.isolation, Isolation::Chroot);
        assert_eq!(config.build.network, NetworkMode::Host);
        assert_eq!(config.build.runtime, "crun");
        assert_eq!(
            config.push.selection,
            manifold_image::ImageListSelection::IndexOnly
        );
    }

    #[test]
    fn parse_toml() {
        let toml = r#"
source = "quay.io/org/base:1"
manifest = "localhost:5000/org/app:v1"
platforms = ["linux/amd64"]
max_push_retries = 0

[template]
file = "Containerfile.tmpl"

[registry]
insecure = false
username = "ci"
password = "secret"
"#;
        let config = RunConfig::from_toml(toml).unwrap();
        assert_eq!(config.max_push_retries, 0);
        assert_eq!(
            config.template,
            TemplateSource::File(PathBuf::from("Containerfile.tmpl"))
        );
        let system = config.registry.system_context();
        assert!(!system.insecure_skip_tls_verify);
        assert_eq!(system.auth.unwrap().username, "ci");
    }

    #[test]
    fn parse_json_rejects_bad_platform() {
        let err = RunConfig::from_json(r#"{"platforms": ["linux"]}"#).unwrap_err();
        assert!(matches!(err, PipelineError::Config { .. }));
    }

    #[test]
    fn validate_rejects_unusable_values() {
        let mut config = RunConfig {
            jobs: 0,
            ..RunConfig::default()
        };
        assert!(config.validate().is_err());

        config.jobs = 1;
        config.platforms.push(Platform::linux_amd64());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("linux/amd64 listed more than once"));

        config.platforms = Vec::new();
        assert!(config.validate().is_err());

        config.platforms = vec![Platform::linux_amd64()];
        config.manifest = "  ".into();
        assert!(config.validate().is_err());

        config.manifest = "localhost:5000/a:b".into();
        config.backoff = Backoff::Exponential {
            initial_ms: 10,
            multiplier: 0.5,
            max_ms: 100,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn template_params_expose_source() {
        let mut config = RunConfig::default();
        config.params.insert("Source".into(), "override".into());
        let params = config.template_params();
        assert_eq!(params["Catalog"], config.source);
        assert_eq!(params["Source"], "override");
    }

    #[test]
    fn index_media_type_follows_output_format() {
        let mut config = RunConfig::default();
        assert_eq!(config.index.media_type_for(&config.build.output_format), media_types::INDEX);
        assert_eq!(
            config.index.media_type_for(media_types::DOCKER_MANIFEST),
            media_types::DOCKER_INDEX
        );

        config.index.media_type = Some(media_types::MANIFEST.to_string());
        assert!(config.validate().is_err());
    }
}
