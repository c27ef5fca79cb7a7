//! Image reference parsing.

use std::str::FromStr;

use manifold_common::{Digest, ManifoldError, ManifoldResult};
use once_cell::sync::Lazy;
use regex::Regex;

static REPOSITORY_COMPONENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").expect("static regex")
});

static TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("static regex"));

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname (with optional port).
    pub registry: String,
    /// Repository name.
    pub repository: String,
    /// Tag or digest.
    pub reference: ImageTag,
}

/// Image tag or digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageTag {
    /// A tag (e.g., "latest").
    Tag(String),
    /// A digest (e.g., "sha256:abc123...").
    Digest(Digest),
}

impl ImageReference {
    /// Default registry.
    pub const DEFAULT_REGISTRY: &'static str = "docker.io";
    /// Default tag.
    pub const DEFAULT_TAG: &'static str = "latest";
    /// Transport prefix accepted in front of registry references.
    pub const DOCKER_TRANSPORT: &'static str = "docker://";

    /// Parse an image reference string.
    ///
    /// Examples:
    /// - `alpine` -> docker.io/library/alpine:latest
    /// - `alpine:3.19` -> docker.io/library/alpine:3.19
    /// - `myuser/myapp` -> docker.io/myuser/myapp:latest
    /// - `localhost:5000/org/app:v1.0` -> localhost:5000/org/app:v1.0
    /// - `docker://ghcr.io/org/app@sha256:...` -> ghcr.io/org/app@sha256:...
    ///
    /// # Errors
    ///
    /// Returns [`ManifoldError::InvalidReference`] when the string is empty,
    /// names an unsupported transport, or contains an invalid repository,
    /// tag or digest.
    pub fn parse(reference: &str) -> ManifoldResult<Self> {
        let original = reference;
        let invalid = |reason: &str| ManifoldError::InvalidReference {
            reference: original.to_string(),
            reason: reason.to_string(),
        };

        let reference = reference.trim();
        let reference = reference
            .strip_prefix(Self::DOCKER_TRANSPORT)
            .unwrap_or(reference);

        if reference.is_empty() {
            return Err(invalid("empty reference"));
        }
        if reference.contains("://") {
            return Err(invalid("only the docker:// transport is supported"));
        }

        // Check for digest
        let (name, tag) = if let Some((name, digest)) = reference.split_once('@') {
            let digest = digest
                .parse::<Digest>()
                .map_err(|_| invalid("malformed digest"))?;
            (name, ImageTag::Digest(digest))
        } else if let Some(idx) = reference.rfind(':') {
            // registry:port/image has a '/' after the colon
            let potential_tag = &reference[idx + 1..];
            if potential_tag.contains('/') {
                (reference, ImageTag::Tag(Self::DEFAULT_TAG.to_string()))
            } else {
                if !TAG.is_match(potential_tag) {
                    return Err(invalid("malformed tag"));
                }
                (
                    &reference[..idx],
                    ImageTag::Tag(potential_tag.to_string()),
                )
            }
        } else {
            (reference, ImageTag::Tag(Self::DEFAULT_TAG.to_string()))
        };

        // Parse registry and repository
        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            Some(_) => (Self::DEFAULT_REGISTRY.to_string(), name.to_string()),
            None => (
                Self::DEFAULT_REGISTRY.to_string(),
                format!("library/{name}"),
            ),
        };

        if registry.is_empty() || registry.contains(char::is_whitespace) {
            return Err(invalid("malformed registry host"));
        }
        if repository.is_empty()
            || !repository
                .split('/')
                .all(|component| REPOSITORY_COMPONENT.is_match(component))
        {
            return Err(invalid(
                "repository must be lowercase alphanumeric components separated by '/'",
            ));
        }

        Ok(Self {
            registry,
            repository,
            reference: tag,
        })
    }

    /// Host to talk to for the registry API.
    #[must_use]
    pub fn api_host(&self) -> &str {
        if self.registry == Self::DEFAULT_REGISTRY {
            "registry-1.docker.io"
        } else {
            &self.registry
        }
    }

    /// The tag or digest string used in manifest URLs.
    #[must_use]
    pub fn manifest_reference(&self) -> String {
        match &self.reference {
            ImageTag::Tag(t) => t.clone(),
            ImageTag::Digest(d) => d.to_string(),
        }
    }

    /// Get the full reference string.
    #[must_use]
    pub fn full_reference(&self) -> String {
        let tag = match &self.reference {
            ImageTag::Tag(t) => format!(":{t}"),
            ImageTag::Digest(d) => format!("@{d}"),
        };
        format!("{}/{}{}", self.registry, self.repository, tag)
    }

    /// Whether the registry is on the local machine.
    #[must_use]
    pub fn is_local(&self) -> bool {
        let host = self
            .registry
            .rsplit_once(':')
            .map_or(self.registry.as_str(), |(h, _)| h);
        matches!(host, "localhost" | "127.0.0.1" | "[::1]")
    }
}

impl FromStr for ImageReference {
    type Err = ManifoldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}
