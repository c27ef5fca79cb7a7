//! Platform targets.

use std::fmt;
use std::str::FromStr;

use manifold_common::{ManifoldError, ManifoldResult};
use serde::{Deserialize, Serialize};

/// Target platform of an image.
///
/// Identifies one build/publish unit: an operating system, a CPU
/// architecture and an optional architecture variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    /// Architecture.
    pub architecture: String,
    /// Operating system.
    pub os: String,
    /// OS version.
    #[serde(default, rename = "os.version", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    /// Architecture variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Create a platform, normalizing common architecture aliases.
    #[must_use]
    pub fn new(os: &str, architecture: &str, variant: Option<&str>) -> Self {
        let architecture = match architecture {
            "x86_64" | "x86-64" => "amd64",
            "aarch64" => "arm64",
            "i386" | "i686" => "386",
            other => other,
        };
        Self {
            architecture: architecture.to_string(),
            os: os.to_string(),
            os_version: None,
            variant: variant.filter(|v| !v.is_empty()).map(str::to_string),
        }
    }

    /// Create a platform for linux/amd64.
    #[must_use]
    pub fn linux_amd64() -> Self {
        Self::new("linux", "amd64", None)
    }

    /// Create a platform for linux/arm64.
    #[must_use]
    pub fn linux_arm64() -> Self {
        Self::new("linux", "arm64", None)
    }

    /// Parse a platform string of the form `os/arch[/variant]`.
    ///
    /// # Errors
    ///
    /// Returns an error if the string does not have two or three non-empty
    /// `/`-separated components.
    pub fn parse(value: &str) -> ManifoldResult<Self> {
        let invalid = || ManifoldError::InvalidPlatform {
            value: value.to_string(),
        };

        let parts: Vec<&str> = value.trim().split('/').collect();
        if parts.iter().any(|p| p.is_empty() || p.contains(char::is_whitespace)) {
            return Err(invalid());
        }

        match parts.as_slice() {
            [os, arch] => Ok(Self::new(os, arch, None)),
            [os, arch, variant] => Ok(Self::new(os, arch, Some(variant))),
            _ => Err(invalid()),
        }
    }

    /// A filesystem-safe slug, e.g. `linux-arm64-v8`.
    #[must_use]
    pub fn slug(&self) -> String {
        self.to_string().replace('/', "-")
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

impl FromStr for Platform {
    type Err = ManifoldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
