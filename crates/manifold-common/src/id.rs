//! Image ID and content digest types.

use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;

use crate::error::{ManifoldError, ManifoldResult};

/// A validated local store image ID.
///
/// Image IDs must:
/// - Be 1-64 characters long
/// - Contain only lowercase hexadecimal characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(String);

impl ImageId {
    /// Maximum length of an image ID.
    pub const MAX_LENGTH: usize = 64;

    /// Create a new image ID, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID format is invalid.
    pub fn new(id: impl Into<String>) -> ManifoldResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Generate a new random image ID.
    ///
    /// The ID is the SHA-256 of a fresh UUID v4, so it has the same shape as
    /// content-derived IDs.
    #[must_use]
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        Self(Digest::sha256_of(uuid.as_bytes()).hash)
    }

    /// Derive an image ID from a content digest.
    #[must_use]
    pub fn from_digest(digest: &Digest) -> Self {
        Self(digest.hash.clone())
    }

    /// Get the image ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short version of the ID (first 12 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        if self.0.len() <= 12 {
            &self.0
        } else {
            &self.0[..12]
        }
    }

    fn validate(id: &str) -> ManifoldResult<()> {
        if id.is_empty() || id.len() > Self::MAX_LENGTH {
            return Err(ManifoldError::InvalidImageId { id: id.to_string() });
        }

        if !id.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)) {
            return Err(ManifoldError::InvalidImageId { id: id.to_string() });
        }

        Ok(())
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ImageId {
    type Err = ManifoldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ImageId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A content-addressable digest (e.g., sha256:abc123...).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    /// The algorithm used (e.g., "sha256").
    pub algorithm: String,
    /// The hex-encoded hash.
    pub hash: String,
}

impl Digest {
    /// Create a new digest.
    #[must_use]
    pub fn new(algorithm: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            hash: hash.into(),
        }
    }

    /// Create a SHA-256 digest from an already computed hex hash.
    #[must_use]
    pub fn sha256(hash: impl Into<String>) -> Self {
        Self::new("sha256", hash)
    }

    /// Compute the SHA-256 digest of some content.
    #[must_use]
    pub fn sha256_of(data: &[u8]) -> Self {
        use sha2::Digest as _;
        Self::sha256(hex::encode(Sha256::digest(data)))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hash)
    }
}

impl FromStr for Digest {
    type Err = ManifoldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ManifoldError::InvalidDigest {
            value: s.to_string(),
        };

        let (algorithm, hash) = s.split_once(':').ok_or_else(invalid)?;
        if algorithm.is_empty()
            || !algorithm
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c))
        {
            return Err(invalid());
        }
        if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        if algorithm == "sha256" && hash.len() != 64 {
            return Err(invalid());
        }

        Ok(Self::new(algorithm, hash.to_ascii_lowercase()))
    }
}

impl Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn valid_image_ids() {
        assert!(ImageId::new("abc123").is_ok());
        assert!(ImageId::new(HELLO).is_ok());
    }

    #[test]
    fn invalid_image_ids() {
        assert!(ImageId::new("").is_err());
        assert!(ImageId::new("ABC").is_err());
        assert!(ImageId::new("not-hex").is_err());
        assert!(ImageId::new("a".repeat(65)).is_err());
    }

    #[test]
    fn generate_image_id() {
        let id1 = ImageId::generate();
        let id2 = ImageId::generate();
        assert_ne!(id1, id2);
        assert_eq!(id1.as_str().len(), 64);
        assert_eq!(id1.short().len(), 12);
    }

    #[test]
    fn digest_of_content() {
        let digest = Digest::sha256_of(b"hello world");
        assert_eq!(digest.to_string(), format!("sha256:{HELLO}"));
        assert_eq!(ImageId::from_digest(&digest).as_str(), HELLO);
    }

    #[test]
    fn digest_parsing() {
        let digest: Digest = format!("sha256:{HELLO}").parse().unwrap();
        assert_eq!(digest.algorithm, "sha256");
        assert_eq!(digest.hash, HELLO);

        assert!("sha256:abc".parse::<Digest>().is_err());
        assert!("nocolon".parse::<Digest>().is_err());
        assert!("sha256:zzzz".parse::<Digest>().is_err());
    }

    #[test]
    fn digest_serde_as_string() {
        let digest = Digest::sha256(HELLO);
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"sha256:{HELLO}\""));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }
}
