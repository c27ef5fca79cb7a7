//! Common error types for the Manifold crates.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`ManifoldError`].
pub type ManifoldResult<T> = Result<T, ManifoldError>;

/// Common errors across the Manifold crates.
#[derive(Error, Diagnostic, Debug)]
pub enum ManifoldError {
    /// Image not found in the local store.
    #[error("Image not found: {id}")]
    #[diagnostic(code(manifold::image::not_found))]
    ImageNotFound {
        /// The image ID or name that was not found.
        id: String,
    },

    /// Invalid image ID format.
    #[error("Invalid image ID: {id}")]
    #[diagnostic(
        code(manifold::image::invalid_id),
        help("Image IDs are 1-64 lowercase hexadecimal characters")
    )]
    InvalidImageId {
        /// The invalid image ID.
        id: String,
    },

    /// Blob not found in the local store.
    #[error("Blob not found: {digest}")]
    #[diagnostic(code(manifold::image::blob_not_found))]
    BlobNotFound {
        /// The missing blob digest.
        digest: String,
    },

    /// Image is still referenced by a manifest list.
    #[error("Image {id} is referenced by manifest list {manifest_list}")]
    #[diagnostic(
        code(manifold::image::in_use),
        help("Delete the manifest list first, or delete with force")
    )]
    ImageInUse {
        /// The image that was asked to be deleted.
        id: String,
        /// The manifest list referencing it.
        manifest_list: String,
    },

    /// Invalid image reference.
    #[error("Invalid image reference '{reference}': {reason}")]
    #[diagnostic(
        code(manifold::reference::invalid),
        help("References look like 'registry.example.com:5000/org/name:tag'")
    )]
    InvalidReference {
        /// The rejected reference.
        reference: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Invalid platform string.
    #[error("Invalid platform: {value}")]
    #[diagnostic(
        code(manifold::platform::invalid),
        help("Use the form 'os/arch' or 'os/arch/variant', e.g. 'linux/arm64/v8'")
    )]
    InvalidPlatform {
        /// The invalid value.
        value: String,
    },

    /// Invalid content digest.
    #[error("Invalid digest: {value}")]
    #[diagnostic(code(manifold::digest::invalid))]
    InvalidDigest {
        /// The invalid value.
        value: String,
    },

    /// The store handle was already shut down.
    #[error("Image store has been shut down")]
    #[diagnostic(code(manifold::store::closed))]
    StoreClosed,

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(manifold::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(manifold::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(manifold::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(manifold::internal),
        help("This is a bug, please report it at https://github.com/manifold-build/manifold/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl From<serde_json::Error> for ManifoldError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
