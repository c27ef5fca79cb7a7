//! # manifold-oci
//!
//! OCI (Open Container Initiative) image specification types for Manifold.
//!
//! This crate provides Rust types for:
//! - OCI image manifests and image indexes (multi-platform manifests)
//! - Content descriptors
//! - Platform targets (`os/arch[/variant]`)

#![warn(missing_docs)]

pub mod image;
pub mod platform;

pub use image::{Descriptor, ImageConfig, ImageIndex, ImageManifest, ManifestDescriptor, media_types};
pub use platform::Platform;
