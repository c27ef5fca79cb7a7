//! # manifold-image
//!
//! Container image management for Manifold.
//!
//! This crate provides:
//! - Image reference parsing and resolution
//! - The local image store (content-addressed blobs plus an image table)
//! - Import of OCI image layouts produced by image builders
//! - The registry client used to publish multi-platform manifests

#![warn(missing_docs)]

/// OCI image layout import.
pub mod layout;
pub mod reference;
/// Registry client.
pub mod registry;
/// Local image store.
pub mod store;

pub use reference::{ImageReference, ImageTag};
pub use registry::{
    DistributionClient, ImageListSelection, PushError, PushErrorKind, PushOptions, PushRequest,
    RegistryAuth, RegistryClient, SystemContext,
};
pub use store::{ImageKind, ImageStore, LocalStore, NewImage, StoreOptions, StoredImage};
