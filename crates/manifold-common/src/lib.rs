//! # manifold-common
//!
//! Shared utilities and types for the Manifold image publisher.
//!
//! This crate provides common functionality used across all Manifold crates:
//! - Image ID and content digest types
//! - Standard filesystem paths
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{ManifoldError, ManifoldResult};
pub use id::{Digest, ImageId};
pub use paths::ManifoldPaths;
