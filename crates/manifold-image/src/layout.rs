//! Import of OCI image layouts.
//!
//! Image builders write their output as an OCI image layout directory
//! (`oci-layout`, `index.json`, `blobs/<alg>/<hash>`). This module copies the
//! image for one platform out of such a layout into an [`ImageStore`].

use std::fs;
use std::path::{Path, PathBuf};

use manifold_common::{Digest, ManifoldError, ManifoldResult};
use manifold_oci::{ImageIndex, ImageManifest, ManifestDescriptor, Platform, media_types};

use crate::store::{ImageStore, NewImage, StoredImage};

/// Import the image built for `platform` from an OCI layout directory.
///
/// # Errors
///
/// Fails if the directory is not an OCI layout, holds no manifest for the
/// platform, or is missing blobs.
pub fn import_oci_layout(
    store: &dyn ImageStore,
    dir: &Path,
    name: &str,
    platform: &Platform,
) -> ManifoldResult<StoredImage> {
    tracing::debug!(dir = %dir.display(), %platform, "Importing OCI layout");

    if !dir.join("oci-layout").exists() {
        return Err(ManifoldError::Config {
            message: format!("Not a valid OCI image layout: {}", dir.display()),
        });
    }

    let index: ImageIndex = serde_json::from_slice(&fs::read(dir.join("index.json"))?)?;
    let entry = select_manifest(&index, platform).ok_or_else(|| ManifoldError::Config {
        message: format!("No manifest for {platform} in {}", dir.display()),
    })?;

    let manifest_bytes = read_layout_blob(dir, &entry.descriptor.digest)?;
    let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes)?;

    let blobs = manifest
        .blobs()
        .map(|d| read_layout_blob(dir, &d.digest))
        .collect::<ManifoldResult<Vec<_>>>()?;

    store.put_image(NewImage {
        name: name.to_string(),
        platform: platform.clone(),
        manifest: manifest_bytes,
        blobs,
    })
}

/// Pick the manifest entry matching a platform.
///
/// A layout holding a single image manifest without platform information is
/// taken as-is; the store checks the config's platform on import.
fn select_manifest<'a>(index: &'a ImageIndex, platform: &Platform) -> Option<&'a ManifestDescriptor> {
    let images: Vec<_> = index
        .manifests
        .iter()
        .filter(|m| !media_types::is_index(&m.descriptor.media_type))
        .collect();

    images
        .iter()
        .find(|m| m.platform.as_ref() == Some(platform))
        .or_else(|| {
            images.iter().find(|m| {
                m.platform.as_ref().is_some_and(|p| {
                    p.os == platform.os && p.architecture == platform.architecture
                })
            })
        })
        .or_else(|| match images.as_slice() {
            [only] if only.platform.is_none() => Some(only),
            _ => None,
        })
        .copied()
}

fn layout_blob_path(dir: &Path, digest: &str) -> ManifoldResult<PathBuf> {
    let digest: Digest = digest.parse()?;
    Ok(dir.join("blobs").join(digest.algorithm).join(digest.hash))
}

fn read_layout_blob(dir: &Path, digest: &str) -> ManifoldResult<Vec<u8>> {
    let path = layout_blob_path(dir, digest)?;
    fs::read(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ManifoldError::BlobNotFound {
            digest: digest.to_string(),
        },
        _ => e.into(),
    })
}
