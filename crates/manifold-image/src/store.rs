//! Image store.
//!
//! This module provides local, content-addressed storage for built images
//! and the manifest lists that group them.
//!
//! Layout under the store root:
//! - `blobs/sha256/<hash>`: manifests, configs, layers and index documents
//! - `images.json`: the image table (IDs, names, kinds, manifest digests)

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use manifold_common::{Digest, ImageId, ManifoldError, ManifoldPaths, ManifoldResult};
use manifold_oci::{Descriptor, ImageConfig, ImageIndex, ImageManifest, Platform, media_types};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Options for opening a local store.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Filesystem locations.
    pub paths: ManifoldPaths,
}

impl StoreOptions {
    /// Options for a store rooted at a custom directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            paths: ManifoldPaths::with_root(root),
        }
    }
}

/// What a stored image record describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageKind {
    /// A single-platform image.
    Image {
        /// Platform the image was built for.
        platform: Platform,
        /// Config blob digest.
        config_digest: String,
        /// Layer blob digests.
        layers: Vec<String>,
    },
    /// A multi-platform manifest list (image index).
    ManifestList {
        /// Images listed in the index.
        instances: Vec<ImageId>,
    },
}

/// Stored image metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredImage {
    /// Image ID.
    pub id: ImageId,
    /// Names (references) attached to the image.
    #[serde(default)]
    pub names: Vec<String>,
    /// Image or manifest list details.
    #[serde(flatten)]
    pub kind: ImageKind,
    /// Digest of the manifest (or index) blob.
    pub manifest_digest: String,
    /// Media type of the manifest (or index) blob.
    pub manifest_media_type: String,
    /// Size of the manifest (or index) blob.
    pub manifest_size: u64,
    /// Created timestamp.
    pub created: DateTime<Utc>,
}

impl StoredImage {
    /// Platform of a single-platform image.
    #[must_use]
    pub const fn platform(&self) -> Option<&Platform> {
        match &self.kind {
            ImageKind::Image { platform, .. } => Some(platform),
            ImageKind::ManifestList { .. } => None,
        }
    }

    /// Whether this record is a manifest list.
    #[must_use]
    pub const fn is_manifest_list(&self) -> bool {
        matches!(self.kind, ImageKind::ManifestList { .. })
    }

    /// Descriptor pointing at this image's manifest.
    #[must_use]
    pub fn descriptor(&self) -> Descriptor {
        Descriptor::new(
            self.manifest_media_type.clone(),
            self.manifest_digest.clone(),
            self.manifest_size,
        )
    }

    /// Every blob digest the record keeps alive.
    fn blob_digests(&self) -> Vec<&str> {
        let mut digests = vec![self.manifest_digest.as_str()];
        if let ImageKind::Image {
            config_digest,
            layers,
            ..
        } = &self.kind
        {
            digests.push(config_digest);
            digests.extend(layers.iter().map(String::as_str));
        }
        digests
    }
}

/// An image to be written into the store.
#[derive(Debug, Clone)]
pub struct NewImage {
    /// Name to attach to the image.
    pub name: String,
    /// Platform the image was built for.
    pub platform: Platform,
    /// Raw manifest bytes.
    pub manifest: Vec<u8>,
    /// Config and layer blobs referenced by the manifest.
    ///
    /// Blobs already present in the store may be omitted.
    pub blobs: Vec<Vec<u8>>,
}

impl NewImage {
    /// Build an image from uncompressed layer tarballs.
    ///
    /// Generates a minimal OCI config and manifest for the given platform.
    ///
    /// # Errors
    ///
    /// Returns an error if the generated documents cannot be serialized.
    pub fn from_layers(
        name: impl Into<String>,
        platform: &Platform,
        layers: Vec<Vec<u8>>,
    ) -> ManifoldResult<Self> {
        let diff_ids: Vec<String> = layers
            .iter()
            .map(|l| Digest::sha256_of(l).to_string())
            .collect();

        let config = serde_json::to_vec(&serde_json::json!({
            "architecture": platform.architecture,
            "os": platform.os,
            "variant": platform.variant,
            "rootfs": { "type": "layers", "diff_ids": diff_ids },
        }))?;

        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(media_types::MANIFEST.to_string()),
            config: Descriptor::new(
                media_types::CONFIG,
                Digest::sha256_of(&config).to_string(),
                config.len() as u64,
            ),
            layers: layers
                .iter()
                .map(|l| {
                    Descriptor::new(
                        media_types::LAYER_TAR,
                        Digest::sha256_of(l).to_string(),
                        l.len() as u64,
                    )
                })
                .collect(),
            annotations: BTreeMap::new(),
        };

        let mut blobs = vec![config];
        blobs.extend(layers);

        Ok(Self {
            name: name.into(),
            platform: platform.clone(),
            manifest: serde_json::to_vec(&manifest)?,
            blobs,
        })
    }
}

/// Local image store operations used by the pipeline.
///
/// Implementations must tolerate concurrent [`put_image`](Self::put_image)
/// calls from in-flight builds.
pub trait ImageStore: Send + Sync {
    /// Write an image and its blobs into the store.
    ///
    /// # Errors
    ///
    /// Fails if the manifest is malformed, a referenced blob is missing, or
    /// the config does not describe `image.platform`.
    fn put_image(&self, image: NewImage) -> ManifoldResult<StoredImage>;

    /// Get an image record by ID.
    ///
    /// # Errors
    ///
    /// Returns [`ManifoldError::ImageNotFound`] if there is no such image.
    fn image(&self, id: &ImageId) -> ManifoldResult<StoredImage>;

    /// List all image records.
    ///
    /// # Errors
    ///
    /// Fails if the store has been shut down.
    fn images(&self) -> ManifoldResult<Vec<StoredImage>>;

    /// Read a blob by digest.
    ///
    /// # Errors
    ///
    /// Returns [`ManifoldError::BlobNotFound`] if the blob is absent.
    fn blob(&self, digest: &str) -> ManifoldResult<Vec<u8>>;

    /// Store an image index as a manifest list record.
    ///
    /// # Errors
    ///
    /// Fails if any instance is missing or is itself a manifest list.
    fn create_manifest_list(
        &self,
        name: &str,
        index: &ImageIndex,
        instances: &[ImageId],
    ) -> ManifoldResult<StoredImage>;

    /// Load the image index of a manifest list record.
    ///
    /// # Errors
    ///
    /// Fails if the record is missing or is not a manifest list.
    fn manifest_list(&self, id: &ImageId) -> ManifoldResult<ImageIndex>;

    /// Delete an image or manifest list.
    ///
    /// Without `force`, an image listed by a manifest list is refused.
    ///
    /// # Errors
    ///
    /// Returns [`ManifoldError::ImageInUse`] or
    /// [`ManifoldError::ImageNotFound`].
    fn delete_image(&self, id: &ImageId, force: bool) -> ManifoldResult<()>;

    /// Flush state and close the handle.
    ///
    /// # Errors
    ///
    /// Fails if the table cannot be persisted (unless `force`) or the handle
    /// is already closed.
    fn shutdown(&self, force: bool) -> ManifoldResult<()>;

    /// Whether an image exists.
    ///
    /// # Errors
    ///
    /// Propagates store failures other than a missing image.
    fn contains(&self, id: &ImageId) -> ManifoldResult<bool> {
        match self.image(id) {
            Ok(_) => Ok(true),
            Err(ManifoldError::ImageNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// File-backed local image store.
pub struct LocalStore {
    /// Filesystem locations.
    paths: ManifoldPaths,
    /// Image table.
    images: RwLock<BTreeMap<ImageId, StoredImage>>,
    /// Set once by `shutdown`.
    closed: AtomicBool,
}

impl LocalStore {
    /// Open (or create) a store.
    ///
    /// # Errors
    ///
    /// Fails if the directories cannot be created or the image table is
    /// unreadable.
    pub fn open(options: StoreOptions) -> ManifoldResult<Self> {
        let paths = options.paths;
        paths.create_dirs()?;

        let images = Self::load_images(&paths.images_file())?;
        tracing::debug!(root = %paths.storage().display(), images = images.len(), "Opened image store");

        Ok(Self {
            paths,
            images: RwLock::new(images),
            closed: AtomicBool::new(false),
        })
    }

    /// Get the store directory.
    #[must_use]
    pub fn root(&self) -> PathBuf {
        self.paths.storage()
    }

    /// Find an image by full ID, unique ID prefix, or name.
    ///
    /// # Errors
    ///
    /// Returns [`ManifoldError::ImageNotFound`] if nothing (or more than one
    /// image) matches.
    pub fn lookup(&self, name_or_id: &str) -> ManifoldResult<StoredImage> {
        self.ensure_open()?;
        let images = self.images.read();

        let by_name: Vec<_> = images
            .values()
            .filter(|i| i.names.iter().any(|n| n == name_or_id))
            .collect();
        if let [image] = by_name.as_slice() {
            return Ok((*image).clone());
        }

        let by_id: Vec<_> = images
            .values()
            .filter(|i| i.id.as_str().starts_with(name_or_id))
            .collect();
        match by_id.as_slice() {
            [image] => Ok((*image).clone()),
            _ => Err(ManifoldError::ImageNotFound {
                id: name_or_id.to_string(),
            }),
        }
    }

    /// Store a blob and return its digest.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn store_blob(&self, data: &[u8]) -> ManifoldResult<Digest> {
        let digest = Digest::sha256_of(data);
        let blob_path = self.paths.blob(&digest.algorithm, &digest.hash);

        if !blob_path.exists() {
            let dir = blob_path.parent().unwrap_or_else(|| Path::new("."));
            fs::create_dir_all(dir)?;
            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            tmp.write_all(data)?;
            tmp.persist(&blob_path).map_err(|e| ManifoldError::Io(e.error))?;
            tracing::debug!(digest = %digest, size = data.len(), "Blob stored");
        }

        Ok(digest)
    }

    /// Check if a blob exists.
    #[must_use]
    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).is_ok_and(|p| p.exists())
    }

    /// Calculate total store size.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        walkdir::WalkDir::new(self.paths.storage())
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    }

    fn ensure_open(&self) -> ManifoldResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(ManifoldError::StoreClosed)
        } else {
            Ok(())
        }
    }

    fn blob_path(&self, digest: &str) -> ManifoldResult<PathBuf> {
        let digest: Digest = digest.parse()?;
        Ok(self.paths.blob(&digest.algorithm, &digest.hash))
    }

    fn read_blob(&self, digest: &str) -> ManifoldResult<Vec<u8>> {
        let path = self.blob_path(digest)?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ManifoldError::BlobNotFound {
                digest: digest.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn load_images(path: &Path) -> ManifoldResult<BTreeMap<ImageId, StoredImage>> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(path)?;
        let list: Vec<StoredImage> = serde_json::from_str(&content)?;
        Ok(list.into_iter().map(|i| (i.id.clone(), i)).collect())
    }

    fn save_images(&self, images: &BTreeMap<ImageId, StoredImage>) -> ManifoldResult<()> {
        let list: Vec<&StoredImage> = images.values().collect();
        let content = serde_json::to_vec_pretty(&list)?;

        let mut tmp = tempfile::NamedTempFile::new_in(self.paths.storage())?;
        tmp.write_all(&content)?;
        tmp.persist(self.paths.images_file())
            .map_err(|e| ManifoldError::Io(e.error))?;
        Ok(())
    }

    /// Remove blobs no remaining record references.
    fn gc(&self, images: &BTreeMap<ImageId, StoredImage>) -> ManifoldResult<u64> {
        let referenced: HashSet<&str> = images
            .values()
            .flat_map(StoredImage::blob_digests)
            .collect();

        let mut freed = 0u64;
        let blobs_dir = self.paths.blobs().join("sha256");

        for entry in fs::read_dir(&blobs_dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name() else {
                continue;
            };
            let digest = format!("sha256:{}", name.to_string_lossy());
            if !referenced.contains(digest.as_str()) {
                freed += path.metadata().map(|m| m.len()).unwrap_or(0);
                fs::remove_file(&path)?;
                tracing::debug!(digest = %digest, "Removed unreferenced blob");
            }
        }

        Ok(freed)
    }
}

impl ImageStore for LocalStore {
    fn put_image(&self, image: NewImage) -> ManifoldResult<StoredImage> {
        self.ensure_open()?;
        tracing::info!(name = %image.name, platform = %image.platform, "Saving image to store");

        let manifest: ImageManifest = serde_json::from_slice(&image.manifest)?;

        // Serialize writers so blob GC never races an import.
        let mut images = self.images.write();

        for blob in &image.blobs {
            self.store_blob(blob)?;
        }
        for descriptor in manifest.blobs() {
            if !self.has_blob(&descriptor.digest) {
                return Err(ManifoldError::BlobNotFound {
                    digest: descriptor.digest.clone(),
                });
            }
        }

        let config: ImageConfig = serde_json::from_slice(&self.read_blob(&manifest.config.digest)?)?;
        let built_for = config.platform();
        if built_for.os != image.platform.os || built_for.architecture != image.platform.architecture
        {
            return Err(ManifoldError::Config {
                message: format!(
                    "image config describes {built_for}, expected {}",
                    image.platform
                ),
            });
        }

        let manifest_digest = self.store_blob(&image.manifest)?;
        let config_digest: Digest = manifest.config.digest.parse()?;
        let id = ImageId::from_digest(&config_digest);

        if let Some(existing) = images.get_mut(&id) {
            if !existing.names.contains(&image.name) {
                existing.names.push(image.name.clone());
            }
            let stored = existing.clone();
            self.save_images(&images)?;
            tracing::debug!(id = %id.short(), "Image already present, name attached");
            return Ok(stored);
        }

        let stored = StoredImage {
            id: id.clone(),
            names: vec![image.name],
            kind: ImageKind::Image {
                platform: image.platform,
                config_digest: manifest.config.digest.clone(),
                layers: manifest.layers.iter().map(|l| l.digest.clone()).collect(),
            },
            manifest_digest: manifest_digest.to_string(),
            manifest_media_type: manifest
                .media_type
                .clone()
                .unwrap_or_else(|| media_types::MANIFEST.to_string()),
            manifest_size: image.manifest.len() as u64,
            created: Utc::now(),
        };

        images.insert(id, stored.clone());
        self.save_images(&images)?;

        tracing::info!(
            id = %stored.id.short(),
            digest = %stored.manifest_digest,
            layers = manifest.layers.len(),
            "Image saved"
        );

        Ok(stored)
    }

    fn image(&self, id: &ImageId) -> ManifoldResult<StoredImage> {
        self.ensure_open()?;
        self.images
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ManifoldError::ImageNotFound { id: id.to_string() })
    }

    fn images(&self) -> ManifoldResult<Vec<StoredImage>> {
        self.ensure_open()?;
        Ok(self.images.read().values().cloned().collect())
    }

    fn blob(&self, digest: &str) -> ManifoldResult<Vec<u8>> {
        self.ensure_open()?;
        self.read_blob(digest)
    }

    fn create_manifest_list(
        &self,
        name: &str,
        index: &ImageIndex,
        instances: &[ImageId],
    ) -> ManifoldResult<StoredImage> {
        self.ensure_open()?;
        let mut images = self.images.write();

        for id in instances {
            match images.get(id) {
                Some(image) if !image.is_manifest_list() => {}
                Some(_) => {
                    return Err(ManifoldError::Config {
                        message: format!("manifest list cannot contain manifest list {id}"),
                    });
                }
                None => return Err(ManifoldError::ImageNotFound { id: id.to_string() }),
            }
        }

        let bytes = serde_json::to_vec(index)?;
        let digest = self.store_blob(&bytes)?;

        let stored = StoredImage {
            id: ImageId::generate(),
            names: vec![name.to_string()],
            kind: ImageKind::ManifestList {
                instances: instances.to_vec(),
            },
            manifest_digest: digest.to_string(),
            manifest_media_type: index
                .media_type
                .clone()
                .unwrap_or_else(|| media_types::INDEX.to_string()),
            manifest_size: bytes.len() as u64,
            created: Utc::now(),
        };

        images.insert(stored.id.clone(), stored.clone());
        self.save_images(&images)?;

        tracing::info!(
            id = %stored.id.short(),
            name,
            instances = instances.len(),
            "Manifest list created"
        );

        Ok(stored)
    }

    fn manifest_list(&self, id: &ImageId) -> ManifoldResult<ImageIndex> {
        let record = self.image(id)?;
        if !record.is_manifest_list() {
            return Err(ManifoldError::Config {
                message: format!("image {id} is not a manifest list"),
            });
        }
        let bytes = self.read_blob(&record.manifest_digest)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn delete_image(&self, id: &ImageId, force: bool) -> ManifoldResult<()> {
        self.ensure_open()?;
        tracing::info!(id = %id, force, "Deleting image from store");

        let mut images = self.images.write();
        if !images.contains_key(id) {
            return Err(ManifoldError::ImageNotFound { id: id.to_string() });
        }

        if !force {
            let holder = images.values().find(|i| {
                matches!(&i.kind, ImageKind::ManifestList { instances } if instances.contains(id))
            });
            if let Some(list) = holder {
                return Err(ManifoldError::ImageInUse {
                    id: id.to_string(),
                    manifest_list: list.id.to_string(),
                });
            }
        }

        images.remove(id);
        self.save_images(&images)?;
        let freed = self.gc(&images)?;

        tracing::info!(id = %id.short(), freed_bytes = freed, "Image deleted");
        Ok(())
    }

    fn shutdown(&self, force: bool) -> ManifoldResult<()> {
        self.ensure_open()?;

        let result = {
            let images = self.images.read();
            self.save_images(&images)
        };

        match result {
            Ok(()) => {
                self.closed.store(true, Ordering::Release);
                tracing::debug!("Image store shut down");
                Ok(())
            }
            Err(e) if force => {
                self.closed.store(true, Ordering::Release);
                tracing::warn!(error = %e, "Forced store shutdown without flushing image table");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (tempfile::TempDir, LocalStore) {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(StoreOptions::with_root(temp_dir.path())).unwrap();
        (temp_dir, store)
    }

    fn put(store: &LocalStore, platform: &str, layer: &[u8]) -> StoredImage {
        let platform: Platform = platform.parse().unwrap();
        let image = NewImage::from_layers("localhost/app:build", &platform, vec![layer.to_vec()])
            .unwrap();
        store.put_image(image).unwrap()
    }

    #[test]
    fn test_store_blob() {
        let (_dir, store) = open();

        let data = b"hello world";
        let digest = store.store_blob(data).unwrap().to_string();

        assert!(digest.starts_with("sha256:"));
        assert!(store.has_blob(&digest));
        assert_eq!(store.blob(&digest).unwrap(), data);
        assert!(matches!(
            store.blob(&format!("sha256:{}", "0".repeat(64))),
            Err(ManifoldError::BlobNotFound { .. })
        ));
    }

    #[test]
    fn put_image_records_platform() {
        let (_dir, store) = open();
        let image = put(&store, "linux/arm64", b"layer-arm64");

        assert_eq!(image.platform(), Some(&Platform::linux_arm64()));
        assert!(store.contains(&image.id).unwrap());
        assert_eq!(store.lookup(image.id.short()).unwrap().id, image.id);
    }

    #[test]
    fn put_image_rejects_platform_mismatch() {
        let (_dir, store) = open();
        let mut image =
            NewImage::from_layers("app", &Platform::linux_amd64(), vec![b"x".to_vec()]).unwrap();
        image.platform = Platform::linux_arm64();

        assert!(matches!(
            store.put_image(image),
            Err(ManifoldError::Config { .. })
        ));
    }

    #[test]
    fn put_image_requires_referenced_blobs() {
        let (_dir, store) = open();
        let mut image =
            NewImage::from_layers("app", &Platform::linux_amd64(), vec![b"x".to_vec()]).unwrap();
        image.blobs.truncate(1);

        assert!(matches!(
            store.put_image(image),
            Err(ManifoldError::BlobNotFound { .. })
        ));
    }

    #[test]
    fn manifest_list_protects_instances() {
        let (_dir, store) = open();
        let amd64 = put(&store, "linux/amd64", b"amd64");
        let arm64 = put(&store, "linux/arm64", b"arm64");

        let index = ImageIndex::new(media_types::INDEX);
        let list = store
            .create_manifest_list(
                "localhost/app:v1",
                &index,
                &[amd64.id.clone(), arm64.id.clone()],
            )
            .unwrap();

        assert!(matches!(
            store.delete_image(&amd64.id, false),
            Err(ManifoldError::ImageInUse { .. })
        ));

        store.delete_image(&list.id, false).unwrap();
        store.delete_image(&amd64.id, false).unwrap();
        store.delete_image(&arm64.id, false).unwrap();

        assert!(store.images().unwrap().is_empty());
        assert!(!store.has_blob(&amd64.manifest_digest));
    }

    #[test]
    fn force_delete_ignores_manifest_lists() {
        let (_dir, store) = open();
        let amd64 = put(&store, "linux/amd64", b"amd64");
        store
            .create_manifest_list("app", &ImageIndex::new(media_types::INDEX), &[amd64.id.clone()])
            .unwrap();

        store.delete_image(&amd64.id, true).unwrap();
        assert!(!store.contains(&amd64.id).unwrap());
    }

    #[test]
    fn manifest_list_round_trips_index() {
        let (_dir, store) = open();
        let amd64 = put(&store, "linux/amd64", b"amd64");

        let mut index = ImageIndex::new(media_types::INDEX);
        index.add(manifold_oci::ManifestDescriptor {
            descriptor: amd64.descriptor(),
            platform: Some(Platform::linux_amd64()),
        });
        let list = store
            .create_manifest_list("app", &index, &[amd64.id.clone()])
            .unwrap();

        assert_eq!(store.manifest_list(&list.id).unwrap(), index);
        assert!(store.manifest_list(&amd64.id).is_err());
    }

    #[test]
    fn shutdown_closes_handle() {
        let (dir, store) = open();
        let image = put(&store, "linux/amd64", b"amd64");

        store.shutdown(false).unwrap();
        assert!(matches!(store.images(), Err(ManifoldError::StoreClosed)));
        assert!(matches!(store.shutdown(false), Err(ManifoldError::StoreClosed)));

        let reopened = LocalStore::open(StoreOptions::with_root(dir.path())).unwrap();
        assert!(reopened.contains(&image.id).unwrap());
    }
}
