//! Shared fakes for pipeline tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use manifold_build::{BuildError, BuildRequest, ImageBuilder, RunConfig};
use manifold_build::config::{StoreSettings, TemplateSource};
use manifold_build::push::Backoff;
use manifold_common::{Digest, ImageId};
use manifold_image::{NewImage, PushError, PushErrorKind, PushRequest, RegistryClient};
use manifold_oci::Platform;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Builder that writes a one-layer image per platform, or fails on request.
#[derive(Default)]
pub struct FakeBuilder {
    failures: BTreeMap<String, String>,
    delay: Duration,
    running: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
    cancel_after_first: Option<CancellationToken>,
}

impl FakeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail builds for `platform` with `message`.
    pub fn failing(mut self, platform: &str, message: &str) -> Self {
        self.failures.insert(platform.to_string(), message.to_string());
        self
    }

    /// Make every build take `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Cancel `token` as soon as the first build completes.
    pub fn cancelling(mut self, token: CancellationToken) -> Self {
        self.cancel_after_first = Some(token);
        self
    }

    /// Most builds ever running at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Builds started.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageBuilder for FakeBuilder {
    async fn build(&self, request: BuildRequest<'_>) -> Result<ImageId, BuildError> {
        assert!(request.definition.is_file(), "definition must exist during builds");
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        if let Some(token) = &self.cancel_after_first {
            token.cancel();
        }

        let platform = request.platform.to_string();
        if let Some(message) = self.failures.get(&platform) {
            return Err(BuildError::new(message.clone()));
        }

        let layer = format!("rootfs for {platform}").into_bytes();
        let image = NewImage::from_layers(request.name, request.platform, vec![layer])
            .map_err(|e| BuildError::new(e.to_string()))?;
        request
            .store
            .put_image(image)
            .map(|stored| stored.id)
            .map_err(|e| BuildError::new(e.to_string()))
    }
}

/// What the fake registry saw on one push.
#[derive(Debug, Clone)]
pub struct SeenPush {
    pub destination: String,
    pub platforms: Vec<Platform>,
}

/// Registry that replays scripted results, then succeeds.
pub struct FakeRegistry {
    script: Mutex<VecDeque<Result<Digest, PushError>>>,
    seen: Mutex<Vec<SeenPush>>,
    digest: Digest,
}

impl FakeRegistry {
    pub fn new(script: Vec<Result<Digest, PushError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            seen: Mutex::new(Vec::new()),
            digest: Digest::sha256_of(b"pushed index"),
        }
    }

    pub fn accepting() -> Self {
        Self::new(Vec::new())
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn seen(&self) -> Vec<SeenPush> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn push(&self, request: PushRequest<'_>) -> Result<Digest, PushError> {
        for entry in &request.index.manifests {
            request
                .store
                .blob(&entry.descriptor.digest)
                .map_err(|e| PushError::new(PushErrorKind::Local, e.to_string()))?;
        }

        self.seen.lock().push(SeenPush {
            destination: request.destination.to_string(),
            platforms: request.index.platforms().cloned().collect(),
        });

        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(self.digest.clone()))
    }
}

pub fn transport_error() -> PushError {
    PushError::new(PushErrorKind::Transport, "connection reset by peer")
}

pub fn platforms(values: &[&str]) -> Vec<Platform> {
    values.iter().map(|v| Platform::parse(v).unwrap()).collect()
}

/// A run configuration rooted in `root` with no context files.
pub fn config(root: &Path, platforms: &[&str]) -> RunConfig {
    RunConfig {
        source: "registry.example.com/base:1".to_string(),
        manifest: "localhost:5000/org/catalog:v1".to_string(),
        platforms: self::platforms(platforms),
        backoff: Backoff::None,
        template: TemplateSource::Inline("FROM {{ .Catalog }}\n".to_string()),
        context_files: Vec::new(),
        store: StoreSettings {
            root: Some(root.to_path_buf()),
        },
        ..RunConfig::default()
    }
}
