use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use manifold_common::Digest;
use manifold_oci::{ImageIndex, ImageManifest, media_types};
use miette::Diagnostic;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, header};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reference::ImageReference;
use crate::store::ImageStore;

/// Basic-auth credentials for a registry.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct RegistryAuth {
    /// Username.
    pub username: String,
    /// Password or token.
    pub password: String,
}

impl fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Transport settings handed to the registry client unchanged.
#[derive(Debug, Clone, Default)]
pub struct SystemContext {
    /// Skip TLS verification and allow plain HTTP fallback.
    pub insecure_skip_tls_verify: bool,
    /// Architecture override hint.
    pub architecture_choice: Option<String>,
    /// OS override hint.
    pub os_choice: Option<String>,
    /// Variant override hint.
    pub variant_choice: Option<String>,
    /// Credentials, if any.
    pub auth: Option<RegistryAuth>,
}

/// Which images of a manifest list are pushed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageListSelection {
    /// The index and every per-platform image it lists.
    #[default]
    All,
    /// Only the index document.
    IndexOnly,
}

/// Options for pushing a manifest list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushOptions {
    /// Drop embedded signatures before pushing.
    pub remove_signatures: bool,
    /// Requested per-platform manifest format.
    pub manifest_type: String,
    /// Extra compression formats to publish layers in.
    pub add_compression: Vec<String>,
    /// Recompress even when a layer already uses the requested format.
    pub force_compression_format: bool,
    /// Key to sign with.
    pub sign_by: Option<String>,
    /// Which images to push.
    pub selection: ImageListSelection,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            remove_signatures: true,
            manifest_type: media_types::MANIFEST.to_string(),
            add_compression: Vec::new(),
            force_compression_format: false,
            sign_by: None,
            selection: ImageListSelection::All,
        }
    }
}

/// Everything a registry client needs to publish one manifest list.
#[derive(Clone, Copy)]
pub struct PushRequest<'a> {
    /// The index to publish.
    pub index: &'a ImageIndex,
    /// Where to publish it.
    pub destination: &'a ImageReference,
    /// Store holding the referenced manifests and blobs.
    pub store: &'a dyn ImageStore,
    /// Push options.
    pub options: &'a PushOptions,
    /// Transport settings.
    pub system: &'a SystemContext,
}

/// Classification of a failed push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushErrorKind {
    /// Connection, TLS or timeout failure.
    Transport,
    /// The registry asked us to slow down (408/429).
    Throttled,
    /// Server-side failure (5xx).
    Server,
    /// Authentication failed (401).
    Unauthorized,
    /// Authorization failed (403).
    Denied,
    /// The destination reference is malformed.
    InvalidReference,
    /// The registry rejected the content.
    Rejected,
    /// Reading local content failed.
    Local,
}

impl PushErrorKind {
    /// Whether a later attempt may succeed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transport | Self::Throttled | Self::Server)
    }
}

impl fmt::Display for PushErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transport => "transport error",
            Self::Throttled => "throttled",
            Self::Server => "server error",
            Self::Unauthorized => "unauthorized",
            Self::Denied => "access denied",
            Self::InvalidReference => "invalid reference",
            Self::Rejected => "rejected by registry",
            Self::Local => "local content error",
        };
        f.write_str(s)
    }
}

/// A failed push attempt.
#[derive(Error, Diagnostic, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
#[diagnostic(code(manifold::registry::push))]
pub struct PushError {
    /// Failure class.
    pub kind: PushErrorKind,
    /// Details.
    pub message: String,
}

impl PushError {
    /// Create a push error.
    pub fn new(kind: PushErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Whether a later attempt may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Classify an unexpected HTTP status.
    #[must_use]
    pub fn from_status(status: StatusCode, context: &str, body: &str) -> Self {
        let kind = match status {
            StatusCode::UNAUTHORIZED => PushErrorKind::Unauthorized,
            StatusCode::FORBIDDEN => PushErrorKind::Denied,
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => PushErrorKind::Throttled,
            s if s.is_server_error() => PushErrorKind::Server,
            _ => PushErrorKind::Rejected,
        };
        let body = body.trim();
        let message = if body.is_empty() {
            format!("{context}: {status}")
        } else {
            format!("{context}: {status}: {body}")
        };
        Self::new(kind, message)
    }

    fn from_reqwest(err: &reqwest::Error, context: &str) -> Self {
        let kind = if err.is_builder() {
            PushErrorKind::InvalidReference
        } else {
            PushErrorKind::Transport
        };
        Self::new(kind, format!("{context}: {err}"))
    }

    fn local(err: impl fmt::Display) -> Self {
        Self::new(PushErrorKind::Local, err.to_string())
    }
}

/// Publishes manifest lists to a remote registry.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Push the index (and, per the selection, every image it lists).
    ///
    /// Returns the registry digest of the pushed index.
    async fn push(&self, request: PushRequest<'_>) -> Result<Digest, PushError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    // Some registries use access_token
    access_token: Option<String>,
}

/// `key=value` or `key="quoted, value"` in a `WWW-Authenticate` header.
static CHALLENGE_PARAM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([A-Za-z][A-Za-z0-9_-]*)\s*=\s*(?:"((?:[^"\\]|\\.)*)"|([^\s,]+))"#)
        .expect("static regex")
});

/// Registry client speaking the OCI distribution API over HTTP.
pub struct DistributionClient {
    timeout: Duration,
    plain_http: bool,
}

impl Default for DistributionClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DistributionClient {
    /// Create a new client with a five minute request timeout.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            plain_http: false,
        }
    }

    /// Set the per-request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Talk plain HTTP without trying HTTPS first.
    #[must_use]
    pub const fn with_plain_http(mut self, plain_http: bool) -> Self {
        self.plain_http = plain_http;
        self
    }

    fn http_client(
        &self,
        destination: &ImageReference,
        system: &SystemContext,
    ) -> Result<Client, PushError> {
        let mut builder = Client::builder()
            .danger_accept_invalid_certs(system.insecure_skip_tls_verify)
            .timeout(self.timeout)
            .user_agent(concat!("manifold/", env!("CARGO_PKG_VERSION")));

        // A proxy cannot reach a registry on this machine
        if destination.is_local() {
            builder = builder.no_proxy();
        } else if system.insecure_skip_tls_verify || self.plain_http {
            tracing::warn!(
                registry = %destination.registry,
                "TLS verification disabled for a remote registry"
            );
        }

        builder
            .build()
            .map_err(|e| PushError::local(format!("Failed to build HTTP client: {e}")))
    }

    /// Pick https, falling back to plain http for insecure registries.
    async fn resolve_base(
        &self,
        client: &Client,
        destination: &ImageReference,
        system: &SystemContext,
    ) -> Result<String, PushError> {
        let host = destination.api_host();
        if self.plain_http {
            return Ok(format!("http://{host}"));
        }
        let https = format!("https://{host}");
        if !system.insecure_skip_tls_verify {
            return Ok(https);
        }

        match client.get(format!("{https}/v2/")).send().await {
            Ok(_) => Ok(https),
            Err(e) if e.is_connect() || e.is_request() => {
                tracing::debug!(host, error = %e, "HTTPS unavailable, using plain HTTP");
                Ok(format!("http://{host}"))
            }
            Err(e) => Err(PushError::from_reqwest(&e, "Failed to reach registry")),
        }
    }
}

#[async_trait]
impl RegistryClient for DistributionClient {
    async fn push(&self, request: PushRequest<'_>) -> Result<Digest, PushError> {
        let destination = request.destination;
        let options = request.options;
        tracing::info!(destination = %destination, "Pushing manifest list");

        if options.sign_by.is_some() {
            tracing::warn!("Signing is not supported by this client, sign_by ignored");
        }
        if !options.add_compression.is_empty() || options.force_compression_format {
            tracing::debug!(
                formats = ?options.add_compression,
                "Layers are pushed in their stored compression"
            );
        }

        let client = self.http_client(destination, request.system)?;
        let base = self.resolve_base(&client, destination, request.system).await?;
        let mut session = Session {
            client,
            base,
            repository: &destination.repository,
            auth: request.system.auth.as_ref(),
            token: None,
        };

        if options.selection == ImageListSelection::All {
            for entry in &request.index.manifests {
                let digest = &entry.descriptor.digest;
                let manifest_bytes = request.store.blob(digest).map_err(PushError::local)?;
                let manifest: ImageManifest =
                    serde_json::from_slice(&manifest_bytes).map_err(PushError::local)?;

                if entry.descriptor.media_type != options.manifest_type {
                    tracing::warn!(
                        %digest,
                        stored = %entry.descriptor.media_type,
                        requested = %options.manifest_type,
                        "Manifest format conversion is not supported, pushing as stored"
                    );
                }

                for blob in manifest.blobs() {
                    session.ensure_blob(request.store, &blob.digest).await?;
                }
                session
                    .put_manifest(digest, &entry.descriptor.media_type, manifest_bytes)
                    .await?;
            }
        }

        let index_bytes = serde_json::to_vec(request.index).map_err(PushError::local)?;
        let media_type = request
            .index
            .media_type
            .as_deref()
            .unwrap_or(media_types::INDEX);
        let digest = session
            .put_manifest(&destination.manifest_reference(), media_type, index_bytes)
            .await?;

        tracing::info!(destination = %destination, digest = %digest, "Manifest list pushed");
        Ok(digest)
    }
}

/// Per-push connection state.
struct Session<'a> {
    client: Client,
    base: String,
    repository: &'a str,
    auth: Option<&'a RegistryAuth>,
    token: Option<String>,
}

impl Session<'_> {
    async fn send(
        &mut self,
        method: Method,
        url: &str,
        build: impl Fn(RequestBuilder) -> RequestBuilder + Send,
    ) -> Result<Response, PushError> {
        for round in 0..2 {
            let mut req = build(self.client.request(method.clone(), url));
            if let Some(token) = &self.token {
                req = req.bearer_auth(token);
            } else if let Some(auth) = self.auth {
                req = req.basic_auth(&auth.username, Some(&auth.password));
            }

            let response = req
                .send()
                .await
                .map_err(|e| PushError::from_reqwest(&e, url))?;

            if response.status() == StatusCode::UNAUTHORIZED && round == 0 && self.token.is_none()
            {
                if let Some(challenge) = bearer_challenge(&response) {
                    self.token = Some(self.fetch_token(&challenge).await?);
                    continue;
                }
            }
            return Ok(response);
        }
        Err(PushError::new(
            PushErrorKind::Unauthorized,
            format!("{url}: authentication did not succeed"),
        ))
    }

    async fn fetch_token(&self, params: &HashMap<String, String>) -> Result<String, PushError> {
        let realm = params.get("realm").ok_or_else(|| {
            PushError::new(PushErrorKind::Unauthorized, "Missing realm in Www-Authenticate")
        })?;
        // Challenges on reads only ask for pull; uploads need push too
        let push_scope = format!("repository:{}:pull,push", self.repository);
        let mut query = Vec::new();
        if let Some(scope) = params.get("scope").filter(|s| **s != push_scope) {
            query.push(("scope", scope.clone()));
        }
        query.push(("scope", push_scope));
        if let Some(service) = params.get("service") {
            query.push(("service", service.clone()));
        }

        tracing::debug!(realm = %realm, "Requesting registry token");
        let mut req = self.client.get(realm).query(&query);
        if let Some(auth) = self.auth {
            req = req.basic_auth(&auth.username, Some(&auth.password));
        }

        let response = req
            .send()
            .await
            .map_err(|e| PushError::from_reqwest(&e, "Failed to request token"))?;
        let response = check(response, &[StatusCode::OK], "Token request").await?;
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| PushError::new(PushErrorKind::Unauthorized, format!("Bad token response: {e}")))?;

        token.token.or(token.access_token).ok_or_else(|| {
            PushError::new(PushErrorKind::Unauthorized, "No token in response")
        })
    }

    /// Upload a blob unless the registry already has it.
    async fn ensure_blob(&mut self, store: &dyn ImageStore, digest: &str) -> Result<(), PushError> {
        let url = format!("{}/v2/{}/blobs/{digest}", self.base, self.repository);
        let head = self.send(Method::HEAD, &url, |r| r).await?;
        match head.status() {
            StatusCode::OK => {
                tracing::debug!(digest, "Blob already exists");
                return Ok(());
            }
            StatusCode::NOT_FOUND => {}
            status => return Err(PushError::from_status(status, &url, "")),
        }

        let data = store.blob(digest).map_err(PushError::local)?;
        let uploads = format!("{}/v2/{}/blobs/uploads/", self.base, self.repository);
        let started = self.send(Method::POST, &uploads, |r| r).await?;
        let started = check(started, &[StatusCode::ACCEPTED], "Start blob upload").await?;

        let location = started
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| PushError::new(PushErrorKind::Rejected, "Upload without Location"))?;
        let mut upload_url = if location.starts_with("http://") || location.starts_with("https://")
        {
            location.to_string()
        } else {
            format!("{}{location}", self.base)
        };
        upload_url.push(if upload_url.contains('?') { '&' } else { '?' });
        upload_url.push_str("digest=");
        upload_url.push_str(digest);

        let size = data.len();
        let finished = self
            .send(Method::PUT, &upload_url, |r| {
                r.header(header::CONTENT_TYPE, "application/octet-stream")
                    .body(data.clone())
            })
            .await?;
        check(finished, &[StatusCode::CREATED], "Finish blob upload").await?;

        tracing::debug!(digest, size, "Blob uploaded");
        Ok(())
    }

    /// Upload a manifest or index and return its registry digest.
    async fn put_manifest(
        &mut self,
        reference: &str,
        media_type: &str,
        body: Vec<u8>,
    ) -> Result<Digest, PushError> {
        let url = format!("{}/v2/{}/manifests/{reference}", self.base, self.repository);
        let fallback = Digest::sha256_of(&body);
        let media_type = media_type.to_string();

        let response = self
            .send(Method::PUT, &url, |r| {
                r.header(header::CONTENT_TYPE, media_type.as_str())
                    .body(body.clone())
            })
            .await?;
        let response = check(response, &[StatusCode::CREATED, StatusCode::OK], "Put manifest").await?;

        let digest = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<Digest>().ok())
            .unwrap_or(fallback);

        tracing::debug!(reference, digest = %digest, "Manifest uploaded");
        Ok(digest)
    }
}

async fn check(response: Response, ok: &[StatusCode], context: &str) -> Result<Response, PushError> {
    let status = response.status();
    if ok.contains(&status) {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(PushError::from_status(status, context, &body))
}

/// Parse `Bearer realm="...",service="...",scope="..."`.
fn bearer_challenge(response: &Response) -> Option<HashMap<String, String>> {
    let header = response
        .headers()
        .get(header::WWW_AUTHENTICATE)?
        .to_str()
        .ok()?;
    parse_challenge(header)
}

fn parse_challenge(header: &str) -> Option<HashMap<String, String>> {
    let (scheme, params) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let params = CHALLENGE_PARAM
        .captures_iter(params)
        .map(|caps| {
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map_or("", |m| m.as_str())
                .replace("\\\"", "\"");
            (caps[1].to_string(), value)
        })
        .collect();
    Some(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let cases = [
            (StatusCode::UNAUTHORIZED, PushErrorKind::Unauthorized, false),
            (StatusCode::FORBIDDEN, PushErrorKind::Denied, false),
            (StatusCode::TOO_MANY_REQUESTS, PushErrorKind::Throttled, true),
            (StatusCode::REQUEST_TIMEOUT, PushErrorKind::Throttled, true),
            (StatusCode::BAD_GATEWAY, PushErrorKind::Server, true),
            (StatusCode::SERVICE_UNAVAILABLE, PushErrorKind::Server, true),
            (StatusCode::BAD_REQUEST, PushErrorKind::Rejected, false),
            (StatusCode::PAYLOAD_TOO_LARGE, PushErrorKind::Rejected, false),
        ];
        for (status, kind, retryable) in cases {
            let err = PushError::from_status(status, "PUT", "");
            assert_eq!(err.kind, kind, "{status}");
            assert_eq!(err.is_retryable(), retryable, "{status}");
        }
    }

    #[test]
    fn status_message_includes_body() {
        let err = PushError::from_status(StatusCode::BAD_REQUEST, "Put manifest", " MANIFEST_INVALID ");
        assert_eq!(
            err.to_string(),
            "rejected by registry: Put manifest: 400 Bad Request: MANIFEST_INVALID"
        );
    }

    #[test]
    fn challenge_parsing() {
        let params = parse_challenge(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/alpine:pull""#,
        )
        .unwrap();
        assert_eq!(params["realm"], "https://auth.docker.io/token");
        assert_eq!(params["service"], "registry.docker.io");
        assert_eq!(params["scope"], "repository:library/alpine:pull");
        assert!(parse_challenge(r#"Basic realm="x""#).is_none());
    }

    #[test]
    fn challenge_keeps_commas_inside_quotes() {
        let params = parse_challenge(
            r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:org/app:pull,push""#,
        )
        .unwrap();
        assert_eq!(params.len(), 3);
        assert_eq!(params["scope"], "repository:org/app:pull,push");
        assert_eq!(params["service"], "registry.example.com");

        let params = parse_challenge(
            r#"bearer realm="https://ghcr.io/token", scope="repository:a/b:pull,push repository:a/c:pull",error=insufficient_scope"#,
        )
        .unwrap();
        assert_eq!(params["scope"], "repository:a/b:pull,push repository:a/c:pull");
        assert_eq!(params["error"], "insufficient_scope");
    }

    #[test]
    fn auth_debug_redacts_password() {
        let auth = RegistryAuth {
            username: "user".into(),
            password: "hunter2".into(),
        };
        assert!(!format!("{auth:?}").contains("hunter2"));
    }

    #[test]
    fn default_push_options_match_publisher_defaults() {
        let options = PushOptions::default();
        assert!(options.remove_signatures);
        assert_eq!(options.manifest_type, media_types::MANIFEST);
        assert_eq!(options.selection, ImageListSelection::All);
    }
}
