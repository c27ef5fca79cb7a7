//! Push flow of `DistributionClient` against an in-process registry.

use std::net::SocketAddr;
use std::sync::Arc;

use manifold_common::Digest;
use manifold_image::{
    DistributionClient, ImageListSelection, ImageReference, ImageStore, LocalStore, NewImage,
    PushErrorKind, PushOptions, PushRequest, RegistryClient, StoreOptions, SystemContext,
};
use manifold_oci::{ImageIndex, ImageManifest, ManifestDescriptor, Platform, media_types};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

const TOKEN: &str = "s3cr3t";

/// One request as the registry saw it.
#[derive(Debug, Clone)]
struct Seen {
    method: String,
    target: String,
    authorization: Option<String>,
    body: Vec<u8>,
}

impl Seen {
    fn path(&self) -> &str {
        self.target.split_once('?').map_or(self.target.as_str(), |(p, _)| p)
    }

    fn query(&self) -> &str {
        self.target.split_once('?').map_or("", |(_, q)| q)
    }

    fn line(&self) -> String {
        format!("{} {}", self.method, self.path())
    }

    fn has_token(&self) -> bool {
        self.authorization.as_deref() == Some(format!("Bearer {TOKEN}").as_str())
    }
}

struct Reply {
    status: u16,
    headers: Vec<(&'static str, String)>,
    body: String,
}

impl Reply {
    fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }
}

/// Minimal HTTP/1.1 server answering through `handler`.
struct StubRegistry {
    addr: SocketAddr,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl StubRegistry {
    async fn start<H>(handler: H) -> Self
    where
        H: Fn(&Seen, SocketAddr) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(handler);

        let log = Arc::clone(&seen);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = Arc::clone(&handler);
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let _ = serve(stream, addr, handler.as_ref(), &log).await;
                });
            }
        });

        Self { addr, seen }
    }

    fn reference(&self, repository: &str) -> ImageReference {
        ImageReference::parse(&format!("{}/{repository}", self.addr)).unwrap()
    }

    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }

    fn lines(&self) -> Vec<String> {
        self.seen().iter().map(Seen::line).collect()
    }
}

async fn serve<H>(
    stream: TcpStream,
    addr: SocketAddr,
    handler: &H,
    log: &Mutex<Vec<Seen>>,
) -> std::io::Result<()>
where
    H: Fn(&Seen, SocketAddr) -> Reply,
{
    let mut reader = BufReader::new(stream);
    loop {
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).await? == 0 {
            return Ok(());
        }
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_string();
        let target = parts.next().unwrap_or_default().to_string();

        let mut content_length = 0;
        let mut authorization = None;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await?;
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                let value = value.trim();
                match name.to_ascii_lowercase().as_str() {
                    "content-length" => content_length = value.parse().unwrap_or(0),
                    "authorization" => authorization = Some(value.to_string()),
                    _ => {}
                }
            }
        }
        let mut body = vec![0; content_length];
        reader.read_exact(&mut body).await?;

        let seen = Seen {
            method,
            target,
            authorization,
            body,
        };
        let reply = handler(&seen, addr);
        log.lock().push(seen);

        let mut out = format!(
            "HTTP/1.1 {} Stub\r\ncontent-length: {}\r\n",
            reply.status,
            reply.body.len()
        );
        for (name, value) in &reply.headers {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        out.push_str("\r\n");
        out.push_str(&reply.body);
        reader.get_mut().write_all(out.as_bytes()).await?;
    }
}

fn challenge(addr: SocketAddr) -> Reply {
    Reply::status(401).header(
        "www-authenticate",
        format!(
            r#"Bearer realm="http://{addr}/token",service="stub",scope="repository:org/app:pull""#
        ),
    )
}

/// A store holding one single-layer image and an index listing it.
struct Fixture {
    _dir: tempfile::TempDir,
    store: LocalStore,
    index: ImageIndex,
    manifest: String,
    config: String,
    layer: String,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::open(StoreOptions::with_root(dir.path())).unwrap();
    let platform = Platform::new("linux", "arm64", None);
    let image = NewImage::from_layers("app", &platform, vec![b"rootfs".to_vec()]).unwrap();
    let stored = store.put_image(image).unwrap();

    let descriptor = stored.descriptor();
    let manifest: ImageManifest =
        serde_json::from_slice(&store.blob(&descriptor.digest).unwrap()).unwrap();

    let mut index = ImageIndex::new(media_types::INDEX);
    index.add(ManifestDescriptor {
        descriptor: descriptor.clone(),
        platform: Some(platform),
    });

    Fixture {
        _dir: dir,
        store,
        index,
        manifest: descriptor.digest,
        config: manifest.config.digest,
        layer: manifest.layers[0].digest.clone(),
    }
}

fn client() -> DistributionClient {
    DistributionClient::new().with_plain_http(true)
}

#[tokio::test]
async fn push_uploads_missing_blobs_then_manifests_then_index() {
    let fx = fixture();
    let index_digest = format!("sha256:{}", "d".repeat(64));
    let config = fx.config.clone();
    let returned = index_digest.clone();

    let registry = StubRegistry::start(move |req, addr| {
        if req.path() == "/token" {
            return Reply::status(200).body(format!(r#"{{"token":"{TOKEN}"}}"#));
        }
        if !req.has_token() {
            return challenge(addr);
        }
        let path = req.path();
        match req.method.as_str() {
            "HEAD" if path == format!("/v2/org/app/blobs/{config}") => Reply::status(200),
            "HEAD" => Reply::status(404),
            "POST" if path == "/v2/org/app/blobs/uploads/" => Reply::status(202)
                .header("location", "/v2/org/app/blobs/uploads/u1?state=abc"),
            "PUT" if path == "/v2/org/app/blobs/uploads/u1" => Reply::status(201),
            "PUT" if path == "/v2/org/app/manifests/v1" => {
                Reply::status(201).header("docker-content-digest", returned.clone())
            }
            "PUT" if path.starts_with("/v2/org/app/manifests/sha256:") => Reply::status(201)
                .header(
                    "docker-content-digest",
                    path.trim_start_matches("/v2/org/app/manifests/"),
                ),
            _ => Reply::status(404),
        }
    })
    .await;

    let destination = registry.reference("org/app:v1");
    let digest = client()
        .push(PushRequest {
            index: &fx.index,
            destination: &destination,
            store: &fx.store,
            options: &PushOptions::default(),
            system: &SystemContext::default(),
        })
        .await
        .unwrap();

    assert_eq!(digest.to_string(), index_digest);
    assert_eq!(
        registry.lines(),
        vec![
            format!("HEAD /v2/org/app/blobs/{}", fx.config),
            "GET /token".to_string(),
            format!("HEAD /v2/org/app/blobs/{}", fx.config),
            format!("HEAD /v2/org/app/blobs/{}", fx.layer),
            "POST /v2/org/app/blobs/uploads/".to_string(),
            "PUT /v2/org/app/blobs/uploads/u1".to_string(),
            format!("PUT /v2/org/app/manifests/{}", fx.manifest),
            "PUT /v2/org/app/manifests/v1".to_string(),
        ]
    );

    let seen = registry.seen();
    let token = &seen[1];
    assert!(token.query().contains("scope=repository%3Aorg%2Fapp%3Apull%2Cpush"));
    assert!(token.query().contains("service=stub"));

    let upload = &seen[5];
    assert!(upload.has_token());
    assert!(upload.query().contains("state=abc"));
    assert!(upload.query().contains(&format!("digest={}", fx.layer)));
    assert_eq!(upload.body, b"rootfs");

    let pushed_index: ImageIndex = serde_json::from_slice(&seen[7].body).unwrap();
    assert_eq!(pushed_index, fx.index);
}

#[tokio::test]
async fn index_only_push_falls_back_to_local_digest() {
    let fx = fixture();
    let registry = StubRegistry::start(|req, _| match (req.method.as_str(), req.path()) {
        ("PUT", "/v2/org/app/manifests/v1") => Reply::status(201),
        _ => Reply::status(404),
    })
    .await;

    let options = PushOptions {
        selection: ImageListSelection::IndexOnly,
        ..PushOptions::default()
    };
    let destination = registry.reference("org/app:v1");
    let digest = client()
        .push(PushRequest {
            index: &fx.index,
            destination: &destination,
            store: &fx.store,
            options: &options,
            system: &SystemContext::default(),
        })
        .await
        .unwrap();

    assert_eq!(registry.lines(), vec!["PUT /v2/org/app/manifests/v1"]);
    let body = &registry.seen()[0].body;
    assert_eq!(digest, Digest::sha256_of(body));
}

#[tokio::test]
async fn registry_responses_are_classified() {
    let fx = fixture();
    let options = PushOptions {
        selection: ImageListSelection::IndexOnly,
        ..PushOptions::default()
    };

    let busy = StubRegistry::start(|_, _| Reply::status(503).body("try later")).await;
    let destination = busy.reference("org/app:v1");
    let err = client()
        .push(PushRequest {
            index: &fx.index,
            destination: &destination,
            store: &fx.store,
            options: &options,
            system: &SystemContext::default(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind, PushErrorKind::Server);
    assert!(err.is_retryable());
    assert!(err.message.contains("try later"));

    // A token that still does not authorize the push
    let locked = StubRegistry::start(|req, addr| {
        if req.path() == "/token" {
            Reply::status(200).body(format!(r#"{{"access_token":"{TOKEN}"}}"#))
        } else {
            challenge(addr)
        }
    })
    .await;
    let destination = locked.reference("org/app:v1");
    let err = client()
        .push(PushRequest {
            index: &fx.index,
            destination: &destination,
            store: &fx.store,
            options: &options,
            system: &SystemContext::default(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind, PushErrorKind::Unauthorized);
    assert!(!err.is_retryable());
    assert_eq!(
        locked.lines(),
        vec![
            "PUT /v2/org/app/manifests/v1",
            "GET /token",
            "PUT /v2/org/app/manifests/v1",
        ]
    );
    assert!(locked.seen()[2].has_token());
}
