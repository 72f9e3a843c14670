// Copyright (c) 2019 Jason White
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.
// Some code in here is used in tests that aren't always built/run
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use duct::cmd;
use http::{header, HeaderMap, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use rand::Rng;
use serde_json::Value;
use sha2::{Digest, Sha256};

use lfs_gateway::access::{AccessPolicy, Permission, SubjectSelector};
use lfs_gateway::auth::{Principal, PrincipalKind, StaticVerifier};
use lfs_gateway::db::memory::MemoryDb;
use lfs_gateway::kv::memory::MemoryKv;
use lfs_gateway::storage::memory::MemoryStorage;
use lfs_gateway::{Server, ServerBuilder};

pub const ISSUER: &str = "https://token.actions.githubusercontent.com";

/// Can upload and download anything under `acme/`.
pub const WRITER_TOKEN: &str = "writer-token";

/// Can only download.
pub const READER_TOKEN: &str = "reader-token";

pub const LFS_MIME: &str = "application/vnd.git-lfs+json";

pub type TestClient = Client<HttpConnector, Full<Bytes>>;

pub fn principal(subject: &str) -> Principal {
    let now = chrono::Utc::now().timestamp();
    Principal {
        kind: PrincipalKind::Oidc,
        issuer: ISSUER.into(),
        subject: subject.into(),
        claims: BTreeMap::from([(
            "repository_owner".to_owned(),
            Value::String("acme".into()),
        )]),
        session_id: None,
        issued_at: now,
        expires_at: now + 3600,
    }
}

pub fn policy(subject: &str, actions: &[Permission]) -> AccessPolicy {
    AccessPolicy {
        issuer: ISSUER.into(),
        selector: SubjectSelector::Subject(subject.into()),
        repo_pattern: "acme/*".into(),
        actions: actions.iter().copied().collect::<BTreeSet<_>>(),
    }
}

/// A server over in-memory backends, with `acme/widgets` allow-listed and
/// the two test tokens registered.
pub struct TestServer {
    pub server: Server,
    pub storage: Arc<MemoryStorage>,
    pub kv: Arc<MemoryKv>,
    pub db: Arc<MemoryDb>,
    pub client: TestClient,
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

impl TestServer {
    pub async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    pub async fn spawn_with<F>(configure: F) -> Self
    where
        F: FnOnce(&mut ServerBuilder),
    {
        let storage = Arc::new(MemoryStorage::new());
        let kv = Arc::new(MemoryKv::new());
        let db = Arc::new(MemoryDb::new());

        db.allow("acme", "widgets");
        db.add_policy(policy(
            "writer",
            &[Permission::Download, Permission::Upload, Permission::Verify],
        ));
        db.add_policy(policy("reader", &[Permission::Download]));

        let verifier = StaticVerifier::new()
            .with_token(WRITER_TOKEN, principal("writer"))
            .with_token(READER_TOKEN, principal("reader"));

        let mut builder = ServerBuilder::new(
            storage.clone(),
            kv.clone(),
            db.clone(),
            db.clone(),
        );
        builder.oidc(Arc::new(verifier));
        configure(&mut builder);

        let server = builder
            .spawn(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();

        TestServer {
            server,
            storage,
            kv,
            db,
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.server.addr(), path)
    }

    pub async fn send(&self, req: Request<Full<Bytes>>) -> TestResponse {
        let resp = self.client.request(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.unwrap().to_bytes();

        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: impl Into<Bytes>,
    ) -> TestResponse {
        let mut req = Request::builder().method(method).uri(self.url(path));
        if let Some(token) = token {
            req = req
                .header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        self.send(req.body(Full::new(body.into())).unwrap()).await
    }

    pub async fn batch(
        &self,
        repo: &str,
        token: &str,
        body: Value,
    ) -> TestResponse {
        let req = Request::post(self.url(&format!(
            "/{}/info/lfs/objects/batch",
            repo
        )))
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .header(header::ACCEPT, LFS_MIME)
        .header(header::CONTENT_TYPE, LFS_MIME)
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap();

        self.send(req).await
    }

    pub async fn upload(
        &self,
        repo: &str,
        token: &str,
        oid: &str,
        data: &[u8],
    ) -> TestResponse {
        let req = Request::put(
            self.url(&format!("/{}/info/lfs/objects/{}", repo, oid)),
        )
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .header(header::CONTENT_LENGTH, data.len())
        .body(Full::new(Bytes::copy_from_slice(data)))
        .unwrap();

        self.send(req).await
    }

    pub async fn download(
        &self,
        repo: &str,
        token: &str,
        oid: &str,
    ) -> TestResponse {
        self.request(
            Method::GET,
            &format!("/{}/info/lfs/objects/{}", repo, oid),
            Some(token),
            Bytes::new(),
        )
        .await
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn random_bytes<R: Rng>(len: usize, rng: &mut R) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rng.fill(&mut data[..]);
    data
}

pub fn init_logger() -> tracing::subscriber::DefaultGuard {
    let subscriber = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    tracing::subscriber::set_default(subscriber)
}

/// True if `git lfs` can be run on this machine.
pub fn have_git_lfs() -> bool {
    cmd!("git", "lfs", "version")
        .stdout_null()
        .stderr_null()
        .run()
        .is_ok()
}

/// A temporary git repository whose LFS endpoint is a test server.
pub struct GitRepo {
    repo: tempfile::TempDir,
}

impl GitRepo {
    /// Initialize a temporary synthetic git repository. It is set up to be
    /// connected to our LFS server, authenticating with `token` the way a
    /// credential helper would.
    pub fn init(
        lfs_server: SocketAddr,
        repo: &str,
        token: &str,
    ) -> io::Result<Self> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path();
        let lfs_url =
            format!("http://ci:{}@{}/{}.git/info/lfs", token, lfs_server, repo);

        cmd!("git", "init", "--initial-branch=main", ".")
            .dir(path)
            .run()?;
        cmd!("git", "lfs", "install", "--local").dir(path).run()?;
        cmd!("git", "remote", "add", "origin", "fake_remote")
            .dir(path)
            .run()?;
        cmd!("git", "config", "lfs.url", &lfs_url).dir(path).run()?;
        cmd!("git", "config", "lfs.locksverify", "false")
            .dir(path)
            .run()?;
        cmd!("git", "config", "user.name", "Foo Bar")
            .dir(path)
            .run()?;
        cmd!("git", "config", "user.email", "foobar@example.com")
            .dir(path)
            .run()?;
        cmd!("git", "lfs", "track", "*.bin").dir(path).run()?;
        cmd!("git", "add", ".gitattributes").dir(path).run()?;
        cmd!("git", "commit", "-m", "Initial commit")
            .dir(path)
            .run()?;

        Ok(Self { repo: dir })
    }

    pub fn path(&self) -> &Path {
        self.repo.path()
    }

    /// Writes a random file and stages it with `git add`.
    pub fn add_random<R: Rng>(
        &self,
        path: &Path,
        size: usize,
        rng: &mut R,
    ) -> io::Result<Vec<u8>> {
        let data = random_bytes(size, rng);
        std::fs::write(self.repo.path().join(path), &data)?;
        cmd!("git", "add", path).dir(self.repo.path()).run()?;
        Ok(data)
    }

    /// Commits the currently staged files.
    pub fn commit(&self, message: &str) -> io::Result<()> {
        cmd!("git", "commit", "-m", message)
            .dir(self.repo.path())
            .run()?;
        Ok(())
    }

    pub fn lfs_push(&self) -> io::Result<()> {
        cmd!("git", "lfs", "push", "origin", "main")
            .dir(self.repo.path())
            .run()?;
        Ok(())
    }

    pub fn lfs_pull(&self) -> io::Result<()> {
        cmd!("git", "lfs", "pull").dir(self.repo.path()).run()?;
        Ok(())
    }

    /// Deletes the local LFS object cache so the next pull has to download
    /// everything again.
    pub fn clean_lfs(&self) -> io::Result<()> {
        std::fs::remove_dir_all(self.repo.path().join(".git/lfs"))
    }
}
