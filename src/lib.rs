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
#![deny(clippy::all)]

pub mod access;
pub mod app;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod hyperext;
pub mod kv;
pub mod lfs;
pub mod logger;
mod lru;
pub mod repo;
mod sha256;
mod singleflight;
pub mod storage;
mod util;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use backoff::{future::retry, ExponentialBackoff};
use hyper::server::conn::http1;
use hyper_util::{
    rt::{TokioIo, TokioTimer},
    service::TowerToHyperService,
};
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

use crate::access::AccessService;
use crate::app::{App, AppConfig};
use crate::auth::oauth::{GithubOAuth, KvOAuthStateStore, OAuthConfig};
use crate::auth::{
    Auth, Authenticator, JwksVerifier, KvSessionStore, OidcVerifier,
    SessionStore,
};
use crate::config::Config;
use crate::db::postgres::PostgresDb;
use crate::db::{MetadataRepo, PolicyRepo};
pub use crate::error::Error;
use crate::health::Health;
use crate::hyperext::TrustedProxies;
use crate::kv::redis::RedisKv;
use crate::kv::KvStore;
use crate::logger::Logger;
use crate::repo::{CacheTtls, CachingRepository};
use crate::storage::s3::S3Storage;
use crate::storage::ObjectStorage;
pub use crate::util::{from_json, http_client, into_json, HttpClient};

/// How long startup keeps retrying an unreachable dependency.
const STARTUP_PROBE_LIMIT: Duration = Duration::from_secs(30);

/// Represents a running LFS server.
pub struct Server {
    addr: SocketAddr,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Server {
    /// Returns the local address this server is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Cancelling this token starts a graceful shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stops accepting connections and waits for in-flight requests to
    /// drain (or be cut off).
    pub async fn shutdown(self) {
        self.token.cancel();
        self.wait().await;
    }

    /// Waits until the server has stopped.
    pub async fn wait(self) {
        if let Err(err) = self.handle.await {
            event!(Level::ERROR, error = %err, "server task failed");
        }
    }
}

pub struct ServerBuilder {
    storage: Arc<dyn ObjectStorage>,
    kv: Arc<dyn KvStore>,
    db: Arc<dyn MetadataRepo>,
    policies: Arc<dyn PolicyRepo>,
    app: AppConfig,
    ttls: CacheTtls,
    proxies: TrustedProxies,
    repo_allowlist: bool,
    idle_timeout: Duration,
    shutdown_timeout: Duration,
    oidc: Option<Arc<dyn OidcVerifier>>,
    oauth: Option<OAuthConfig>,
    http: HttpClient,
}

impl ServerBuilder {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        kv: Arc<dyn KvStore>,
        db: Arc<dyn MetadataRepo>,
        policies: Arc<dyn PolicyRepo>,
    ) -> Self {
        Self {
            storage,
            kv,
            db,
            policies,
            app: AppConfig::default(),
            ttls: CacheTtls::default(),
            proxies: TrustedProxies::default(),
            repo_allowlist: true,
            idle_timeout: Duration::from_secs(120),
            shutdown_timeout: Duration::from_secs(10),
            oidc: None,
            oauth: None,
            http: http_client(),
        }
    }

    /// Builds the production stack: S3, Redis and PostgreSQL. Nothing is
    /// contacted yet except by `migrate`, which applies the schema first.
    pub async fn from_config(
        config: &Config,
        migrate: bool,
    ) -> Result<Self, Error> {
        let storage = Arc::new(S3Storage::new(config.s3()).await);
        let kv = Arc::new(RedisKv::new(&config.redis())?);
        let db = Arc::new(PostgresDb::new(&config.postgres()?));

        if migrate {
            db.migrate().await?;
            event!(Level::INFO, "database schema applied");
        }

        let mut builder = Self::new(storage, kv, db.clone(), db);
        builder
            .app_config(config.app())
            .cache_ttls(config.cache_ttls())
            .trusted_proxies(config.trusted_proxies()?)
            .repo_allowlist(config.server.repo_allowlist)
            .idle_timeout(config.server.idle_timeout)
            .shutdown_timeout(config.server.shutdown_timeout);

        if let Some(oidc) = config.oidc() {
            let verifier = JwksVerifier::new(oidc, builder.http.clone());
            builder.oidc(Arc::new(verifier));
        }
        if let Some(oauth) = config.oauth() {
            builder.oauth(oauth);
        }

        Ok(builder)
    }

    pub fn app_config(&mut self, app: AppConfig) -> &mut Self {
        self.app = app;
        self
    }

    pub fn cache_ttls(&mut self, ttls: CacheTtls) -> &mut Self {
        self.ttls = ttls;
        self
    }

    pub fn trusted_proxies(&mut self, proxies: TrustedProxies) -> &mut Self {
        self.proxies = proxies;
        self
    }

    /// When disabled, every repository counts as allow-listed.
    pub fn repo_allowlist(&mut self, enabled: bool) -> &mut Self {
        self.repo_allowlist = enabled;
        self
    }

    /// How long a keep-alive connection may sit between requests.
    pub fn idle_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.idle_timeout = timeout;
        self
    }

    /// How long in-flight requests get to finish once shutdown starts.
    pub fn shutdown_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Accepts bearer tokens through `verifier`. Without one, only session
    /// cookies authenticate.
    pub fn oidc(&mut self, verifier: Arc<dyn OidcVerifier>) -> &mut Self {
        self.oidc = Some(verifier);
        self
    }

    /// Enables the GitHub browser login and server-side sessions.
    pub fn oauth(&mut self, config: OAuthConfig) -> &mut Self {
        self.oauth = Some(config);
        self
    }

    /// Client used for calls to the OAuth provider.
    pub fn http_client(&mut self, client: HttpClient) -> &mut Self {
        self.http = client;
        self
    }

    /// Probes every dependency, retrying with exponential backoff for a
    /// bounded time. Failures are logged; `/readyz` keeps reporting them.
    pub async fn check_dependencies(&self) {
        futures::join!(
            startup_probe("postgres", || self.db.ping()),
            startup_probe("redis", || self.kv.ping()),
            startup_probe("s3", || self.storage.head_bucket()),
        );
    }

    fn build(self) -> (App, Arc<Authenticator>) {
        let repo: Arc<dyn MetadataRepo> = Arc::new(CachingRepository::new(
            self.db.clone(),
            self.kv.clone(),
            self.ttls,
        ));
        let access = Arc::new(AccessService::new(
            self.policies,
            repo.clone(),
            self.repo_allowlist,
        ));
        let health = Arc::new(Health::new(
            self.db,
            self.kv.clone(),
            self.storage.clone(),
        ));

        let sessions: Option<Arc<dyn SessionStore>> =
            self.oauth.as_ref().map(|_| {
                Arc::new(KvSessionStore::new(
                    self.kv.clone(),
                    self.app.session_ttl,
                )) as Arc<dyn SessionStore>
            });

        let authenticator = Arc::new(Authenticator::new(
            self.oidc,
            sessions.clone(),
            self.app.cookie_name.clone(),
        ));

        let mut app =
            App::new(self.app, self.storage, repo, access.clone(), health);

        if let (Some(config), Some(sessions)) = (self.oauth, sessions) {
            let states = Arc::new(KvOAuthStateStore::new(self.kv));
            let oauth = GithubOAuth::new(
                config,
                self.http,
                states,
                sessions.clone(),
                access,
            );
            app = app.with_sessions(sessions).with_oauth(Arc::new(oauth));
        }

        (app, authenticator)
    }

    /// Binds and starts serving in the background.
    pub async fn spawn(self, addr: SocketAddr) -> Result<Server, Error> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        let idle_timeout = self.idle_timeout;
        let shutdown_timeout = self.shutdown_timeout;
        let proxies = self.proxies.clone();
        let (app, authenticator) = self.build();

        let token = CancellationToken::new();
        let handle = tokio::spawn(serve(
            listener,
            move |remote_addr| {
                Logger::new(
                    remote_addr,
                    proxies.clone(),
                    Auth::new(app.clone(), authenticator.clone()),
                )
            },
            token.clone(),
            idle_timeout,
            shutdown_timeout,
        ));

        Ok(Server {
            addr,
            token,
            handle,
        })
    }

    /// Spawns the server and runs it until `signal` resolves, then shuts
    /// down gracefully.
    pub async fn run<F>(self, addr: SocketAddr, signal: F) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let server = self.spawn(addr).await?;

        event!(Level::INFO, "Listening on {}", server.addr());

        signal.await;
        event!(Level::INFO, "shutting down");
        server.shutdown().await;
        Ok(())
    }
}

async fn startup_probe<F, Fut, E>(name: &'static str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    let policy = ExponentialBackoff {
        max_elapsed_time: Some(STARTUP_PROBE_LIMIT),
        ..ExponentialBackoff::default()
    };

    let check = &check;
    let result = retry(policy, move || async move {
        check().await.map_err(|err| {
            event!(
                Level::WARN,
                dependency = name,
                error = %err,
                "dependency not reachable yet"
            );
            backoff::Error::transient(err)
        })
    })
    .await;

    match result {
        Ok(()) => {
            event!(Level::INFO, dependency = name, "dependency reachable")
        }
        Err(err) => event!(
            Level::ERROR,
            dependency = name,
            error = %err,
            "dependency unreachable at startup"
        ),
    }
}

async fn serve<M>(
    listener: TcpListener,
    make_service: M,
    token: CancellationToken,
    idle_timeout: Duration,
    shutdown_timeout: Duration,
) where
    M: Fn(SocketAddr) -> Logger<Auth<App>>,
{
    let mut connections = JoinSet::new();

    loop {
        let (stream, remote_addr) = tokio::select! {
            _ = token.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {
                continue;
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    event!(
                        Level::WARN,
                        error = %err,
                        "failed to accept connection"
                    );
                    continue;
                }
            },
        };

        let service = TowerToHyperService::new(make_service(remote_addr));
        let token = token.clone();

        connections.spawn(async move {
            let mut builder = http1::Builder::new();
            builder
                .timer(TokioTimer::new())
                .header_read_timeout(idle_timeout);

            let conn =
                builder.serve_connection(TokioIo::new(stream), service);
            tokio::pin!(conn);

            let result = tokio::select! {
                result = conn.as_mut() => result,
                _ = token.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    conn.await
                }
            };

            if let Err(err) = result {
                event!(
                    Level::DEBUG,
                    remote_addr = %remote_addr,
                    error = %err,
                    "connection closed with error"
                );
            }
        });
    }

    drop(listener);

    let drain = async { while connections.join_next().await.is_some() {} };
    if tokio::time::timeout(shutdown_timeout, drain).await.is_err() {
        event!(
            Level::WARN,
            remaining = connections.len(),
            "shutdown deadline passed, closing remaining connections"
        );
        connections.shutdown().await;
    }
}
