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

use std::{
    collections::{BTreeMap, HashMap},
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use futures::{
    future::{self, BoxFuture},
    StreamExt, TryStreamExt,
};

use http::{self, header, HeaderMap, StatusCode};
use http_body_util::{BodyDataStream, BodyExt, StreamBody};
use hyper::{
    self,
    body::{Frame, Incoming},
    Method, Request, Response,
};
use tower::Service;
use tracing::{event, Level};
use url::form_urlencoded;

use crate::access::{AccessService, Permission};
use crate::auth::oauth::{
    clear_cookie_header, session_cookie_header, CallbackParams, GithubOAuth,
    LoginParams,
};
use crate::auth::{challenge, AuthError, ErrorStyle, Principal, SessionStore};
use crate::db::{LfsObject, MetadataError, MetadataRepo};
use crate::error::{
    lfs_error_response, plain_error_response, public_message, Error, ErrorKind,
};
use crate::health::Health;
use crate::hyperext::RequestExt;
use crate::lfs::{self, HashAlgorithm, KeyError, Oid, Operation, UploadState};
use crate::logger::RequestId;
use crate::sha256::HashingStream;
use crate::storage::{key_for, ObjectStorage, StorageKey, DEFAULT_PRESIGN_TTL};
use crate::util::{empty, from_json, full, into_json, BoxBody};

#[cfg(feature = "otel")]
use crate::util::RedactedHeaders;
#[cfg(feature = "otel")]
use opentelemetry::trace::FutureExt;
#[cfg(feature = "otel")]
use tracing::instrument;
#[cfg(feature = "otel")]
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Settings that shape responses rather than wiring.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Base of every action href. Derived from the request when unset.
    pub public_url: Option<String>,

    /// Upper bound on streaming one object in either direction.
    pub proxy_timeout: Duration,

    /// Upper bound on reading a JSON request body.
    pub read_timeout: Duration,

    /// Upper bound on answering a batch or verify request.
    pub write_timeout: Duration,

    /// Point batch actions at presigned object-store URLs instead of this
    /// server.
    pub direct_transfers: bool,
    pub presign_ttl: Duration,

    /// Reflect the caller's `Authorization` header into action headers.
    pub passthrough_auth: bool,

    pub cookie_name: String,
    pub session_ttl: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            public_url: None,
            proxy_timeout: Duration::from_secs(10 * 60),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            direct_transfers: false,
            presign_ttl: DEFAULT_PRESIGN_TTL,
            passthrough_auth: true,
            cookie_name: crate::auth::DEFAULT_COOKIE_NAME.into(),
            session_ttl: crate::auth::session::DEFAULT_SESSION_TTL,
        }
    }
}

#[derive(Clone)]
pub struct App {
    config: Arc<AppConfig>,
    storage: Arc<dyn ObjectStorage>,
    repo: Arc<dyn MetadataRepo>,
    access: Arc<AccessService>,
    health: Arc<Health>,
    sessions: Option<Arc<dyn SessionStore>>,
    oauth: Option<Arc<GithubOAuth>>,
}

pub type Req = Request<Incoming>;

/// `/<owner>/<repo>/info/lfs/objects/<object>`, with an optional `.git`
/// suffix on the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LfsPath {
    owner: String,
    repo: String,
    object: String,
}

impl LfsPath {
    fn parse(path: &str) -> Option<Self> {
        let parts: Vec<&str> =
            path.split('/').filter(|s| !s.is_empty()).collect();

        match parts.as_slice() {
            [owner, repo, "info", "lfs", "objects", object] => Some(LfsPath {
                owner: (*owner).to_owned(),
                repo: repo.strip_suffix(".git").unwrap_or(repo).to_owned(),
                object: (*object).to_owned(),
            }),
            _ => None,
        }
    }
}

/// Everything shared by the objects of one batch.
struct Plan {
    base: String,
    owner: String,
    repo: String,
    algo: HashAlgorithm,
    operation: Operation,
    auth: Option<BTreeMap<String, String>>,
}

impl Plan {
    fn objects_url(&self, object: &str) -> String {
        format!(
            "{}/{}/{}/info/lfs/objects/{}",
            self.base, self.owner, self.repo, object
        )
    }
}

/// Follows one upload through its states, logging each step.
struct UploadTracker<'a> {
    oid: &'a Oid,
    state: UploadState,
}

impl<'a> UploadTracker<'a> {
    fn new(oid: &'a Oid) -> Self {
        UploadTracker {
            oid,
            state: UploadState::Announced,
        }
    }

    fn to(&mut self, next: UploadState) {
        match self.state.advance(next) {
            Some(state) => self.state = state,
            None => event!(
                Level::WARN,
                oid = %self.oid,
                from = %self.state,
                to = %next,
                "unexpected upload transition"
            ),
        }

        event!(Level::DEBUG, oid = %self.oid, state = %self.state);
    }
}

fn principal(req: &Req) -> Result<Principal, Error> {
    req.extensions()
        .get::<Principal>()
        .cloned()
        .ok_or(Error::Auth(AuthError::Missing))
}

fn query_params(req: &Req) -> HashMap<String, String> {
    req.uri()
        .query()
        .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

/// Renders an error in the style of the endpoint that produced it.
fn error_response(
    err: &Error,
    style: ErrorStyle,
    request_id: Option<&RequestId>,
) -> Response<BoxBody> {
    let kind = err.kind();

    match kind {
        ErrorKind::Internal
        | ErrorKind::DependencyUnavailable
        | ErrorKind::Timeout => {
            event!(Level::ERROR, error = %err, kind = %kind, "request failed")
        }
        _ => {
            event!(Level::DEBUG, error = %err, kind = %kind, "request rejected")
        }
    }

    let mut resp = style.respond(kind, public_message(err), request_id);
    challenge(&mut resp);
    resp
}

impl App {
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn ObjectStorage>,
        repo: Arc<dyn MetadataRepo>,
        access: Arc<AccessService>,
        health: Arc<Health>,
    ) -> Self {
        App {
            config: Arc::new(config),
            storage,
            repo,
            access,
            health,
            sessions: None,
            oauth: None,
        }
    }

    pub fn with_sessions(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_oauth(mut self, oauth: Arc<GithubOAuth>) -> Self {
        self.oauth = Some(oauth);
        self
    }

    /// Generates a "404 not found" response.
    fn not_found() -> Result<Response<BoxBody>, Error> {
        Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(full("Not found"))?)
    }

    /// Scheme and authority action hrefs are built on, without a trailing
    /// slash.
    fn base_url(&self, req: &Req) -> Result<String, Error> {
        if let Some(url) = &self.config.public_url {
            return Ok(url.trim_end_matches('/').to_owned());
        }

        let uri = req.base_uri().path_and_query("/").build()?;
        Ok(uri.to_string().trim_end_matches('/').to_owned())
    }

    /// The caller's `Authorization` header, reflected back to the `git-lfs`
    /// client so that requests for the action hrefs are authenticated too.
    fn passthrough_header(
        &self,
        headers: &HeaderMap,
    ) -> Option<BTreeMap<String, String>> {
        if !self.config.passthrough_auth {
            return None;
        }

        let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
        Some(BTreeMap::from([(
            header::AUTHORIZATION.to_string(),
            value.to_owned(),
        )]))
    }

    async fn route(self, req: Req) -> Result<Response<BoxBody>, Error> {
        let path = req.uri().path().to_owned();
        let style = ErrorStyle::for_path(&path);
        let request_id = req.extensions().get::<RequestId>().cloned();

        match self.dispatch(req, &path).await {
            Ok(resp) => Ok(resp),
            Err(err) => Ok(error_response(&err, style, request_id.as_ref())),
        }
    }

    async fn dispatch(
        self,
        req: Req,
        path: &str,
    ) -> Result<Response<BoxBody>, Error> {
        let method = req.method().clone();

        match (&method, path) {
            (&Method::GET, "/healthz") => return Health::healthz(),
            (&Method::GET, "/readyz") => return self.health.readyz().await,
            (&Method::GET, "/auth/github/login") => {
                return self.login(req).await
            }
            (&Method::GET, "/auth/github/callback") => {
                return self.callback(req).await
            }
            (&Method::GET, "/auth/session") => {
                return Self::session_info(&principal(&req)?)
            }
            (&Method::DELETE, "/auth/session") => {
                return self.logout(principal(&req)?).await
            }
            _ => {}
        }

        let Some(target) = LfsPath::parse(path) else {
            return Self::not_found();
        };
        let principal = principal(&req)?;
        let deadline = self.config.write_timeout;

        match (&method, target.object.as_str()) {
            (&Method::POST, "batch") => {
                let fut = self.batch(req, target.owner, target.repo, principal);
                tokio::time::timeout(deadline, fut).await?
            }
            (&Method::POST, "verify") => {
                let fut =
                    self.verify(req, target.owner, target.repo, principal);
                tokio::time::timeout(deadline, fut).await?
            }
            (&Method::GET, oid) => {
                let oid: Oid = oid.parse()?;
                self.download(target.owner, target.repo, oid, principal)
                    .await
            }
            (&Method::PUT, oid) => {
                let oid: Oid = oid.parse()?;
                self.upload(req, target.owner, target.repo, oid, principal)
                    .await
            }
            _ => Self::not_found(),
        }
    }

    /// Batch API endpoint of the Git LFS protocol.
    ///
    /// See also:
    /// https://github.com/git-lfs/git-lfs/blob/master/docs/api/batch.md
    #[cfg_attr(
        feature = "otel",
        instrument(level = "info", skip(self, req, principal))
    )]
    async fn batch(
        self,
        req: Req,
        owner: String,
        repo: String,
        principal: Principal,
    ) -> Result<Response<BoxBody>, Error> {
        let base = self.base_url(&req)?;
        let auth = self.passthrough_header(req.headers());
        let request_id = req.extensions().get::<RequestId>().cloned();

        let body = from_json(req.into_body());
        let val: lfs::BatchRequest =
            tokio::time::timeout(self.config.read_timeout, body).await??;

        let algo = match val.hash_algo.as_deref() {
            Some(name) => name.parse::<HashAlgorithm>()?,
            None => HashAlgorithm::sha256(),
        };

        if !algo.is_sha256() {
            return Ok(lfs_error_response(
                StatusCode::CONFLICT,
                format!("unsupported hash algorithm {}", algo),
                request_id.as_ref().map(|id| id.0.as_str()),
            ));
        }

        // One policy lookup covers every object in the batch.
        let permission = Permission::from(val.operation);
        let grants = self.access.grants(&principal, &owner, &repo).await?;
        AccessService::check(&grants, &principal, &owner, &repo, permission)?;

        let plan = Plan {
            base,
            owner,
            repo,
            algo: algo.clone(),
            operation: val.operation,
            auth,
        };

        // Resolved concurrently; `try_join_all` keeps the input order.
        let objects = future::try_join_all(
            val.objects
                .into_iter()
                .map(|object| self.plan_object(&plan, object)),
        )
        .await?;

        let response = lfs::BatchResponse {
            transfer: lfs::Transfer::Basic,
            objects,
            hash_algo: algo,
        };

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, lfs::LFS_MIME)
            .body(full(into_json(&response)?))?)
    }

    async fn plan_object(
        &self,
        plan: &Plan,
        object: lfs::RequestObject,
    ) -> Result<lfs::ResponseObject, Error> {
        if !object.oid.fits(&plan.algo) {
            return Ok(lfs::ResponseObject::error(object, 422, "invalid oid"));
        }

        let stored = self
            .repo
            .get_object(&plan.owner, &plan.repo, &object.oid)
            .await?;
        let key = key_for(&object.oid, &plan.algo);

        let actions = match (plan.operation, stored) {
            (_, Some(stored)) if stored.size != object.size => {
                return Ok(lfs::ResponseObject::error(
                    object,
                    409,
                    "size mismatch",
                ));
            }
            (Operation::Download, None) => {
                return Ok(lfs::ResponseObject::error(
                    object,
                    404,
                    "object not found",
                ));
            }
            (Operation::Download, Some(_)) => Some(lfs::Actions {
                download: Some(
                    self.transfer_action(plan, &object.oid, &key, false).await?,
                ),
                upload: None,
                verify: None,
            }),
            // Already stored; the client skips it.
            (Operation::Upload, Some(_)) => None,
            (Operation::Upload, None) => Some(lfs::Actions {
                download: None,
                upload: Some(
                    self.transfer_action(plan, &object.oid, &key, true).await?,
                ),
                verify: Some(lfs::Action {
                    href: plan.objects_url("verify"),
                    header: plan.auth.clone(),
                    expires_in: None,
                    expires_at: None,
                }),
            }),
        };

        Ok(lfs::ResponseObject {
            oid: object.oid,
            size: object.size,
            authenticated: Some(true),
            actions,
            error: None,
        })
    }

    async fn transfer_action(
        &self,
        plan: &Plan,
        oid: &Oid,
        key: &StorageKey,
        upload: bool,
    ) -> Result<lfs::Action, Error> {
        if self.config.direct_transfers {
            let ttl = self.config.presign_ttl;
            let href = if upload {
                self.storage.presign_put(key, ttl).await?
            } else {
                self.storage.presign_get(key, ttl).await?
            };

            return Ok(lfs::Action {
                href,
                header: None,
                expires_in: Some(ttl.as_secs() as i64),
                expires_at: None,
            });
        }

        Ok(lfs::Action {
            href: plan.objects_url(oid.as_str()),
            header: plan.auth.clone(),
            expires_in: None,
            expires_at: None,
        })
    }

    /// Best-effort removal of an object that must not be kept.
    async fn discard(&self, key: &StorageKey) {
        if let Err(err) = self.storage.delete(key).await {
            event!(
                Level::WARN,
                key = %key,
                error = %err,
                "failed to discard object"
            );
        }
    }

    /// Uploads a single LFS object.
    #[cfg_attr(
        feature = "otel",
        instrument(level = "info", skip(self, req, principal))
    )]
    async fn upload(
        self,
        req: Req,
        owner: String,
        repo: String,
        oid: Oid,
        principal: Principal,
    ) -> Result<Response<BoxBody>, Error> {
        let algo = HashAlgorithm::sha256();
        if !oid.fits(&algo) {
            return Err(KeyError::InvalidOid.into());
        }

        self.access
            .authorize(&principal, &owner, &repo, Permission::Upload)
            .await?;

        let len = req
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());

        let Some(len) = len else {
            return Ok(plain_error_response(
                StatusCode::LENGTH_REQUIRED,
                "Invalid Content-Length header.",
            ));
        };

        let mut tracker = UploadTracker::new(&oid);
        tracker.to(UploadState::Uploading);

        let existing = self.repo.get_object(&owner, &repo, &oid).await?;
        if let Some(existing) = existing {
            if existing.size == len {
                event!(
                    Level::DEBUG,
                    oid = %oid,
                    "already stored, skipping upload"
                );
                return Ok(Response::builder()
                    .status(StatusCode::OK)
                    .body(empty())?);
            }

            tracker.to(UploadState::RejectedSize);
            return Err(MetadataError::SizeConflict {
                stored: existing.size,
                requested: len,
            }
            .into());
        }

        let key = key_for(&oid, &algo);

        // Keys are shared by every repo holding the same content. An object
        // already in the bucket is never rewritten or removed from here; the
        // body only has to prove it carries the same bytes.
        let stored = self.storage.size(&key).await?;
        if let Some(stored) = stored {
            if stored != len {
                tracker.to(UploadState::RejectedSize);
                return Err(MetadataError::SizeConflict {
                    stored,
                    requested: len,
                }
                .into());
            }
        }
        let fresh = stored.is_none();

        // Verify the SHA256 of the uploaded object as it is being uploaded.
        let aborted = Arc::new(AtomicBool::new(false));
        let body = {
            let aborted = aborted.clone();
            BodyDataStream::new(req.into_body()).map_err(move |e| {
                aborted.store(true, Ordering::SeqCst);
                io::Error::new(io::ErrorKind::ConnectionAborted, e)
            })
        };
        let (stream, tally) = HashingStream::new(body);

        let transfer = async {
            if fresh {
                self.storage
                    .put(&key, Box::pin(stream), len)
                    .await
                    .map_err(Error::from)
            } else {
                stream
                    .try_for_each(|_| future::ok(()))
                    .await
                    .map_err(Error::from)
            }
        };
        let put =
            tokio::time::timeout(self.config.proxy_timeout, transfer).await;

        match put {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracker.to(UploadState::StorageError);
                if fresh {
                    self.discard(&key).await;
                }

                if aborted.load(Ordering::SeqCst) {
                    event!(
                        Level::INFO,
                        oid = %oid,
                        received = tally.bytes_seen(),
                        "client disconnected during upload"
                    );
                    return Err(Error::Body("client disconnected".into()));
                }

                return Err(err);
            }
            Err(elapsed) => {
                tracker.to(UploadState::StorageError);
                if fresh {
                    self.discard(&key).await;
                }
                return Err(elapsed.into());
            }
        }

        if tally.bytes_seen() != len {
            tracker.to(UploadState::RejectedSize);
            if fresh {
                self.discard(&key).await;
            }
            return Ok(plain_error_response(
                StatusCode::BAD_REQUEST,
                "body length does not match Content-Length",
            ));
        }

        tracker.to(UploadState::Verifying);

        if let Err(err) = tally.verify(oid.as_str()) {
            tracker.to(UploadState::RejectedHash);
            event!(
                Level::INFO,
                oid = %oid,
                found = %err.found,
                "hash mismatch"
            );
            if fresh {
                self.discard(&key).await;
            }
            return Err(err.into());
        }

        let object = LfsObject::new(&owner, &repo, oid.clone(), algo, len);
        self.repo.upsert_object(&object).await?;

        tracker.to(UploadState::Committed);
        event!(
            Level::INFO,
            oid = %oid,
            size = len,
            owner = %owner,
            repo = %repo,
            "object stored"
        );

        Ok(Response::builder().status(StatusCode::OK).body(empty())?)
    }

    /// Downloads a single LFS object.
    #[cfg_attr(
        feature = "otel",
        instrument(level = "info", skip(self, principal))
    )]
    async fn download(
        self,
        owner: String,
        repo: String,
        oid: Oid,
        principal: Principal,
    ) -> Result<Response<BoxBody>, Error> {
        self.access
            .authorize(&principal, &owner, &repo, Permission::Download)
            .await?;

        let Some(meta) = self.repo.get_object(&owner, &repo, &oid).await? else {
            return Ok(plain_error_response(
                StatusCode::NOT_FOUND,
                "object not found",
            ));
        };

        let key = key_for(&meta.oid, &meta.algo);
        let Some(object) = self.storage.get(&key).await? else {
            event!(
                Level::WARN,
                key = %key,
                "metadata present but object missing"
            );
            return Ok(plain_error_response(
                StatusCode::NOT_FOUND,
                "object not found",
            ));
        };

        let len = object.len;
        let deadline = tokio::time::Instant::now() + self.config.proxy_timeout;
        let mut upstream = object.stream;

        // Dropping the body (client gone) drops `upstream` with it.
        let stream = async_stream::stream! {
            loop {
                match tokio::time::timeout_at(deadline, upstream.next()).await {
                    Ok(Some(chunk)) => yield chunk,
                    Ok(None) => break,
                    Err(_) => {
                        yield Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "download exceeded proxy timeout",
                        ));
                        break;
                    }
                }
            }
        };

        let body = StreamBody::new(
            stream.map_ok(Frame::data).map_err(|e: io::Error| e.into()),
        );

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_LENGTH, len)
            .body(body.boxed_unsync())?)
    }

    /// Verifies that an LFS object exists in the store and records it.
    #[cfg_attr(
        feature = "otel",
        instrument(level = "info", skip(self, req, principal))
    )]
    async fn verify(
        self,
        req: Req,
        owner: String,
        repo: String,
        principal: Principal,
    ) -> Result<Response<BoxBody>, Error> {
        self.access
            .authorize(&principal, &owner, &repo, Permission::Verify)
            .await?;

        let request_id = req.extensions().get::<RequestId>().cloned();
        let request_id = request_id.as_ref().map(|id| id.0.as_str());

        let body = from_json(req.into_body());
        let val: lfs::VerifyRequest =
            tokio::time::timeout(self.config.read_timeout, body).await??;
        let algo = HashAlgorithm::sha256();
        if !val.oid.fits(&algo) {
            return Err(KeyError::InvalidOid.into());
        }

        let key = key_for(&val.oid, &algo);

        match self.storage.size(&key).await? {
            None => Ok(lfs_error_response(
                StatusCode::NOT_FOUND,
                "object not found",
                request_id,
            )),
            Some(size) if size != val.size => Ok(lfs_error_response(
                StatusCode::CONFLICT,
                "size mismatch",
                request_id,
            )),
            Some(size) => {
                let object =
                    LfsObject::new(&owner, &repo, val.oid, algo, size);
                self.repo.upsert_object(&object).await?;

                Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, lfs::LFS_MIME)
                    .body(empty())?)
            }
        }
    }

    fn session_info(principal: &Principal) -> Result<Response<BoxBody>, Error> {
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(full(into_json(&principal.masked())?))?)
    }

    async fn logout(
        self,
        principal: Principal,
    ) -> Result<Response<BoxBody>, Error> {
        let (Some(id), Some(sessions)) =
            (&principal.session_id, &self.sessions)
        else {
            return Ok(plain_error_response(
                StatusCode::BAD_REQUEST,
                "not a browser session",
            ));
        };

        sessions.destroy(id).await?;
        event!(Level::INFO, subject = %principal.subject, "session ended");

        Ok(Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header(
                header::SET_COOKIE,
                clear_cookie_header(&self.config.cookie_name),
            )
            .body(empty())?)
    }

    async fn login(self, req: Req) -> Result<Response<BoxBody>, Error> {
        let Some(oauth) = &self.oauth else {
            return Self::not_found();
        };

        let base = req.base_uri().path_and_query("/").build()?;
        let host = base.authority().map(|a| a.as_str().to_owned());
        let callback = format!("{}/auth/github/callback", self.base_url(&req)?);

        let mut params = query_params(&req);
        let params = LoginParams {
            redirect_uri: params.remove("redirect_uri"),
            repo: params.remove("repo"),
        };

        let location = oauth.login(host.as_deref(), &callback, params).await?;

        Ok(Response::builder()
            .status(StatusCode::FOUND)
            .header(header::LOCATION, location)
            .body(empty())?)
    }

    async fn callback(self, req: Req) -> Result<Response<BoxBody>, Error> {
        let Some(oauth) = &self.oauth else {
            return Self::not_found();
        };

        let mut params = query_params(&req);
        let params = CallbackParams {
            code: params.remove("code"),
            state: params.remove("state"),
        };

        let login = oauth.callback(params).await?;

        Ok(Response::builder()
            .status(StatusCode::FOUND)
            .header(header::LOCATION, login.redirect_uri)
            .header(
                header::SET_COOKIE,
                session_cookie_header(
                    &self.config.cookie_name,
                    &login.session.id,
                    self.config.session_ttl,
                ),
            )
            .body(empty())?)
    }
}

impl Service<Req> for App {
    type Response = Response<BoxBody>;
    type Error = Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut Context,
    ) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    #[cfg_attr(
        feature = "otel",
        instrument(
            level = "info",
            skip(self, req),
            name = "http.request",
            fields(
                method = req.method().as_str(),
                path = req.uri().path(),
                headers
            )
        )
    )]
    fn call(&mut self, req: Req) -> Self::Future {
        let app = self.clone();

        #[cfg(feature = "otel")]
        {
            let span = tracing::Span::current();

            span.record(
                "headers",
                format!("{}", RedactedHeaders(req.headers())),
            );
            let ctx = span.context();

            Box::pin(app.route(req).with_context(ctx))
        }

        #[cfg(not(feature = "otel"))]
        {
            Box::pin(app.route(req))
        }
    }
}
