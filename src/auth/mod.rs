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
pub mod oauth;
pub mod oidc;
pub mod principal;
pub mod session;

use std::sync::Arc;
use std::task::{Context, Poll};

use base64::{engine::general_purpose, Engine as _};
use futures::future::BoxFuture;
use http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode};
use tower::Service;
#[cfg(feature = "otel")]
use tracing::instrument;
use tracing::{event, Level};

use crate::error::{lfs_error_response, plain_error_response, ErrorKind};
use crate::logger::RequestId;
use crate::util::BoxBody;

pub use self::oidc::{JwksVerifier, OidcConfig, OidcVerifier, StaticVerifier};
pub use self::principal::{Principal, PrincipalKind};
pub use self::session::{KvSessionStore, Session, SessionStore};

pub const DEFAULT_COOKIE_NAME: &str = "lfs_session";

/// Why a request could not be authenticated. The display form is the code
/// returned to clients; details stay in the logs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing_credential")]
    Missing,

    #[error("invalid_credential")]
    Invalid(String),

    #[error("expired_credential")]
    Expired,

    #[error("revoked_credential")]
    Revoked,

    #[error("internal_verification_error")]
    Internal(String),
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::Internal(_) => ErrorKind::DependencyUnavailable,
            _ => ErrorKind::Unauthenticated,
        }
    }

    fn detail(&self) -> Option<&str> {
        match self {
            AuthError::Invalid(detail) | AuthError::Internal(detail) => {
                Some(detail)
            }
            _ => None,
        }
    }
}

/// A credential found on a request. When several are present the bearer
/// token wins.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Bearer(String),
    Session(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Bearer(_) => f.write_str("Bearer([REDACTED])"),
            Credential::Session(_) => f.write_str("Session([REDACTED])"),
        }
    }
}

impl Credential {
    /// Looks for, in order, `Authorization: Bearer`, `Authorization: Basic`
    /// carrying the token as its password, and the session cookie.
    pub fn from_headers(
        headers: &HeaderMap,
        cookie_name: &str,
    ) -> Option<Self> {
        if let Some(token) = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(token_from_authorization)
        {
            return Some(Credential::Bearer(token));
        }

        session_cookie(headers, cookie_name).map(Credential::Session)
    }
}

fn token_from_authorization(value: &str) -> Option<String> {
    let (scheme, rest) = value.trim().split_once(' ')?;
    let rest = rest.trim();

    if scheme.eq_ignore_ascii_case("bearer") {
        return (!rest.is_empty()).then(|| rest.to_owned());
    }

    if scheme.eq_ignore_ascii_case("basic") {
        let decoded = general_purpose::STANDARD.decode(rest).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (_user, password) = decoded.split_once(':')?;
        return (!password.is_empty()).then(|| password.to_owned());
    }

    None
}

/// The value of cookie `name`, if sent.
pub fn session_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

/// Resolves requests to principals through whichever verifiers are enabled.
pub struct Authenticator {
    oidc: Option<Arc<dyn OidcVerifier>>,
    sessions: Option<Arc<dyn SessionStore>>,
    cookie_name: String,
}

impl Authenticator {
    pub fn new(
        oidc: Option<Arc<dyn OidcVerifier>>,
        sessions: Option<Arc<dyn SessionStore>>,
        cookie_name: impl Into<String>,
    ) -> Self {
        Authenticator {
            oidc,
            sessions,
            cookie_name: cookie_name.into(),
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    pub fn sessions(&self) -> Option<&Arc<dyn SessionStore>> {
        self.sessions.as_ref()
    }

    #[cfg_attr(feature = "otel", instrument(level = "debug", skip_all, err))]
    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
    ) -> Result<Principal, AuthError> {
        match Credential::from_headers(headers, &self.cookie_name) {
            None => Err(AuthError::Missing),
            Some(Credential::Bearer(token)) => match &self.oidc {
                Some(oidc) => oidc.verify(&token).await,
                None => Err(AuthError::Invalid(
                    "bearer tokens are not accepted".into(),
                )),
            },
            Some(Credential::Session(id)) => match &self.sessions {
                Some(sessions) => sessions.lookup(&id).await,
                None => Err(AuthError::Invalid(
                    "sessions are not enabled".into(),
                )),
            },
        }
    }
}

/// How an endpoint reports errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorStyle {
    /// LFS JSON, as the batch and verify endpoints use.
    Lfs,

    /// Plain text from a streaming endpoint.
    Proxy,

    /// Plain text from anything else.
    Plain,
}

impl ErrorStyle {
    pub(crate) fn for_path(path: &str) -> ErrorStyle {
        match path.split_once("/info/lfs/") {
            Some((_, rest)) => match rest.strip_prefix("objects/") {
                Some("batch") | Some("verify") => ErrorStyle::Lfs,
                Some(_) => ErrorStyle::Proxy,
                None => ErrorStyle::Lfs,
            },
            None => ErrorStyle::Plain,
        }
    }

    pub(crate) fn respond(
        self,
        kind: ErrorKind,
        message: impl Into<String>,
        request_id: Option<&RequestId>,
    ) -> Response<BoxBody> {
        let status = kind.status(self == ErrorStyle::Proxy);
        match self {
            ErrorStyle::Lfs => lfs_error_response(
                status,
                message,
                request_id.map(|id| id.0.as_str()),
            ),
            ErrorStyle::Proxy | ErrorStyle::Plain => {
                plain_error_response(status, message)
            }
        }
    }
}

/// Paths that require a principal.
pub fn is_protected(path: &str) -> bool {
    path == "/auth/session" || path.contains("/info/lfs/")
}

/// Adds the authentication challenges git-lfs expects on a `401`.
pub(crate) fn challenge(resp: &mut Response<BoxBody>) {
    if resp.status() != StatusCode::UNAUTHORIZED {
        return;
    }

    let headers = resp.headers_mut();
    headers.insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Bearer realm=\"git-lfs\""),
    );
    headers.insert(
        "LFS-Authenticate",
        HeaderValue::from_static("Basic realm=\"git-lfs\""),
    );
}

fn unauthorized(
    err: &AuthError,
    path: &str,
    request_id: Option<&RequestId>,
) -> Response<BoxBody> {
    let mut resp = ErrorStyle::for_path(path).respond(
        err.kind(),
        err.to_string(),
        request_id,
    );
    challenge(&mut resp);
    resp
}

/// Middleware that authenticates protected requests and attaches the
/// [`Principal`] to the request extensions.
#[derive(Clone)]
pub struct Auth<S> {
    authenticator: Arc<Authenticator>,
    service: S,
}

impl<S> Auth<S> {
    pub fn new(service: S, authenticator: Arc<Authenticator>) -> Self {
        Auth {
            authenticator,
            service,
        }
    }
}

impl<S, B> Service<Request<B>> for Auth<S>
where
    S: Service<Request<B>, Response = Response<BoxBody>>
        + Send
        + Clone
        + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    B: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        cx: &mut Context,
    ) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        if !is_protected(req.uri().path()) {
            return Box::pin(self.service.call(req));
        }

        let authenticator = self.authenticator.clone();
        let mut service = self.service.clone();

        Box::pin(async move {
            match authenticator.authenticate(req.headers()).await {
                Ok(principal) => {
                    event!(
                        Level::DEBUG,
                        kind = %principal.kind,
                        issuer = %principal.issuer,
                        "authenticated"
                    );
                    req.extensions_mut().insert(principal);
                    service.call(req).await
                }
                Err(err) => {
                    event!(
                        Level::INFO,
                        code = %err,
                        detail = err.detail().unwrap_or(""),
                        "authentication failed"
                    );
                    Ok(unauthorized(
                        &err,
                        req.uri().path(),
                        req.extensions().get::<RequestId>(),
                    ))
                }
            }
        })
    }
}
