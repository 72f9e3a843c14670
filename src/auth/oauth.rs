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
//! GitHub OAuth browser login, ending in a server-side session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, Request, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{event, Level};
use url::Url;

use super::principal::{Principal, PrincipalKind};
use super::session::{random_id, Session, SessionStore};
use crate::access::AccessService;
use crate::error::ErrorKind;
use crate::kv::KvStore;
use crate::repo::keys;
use crate::util::HttpClient;

pub const STATE_TTL: Duration = Duration::from_secs(10 * 60);

/// How long a state outlives its expiry in the store, so a late callback is
/// told the state expired rather than that it never existed.
const STATE_GRACE: Duration = Duration::from_secs(60);

/// Issuer recorded on principals created by this flow.
pub const GITHUB_ISSUER: &str = "https://github.com";

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

const PROVIDER_BODY_LIMIT: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OAuthError {
    #[error("unknown_state")]
    UnknownState,

    #[error("expired_state")]
    ExpiredState,

    #[error("exchange_failed")]
    ExchangeFailed(String),

    #[error("forbidden_redirect")]
    ForbiddenRedirect,

    #[error("forbidden_host")]
    ForbiddenHost,

    #[error("repository is not allow-listed")]
    NotAllowlisted,

    #[error("login temporarily unavailable")]
    Unavailable(String),
}

impl OAuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OAuthError::UnknownState
            | OAuthError::ExpiredState
            | OAuthError::ForbiddenRedirect => ErrorKind::InvalidInput,
            OAuthError::ExchangeFailed(_) => ErrorKind::Unauthenticated,
            OAuthError::ForbiddenHost | OAuthError::NotAllowlisted => {
                ErrorKind::Forbidden
            }
            OAuthError::Unavailable(_) => ErrorKind::DependencyUnavailable,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub authorize_url: String,
    pub token_url: String,
    pub api_url: String,

    /// Where the provider sends the browser back to. Derived from the login
    /// request when unset.
    pub callback_url: Option<String>,

    /// `Host` values login requests may arrive on. Empty allows any.
    pub allowed_hosts: Vec<String>,

    /// Where the browser may be sent after login.
    pub allowed_redirect_uris: Vec<String>,

    pub scope: String,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        OAuthConfig {
            client_id: String::new(),
            client_secret: String::new(),
            authorize_url: "https://github.com/login/oauth/authorize".into(),
            token_url: "https://github.com/login/oauth/access_token".into(),
            api_url: "https://api.github.com".into(),
            callback_url: None,
            allowed_hosts: Vec::new(),
            allowed_redirect_uris: Vec::new(),
            scope: "read:user".into(),
        }
    }
}

/// What a login remembered for its callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    pub redirect_uri: String,

    /// `owner/name` the login was started for, checked against the
    /// allow-list before a session is issued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,

    /// Unix seconds.
    pub created_at: i64,
    pub expires_at: i64,
}

/// Single-use OAuth `state` values.
#[async_trait]
pub trait OAuthStateStore: Send + Sync {
    /// Stores `record` under a fresh random state and returns the state.
    async fn issue(&self, record: &StateRecord) -> Result<String, OAuthError>;

    /// Removes and returns the record. A state can be consumed once.
    async fn consume(&self, state: &str) -> Result<StateRecord, OAuthError>;
}

#[async_trait]
impl<T> OAuthStateStore for Arc<T>
where
    T: OAuthStateStore + ?Sized,
{
    #[inline]
    async fn issue(&self, record: &StateRecord) -> Result<String, OAuthError> {
        self.as_ref().issue(record).await
    }

    #[inline]
    async fn consume(&self, state: &str) -> Result<StateRecord, OAuthError> {
        self.as_ref().consume(state).await
    }
}

pub struct KvOAuthStateStore {
    kv: Arc<dyn KvStore>,
}

impl KvOAuthStateStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        KvOAuthStateStore { kv }
    }
}

#[async_trait]
impl OAuthStateStore for KvOAuthStateStore {
    async fn issue(&self, record: &StateRecord) -> Result<String, OAuthError> {
        let value = serde_json::to_string(record)
            .map_err(|e| OAuthError::Unavailable(e.to_string()))?;
        let remaining = record.expires_at - chrono::Utc::now().timestamp();
        let ttl = Duration::from_secs(u64::try_from(remaining).unwrap_or(0))
            + STATE_GRACE;

        loop {
            let state = random_id();
            let fresh = self
                .kv
                .set_nx(&keys::oauth_state(&state), &value, ttl)
                .await
                .map_err(|e| OAuthError::Unavailable(e.to_string()))?;

            if fresh {
                return Ok(state);
            }
        }
    }

    async fn consume(&self, state: &str) -> Result<StateRecord, OAuthError> {
        let value = self
            .kv
            .take(&keys::oauth_state(state))
            .await
            .map_err(|e| OAuthError::Unavailable(e.to_string()))?
            .ok_or(OAuthError::UnknownState)?;

        let record: StateRecord = serde_json::from_str(&value)
            .map_err(|e| OAuthError::Unavailable(e.to_string()))?;

        if record.expires_at <= chrono::Utc::now().timestamp() {
            return Err(OAuthError::ExpiredState);
        }

        Ok(record)
    }
}

/// Compares two absolute URIs on scheme, host, port and path. Queries are
/// ignored and one trailing slash on the path does not matter.
pub fn redirect_matches(candidate: &str, allowed: &str) -> bool {
    let (Ok(candidate), Ok(allowed)) =
        (Url::parse(candidate), Url::parse(allowed))
    else {
        return false;
    };

    fn path(url: &Url) -> &str {
        let path = url.path();
        path.strip_suffix('/').unwrap_or(path)
    }

    candidate.scheme() == allowed.scheme()
        && candidate.host_str() == allowed.host_str()
        && candidate.port_or_known_default() == allowed.port_or_known_default()
        && path(&candidate) == path(&allowed)
}

/// `Set-Cookie` value carrying a session id.
pub fn session_cookie_header(name: &str, id: &str, ttl: Duration) -> String {
    format!(
        "{}={}; Path=/; Max-Age={}; HttpOnly; Secure; SameSite=Lax",
        name,
        id,
        ttl.as_secs()
    )
}

/// `Set-Cookie` value that removes the session cookie.
pub fn clear_cookie_header(name: &str) -> String {
    format!("{}=; Path=/; Max-Age=0; HttpOnly; Secure; SameSite=Lax", name)
}

#[derive(Debug, Clone, Default)]
pub struct LoginParams {
    pub redirect_uri: Option<String>,
    pub repo: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct GithubUser {
    login: String,
    id: u64,
}

/// A completed login.
#[derive(Debug, Clone)]
pub struct Login {
    pub session: Session,
    pub redirect_uri: String,
}

pub struct GithubOAuth {
    config: OAuthConfig,
    client: HttpClient,
    states: Arc<dyn OAuthStateStore>,
    sessions: Arc<dyn SessionStore>,
    access: Arc<AccessService>,
}

impl GithubOAuth {
    pub fn new(
        config: OAuthConfig,
        client: HttpClient,
        states: Arc<dyn OAuthStateStore>,
        sessions: Arc<dyn SessionStore>,
        access: Arc<AccessService>,
    ) -> Self {
        GithubOAuth {
            config,
            client,
            states,
            sessions,
            access,
        }
    }

    fn host_allowed(&self, host: Option<&str>) -> bool {
        if self.config.allowed_hosts.is_empty() {
            return true;
        }

        let Some(host) = host else {
            return false;
        };
        let bare = host.rsplit_once(':').map_or(host, |(h, _)| h);

        self.config
            .allowed_hosts
            .iter()
            .any(|h| {
                h.eq_ignore_ascii_case(host) || h.eq_ignore_ascii_case(bare)
            })
    }

    fn redirect_allowed(&self, uri: &str) -> bool {
        self.config
            .allowed_redirect_uris
            .iter()
            .any(|allowed| redirect_matches(uri, allowed))
    }

    /// Starts a login. Returns the provider URL to send the browser to.
    ///
    /// `host` is the `Host` the request arrived on and `default_callback` the
    /// callback URL derived from it.
    pub async fn login(
        &self,
        host: Option<&str>,
        default_callback: &str,
        params: LoginParams,
    ) -> Result<String, OAuthError> {
        if !self.host_allowed(host) {
            return Err(OAuthError::ForbiddenHost);
        }

        let redirect_uri = match params.redirect_uri {
            Some(uri) => uri,
            None => self
                .config
                .allowed_redirect_uris
                .first()
                .cloned()
                .ok_or(OAuthError::ForbiddenRedirect)?,
        };

        if !self.redirect_allowed(&redirect_uri) {
            event!(
                Level::INFO,
                redirect_uri = %redirect_uri,
                "redirect refused"
            );
            return Err(OAuthError::ForbiddenRedirect);
        }

        let now = chrono::Utc::now().timestamp();
        let record = StateRecord {
            redirect_uri,
            repo: params.repo,
            created_at: now,
            expires_at: now + STATE_TTL.as_secs() as i64,
        };
        let state = self.states.issue(&record).await?;

        let callback = self
            .config
            .callback_url
            .as_deref()
            .unwrap_or(default_callback);

        let mut url = Url::parse(&self.config.authorize_url)
            .map_err(|e| OAuthError::Unavailable(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", callback)
            .append_pair("scope", &self.config.scope)
            .append_pair("state", &state);

        Ok(url.into())
    }

    /// Finishes a login: consumes the state, exchanges the code and opens a
    /// session.
    pub async fn callback(
        &self,
        params: CallbackParams,
    ) -> Result<Login, OAuthError> {
        let state = params.state.ok_or(OAuthError::UnknownState)?;

        // The state is spent even if the rest fails.
        let record = self.states.consume(&state).await?;

        let code = params
            .code
            .filter(|c| !c.is_empty())
            .ok_or_else(|| OAuthError::ExchangeFailed("missing code".into()))?;

        let token = self.exchange(&code).await?;
        let user = self.user(&token).await?;

        if let Some((owner, repo)) =
            record.repo.as_deref().and_then(|r| r.split_once('/'))
        {
            let allowed = self
                .access
                .is_allowlisted(owner, repo)
                .await
                .map_err(|e| OAuthError::Unavailable(e.to_string()))?;
            if !allowed {
                return Err(OAuthError::NotAllowlisted);
            }
        }

        let now = chrono::Utc::now().timestamp();
        let principal = Principal {
            kind: PrincipalKind::Session,
            issuer: GITHUB_ISSUER.into(),
            subject: user.login.clone(),
            claims: [
                ("login".to_owned(), Value::String(user.login)),
                ("id".to_owned(), Value::from(user.id)),
            ]
            .into_iter()
            .collect(),
            session_id: None,
            issued_at: now,
            expires_at: now,
        };

        let session = self
            .sessions
            .create(principal)
            .await
            .map_err(|e| OAuthError::Unavailable(e.to_string()))?;

        Ok(Login {
            session,
            redirect_uri: record.redirect_uri,
        })
    }

    async fn exchange(&self, code: &str) -> Result<String, OAuthError> {
        let form = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("client_id", &self.config.client_id)
            .append_pair("client_secret", &self.config.client_secret)
            .append_pair("code", code)
            .finish();

        let req = Request::post(&self.config.token_url)
            .header(header::ACCEPT, "application/json")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(header::USER_AGENT, "lfs-gateway")
            .body(Full::new(Bytes::from(form)))
            .map_err(|e| OAuthError::ExchangeFailed(e.to_string()))?;

        let resp: TokenResponse = self.send(req).await?;

        match (resp.access_token, resp.error) {
            (Some(token), None) if !token.is_empty() => Ok(token),
            (_, Some(error)) => Err(OAuthError::ExchangeFailed(error)),
            _ => Err(OAuthError::ExchangeFailed("no access token".into())),
        }
    }

    async fn user(&self, token: &str) -> Result<GithubUser, OAuthError> {
        let url = format!("{}/user", self.config.api_url.trim_end_matches('/'));

        let req = Request::get(url)
            .header(header::ACCEPT, "application/vnd.github+json")
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(header::USER_AGENT, "lfs-gateway")
            .body(Full::new(Bytes::new()))
            .map_err(|e| OAuthError::ExchangeFailed(e.to_string()))?;

        self.send(req).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        req: Request<Full<Bytes>>,
    ) -> Result<T, OAuthError> {
        let uri = req.uri().clone();
        let failed = |e: &dyn std::fmt::Display| {
            OAuthError::ExchangeFailed(e.to_string())
        };

        let resp =
            tokio::time::timeout(PROVIDER_TIMEOUT, self.client.request(req))
                .await
                .map_err(|e| failed(&e))?
                .map_err(|e| failed(&e))?;

        let status = resp.status();
        event!(
            Level::DEBUG,
            status = ?status,
            uri = %uri,
            "oauth provider call"
        );

        if status != StatusCode::OK {
            return Err(OAuthError::ExchangeFailed(format!(
                "provider returned {}",
                status
            )));
        }

        let body = Limited::new(resp.into_body(), PROVIDER_BODY_LIMIT)
            .collect()
            .await
            .map_err(|e| failed(&e))?
            .to_bytes();

        serde_json::from_slice(&body).map_err(|e| failed(&e))
    }
}
