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
//! Verification of OIDC ID tokens against the issuer's published keys.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use http::{header, Request};
use http_body_util::{BodyExt, Full, Limited};
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{event, Level};

use super::principal::{Principal, PrincipalKind};
use super::AuthError;
use crate::lru::TtlCache;
use crate::singleflight::Group;
use crate::util::HttpClient;

/// Verified tokens are remembered for at most this long.
const MAX_VERIFIED_TTL: Duration = Duration::from_secs(10 * 60);

const VERIFIED_CAPACITY: usize = 10_000;

const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

const JWKS_BODY_LIMIT: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct OidcConfig {
    pub issuer: String,
    pub audience: String,
    pub jwks_url: String,

    /// How long a fetched key set counts as fresh.
    pub jwks_ttl: Duration,

    /// How long past `jwks_ttl` the old set may still be used while the
    /// issuer cannot be reached.
    pub jwks_grace: Duration,

    /// Forced refreshes (unknown `kid`, bad signature) are skipped if the
    /// set was fetched more recently than this.
    pub jwks_min_refresh: Duration,

    /// Claims copied from the token into the principal.
    pub claims: Vec<String>,

    /// Clock skew tolerated on `exp`, `nbf` and `iat`, in seconds.
    pub leeway: u64,
}

impl Default for OidcConfig {
    fn default() -> Self {
        OidcConfig {
            issuer: "https://token.actions.githubusercontent.com".into(),
            audience: String::new(),
            jwks_url:
                "https://token.actions.githubusercontent.com/.well-known/jwks"
                    .into(),
            jwks_ttl: Duration::from_secs(10 * 60),
            jwks_grace: Duration::from_secs(5 * 60),
            jwks_min_refresh: Duration::from_secs(10),
            claims: vec![
                "repository".into(),
                "repository_owner".into(),
                "ref".into(),
                "workflow".into(),
                "actor".into(),
            ],
            leeway: 60,
        }
    }
}

/// Turns a bearer token into a principal.
#[async_trait]
pub trait OidcVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}

#[async_trait]
impl<V> OidcVerifier for Arc<V>
where
    V: OidcVerifier + ?Sized,
{
    #[inline]
    async fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        self.as_ref().verify(token).await
    }
}

/// Cache key for a credential. The raw token is never stored.
pub fn token_cache_key(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    general_purpose::STANDARD.encode(hasher.finalize())
}

#[derive(Clone)]
struct CachedJwks {
    keys: Arc<JwkSet>,
    fetched_at: Instant,
}

struct Inner {
    config: OidcConfig,
    client: HttpClient,
    jwks: RwLock<Option<CachedJwks>>,
    fetches: Group<String, Arc<JwkSet>, AuthError>,
    verified: TtlCache<String, Principal>,
    verifications: Group<String, Principal, AuthError>,
    checked: AtomicU64,
}

/// Verifies RS/PS/ES/EdDSA-signed ID tokens against a JWKS endpoint.
#[derive(Clone)]
pub struct JwksVerifier {
    inner: Arc<Inner>,
}

impl JwksVerifier {
    pub fn new(config: OidcConfig, client: HttpClient) -> Self {
        JwksVerifier {
            inner: Arc::new(Inner {
                config,
                client,
                jwks: RwLock::new(None),
                fetches: Group::new(),
                verified: TtlCache::new(VERIFIED_CAPACITY),
                verifications: Group::new(),
                checked: AtomicU64::new(0),
            }),
        }
    }

    /// Tokens checked against the key set so far. Cache hits and callers
    /// that joined an in-flight check are not counted.
    pub fn checked(&self) -> u64 {
        self.inner.checked.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl OidcVerifier for JwksVerifier {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let key = token_cache_key(token);
        let now = chrono::Utc::now().timestamp();

        if let Some(principal) = self.inner.verified.get(&key) {
            if principal.expires_at > now {
                return Ok(principal);
            }
            self.inner.verified.remove(&key);
        }

        let inner = self.inner.clone();
        let token = token.to_owned();

        self.inner
            .verifications
            .run(key.clone(), move || async move {
                inner.checked.fetch_add(1, Ordering::Relaxed);
                let principal = inner.verify_uncached(&token).await?;

                let remaining = Duration::from_secs(
                    principal.remaining_secs(chrono::Utc::now().timestamp()),
                );
                inner.verified.insert(
                    key,
                    principal.clone(),
                    remaining.min(MAX_VERIFIED_TTL),
                );

                Ok(principal)
            })
            .await
    }
}

fn is_asymmetric(alg: Algorithm) -> bool {
    matches!(
        alg,
        Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512
            | Algorithm::ES256
            | Algorithm::ES384
            | Algorithm::EdDSA
    )
}

fn select_key(keys: &JwkSet, kid: Option<&str>) -> Option<Jwk> {
    match kid {
        Some(kid) => keys.find(kid).cloned(),
        None if keys.keys.len() == 1 => keys.keys.first().cloned(),
        None => None,
    }
}

/// Why a single decode attempt failed. A bad signature is kept apart so the
/// caller can retry with a fresher key set.
enum Rejection {
    BadSignature,
    Auth(AuthError),
}

impl From<AuthError> for Rejection {
    fn from(err: AuthError) -> Self {
        Rejection::Auth(err)
    }
}

impl From<jsonwebtoken::errors::Error> for Rejection {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            JwtErrorKind::InvalidSignature => Rejection::BadSignature,
            JwtErrorKind::ExpiredSignature => {
                Rejection::Auth(AuthError::Expired)
            }
            _ => Rejection::Auth(AuthError::Invalid(err.to_string())),
        }
    }
}

impl Inner {
    async fn verify_uncached(
        self: &Arc<Self>,
        token: &str,
    ) -> Result<Principal, AuthError> {
        let header = decode_header(token)
            .map_err(|e| AuthError::Invalid(e.to_string()))?;

        if !is_asymmetric(header.alg) {
            return Err(AuthError::Invalid(format!(
                "algorithm {:?} not accepted",
                header.alg
            )));
        }

        let kid = header.kid.as_deref();
        let mut keys = self.current_keys(false).await?;
        let mut refreshed = false;

        // A key we do not know, or a signature that does not check out, may
        // mean the issuer rotated its keys. Refresh once and retry.
        loop {
            let jwk = match select_key(&keys, kid) {
                Some(jwk) => jwk,
                None if !refreshed => {
                    keys = self.current_keys(true).await?;
                    refreshed = true;
                    continue;
                }
                None => {
                    return Err(AuthError::Invalid("unknown signing key".into()))
                }
            };

            match self.decode(token, &jwk, header.alg) {
                Ok(principal) => return Ok(principal),
                Err(Rejection::BadSignature) if !refreshed => {
                    keys = self.current_keys(true).await?;
                    refreshed = true;
                }
                Err(Rejection::BadSignature) => {
                    return Err(AuthError::Invalid("bad signature".into()))
                }
                Err(Rejection::Auth(err)) => return Err(err),
            }
        }
    }

    fn decode(
        &self,
        token: &str,
        jwk: &Jwk,
        alg: Algorithm,
    ) -> Result<Principal, Rejection> {
        let key = DecodingKey::from_jwk(jwk)?;

        let mut validation = Validation::new(alg);
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_audience(&[&self.config.audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.validate_nbf = true;
        validation.leeway = self.config.leeway;

        let claims =
            decode::<Map<String, Value>>(token, &key, &validation)?.claims;

        let now = chrono::Utc::now().timestamp();
        let leeway = self.config.leeway as i64;

        let issued_at = claims
            .get("iat")
            .and_then(Value::as_i64)
            .ok_or_else(|| AuthError::Invalid("missing iat".into()))?;
        if issued_at > now + leeway {
            return Err(
                AuthError::Invalid("token issued in the future".into()).into()
            );
        }

        let expires_at = claims
            .get("exp")
            .and_then(Value::as_i64)
            .ok_or_else(|| AuthError::Invalid("missing exp".into()))?;

        let subject = claims
            .get("sub")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AuthError::Invalid("missing sub".into()))?
            .to_owned();

        let selected: BTreeMap<String, Value> = self
            .config
            .claims
            .iter()
            .filter_map(|name| {
                claims.get(name).map(|v| (name.clone(), v.clone()))
            })
            .collect();

        Ok(Principal {
            kind: PrincipalKind::Oidc,
            issuer: self.config.issuer.clone(),
            subject,
            claims: selected,
            session_id: None,
            issued_at,
            expires_at,
        })
    }

    /// The key set to verify with, fetching it when missing, expired, or
    /// when `force` is set.
    async fn current_keys(
        self: &Arc<Self>,
        force: bool,
    ) -> Result<Arc<JwkSet>, AuthError> {
        let cached = self.jwks.read().clone();
        let ttl = self.config.jwks_ttl;
        let grace = self.config.jwks_grace;

        if let Some(cached) = &cached {
            let age = cached.fetched_at.elapsed();
            let fresh = age < ttl;
            let recent = age < self.config.jwks_min_refresh;

            if (fresh && !force) || (force && recent) {
                return Ok(cached.keys.clone());
            }
        }

        match self.refresh().await {
            Ok(keys) => Ok(keys),
            Err(err) => match cached {
                Some(cached) if cached.fetched_at.elapsed() < ttl + grace => {
                    event!(
                        Level::WARN,
                        issuer = %self.config.issuer,
                        error = %err,
                        "JWKS refresh failed, using previous key set"
                    );
                    Ok(cached.keys)
                }
                _ => Err(err),
            },
        }
    }

    async fn refresh(self: &Arc<Self>) -> Result<Arc<JwkSet>, AuthError> {
        let inner = self.clone();

        self.fetches
            .run(self.config.issuer.clone(), move || async move {
                let keys = Arc::new(inner.fetch().await?);
                *inner.jwks.write() = Some(CachedJwks {
                    keys: keys.clone(),
                    fetched_at: Instant::now(),
                });

                event!(
                    Level::INFO,
                    issuer = %inner.config.issuer,
                    keys = keys.keys.len(),
                    "fetched JWKS"
                );

                Ok(keys)
            })
            .await
    }

    async fn fetch(&self) -> Result<JwkSet, AuthError> {
        let internal =
            |e: &dyn std::fmt::Display| AuthError::Internal(e.to_string());

        let req = Request::get(&self.config.jwks_url)
            .header(header::ACCEPT, "application/json")
            .body(Full::new(Bytes::new()))
            .map_err(|e| internal(&e))?;

        let resp =
            tokio::time::timeout(JWKS_FETCH_TIMEOUT, self.client.request(req))
                .await
                .map_err(|e| internal(&e))?
                .map_err(|e| internal(&e))?;

        if !resp.status().is_success() {
            return Err(AuthError::Internal(format!(
                "JWKS endpoint returned {}",
                resp.status()
            )));
        }

        let body = Limited::new(resp.into_body(), JWKS_BODY_LIMIT)
            .collect()
            .await
            .map_err(|e| internal(&e))?
            .to_bytes();

        serde_json::from_slice(&body).map_err(|e| internal(&e))
    }
}

/// A fixed table of tokens. For tests and local development only.
#[derive(Default)]
pub struct StaticVerifier {
    tokens: HashMap<String, Principal>,
}

impl StaticVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: &str, principal: Principal) -> Self {
        self.tokens.insert(token.to_owned(), principal);
        self
    }
}

#[async_trait]
impl OidcVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let principal = self
            .tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::Invalid("unknown token".into()))?;

        if principal.expires_at <= chrono::Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }

        Ok(principal)
    }
}
