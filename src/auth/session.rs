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
//! Server-side browser sessions created by the OAuth flow.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{event, Level};

use super::principal::{Principal, PrincipalKind};
use super::AuthError;
use crate::kv::{KvError, KvStore};
use crate::repo::keys;

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// 128 random bits, hex encoded.
pub fn random_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub principal: Principal,

    /// Unix seconds.
    pub created_at: i64,
    pub expires_at: i64,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Starts a session for `principal`. The principal is rewritten to carry
    /// the new session's id and lifetime.
    async fn create(&self, principal: Principal) -> Result<Session, AuthError>;

    /// Resolves a cookie value to its principal.
    async fn lookup(&self, id: &str) -> Result<Principal, AuthError>;

    async fn destroy(&self, id: &str) -> Result<(), AuthError>;
}

#[async_trait]
impl<T> SessionStore for Arc<T>
where
    T: SessionStore + ?Sized,
{
    #[inline]
    async fn create(&self, principal: Principal) -> Result<Session, AuthError> {
        self.as_ref().create(principal).await
    }

    #[inline]
    async fn lookup(&self, id: &str) -> Result<Principal, AuthError> {
        self.as_ref().lookup(id).await
    }

    #[inline]
    async fn destroy(&self, id: &str) -> Result<(), AuthError> {
        self.as_ref().destroy(id).await
    }
}

fn unavailable(err: KvError) -> AuthError {
    AuthError::Internal(err.to_string())
}

/// Sessions kept in the key-value store, expiring with their TTL.
pub struct KvSessionStore {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl KvSessionStore {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        KvSessionStore { kv, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[async_trait]
impl SessionStore for KvSessionStore {
    async fn create(
        &self,
        mut principal: Principal,
    ) -> Result<Session, AuthError> {
        let id = random_id();
        let now = chrono::Utc::now().timestamp();
        let expires_at = now + self.ttl.as_secs() as i64;

        principal.kind = PrincipalKind::Session;
        principal.session_id = Some(id.clone());
        principal.issued_at = now;
        principal.expires_at = expires_at;

        let session = Session {
            id,
            principal,
            created_at: now,
            expires_at,
        };

        let value = serde_json::to_string(&session)
            .map_err(|e| AuthError::Internal(e.to_string()))?;

        let created = self
            .kv
            .set_nx(&keys::session(&session.id), &value, self.ttl)
            .await
            .map_err(unavailable)?;

        if !created {
            return Err(AuthError::Internal("session id collision".into()));
        }

        event!(
            Level::INFO,
            subject = %session.principal.subject,
            expires_at = session.expires_at,
            "session created"
        );

        Ok(session)
    }

    async fn lookup(&self, id: &str) -> Result<Principal, AuthError> {
        let key = keys::session(id);

        let value = self
            .kv
            .get(&key)
            .await
            .map_err(unavailable)?
            .ok_or(AuthError::Revoked)?;

        let session: Session = serde_json::from_str(&value)
            .map_err(|e| AuthError::Internal(e.to_string()))?;

        if session.expires_at <= chrono::Utc::now().timestamp() {
            if let Err(err) = self.kv.delete(&[key]).await {
                event!(
                    Level::WARN,
                    error = %err,
                    "failed to drop expired session"
                );
            }
            return Err(AuthError::Expired);
        }

        Ok(session.principal)
    }

    async fn destroy(&self, id: &str) -> Result<(), AuthError> {
        self.kv
            .delete(&[keys::session(id)])
            .await
            .map_err(unavailable)
    }
}
