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
//! Source of truth for object metadata, the repository allow-list and access
//! policies.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::access::AccessPolicy;
use crate::error::ErrorKind;
use crate::lfs::{HashAlgorithm, Oid};
use crate::storage::key_for;

pub use self::memory::MemoryDb;
pub use self::postgres::{PostgresConfig, PostgresDb};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    #[error("size mismatch: stored {stored} bytes, requested {requested}")]
    SizeConflict { stored: u64, requested: u64 },

    #[error("database error: {0}")]
    Database(String),

    #[error("corrupt metadata row: {0}")]
    Corrupt(String),
}

impl MetadataError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MetadataError::SizeConflict { .. } => ErrorKind::Conflict,
            MetadataError::Database(_) => ErrorKind::DependencyUnavailable,
            MetadataError::Corrupt(_) => ErrorKind::Internal,
        }
    }
}

impl From<sqlx::Error> for MetadataError {
    fn from(err: sqlx::Error) -> Self {
        MetadataError::Database(err.to_string())
    }
}

/// One stored LFS object, scoped to a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LfsObject {
    pub owner: String,
    pub repo: String,
    pub oid: Oid,
    pub algo: HashAlgorithm,
    pub size: u64,
    pub storage_key: String,
}

impl LfsObject {
    pub fn new(
        owner: &str,
        repo: &str,
        oid: Oid,
        algo: HashAlgorithm,
        size: u64,
    ) -> Self {
        let storage_key = key_for(&oid, &algo).to_string();
        LfsObject {
            owner: owner.to_owned(),
            repo: repo.to_owned(),
            oid,
            algo,
            size,
            storage_key,
        }
    }
}

#[async_trait]
pub trait MetadataRepo: Send + Sync {
    async fn get_object(
        &self,
        owner: &str,
        repo: &str,
        oid: &Oid,
    ) -> Result<Option<LfsObject>, MetadataError>;

    /// Records an object. Inserting a row that already exists with the same
    /// size succeeds and returns the stored row; a different size is a
    /// [`MetadataError::SizeConflict`].
    async fn upsert_object(
        &self,
        object: &LfsObject,
    ) -> Result<LfsObject, MetadataError>;

    /// True if `(owner, repo)` is on the allow-list and enabled.
    async fn is_allowed(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<bool, MetadataError>;

    async fn ping(&self) -> Result<(), MetadataError>;
}

#[async_trait]
pub trait PolicyRepo: Send + Sync {
    /// Every policy issued for principals of `issuer`.
    async fn policies_for_issuer(
        &self,
        issuer: &str,
    ) -> Result<Vec<AccessPolicy>, MetadataError>;
}

#[async_trait]
impl<R> MetadataRepo for Arc<R>
where
    R: MetadataRepo + ?Sized,
{
    #[inline]
    async fn get_object(
        &self,
        owner: &str,
        repo: &str,
        oid: &Oid,
    ) -> Result<Option<LfsObject>, MetadataError> {
        self.as_ref().get_object(owner, repo, oid).await
    }

    #[inline]
    async fn upsert_object(
        &self,
        object: &LfsObject,
    ) -> Result<LfsObject, MetadataError> {
        self.as_ref().upsert_object(object).await
    }

    #[inline]
    async fn is_allowed(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<bool, MetadataError> {
        self.as_ref().is_allowed(owner, repo).await
    }

    #[inline]
    async fn ping(&self) -> Result<(), MetadataError> {
        self.as_ref().ping().await
    }
}

#[async_trait]
impl<R> PolicyRepo for Arc<R>
where
    R: PolicyRepo + ?Sized,
{
    #[inline]
    async fn policies_for_issuer(
        &self,
        issuer: &str,
    ) -> Result<Vec<AccessPolicy>, MetadataError> {
        self.as_ref().policies_for_issuer(issuer).await
    }
}
