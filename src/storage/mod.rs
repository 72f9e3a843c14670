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
pub mod memory;
pub mod s3;

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use derive_more::Display;
use futures::stream::BoxStream;
use futures::Stream;

use crate::lfs::{HashAlgorithm, KeyError, Oid};

pub use self::memory::MemoryStorage;
pub use self::s3::{S3Config, S3Storage};

/// Presigned URLs are valid for this long unless configured otherwise.
pub const DEFAULT_PRESIGN_TTL: Duration = Duration::from_secs(15 * 60);

/// A stream of object bytes moving to or from the store.
pub type ObjectStream =
    Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + Sync + 'static>>;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum StorageOp {
    #[display("put")]
    Put,
    #[display("get")]
    Get,
    #[display("head")]
    Head,
    #[display("delete")]
    Delete,
    #[display("presign")]
    Presign,
    #[display("head_bucket")]
    HeadBucket,
}

/// A failed call to the object store, tagged with the operation that failed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("storage {operation} error: {cause}")]
pub struct StorageError {
    pub operation: StorageOp,
    pub cause: String,
}

impl StorageError {
    pub fn new(operation: StorageOp, cause: impl std::fmt::Display) -> Self {
        StorageError {
            operation,
            cause: cause.to_string(),
        }
    }
}

/// Location of an object inside the bucket. Only [`generate_storage_key`]
/// constructs these.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Builds `objects/<algo>/<oid[0:2]>/<oid[2:4]>/<oid>`.
///
/// The algorithm is checked before the oid, so a request that gets both
/// wrong is reported as an invalid algorithm.
pub fn generate_storage_key(
    oid: &str,
    algo: &str,
) -> Result<StorageKey, KeyError> {
    let algo: HashAlgorithm = algo.parse()?;
    let oid: Oid = oid.parse()?;
    Ok(key_for(&oid, &algo))
}

/// Same layout as [`generate_storage_key`] for already validated parts.
pub fn key_for(oid: &Oid, algo: &HashAlgorithm) -> StorageKey {
    let oid = oid.as_str();
    StorageKey(format!(
        "objects/{}/{}/{}/{}",
        algo.as_str(),
        &oid[0..2],
        &oid[2..4],
        oid
    ))
}

/// An object read back from the store.
pub struct StoredObject {
    pub len: u64,
    pub stream: BoxStream<'static, io::Result<Bytes>>,
}

/// Capabilities the server needs from an object store.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Writes exactly `len` bytes from `stream` to `key`.
    async fn put(
        &self,
        key: &StorageKey,
        stream: ObjectStream,
        len: u64,
    ) -> Result<(), StorageError>;

    /// Opens the object for reading. `None` if it does not exist.
    async fn get(
        &self,
        key: &StorageKey,
    ) -> Result<Option<StoredObject>, StorageError>;

    /// Size of the object, or `None` if it does not exist.
    async fn size(&self, key: &StorageKey) -> Result<Option<u64>, StorageError>;

    async fn head(&self, key: &StorageKey) -> Result<bool, StorageError> {
        Ok(self.size(key).await?.is_some())
    }

    async fn delete(&self, key: &StorageKey) -> Result<(), StorageError>;

    /// Checks that the bucket exists and our credentials work.
    async fn head_bucket(&self) -> Result<(), StorageError>;

    async fn presign_put(
        &self,
        key: &StorageKey,
        ttl: Duration,
    ) -> Result<String, StorageError>;

    async fn presign_get(
        &self,
        key: &StorageKey,
        ttl: Duration,
    ) -> Result<String, StorageError>;
}

#[async_trait]
impl<S> ObjectStorage for Arc<S>
where
    S: ObjectStorage + ?Sized,
{
    #[inline]
    async fn put(
        &self,
        key: &StorageKey,
        stream: ObjectStream,
        len: u64,
    ) -> Result<(), StorageError> {
        self.as_ref().put(key, stream, len).await
    }

    #[inline]
    async fn get(
        &self,
        key: &StorageKey,
    ) -> Result<Option<StoredObject>, StorageError> {
        self.as_ref().get(key).await
    }

    #[inline]
    async fn size(
        &self,
        key: &StorageKey,
    ) -> Result<Option<u64>, StorageError> {
        self.as_ref().size(key).await
    }

    #[inline]
    async fn head(&self, key: &StorageKey) -> Result<bool, StorageError> {
        self.as_ref().head(key).await
    }

    #[inline]
    async fn delete(&self, key: &StorageKey) -> Result<(), StorageError> {
        self.as_ref().delete(key).await
    }

    #[inline]
    async fn head_bucket(&self) -> Result<(), StorageError> {
        self.as_ref().head_bucket().await
    }

    #[inline]
    async fn presign_put(
        &self,
        key: &StorageKey,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        self.as_ref().presign_put(key, ttl).await
    }

    #[inline]
    async fn presign_get(
        &self,
        key: &StorageKey,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        self.as_ref().presign_get(key, ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let key = generate_storage_key("ABCD", "SHA256").unwrap();
        assert_eq!(key.as_str(), "objects/SHA256/AB/CD/ABCD");

        let oid = "ab".repeat(32);
        let key = generate_storage_key(&oid, "sha256").unwrap();
        assert_eq!(key.to_string(), format!("objects/sha256/ab/ab/{}", oid));
        assert!(!key.as_str().ends_with('/'));
    }

    #[test]
    fn key_rejects_bad_input() {
        assert_eq!(
            generate_storage_key("abc", "sha256"),
            Err(KeyError::InvalidOid)
        );
        assert_eq!(
            generate_storage_key("abcg", "sha256"),
            Err(KeyError::InvalidOid)
        );
        assert_eq!(
            generate_storage_key("abcd", "../etc"),
            Err(KeyError::InvalidHashAlgorithm)
        );
        assert_eq!(
            generate_storage_key("abcd", "sha..256"),
            Err(KeyError::InvalidHashAlgorithm)
        );
        assert_eq!(
            generate_storage_key("abcd", ""),
            Err(KeyError::InvalidHashAlgorithm)
        );
    }
}
