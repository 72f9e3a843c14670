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
//! Key-value capability backing the metadata cache, sessions and OAuth state.

pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use self::memory::MemoryKv;
pub use self::redis::{RedisConfig, RedisKv};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cache {operation} error: {cause}")]
pub struct KvError {
    pub operation: &'static str,
    pub cause: String,
}

impl KvError {
    pub fn new(operation: &'static str, cause: impl std::fmt::Display) -> Self {
        KvError {
            operation,
            cause: cause.to_string(),
        }
    }
}

/// The handful of atomic operations the server relies on.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// `SET key value PX ttl`
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), KvError>;

    /// `SET key value NX PX ttl`. Returns false if the key already existed.
    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, KvError>;

    /// `GETDEL key`. At most one caller observes the value.
    async fn take(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn delete(&self, keys: &[String]) -> Result<(), KvError>;

    async fn ping(&self) -> Result<(), KvError>;
}

#[async_trait]
impl<K> KvStore for Arc<K>
where
    K: KvStore + ?Sized,
{
    #[inline]
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.as_ref().get(key).await
    }

    #[inline]
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), KvError> {
        self.as_ref().set(key, value, ttl).await
    }

    #[inline]
    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        self.as_ref().set_nx(key, value, ttl).await
    }

    #[inline]
    async fn take(&self, key: &str) -> Result<Option<String>, KvError> {
        self.as_ref().take(key).await
    }

    #[inline]
    async fn delete(&self, keys: &[String]) -> Result<(), KvError> {
        self.as_ref().delete(keys).await
    }

    #[inline]
    async fn ping(&self) -> Result<(), KvError> {
        self.as_ref().ping().await
    }
}

/// Redis rejects `PX 0`, so sub-millisecond TTLs round up.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}
