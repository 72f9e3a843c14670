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
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{stream, TryStreamExt};
use parking_lot::RwLock;

use super::{
    ObjectStorage, ObjectStream, StorageError, StorageKey, StorageOp,
    StoredObject,
};

/// Keeps objects in memory. Used by the test suite and for trying the server
/// out without a bucket.
#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<HashMap<StorageKey, Bytes>>,
    offline: AtomicBool,
    puts: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail as if the store were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &StorageKey) -> bool {
        self.objects.read().contains_key(key)
    }

    fn check(&self, op: StorageOp) -> Result<(), StorageError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StorageError::new(op, "connection refused"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn put(
        &self,
        key: &StorageKey,
        stream: ObjectStream,
        len: u64,
    ) -> Result<(), StorageError> {
        self.check(StorageOp::Put)?;

        let buf = stream
            .try_fold(BytesMut::new(), |mut buf, chunk| async move {
                buf.extend_from_slice(&chunk);
                Ok(buf)
            })
            .await
            .map_err(|e| StorageError::new(StorageOp::Put, e))?;

        if buf.len() as u64 != len {
            return Err(StorageError::new(
                StorageOp::Put,
                format!("expected {} bytes, got {}", len, buf.len()),
            ));
        }

        self.objects.write().insert(key.clone(), buf.freeze());
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(
        &self,
        key: &StorageKey,
    ) -> Result<Option<StoredObject>, StorageError> {
        self.check(StorageOp::Get)?;

        Ok(self.objects.read().get(key).cloned().map(|bytes| {
            // Hand the body out in small chunks so readers see a real stream.
            let chunks = bytes
                .chunks(4096)
                .map(|c| Ok::<_, io::Error>(bytes.slice_ref(c)))
                .collect::<Vec<_>>();
            StoredObject {
                len: bytes.len() as u64,
                stream: Box::pin(stream::iter(chunks)),
            }
        }))
    }

    async fn size(
        &self,
        key: &StorageKey,
    ) -> Result<Option<u64>, StorageError> {
        self.check(StorageOp::Head)?;
        Ok(self.objects.read().get(key).map(|b| b.len() as u64))
    }

    async fn delete(&self, key: &StorageKey) -> Result<(), StorageError> {
        self.check(StorageOp::Delete)?;
        self.objects.write().remove(key);
        Ok(())
    }

    async fn head_bucket(&self) -> Result<(), StorageError> {
        self.check(StorageOp::HeadBucket)
    }

    async fn presign_put(
        &self,
        key: &StorageKey,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        self.check(StorageOp::Presign)?;
        Ok(format!("memory:///{}?op=put&expires={}", key, ttl.as_secs()))
    }

    async fn presign_get(
        &self,
        key: &StorageKey,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        self.check(StorageOp::Presign)?;
        Ok(format!("memory:///{}?op=get&expires={}", key, ttl.as_secs()))
    }
}
