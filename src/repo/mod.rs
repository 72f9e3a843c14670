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
//! Read-through, write-invalidate cache in front of the metadata store.

pub mod keys;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{event, Level};

use crate::db::{LfsObject, MetadataError, MetadataRepo};
use crate::kv::KvStore;
use crate::lfs::Oid;
use crate::singleflight::Group;

/// Number of write epoch slots. Keys share a slot by hash.
const EPOCH_SLOTS: usize = 1024;

/// Tombstones never live longer than this.
pub const MAX_NEGATIVE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    pub object: Duration,
    pub negative: Duration,
    pub allowlist: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        CacheTtls {
            object: Duration::from_secs(5 * 60),
            negative: MAX_NEGATIVE_TTL,
            allowlist: Duration::from_secs(60),
        }
    }
}

impl CacheTtls {
    pub fn new(
        object: Duration,
        negative: Duration,
        allowlist: Duration,
    ) -> Self {
        CacheTtls {
            object,
            negative: negative.min(MAX_NEGATIVE_TTL),
            allowlist,
        }
    }
}

/// What sits in the cache. The timestamp is checked on every read so an
/// entry is never served past its TTL, whatever the store's own expiry does.
#[derive(Serialize, Deserialize)]
struct Cached<T> {
    stored_at: i64,
    value: T,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Write counters for object keys. A cache fill only lands if no write to
/// its key happened while the database read was in flight.
struct Epochs {
    slots: Box<[AtomicU64]>,
}

impl Epochs {
    fn new() -> Self {
        Epochs {
            slots: (0..EPOCH_SLOTS).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn slot(&self, key: &str) -> &AtomicU64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.slots[hasher.finish() as usize % self.slots.len()]
    }

    fn current(&self, key: &str) -> u64 {
        self.slot(key).load(Ordering::SeqCst)
    }

    fn bump(&self, key: &str) {
        self.slot(key).fetch_add(1, Ordering::SeqCst);
    }
}

pub struct CachingRepository {
    db: Arc<dyn MetadataRepo>,
    kv: Arc<dyn KvStore>,
    ttls: CacheTtls,
    epochs: Arc<Epochs>,
    objects: Group<String, Option<LfsObject>, MetadataError>,
    allowlist: Group<String, bool, MetadataError>,
}

impl CachingRepository {
    pub fn new(
        db: Arc<dyn MetadataRepo>,
        kv: Arc<dyn KvStore>,
        ttls: CacheTtls,
    ) -> Self {
        CachingRepository {
            db,
            kv,
            ttls,
            epochs: Arc::new(Epochs::new()),
            objects: Group::new(),
            allowlist: Group::new(),
        }
    }

    pub async fn exists(
        &self,
        owner: &str,
        repo: &str,
        oid: &Oid,
    ) -> Result<bool, MetadataError> {
        Ok(self.get_object(owner, repo, oid).await?.is_some())
    }

    /// Reads a fresh cache entry. Any cache failure is a miss.
    async fn read<T: DeserializeOwned>(
        kv: &dyn KvStore,
        key: &str,
        ttl: Duration,
    ) -> Option<T> {
        let raw = match kv.get(key).await {
            Ok(raw) => raw?,
            Err(err) => {
                event!(Level::WARN, key, error = %err, "cache read failed");
                return None;
            }
        };

        let cached: Cached<T> = match serde_json::from_str(&raw) {
            Ok(cached) => cached,
            Err(err) => {
                event!(
                    Level::WARN,
                    key,
                    error = %err,
                    "discarding bad cache entry"
                );
                return None;
            }
        };

        let age = now_millis() - cached.stored_at;
        if age < 0 || age as u128 >= ttl.as_millis() {
            return None;
        }

        Some(cached.value)
    }

    async fn write<T: Serialize>(
        kv: &dyn KvStore,
        key: &str,
        value: T,
        ttl: Duration,
    ) {
        let cached = Cached {
            stored_at: now_millis(),
            value,
        };

        let res = match serde_json::to_string(&cached) {
            Ok(raw) => kv.set(key, &raw, ttl).await,
            Err(err) => {
                event!(Level::WARN, key, error = %err, "cache encode failed");
                return;
            }
        };

        if let Err(err) = res {
            event!(Level::WARN, key, error = %err, "cache write failed");
        }
    }
}

#[async_trait]
impl MetadataRepo for CachingRepository {
    async fn get_object(
        &self,
        owner: &str,
        repo: &str,
        oid: &Oid,
    ) -> Result<Option<LfsObject>, MetadataError> {
        let key = keys::object(owner, repo, oid);
        let missing = keys::missing(owner, repo, oid);

        let kv = self.kv.as_ref();
        if let Some(obj) =
            Self::read::<LfsObject>(kv, &key, self.ttls.object).await
        {
            return Ok(Some(obj));
        }

        if Self::read::<()>(kv, &missing, self.ttls.negative)
            .await
            .is_some()
        {
            return Ok(None);
        }

        let db = self.db.clone();
        let kv = self.kv.clone();
        let ttls = self.ttls;
        let epochs = self.epochs.clone();
        let (owner, repo, oid) =
            (owner.to_owned(), repo.to_owned(), oid.clone());

        self.objects
            .run(key.clone(), move || async move {
                let epoch = epochs.current(&key);
                let found = db.get_object(&owner, &repo, &oid).await?;

                // A write landed while we were reading; what we saw may
                // predate it.
                if epochs.current(&key) != epoch {
                    return Ok(found);
                }

                let kv = kv.as_ref();
                let filled = match &found {
                    Some(obj) => {
                        Self::write(kv, &key, obj, ttls.object).await;
                        &key
                    }
                    None => {
                        Self::write(kv, &missing, (), ttls.negative).await;
                        &missing
                    }
                };

                // An invalidation may have slipped in between the check and
                // the fill. Take the fill back out.
                if epochs.current(&key) != epoch {
                    if let Err(err) = kv.delete(&[filled.clone()]).await {
                        event!(
                            Level::WARN,
                            key = %filled,
                            error = %err,
                            "cache fill rollback failed"
                        );
                    }
                }

                Ok(found)
            })
            .await
    }

    async fn upsert_object(
        &self,
        object: &LfsObject,
    ) -> Result<LfsObject, MetadataError> {
        let stored = self.db.upsert_object(object).await?;

        let key = keys::object(&object.owner, &object.repo, &object.oid);

        // Fills already in flight must not land, and readers arriving after
        // this returns must not join them.
        self.epochs.bump(&key);
        self.objects.forget(&key);

        let stale = [
            key,
            keys::missing(&object.owner, &object.repo, &object.oid),
        ];
        if let Err(err) = self.kv.delete(&stale).await {
            // The row is committed; the TTL bounds how long a stale entry
            // can be served.
            event!(
                Level::WARN,
                owner = %object.owner,
                repo = %object.repo,
                oid = %object.oid,
                error = %err,
                "cache invalidation failed"
            );
        }

        Ok(stored)
    }

    async fn is_allowed(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<bool, MetadataError> {
        let key = keys::allow(owner, repo);

        let kv = self.kv.as_ref();
        if let Some(allowed) =
            Self::read::<bool>(kv, &key, self.ttls.allowlist).await
        {
            return Ok(allowed);
        }

        let db = self.db.clone();
        let kv = self.kv.clone();
        let ttl = self.ttls.allowlist;
        let (owner, repo) = (owner.to_owned(), repo.to_owned());

        self.allowlist
            .run(key.clone(), move || async move {
                let allowed = db.is_allowed(&owner, &repo).await?;
                Self::write(kv.as_ref(), &key, allowed, ttl).await;
                Ok(allowed)
            })
            .await
    }

    async fn ping(&self) -> Result<(), MetadataError> {
        self.db.ping().await
    }
}
