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
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{LfsObject, MetadataError, MetadataRepo, PolicyRepo};
use crate::access::AccessPolicy;
use crate::lfs::Oid;

type ObjectKey = (String, String, String);

/// In-memory metadata store with the same conflict rules as the SQL one.
#[derive(Default)]
pub struct MemoryDb {
    objects: RwLock<HashMap<ObjectKey, LfsObject>>,
    allowlist: RwLock<HashSet<(String, String)>>,
    policies: RwLock<Vec<AccessPolicy>>,
    offline: AtomicBool,
    object_queries: AtomicUsize,
    latency: RwLock<Option<Duration>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&self, owner: &str, repo: &str) {
        self.allowlist
            .write()
            .insert((owner.to_owned(), repo.to_owned()));
    }

    pub fn add_policy(&self, policy: AccessPolicy) {
        self.policies.write().push(policy);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delays every query, to widen race windows in tests.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Number of `get_object` queries that reached this store.
    pub fn object_queries(&self) -> usize {
        self.object_queries.load(Ordering::SeqCst)
    }

    async fn check(&self) -> Result<(), MetadataError> {
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.offline.load(Ordering::SeqCst) {
            Err(MetadataError::Database("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

fn object_key(owner: &str, repo: &str, oid: &str) -> ObjectKey {
    (owner.to_owned(), repo.to_owned(), oid.to_owned())
}

#[async_trait]
impl MetadataRepo for MemoryDb {
    async fn get_object(
        &self,
        owner: &str,
        repo: &str,
        oid: &Oid,
    ) -> Result<Option<LfsObject>, MetadataError> {
        self.object_queries.fetch_add(1, Ordering::SeqCst);
        self.check().await?;

        Ok(self
            .objects
            .read()
            .get(&object_key(owner, repo, oid.as_str()))
            .cloned())
    }

    async fn upsert_object(
        &self,
        object: &LfsObject,
    ) -> Result<LfsObject, MetadataError> {
        self.check().await?;

        let mut objects = self.objects.write();
        let key = object_key(&object.owner, &object.repo, object.oid.as_str());

        match objects.get(&key) {
            Some(stored) if stored.size != object.size => {
                Err(MetadataError::SizeConflict {
                    stored: stored.size,
                    requested: object.size,
                })
            }
            Some(stored) => Ok(stored.clone()),
            None => {
                objects.insert(key, object.clone());
                Ok(object.clone())
            }
        }
    }

    async fn is_allowed(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<bool, MetadataError> {
        self.check().await?;
        Ok(self
            .allowlist
            .read()
            .contains(&(owner.to_owned(), repo.to_owned())))
    }

    async fn ping(&self) -> Result<(), MetadataError> {
        self.check().await
    }
}

#[async_trait]
impl PolicyRepo for MemoryDb {
    async fn policies_for_issuer(
        &self,
        issuer: &str,
    ) -> Result<Vec<AccessPolicy>, MetadataError> {
        self.check().await?;
        Ok(self
            .policies
            .read()
            .iter()
            .filter(|p| p.issuer == issuer)
            .cloned()
            .collect())
    }
}
