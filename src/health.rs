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
//! Liveness and readiness endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use derive_more::Display;
use http::{header, Response, StatusCode};
use serde::Serialize;
use tracing::{event, Level};

use crate::db::MetadataRepo;
use crate::error::Error;
use crate::kv::KvStore;
use crate::storage::ObjectStorage;
use crate::util::{full, into_json, BoxBody};

/// Each dependency gets this long to answer a readiness probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[display("ok")]
    Ok,
    #[display("unhealthy")]
    Unhealthy,
}

/// Per-dependency readiness, keyed by `postgres`, `redis` and `s3`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Readiness(pub BTreeMap<&'static str, Status>);

impl Readiness {
    pub fn is_ready(&self) -> bool {
        self.0.values().all(|s| *s == Status::Ok)
    }
}

pub struct Health {
    db: Arc<dyn MetadataRepo>,
    kv: Arc<dyn KvStore>,
    storage: Arc<dyn ObjectStorage>,
}

async fn probe<F, E>(name: &'static str, check: F) -> Status
where
    F: std::future::Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    match tokio::time::timeout(PROBE_TIMEOUT, check).await {
        Ok(Ok(())) => Status::Ok,
        Ok(Err(err)) => {
            event!(
                Level::WARN,
                dependency = name,
                error = %err,
                "readiness probe failed"
            );
            Status::Unhealthy
        }
        Err(_) => {
            event!(Level::WARN, dependency = name, "readiness probe timed out");
            Status::Unhealthy
        }
    }
}

impl Health {
    pub fn new(
        db: Arc<dyn MetadataRepo>,
        kv: Arc<dyn KvStore>,
        storage: Arc<dyn ObjectStorage>,
    ) -> Self {
        Health { db, kv, storage }
    }

    /// Probes every dependency concurrently.
    pub async fn readiness(&self) -> Readiness {
        let (postgres, redis, s3) = futures::join!(
            probe("postgres", self.db.ping()),
            probe("redis", self.kv.ping()),
            probe("s3", self.storage.head_bucket()),
        );

        Readiness(
            [("postgres", postgres), ("redis", redis), ("s3", s3)]
                .into_iter()
                .collect(),
        )
    }

    /// `GET /healthz`: the process is up.
    pub fn healthz() -> Result<Response<BoxBody>, Error> {
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(full("ok"))?)
    }

    /// `GET /readyz`: every dependency answers.
    pub async fn readyz(&self) -> Result<Response<BoxBody>, Error> {
        let readiness = self.readiness().await;
        let status = if readiness.is_ready() {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };

        Ok(Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(full(into_json(&readiness)?))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDb;
    use crate::kv::MemoryKv;
    use crate::storage::MemoryStorage;
    use http_body_util::BodyExt;

    fn health() -> (Health, Arc<MemoryDb>, Arc<MemoryKv>, Arc<MemoryStorage>) {
        let db = Arc::new(MemoryDb::new());
        let kv = Arc::new(MemoryKv::new());
        let storage = Arc::new(MemoryStorage::new());
        (
            Health::new(db.clone(), kv.clone(), storage.clone()),
            db,
            kv,
            storage,
        )
    }

    #[tokio::test]
    async fn all_ok() {
        let (health, ..) = health();
        let resp = health.readyz().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn redis_down() {
        let (health, _, kv, _) = health();
        kv.set_offline(true);

        let resp = health.readyz().await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "redis": "unhealthy",
                "postgres": "ok",
                "s3": "ok",
            })
        );

        let resp = Health::healthz().unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn storage_down() {
        let (health, _, _, storage) = health();
        storage.set_offline(true);
        let readiness = health.readiness().await;
        assert_eq!(readiness.0["s3"], Status::Unhealthy);
        assert!(!readiness.is_ready());
    }
}
