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
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{FromRow, PgPool};

use super::{LfsObject, MetadataError, MetadataRepo, PolicyRepo};
use crate::access::{AccessPolicy, Permission, SubjectSelector};
use crate::lfs::Oid;

const SCHEMA: &str = include_str!("schema.sql");

/// PostgreSQL error code for `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub dbname: String,
    pub ssl_mode: PgSslMode,
    pub max_connections: u32,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        PostgresConfig {
            host: "localhost".into(),
            port: 5432,
            user: "postgres".into(),
            password: None,
            dbname: "lfs".into(),
            ssl_mode: PgSslMode::Require,
            max_connections: 10,
        }
    }
}

#[derive(FromRow)]
struct ObjectRow {
    owner: String,
    repo: String,
    oid: String,
    algo: String,
    size: i64,
    storage_key: String,
}

impl TryFrom<ObjectRow> for LfsObject {
    type Error = MetadataError;

    fn try_from(row: ObjectRow) -> Result<Self, Self::Error> {
        let corrupt = |what: &str| {
            MetadataError::Corrupt(format!(
                "{} for {}/{}:{}",
                what, row.owner, row.repo, row.oid
            ))
        };

        Ok(LfsObject {
            oid: row.oid.parse().map_err(|_| corrupt("bad oid"))?,
            algo: row.algo.parse().map_err(|_| corrupt("bad algo"))?,
            size: u64::try_from(row.size)
                .map_err(|_| corrupt("negative size"))?,
            owner: row.owner,
            repo: row.repo,
            storage_key: row.storage_key,
        })
    }
}

#[derive(FromRow)]
struct PolicyRow {
    issuer: String,
    subject: Option<String>,
    claim_name: Option<String>,
    claim_value: Option<String>,
    repo_pattern: String,
    actions: Vec<String>,
}

impl PolicyRow {
    fn into_policy(self) -> Option<AccessPolicy> {
        let selector = match (self.subject, self.claim_name, self.claim_value) {
            (Some(subject), _, _) => SubjectSelector::Subject(subject),
            (None, Some(name), Some(value)) => {
                SubjectSelector::Claim { name, value }
            }
            _ => return None,
        };

        let actions = self
            .actions
            .iter()
            .filter_map(|a| match a.parse::<Permission>() {
                Ok(p) => Some(p),
                Err(_) => {
                    tracing::warn!(
                        action = %a,
                        "ignoring unknown policy action"
                    );
                    None
                }
            })
            .collect();

        Some(AccessPolicy {
            issuer: self.issuer,
            selector,
            repo_pattern: self.repo_pattern,
            actions,
        })
    }
}

/// Splits the schema into single statements, since a prepared statement may
/// only hold one.
fn schema_statements(schema: &str) -> impl Iterator<Item = &str> {
    schema.split(';').map(str::trim).filter(|stmt| {
        stmt.lines().any(|line| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with("--")
        })
    })
}

pub struct PostgresDb {
    pool: PgPool,
}

impl PostgresDb {
    /// Creates the pool. Connections are opened on first use so the server
    /// can start while the database is still coming up.
    pub fn new(config: &PostgresConfig) -> Self {
        let mut opts = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .database(&config.dbname)
            .ssl_mode(config.ssl_mode);

        if let Some(password) = &config.password {
            opts = opts.password(password);
        }

        tracing::info!(
            host = %config.host,
            port = config.port,
            database = %config.dbname,
            ssl_mode = ?config.ssl_mode,
            "configured PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy_with(opts);

        PostgresDb { pool }
    }

    pub async fn migrate(&self) -> Result<(), MetadataError> {
        for statement in schema_statements(SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn fetch_object(
        &self,
        owner: &str,
        repo: &str,
        oid: &str,
    ) -> Result<Option<LfsObject>, MetadataError> {
        let row = sqlx::query_as::<_, ObjectRow>(
            "SELECT owner, repo, oid, algo, size, storage_key FROM lfs_objects \
             WHERE owner = $1 AND repo = $2 AND oid = $3",
        )
        .bind(owner)
        .bind(repo)
        .bind(oid)
        .fetch_optional(&self.pool)
        .await?;

        row.map(LfsObject::try_from).transpose()
    }
}

#[async_trait]
impl MetadataRepo for PostgresDb {
    async fn get_object(
        &self,
        owner: &str,
        repo: &str,
        oid: &Oid,
    ) -> Result<Option<LfsObject>, MetadataError> {
        self.fetch_object(owner, repo, oid.as_str()).await
    }

    async fn upsert_object(
        &self,
        object: &LfsObject,
    ) -> Result<LfsObject, MetadataError> {
        let size = i64::try_from(object.size).map_err(|_| {
            MetadataError::Corrupt(format!("size {} out of range", object.size))
        })?;

        let res = sqlx::query(
            "INSERT INTO lfs_objects \
             (owner, repo, oid, algo, size, storage_key) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&object.owner)
        .bind(&object.repo)
        .bind(object.oid.as_str())
        .bind(object.algo.as_str())
        .bind(size)
        .bind(&object.storage_key)
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => Ok(object.clone()),
            Err(sqlx::Error::Database(db_err))
                if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) =>
            {
                // Lost the race to a concurrent writer. Same size means the
                // same object; anything else is a conflict.
                let oid = object.oid.as_str();
                let stored = self
                    .fetch_object(&object.owner, &object.repo, oid)
                    .await?
                    .ok_or_else(|| {
                        MetadataError::Database(
                            "row vanished after unique violation".into(),
                        )
                    })?;

                if stored.size == object.size {
                    Ok(stored)
                } else {
                    Err(MetadataError::SizeConflict {
                        stored: stored.size,
                        requested: object.size,
                    })
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn is_allowed(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<bool, MetadataError> {
        let enabled: Option<bool> = sqlx::query_scalar(
            "SELECT enabled FROM repository_allowlist \
             WHERE owner = $1 AND repo = $2",
        )
        .bind(owner)
        .bind(repo)
        .fetch_optional(&self.pool)
        .await?;

        Ok(enabled.unwrap_or(false))
    }

    async fn ping(&self) -> Result<(), MetadataError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl PolicyRepo for PostgresDb {
    async fn policies_for_issuer(
        &self,
        issuer: &str,
    ) -> Result<Vec<AccessPolicy>, MetadataError> {
        let rows = sqlx::query_as::<_, PolicyRow>(
            "SELECT issuer, subject, claim_name, claim_value, \
             repo_pattern, actions \
             FROM access_policies WHERE issuer = $1 ORDER BY id",
        )
        .bind(issuer)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(PolicyRow::into_policy).collect())
    }
}
