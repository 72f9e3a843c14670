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
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use tokio::sync::OnceCell;

use super::{ttl_millis, KvError, KvStore};

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            host: "localhost".into(),
            port: 6379,
            password: None,
            db: 0,
        }
    }
}

impl RedisConfig {
    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: RedisConnectionInfo {
                db: self.db,
                password: self.password.clone().filter(|p| !p.is_empty()),
                ..Default::default()
            },
        }
    }
}

/// Redis-backed store. The connection is established on first use and then
/// shared; the manager reconnects by itself after a failure.
pub struct RedisKv {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
}

impl RedisKv {
    pub fn new(config: &RedisConfig) -> Result<Self, KvError> {
        let client = redis::Client::open(config.connection_info())
            .map_err(|e| KvError::new("connect", e))?;

        Ok(RedisKv {
            client,
            conn: OnceCell::new(),
        })
    }

    async fn conn(&self) -> Result<ConnectionManager, KvError> {
        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(Duration::from_secs(5))
            .set_response_timeout(Duration::from_secs(5))
            .set_number_of_retries(2);

        self.conn
            .get_or_try_init(|| {
                ConnectionManager::new_with_config(self.client.clone(), config)
            })
            .await
            .cloned()
            .map_err(|e| KvError::new("connect", e))
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut con = self.conn().await?;
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut con)
            .await
            .map_err(|e| KvError::new("get", e))
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), KvError> {
        let mut con = self.conn().await?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut con)
            .await
            .map_err(|e| KvError::new("set", e))
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let mut con = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut con)
            .await
            .map_err(|e| KvError::new("setnx", e))?;

        Ok(reply.is_some())
    }

    async fn take(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut con = self.conn().await?;
        redis::cmd("GETDEL")
            .arg(key)
            .query_async(&mut con)
            .await
            .map_err(|e| KvError::new("getdel", e))
    }

    async fn delete(&self, keys: &[String]) -> Result<(), KvError> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut con = self.conn().await?;
        redis::cmd("DEL")
            .arg(keys)
            .query_async::<i64>(&mut con)
            .await
            .map_err(|e| KvError::new("del", e))?;

        Ok(())
    }

    async fn ping(&self) -> Result<(), KvError> {
        let mut con = self.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut con)
            .await
            .map_err(|e| KvError::new("ping", e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_password_is_dropped() {
        let config = RedisConfig {
            password: Some(String::new()),
            db: 3,
            ..Default::default()
        };
        let info = config.connection_info();
        assert_eq!(info.redis.password, None);
        assert_eq!(info.redis.db, 3);
        assert!(matches!(
            info.addr,
            ConnectionAddr::Tcp(ref host, 6379) if host == "localhost"
        ));
    }

    #[tokio::test]
    async fn unreachable_server_is_an_error() {
        let kv = RedisKv::new(&RedisConfig {
            host: "127.0.0.1".into(),
            port: 1,
            ..Default::default()
        })
        .unwrap();

        let err = kv.ping().await.unwrap_err();
        assert_eq!(err.operation, "connect");
    }
}
