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
//! Server configuration: an optional YAML file overridden by environment
//! variables.
use std::fmt;
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use sqlx::postgres::PgSslMode;
use url::Url;

use crate::app::AppConfig;
use crate::auth::oauth::OAuthConfig;
use crate::auth::oidc::OidcConfig;
use crate::db::postgres::PostgresConfig;
use crate::hyperext::{Cidr, CidrError, TrustedProxies};
use crate::kv::redis::RedisConfig;
use crate::repo::CacheTtls;
use crate::storage::s3::S3Config;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration file: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The value itself is never echoed since it may be a secret.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("{0} is required")]
    Missing(&'static str),

    #[error(transparent)]
    Cidr(#[from] CidrError),

    #[error("{key} must be an absolute URL, got `{value}`")]
    NotAbsolute { key: &'static str, value: String },
}

impl ConfigError {
    fn invalid(key: &str, reason: impl fmt::Display) -> Self {
        ConfigError::InvalidValue {
            key: key.to_owned(),
            reason: reason.to_string(),
        }
    }
}

mod duration {
    use super::*;

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(d)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub public_url: Option<String>,
    pub trust_proxy: bool,
    pub trusted_proxy_cidrs: Vec<String>,
    #[serde(with = "duration")]
    pub proxy_timeout: Duration,
    #[serde(with = "duration")]
    pub read_timeout: Duration,
    #[serde(with = "duration")]
    pub write_timeout: Duration,
    #[serde(with = "duration")]
    pub idle_timeout: Duration,
    #[serde(with = "duration")]
    pub shutdown_timeout: Duration,
    #[serde(with = "duration")]
    pub presign_ttl: Duration,
    pub direct_transfers: bool,
    pub repo_allowlist: bool,
    pub passthrough_auth: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        let app = AppConfig::default();
        ServerSection {
            host: "0.0.0.0".into(),
            port: 8080,
            public_url: None,
            trust_proxy: false,
            trusted_proxy_cidrs: Vec::new(),
            proxy_timeout: app.proxy_timeout,
            read_timeout: app.read_timeout,
            write_timeout: app.write_timeout,
            idle_timeout: Duration::from_secs(120),
            shutdown_timeout: Duration::from_secs(10),
            presign_ttl: app.presign_ttl,
            direct_transfers: app.direct_transfers,
            repo_allowlist: true,
            passthrough_auth: app.passthrough_auth,
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseSection {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub dbname: String,
    pub sslmode: String,
    pub max_connections: u32,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        let pg = PostgresConfig::default();
        DatabaseSection {
            host: pg.host,
            port: pg.port,
            user: pg.user,
            password: None,
            dbname: pg.dbname,
            sslmode: "require".into(),
            max_connections: pg.max_connections,
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedisSection {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
}

impl Default for RedisSection {
    fn default() -> Self {
        let redis = RedisConfig::default();
        RedisSection {
            host: redis.host,
            port: redis.port,
            password: None,
            db: redis.db,
        }
    }
}

#[derive(Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct S3Section {
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub bucket_name: String,
    pub region: Option<String>,

    /// Defaults to true when a custom endpoint is set.
    pub force_path_style: Option<bool>,
}

#[derive(Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSection {
    #[serde(with = "duration")]
    pub object_ttl: Duration,
    #[serde(with = "duration")]
    pub negative_ttl: Duration,
    #[serde(with = "duration")]
    pub allowlist_ttl: Duration,
}

impl Default for CacheSection {
    fn default() -> Self {
        let ttls = CacheTtls::default();
        CacheSection {
            object_ttl: ttls.object,
            negative_ttl: ttls.negative,
            allowlist_ttl: ttls.allowlist,
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OidcSection {
    pub enabled: bool,
    pub issuer: String,
    pub audience: String,
    pub jwks_url: String,
    #[serde(with = "duration")]
    pub jwks_ttl: Duration,
    #[serde(with = "duration")]
    pub jwks_grace: Duration,
    pub claims: Vec<String>,
}

impl Default for OidcSection {
    fn default() -> Self {
        let oidc = OidcConfig::default();
        OidcSection {
            enabled: true,
            issuer: oidc.issuer,
            audience: oidc.audience,
            jwks_url: oidc.jwks_url,
            jwks_ttl: oidc.jwks_ttl,
            jwks_grace: oidc.jwks_grace,
            claims: oidc.claims,
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OAuthSection {
    pub enabled: bool,
    pub client_id: String,
    pub client_secret: String,
    pub allowed_hosts: Vec<String>,
    pub allowed_redirect_uris: Vec<String>,
    #[serde(with = "duration")]
    pub session_ttl: Duration,
    pub cookie_name: String,
    pub callback_url: Option<String>,
    pub authorize_url: String,
    pub token_url: String,
    pub api_url: String,
}

impl Default for OAuthSection {
    fn default() -> Self {
        let oauth = OAuthConfig::default();
        let app = AppConfig::default();
        OAuthSection {
            enabled: false,
            client_id: String::new(),
            client_secret: String::new(),
            allowed_hosts: Vec::new(),
            allowed_redirect_uris: Vec::new(),
            session_ttl: app.session_ttl,
            cookie_name: app.cookie_name,
            callback_url: None,
            authorize_url: oauth.authorize_url,
            token_url: oauth.token_url,
            api_url: oauth.api_url,
        }
    }
}

/// Everything the server needs to start. Deliberately not `Debug`: several
/// fields hold credentials.
#[derive(Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerSection,
    pub database: DatabaseSection,
    pub redis: RedisSection,
    pub s3: S3Section,
    pub cache: CacheSection,
    pub oidc_github: OidcSection,
    pub oauth_github: OAuthSection,
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, "expected a boolean")),
    }
}

fn parse_num<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    value.trim().parse().map_err(|e| ConfigError::invalid(key, e))
}

fn parse_duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value.trim())
        .map_err(|e| ConfigError::invalid(key, e))
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn require_absolute(key: &'static str, value: &str) -> Result<(), ConfigError> {
    match Url::parse(value) {
        Ok(url) if url.has_host() => Ok(()),
        _ => Err(ConfigError::NotAbsolute {
            key,
            value: value.to_owned(),
        }),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl Config {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        // An empty document is `null`, which would not deserialize into a
        // struct.
        if text.trim().is_empty() {
            return Ok(Config::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Reads the file (if any), applies the process environment on top, and
    /// validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|source| {
                    ConfigError::Read {
                        path: path.to_owned(),
                        source,
                    }
                })?;
                Config::from_yaml(&text)?
            }
            None => Config::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides fields from environment-style `KEY=value` pairs looked up
    /// through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        macro_rules! set {
            ($key:literal, $field:expr, $parse:expr) => {
                if let Some(value) = lookup($key) {
                    $field = $parse($key, &value)?;
                }
            };
        }

        let string = |_: &str, v: &str| Ok::<_, ConfigError>(v.to_owned());
        let optional =
            |_: &str, v: &str| Ok::<_, ConfigError>(non_empty(Some(v.into())));
        let list = |_: &str, v: &str| Ok::<_, ConfigError>(parse_list(v));

        let server = &mut self.server;
        set!("SERVER_HOST", server.host, string);
        set!("SERVER_PORT", server.port, parse_num);
        set!("SERVER_PUBLIC_URL", server.public_url, optional);
        set!("SERVER_TRUST_PROXY", server.trust_proxy, parse_bool);
        set!("SERVER_TRUSTED_PROXY_CIDRS", server.trusted_proxy_cidrs, list);
        set!("SERVER_PROXY_TIMEOUT", server.proxy_timeout, parse_duration);
        set!("SERVER_READ_TIMEOUT", server.read_timeout, parse_duration);
        set!("SERVER_WRITE_TIMEOUT", server.write_timeout, parse_duration);
        set!("SERVER_IDLE_TIMEOUT", server.idle_timeout, parse_duration);
        set!(
            "SERVER_SHUTDOWN_TIMEOUT",
            server.shutdown_timeout,
            parse_duration
        );
        set!("SERVER_PRESIGN_TTL", server.presign_ttl, parse_duration);
        set!("SERVER_DIRECT_TRANSFERS", server.direct_transfers, parse_bool);
        set!("SERVER_REPO_ALLOWLIST", server.repo_allowlist, parse_bool);
        set!("SERVER_PASSTHROUGH_AUTH", server.passthrough_auth, parse_bool);

        let db = &mut self.database;
        set!("DATABASE_HOST", db.host, string);
        set!("DATABASE_PORT", db.port, parse_num);
        set!("DATABASE_USER", db.user, string);
        set!("DATABASE_PASSWORD", db.password, optional);
        set!("DATABASE_DBNAME", db.dbname, string);
        set!("DATABASE_SSLMODE", db.sslmode, string);
        set!("DATABASE_MAXCONNECTIONS", db.max_connections, parse_num);

        let redis = &mut self.redis;
        set!("REDIS_HOST", redis.host, string);
        set!("REDIS_PORT", redis.port, parse_num);
        set!("REDIS_PASSWORD", redis.password, optional);
        set!("REDIS_DB", redis.db, parse_num);

        let s3 = &mut self.s3;
        set!("S3_ENDPOINT", s3.endpoint, optional);
        set!("S3_ACCESSKEYID", s3.access_key_id, optional);
        set!("S3_SECRETACCESSKEY", s3.secret_access_key, optional);
        set!("S3_BUCKETNAME", s3.bucket_name, string);
        set!("S3_REGION", s3.region, optional);
        if let Some(value) = lookup("S3_FORCEPATHSTYLE") {
            s3.force_path_style =
                Some(parse_bool("S3_FORCEPATHSTYLE", &value)?);
        }

        let cache = &mut self.cache;
        set!("CACHE_OBJECT_TTL", cache.object_ttl, parse_duration);
        set!("CACHE_NEGATIVE_TTL", cache.negative_ttl, parse_duration);
        set!("CACHE_ALLOWLIST_TTL", cache.allowlist_ttl, parse_duration);

        let oidc = &mut self.oidc_github;
        set!("OIDC_GITHUB_ENABLED", oidc.enabled, parse_bool);
        set!("OIDC_GITHUB_ISSUER", oidc.issuer, string);
        set!("OIDC_GITHUB_AUDIENCE", oidc.audience, string);
        set!("OIDC_GITHUB_JWKSURL", oidc.jwks_url, string);
        set!("OIDC_GITHUB_JWKSTTL", oidc.jwks_ttl, parse_duration);
        set!("OIDC_GITHUB_JWKSGRACE", oidc.jwks_grace, parse_duration);
        set!("OIDC_GITHUB_CLAIMS", oidc.claims, list);

        let oauth = &mut self.oauth_github;
        set!("OAUTH_GITHUB_ENABLED", oauth.enabled, parse_bool);
        set!("OAUTH_GITHUB_CLIENTID", oauth.client_id, string);
        set!("OAUTH_GITHUB_CLIENTSECRET", oauth.client_secret, string);
        set!("OAUTH_GITHUB_ALLOWED_HOSTS", oauth.allowed_hosts, list);
        set!(
            "OAUTH_GITHUB_ALLOWED_REDIRECT_URIS",
            oauth.allowed_redirect_uris,
            list
        );
        set!("OAUTH_GITHUB_SESSIONTTL", oauth.session_ttl, parse_duration);
        set!("OAUTH_GITHUB_COOKIENAME", oauth.cookie_name, string);
        set!("OAUTH_GITHUB_CALLBACKURL", oauth.callback_url, optional);
        set!("OAUTH_GITHUB_AUTHORIZEURL", oauth.authorize_url, string);
        set!("OAUTH_GITHUB_TOKENURL", oauth.token_url, string);
        set!("OAUTH_GITHUB_APIURL", oauth.api_url, string);

        Ok(())
    }

    /// Checks that every enabled subsystem has what it needs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.s3.bucket_name.is_empty() {
            return Err(ConfigError::Missing("S3_BUCKETNAME"));
        }
        if let Some(endpoint) = &self.s3.endpoint {
            require_absolute("S3_ENDPOINT", endpoint)?;
        }
        match (&self.s3.access_key_id, &self.s3.secret_access_key) {
            (Some(_), None) => {
                return Err(ConfigError::Missing("S3_SECRETACCESSKEY"))
            }
            (None, Some(_)) => {
                return Err(ConfigError::Missing("S3_ACCESSKEYID"))
            }
            _ => {}
        }

        if self.database.host.is_empty() {
            return Err(ConfigError::Missing("DATABASE_HOST"));
        }
        if self.database.user.is_empty() {
            return Err(ConfigError::Missing("DATABASE_USER"));
        }
        if self.database.dbname.is_empty() {
            return Err(ConfigError::Missing("DATABASE_DBNAME"));
        }
        self.ssl_mode()?;

        if self.redis.host.is_empty() {
            return Err(ConfigError::Missing("REDIS_HOST"));
        }

        if let Some(url) = &self.server.public_url {
            require_absolute("SERVER_PUBLIC_URL", url)?;
        }
        self.trusted_proxies()?;

        let oidc = &self.oidc_github;
        if oidc.enabled {
            if oidc.issuer.is_empty() {
                return Err(ConfigError::Missing("OIDC_GITHUB_ISSUER"));
            }
            if oidc.audience.is_empty() {
                return Err(ConfigError::Missing("OIDC_GITHUB_AUDIENCE"));
            }
            require_absolute("OIDC_GITHUB_JWKSURL", &oidc.jwks_url)?;
        }

        let oauth = &self.oauth_github;
        if oauth.enabled {
            if oauth.client_id.is_empty() {
                return Err(ConfigError::Missing("OAUTH_GITHUB_CLIENTID"));
            }
            if oauth.client_secret.is_empty() {
                return Err(ConfigError::Missing("OAUTH_GITHUB_CLIENTSECRET"));
            }
            if oauth.allowed_redirect_uris.is_empty() {
                return Err(ConfigError::Missing(
                    "OAUTH_GITHUB_ALLOWED_REDIRECT_URIS",
                ));
            }
            for uri in &oauth.allowed_redirect_uris {
                require_absolute("OAUTH_GITHUB_ALLOWED_REDIRECT_URIS", uri)?;
            }
            if let Some(url) = &oauth.callback_url {
                require_absolute("OAUTH_GITHUB_CALLBACKURL", url)?;
            }
            require_absolute(
                "OAUTH_GITHUB_AUTHORIZEURL",
                &oauth.authorize_url,
            )?;
            require_absolute("OAUTH_GITHUB_TOKENURL", &oauth.token_url)?;
            require_absolute("OAUTH_GITHUB_APIURL", &oauth.api_url)?;
            if oauth.cookie_name.is_empty() {
                return Err(ConfigError::Missing("OAUTH_GITHUB_COOKIENAME"));
            }
        }

        Ok(())
    }

    /// Resolves `SERVER_HOST`, which may be a name, to a socket address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let host = self.server.host.trim_matches(&['[', ']'][..]);
        (host, self.server.port)
            .to_socket_addrs()
            .map_err(|e| ConfigError::invalid("SERVER_HOST", e))?
            .next()
            .ok_or_else(|| {
                ConfigError::invalid("SERVER_HOST", "resolved to no addresses")
            })
    }

    fn ssl_mode(&self) -> Result<PgSslMode, ConfigError> {
        self.database
            .sslmode
            .parse()
            .map_err(|e| ConfigError::invalid("DATABASE_SSLMODE", e))
    }

    pub fn trusted_proxies(&self) -> Result<TrustedProxies, ConfigError> {
        let cidrs = self
            .server
            .trusted_proxy_cidrs
            .iter()
            .map(|c| c.parse::<Cidr>())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TrustedProxies::new(self.server.trust_proxy, cidrs))
    }

    pub fn postgres(&self) -> Result<PostgresConfig, ConfigError> {
        let db = &self.database;
        Ok(PostgresConfig {
            host: db.host.clone(),
            port: db.port,
            user: db.user.clone(),
            password: non_empty(db.password.clone()),
            dbname: db.dbname.clone(),
            ssl_mode: self.ssl_mode()?,
            max_connections: db.max_connections,
        })
    }

    pub fn redis(&self) -> RedisConfig {
        RedisConfig {
            host: self.redis.host.clone(),
            port: self.redis.port,
            password: non_empty(self.redis.password.clone()),
            db: self.redis.db,
        }
    }

    pub fn s3(&self) -> S3Config {
        let s3 = &self.s3;
        S3Config {
            bucket: s3.bucket_name.clone(),
            region: s3.region.clone(),
            endpoint: s3.endpoint.clone(),
            access_key_id: s3.access_key_id.clone(),
            secret_access_key: s3.secret_access_key.clone(),
            force_path_style: s3
                .force_path_style
                .unwrap_or(s3.endpoint.is_some()),
        }
    }

    pub fn cache_ttls(&self) -> CacheTtls {
        CacheTtls::new(
            self.cache.object_ttl,
            self.cache.negative_ttl,
            self.cache.allowlist_ttl,
        )
    }

    /// `None` when OIDC is switched off.
    pub fn oidc(&self) -> Option<OidcConfig> {
        let oidc = &self.oidc_github;
        oidc.enabled.then(|| OidcConfig {
            issuer: oidc.issuer.clone(),
            audience: oidc.audience.clone(),
            jwks_url: oidc.jwks_url.clone(),
            jwks_ttl: oidc.jwks_ttl,
            jwks_grace: oidc.jwks_grace,
            claims: oidc.claims.clone(),
            ..OidcConfig::default()
        })
    }

    /// `None` when the browser flow is switched off.
    pub fn oauth(&self) -> Option<OAuthConfig> {
        let oauth = &self.oauth_github;
        oauth.enabled.then(|| OAuthConfig {
            client_id: oauth.client_id.clone(),
            client_secret: oauth.client_secret.clone(),
            authorize_url: oauth.authorize_url.clone(),
            token_url: oauth.token_url.clone(),
            api_url: oauth.api_url.clone(),
            callback_url: oauth.callback_url.clone(),
            allowed_hosts: oauth.allowed_hosts.clone(),
            allowed_redirect_uris: oauth.allowed_redirect_uris.clone(),
            ..OAuthConfig::default()
        })
    }

    pub fn app(&self) -> AppConfig {
        let server = &self.server;
        AppConfig {
            public_url: server.public_url.clone(),
            proxy_timeout: server.proxy_timeout,
            read_timeout: server.read_timeout,
            write_timeout: server.write_timeout,
            direct_transfers: server.direct_transfers,
            presign_ttl: server.presign_ttl,
            passthrough_auth: server.passthrough_auth,
            cookie_name: self.oauth_github.cookie_name.clone(),
            session_ttl: self.oauth_github.session_ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn minimal() -> Config {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("S3_BUCKETNAME", "lfs"),
                ("OIDC_GITHUB_AUDIENCE", "https://github.com/acme"),
            ]))
            .unwrap();
        config
    }

    #[test]
    fn defaults() {
        let config = minimal();
        config.validate().unwrap();

        assert_eq!(config.listen_addr().unwrap().to_string(), "0.0.0.0:8080");
        assert_eq!(config.server.proxy_timeout, Duration::from_secs(600));
        assert_eq!(config.server.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(config.database.sslmode, "require");
        assert!(config.oidc().is_some());
        assert!(config.oauth().is_none());
        assert!(!config.s3().force_path_style);
        assert_eq!(config.cache_ttls(), CacheTtls::default());
    }

    #[test]
    fn yaml_then_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "server:\n  port: 9000\n  proxy_timeout: 2m\n\
             s3:\n  bucket_name: from-yaml\n  endpoint: http://minio:9000\n\
             oidc_github:\n  audience: aud\n\
             cache:\n  negative_ttl: 5m"
        )
        .unwrap();

        let text = fs::read_to_string(file.path()).unwrap();
        let mut config = Config::from_yaml(&text).unwrap();
        config
            .apply_env(env(&[
                ("SERVER_PORT", "9100"),
                ("REDIS_DB", "3"),
                ("OIDC_GITHUB_CLAIMS", "repository, actor"),
            ]))
            .unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.proxy_timeout, Duration::from_secs(120));
        assert_eq!(config.s3.bucket_name, "from-yaml");
        assert!(config.s3().force_path_style);
        assert_eq!(config.redis().db, 3);
        assert_eq!(
            config.oidc().unwrap().claims,
            vec!["repository".to_owned(), "actor".to_owned()]
        );

        // Tombstones are clamped.
        assert_eq!(config.cache_ttls().negative, Duration::from_secs(60));
    }

    #[test]
    fn unknown_yaml_keys_rejected() {
        assert!(matches!(
            Config::from_yaml("server:\n  prot: 1\n"),
            Err(ConfigError::Parse(_))
        ));
        assert!(Config::from_yaml("").is_ok());
    }

    #[test]
    fn bad_values_do_not_echo_secrets() {
        let mut config = minimal();
        let err = config
            .apply_env(env(&[("REDIS_PORT", "hunter2")]))
            .err()
            .unwrap();
        assert!(err.to_string().contains("REDIS_PORT"));
        assert!(!err.to_string().contains("hunter2"));

        assert!(config
            .apply_env(env(&[("SERVER_PROXY_TIMEOUT", "soon")]))
            .is_err());
        assert!(config
            .apply_env(env(&[("SERVER_DIRECT_TRANSFERS", "maybe")]))
            .is_err());
    }

    #[test]
    fn required_fields() {
        let config = Config::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("S3_BUCKETNAME"))
        ));

        let mut config = minimal();
        config
            .apply_env(env(&[("OIDC_GITHUB_AUDIENCE", "")]))
            .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("OIDC_GITHUB_AUDIENCE"))
        ));

        let mut config = minimal();
        config
            .apply_env(env(&[("OIDC_GITHUB_ENABLED", "false")]))
            .unwrap();
        config.validate().unwrap();
        assert!(config.oidc().is_none());
    }

    #[test]
    fn oauth_needs_absolute_redirects() {
        let mut config = minimal();
        config
            .apply_env(env(&[
                ("OAUTH_GITHUB_ENABLED", "true"),
                ("OAUTH_GITHUB_CLIENTID", "id"),
                ("OAUTH_GITHUB_CLIENTSECRET", "secret"),
                ("OAUTH_GITHUB_ALLOWED_REDIRECT_URIS", "/relative"),
            ]))
            .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotAbsolute { .. })
        ));

        config
            .apply_env(env(&[(
                "OAUTH_GITHUB_ALLOWED_REDIRECT_URIS",
                "https://app.example.com/done,https://localhost:3000/",
            )]))
            .unwrap();
        config.validate().unwrap();

        let oauth = config.oauth().unwrap();
        assert_eq!(oauth.allowed_redirect_uris.len(), 2);
        assert_eq!(config.app().cookie_name, "lfs_session");
    }

    #[test]
    fn cidrs_must_parse() {
        let mut config = minimal();
        config
            .apply_env(env(&[
                ("SERVER_TRUST_PROXY", "true"),
                ("SERVER_TRUSTED_PROXY_CIDRS", "10.0.0.0/8, nope"),
            ]))
            .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Cidr(_))));

        config
            .apply_env(env(&[("SERVER_TRUSTED_PROXY_CIDRS", "10.0.0.0/8")]))
            .unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn bad_sslmode() {
        let mut config = minimal();
        config
            .apply_env(env(&[("DATABASE_SSLMODE", "sometimes")]))
            .unwrap();
        assert!(config.validate().is_err());

        config
            .apply_env(env(&[("DATABASE_SSLMODE", "disable")]))
            .unwrap();
        assert!(matches!(
            config.postgres().unwrap().ssl_mode,
            PgSslMode::Disable
        ));
    }
}
