//! Redis adapter for the remote tier
//!
//! Connection parameters come from the environment (see [`RedisConfig`]).
//! The cache lives in its own logical database, offset from the base index
//! so cache, session and pub-sub data never share a keyspace.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::remote::{KeyTtl, RemoteMemoryInfo, RemoteStore};
use crate::error::{Error, Result};

/// Keys fetched per SCAN round trip
const SCAN_COUNT: usize = 500;

// =============================================================================
// Configuration
// =============================================================================

/// Logical keyspace within one Redis server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteNamespace {
    /// Base database
    Primary,
    /// Cached results, usage records, alerts
    Cache,
    /// User sessions
    Session,
    /// Pub-sub channels
    PubSub,
}

impl RemoteNamespace {
    /// Offset added to the base database index
    pub fn db_offset(&self) -> i64 {
        match self {
            RemoteNamespace::Primary => 0,
            RemoteNamespace::Cache => 1,
            RemoteNamespace::Session => 2,
            RemoteNamespace::PubSub => 3,
        }
    }
}

/// Redis connection settings
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// Base database index
    pub db: i64,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            db: 0,
            connect_timeout: Duration::from_millis(10_000),
            command_timeout: Duration::from_millis(3_000),
        }
    }
}

impl RedisConfig {
    /// Database index used for a namespace
    pub fn database_for(&self, namespace: RemoteNamespace) -> i64 {
        self.db + namespace.db_offset()
    }

    /// Connection URL for a namespace
    pub fn url(&self, namespace: RemoteNamespace) -> String {
        let auth = match &self.password {
            Some(p) if !p.is_empty() => format!(":{}@", p),
            _ => String::new(),
        };
        format!(
            "redis://{}{}:{}/{}",
            auth,
            self.host,
            self.port,
            self.database_for(namespace)
        )
    }

    /// URL with the password masked, for logs
    pub fn redacted_url(&self, namespace: RemoteNamespace) -> String {
        let mut masked = self.clone();
        if masked.password.as_deref().is_some_and(|p| !p.is_empty()) {
            masked.password = Some("***".into());
        }
        masked.url(namespace)
    }
}

// =============================================================================
// Redis Store
// =============================================================================

/// [`RemoteStore`] backed by a Redis server
pub struct RedisRemoteStore {
    client: redis::Client,
    config: RedisConfig,
    conn: Mutex<Option<redis::aio::MultiplexedConnection>>,
}

impl RedisRemoteStore {
    /// Store for the given namespace; the connection is made on first use
    pub fn open(config: RedisConfig, namespace: RemoteNamespace) -> Result<Self> {
        let client = redis::Client::open(config.url(namespace))
            .map_err(|e| Error::Config(format!("invalid redis settings: {}", e)))?;
        Ok(Self {
            client,
            config,
            conn: Mutex::new(None),
        })
    }

    /// Connect to the given namespace and verify with PING
    pub async fn connect(config: RedisConfig, namespace: RemoteNamespace) -> Result<Self> {
        let store = Self::open(config, namespace)?;
        store.ping().await?;
        info!(
            "Redis remote tier connected to {}",
            store.config.redacted_url(namespace)
        );
        Ok(store)
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = tokio::time::timeout(
            self.config.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| Error::RemoteTimeout {
            operation: "CONNECT".into(),
            timeout_ms: self.config.connect_timeout.as_millis() as u64,
        })??;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Drop the cached connection after an I/O failure so the next call reconnects
    async fn on_error(&self, e: &redis::RedisError) {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            warn!("Redis connection lost: {}", e);
            *self.conn.lock().await = None;
        }
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T> {
        let mut conn = self.conn().await?;
        match cmd.query_async(&mut conn).await {
            Ok(v) => Ok(v),
            Err(e) => {
                self.on_error(&e).await;
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl RemoteStore for RedisRemoteStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let value: Option<Vec<u8>> = self.query(redis::cmd("GET").arg(key)).await?;
        Ok(value.map(Bytes::from))
    }

    async fn get_range(&self, key: &str, start: usize, end: usize) -> Result<Option<Bytes>> {
        let value: Vec<u8> = self
            .query(redis::cmd("GETRANGE").arg(key).arg(start).arg(end))
            .await?;
        // GETRANGE returns "" for a missing key
        if value.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Bytes::from(value)))
        }
    }

    async fn set_ex(&self, key: &str, value: Bytes, ttl_seconds: u64) -> Result<()> {
        let _: () = self
            .query(redis::cmd("SETEX").arg(key).arg(ttl_seconds).arg(&value[..]))
            .await?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.query(redis::cmd("DEL").arg(keys)).await
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let ttl: i64 = self.query(redis::cmd("TTL").arg(key)).await?;
        Ok(match ttl {
            -2 => KeyTtl::Missing,
            t if t < 0 => KeyTtl::Persistent,
            t => KeyTtl::Expires(t as u64),
        })
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool> {
        let set: i64 = self
            .query(redis::cmd("EXPIRE").arg(key).arg(ttl_seconds))
            .await?;
        Ok(set == 1)
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = self
                .query(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_COUNT),
                )
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return duplicates across iterations
        keys.sort();
        keys.dedup();
        debug!("SCAN {} matched {} keys", pattern, keys.len());
        Ok(keys)
    }

    async fn ping(&self) -> Result<()> {
        let _: String = self.query(&redis::cmd("PING")).await?;
        Ok(())
    }

    async fn memory_info(&self) -> Result<RemoteMemoryInfo> {
        let info: String = self.query(redis::cmd("INFO").arg("memory")).await?;
        Ok(parse_memory_info(&info))
    }

    async fn db_size(&self) -> Result<u64> {
        self.query(&redis::cmd("DBSIZE")).await
    }

    async fn purge_memory(&self) -> Result<bool> {
        let mut conn = self.conn().await?;
        let result: redis::RedisResult<String> = redis::cmd("MEMORY")
            .arg("PURGE")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == redis::ErrorKind::ResponseError => {
                debug!("MEMORY PURGE not supported: {}", e);
                Ok(false)
            }
            Err(e) => {
                self.on_error(&e).await;
                Err(e.into())
            }
        }
    }
}

/// Parse `used_memory` and `maxmemory` out of an `INFO memory` reply
pub fn parse_memory_info(info: &str) -> RemoteMemoryInfo {
    let mut out = RemoteMemoryInfo::default();
    for line in info.lines() {
        let line = line.trim();
        if let Some(v) = line.strip_prefix("used_memory:") {
            out.used_bytes = v.trim().parse().unwrap_or(0);
        } else if let Some(v) = line.strip_prefix("maxmemory:") {
            out.max_bytes = v.trim().parse().unwrap_or(0);
        }
    }
    out
}

// =============================================================================
// Tests
// =============================================================================
