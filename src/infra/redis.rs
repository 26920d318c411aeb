//! Redis-backed [`CacheStore`] over a `deadpool-redis` connection pool.
//!
//! Every call checks a connection out of the pool and returns it right after
//! the round trip; a key scan checks out one connection per `SCAN` page.

use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime};
use redis::{AsyncCommands, RedisError};
use tracing::info;

use crate::cache::{CacheStore, KeyStream, StoreError};
use crate::config::RedisSettings;

use super::error::InfraError;

/// Error codes a server returns when the client may not run a command.
const PERMISSION_CODES: &[&str] = &["NOPERM", "NOAUTH"];

pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    /// Build the pool and verify that one connection can be established.
    pub async fn connect(settings: &RedisSettings) -> Result<Self, InfraError> {
        info!(
            url = %redacted(&settings.url),
            pool_size = settings.pool_size.get(),
            "Connecting to Redis"
        );

        let mut config = Config::from_url(settings.url.as_str());
        let mut pool_config = PoolConfig::new(settings.pool_size.get());
        pool_config.timeouts.wait = Some(settings.timeout);
        pool_config.timeouts.create = Some(settings.timeout);
        pool_config.timeouts.recycle = Some(settings.timeout);
        config.pool = Some(pool_config);

        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|err| InfraError::redis(format!("failed to create pool: {err}")))?;

        pool.get()
            .await
            .map_err(|err| InfraError::redis(format!("failed to connect: {err}")))?;

        info!("Connected to Redis");
        Ok(Self { pool })
    }

    async fn connection(&self) -> Result<Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|err| StoreError::connection(err.to_string()))
    }

    async fn scan_page(
        &self,
        cursor: u64,
        pattern: &str,
        page_size: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        let mut conn = self.connection().await?;
        let page: (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(page_size)
            .query_async(&mut conn)
            .await
            .map_err(|err| command_error("SCAN", err))?;
        Ok(page)
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get_string(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await?;
        conn.get(key).await.map_err(|err| command_error("GET", err))
    }

    async fn set_string(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        conn.pset_ex(key, value, millis)
            .await
            .map_err(|err| command_error("SET", err))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let removed: u64 = conn.del(key).await.map_err(|err| command_error("DEL", err))?;
        Ok(removed > 0)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        conn.del(keys).await.map_err(|err| command_error("DEL", err))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        conn.exists(key)
            .await
            .map_err(|err| command_error("EXISTS", err))
    }

    async fn refresh(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);
        conn.pexpire(key, millis)
            .await
            .map_err(|err| command_error("PEXPIRE", err))
    }

    fn scan_keys<'a>(&'a self, pattern: &'a str, page_size: usize) -> KeyStream<'a> {
        Box::pin(stream! {
            let mut cursor = 0_u64;
            loop {
                match self.scan_page(cursor, pattern, page_size).await {
                    Ok((next, keys)) => {
                        for key in keys {
                            yield Ok::<String, StoreError>(key);
                        }
                        if next == 0 {
                            break;
                        }
                        cursor = next;
                    }
                    Err(error) => {
                        yield Err(error);
                        break;
                    }
                }
            }
        })
    }

    fn endpoint_count(&self) -> usize {
        // Single-node pool; every key lives on the one server behind it.
        1
    }

    async fn execute_admin_command(&self, command: &str) -> Result<String, StoreError> {
        let mut conn = self.connection().await?;
        let mut parts = command.split_whitespace();
        let Some(name) = parts.next() else {
            return Err(StoreError::command("ADMIN", "empty command"));
        };

        let mut cmd = redis::cmd(name);
        for arg in parts {
            cmd.arg(arg);
        }

        let reply: redis::Value = cmd
            .query_async(&mut conn)
            .await
            .map_err(|err| admin_error(name, err))?;
        redis::from_redis_value::<String>(&reply)
            .or_else(|_| redis::from_redis_value::<i64>(&reply).map(|n| n.to_string()))
            .map_err(|err| StoreError::command("ADMIN", err.to_string()))
    }
}

fn command_error(command: &'static str, err: RedisError) -> StoreError {
    if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
        StoreError::connection(format!("{command}: {err}"))
    } else if err.is_timeout() {
        StoreError::command(command, format!("timed out: {err}"))
    } else {
        StoreError::command(command, err.to_string())
    }
}

/// Permission and unknown-command replies mean the capability is absent,
/// not that the call should be retried.
fn admin_error(command: &str, err: RedisError) -> StoreError {
    let text = err.to_string().to_ascii_lowercase();
    let denied = err.code().is_some_and(|code| PERMISSION_CODES.contains(&code))
        || PERMISSION_CODES
            .iter()
            .any(|code| text.contains(&code.to_ascii_lowercase()));
    let unknown = text.contains("unknown command");
    if denied || unknown {
        StoreError::unsupported("admin", format!("`{command}` rejected: {err}"))
    } else {
        command_error("ADMIN", err)
    }
}

/// Strip credentials from a connection URL before logging it.
fn redacted(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}
