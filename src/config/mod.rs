//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::{NonZeroU64, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "cascade-cache";
const ENV_PREFIX: &str = "CASCADE_CACHE";
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_REDIS_POOL_SIZE: u64 = 16;
const DEFAULT_REDIS_TIMEOUT_MS: u64 = 5000;
const DEFAULT_TTL_MINUTES: u64 = 30;
const DEFAULT_LONG_TTL_HOURS: u64 = 24;
const DEFAULT_MAX_KEY_LOCKS: u64 = 10_000;
const DEFAULT_LOCK_RECLAIM_INTERVAL_SECS: u64 = 120;
const DEFAULT_LOCK_IDLE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_SCAN_BATCH_SIZE: u64 = 1000;
const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 5000;
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 30_000;
const REDIS_URL_SCHEMES: &[&str] = &["redis://", "rediss://", "redis+unix://", "unix://"];

/// Command-line arguments for the cascade-cache binary.
#[derive(Debug, Parser)]
#[command(
    name = "cascade-cache",
    version,
    about = "Inspect and invalidate the content cache"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "CASCADE_CACHE_CONFIG_FILE",
        value_name = "PATH",
        global = true
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Print store and lock registry statistics as JSON.
    Stats,
    /// List keys matching a glob pattern.
    Keys(KeysArgs),
    /// Print the raw cached value of a key.
    Get(GetArgs),
    /// Delete every key matching a glob pattern.
    Purge(PurgeArgs),
    /// Invalidate an entity (or a whole entity type) and its dependents.
    Invalidate(InvalidateArgs),
}

#[derive(Debug, Args, Clone)]
pub struct KeysArgs {
    /// Glob pattern (`*`, `?`, `[...]`).
    #[arg(value_name = "PATTERN", default_value = "*")]
    pub pattern: String,

    /// Stop after this many keys.
    #[arg(long, value_name = "COUNT")]
    pub limit: Option<usize>,
}

#[derive(Debug, Args, Clone)]
pub struct GetArgs {
    #[arg(value_name = "KEY")]
    pub key: String,
}

#[derive(Debug, Args, Clone)]
pub struct PurgeArgs {
    #[arg(value_name = "PATTERN")]
    pub pattern: String,
}

#[derive(Debug, Args, Clone)]
pub struct InvalidateArgs {
    /// Entity type, singular or plural (`category`, `users`, ...).
    #[arg(value_name = "TYPE")]
    pub entity_type: String,

    /// Entity id; omit (or pass 0) to invalidate the whole type.
    #[arg(long, value_name = "ID", allow_negative_numbers = true)]
    pub id: Option<i64>,

    /// Non-numeric entity identity such as a slug.
    #[arg(long, value_name = "KEY")]
    pub key: Option<String>,

    /// Also invalidate dependent entity types.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub cascade: bool,

    /// Print the invalidation plan without executing it.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub dry_run: bool,
}

#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the Redis connection URL.
    #[arg(long = "redis-url", value_name = "URL", global = true)]
    pub redis_url: Option<String>,

    /// Override the Redis connection pool size.
    #[arg(long = "redis-pool-size", value_name = "COUNT", global = true)]
    pub redis_pool_size: Option<u64>,

    /// Override the pattern-scan batch size.
    #[arg(long = "cache-scan-batch-size", value_name = "COUNT", global = true)]
    pub scan_batch_size: Option<u64>,

    /// Override the per-call store deadline.
    #[arg(long = "cache-operation-timeout-ms", value_name = "MILLIS", global = true)]
    pub operation_timeout_ms: Option<u64>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub redis: RedisSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub url: String,
    pub pool_size: NonZeroUsize,
    /// Connection checkout and connect timeout.
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub default_ttl_minutes: NonZeroU64,
    pub long_ttl_hours: NonZeroU64,
    pub max_key_locks: NonZeroUsize,
    pub lock_reclaim_interval_secs: NonZeroU64,
    pub lock_idle_timeout_secs: NonZeroU64,
    pub scan_batch_size: NonZeroUsize,
    pub operation_timeout_ms: NonZeroU64,
    pub lock_timeout_ms: NonZeroU64,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    redis: RawRedisSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.redis_url.as_ref() {
            self.redis.url = Some(url.clone());
        }
        if let Some(size) = overrides.redis_pool_size {
            self.redis.pool_size = Some(size);
        }
        if let Some(size) = overrides.scan_batch_size {
            self.cache.scan_batch_size = Some(size);
        }
        if let Some(timeout) = overrides.operation_timeout_ms {
            self.cache.operation_timeout_ms = Some(timeout);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            redis,
            cache,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let redis = build_redis_settings(redis)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self {
            logging,
            redis,
            cache,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_redis_settings(redis: RawRedisSettings) -> Result<RedisSettings, LoadError> {
    let url = redis
        .url
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string());
    if url.is_empty() {
        return Err(LoadError::invalid("redis.url", "url must not be empty"));
    }
    if !REDIS_URL_SCHEMES
        .iter()
        .any(|scheme| url.starts_with(scheme))
    {
        return Err(LoadError::invalid(
            "redis.url",
            format!("unsupported scheme in `{url}`"),
        ));
    }

    let pool_size = non_zero_usize(
        redis.pool_size.unwrap_or(DEFAULT_REDIS_POOL_SIZE),
        "redis.pool_size",
    )?;
    let timeout_ms = non_zero_u64(
        redis.timeout_ms.unwrap_or(DEFAULT_REDIS_TIMEOUT_MS),
        "redis.timeout_ms",
    )?;

    Ok(RedisSettings {
        url,
        pool_size,
        timeout: Duration::from_millis(timeout_ms.get()),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    Ok(CacheSettings {
        default_ttl_minutes: non_zero_u64(
            cache.default_ttl_minutes.unwrap_or(DEFAULT_TTL_MINUTES),
            "cache.default_ttl_minutes",
        )?,
        long_ttl_hours: non_zero_u64(
            cache.long_ttl_hours.unwrap_or(DEFAULT_LONG_TTL_HOURS),
            "cache.long_ttl_hours",
        )?,
        max_key_locks: non_zero_usize(
            cache.max_key_locks.unwrap_or(DEFAULT_MAX_KEY_LOCKS),
            "cache.max_key_locks",
        )?,
        lock_reclaim_interval_secs: non_zero_u64(
            cache
                .lock_reclaim_interval_secs
                .unwrap_or(DEFAULT_LOCK_RECLAIM_INTERVAL_SECS),
            "cache.lock_reclaim_interval_secs",
        )?,
        lock_idle_timeout_secs: non_zero_u64(
            cache
                .lock_idle_timeout_secs
                .unwrap_or(DEFAULT_LOCK_IDLE_TIMEOUT_SECS),
            "cache.lock_idle_timeout_secs",
        )?,
        scan_batch_size: non_zero_usize(
            cache.scan_batch_size.unwrap_or(DEFAULT_SCAN_BATCH_SIZE),
            "cache.scan_batch_size",
        )?,
        operation_timeout_ms: non_zero_u64(
            cache
                .operation_timeout_ms
                .unwrap_or(DEFAULT_OPERATION_TIMEOUT_MS),
            "cache.operation_timeout_ms",
        )?,
        lock_timeout_ms: non_zero_u64(
            cache.lock_timeout_ms.unwrap_or(DEFAULT_LOCK_TIMEOUT_MS),
            "cache.lock_timeout_ms",
        )?,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRedisSettings {
    url: Option<String>,
    pool_size: Option<u64>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    default_ttl_minutes: Option<u64>,
    long_ttl_hours: Option<u64>,
    max_key_locks: Option<u64>,
    lock_reclaim_interval_secs: Option<u64>,
    lock_idle_timeout_secs: Option<u64>,
    scan_batch_size: Option<u64>,
    operation_timeout_ms: Option<u64>,
    lock_timeout_ms: Option<u64>,
}

fn non_zero_u64(value: u64, key: &'static str) -> Result<NonZeroU64, LoadError> {
    NonZeroU64::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_usize: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value_usize)
        .ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[cfg(test)]
mod tests;
