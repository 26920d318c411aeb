//! Error types for the cache layer.
//!
//! Only genuine faults are errors here. A cache miss is `None`, and most
//! maintenance failures are absorbed and logged by the caller of these types.

use std::time::Duration;

use thiserror::Error;

/// Failure reported by a [`CacheStore`](super::CacheStore) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection failed: {message}")]
    Connection { message: String },
    #[error("store command `{command}` failed: {message}")]
    Command {
        command: &'static str,
        message: String,
    },
    #[error("store call exceeded deadline of {0:?}")]
    Timeout(Duration),
    #[error("store capability `{capability}` is unavailable: {message}")]
    Unsupported {
        capability: &'static str,
        message: String,
    },
}

impl StoreError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn command(command: &'static str, message: impl Into<String>) -> Self {
        Self::Command {
            command,
            message: message.into(),
        }
    }

    pub fn unsupported(capability: &'static str, message: impl Into<String>) -> Self {
        Self::Unsupported {
            capability,
            message: message.into(),
        }
    }

    /// True when the failure means the capability will never work, so retrying
    /// on a later call is pointless.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}

/// Errors surfaced by the cache-aside engine.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid cache key: {reason}")]
    InvalidKey { reason: &'static str },
    #[error("refusing to cache a null value under `{key}`")]
    NullValue { key: String },
    #[error("refusing to cache `{key}` without an expiration")]
    ZeroTtl { key: String },
    #[error("failed to serialize value for `{key}`: {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("store write for `{key}` failed: {source}")]
    Store {
        key: String,
        #[source]
        source: StoreError,
    },
}

impl CacheError {
    pub fn invalid_key(reason: &'static str) -> Self {
        Self::InvalidKey { reason }
    }

    pub fn null_value(key: impl Into<String>) -> Self {
        Self::NullValue { key: key.into() }
    }

    pub fn store(key: impl Into<String>, source: StoreError) -> Self {
        Self::Store {
            key: key.into(),
            source,
        }
    }
}

/// Reasons a key lock could not be handed out.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("timed out after {0:?} waiting for key lock")]
    Timeout(Duration),
    #[error("key lock registry is closed")]
    Closed,
}
