use thiserror::Error;

use crate::{cache::CacheError, config::LoadError, infra::error::InfraError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// Process exit status for the command-line front end.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Validation(_) | AppError::Config(_) => 2,
            AppError::Cache(CacheError::InvalidKey { .. }) => 2,
            AppError::Infra(_) | AppError::Cache(_) | AppError::Unexpected(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_errors_exit_with_two() {
        assert_eq!(AppError::validation("bad type").exit_code(), 2);
        assert_eq!(
            AppError::from(CacheError::invalid_key("empty")).exit_code(),
            2
        );
        assert_eq!(AppError::unexpected("boom").exit_code(), 1);
        assert_eq!(AppError::from(InfraError::redis("refused")).exit_code(), 1);
    }
}
