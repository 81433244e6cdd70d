// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::executor::ExecutorConfig;
use crate::poller::PollerConfig;
use crate::secrets::SecretCipher;

/// Broker engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file
    pub database_path: PathBuf,
    /// Cipher for sensitive instance details
    pub cipher: SecretCipher,
    /// Interval between poller scans
    pub poll_interval: Duration,
    /// Maximum in-progress records examined per scan
    pub poll_batch_size: i64,
    /// Maximum concurrent resumes
    pub max_concurrent_polls: usize,
    /// Default maximum wait of an asynchronous backend operation
    pub operation_timeout: Duration,
    /// Retry and re-check backoff
    pub backoff: BackoffPolicy,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `BROKER_ENCRYPTION_KEY`: base64-encoded 32-byte key
    ///
    /// Optional (with defaults):
    /// - `BROKER_DATABASE_PATH`: SQLite file (default: .data/broker.db)
    /// - `BROKER_POLL_INTERVAL_SECS`: scan interval (default: 5)
    /// - `BROKER_POLL_BATCH_SIZE`: records per scan (default: 50)
    /// - `BROKER_MAX_CONCURRENT_POLLS`: concurrent resumes (default: 16)
    /// - `BROKER_OPERATION_TIMEOUT_SECS`: async operation deadline (default: 1800)
    /// - `BROKER_BACKOFF_INITIAL_MS`: first retry delay (default: 1000)
    /// - `BROKER_BACKOFF_MAX_MS`: retry delay cap (default: 60000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let key = std::env::var("BROKER_ENCRYPTION_KEY")
            .map_err(|_| ConfigError::Missing("BROKER_ENCRYPTION_KEY"))?;
        let cipher = SecretCipher::from_base64(&key).map_err(|_| {
            ConfigError::Invalid(
                "BROKER_ENCRYPTION_KEY",
                "must be a base64-encoded 32-byte key",
            )
        })?;

        let database_path = PathBuf::from(
            std::env::var("BROKER_DATABASE_PATH").unwrap_or_else(|_| ".data/broker.db".to_string()),
        );

        let poll_interval_secs: u64 = positive(
            "BROKER_POLL_INTERVAL_SECS",
            "5",
            "must be a positive integer",
        )?;
        let poll_batch_size: i64 =
            positive("BROKER_POLL_BATCH_SIZE", "50", "must be a positive integer")?;
        let max_concurrent_polls: usize = positive(
            "BROKER_MAX_CONCURRENT_POLLS",
            "16",
            "must be a positive integer",
        )?;
        let operation_timeout_secs: u64 = positive(
            "BROKER_OPERATION_TIMEOUT_SECS",
            "1800",
            "must be a positive integer",
        )?;
        let backoff_initial_ms: u64 = positive(
            "BROKER_BACKOFF_INITIAL_MS",
            "1000",
            "must be a positive integer",
        )?;
        let backoff_max_ms: u64 =
            positive("BROKER_BACKOFF_MAX_MS", "60000", "must be a positive integer")?;
        if backoff_max_ms < backoff_initial_ms {
            return Err(ConfigError::Invalid(
                "BROKER_BACKOFF_MAX_MS",
                "must not be lower than BROKER_BACKOFF_INITIAL_MS",
            ));
        }

        Ok(Self {
            database_path,
            cipher,
            poll_interval: Duration::from_secs(poll_interval_secs),
            poll_batch_size,
            max_concurrent_polls,
            operation_timeout: Duration::from_secs(operation_timeout_secs),
            backoff: BackoffPolicy::new(
                Duration::from_millis(backoff_initial_ms),
                Duration::from_millis(backoff_max_ms),
            ),
        })
    }

    /// Poller settings derived from this configuration.
    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            poll_interval: self.poll_interval,
            batch_size: self.poll_batch_size,
            max_concurrent: self.max_concurrent_polls,
        }
    }

    /// Executor settings derived from this configuration.
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            operation_timeout: self.operation_timeout,
            backoff: self.backoff,
        }
    }
}

fn positive<T>(name: &'static str, default: &str, reason: &'static str) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    let value: T = std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(name, reason))?;
    if value <= T::default() {
        return Err(ConfigError::Invalid(name, reason));
    }
    Ok(value)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
