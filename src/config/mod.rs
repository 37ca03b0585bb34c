//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! unparsable. The backend URL is wrapped in secrecy::SecretString since
//! Postgres URLs usually carry credentials.

use crate::engine::pool::{MAX_BATCH_SIZE, MAX_WAIT_TIME_SECONDS, WorkerPoolConfig};
use crate::error::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use std::str::FromStr;
use std::time::Duration;

/// `DATABASE_URL` value that selects the in-process backends.
pub const MEMORY_BACKEND_URL: &str = "memory://";

#[derive(Debug)]
pub struct Config {
    pub queue_name: String,
    pub worker_count: usize,
    pub batch_size: usize,
    pub wait_time_seconds: u64,
    pub stream_name: String,
    pub database_url: SecretString,
    pub table_name: String,
    pub visibility_timeout_seconds: u64,
    pub shard_count: usize,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

/// Which backend family the configured URL points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Postgres,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let config = Self {
            queue_name: required_var("QUEUE_NAME")?,
            worker_count: parsed_var("WORKER_COUNT")?,
            batch_size: parsed_var("BATCH_SIZE")?,
            wait_time_seconds: parsed_var("WAIT_TIME_SECONDS")?,
            stream_name: required_var("STREAM_NAME")?,
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            table_name: required_var("TABLE_NAME")?,
            visibility_timeout_seconds: parsed_var_or("VISIBILITY_TIMEOUT_SECONDS", 30)?,
            shard_count: parsed_var_or("SHARD_COUNT", 2)?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(Error::Config("WORKER_COUNT must be at least 1".to_string()));
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(Error::Config(format!(
                "BATCH_SIZE must be between 1 and {MAX_BATCH_SIZE}"
            )));
        }
        if self.wait_time_seconds > MAX_WAIT_TIME_SECONDS {
            return Err(Error::Config(format!(
                "WAIT_TIME_SECONDS must be at most {MAX_WAIT_TIME_SECONDS}"
            )));
        }
        if self.shard_count == 0 {
            return Err(Error::Config("SHARD_COUNT must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn backend_kind(&self) -> BackendKind {
        if self.database_url.expose_secret() == MEMORY_BACKEND_URL {
            BackendKind::Memory
        } else {
            BackendKind::Postgres
        }
    }

    /// The immutable per-run worker pool settings.
    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            queue_name: self.queue_name.clone(),
            worker_count: self.worker_count,
            batch_size: self.batch_size,
            wait_time: Duration::from_secs(self.wait_time_seconds),
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: FromStr>(name: &str) -> Result<T> {
    let raw = required_var(name)?;
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("environment variable {name} has invalid value {raw:?}")))
}

fn parsed_var_or<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(_) => parsed_var(name),
        Err(_) => Ok(default),
    }
}
