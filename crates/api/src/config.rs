use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, bail};

use scribe_infra::{FanoutConfig, QueueConfig, TenantLimits, TenantQuota};

/// Server configuration loaded from environment variables.
///
/// | Env Var                            | Default          |
/// |------------------------------------|------------------|
/// | `HOST`                             | `0.0.0.0`        |
/// | `PORT`                             | `8080`           |
/// | `JWT_SECRET`                       | required         |
/// | `DATABASE_URL`                     | unset: in-memory |
/// | `STORAGE_PATH`                     | `./storage`      |
/// | `TRANSCRIBE_COMMAND`               | unset            |
/// | `QUEUE_IDLE_TIMEOUT_SECS`          | `60`             |
/// | `DEFAULT_MAX_CONCURRENT_JOBS`      | `1`              |
/// | `DEFAULT_MAX_QUEUED_JOBS`          | `100`            |
/// | `DEFAULT_PROCESSING_QUOTA_MINUTES` | unset: unlimited |
/// | `WS_KEEPALIVE_TIMEOUT_SECS`        | `60`             |
/// | `WS_SEND_BUFFER`                   | `64`             |
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub jwt_secret: String,
    /// Postgres connection string; without it jobs and usage live in memory.
    pub database_url: Option<String>,
    /// Root directory for job results.
    pub storage_path: PathBuf,
    /// External transcriber command line, invoked with the input location appended.
    pub transcribe_command: Option<String>,
    pub queue: QueueConfig,
    pub fanout: FanoutConfig,
    pub default_limits: TenantLimits,
    pub default_quota: TenantQuota,
}

impl ServerConfig {
    /// Development defaults around an explicit secret.
    pub fn new(jwt_secret: impl Into<String>) -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            jwt_secret: jwt_secret.into(),
            database_url: None,
            storage_path: PathBuf::from("./storage"),
            transcribe_command: None,
            queue: QueueConfig::default(),
            fanout: FanoutConfig::default(),
            default_limits: TenantLimits::default(),
            default_quota: TenantQuota::default(),
        }
    }

    /// Load configuration from the environment (and `.env`, if present).
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let jwt_secret = optional("JWT_SECRET").context("JWT_SECRET must be set")?;
        if jwt_secret.len() < 16 {
            bail!("JWT_SECRET must be at least 16 bytes");
        }
        let mut config = Self::new(jwt_secret);

        if let Some(host) = optional("HOST") {
            config.host = host;
        }
        config.port = parsed("PORT")?.unwrap_or(config.port);
        config.database_url = optional("DATABASE_URL");
        if let Some(path) = optional("STORAGE_PATH") {
            config.storage_path = PathBuf::from(path);
        }
        config.transcribe_command = optional("TRANSCRIBE_COMMAND");

        if let Some(secs) = parsed::<u64>("QUEUE_IDLE_TIMEOUT_SECS")? {
            config.queue.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed::<u64>("WS_KEEPALIVE_TIMEOUT_SECS")? {
            config.fanout.keepalive_timeout = Duration::from_secs(secs);
        }
        config.fanout.send_buffer = parsed("WS_SEND_BUFFER")?.unwrap_or(config.fanout.send_buffer);

        config.default_limits.max_concurrent_jobs =
            parsed("DEFAULT_MAX_CONCURRENT_JOBS")?.unwrap_or(config.default_limits.max_concurrent_jobs);
        config.default_limits.max_queued_jobs =
            parsed("DEFAULT_MAX_QUEUED_JOBS")?.unwrap_or(config.default_limits.max_queued_jobs);
        config.default_quota.processing_minutes = parsed("DEFAULT_PROCESSING_QUOTA_MINUTES")?;

        if config.default_limits.max_concurrent_jobs == 0 || config.default_limits.max_queued_jobs == 0 {
            bail!("tenant limits must be at least 1");
        }
        Ok(config)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    optional(key)
        .map(|raw| raw.parse::<T>().with_context(|| format!("{key} has an invalid value: {raw}")))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsed_reports_bad_values() {
        // SAFETY: test-local variable names; no other test reads them.
        unsafe {
            std::env::set_var("SCRIBE_TEST_PORT_OK", "9000");
            std::env::set_var("SCRIBE_TEST_PORT_BAD", "nine");
        }
        assert_eq!(parsed::<u16>("SCRIBE_TEST_PORT_OK").unwrap(), Some(9000));
        let err = parsed::<u16>("SCRIBE_TEST_PORT_BAD").unwrap_err();
        assert!(err.to_string().contains("SCRIBE_TEST_PORT_BAD"));
        assert_eq!(parsed::<u16>("SCRIBE_TEST_PORT_UNSET").unwrap(), None);
    }

    #[test]
    fn defaults_are_in_memory() {
        let config = ServerConfig::new("0123456789abcdef");
        assert!(config.database_url.is_none());
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
        assert_eq!(config.default_limits, TenantLimits::default());
    }
}
