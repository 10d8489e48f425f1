//! Process configuration from the environment (and an optional `.env`).

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    /// Postgres store when set, in-memory otherwise.
    pub database_url: Option<String>,
    pub render_service_url: Option<Url>,
    pub diff_service_url: Option<Url>,
    /// Shared blob store. Required alongside `diff_service_url`.
    pub blob_store_url: Option<Url>,
    pub notify_webhook_url: Option<Url>,
    /// Admin routes are only mounted when set.
    pub admin_token: Option<String>,
    pub capture_timeout: Duration,
    pub workers_per_lane: usize,
    pub tenant_concurrency: usize,
    pub capture_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub scheduler_tick: Duration,
    /// How long finished jobs are kept before they are reaped.
    pub job_retention: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_url: None,
            render_service_url: None,
            diff_service_url: None,
            blob_store_url: None,
            notify_webhook_url: None,
            admin_token: None,
            capture_timeout: Duration::from_secs(30),
            workers_per_lane: 4,
            tenant_concurrency: 2,
            capture_max_attempts: 3,
            retry_base_delay: Duration::from_millis(2000),
            scheduler_tick: Duration::from_secs(30),
            job_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl AppConfig {
    /// Read the process environment, loading `.env` first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Unset or blank values take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let config = Self {
            bind_addr: parsed(&get, "PAGEWATCH_BIND_ADDR")?.unwrap_or(defaults.bind_addr),
            database_url: get("DATABASE_URL"),
            render_service_url: url(&get, "RENDER_SERVICE_URL")?,
            diff_service_url: url(&get, "DIFF_SERVICE_URL")?,
            blob_store_url: url(&get, "BLOB_STORE_URL")?,
            notify_webhook_url: url(&get, "NOTIFY_WEBHOOK_URL")?,
            admin_token: get("ADMIN_TOKEN"),
            capture_timeout: parsed(&get, "CAPTURE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.capture_timeout),
            workers_per_lane: positive(&get, "WORKERS_PER_LANE")?.unwrap_or(defaults.workers_per_lane),
            tenant_concurrency: positive(&get, "TENANT_CONCURRENCY")?.unwrap_or(defaults.tenant_concurrency),
            capture_max_attempts: positive(&get, "CAPTURE_MAX_ATTEMPTS")?
                .unwrap_or(defaults.capture_max_attempts),
            retry_base_delay: parsed(&get, "RETRY_BASE_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),
            scheduler_tick: positive(&get, "SCHEDULER_TICK_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.scheduler_tick),
            job_retention: positive(&get, "JOB_RETENTION_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.job_retention),
        };
        config.validate()?;
        Ok(config)
    }

    /// Process-local blob refs cannot cross to a remote diff service.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.diff_service_url.is_some() && self.blob_store_url.is_none() {
            return Err(ConfigError::Invalid {
                name: "BLOB_STORE_URL",
                reason: "required when DIFF_SERVICE_URL is set".to_string(),
            });
        }
        Ok(())
    }
}

fn parsed<T>(get: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(name)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                name,
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn positive<T>(get: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr + Default + PartialOrd,
    T::Err: std::fmt::Display,
{
    match parsed::<T>(get, name)? {
        Some(value) if value <= T::default() => Err(ConfigError::Invalid {
            name,
            reason: "must be greater than zero".to_string(),
        }),
        other => Ok(other),
    }
}

fn url(get: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<Option<Url>, ConfigError> {
    let Some(parsed) = parsed::<Url>(get, name)? else {
        return Ok(None);
    };
    match parsed.scheme() {
        "http" | "https" => Ok(Some(parsed)),
        other => Err(ConfigError::Invalid {
            name,
            reason: format!("unsupported scheme {other}"),
        }),
    }
}
