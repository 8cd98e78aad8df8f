//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

/// Which halves of the system this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// HTTP producers only.
    Api,
    /// Queue consumers only.
    Worker,
    /// Both, in one process.
    All,
}

impl Role {
    pub fn serves_http(&self) -> bool {
        matches!(self, Role::Api | Role::All)
    }

    pub fn runs_worker(&self) -> bool {
        matches!(self, Role::Worker | Role::All)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "api" => Ok(Role::Api),
            "worker" => Ok(Role::Worker),
            "all" => Ok(Role::All),
            other => Err(format!("unknown role {other:?}")),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

/// Process configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `"info"`)
/// - `LOG_FORMAT`: `text` or `json` (default `text`)
/// - `ROLE`: `api`, `worker` or `all` (default `all`)
/// - `DATABASE_URL`: Postgres; the in-memory store is used when unset
/// - `REDIS_URL`: lock backend; the in-memory lock is used when unset
/// - `PRIMARY_QUEUE_URL`, `ANALYSIS_QUEUE_URL`: SQS queues; in-memory
///   queues are used when unset
/// - `VISIBILITY_TIMEOUT_SECS` (default 60), `WORKER_CONCURRENCY` (default 8),
///   `LOCK_TTL_SECS` (default 30)
/// - `HOOK_BASE_URL`, `REVIEWER_LOGIN`: repository saga settings
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub role: Role,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub primary_queue_url: Option<String>,
    pub analysis_queue_url: Option<String>,
    pub visibility_timeout: Duration,
    pub worker_concurrency: usize,
    pub lock_ttl: Duration,
    pub hook_base_url: String,
    pub reviewer_login: String,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: FromStr>(name: &str) -> Option<T> {
    var(name).and_then(|v| v.parse().ok())
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: var("HOST").unwrap_or(defaults.host),
            port: parsed("PORT").unwrap_or(defaults.port),
            log_level: var("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: parsed("LOG_FORMAT").unwrap_or(defaults.log_format),
            role: parsed("ROLE").unwrap_or(defaults.role),
            database_url: var("DATABASE_URL"),
            redis_url: var("REDIS_URL"),
            primary_queue_url: var("PRIMARY_QUEUE_URL"),
            analysis_queue_url: var("ANALYSIS_QUEUE_URL"),
            visibility_timeout: parsed("VISIBILITY_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.visibility_timeout),
            worker_concurrency: parsed("WORKER_CONCURRENCY")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.worker_concurrency),
            lock_ttl: parsed("LOCK_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_ttl),
            hook_base_url: var("HOOK_BASE_URL").unwrap_or(defaults.hook_base_url),
            reviewer_login: var("REVIEWER_LOGIN").unwrap_or(defaults.reviewer_login),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            role: Role::All,
            database_url: None,
            redis_url: None,
            primary_queue_url: None,
            analysis_queue_url: None,
            visibility_timeout: Duration::from_secs(60),
            worker_concurrency: 8,
            lock_ttl: Duration::from_secs(30),
            hook_base_url: "http://localhost:3000/hooks".to_string(),
            reviewer_login: "analysis-reviewer".to_string(),
        }
    }
}
