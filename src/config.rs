// ABOUTME: Process configuration loaded from environment variables

use std::env;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

/// Orchestrator process configuration.
///
/// Everything comes from the process environment; there is no config file.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: String,
    pub jwt_secret: String,
    pub cors_origin: Option<String>,
    /// Docker socket / host override; `None` lets the client use its defaults.
    pub docker_host: Option<String>,
    pub sandbox_image: String,
    /// Container memory cap in MiB.
    pub sandbox_memory_limit_mib: u64,
    /// Container CPU quota as a fraction of one core.
    pub sandbox_cpu_limit: f64,
    pub encryption_key: String,
    pub data_root: PathBuf,
    pub janitor_interval_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = parse_var("PORT", 3001u16)?;
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://devbox.db".to_string());
        let jwt_secret = env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
        let encryption_key = env::var("SERVER_ENCRYPTION_KEY")
            .map_err(|_| ConfigError::Missing("SERVER_ENCRYPTION_KEY"))?;
        let sandbox_image =
            env::var("SANDBOX_IMAGE").unwrap_or_else(|_| "devbox-sandbox:latest".to_string());
        let sandbox_memory_limit_mib = parse_var("SANDBOX_MEMORY_LIMIT", 2048u64)?;
        let sandbox_cpu_limit = parse_var("SANDBOX_CPU_LIMIT", 1.0f64)?;
        let data_root = PathBuf::from(env::var("DATA_ROOT").unwrap_or_else(|_| "data".to_string()));
        let janitor_interval_secs = parse_var("JANITOR_INTERVAL_SECS", 300u64)?;

        Ok(Self {
            port,
            database_url,
            jwt_secret,
            cors_origin: env::var("CORS_ORIGIN").ok(),
            docker_host: env::var("DOCKER_HOST").ok(),
            sandbox_image,
            sandbox_memory_limit_mib,
            sandbox_cpu_limit,
            encryption_key,
            data_root,
            janitor_interval_secs,
        })
    }

}

fn parse_var<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(default),
    }
}
