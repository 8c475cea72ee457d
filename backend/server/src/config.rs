use std::{env, fmt::Display, fs::read_to_string, str::FromStr};

use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_PORT: &str = "5000";
pub const DEFAULT_TABLE: &str = "tapevents";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing {0} as environment variable")]
    Missing(&'static str),

    #[error("Invalid {key} value: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Backend {
    Sqlite { database_url: String },
    Redis { redis_url: String },
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub backend: Backend,
    pub table_name: String,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`Config::load`] with variables coming from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = try_load(&lookup, "RUST_PORT", DEFAULT_PORT)?;
        let table_name = try_load(&lookup, "TABLE_NAME", DEFAULT_TABLE)?;

        let backend = match try_load::<String, _>(&lookup, "STORE_BACKEND", "sqlite")?.as_str() {
            "sqlite" => Backend::Sqlite {
                database_url: required(&lookup, "DATABASE_URL")?,
            },
            "redis" => {
                let redis_url = required(&lookup, "REDIS_URL")?;
                let password = lookup("REDIS_PASSWORD").or_else(|| read_secret("REDIS_PASSWORD"));

                Backend::Redis {
                    redis_url: with_password(&redis_url, password.as_deref()),
                }
            }
            "memory" => Backend::Memory,
            other => {
                return Err(ConfigError::Invalid {
                    key: "STORE_BACKEND",
                    reason: format!("unknown backend {other:?}, expected sqlite, redis or memory"),
                });
            }
        };

        Ok(Self {
            port,
            backend,
            table_name,
        })
    }

    pub fn masked_redis_url(&self) -> String {
        match &self.backend {
            Backend::Redis { redis_url } => mask_password(redis_url),
            _ => String::new(),
        }
    }
}

fn required<F>(lookup: &F, key: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .filter(|value| !value.trim().is_empty())
        .ok_or(ConfigError::Missing(key))
}

fn try_load<T, F>(lookup: &F, key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .unwrap_or_else(|| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e: T::Err| {
            warn!("Invalid {key} value: {e}");
            ConfigError::Invalid {
                key,
                reason: e.to_string(),
            }
        })
}

fn read_secret(secret_name: &str) -> Option<String> {
    let path = format!("/run/secrets/{secret_name}");

    read_to_string(&path)
        .map(|s| s.trim().to_string())
        .map_err(|e| {
            info!("No {secret_name} secret file: {e}");
        })
        .ok()
}

fn with_password(redis_url: &str, password: Option<&str>) -> String {
    match (password, redis_url.split_once("://")) {
        (Some(password), Some((scheme, rest))) if !rest.contains('@') => {
            format!("{scheme}://:{password}@{rest}")
        }
        _ => redis_url.to_string(),
    }
}

fn mask_password(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((credentials, host)) = rest.rsplit_once('@') else {
        return url.to_string();
    };

    match credentials.split_once(':') {
        Some((user, _)) => format!("{scheme}://{user}:******@{host}"),
        None => format!("{scheme}://******@{host}"),
    }
}

/// Names of set variables that configure the store, for startup diagnostics.
pub fn store_vars_present() -> Vec<String> {
    env::vars()
        .map(|(key, _)| key)
        .filter(|key| {
            key.starts_with("REDIS")
                || key.starts_with("DATABASE")
                || key.starts_with("STORE")
                || key == "TABLE_NAME"
        })
        .collect()
}
