use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

use crate::error::CoreError;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// When set, the server listens on this unix socket instead of TCP.
    pub socket: Option<String>,
    pub data_dir: String,
    pub storage: StorageKind,
    pub duckdb_memory_limit: String,
    /// Public host (with port, if any) used to build first-contact redirects.
    pub host: String,
    pub cookie_domain: String,
    pub bots_path: String,
    /// Timezone the `day` history column is computed in.
    pub timezone: Tz,
    pub flush_interval_secs: u64,
    pub history_queue_capacity: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StorageKind {
    DuckDb,
    /// Seeded in-process catalogue; nothing survives a restart.
    Memory,
}

impl FromStr for StorageKind {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "duckdb" => Ok(Self::DuckDb),
            "memory" => Ok(Self::Memory),
            other => Err(CoreError::InvalidConfig {
                key: "TOPD_STORAGE",
                reason: format!("unknown storage kind {other:?}, expected duckdb or memory"),
            }),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T>(key: &'static str, default: &str) -> Result<T, CoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_or(key, default)
        .parse()
        .map_err(|e: T::Err| CoreError::InvalidConfig {
            key,
            reason: e.to_string(),
        })
}

impl Config {
    pub fn from_env() -> Result<Self, CoreError> {
        let flush_interval_secs: u64 = parse_env("TOPD_FLUSH_INTERVAL_SECS", "10")?;
        if flush_interval_secs == 0 {
            return Err(CoreError::InvalidConfig {
                key: "TOPD_FLUSH_INTERVAL_SECS",
                reason: "must be greater than zero".to_string(),
            });
        }
        let history_queue_capacity: usize = parse_env("TOPD_HISTORY_QUEUE_CAPACITY", "1024")?;
        if history_queue_capacity == 0 {
            return Err(CoreError::InvalidConfig {
                key: "TOPD_HISTORY_QUEUE_CAPACITY",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            port: parse_env("TOPD_PORT", "8081")?,
            socket: std::env::var("TOPD_SOCKET").ok().filter(|s| !s.is_empty()),
            data_dir: env_or("TOPD_DATA_DIR", "./data"),
            storage: parse_env("TOPD_STORAGE", "duckdb")?,
            duckdb_memory_limit: env_or("TOPD_DUCKDB_MEMORY", "1GB"),
            host: env_or("TOPD_HOST", "localhost:8081"),
            cookie_domain: env_or("TOPD_COOKIE_DOMAIN", "localhost"),
            bots_path: env_or("TOPD_BOTS_PATH", "./bots.txt"),
            timezone: env_or("TOPD_TIMEZONE", "UTC").parse().map_err(|e| {
                CoreError::InvalidConfig {
                    key: "TOPD_TIMEZONE",
                    reason: format!("{e}"),
                }
            })?,
            flush_interval_secs,
            history_queue_capacity,
        })
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_kind_parses_known_values() {
        assert_eq!("duckdb".parse::<StorageKind>().ok(), Some(StorageKind::DuckDb));
        assert_eq!("memory".parse::<StorageKind>().ok(), Some(StorageKind::Memory));
    }

    #[test]
    fn storage_kind_rejects_unknown_value() {
        let err = "mysql".parse::<StorageKind>().unwrap_err();
        assert!(err.to_string().contains("TOPD_STORAGE"));
    }
}
