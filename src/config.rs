//! Server and client settings.
//!
//! Both are read from TOML files where every key is optional; command line flags in the
//! binaries override what the file says.
use std::{
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 7350;
const THREADS_PER_CORE: usize = 2;
const MAX_WORKERS: usize = 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

fn load<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
        path: path.to_path_buf(),
        source,
    })
}

fn millis(ms: Option<u64>) -> Option<Duration> {
    ms.filter(|ms| *ms > 0).map(Duration::from_millis)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: IpAddr,
    pub port: u16,
    /// Worker threads; 0 picks a default from the CPU count.
    pub workers: usize,
    /// Listen backlog is `workers * backlog_multiplier`.
    pub backlog_multiplier: usize,
    /// Bound on each readiness wait; absent waits until a connection or a shutdown.
    pub poll_timeout_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    pub write_timeout_ms: Option<u64>,
    pub login: String,
    pub password: String,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            workers: 0,
            backlog_multiplier: 2,
            poll_timeout_ms: None,
            read_timeout_ms: None,
            write_timeout_ms: None,
            login: String::new(),
            password: String::new(),
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        load(path.as_ref())
    }

    /// Effective worker count: the configured value clamped to `1..=1024`, or twice the CPU
    /// count when unset.
    pub fn worker_count(&self) -> usize {
        match self.workers {
            0 => {
                let cores = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                (cores * THREADS_PER_CORE).clamp(THREADS_PER_CORE, MAX_WORKERS)
            }
            n => n.min(MAX_WORKERS),
        }
    }

    pub fn backlog(&self) -> i32 {
        let backlog = self.worker_count() * self.backlog_multiplier.max(1);
        i32::try_from(backlog).unwrap_or(i32::MAX)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        millis(self.write_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Connection attempts made while the server refuses connections.
    pub connect_attempts: u32,
    pub retry_delay_ms: u64,
    pub read_timeout_ms: Option<u64>,
    pub write_timeout_ms: Option<u64>,
    pub login: String,
    pub password: String,
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            connect_attempts: 5,
            retry_delay_ms: 100,
            read_timeout_ms: None,
            write_timeout_ms: None,
            login: String::new(),
            password: String::new(),
            log_level: "warn".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        load(path.as_ref())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        millis(self.write_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempdir::TempDir;

    use super::*;

    #[test]
    fn server_defaults() {
        let config = ServerConfig::default();

        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.worker_count() >= 2);
        assert_eq!(config.backlog(), (config.worker_count() * 2) as i32);
        assert_eq!(config.read_timeout(), None);
    }

    #[test]
    fn worker_count_is_capped() {
        let config = ServerConfig {
            workers: 5000,
            ..Default::default()
        };
        assert_eq!(config.worker_count(), 1024);
    }

    #[test]
    fn server_toml_parsing() {
        let toml_str = r#"
            address = "127.0.0.1"
            port = 9000
            workers = 4
            read_timeout_ms = 1500
            login = "alice"
            password = "secret"
        "#;

        let config: ServerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.address.to_string(), "127.0.0.1");
        assert_eq!(config.port, 9000);
        assert_eq!(config.backlog(), 8);
        assert_eq!(config.read_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.write_timeout(), None);
        assert_eq!(config.login, "alice");
    }

    #[test]
    fn client_config_from_file() {
        let dir = TempDir::new("tinyrpc").unwrap();
        let path = dir.path().join("client.toml");
        fs::write(&path, "host = \"example.org\"\nconnect_attempts = 2\n").unwrap();

        let config = ClientConfig::from_file(&path).unwrap();
        assert_eq!(config.host, "example.org");
        assert_eq!(config.connect_attempts, 2);
        assert_eq!(config.retry_delay(), Duration::from_millis(100));
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = TempDir::new("tinyrpc").unwrap();
        let err = ServerConfig::from_file(dir.path().join("nope.toml")).unwrap_err();

        assert!(matches!(err, ConfigError::FileRead { .. }));
    }
}
