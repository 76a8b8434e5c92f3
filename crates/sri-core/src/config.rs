// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// sri-core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// HTTP server address
    pub http_addr: SocketAddr,
    /// Maximum requests in flight before the admission gate answers 503
    pub max_concurrent_requests: usize,
    /// Interval between whitespace heartbeats on streaming responses
    pub streaming_keep_alive: Duration,
    /// Emit `Server-Timing` headers (or trailers for streamed bodies)
    pub server_timing: bool,
    /// Page size for list routes without `limit`
    pub default_page_size: u32,
    /// Largest `limit` a list route accepts
    pub max_page_size: u32,
    /// JSON file holding resource definitions (binary only)
    pub resources_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            http_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            max_concurrent_requests: 32,
            streaming_keep_alive: Duration::from_millis(20_000),
            server_timing: false,
            default_page_size: 30,
            max_page_size: 500,
            resources_file: PathBuf::from("resources.json"),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `SRI_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `SRI_HTTP_PORT`: HTTP server port (default: 5000)
    /// - `SRI_MAX_CONCURRENT_REQUESTS`: admission gate capacity (default: 32)
    /// - `SRI_STREAMING_KEEP_ALIVE_MS`: heartbeat interval (default: 20000)
    /// - `SRI_SERVER_TIMING`: `true`/`false` (default: false)
    /// - `SRI_DEFAULT_PAGE_SIZE`: list page size (default: 30)
    /// - `SRI_MAX_PAGE_SIZE`: largest list page (default: 500)
    /// - `SRI_RESOURCES_FILE`: resource definitions (default: resources.json)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_url = std::env::var("SRI_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("SRI_DATABASE_URL"))?;

        let http_port: u16 = std::env::var("SRI_HTTP_PORT")
            .unwrap_or_else(|_| "5000".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("SRI_HTTP_PORT", "must be a valid port number"))?;

        let max_concurrent_requests: usize = std::env::var("SRI_MAX_CONCURRENT_REQUESTS")
            .unwrap_or_else(|_| "32".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "SRI_MAX_CONCURRENT_REQUESTS",
                "must be a positive integer",
            ))?;

        let keep_alive_ms: u64 = std::env::var("SRI_STREAMING_KEEP_ALIVE_MS")
            .unwrap_or_else(|_| "20000".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "SRI_STREAMING_KEEP_ALIVE_MS",
                "must be a positive number of milliseconds",
            ))?;

        let server_timing = match std::env::var("SRI_SERVER_TIMING") {
            Ok(v) => match v.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                _ => {
                    return Err(ConfigError::Invalid(
                        "SRI_SERVER_TIMING",
                        "must be true or false",
                    ));
                }
            },
            Err(_) => defaults.server_timing,
        };

        let default_page_size: u32 = std::env::var("SRI_DEFAULT_PAGE_SIZE")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("SRI_DEFAULT_PAGE_SIZE", "must be a positive integer")
            })?;

        let max_page_size: u32 = std::env::var("SRI_MAX_PAGE_SIZE")
            .unwrap_or_else(|_| "500".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("SRI_MAX_PAGE_SIZE", "must be a positive integer"))?;

        if default_page_size == 0 || default_page_size > max_page_size {
            return Err(ConfigError::Invalid(
                "SRI_DEFAULT_PAGE_SIZE",
                "must be between 1 and SRI_MAX_PAGE_SIZE",
            ));
        }

        let resources_file = std::env::var("SRI_RESOURCES_FILE")
            .map(PathBuf::from)
            .unwrap_or(defaults.resources_file);

        Ok(Self {
            database_url,
            http_addr: SocketAddr::from(([0, 0, 0, 0], http_port)),
            max_concurrent_requests,
            streaming_keep_alive: Duration::from_millis(keep_alive_ms),
            server_timing,
            default_page_size,
            max_page_size,
            resources_file,
        })
    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        "SRI_DATABASE_URL",
        "SRI_HTTP_PORT",
        "SRI_MAX_CONCURRENT_REQUESTS",
        "SRI_STREAMING_KEEP_ALIVE_MS",
        "SRI_SERVER_TIMING",
        "SRI_DEFAULT_PAGE_SIZE",
        "SRI_MAX_PAGE_SIZE",
        "SRI_RESOURCES_FILE",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for var in ALL_VARS {
                guard.remove(var);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("SRI_DATABASE_URL", "postgres://localhost/test");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "postgres://localhost/test");
        assert_eq!(config.http_addr.port(), 5000);
        assert_eq!(config.max_concurrent_requests, 32);
        assert_eq!(config.streaming_keep_alive, Duration::from_millis(20_000));
        assert!(!config.server_timing);
        assert_eq!(config.default_page_size, 30);
        assert_eq!(config.max_page_size, 500);
        assert_eq!(config.resources_file, PathBuf::from("resources.json"));
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("SRI_DATABASE_URL", "sqlite:test.db");
        guard.set("SRI_HTTP_PORT", "8080");
        guard.set("SRI_MAX_CONCURRENT_REQUESTS", "4");
        guard.set("SRI_STREAMING_KEEP_ALIVE_MS", "250");
        guard.set("SRI_SERVER_TIMING", "TRUE");
        guard.set("SRI_DEFAULT_PAGE_SIZE", "10");
        guard.set("SRI_MAX_PAGE_SIZE", "100");
        guard.set("SRI_RESOURCES_FILE", "/etc/sri/resources.json");

        let config = Config::from_env().unwrap();

        assert_eq!(config.http_addr.port(), 8080);
        assert_eq!(config.max_concurrent_requests, 4);
        assert_eq!(config.streaming_keep_alive, Duration::from_millis(250));
        assert!(config.server_timing);
        assert_eq!(config.default_page_size, 10);
        assert_eq!(config.max_page_size, 100);
        assert_eq!(
            config.resources_file,
            PathBuf::from("/etc/sri/resources.json")
        );
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SRI_DATABASE_URL")));
        assert!(err.to_string().contains("SRI_DATABASE_URL"));
    }

    #[test]
    fn test_config_invalid_port() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("SRI_DATABASE_URL", "postgres://localhost/test");
        guard.set("SRI_HTTP_PORT", "99999");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("SRI_HTTP_PORT", _)));
    }

    #[test]
    fn test_config_zero_concurrency_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("SRI_DATABASE_URL", "postgres://localhost/test");
        guard.set("SRI_MAX_CONCURRENT_REQUESTS", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("SRI_MAX_CONCURRENT_REQUESTS", _)
        ));
    }

    #[test]
    fn test_config_invalid_server_timing() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("SRI_DATABASE_URL", "postgres://localhost/test");
        guard.set("SRI_SERVER_TIMING", "sometimes");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("SRI_SERVER_TIMING", _)));
    }

    #[test]
    fn test_config_page_size_above_max() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("SRI_DATABASE_URL", "postgres://localhost/test");
        guard.set("SRI_DEFAULT_PAGE_SIZE", "50");
        guard.set("SRI_MAX_PAGE_SIZE", "20");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("SRI_DEFAULT_PAGE_SIZE", _)));
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}
