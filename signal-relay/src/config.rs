//! Configuration loading for signal-relay.
//!
//! Configuration is loaded from a TOML file (default: none, built-in
//! defaults). Every table and key is optional. Values are fixed for the
//! lifetime of the process.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for signal-relay.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener configuration.
    pub server: ServerConfig,
    /// Heartbeat and garbage-collection timing.
    pub signaling: SignalingConfig,
    /// Allowed browser origins.
    pub cors: CorsConfig,
    /// Connection and message caps.
    pub limits: LimitsConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind (default: 0.0.0.0).
    pub host: String,
    /// TCP port for WebSocket and HTTP (default: 8080).
    pub port: u16,
}

/// Heartbeat and timeout configuration, all in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Keep-alive ping cadence (default: 30s).
    pub heartbeat_interval_ms: u64,
    /// Sessions idle longer than this are reaped (default: 5 min).
    pub session_timeout_ms: u64,
    /// Connections silent longer than this are reaped (default: 60s).
    pub client_timeout_ms: u64,
    /// Lifetime of a host-authentication session (default: 5 min).
    pub auth_session_ttl_ms: u64,
}

/// CORS configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Exact origins or single-`*` patterns (default: `["*"]`).
    pub origins: Vec<String>,
}

/// Connection and message caps.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum simultaneously open connections (default: 10000).
    pub max_connections: usize,
    /// Maximum inbound frames per connection per minute (default: 600).
    pub messages_per_minute: u32,
    /// Maximum inbound frame size in bytes (default: 64 KiB).
    pub max_message_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            session_timeout_ms: 5 * 60 * 1000,
            client_timeout_ms: 60_000,
            auth_session_ttl_ms: 5 * 60 * 1000,
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            origins: vec!["*".to_string()],
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            messages_per_minute: 600,
            max_message_bytes: 64 * 1024,
        }
    }
}

impl SignalingConfig {
    /// Keep-alive ping cadence.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Session inactivity threshold.
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// Connection silence threshold.
    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    /// Auth session lifetime.
    pub fn auth_session_ttl(&self) -> Duration {
        Duration::from_millis(self.auth_session_ttl_ms)
    }

    /// Reaper cadence: half the shorter of the two timeouts.
    pub fn reap_interval(&self) -> Duration {
        self.session_timeout().min(self.client_timeout()) / 2
    }
}

impl CorsConfig {
    /// Whether `origin` matches any configured origin or pattern.
    pub fn allows(&self, origin: &str) -> bool {
        self.origins.iter().any(|pattern| origin_matches(pattern, origin))
    }
}

/// `*` alone matches anything; one `*` inside a pattern matches any run of
/// characters at that position; otherwise the match is exact.
fn origin_matches(pattern: &str, origin: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            origin.len() >= prefix.len() + suffix.len()
                && origin.starts_with(prefix)
                && origin.ends_with(suffix)
        }
        None => pattern == origin,
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall timers or block every client.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.signaling;
        for (name, value) in [
            ("signaling.heartbeat_interval_ms", s.heartbeat_interval_ms),
            ("signaling.session_timeout_ms", s.session_timeout_ms),
            ("signaling.client_timeout_ms", s.client_timeout_ms),
            ("signaling.auth_session_ttl_ms", s.auth_session_ttl_ms),
            ("limits.max_connections", self.limits.max_connections as u64),
            ("limits.messages_per_minute", u64::from(self.limits.messages_per_minute)),
            ("limits.max_message_bytes", self.limits.max_message_bytes as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field: name,
                    reason: "must be greater than zero",
                });
            }
        }
        Ok(())
    }

    /// `host:port` string for the listener.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid config value {field}: {reason}")]
    Invalid {
        /// Dotted key of the offending value.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.signaling.heartbeat_interval_ms, 30_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn reap_interval_is_half_the_shorter_timeout() {
        let signaling = SignalingConfig {
            session_timeout_ms: 300_000,
            client_timeout_ms: 60_000,
            ..SignalingConfig::default()
        };
        assert_eq!(signaling.reap_interval(), Duration::from_secs(30));
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[server]
host = "127.0.0.1"
port = 9000

[signaling]
heartbeat_interval_ms = 10000
session_timeout_ms = 120000

[cors]
origins = ["https://app.example.com"]

[limits]
messages_per_minute = 30
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.bind_address(), "127.0.0.1:9000");
        assert_eq!(config.signaling.heartbeat_interval_ms, 10_000);
        assert_eq!(config.signaling.session_timeout_ms, 120_000);
        assert_eq!(config.signaling.client_timeout_ms, 60_000);
        assert_eq!(config.cors.origins, vec!["https://app.example.com"]);
        assert_eq!(config.limits.messages_per_minute, 30);
        assert_eq!(config.limits.max_connections, 10_000);
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.cors.origins, vec!["*"]);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut config = Config::default();
        config.signaling.client_timeout_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("signaling.client_timeout_ms"));
    }

    #[test]
    fn from_file_reads_and_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 7001").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.server.port, 7001);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "[limits]\nmax_connections = 0").unwrap();
        assert!(matches!(
            Config::from_file(bad.path()),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn from_file_missing_path_errors() {
        let err = Config::from_file(std::path::Path::new("/nonexistent/relay.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[test]
    fn cors_patterns() {
        let cors = CorsConfig {
            origins: vec![
                "http://localhost:3000".to_string(),
                "https://*.example.com".to_string(),
            ],
        };
        assert!(cors.allows("http://localhost:3000"));
        assert!(cors.allows("https://app.example.com"));
        assert!(!cors.allows("https://example.org"));
        assert!(!cors.allows("http://localhost:3001"));

        let any = CorsConfig::default();
        assert!(any.allows("https://anything.test"));
    }
}
