use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use harmony_storage::{RetryPolicy, StorageSettings};
use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize};

use crate::chat::ChatSettings;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid bind address: {0}")]
    InvalidBindAddr(String),
    #[error("invalid configuration value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind_addr: Option<String>,
}

/// Cross-process message bus. Without a `url` an in-process bus is used.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct BusConfig {
    pub url: Option<String>,
    pub listen: bool,
    pub stall_timeout_ms: u64,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    pub retry_retries: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: None,
            listen: true,
            stall_timeout_ms: 250,
            retry_base_ms: 1_000,
            retry_cap_ms: 10_000,
            retry_retries: 3,
        }
    }
}

impl BusConfig {
    pub fn connect_retry(&self) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(self.retry_base_ms),
            cap: Duration::from_millis(self.retry_cap_ms),
            max_retries: Some(self.retry_retries),
        }
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChatConfig {
    pub max_users_per_operation: usize,
    pub default_history_limit: usize,
    pub max_history_limit: usize,
    pub max_content_chars: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        let settings = ChatSettings::default();
        Self {
            max_users_per_operation: settings.max_users_per_operation,
            default_history_limit: settings.default_history_limit,
            max_history_limit: settings.max_history_limit,
            max_content_chars: settings.max_content_chars,
        }
    }
}

impl ChatConfig {
    pub fn settings(&self) -> ChatSettings {
        ChatSettings {
            max_users_per_operation: self.max_users_per_operation,
            default_history_limit: self.default_history_limit,
            max_history_limit: self.max_history_limit,
            max_content_chars: self.max_content_chars,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub batch_chunk_size: usize,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    /// Zero retries until the store accepts the request.
    pub max_retries: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            batch_chunk_size: 25,
            retry_base_ms: 500,
            retry_cap_ms: 8_000,
            max_retries: 5,
        }
    }
}

impl StorageConfig {
    pub fn settings(&self) -> StorageSettings {
        StorageSettings {
            retry: RetryPolicy {
                base: Duration::from_millis(self.retry_base_ms),
                cap: Duration::from_millis(self.retry_cap_ms),
                max_retries: (self.max_retries > 0).then_some(self.max_retries),
            },
            batch_chunk_size: self.batch_chunk_size,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct SessionConfig {
    /// URL-safe base64 of a 32-byte ed25519 seed.
    pub signing_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: Option<String>,
    pub host: String,
    pub port: u16,
    pub server_name: String,
    pub log_format: LogFormat,
    pub metrics: MetricsConfig,
    pub database_url: Option<String>,
    pub bus: BusConfig,
    pub chat: ChatConfig,
    pub storage: StorageConfig,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            host: "0.0.0.0".to_string(),
            port: 8080,
            server_name: "localhost".to_string(),
            log_format: LogFormat::Compact,
            metrics: MetricsConfig::default(),
            database_url: None,
            bus: BusConfig::default(),
            chat: ChatConfig::default(),
            storage: StorageConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

/// Values supplied on the command line; each one wins over every other source.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind_addr: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub server_name: Option<String>,
    pub log_format: Option<LogFormat>,
    pub metrics_enabled: Option<bool>,
    pub metrics_bind_addr: Option<String>,
    pub database_url: Option<String>,
    pub bus_url: Option<String>,
    pub bus_listen: Option<bool>,
    pub session_signing_key: Option<String>,
    pub max_users_per_operation: Option<usize>,
}

impl ServerConfig {
    const ENV_PREFIX: &'static str = "HARMONY_SERVER";

    pub fn load() -> Result<Self, ConfigError> {
        let defaults = ServerConfig::default();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/server").required(false))
            .add_source(config::File::with_name("config/server.local").required(false))
            .add_source(
                config::Environment::with_prefix(Self::ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_default("host", defaults.host.clone())?
            .set_default("port", defaults.port as i64)?
            .set_default("server_name", defaults.server_name.clone())?
            .set_default("log_format", defaults.log_format.as_str())?
            .set_default("metrics.enabled", defaults.metrics.enabled)?
            .set_default("bus.listen", defaults.bus.listen)?;

        let settings: ServerConfig = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// `HARMONY_SERVER__*` variables present in the process environment.
    pub fn environment_override_keys() -> Vec<String> {
        let prefix = format!("{}__", Self::ENV_PREFIX);
        let mut keys: Vec<String> = env::vars()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with(&prefix))
            .collect();
        keys.sort();
        keys
    }

    pub fn apply_overrides(&mut self, overrides: &CliOverrides) -> Result<(), ConfigError> {
        if let Some(bind_addr) = &overrides.bind_addr {
            self.bind_addr = Some(bind_addr.clone());
        }
        if let Some(host) = &overrides.host {
            self.host = host.clone();
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(server_name) = &overrides.server_name {
            self.server_name = server_name.clone();
        }
        if let Some(log_format) = overrides.log_format {
            self.log_format = log_format;
        }
        if let Some(enabled) = overrides.metrics_enabled {
            self.metrics.enabled = enabled;
        }
        if let Some(addr) = &overrides.metrics_bind_addr {
            self.metrics.bind_addr = Some(addr.clone());
        }
        if let Some(url) = &overrides.database_url {
            self.database_url = Some(url.clone());
        }
        if let Some(url) = &overrides.bus_url {
            self.bus.url = Some(url.clone());
        }
        if let Some(listen) = overrides.bus_listen {
            self.bus.listen = listen;
        }
        if let Some(key) = &overrides.session_signing_key {
            self.session.signing_key = Some(key.clone());
        }
        if let Some(max) = overrides.max_users_per_operation {
            self.chat.max_users_per_operation = max;
        }
        self.validate()
    }

    pub fn listener_addr(&self) -> Result<SocketAddr, ConfigError> {
        if let Some(addr) = &self.bind_addr {
            return addr
                .parse()
                .map_err(|_| ConfigError::InvalidBindAddr(addr.clone()));
        }

        let addr = format!("{}:{}", self.host, self.port);
        addr.parse().map_err(|_| ConfigError::InvalidBindAddr(addr))
    }

    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidBindAddr("port cannot be zero".into()));
        }
        if let Some(addr) = &self.metrics.bind_addr {
            addr.parse::<SocketAddr>()
                .map_err(|_| ConfigError::InvalidBindAddr(addr.clone()))?;
        }
        if self.chat.max_users_per_operation == 0 {
            return Err(ConfigError::InvalidValue {
                key: "chat.max_users_per_operation",
                reason: "must be at least 1".into(),
            });
        }
        if self.chat.max_history_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "chat.max_history_limit",
                reason: "must be at least 1".into(),
            });
        }
        if self.chat.default_history_limit > self.chat.max_history_limit {
            return Err(ConfigError::InvalidValue {
                key: "chat.default_history_limit",
                reason: format!(
                    "{} exceeds chat.max_history_limit ({})",
                    self.chat.default_history_limit, self.chat.max_history_limit
                ),
            });
        }
        if self.storage.batch_chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "storage.batch_chunk_size",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Compact => "compact",
            LogFormat::Json => "json",
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            other => Err(format!("unsupported log format '{other}'")),
        }
    }
}

impl<'de> Deserialize<'de> for LogFormat {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        LogFormat::from_str(&value).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    fn defaults_match_expectations() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.log_format, LogFormat::Compact);
        assert!(!config.metrics.enabled);
        assert!(config.bus.listen);
        assert_eq!(config.bus.stall_timeout(), Duration::from_millis(250));
        assert_eq!(config.chat.max_users_per_operation, 10);
        assert_eq!(config.storage.batch_chunk_size, 25);
    }

    #[test]
    #[serial]
    fn environment_overrides_take_effect() {
        env::set_var("HARMONY_SERVER__HOST", "127.0.0.1");
        env::set_var("HARMONY_SERVER__PORT", "9090");
        env::set_var("HARMONY_SERVER__LOG_FORMAT", "json");
        env::set_var("HARMONY_SERVER__BUS__URL", "redis://127.0.0.1:6379");
        env::set_var("HARMONY_SERVER__CHAT__MAX_USERS_PER_OPERATION", "4");

        let config = ServerConfig::load().expect("config loads");
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9090);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.bus.url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(config.chat.max_users_per_operation, 4);

        let keys = ServerConfig::environment_override_keys();
        assert!(keys.contains(&"HARMONY_SERVER__BUS__URL".to_string()));
        assert!(keys.windows(2).all(|pair| pair[0] <= pair[1]));

        env::remove_var("HARMONY_SERVER__HOST");
        env::remove_var("HARMONY_SERVER__PORT");
        env::remove_var("HARMONY_SERVER__LOG_FORMAT");
        env::remove_var("HARMONY_SERVER__BUS__URL");
        env::remove_var("HARMONY_SERVER__CHAT__MAX_USERS_PER_OPERATION");
    }

    #[test]
    #[serial]
    fn listener_addr_prefers_bind_addr() {
        env::set_var("HARMONY_SERVER__BIND_ADDR", "192.168.1.20:5555");

        let config = ServerConfig::load().expect("config loads");
        let addr = config.listener_addr().expect("valid addr");
        assert_eq!(addr.to_string(), "192.168.1.20:5555");

        env::remove_var("HARMONY_SERVER__BIND_ADDR");
    }

    #[test]
    fn listener_addr_composes_host_and_port() {
        let config = ServerConfig {
            host: "10.0.0.2".into(),
            port: 7000,
            ..ServerConfig::default()
        };

        let addr = config.listener_addr().expect("valid addr");
        assert_eq!(addr.to_string(), "10.0.0.2:7000");
    }

    #[test]
    #[serial]
    fn invalid_bind_addr_returns_error() {
        env::set_var("HARMONY_SERVER__BIND_ADDR", "::invalid::");

        let config = ServerConfig::load().expect("config loads");
        let err = config.listener_addr().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBindAddr(_)));

        env::remove_var("HARMONY_SERVER__BIND_ADDR");
    }

    #[test]
    fn validate_rejects_inconsistent_history_limits() {
        let mut config = ServerConfig::default();
        config.chat.default_history_limit = 500;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "chat.default_history_limit",
                ..
            }
        ));
    }

    #[test]
    fn validate_rejects_zero_user_cap_and_chunk_size() {
        let mut config = ServerConfig::default();
        config.chat.max_users_per_operation = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.storage.batch_chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn storage_zero_retries_means_unbounded() {
        let mut config = StorageConfig::default();
        assert_eq!(config.settings().retry.max_retries, Some(5));
        config.max_retries = 0;
        assert_eq!(config.settings().retry.max_retries, None);
    }

    #[test]
    fn apply_overrides_revalidates() {
        let mut config = ServerConfig::default();
        let overrides = CliOverrides {
            max_users_per_operation: Some(0),
            ..CliOverrides::default()
        };
        assert!(config.apply_overrides(&overrides).is_err());
    }
}
