//! Session configuration
//!
//! A [`SessionConfig`] is supplied once at session construction and never
//! mutated afterwards. It is usually loaded from a TOML file with four
//! sections:
//!
//! ```toml
//! [broker]
//! host = "6784dcf26c8dc8689881e67d.cn-shanghai.iot.volces.com"
//! tls = true
//!
//! [device]
//! product_key = "6788bd810f9bad3f8ef674fa"
//! device_name = "P1-9"
//! device_secret = "..."
//! auth_mode = "device_secret"
//!
//! [session]
//! keep_alive_secs = 60
//!
//! [reconnect]
//! max_attempts = 10
//! ```

use crate::transport::mqtt::connection::ReconnectConfig;
use crate::transport::Endpoint;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Upper bound for every session timeout, one day
pub const MAX_TIMEOUT_SECS: u64 = 86_400;

/// Complete session configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    pub broker: BrokerSection,
    pub device: DeviceSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

/// Broker endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker host name or address
    pub host: String,
    /// Broker port; defaults to 1883, or 8883 when TLS is enabled
    pub port: Option<u16>,
    /// Negotiate TLS on the broker connection
    #[serde(default)]
    pub tls: bool,
    /// PEM bundle used instead of the built-in web PKI roots
    pub ca_path: Option<PathBuf>,
    /// Verify the broker certificate chain
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    /// Override for the MQTT client identifier
    pub client_id: Option<String>,
}

/// How the device proves its identity to the broker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Pre-provisioned per-device secret
    #[default]
    DeviceSecret,
    /// Device exists in the cloud; secret is fetched with the product secret
    DynamicPreRegistered,
    /// Device is created on first registration
    DynamicNoPreRegistered,
}

impl AuthMode {
    /// Numeric code carried in signatures and registration headers
    pub fn code(self) -> u8 {
        match self {
            AuthMode::DeviceSecret => 0,
            AuthMode::DynamicPreRegistered => 1,
            AuthMode::DynamicNoPreRegistered => 2,
        }
    }

    pub fn is_dynamic(self) -> bool {
        !matches!(self, AuthMode::DeviceSecret)
    }
}

/// Device identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    pub product_key: String,
    /// Device name; falls back to the hardware id when empty
    #[serde(default)]
    pub device_name: String,
    pub device_secret: Option<String>,
    pub product_secret: Option<String>,
    pub instance_id: Option<String>,
    #[serde(default)]
    pub auth_mode: AuthMode,
    /// Registration service base URL, e.g. `https://iot-cn-shanghai.iot.volces.com`
    pub http_host: Option<String>,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    pub ca_path: Option<PathBuf>,
}

/// Session timing and behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u16,
    /// Idle interval before a PINGREQ; defaults to the keep-alive
    pub ping_interval_secs: Option<u64>,
    /// Grace window for the PINGRESP
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    #[serde(default = "default_true")]
    pub clean_session: bool,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            keep_alive_secs: default_keep_alive(),
            ping_interval_secs: None,
            ping_timeout_secs: default_ping_timeout(),
            ack_timeout_secs: default_ack_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            auto_reconnect: true,
            max_packet_size: default_max_packet_size(),
            clean_session: true,
        }
    }
}

/// Reconnect policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    /// Attempts before giving up; `0` means unlimited
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: Vec<u64>,
    /// Delay once the backoff pattern is exhausted
    #[serde(default = "default_sustained_delay")]
    pub sustained_delay_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            sustained_delay_ms: default_sustained_delay(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_keep_alive() -> u16 {
    60
}

fn default_ping_timeout() -> u64 {
    10
}

fn default_ack_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_packet_size() -> usize {
    256 * 1024
}

fn default_max_attempts() -> u32 {
    10
}

fn default_backoff_ms() -> Vec<u64> {
    vec![1000, 2000, 4000, 8000, 16000]
}

fn default_sustained_delay() -> u64 {
    30_000
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SessionConfig {
    /// Minimal configuration for a pre-provisioned device
    pub fn new(
        host: impl Into<String>,
        product_key: impl Into<String>,
        device_name: impl Into<String>,
        device_secret: impl Into<String>,
    ) -> Self {
        Self {
            broker: BrokerSection {
                host: host.into(),
                port: None,
                tls: false,
                ca_path: None,
                verify_ssl: true,
                client_id: None,
            },
            device: DeviceSection {
                product_key: product_key.into(),
                device_name: device_name.into(),
                device_secret: Some(device_secret.into()),
                product_secret: None,
                instance_id: None,
                auth_mode: AuthMode::DeviceSecret,
                http_host: None,
                verify_ssl: true,
                ca_path: None,
            },
            session: SessionSection::default(),
            reconnect: ReconnectSection::default(),
        }
    }

    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: SessionConfig = toml::from_str(content)?;
        config.resolve_env_secrets()?;
        config.validate()?;
        Ok(config)
    }

    /// Secrets written as `env:NAME` are read from the environment
    fn resolve_env_secrets(&mut self) -> Result<(), ConfigError> {
        for secret in [
            &mut self.device.device_secret,
            &mut self.device.product_secret,
        ] {
            if let Some(value) = secret.as_ref() {
                if let Some(name) = value.strip_prefix("env:") {
                    let resolved = std::env::var(name)
                        .map_err(|_| ConfigError::EnvVarNotFound(name.to_string()))?;
                    *secret = Some(resolved);
                }
            }
        }
        Ok(())
    }

    /// Check field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker.host must not be empty".to_string(),
            ));
        }

        validate_identifier("device.product_key", &self.device.product_key)?;
        if !self.device.device_name.is_empty() {
            validate_identifier("device.device_name", &self.device.device_name)?;
        }

        match self.device.auth_mode {
            AuthMode::DeviceSecret => {
                if self.device.device_secret.as_deref().unwrap_or("").is_empty() {
                    return Err(ConfigError::InvalidConfig(
                        "auth_mode device_secret requires device.device_secret".to_string(),
                    ));
                }
                if self.device.device_name.is_empty() {
                    return Err(ConfigError::InvalidConfig(
                        "auth_mode device_secret requires device.device_name".to_string(),
                    ));
                }
            }
            AuthMode::DynamicPreRegistered | AuthMode::DynamicNoPreRegistered => {
                if self.device.product_secret.as_deref().unwrap_or("").len() < 16 {
                    return Err(ConfigError::InvalidConfig(
                        "dynamic registration requires a product_secret of at least 16 characters"
                            .to_string(),
                    ));
                }
                if self.device.http_host.as_deref().unwrap_or("").is_empty() {
                    return Err(ConfigError::InvalidConfig(
                        "dynamic registration requires device.http_host".to_string(),
                    ));
                }
            }
        }

        if self.session.keep_alive_secs == 0 && self.session.ping_interval_secs.unwrap_or(0) > 0 {
            return Err(ConfigError::InvalidConfig(
                "ping_interval_secs requires a non-zero keep_alive_secs".to_string(),
            ));
        }

        if let Some(ping) = self.session.ping_interval_secs {
            if ping > u64::from(self.session.keep_alive_secs) {
                return Err(ConfigError::InvalidConfig(format!(
                    "ping_interval_secs ({ping}) must not exceed keep_alive_secs ({})",
                    self.session.keep_alive_secs
                )));
            }
        }

        for (field, secs) in [
            ("session.ping_timeout_secs", self.session.ping_timeout_secs),
            ("session.ack_timeout_secs", self.session.ack_timeout_secs),
            ("session.connect_timeout_secs", self.session.connect_timeout_secs),
        ] {
            if secs == 0 || secs > MAX_TIMEOUT_SECS {
                return Err(ConfigError::InvalidConfig(format!(
                    "{field} must be between 1 and {MAX_TIMEOUT_SECS}, got {secs}"
                )));
            }
        }

        if self.session.max_packet_size < 128 {
            return Err(ConfigError::InvalidConfig(
                "max_packet_size must be at least 128 bytes".to_string(),
            ));
        }

        if self.reconnect.sustained_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.sustained_delay_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Broker port with the TLS-dependent default applied
    pub fn port(&self) -> u16 {
        self.broker
            .port
            .unwrap_or(if self.broker.tls { 8883 } else { 1883 })
    }

    /// Transport endpoint derived from the broker section
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.broker.host.clone(),
            port: self.port(),
            tls: self.broker.tls,
            ca_path: self.broker.ca_path.clone(),
            verify_ssl: self.broker.verify_ssl,
            connect_timeout: self.connect_timeout(),
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(u64::from(self.session.keep_alive_secs))
    }

    pub fn ping_interval(&self) -> Duration {
        self.session
            .ping_interval_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.keep_alive())
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.session.ping_timeout_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.session.ack_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.session.connect_timeout_secs)
    }

    /// Reconnect policy in the form the health monitor consumes
    pub fn reconnect_policy(&self) -> ReconnectConfig {
        ReconnectConfig {
            max_attempts: match self.reconnect.max_attempts {
                0 => None,
                n => Some(n),
            },
            backoff_pattern: self.reconnect.backoff_ms.clone(),
            sustained_delay: self.reconnect.sustained_delay_ms,
        }
    }

    /// Copy safe for display: secrets replaced with a marker
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        let mask = |s: &mut Option<String>| {
            if s.is_some() {
                *s = Some("***".to_string());
            }
        };
        mask(&mut copy.device.device_secret);
        mask(&mut copy.device.product_secret);
        copy
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[broker]
host = "localhost"

[device]
product_key = "6788bd810f9bad3f8ef674fa"
device_name = "P1-9"
device_secret = "98cb52e94e437ee407dbed37"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Product keys and device names appear inside topics and the client id
fn validate_identifier(field: &str, value: &str) -> Result<(), ConfigError> {
    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ':' | '@'));

    if value.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidConfig(format!(
            "{field} '{value}' must match pattern [a-zA-Z0-9._:@-]+"
        )));
    }

    Ok(())
}
