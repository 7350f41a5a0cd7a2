//! Pure session state, reconnect policy and topic construction
//!
//! Nothing in this module performs I/O; the session client consumes these
//! types to decide what to do next.

use std::fmt;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport open
    Disconnected,
    /// Transport open, CONNECT sent, waiting for CONNACK
    Connecting,
    /// CONNACK accepted; publish and subscribe traffic flows
    Connected,
    /// Graceful teardown in progress
    Disconnecting,
    /// Link lost; reconnect attempt `n` is scheduled or running
    Reconnecting(u32),
    /// Session was deinitialized; every operation fails
    Terminated,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "Disconnected",
            SessionState::Connecting => "Connecting",
            SessionState::Connected => "Connected",
            SessionState::Disconnecting => "Disconnecting",
            SessionState::Reconnecting(_) => "Reconnecting",
            SessionState::Terminated => "Terminated",
        }
    }

    /// States in which a transport handle is open
    pub fn has_link(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Connected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Reconnecting(attempt) => write!(f, "Reconnecting({attempt})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds, one entry per attempt
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(10),
            backoff_pattern: vec![1000, 2000, 4000, 8000, 16000],
            sustained_delay: 30_000,
        }
    }
}

impl ReconnectConfig {
    /// Worst-case time spent across all attempts, None when unlimited
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    /// Backoff before `attempt` (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// Device topic tree: `sys/{product_key}/{device_name}/...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    product_key: String,
    device_name: String,
}

impl TopicBuilder {
    pub fn new(product_key: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            product_key: product_key.into(),
            device_name: device_name.into(),
        }
    }

    fn prefix(&self) -> String {
        format!("sys/{}/{}", self.product_key, self.device_name)
    }

    /// Property-set service: `sys/{pk}/{dn}/thingmodel/service/{module}/propertySet/post`
    ///
    /// Pass `"+"` as the module to subscribe to every module at once.
    pub fn property_set(&self, module: &str) -> String {
        format!("{}/thingmodel/service/{module}/propertySet/post", self.prefix())
    }

    /// Property-set reply: `sys/{pk}/{dn}/thingmodel/service/{module}/propertySet/post_reply`
    pub fn property_set_reply(&self, module: &str) -> String {
        format!(
            "{}/thingmodel/service/{module}/propertySet/post_reply",
            self.prefix()
        )
    }

    /// Property report: `sys/{pk}/{dn}/thingmodel/property/post`
    pub fn property_report(&self) -> String {
        format!("{}/thingmodel/property/post", self.prefix())
    }

    /// Application-defined topic: `sys/{pk}/{dn}/custom/{suffix}`
    pub fn custom(&self, suffix: &str) -> String {
        format!("{}/custom/{}", self.prefix(), suffix.trim_start_matches('/'))
    }

    /// OTA job notifications: `sys/{pk}/{dn}/ota/notify/+`
    pub fn ota_notify(&self) -> String {
        format!("{}/ota/notify/+", self.prefix())
    }

    /// OTA upgrade progress report: `sys/{pk}/{dn}/ota/progress/{job_id}`
    pub fn ota_progress(&self, job_id: &str) -> String {
        format!("{}/ota/progress/{job_id}", self.prefix())
    }

    /// OTA version report: `sys/{pk}/{dn}/ota/version`
    pub fn ota_version(&self) -> String {
        format!("{}/ota/version", self.prefix())
    }

    /// Batched log upload: `sys/{pk}/{dn}/log/batch/report`
    pub fn log_report(&self) -> String {
        format!("{}/log/batch/report", self.prefix())
    }

    /// Log level configuration pushed by the cloud: `sys/{pk}/{dn}/log/batch/config`
    pub fn log_config(&self) -> String {
        format!("{}/log/batch/config", self.prefix())
    }
}
