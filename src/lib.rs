//! iotlink - device-side MQTT session engine
//!
//! Connects an IoT device to its cloud broker over MQTT 3.1.1 and keeps the
//! session alive across link failures.
//!
//! # Overview
//!
//! - Signed credentials for pre-provisioned devices, or a device secret
//!   obtained through dynamic registration
//! - A session state machine with automatic reconnection and backoff
//! - A subscription registry replayed after every successful connect
//! - Tracking of unacknowledged SUBSCRIBE, UNSUBSCRIBE and QoS 1 PUBLISH
//!   requests with timeout and link-loss failure reporting
//! - Keep-alive PINGREQ scheduling and dead-link detection
//! - Plain TCP or TLS transports behind a [`Transport`](transport::Transport) trait
//!
//! # Quick Start
//!
//! ```rust
//! use iotlink::config::SessionConfig;
//! use iotlink::transport::mqtt::{MqttSession, SessionState};
//!
//! let config = SessionConfig::new(
//!     "broker.example.com",
//!     "6788bd810f9bad3f8ef674fa",
//!     "P1-9",
//!     "98cb52e94e437ee407dbed37",
//! );
//! let session = MqttSession::new(config).unwrap();
//! assert_eq!(session.state(), SessionState::Disconnected);
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod observability;
pub mod platform;
pub mod testing;
pub mod transport;

pub use auth::{AuthError, CredentialResolver, Credentials};
pub use config::{AuthMode, ConfigError, SessionConfig};
pub use error::{SessionError, SessionResult};
pub use transport::mqtt::{
    subscriber_fn, FailureReason, MqttSession, QoS, SessionEvent, SessionState, Subscriber,
};
