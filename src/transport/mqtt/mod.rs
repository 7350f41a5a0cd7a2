//! MQTT 3.1.1 session engine
//!
//! Pure pieces are kept apart from the I/O coordinator so they can be tested
//! without a network:
//!
//! - [`codec`] - framing over rumqttc's MQTT 3.1.1 packets
//! - [`frame_buffer`] - bounded reassembly of inbound frames
//! - [`connection`] - session state, reconnect policy and device topics
//! - [`registry`] - subscription table and topic filter matching
//! - [`pending`] - in-flight requests keyed by packet identifier
//! - [`message_handler`] - routing of decoded broker packets
//! - [`health_monitor`] - keep-alive, reconnection decisions and health
//! - [`subscriber`] - callback surface for application code
//! - [`client`] - [`MqttSession`], which ties everything to a transport
//!
//! # Usage
//!
//! ```rust,no_run
//! use iotlink::config::SessionConfig;
//! use iotlink::transport::mqtt::{subscriber_fn, MqttSession, QoS};
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::load_from_file("device.toml".as_ref())?;
//! let session = MqttSession::new(config)?;
//!
//! let driver = session.clone();
//! tokio::spawn(async move {
//!     while driver.run_once(Duration::from_millis(200)).await {}
//! });
//!
//! session.connect().await?;
//! session.subscribe(
//!     "sys/+/+/custom/#",
//!     QoS::AtLeastOnce,
//!     subscriber_fn(|topic, payload| println!("{topic}: {} bytes", payload.len())),
//! )?;
//! session.wait_connected(Duration::from_secs(10)).await?;
//! session.publish("sys/pk/dn/custom/up", r#"{"x":1}"#, QoS::AtLeastOnce)?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod connection;
pub mod frame_buffer;
pub mod health_monitor;
pub mod message_handler;
pub mod pending;
pub mod registry;
pub mod subscriber;

// Re-export public types for convenience
pub use client::MqttSession;
pub use codec::{CodecError, Packet, QoS};
pub use connection::{ReconnectConfig, SessionState, TopicBuilder};
pub use frame_buffer::{AllocationError, FrameBuffer};
pub use health_monitor::{ConnectionQuality, HealthMetrics, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageHandler};
pub use pending::{AckKind, PendingOperation, PendingQueues};
pub use registry::{topic_matches_filter, SubscriptionRegistry, TopicSubscription};
pub use subscriber::{subscriber_fn, FailureReason, SessionEvent, Subscriber};
