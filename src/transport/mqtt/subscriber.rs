//! Callback surface between the session and application code
//!
//! A [`Subscriber`] replaces the message callback, event callback and opaque
//! user data of a C-style topic map: state the callbacks need lives inside
//! the implementing type.

use super::codec::QoS;
use std::fmt;
use std::sync::Arc;

/// Why an outstanding operation failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Broker refused the request (SUBACK failure code)
    Rejected,
    /// Link went down before the acknowledgment arrived
    Disconnected,
    /// No acknowledgment within the ack timeout
    AckTimeout,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Rejected => f.write_str("rejected by broker"),
            FailureReason::Disconnected => f.write_str("connection lost"),
            FailureReason::AckTimeout => f.write_str("acknowledgment timeout"),
        }
    }
}

/// Events reported to subscribers and the session listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected { reason: String },
    Reconnecting { attempt: u32 },
    /// Terminal: reconnect attempts exhausted or the initial connect failed
    ConnectionFailed { reason: String },
    Subscribed { topic: String, granted_qos: QoS },
    SubscribeFailed { topic: String, reason: FailureReason },
    Unsubscribed { topic: String },
    Published { packet_id: u16, topic: String },
    PublishFailed {
        packet_id: u16,
        topic: String,
        reason: FailureReason,
    },
}

impl SessionEvent {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            SessionEvent::ConnectionFailed { .. }
                | SessionEvent::SubscribeFailed { .. }
                | SessionEvent::PublishFailed { .. }
        )
    }
}

/// Receives inbound messages and operation outcomes.
///
/// Called from the task driving [`run_once`](super::MqttSession::run_once),
/// never while an internal lock is held, so implementations may call back
/// into the session.
pub trait Subscriber: Send + Sync {
    fn on_message(&self, topic: &str, payload: &[u8]);

    fn on_event(&self, event: &SessionEvent) {
        let _ = event;
    }
}

/// Adapter turning a closure into a message-only [`Subscriber`]
pub struct FnSubscriber<F>(F);

impl<F> Subscriber for FnSubscriber<F>
where
    F: Fn(&str, &[u8]) + Send + Sync,
{
    fn on_message(&self, topic: &str, payload: &[u8]) {
        (self.0)(topic, payload)
    }
}

pub fn subscriber_fn<F>(f: F) -> Arc<dyn Subscriber>
where
    F: Fn(&str, &[u8]) + Send + Sync + 'static,
{
    Arc::new(FnSubscriber(f))
}
