//! Pure keep-alive, reconnection and health logic
//!
//! The session client feeds timestamps in and acts on the returned decisions;
//! nothing here sleeps or touches the transport.

use super::connection::{ReconnectConfig, SessionState};
use tokio::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq, Eq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// What the keep-alive tracker wants the loop to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    Idle,
    SendPing,
    /// PINGRESP missing for longer than the grace window
    TimedOut(Duration),
}

/// Tracks outbound idleness and the outstanding ping
#[derive(Debug, Clone)]
pub struct KeepAlive {
    interval: Duration,
    grace: Duration,
    last_sent: Instant,
    ping_sent_at: Option<Instant>,
    pings_sent: u64,
}

impl KeepAlive {
    /// `interval` of zero disables pings entirely
    pub fn new(interval: Duration, grace: Duration, now: Instant) -> Self {
        Self {
            interval,
            grace,
            last_sent: now,
            ping_sent_at: None,
            pings_sent: 0,
        }
    }

    /// Any frame went out
    pub fn record_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }

    pub fn record_ping_sent(&mut self, now: Instant) {
        self.last_sent = now;
        self.ping_sent_at = Some(now);
        self.pings_sent += 1;
    }

    pub fn record_pong(&mut self) {
        self.ping_sent_at = None;
    }

    pub fn ping_outstanding(&self) -> bool {
        self.ping_sent_at.is_some()
    }

    pub fn pings_sent(&self) -> u64 {
        self.pings_sent
    }

    pub fn poll(&self, now: Instant) -> KeepAliveAction {
        if self.interval.is_zero() {
            return KeepAliveAction::Idle;
        }
        if let Some(sent_at) = self.ping_sent_at {
            let waited = now.saturating_duration_since(sent_at);
            if waited >= self.grace {
                return KeepAliveAction::TimedOut(waited);
            }
            return KeepAliveAction::Idle;
        }
        if now.saturating_duration_since(self.last_sent) >= self.interval {
            KeepAliveAction::SendPing
        } else {
            KeepAliveAction::Idle
        }
    }

    /// Next instant at which [`poll`](Self::poll) can change its answer.
    /// None when pings are off or the deadline lies past what `Instant` holds.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.interval.is_zero() {
            return None;
        }
        match self.ping_sent_at {
            Some(sent_at) => sent_at.checked_add(self.grace),
            None => self.last_sent.checked_add(self.interval),
        }
    }
}

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether another reconnect attempt should run
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
    ) -> ReconnectionDecision {
        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = current_attempts.saturating_add(1);
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.calculate_backoff_delay(attempt),
        }
    }

    /// State to enter when the link drops unexpectedly
    pub fn state_after_link_loss(auto_reconnect: bool, attempts: u32) -> SessionState {
        if auto_reconnect {
            SessionState::Reconnecting(attempts)
        } else {
            SessionState::Disconnected
        }
    }

    pub fn can_publish(state: &SessionState) -> bool {
        matches!(state, SessionState::Connected)
    }

    /// Calculate health metrics for the session
    pub fn calculate_health_metrics(
        connect_time: Option<Instant>,
        last_message_time: Option<Instant>,
        reconnect_count: u32,
        stale_after: Duration,
        now: Instant,
    ) -> HealthMetrics {
        let uptime = connect_time.map(|t| now.saturating_duration_since(t));
        let time_since_last_message = last_message_time.map(|t| now.saturating_duration_since(t));
        let is_healthy = Self::determine_health_status(uptime, time_since_last_message, stale_after);

        let mut metrics = HealthMetrics {
            uptime,
            time_since_last_message,
            reconnect_count,
            is_healthy,
            quality: ConnectionQuality::Critical,
        };
        metrics.quality = Self::assess_connection_quality(&metrics);
        metrics
    }

    fn determine_health_status(
        uptime: Option<Duration>,
        time_since_last_message: Option<Duration>,
        stale_after: Duration,
    ) -> bool {
        match (uptime, time_since_last_message) {
            (Some(_), None) => true,
            (Some(_), Some(last)) => last < stale_after,
            _ => false,
        }
    }

    /// Assess connection quality based on metrics
    pub fn assess_connection_quality(metrics: &HealthMetrics) -> ConnectionQuality {
        if !metrics.is_healthy {
            return ConnectionQuality::Critical;
        }

        match (metrics.reconnect_count, metrics.uptime) {
            (0, Some(uptime)) if uptime > Duration::from_secs(3600) => ConnectionQuality::Excellent,
            (0, Some(_)) => ConnectionQuality::Good,
            (1..=2, Some(uptime)) if uptime > Duration::from_secs(1800) => ConnectionQuality::Good,
            (1..=2, Some(_)) => ConnectionQuality::Fair,
            (3..=5, _) => ConnectionQuality::Fair,
            (6..=10, _) => ConnectionQuality::Poor,
            _ => ConnectionQuality::Critical,
        }
    }

    /// Log a state transition at a level matching its severity
    pub fn log_state_transition(from: &SessionState, to: &SessionState) {
        match (from, to) {
            (SessionState::Connecting, SessionState::Connected) => {
                info!(target: "iotlink::session", "MQTT session established");
            }
            (SessionState::Connected, SessionState::Reconnecting(_))
            | (SessionState::Connected, SessionState::Disconnected) => {
                warn!(target: "iotlink::session", from = %from, to = %to, "MQTT link lost");
            }
            (SessionState::Reconnecting(_), SessionState::Disconnected) => {
                error!(target: "iotlink::session", "MQTT reconnection abandoned");
            }
            _ => {
                info!(target: "iotlink::session", from = %from, to = %to, "MQTT session state");
            }
        }
    }
}

/// Health metrics for the session
#[derive(Debug, Clone)]
pub struct HealthMetrics {
    /// Time since the current connection was established
    pub uptime: Option<Duration>,
    /// Time since last inbound frame
    pub time_since_last_message: Option<Duration>,
    /// Successful reconnects since creation
    pub reconnect_count: u32,
    pub is_healthy: bool,
    pub quality: ConnectionQuality,
}

/// Connection quality assessment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_attempt_reconnection() {
        let config = ReconnectConfig::default();

        let decision = HealthMonitor::should_attempt_reconnection(0, &config);
        assert_eq!(
            decision,
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 1000
            }
        );

        let decision = HealthMonitor::should_attempt_reconnection(6, &config);
        assert_eq!(
            decision,
            ReconnectionDecision::Proceed {
                attempt: 7,
                delay_ms: 30_000
            }
        );

        let decision = HealthMonitor::should_attempt_reconnection(10, &config);
        assert_eq!(decision, ReconnectionDecision::AbortMaxAttemptsExceeded);
    }

    #[test]
    fn test_unlimited_attempts() {
        let config = ReconnectConfig {
            max_attempts: None,
            ..ReconnectConfig::default()
        };
        assert!(matches!(
            HealthMonitor::should_attempt_reconnection(10_000, &config),
            ReconnectionDecision::Proceed { .. }
        ));
    }

    #[test]
    fn test_state_after_link_loss() {
        assert_eq!(
            HealthMonitor::state_after_link_loss(true, 0),
            SessionState::Reconnecting(0)
        );
        assert_eq!(
            HealthMonitor::state_after_link_loss(false, 0),
            SessionState::Disconnected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_cycle() {
        let start = Instant::now();
        let mut keep_alive = KeepAlive::new(Duration::from_secs(60), Duration::from_secs(10), start);

        assert_eq!(keep_alive.poll(start + Duration::from_secs(59)), KeepAliveAction::Idle);
        assert_eq!(
            keep_alive.poll(start + Duration::from_secs(60)),
            KeepAliveAction::SendPing
        );

        keep_alive.record_ping_sent(start + Duration::from_secs(60));
        assert!(keep_alive.ping_outstanding());
        assert_eq!(
            keep_alive.next_deadline(),
            Some(start + Duration::from_secs(70))
        );
        assert_eq!(keep_alive.poll(start + Duration::from_secs(69)), KeepAliveAction::Idle);
        assert_eq!(
            keep_alive.poll(start + Duration::from_secs(70)),
            KeepAliveAction::TimedOut(Duration::from_secs(10))
        );

        keep_alive.record_pong();
        assert_eq!(keep_alive.poll(start + Duration::from_secs(70)), KeepAliveAction::Idle);
        assert_eq!(keep_alive.pings_sent(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_traffic_defers_ping() {
        let start = Instant::now();
        let mut keep_alive = KeepAlive::new(Duration::from_secs(60), Duration::from_secs(10), start);
        keep_alive.record_sent(start + Duration::from_secs(30));
        assert_eq!(keep_alive.poll(start + Duration::from_secs(60)), KeepAliveAction::Idle);
        assert_eq!(
            keep_alive.poll(start + Duration::from_secs(90)),
            KeepAliveAction::SendPing
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_disables_pings() {
        let start = Instant::now();
        let keep_alive = KeepAlive::new(Duration::ZERO, Duration::from_secs(10), start);
        assert_eq!(
            keep_alive.poll(start + Duration::from_secs(3600)),
            KeepAliveAction::Idle
        );
        assert_eq!(keep_alive.next_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_durations_have_no_deadline() {
        let start = Instant::now();
        let mut keep_alive = KeepAlive::new(Duration::MAX, Duration::MAX, start);
        assert_eq!(keep_alive.next_deadline(), None);
        assert_eq!(
            keep_alive.poll(start + Duration::from_secs(3600)),
            KeepAliveAction::Idle
        );

        keep_alive.record_ping_sent(start);
        assert_eq!(keep_alive.next_deadline(), None);
        assert_eq!(
            keep_alive.poll(start + Duration::from_secs(3600)),
            KeepAliveAction::Idle
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_metrics() {
        let now = Instant::now();
        let stale_after = Duration::from_secs(300);

        let metrics = HealthMonitor::calculate_health_metrics(None, None, 0, stale_after, now);
        assert!(!metrics.is_healthy);
        assert_eq!(metrics.quality, ConnectionQuality::Critical);

        tokio::time::advance(Duration::from_secs(10)).await;
        let later = Instant::now();
        let metrics =
            HealthMonitor::calculate_health_metrics(Some(now), Some(now), 0, stale_after, later);
        assert!(metrics.is_healthy);
        assert_eq!(metrics.uptime, Some(Duration::from_secs(10)));
        assert_eq!(metrics.quality, ConnectionQuality::Good);

        let metrics = HealthMonitor::calculate_health_metrics(
            Some(now),
            Some(now),
            0,
            Duration::from_secs(5),
            later,
        );
        assert!(!metrics.is_healthy);
    }

    #[test]
    fn test_connection_quality_by_reconnects() {
        let metrics = HealthMetrics {
            uptime: Some(Duration::from_secs(60)),
            time_since_last_message: None,
            reconnect_count: 7,
            is_healthy: true,
            quality: ConnectionQuality::Critical,
        };
        assert_eq!(
            HealthMonitor::assess_connection_quality(&metrics),
            ConnectionQuality::Poor
        );
    }
}
