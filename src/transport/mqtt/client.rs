//! Session engine: lifecycle, public operations and the event loop
//!
//! [`MqttSession`] is shared as `Arc<MqttSession>` between application code
//! and exactly one task that repeatedly awaits [`MqttSession::run_once`].
//! Application calls never perform network I/O themselves: they update the
//! registry and pending tables and append frames to an outbox that the loop
//! flushes, waking it through a [`Notify`].
//!
//! Lock order is registry, then pending, then outbox. The transport lock is
//! only taken by `connect`, `disconnect`, `deinit` and the loop. User
//! callbacks run after every internal guard has been dropped.

use super::codec::{self, Packet, QoS};
use super::connection::{ReconnectConfig, SessionState};
use super::frame_buffer::FrameBuffer;
use super::health_monitor::{
    HealthMetrics, HealthMonitor, KeepAlive, KeepAliveAction, ReconnectionDecision,
};
use super::message_handler::{EventRoute, MessageHandler};
use super::pending::{PendingOperation, PendingQueues};
use super::registry::{validate_filter, validate_topic, SubscriptionRegistry, TopicSubscription};
use super::subscriber::{FailureReason, SessionEvent, Subscriber};
use crate::auth::{CredentialResolver, Credentials};
use crate::config::SessionConfig;
use crate::error::{sanitize_error_message, SessionError, SessionResult};
use crate::mqtt_span;
use crate::transport::{SendStatus, TcpTransport, Transport, TransportError, TransportEvent};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// Callback work collected under locks and delivered after they are released
enum Notification {
    Message {
        targets: Vec<Arc<dyn Subscriber>>,
        topic: String,
        payload: Bytes,
    },
    /// `target` of None goes to the session listener
    Event {
        target: Option<Arc<dyn Subscriber>>,
        event: SessionEvent,
    },
}

impl Notification {
    fn listener(event: SessionEvent) -> Self {
        Notification::Event {
            target: None,
            event,
        }
    }
}

/// Per-link bookkeeping owned by the loop
struct LinkTracker {
    inbound: FrameBuffer,
    keep_alive: KeepAlive,
    connect_started: Option<Instant>,
    connected_at: Option<Instant>,
    last_message_at: Option<Instant>,
    /// Attempt number of the reconnect that opened the current link; 0 for
    /// an application `connect()`
    reconnect_attempt: u32,
    reconnect_count: u32,
}

impl LinkTracker {
    fn reset(&mut self, keep_alive: KeepAlive) {
        self.inbound.clear();
        self.keep_alive = keep_alive;
        self.connect_started = None;
        self.connected_at = None;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Device MQTT session
pub struct MqttSession {
    config: SessionConfig,
    reconnect_policy: ReconnectConfig,
    resolver: CredentialResolver,
    credentials: tokio::sync::Mutex<Option<Credentials>>,
    transport: tokio::sync::Mutex<Box<dyn Transport>>,
    state_tx: watch::Sender<SessionState>,
    registry: Mutex<SubscriptionRegistry>,
    pending: Mutex<PendingQueues>,
    outbox: Mutex<VecDeque<Bytes>>,
    wake: Notify,
    link: Mutex<LinkTracker>,
    listener: Mutex<Option<Arc<dyn Subscriber>>>,
}

impl MqttSession {
    /// Session over TCP/TLS with credentials derived from `config`
    pub fn new(config: SessionConfig) -> SessionResult<Arc<Self>> {
        let resolver = CredentialResolver::new(config.clone());
        Self::with_transport(config, Box::new(TcpTransport::new()), resolver)
    }

    /// Session over a caller-supplied transport and resolver
    pub fn with_transport(
        config: SessionConfig,
        transport: Box<dyn Transport>,
        resolver: CredentialResolver,
    ) -> SessionResult<Arc<Self>> {
        config.validate()?;

        let keep_alive = KeepAlive::new(
            config.ping_interval(),
            config.ping_timeout(),
            Instant::now(),
        );
        let (state_tx, _) = watch::channel(SessionState::Disconnected);

        Ok(Arc::new(Self {
            reconnect_policy: config.reconnect_policy(),
            link: Mutex::new(LinkTracker {
                inbound: FrameBuffer::new(config.session.max_packet_size),
                keep_alive,
                connect_started: None,
                connected_at: None,
                last_message_at: None,
                reconnect_attempt: 0,
                reconnect_count: 0,
            }),
            config,
            resolver,
            credentials: tokio::sync::Mutex::new(None),
            transport: tokio::sync::Mutex::new(transport),
            state_tx,
            registry: Mutex::new(SubscriptionRegistry::new()),
            pending: Mutex::new(PendingQueues::new()),
            outbox: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            listener: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Watch every state transition
    pub fn state_receiver(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Receives lifecycle events and outcomes of operations without their
    /// own observer
    pub fn set_event_listener(&self, listener: Arc<dyn Subscriber>) {
        *lock(&self.listener) = Some(listener);
    }

    /// Registered topic filters in replay order
    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.registry).filters()
    }

    /// Requests still waiting for a broker acknowledgment
    pub fn pending_operations(&self) -> usize {
        lock(&self.pending).len()
    }

    /// PINGREQs sent on the current link
    pub fn pings_sent(&self) -> u64 {
        lock(&self.link).keep_alive.pings_sent()
    }

    pub fn health(&self) -> HealthMetrics {
        let stale_after = match self
            .config
            .ping_interval()
            .checked_add(self.config.ping_timeout())
        {
            Some(d) if !d.is_zero() => d,
            _ => Duration::MAX,
        };
        let link = lock(&self.link);
        HealthMonitor::calculate_health_metrics(
            link.connected_at,
            link.last_message_at,
            link.reconnect_count,
            stale_after,
            Instant::now(),
        )
    }

    /// Wait until the session is `Connected`, or fails to get there
    pub async fn wait_connected(&self, timeout: Duration) -> SessionResult<()> {
        let mut rx = self.state_tx.subscribe();
        let settled = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| {
                matches!(
                    s,
                    SessionState::Connected | SessionState::Disconnected | SessionState::Terminated
                )
            }),
        )
        .await;

        match settled {
            Ok(Ok(state)) => match *state {
                SessionState::Connected => Ok(()),
                SessionState::Terminated => Err(SessionError::Terminated),
                other => Err(SessionError::NotConnected { state: other }),
            },
            Ok(Err(_)) => Err(SessionError::Terminated),
            Err(_) => Err(SessionError::connect(format!(
                "not connected after {timeout:?}"
            ))),
        }
    }

    /// Compare-and-set on the state; returns the previous state or the one
    /// that blocked the transition
    fn transition<F>(&self, to: SessionState, allowed: F) -> Result<SessionState, SessionState>
    where
        F: Fn(&SessionState) -> bool,
    {
        let mut outcome = Err(to);
        self.state_tx.send_if_modified(|current| {
            if allowed(current) {
                let from = std::mem::replace(current, to);
                if from != to {
                    HealthMonitor::log_state_transition(&from, &to);
                }
                outcome = Ok(from);
                true
            } else {
                outcome = Err(*current);
                false
            }
        });
        outcome
    }

    fn ensure_live(&self) -> SessionResult<()> {
        if self.state() == SessionState::Terminated {
            return Err(SessionError::Terminated);
        }
        Ok(())
    }

    /// Open the link and send CONNECT.
    ///
    /// Requires `Disconnected`. Returns once CONNECT is on its way; the loop
    /// completes the transition to `Connected` when CONNACK arrives.
    pub async fn connect(&self) -> SessionResult<()> {
        self.ensure_live()?;
        self.transition(SessionState::Connecting, |s| *s == SessionState::Disconnected)
            .map_err(|actual| SessionError::StateConflict {
                expected: "Disconnected",
                actual,
            })?;
        lock(&self.link).reconnect_attempt = 0;

        let span = mqtt_span!(
            operation = "connect",
            broker = %self.config.endpoint().address()
        );
        match self.establish(SessionState::Connecting).instrument(span).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if self
                    .transition(SessionState::Disconnected, |s| *s == SessionState::Connecting)
                    .is_ok()
                {
                    self.dispatch(vec![Notification::listener(SessionEvent::ConnectionFailed {
                        reason: sanitize_error_message(&e.to_string()),
                    })]);
                }
                Err(e)
            }
        }
    }

    /// Credentials cached from an earlier connect, or resolved now
    async fn credentials_for_connect(&self) -> SessionResult<Credentials> {
        let mut cached = self.credentials.lock().await;
        if let Some(credentials) = cached.as_ref() {
            return Ok(credentials.clone());
        }
        let credentials = self.resolver.resolve().await?;
        *cached = Some(credentials.clone());
        Ok(credentials)
    }

    /// Resolve credentials, open the transport and send CONNECT while the
    /// state stays `expected`
    async fn establish(&self, expected: SessionState) -> SessionResult<()> {
        let credentials = self.credentials_for_connect().await?;
        let frame = codec::encode_connect(
            &credentials.client_id,
            &credentials.username,
            credentials.password(),
            self.config.session.keep_alive_secs,
            self.config.session.clean_session,
        )?;

        let endpoint = self.config.endpoint();
        let mut transport = self.transport.lock().await;
        transport.open(&endpoint).await.map_err(|e| {
            SessionError::connect(sanitize_error_message(&e.to_string()))
        })?;

        let actual = self.state();
        if actual != expected {
            transport.close().await;
            return Err(SessionError::StateConflict {
                expected: expected.name(),
                actual,
            });
        }

        // Frames queued for a previous link must not precede CONNECT
        lock(&self.outbox).clear();
        match transport.send_frame(&frame).await {
            Ok(SendStatus::Sent) => {}
            Ok(SendStatus::WouldBlock) => lock(&self.outbox).push_front(frame),
            Err(e) => {
                transport.close().await;
                return Err(SessionError::connect(e.to_string()));
            }
        }

        let now = Instant::now();
        let mut link = lock(&self.link);
        link.reset(KeepAlive::new(
            self.config.ping_interval(),
            self.config.ping_timeout(),
            now,
        ));
        link.connect_started = Some(now);
        debug!(
            target: "iotlink::session",
            client_id = %credentials.client_id,
            keep_alive = self.config.session.keep_alive_secs,
            "CONNECT sent"
        );
        Ok(())
    }

    /// Register a subscription and SUBSCRIBE now if connected.
    ///
    /// The registry entry survives disconnects and is replayed after every
    /// successful connect. Subscribing again to the same filter replaces the
    /// entry.
    pub fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        subscriber: Arc<dyn Subscriber>,
    ) -> SessionResult<()> {
        validate_filter(filter)?;
        self.ensure_live()?;

        let mut registry = lock(&self.registry);
        let is_new = registry.upsert(TopicSubscription::new(filter, qos, Arc::clone(&subscriber)));

        if self.state() == SessionState::Connected {
            let (packet_id, frame) =
                lock(&self.pending).enqueue_subscribe(filter, qos, subscriber, Instant::now())?;
            lock(&self.outbox).push_back(frame);
            drop(registry);
            self.wake.notify_one();
            debug!(target: "iotlink::session", topic = %filter, packet_id, "SUBSCRIBE queued");
        } else {
            debug!(
                target: "iotlink::session",
                topic = %filter,
                new = is_new,
                "subscription registered for next connect"
            );
        }
        Ok(())
    }

    /// Remove a subscription and UNSUBSCRIBE if connected
    pub fn unsubscribe(&self, filter: &str) -> SessionResult<()> {
        validate_filter(filter)?;
        self.ensure_live()?;

        let mut registry = lock(&self.registry);
        let removed = registry.remove(filter).ok_or_else(|| {
            SessionError::invalid_argument(format!("no subscription for '{filter}'"))
        })?;

        if self.state() == SessionState::Connected {
            let (packet_id, frame) = lock(&self.pending).enqueue_unsubscribe(
                filter,
                Some(removed.subscriber),
                Instant::now(),
            )?;
            lock(&self.outbox).push_back(frame);
            drop(registry);
            self.wake.notify_one();
            debug!(target: "iotlink::session", topic = %filter, packet_id, "UNSUBSCRIBE queued");
        }
        Ok(())
    }

    /// Publish; the outcome of a QoS 1 publish goes to the session listener.
    ///
    /// Returns the packet id for QoS 1.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
    ) -> SessionResult<Option<u16>> {
        self.publish_inner(topic, payload.into(), qos, None)
    }

    /// Publish with the QoS 1 outcome reported to `observer`
    pub fn publish_with_observer(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        observer: Arc<dyn Subscriber>,
    ) -> SessionResult<Option<u16>> {
        self.publish_inner(topic, payload.into(), qos, Some(observer))
    }

    fn publish_inner(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        observer: Option<Arc<dyn Subscriber>>,
    ) -> SessionResult<Option<u16>> {
        validate_topic(topic)?;

        let mut pending = lock(&self.pending);
        let state = self.state();
        if state == SessionState::Terminated {
            return Err(SessionError::Terminated);
        }
        if !HealthMonitor::can_publish(&state) {
            return Err(SessionError::NotConnected { state });
        }

        let (packet_id, frame) = match qos {
            QoS::AtMostOnce => (None, codec::encode_publish(topic, payload, qos, None)?),
            QoS::AtLeastOnce => {
                let (id, frame) =
                    pending.enqueue_publish(topic, payload, qos, observer, Instant::now())?;
                (Some(id), frame)
            }
        };
        lock(&self.outbox).push_back(frame);
        drop(pending);
        self.wake.notify_one();

        debug!(target: "iotlink::session", topic = %topic, qos = %qos, packet_id = ?packet_id, "PUBLISH queued");
        Ok(packet_id)
    }

    /// Send DISCONNECT, close the link and fail everything outstanding.
    ///
    /// Allowed from `Connected`, `Connecting` and `Reconnecting`; always ends
    /// in `Disconnected` even if DISCONNECT could not be sent.
    pub async fn disconnect(&self) -> SessionResult<()> {
        self.transition(SessionState::Disconnecting, |s| {
            matches!(
                s,
                SessionState::Connected | SessionState::Connecting | SessionState::Reconnecting(_)
            )
        })
        .map_err(|actual| SessionError::StateConflict {
            expected: "Connected",
            actual,
        })?;
        // Cancel a drive in progress so the transport lock frees up
        self.wake.notify_one();

        {
            let mut transport = self.transport.lock().await;
            if transport.is_open() {
                let sent = match codec::encode_disconnect() {
                    Ok(frame) => transport.send_frame(&frame).await.map_err(SessionError::from),
                    Err(e) => Err(e.into()),
                };
                match sent {
                    Ok(SendStatus::Sent) => {}
                    Ok(SendStatus::WouldBlock) => {
                        debug!(target: "iotlink::session", "DISCONNECT skipped, transport busy")
                    }
                    Err(e) => debug!(target: "iotlink::session", error = %e, "DISCONNECT not sent"),
                }
                transport.close().await;
            }
        }

        let mut notes = Vec::new();
        lock(&self.outbox).clear();
        self.fail_pending(FailureReason::Disconnected, &mut notes);
        {
            let mut link = lock(&self.link);
            link.inbound.clear();
            link.connect_started = None;
            link.connected_at = None;
            link.reconnect_attempt = 0;
        }

        let _ = self.transition(SessionState::Disconnected, |s| {
            *s == SessionState::Disconnecting
        });
        info!(target: "iotlink::session", "MQTT session disconnected");
        notes.push(Notification::listener(SessionEvent::Disconnected {
            reason: "client requested disconnect".to_string(),
        }));
        self.dispatch(notes);
        Ok(())
    }

    /// Disconnect if needed, then connect again with the same registry
    pub async fn reconnect(&self) -> SessionResult<()> {
        self.ensure_live()?;
        if self.state() != SessionState::Disconnected {
            self.disconnect().await?;
        }
        self.connect().await
    }

    /// Derive fresh credentials for the next connect.
    ///
    /// On failure the previous credentials stay in place.
    pub async fn reauthenticate(&self) -> SessionResult<()> {
        self.ensure_live()?;
        let credentials = self.resolver.resolve().await?;
        *self.credentials.lock().await = Some(credentials);
        info!(target: "iotlink::auth", "credentials refreshed");
        Ok(())
    }

    /// Tear the session down for good.
    ///
    /// Forces a best-effort disconnect, then releases the link, credentials,
    /// registry and queues. Every later operation fails with `Terminated`
    /// and [`run_once`](Self::run_once) returns false.
    pub async fn deinit(&self) {
        if matches!(
            self.state(),
            SessionState::Connected | SessionState::Connecting | SessionState::Reconnecting(_)
        ) {
            if let Err(e) = self.disconnect().await {
                debug!(target: "iotlink::session", error = %e, "disconnect before deinit");
            }
        }

        self.state_tx.send_if_modified(|state| {
            if *state == SessionState::Terminated {
                return false;
            }
            HealthMonitor::log_state_transition(state, &SessionState::Terminated);
            *state = SessionState::Terminated;
            true
        });
        self.wake.notify_one();

        self.transport.lock().await.close().await;
        *self.credentials.lock().await = None;

        let mut notes = Vec::new();
        lock(&self.outbox).clear();
        self.fail_pending(FailureReason::Disconnected, &mut notes);
        *lock(&self.registry) = SubscriptionRegistry::new();
        self.dispatch(notes);
    }

    /// Drive the session for up to `timeout`.
    ///
    /// Call in a loop from one task. Returns false once the session has been
    /// deinitialized.
    pub async fn run_once(&self, timeout: Duration) -> bool {
        let mut state_rx = self.state_tx.subscribe();
        let state = *state_rx.borrow_and_update();

        let mut notes = Vec::new();
        match state {
            SessionState::Terminated => return false,
            SessionState::Disconnected | SessionState::Disconnecting => {
                let _ = tokio::time::timeout(timeout, state_rx.changed()).await;
            }
            SessionState::Reconnecting(attempts) => {
                self.reconnect_step(attempts, state_rx, &mut notes).await;
            }
            SessionState::Connecting | SessionState::Connected => {
                self.service_link(timeout, &mut notes).await;
            }
        }
        self.dispatch(notes);

        self.state() != SessionState::Terminated
    }

    /// One reconnect attempt: backoff, then open and CONNECT
    async fn reconnect_step(
        &self,
        attempts: u32,
        mut state_rx: watch::Receiver<SessionState>,
        notes: &mut Vec<Notification>,
    ) {
        let current = SessionState::Reconnecting(attempts);
        match HealthMonitor::should_attempt_reconnection(attempts, &self.reconnect_policy) {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                if self
                    .transition(SessionState::Reconnecting(attempt), |s| *s == current)
                    .is_err()
                {
                    return;
                }
                state_rx.borrow_and_update();
                self.dispatch(vec![Notification::listener(SessionEvent::Reconnecting {
                    attempt,
                })]);

                let max_display = self
                    .reconnect_policy
                    .max_attempts
                    .map_or("unlimited".to_string(), |max| max.to_string());
                info!(
                    target: "iotlink::session",
                    attempt,
                    max_attempts = %max_display,
                    delay_ms,
                    "Attempting reconnection"
                );

                // disconnect() or deinit() during the backoff cancels the attempt
                let interrupted = tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => false,
                    _ = state_rx.changed() => true,
                };
                if interrupted {
                    debug!(target: "iotlink::session", attempt, "reconnection interrupted");
                    return;
                }

                let reconnecting = SessionState::Reconnecting(attempt);
                if self.transition(SessionState::Connecting, |s| *s == reconnecting).is_err() {
                    return;
                }
                lock(&self.link).reconnect_attempt = attempt;

                let span = mqtt_span!(operation = "reconnect", attempt);
                if let Err(e) = self.establish(SessionState::Connecting).instrument(span).await {
                    warn!(target: "iotlink::session", attempt, error = %e, "Reconnection attempt failed");
                    let _ = self.transition(reconnecting, |s| *s == SessionState::Connecting);
                }
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                if self
                    .transition(SessionState::Disconnected, |s| *s == current)
                    .is_ok()
                {
                    let reason = format!("Max reconnection attempts ({attempts}) exceeded");
                    notes.push(Notification::listener(SessionEvent::ConnectionFailed {
                        reason,
                    }));
                }
            }
        }
    }

    /// Flush, drive the transport, handle what it reports, then run timers
    async fn service_link(&self, timeout: Duration, notes: &mut Vec<Notification>) {
        let mut transport = self.transport.lock().await;

        // disconnect() may have won the race for the transport
        let state = self.state();
        if !state.has_link() {
            return;
        }
        if !transport.is_open() {
            self.link_lost(state, "transport closed".to_string(), notes);
            return;
        }

        if let Err(e) = self.flush_outbox(&mut **transport).await {
            transport.close().await;
            self.link_lost(state, e.to_string(), notes);
            return;
        }

        let wait = match self.next_deadline() {
            Some(deadline) => timeout.min(deadline.saturating_duration_since(Instant::now())),
            None => timeout,
        };
        let events = tokio::select! {
            events = transport.drive(wait) => events,
            _ = self.wake.notified() => Vec::new(),
        };

        for event in events {
            let result = match event {
                TransportEvent::Connected => {
                    debug!(target: "iotlink::transport", "link open");
                    Ok(())
                }
                TransportEvent::FrameReceived(bytes) => self.handle_bytes(&bytes, notes),
                TransportEvent::WriteReady => Ok(()),
                TransportEvent::Disconnected(reason) => {
                    transport.close().await;
                    self.link_lost(self.state(), reason, notes);
                    return;
                }
            };
            if let Err(e) = result {
                warn!(target: "iotlink::session", error = %e, "dropping link after protocol failure");
                transport.close().await;
                let from = self.state();
                if matches!(e, SessionError::Refused { .. }) {
                    // A refused CONNACK ends the reconnect cycle
                    lock(&self.link).reconnect_attempt = 0;
                }
                self.link_lost(from, e.to_string(), notes);
                return;
            }
        }

        if let Err(e) = self.flush_outbox(&mut **transport).await {
            transport.close().await;
            self.link_lost(self.state(), e.to_string(), notes);
            return;
        }

        if let Err(e) = self.run_timers(&mut **transport, notes).await {
            transport.close().await;
            self.link_lost(self.state(), e.to_string(), notes);
        }
    }

    /// Earliest instant a timer needs attention
    fn next_deadline(&self) -> Option<Instant> {
        let link = lock(&self.link);
        let keep_alive = link.keep_alive.next_deadline();
        let connect = link
            .connect_started
            .and_then(|started| started.checked_add(self.config.connect_timeout()));
        drop(link);
        let ack = lock(&self.pending)
            .oldest_sent_at()
            .and_then(|sent| sent.checked_add(self.config.ack_timeout()));

        [keep_alive, connect, ack].into_iter().flatten().min()
    }

    async fn flush_outbox(&self, transport: &mut dyn Transport) -> Result<(), TransportError> {
        loop {
            let Some(frame) = lock(&self.outbox).pop_front() else {
                return Ok(());
            };
            match transport.send_frame(&frame).await? {
                SendStatus::Sent => lock(&self.link).keep_alive.record_sent(Instant::now()),
                SendStatus::WouldBlock => {
                    lock(&self.outbox).push_front(frame);
                    return Ok(());
                }
            }
        }
    }

    /// Keep-alive, connect timeout and ack timeout
    async fn run_timers(
        &self,
        transport: &mut dyn Transport,
        notes: &mut Vec<Notification>,
    ) -> SessionResult<()> {
        let now = Instant::now();

        let (action, connect_started) = {
            let link = lock(&self.link);
            (link.keep_alive.poll(now), link.connect_started)
        };

        if let Some(started) = connect_started {
            let connect_timeout = self.config.connect_timeout();
            if now.saturating_duration_since(started) >= connect_timeout {
                return Err(TransportError::ConnectTimeout(connect_timeout).into());
            }
        }

        match action {
            KeepAliveAction::Idle => {}
            KeepAliveAction::SendPing => {
                let ping = codec::encode_pingreq()?;
                if transport.send_frame(&ping).await? == SendStatus::Sent {
                    let mut link = lock(&self.link);
                    link.keep_alive.record_ping_sent(now);
                    debug!(target: "iotlink::session", pings = link.keep_alive.pings_sent(), "PINGREQ sent");
                }
            }
            KeepAliveAction::TimedOut(waited) => {
                warn!(target: "iotlink::session", waited_ms = waited.as_millis() as u64, "Keep-alive timeout");
                return Err(TransportError::KeepAliveTimeout(waited).into());
            }
        }

        let expired = lock(&self.pending).expire(now, self.config.ack_timeout());
        for operation in expired {
            warn!(
                target: "iotlink::session",
                kind = ?operation.kind(),
                packet_id = operation.packet_id(),
                topic = %operation.topic(),
                error = %SessionError::AckTimeout { packet_id: operation.packet_id() },
                "acknowledgment timed out"
            );
            self.report_failure(operation, FailureReason::AckTimeout, notes);
        }
        Ok(())
    }

    fn handle_bytes(&self, bytes: &[u8], notes: &mut Vec<Notification>) -> SessionResult<()> {
        let packets = {
            let mut link = lock(&self.link);
            link.last_message_at = Some(Instant::now());
            link.inbound.feed(bytes)?
        };
        for packet in packets {
            self.handle_packet(packet, notes)?;
        }
        Ok(())
    }

    fn handle_packet(&self, packet: Packet, notes: &mut Vec<Notification>) -> SessionResult<()> {
        match MessageHandler::route_packet(packet) {
            EventRoute::ConnectionAcknowledged { session_present } => {
                self.on_connack(session_present, notes);
                Ok(())
            }
            EventRoute::ConnectionRefused(code) => Err(SessionError::Refused {
                reason: format!(
                    "CONNACK return code {}: {}",
                    code as u8,
                    codec::describe_return_code(code)
                ),
            }),
            EventRoute::MessageReceived {
                topic,
                payload,
                qos,
                packet_id,
                retain,
            } => {
                if let Some(ack) = MessageHandler::acknowledgment_for(qos, packet_id) {
                    lock(&self.outbox).push_back(ack);
                }
                let targets: Vec<Arc<dyn Subscriber>> = lock(&self.registry)
                    .matching(&topic)
                    .into_iter()
                    .map(|subscription| subscription.subscriber)
                    .collect();
                debug!(
                    target: "iotlink::session",
                    topic = %topic,
                    bytes = payload.len(),
                    retain,
                    subscribers = targets.len(),
                    "PUBLISH received"
                );
                if !targets.is_empty() {
                    notes.push(Notification::Message {
                        targets,
                        topic,
                        payload,
                    });
                }
                Ok(())
            }
            EventRoute::Acknowledged {
                kind,
                packet_id,
                granted,
            } => {
                let acknowledged = lock(&self.pending).acknowledge(kind, packet_id);
                match acknowledged {
                    Some(operation) => self.report_acknowledged(operation, granted, notes),
                    None => debug!(
                        target: "iotlink::session",
                        kind = ?kind,
                        packet_id,
                        "acknowledgment for unknown packet id"
                    ),
                }
                Ok(())
            }
            EventRoute::PingResponse => {
                lock(&self.link).keep_alive.record_pong();
                Ok(())
            }
            EventRoute::ProtocolViolation(reason) => {
                Err(TransportError::Protocol(reason).into())
            }
        }
    }

    /// CONNACK accepted: enter `Connected` and replay the registry
    fn on_connack(&self, session_present: bool, notes: &mut Vec<Notification>) {
        let registry = lock(&self.registry);
        if self
            .transition(SessionState::Connected, |s| *s == SessionState::Connecting)
            .is_err()
        {
            warn!(target: "iotlink::session", state = %self.state(), "unexpected CONNACK");
            return;
        }

        let now = Instant::now();
        {
            let mut link = lock(&self.link);
            if link.reconnect_attempt > 0 {
                link.reconnect_count += 1;
            }
            link.reconnect_attempt = 0;
            link.connect_started = None;
            link.connected_at = Some(now);
        }

        let replay = registry.snapshot();
        let mut pending = lock(&self.pending);
        let mut replayed = 0usize;
        for subscription in replay {
            match pending.enqueue_subscribe(
                &subscription.filter,
                subscription.qos,
                Arc::clone(&subscription.subscriber),
                now,
            ) {
                Ok((_, frame)) => {
                    lock(&self.outbox).push_back(frame);
                    replayed += 1;
                }
                Err(e) => {
                    warn!(target: "iotlink::session", topic = %subscription.filter, error = %e, "cannot replay subscription");
                    notes.push(Notification::Event {
                        target: Some(subscription.subscriber),
                        event: SessionEvent::SubscribeFailed {
                            topic: subscription.filter,
                            reason: FailureReason::Rejected,
                        },
                    });
                }
            }
        }
        drop(pending);
        drop(registry);

        info!(
            target: "iotlink::session",
            session_present,
            replayed,
            "MQTT session connected"
        );
        notes.push(Notification::listener(SessionEvent::Connected));
    }

    fn report_acknowledged(
        &self,
        operation: PendingOperation,
        granted: Option<codec::QoS>,
        notes: &mut Vec<Notification>,
    ) {
        match operation {
            PendingOperation::Subscribe(op) => {
                let event = match granted {
                    Some(granted_qos) => SessionEvent::Subscribed {
                        topic: op.topic,
                        granted_qos,
                    },
                    None => {
                        warn!(target: "iotlink::session", topic = %op.topic, "SUBSCRIBE rejected by broker");
                        SessionEvent::SubscribeFailed {
                            topic: op.topic,
                            reason: FailureReason::Rejected,
                        }
                    }
                };
                notes.push(Notification::Event {
                    target: Some(op.subscriber),
                    event,
                });
            }
            PendingOperation::Unsubscribe(op) => notes.push(Notification::Event {
                target: op.subscriber,
                event: SessionEvent::Unsubscribed { topic: op.topic },
            }),
            PendingOperation::Publish(op) => notes.push(Notification::Event {
                target: op.observer,
                event: SessionEvent::Published {
                    packet_id: op.packet_id,
                    topic: op.topic,
                },
            }),
        }
    }

    fn report_failure(
        &self,
        operation: PendingOperation,
        reason: FailureReason,
        notes: &mut Vec<Notification>,
    ) {
        match operation {
            PendingOperation::Subscribe(op) => notes.push(Notification::Event {
                target: Some(op.subscriber),
                event: SessionEvent::SubscribeFailed {
                    topic: op.topic,
                    reason,
                },
            }),
            PendingOperation::Publish(op) => notes.push(Notification::Event {
                target: op.observer,
                event: SessionEvent::PublishFailed {
                    packet_id: op.packet_id,
                    topic: op.topic,
                    reason,
                },
            }),
            PendingOperation::Unsubscribe(op) => {
                debug!(target: "iotlink::session", topic = %op.topic, reason = %reason, "UNSUBSCRIBE not acknowledged");
            }
        }
    }

    fn fail_pending(&self, reason: FailureReason, notes: &mut Vec<Notification>) {
        let drained = lock(&self.pending).drain_unacknowledged();
        for operation in drained {
            self.report_failure(operation, reason.clone(), notes);
        }
    }

    /// The link is gone while in `from`; the transport is already closed
    fn link_lost(&self, from: SessionState, reason: String, notes: &mut Vec<Notification>) {
        // disconnect() and deinit() own every other state
        if !from.has_link() {
            return;
        }
        let reason = sanitize_error_message(&reason);
        let attempt = lock(&self.link).reconnect_attempt;
        let auto_reconnect = self.config.session.auto_reconnect;
        let next = match from {
            SessionState::Connecting if attempt == 0 => SessionState::Disconnected,
            SessionState::Connecting => SessionState::Reconnecting(attempt),
            _ => HealthMonitor::state_after_link_loss(auto_reconnect, 0),
        };

        // Hold the registry and pending locks so no request slips onto the
        // dead link between the transition and the drain
        let registry = lock(&self.registry);
        let mut pending = lock(&self.pending);
        if self.transition(next, |s| *s == from).is_err() {
            return;
        }
        let drained = pending.drain_unacknowledged();
        lock(&self.outbox).clear();
        drop(pending);
        drop(registry);

        for operation in drained {
            self.report_failure(operation, FailureReason::Disconnected, notes);
        }
        {
            let mut link = lock(&self.link);
            link.inbound.clear();
            link.connect_started = None;
            link.connected_at = None;
        }

        warn!(target: "iotlink::session", from = %from, to = %next, reason = %reason, "MQTT link lost");
        match from {
            SessionState::Connected => {
                notes.push(Notification::listener(SessionEvent::Disconnected { reason }));
            }
            SessionState::Connecting if next == SessionState::Disconnected => {
                notes.push(Notification::listener(SessionEvent::ConnectionFailed {
                    reason,
                }));
            }
            _ => {}
        }
    }

    /// Deliver collected callbacks; no internal lock is held here
    fn dispatch(&self, notes: Vec<Notification>) {
        if notes.is_empty() {
            return;
        }
        let listener = lock(&self.listener).clone();
        for note in notes {
            match note {
                Notification::Message {
                    targets,
                    topic,
                    payload,
                } => {
                    for target in targets {
                        target.on_message(&topic, &payload);
                    }
                }
                Notification::Event { target, event } => {
                    match target.as_ref().or(listener.as_ref()) {
                        Some(subscriber) => subscriber.on_event(&event),
                        None => debug!(target: "iotlink::session", event = ?event, "no listener for event"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBroker, MockTransport, RecordingSubscriber};

    fn session_with_broker() -> (Arc<MqttSession>, MockBroker) {
        let config = SessionConfig::test_config();
        let broker = MockBroker::new();
        let session = MqttSession::with_transport(
            config.clone(),
            Box::new(MockTransport::new(broker.clone())),
            CredentialResolver::new(config),
        )
        .unwrap();
        (session, broker)
    }

    #[tokio::test]
    async fn test_initial_state() {
        let (session, _broker) = session_with_broker();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.pending_operations(), 0);
        assert!(session.subscriptions().is_empty());
        assert!(!session.health().is_healthy);
    }

    #[tokio::test]
    async fn test_connect_sends_connect_with_credentials() {
        let (session, broker) = session_with_broker();
        session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::Connecting);

        let connect = broker.connect_packets();
        assert_eq!(connect.len(), 1);
        assert_eq!(connect[0].client_id, "6788bd810f9bad3f8ef674fa|P1-9");
        assert!(broker.connect_usernames()[0].starts_with("6788bd810f9bad3f8ef674fa|P1-9|"));
        assert_eq!(connect[0].keep_alive, 60);

        assert!(session.run_once(Duration::from_millis(50)).await);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_connect_requires_disconnected() {
        let (session, _broker) = session_with_broker();
        session.connect().await.unwrap();
        assert!(matches!(
            session.connect().await,
            Err(SessionError::StateConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_open_failure_is_connect_error() {
        let (session, broker) = session_with_broker();
        let listener = RecordingSubscriber::new();
        session.set_event_listener(listener.clone());
        broker.set_fail_open(true);

        assert!(matches!(
            session.connect().await,
            Err(SessionError::Connect { .. })
        ));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(listener
            .events()
            .iter()
            .any(|e| matches!(e, SessionEvent::ConnectionFailed { .. })));
    }

    #[tokio::test]
    async fn test_refused_connack_fails_initial_connect() {
        let (session, broker) = session_with_broker();
        broker.set_connack_code(codec::ConnectReturnCode::BadUserNamePassword);
        session.connect().await.unwrap();

        session.run_once(Duration::from_millis(50)).await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(lock(&session.link).reconnect_attempt, 0);
    }

    #[tokio::test]
    async fn test_qos0_publish_is_not_tracked() {
        let (session, broker) = session_with_broker();
        session.connect().await.unwrap();
        session.run_once(Duration::from_millis(50)).await;

        let id = session.publish("a/b", "hello", QoS::AtMostOnce).unwrap();
        assert_eq!(id, None);
        assert_eq!(session.pending_operations(), 0);

        session.run_once(Duration::from_millis(50)).await;
        assert_eq!(broker.published_topics(), vec!["a/b".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let (session, _broker) = session_with_broker();
        let subscriber = RecordingSubscriber::new();
        assert!(matches!(
            session.subscribe("", QoS::AtLeastOnce, subscriber),
            Err(SessionError::InvalidArgument { .. })
        ));
        assert!(matches!(
            session.unsubscribe("never/subscribed"),
            Err(SessionError::InvalidArgument { .. })
        ));
    }

    #[tokio::test]
    async fn test_deinit_terminates() {
        let (session, broker) = session_with_broker();
        session.connect().await.unwrap();
        session.run_once(Duration::from_millis(50)).await;
        session
            .subscribe("a/#", QoS::AtMostOnce, RecordingSubscriber::new())
            .unwrap();

        session.deinit().await;
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(!session.run_once(Duration::from_millis(10)).await);
        assert!(session.subscriptions().is_empty());
        assert!(broker
            .sent_packets()
            .iter()
            .any(|p| matches!(p, Packet::Disconnect)));
        assert!(matches!(
            session.connect().await,
            Err(SessionError::Terminated)
        ));
        assert!(matches!(
            session.publish("a/b", "x", QoS::AtMostOnce),
            Err(SessionError::Terminated)
        ));
    }

    #[tokio::test]
    async fn test_reauthenticate_refreshes_credentials() {
        let (session, broker) = session_with_broker();
        session.connect().await.unwrap();
        session.run_once(Duration::from_millis(50)).await;
        let first = broker.connect_usernames()[0].clone();

        session.reauthenticate().await.unwrap();
        session.reconnect().await.unwrap();
        let usernames = broker.connect_usernames();
        assert_eq!(usernames.len(), 2);
        // Fresh nonce and timestamp produce a different username
        assert_ne!(usernames[1], first);
    }
}
