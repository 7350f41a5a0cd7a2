//! Keep-alive scheduling and dead-link detection on a paused clock


use iotlink::transport::mqtt::{SessionEvent, SessionState};
use std::time::Duration;
use test_helpers::*;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_missing_pingresp_drops_link() {
    let mut config = device_config();
    config.session.auto_reconnect = false;
    let (session, broker, listener) = observed_session(config);
    connect_and_settle(&session).await;
    broker.set_auto_pingresp(false);

    let started = Instant::now();
    assert!(
        pump_until(&session, 200, |s| s.state() == SessionState::Disconnected).await,
        "session should notice the dead link"
    );
    let elapsed = started.elapsed();

    // One PINGREQ after the 60 s interval, then the 10 s grace window
    assert_eq!(broker.count_sent("PINGREQ"), 1);
    assert!(elapsed >= Duration::from_secs(69), "dropped after {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(71), "dropped after {elapsed:?}");
    assert_eq!(
        listener.count_events(|e| matches!(
            e,
            SessionEvent::Disconnected { reason } if reason.contains("PINGRESP")
        )),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_answered_pings_keep_session_alive() {
    let (session, broker) = session_with_broker(device_config());
    connect_and_settle(&session).await;

    let started = Instant::now();
    while started.elapsed() < Duration::from_secs(150) {
        session.run_once(Duration::from_secs(1)).await;
    }

    assert!(session.is_connected());
    assert_eq!(broker.count_sent("PINGREQ"), 2);
    assert_eq!(session.pings_sent(), 2);
    assert_eq!(broker.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_custom_ping_interval() {
    let mut config = device_config();
    config.session.keep_alive_secs = 30;
    config.session.ping_interval_secs = Some(10);
    let (session, broker) = session_with_broker(config);
    connect_and_settle(&session).await;

    let started = Instant::now();
    while started.elapsed() < Duration::from_secs(35) {
        session.run_once(Duration::from_secs(1)).await;
    }

    assert_eq!(broker.count_sent("PINGREQ"), 3);
    assert_eq!(broker.connect_packets()[0].keep_alive, 30);
}

#[tokio::test(start_paused = true)]
async fn test_outbound_traffic_defers_ping() {
    let (session, broker) = session_with_broker(device_config());
    connect_and_settle(&session).await;

    // Publish every 30 s so the link never sits idle for a full interval
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_secs(30)).await;
        session
            .publish("sys/pk/dn/custom/up", "tick", iotlink::QoS::AtMostOnce)
            .unwrap();
        pump(&session, 1).await;
    }

    assert_eq!(broker.count_sent("PINGREQ"), 0);
    assert_eq!(broker.published_topics().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_zero_keep_alive_never_pings() {
    let mut config = device_config();
    config.session.keep_alive_secs = 0;
    let (session, broker) = session_with_broker(config);
    connect_and_settle(&session).await;
    broker.set_auto_pingresp(false);

    let started = Instant::now();
    while started.elapsed() < Duration::from_secs(300) {
        session.run_once(Duration::from_secs(5)).await;
    }

    assert_eq!(broker.count_sent("PINGREQ"), 0);
    assert!(session.is_connected());
}
