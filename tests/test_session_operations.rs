//! Subscribe, unsubscribe, publish and inbound dispatch


use iotlink::testing::RecordingSubscriber;
use iotlink::transport::mqtt::{subscriber_fn, FailureReason, QoS, SessionEvent, TopicBuilder};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;

#[tokio::test(start_paused = true)]
async fn test_out_of_order_subacks_reach_their_subscribers() {
    let (session, broker) = session_with_broker(device_config());
    connect_and_settle(&session).await;
    broker.set_hold_acks(true);

    let filters = ["sys/pk/dn/a", "sys/pk/dn/b", "sys/pk/dn/c"];
    let subscribers: Vec<_> = filters
        .iter()
        .map(|filter| {
            let subscriber = RecordingSubscriber::new();
            session
                .subscribe(filter, QoS::AtLeastOnce, subscriber.clone())
                .unwrap();
            subscriber
        })
        .collect();

    pump(&session, 1).await;
    assert_eq!(broker.held_count(), 3);
    assert_eq!(session.pending_operations(), 3);

    let ids = broker.subscribe_packet_ids();
    assert_eq!(ids.len(), 3);
    assert!(ids[0] != ids[1] && ids[1] != ids[2] && ids[0] != ids[2]);

    for ack in broker.take_held().into_iter().rev() {
        broker.inject(ack);
    }
    pump(&session, 2).await;

    assert_eq!(session.pending_operations(), 0);
    for (filter, subscriber) in filters.iter().zip(&subscribers) {
        assert_eq!(
            subscriber.events(),
            vec![SessionEvent::Subscribed {
                topic: filter.to_string(),
                granted_qos: QoS::AtLeastOnce,
            }]
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_qos1_failure_reported_at_most_once() {
    let mut config = device_config();
    config.session.auto_reconnect = true;
    let (session, broker) = session_with_broker(config);
    connect_and_settle(&session).await;
    broker.set_hold_acks(true);

    let observer = RecordingSubscriber::new();
    let packet_id = session
        .publish_with_observer("sys/pk/dn/custom/up", "{}", QoS::AtLeastOnce, observer.clone())
        .unwrap()
        .expect("QoS 1 publish has a packet id");
    pump(&session, 1).await;
    let late_puback = broker.take_held();
    assert_eq!(late_puback.len(), 1);

    broker.drop_link("reset");
    pump(&session, 1).await;
    broker.set_hold_acks(false);
    assert!(pump_until(&session, 10, |s| s.is_connected()).await);

    // A PUBACK arriving on the new link for the old id is ignored
    for ack in late_puback {
        broker.inject(ack);
    }
    pump(&session, 3).await;

    assert_eq!(
        observer.events(),
        vec![SessionEvent::PublishFailed {
            packet_id,
            topic: "sys/pk/dn/custom/up".to_string(),
            reason: FailureReason::Disconnected,
        }]
    );
    assert_eq!(session.pending_operations(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_qos1_publish_acknowledged() {
    let (session, broker, listener) = observed_session(device_config());
    connect_and_settle(&session).await;

    let packet_id = session
        .publish("sys/pk/dn/custom/up", r#"{"temp":21}"#, QoS::AtLeastOnce)
        .unwrap()
        .unwrap();
    assert_eq!(session.pending_operations(), 1);
    pump(&session, 2).await;

    assert_eq!(session.pending_operations(), 0);
    assert_eq!(broker.published_topics(), vec!["sys/pk/dn/custom/up"]);
    assert_eq!(
        listener.count_events(|e| *e
            == SessionEvent::Published {
                packet_id,
                topic: "sys/pk/dn/custom/up".to_string(),
            }),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_ack_timeout_fails_publish() {
    let (session, broker, listener) = observed_session(device_config());
    connect_and_settle(&session).await;
    broker.set_hold_acks(true);

    session
        .publish("sys/pk/dn/custom/up", "x", QoS::AtLeastOnce)
        .unwrap();
    let started = tokio::time::Instant::now();
    assert!(
        pump_until(&session, 60, |s| s.pending_operations() == 0).await,
        "publish should expire"
    );
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert!(session.is_connected());
    assert_eq!(
        listener.count_events(|e| matches!(
            e,
            SessionEvent::PublishFailed {
                reason: FailureReason::AckTimeout,
                ..
            }
        )),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_is_idempotent_per_filter() {
    let (session, broker) = session_with_broker(device_config());
    let first = RecordingSubscriber::new();
    let second = RecordingSubscriber::new();

    session
        .subscribe("sys/pk/dn/custom/down", QoS::AtMostOnce, first.clone())
        .unwrap();
    session
        .subscribe("sys/pk/dn/custom/down", QoS::AtLeastOnce, second.clone())
        .unwrap();
    assert_eq!(session.subscriptions(), vec!["sys/pk/dn/custom/down"]);

    connect_and_settle(&session).await;
    assert_eq!(broker.subscribed_filters(), vec!["sys/pk/dn/custom/down"]);

    broker.inject_publish("sys/pk/dn/custom/down", b"hello", QoS::AtMostOnce, None);
    pump(&session, 1).await;
    assert_eq!(first.message_count(), 0);
    assert_eq!(
        second.messages(),
        vec![("sys/pk/dn/custom/down".to_string(), b"hello".to_vec())]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_stops_delivery() {
    let (session, broker) = session_with_broker(device_config());
    let subscriber = RecordingSubscriber::new();
    session
        .subscribe("sys/pk/dn/custom/down", QoS::AtLeastOnce, subscriber.clone())
        .unwrap();
    connect_and_settle(&session).await;

    session.unsubscribe("sys/pk/dn/custom/down").unwrap();
    assert!(session.subscriptions().is_empty());
    pump(&session, 2).await;
    assert_eq!(broker.count_sent("UNSUBSCRIBE"), 1);
    assert_eq!(
        subscriber.count_events(|e| matches!(e, SessionEvent::Unsubscribed { .. })),
        1
    );

    broker.inject_publish("sys/pk/dn/custom/down", b"late", QoS::AtMostOnce, None);
    pump(&session, 1).await;
    assert_eq!(subscriber.message_count(), 0);

    assert!(session.unsubscribe("sys/pk/dn/custom/down").is_err());
}

#[tokio::test(start_paused = true)]
async fn test_rejected_subscribe_keeps_registration() {
    let (session, broker) = session_with_broker(device_config());
    connect_and_settle(&session).await;
    broker.reject_filter("sys/pk/dn/forbidden/#");

    let subscriber = RecordingSubscriber::new();
    session
        .subscribe("sys/pk/dn/forbidden/#", QoS::AtLeastOnce, subscriber.clone())
        .unwrap();
    pump(&session, 2).await;

    assert_eq!(
        subscriber.events(),
        vec![SessionEvent::SubscribeFailed {
            topic: "sys/pk/dn/forbidden/#".to_string(),
            reason: FailureReason::Rejected,
        }]
    );
    assert_eq!(session.subscriptions(), vec!["sys/pk/dn/forbidden/#"]);
}

#[tokio::test(start_paused = true)]
async fn test_wildcard_and_exact_dispatch() {
    let (session, broker) = session_with_broker(device_config());
    let topics = TopicBuilder::new("PK", "DN");
    let exact_topic = topics.property_set("preset");
    assert_eq!(
        exact_topic,
        "sys/PK/DN/thingmodel/service/preset/propertySet/post"
    );

    let exact = RecordingSubscriber::new();
    let wildcard = RecordingSubscriber::new();
    session
        .subscribe(
            "sys/PK/DN/thingmodel/service/+/propertySet/post",
            QoS::AtLeastOnce,
            wildcard.clone(),
        )
        .unwrap();
    session
        .subscribe(&exact_topic, QoS::AtLeastOnce, exact.clone())
        .unwrap();
    connect_and_settle(&session).await;

    broker.inject_publish(&exact_topic, b"{\"p\":1}", QoS::AtMostOnce, None);
    broker.inject_publish(
        "sys/PK/DN/thingmodel/service/other/propertySet/post",
        b"{\"p\":2}",
        QoS::AtMostOnce,
        None,
    );
    broker.inject_publish("sys/PK/DN/unrelated", b"{}", QoS::AtMostOnce, None);
    pump(&session, 2).await;

    assert_eq!(
        exact.messages(),
        vec![(exact_topic.clone(), b"{\"p\":1}".to_vec())]
    );
    assert_eq!(wildcard.message_count(), 2);
    assert_eq!(wildcard.messages()[0].0, exact_topic);
    assert!(session.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_inbound_qos1_is_acknowledged() {
    let (session, broker) = session_with_broker(device_config());
    let subscriber = RecordingSubscriber::new();
    session
        .subscribe("sys/pk/dn/custom/#", QoS::AtLeastOnce, subscriber.clone())
        .unwrap();
    connect_and_settle(&session).await;

    broker.inject_publish("sys/pk/dn/custom/cmd", b"reboot", QoS::AtLeastOnce, Some(77));
    pump(&session, 2).await;

    assert_eq!(subscriber.message_count(), 1);
    assert_eq!(broker.count_sent("PUBACK"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_callback_can_publish_and_subscribe() {
    let (session, broker) = session_with_broker(device_config());
    let weak = Arc::downgrade(&session);
    let nested = RecordingSubscriber::new();
    let nested_handle = nested.clone();
    session
        .subscribe(
            "in/#",
            QoS::AtLeastOnce,
            subscriber_fn(move |_topic, _payload| {
                let Some(session) = weak.upgrade() else {
                    return;
                };
                session
                    .publish("reply/x", "pong", QoS::AtMostOnce)
                    .unwrap();
                session
                    .subscribe("more/+", QoS::AtLeastOnce, nested_handle.clone())
                    .unwrap();
            }),
        )
        .unwrap();
    connect_and_settle(&session).await;

    broker.inject_publish("in/x", b"ping", QoS::AtMostOnce, None);
    pump(&session, 3).await;

    assert!(broker.published_topics().contains(&"reply/x".to_string()));
    assert_eq!(session.subscriptions(), vec!["in/#", "more/+"]);
    assert_eq!(session.pending_operations(), 0);

    broker.inject_publish("more/1", b"{}", QoS::AtMostOnce, None);
    pump(&session, 2).await;
    assert_eq!(nested.message_count(), 1);
    assert!(session.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_blocked_writes_are_flushed_later() {
    let (session, broker) = session_with_broker(device_config());
    connect_and_settle(&session).await;

    broker.set_write_blocked(true);
    session
        .publish("sys/pk/dn/custom/up", "queued", QoS::AtMostOnce)
        .unwrap();
    pump(&session, 2).await;
    assert!(broker.published_topics().is_empty());

    broker.set_write_blocked(false);
    pump(&session, 2).await;
    assert_eq!(broker.published_topics(), vec!["sys/pk/dn/custom/up"]);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_topics_rejected() {
    let (session, _broker) = session_with_broker(device_config());
    connect_and_settle(&session).await;

    assert!(session
        .publish("sys/+/dn/custom/up", "x", QoS::AtMostOnce)
        .is_err());
    assert!(session
        .subscribe("sys/#/dn", QoS::AtMostOnce, RecordingSubscriber::new())
        .is_err());
    assert_eq!(session.pending_operations(), 0);
}
