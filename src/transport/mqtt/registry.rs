//! Subscription registry and topic filter matching
//!
//! The registry is the authoritative record of what the application wants to
//! receive. It outlives individual connections: entries are replayed as fresh
//! SUBSCRIBEs after every successful CONNACK. The session wraps it in a mutex;
//! the type itself is plain data.

use super::codec::QoS;
use super::subscriber::Subscriber;
use crate::error::{SessionError, SessionResult};
use std::fmt;
use std::sync::Arc;

/// One registered topic filter
#[derive(Clone)]
pub struct TopicSubscription {
    pub filter: String,
    pub qos: QoS,
    pub subscriber: Arc<dyn Subscriber>,
}

impl TopicSubscription {
    pub fn new(filter: impl Into<String>, qos: QoS, subscriber: Arc<dyn Subscriber>) -> Self {
        Self {
            filter: filter.into(),
            qos,
            subscriber,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.filter.contains(['+', '#'])
    }
}

impl fmt::Debug for TopicSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicSubscription")
            .field("filter", &self.filter)
            .field("qos", &self.qos)
            .finish_non_exhaustive()
    }
}

/// Filters in insertion order, unique by filter string
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Vec<TopicSubscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by filter. Returns true when the filter is new.
    ///
    /// A replaced entry keeps its original position so replay order is stable.
    pub fn upsert(&mut self, subscription: TopicSubscription) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|entry| entry.filter == subscription.filter)
        {
            Some(existing) => {
                *existing = subscription;
                false
            }
            None => {
                self.entries.push(subscription);
                true
            }
        }
    }

    pub fn remove(&mut self, filter: &str) -> Option<TopicSubscription> {
        let index = self.entries.iter().position(|entry| entry.filter == filter)?;
        Some(self.entries.remove(index))
    }

    pub fn get(&self, filter: &str) -> Option<&TopicSubscription> {
        self.entries.iter().find(|entry| entry.filter == filter)
    }

    /// Best single match for an inbound topic: the exact filter if present,
    /// otherwise the first matching wildcard
    pub fn find(&self, topic: &str) -> Option<&TopicSubscription> {
        self.get(topic).or_else(|| {
            self.entries
                .iter()
                .find(|entry| entry.is_wildcard() && topic_matches_filter(topic, &entry.filter))
        })
    }

    /// Every subscription whose filter matches `topic`: the exact-match entry
    /// first, then wildcard entries in registration order
    pub fn matching(&self, topic: &str) -> Vec<TopicSubscription> {
        let mut matches: Vec<TopicSubscription> = self.get(topic).cloned().into_iter().collect();
        matches.extend(
            self.entries
                .iter()
                .filter(|entry| entry.is_wildcard() && topic_matches_filter(topic, &entry.filter))
                .cloned(),
        );
        matches
    }

    /// Ordered copy used for reconnect replay
    pub fn snapshot(&self) -> Vec<TopicSubscription> {
        self.entries.clone()
    }

    pub fn filters(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.filter.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Match a concrete topic against a filter with `+` and `#` wildcards.
///
/// Topics starting with `$` are not matched by a leading wildcard.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Reject filters the broker would refuse
pub fn validate_filter(filter: &str) -> SessionResult<()> {
    if filter.is_empty() {
        return Err(SessionError::invalid_argument("topic filter must not be empty"));
    }
    if filter.len() > usize::from(u16::MAX) {
        return Err(SessionError::invalid_argument("topic filter too long"));
    }
    if filter.contains('\0') {
        return Err(SessionError::invalid_argument("topic filter contains NUL"));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || index != levels.len() - 1) {
            return Err(SessionError::invalid_argument(format!(
                "'#' must be the last level on its own in '{filter}'"
            )));
        }
        if level.contains('+') && *level != "+" {
            return Err(SessionError::invalid_argument(format!(
                "'+' must occupy a whole level in '{filter}'"
            )));
        }
    }
    Ok(())
}

/// Reject publish topics: empty, or containing wildcards
pub fn validate_topic(topic: &str) -> SessionResult<()> {
    if topic.is_empty() {
        return Err(SessionError::invalid_argument("topic must not be empty"));
    }
    if topic.contains(['+', '#', '\0']) {
        return Err(SessionError::invalid_argument(format!(
            "publish topic '{topic}' must not contain wildcards"
        )));
    }
    if topic.len() > usize::from(u16::MAX) {
        return Err(SessionError::invalid_argument("topic too long"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mqtt::subscriber::subscriber_fn;
    use proptest::prelude::*;

    fn sub(filter: &str) -> TopicSubscription {
        TopicSubscription::new(filter, QoS::AtLeastOnce, subscriber_fn(|_, _| {}))
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let mut registry = SubscriptionRegistry::new();
        assert!(registry.upsert(sub("a/b")));
        assert!(registry.upsert(sub("c/#")));
        assert!(!registry.upsert(sub("a/b")));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.filters(), vec!["a/b", "c/#"]);
    }

    #[test]
    fn test_remove() {
        let mut registry = SubscriptionRegistry::new();
        registry.upsert(sub("a/b"));
        assert!(registry.remove("a/b").is_some());
        assert!(registry.remove("a/b").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_matching_exact_first_then_wildcards_in_order() {
        let mut registry = SubscriptionRegistry::new();
        registry.upsert(sub("sys/PK/DN/#"));
        registry.upsert(sub("sys/PK/DN/thingmodel/service/+/propertySet/post"));
        registry.upsert(sub("sys/PK/DN/thingmodel/service/preset/propertySet/post"));
        registry.upsert(sub("other/topic"));

        let topic = "sys/PK/DN/thingmodel/service/preset/propertySet/post";
        let filters: Vec<String> = registry
            .matching(topic)
            .into_iter()
            .map(|s| s.filter)
            .collect();

        assert_eq!(
            filters,
            vec![
                "sys/PK/DN/thingmodel/service/preset/propertySet/post",
                "sys/PK/DN/#",
                "sys/PK/DN/thingmodel/service/+/propertySet/post",
            ]
        );
        assert_eq!(registry.find(topic).unwrap().filter, topic);
    }

    #[test]
    fn test_find_falls_back_to_wildcard() {
        let mut registry = SubscriptionRegistry::new();
        registry.upsert(sub("a/+/c"));
        assert_eq!(registry.find("a/b/c").unwrap().filter, "a/+/c");
        assert!(registry.find("a/b/d").is_none());
    }

    #[test]
    fn test_wildcard_rules() {
        assert!(topic_matches_filter("a/b/c", "a/b/c"));
        assert!(topic_matches_filter("a/b/c", "a/+/c"));
        assert!(topic_matches_filter("a/b/c", "a/#"));
        assert!(topic_matches_filter("a", "a/#"));
        assert!(topic_matches_filter("a/b/c", "#"));
        assert!(topic_matches_filter("/finance", "+/+"));
        assert!(!topic_matches_filter("a/b/c", "a/+"));
        assert!(!topic_matches_filter("a/b", "a/b/c"));
        assert!(!topic_matches_filter("$SYS/broker", "#"));
        assert!(!topic_matches_filter("$SYS/broker", "+/broker"));
        assert!(topic_matches_filter("$SYS/broker", "$SYS/#"));
    }

    #[test]
    fn test_validate_filter() {
        assert!(validate_filter("").is_err());
        assert!(validate_filter("a/#/b").is_err());
        assert!(validate_filter("a/b#").is_err());
        assert!(validate_filter("a/b+/c").is_err());
        assert!(validate_filter("a/+/c/#").is_ok());
        assert!(validate_filter("#").is_ok());
    }

    #[test]
    fn test_validate_topic() {
        assert!(validate_topic("").is_err());
        assert!(validate_topic("a/+").is_err());
        assert!(validate_topic("a/b").is_ok());
    }

    proptest! {
        #[test]
        fn prop_topic_matches_itself(levels in proptest::collection::vec("[a-z0-9]{1,6}", 1..6)) {
            let topic = levels.join("/");
            prop_assert!(topic_matches_filter(&topic, &topic));
            prop_assert!(topic_matches_filter(&topic, "#"));
        }

        #[test]
        fn prop_single_level_wildcard(levels in proptest::collection::vec("[a-z0-9]{1,6}", 2..6), pick in 0usize..6) {
            let topic = levels.join("/");
            let index = pick % levels.len();
            let mut filter_levels = levels.clone();
            filter_levels[index] = "+".to_string();
            prop_assert!(topic_matches_filter(&topic, &filter_levels.join("/")));

            // One level too deep never matches through '+'
            let deeper = format!("{topic}/extra");
            prop_assert!(!topic_matches_filter(&deeper, &filter_levels.join("/")));
        }
    }
}
