//! Topic tokenizing, matching and the subscription store
//!
//! Topics are `/`-separated level lists. Publish topics carry no wildcards;
//! subscribe filters may use `+` for a single level and a trailing `#` for
//! the remainder. Empty levels are legal and match literally.
//!
//! [`TopicStore`] wraps the trie in a reader-writer lock: matching runs
//! under the read lock, subscription and retained-message updates under the
//! write lock, so removal is synchronous with respect to further matches.

mod trie;

pub use trie::SubscriptionTrie;

use std::fmt;
use std::sync::{Arc, LazyLock, Weak};

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::RwLock;
use regex::Regex;
use smallvec::SmallVec;

use crate::broker::Connection;
use crate::protocol::QoS;

/// Shared subscriptions look like `$share/<group>/<filter>` with the group
/// limited to `[0-9A-Za-z_-]+`.
static SHARE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\$share/([0-9A-Za-z_-]+)/(.+)$").expect("static regex"));

/// Errors from topic validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    /// Empty topic string
    EmptyTopic,
    /// Publish topic contains `+` or `#`
    WildcardInPublish,
    /// Subscribe filter breaks a wildcard placement rule
    InvalidFilter(&'static str),
}

impl fmt::Display for TopicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyTopic => write!(f, "topic cannot be empty"),
            Self::WildcardInPublish => write!(f, "publish topic cannot contain wildcards"),
            Self::InvalidFilter(msg) => write!(f, "invalid topic filter: {}", msg),
        }
    }
}

impl std::error::Error for TopicError {}

/// Token list for a typical topic depth, heap-free up to eight levels.
pub type Levels<'a> = SmallVec<[&'a str; 8]>;

/// Split a publish topic into levels. Fails on any wildcard character.
pub fn split_publish(topic: &str) -> Result<Levels<'_>, TopicError> {
    if topic.is_empty() {
        return Err(TopicError::EmptyTopic);
    }
    let mut levels = Levels::new();
    for level in topic.split('/') {
        if level.contains('+') || level.contains('#') {
            return Err(TopicError::WildcardInPublish);
        }
        levels.push(level);
    }
    Ok(levels)
}

/// Split a subscribe filter into levels. `+` must occupy a whole level;
/// `#` must occupy the final level.
pub fn split_subscribe(filter: &str) -> Result<Levels<'_>, TopicError> {
    if filter.is_empty() {
        return Err(TopicError::EmptyTopic);
    }
    let mut levels = Levels::new();
    let last = filter.split('/').count() - 1;
    for (i, level) in filter.split('/').enumerate() {
        if level.contains('#') {
            if level != "#" {
                return Err(TopicError::InvalidFilter("'#' must occupy an entire level"));
            }
            if i != last {
                return Err(TopicError::InvalidFilter("'#' must be the final level"));
            }
        }
        if level.contains('+') && level != "+" {
            return Err(TopicError::InvalidFilter("'+' must occupy an entire level"));
        }
        levels.push(level);
    }
    Ok(levels)
}

/// Lockstep filter-against-topic match. A trailing `#` matches zero or more
/// remaining levels; `+` consumes exactly one.
pub fn matches(filter: &[&str], topic: &[&str]) -> bool {
    let mut fi = 0;
    let mut ti = 0;

    while fi < filter.len() {
        match filter[fi] {
            "#" => return true,
            "+" => {
                if ti >= topic.len() {
                    return false;
                }
            }
            level => {
                if ti >= topic.len() || level != topic[ti] {
                    return false;
                }
            }
        }
        fi += 1;
        ti += 1;
    }

    ti == topic.len()
}

/// Filter-against-filter match used by the ACL subscribe check: a `+` on
/// either side consumes any single level, so a pattern conservatively covers
/// every filter it could overlap with level-for-level.
pub fn matches_filter(pattern: &[&str], other: &[&str]) -> bool {
    let mut pi = 0;
    let mut oi = 0;

    while pi < pattern.len() {
        match pattern[pi] {
            "#" => return true,
            p => {
                if oi >= other.len() {
                    return false;
                }
                if p != "+" && other[oi] != "+" && p != other[oi] {
                    return false;
                }
            }
        }
        pi += 1;
        oi += 1;
    }

    oi == other.len()
}

/// Parse a `$share/<group>/<filter>` subscription into (group, inner filter).
pub fn parse_shared(filter: &str) -> Option<(&str, &str)> {
    let caps = SHARE_PATTERN.captures(filter)?;
    match (caps.get(1), caps.get(2)) {
        (Some(group), Some(inner)) => Some((group.as_str(), inner.as_str())),
        _ => None,
    }
}

/// A subscription record held by the trie.
///
/// The owning connection is referenced weakly: the connection's close path
/// removes the record under the trie write lock, so a matcher never delivers
/// to a freed connection, and a dead weak reference is simply skipped.
#[derive(Clone)]
pub struct Subscription {
    /// Stable id of the owning connection
    pub conn_id: u64,
    /// Owning connection, upgraded at delivery time
    pub conn: Weak<Connection>,
    /// Client identifier of the owner
    pub client_id: Arc<str>,
    /// Filter registered in the trie (the inner filter for shared subscriptions)
    pub filter: Arc<str>,
    /// Filter string exactly as received in SUBSCRIBE
    pub origin: Arc<str>,
    /// Granted QoS
    pub qos: QoS,
    /// Whether this is a `$share` subscription
    pub shared: bool,
    /// Share group name for shared subscriptions
    pub group: Option<Arc<str>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("client_id", &self.client_id)
            .field("filter", &self.filter)
            .field("qos", &self.qos)
            .field("shared", &self.shared)
            .field("group", &self.group)
            .finish()
    }
}

/// A retained message, keyed by its exact publish topic.
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
}

/// Thread-safe subscription and retained-message store.
pub struct TopicStore {
    trie: RwLock<SubscriptionTrie>,
}

impl TopicStore {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(SubscriptionTrie::new()),
        }
    }

    /// Register a subscription under its (inner) filter.
    /// Returns the granted QoS: `min(requested, 1)` since QoS 2 is never
    /// granted. A duplicate (client-id, group) on the same filter replaces
    /// the previous record.
    pub fn subscribe(&self, mut sub: Subscription) -> Result<QoS, TopicError> {
        let filter = sub.filter.clone();
        let tokens = split_subscribe(&filter)?;
        let granted = sub.qos.min(QoS::AtLeastOnce);
        sub.qos = granted;
        self.trie.write().subscribe(&tokens, sub);
        Ok(granted)
    }

    /// Remove the subscription registered under `filter` for this client
    /// (and group, for shared subscriptions). Returns whether one existed.
    pub fn unsubscribe(&self, filter: &str, client_id: &str, group: Option<&str>) -> bool {
        match split_subscribe(filter) {
            Ok(tokens) => self.trie.write().unsubscribe(&tokens, client_id, group),
            Err(_) => false,
        }
    }

    /// All subscriptions matching a publish topic, with duplicate
    /// (client-id, filter) entries collapsed to the highest QoS.
    pub fn matches(&self, topic: &str) -> Vec<Subscription> {
        let Ok(tokens) = split_publish(topic) else {
            return Vec::new();
        };

        let mut raw = Vec::new();
        self.trie
            .read()
            .matches(&tokens, topic.starts_with('$'), &mut raw);

        if raw.len() <= 1 {
            return raw;
        }

        let mut best: AHashMap<(Arc<str>, Arc<str>), Subscription> =
            AHashMap::with_capacity(raw.len());
        for sub in raw {
            let key = (sub.client_id.clone(), sub.origin.clone());
            match best.entry(key) {
                std::collections::hash_map::Entry::Occupied(mut e) => {
                    if sub.qos > e.get().qos {
                        e.insert(sub);
                    }
                }
                std::collections::hash_map::Entry::Vacant(v) => {
                    v.insert(sub);
                }
            }
        }
        best.into_values().collect()
    }

    /// Store or clear (empty payload) the retained message for a topic.
    pub fn retain(&self, msg: RetainedMessage) {
        let topic = msg.topic.clone();
        let Ok(tokens) = split_publish(&topic) else {
            return;
        };
        let mut trie = self.trie.write();
        if msg.payload.is_empty() {
            trie.clear_retained(&tokens);
        } else {
            trie.retain(&tokens, msg);
        }
    }

    /// All retained messages whose topic matches the filter.
    pub fn retained(&self, filter: &str) -> Vec<RetainedMessage> {
        let Ok(tokens) = split_subscribe(filter) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        self.trie.read().retained(&tokens, &mut out);
        out
    }

    /// True when no subscriptions or retained messages remain.
    pub fn is_empty(&self) -> bool {
        self.trie.read().is_empty()
    }
}

impl Default for TopicStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(client: &str, filter: &str, qos: QoS) -> Subscription {
        Subscription {
            conn_id: 0,
            conn: Weak::new(),
            client_id: client.into(),
            filter: filter.into(),
            origin: filter.into(),
            qos,
            shared: false,
            group: None,
        }
    }

    fn shared_sub(client: &str, group: &str, filter: &str, qos: QoS) -> Subscription {
        Subscription {
            conn_id: 0,
            conn: Weak::new(),
            client_id: client.into(),
            filter: filter.into(),
            origin: format!("$share/{}/{}", group, filter).into(),
            qos,
            shared: true,
            group: Some(group.into()),
        }
    }

    fn m(filter: &str, topic: &str) -> bool {
        matches(
            &split_subscribe(filter).expect("filter"),
            &split_publish(topic).expect("topic"),
        )
    }

    #[test]
    fn tokenizer_rejects_wildcard_publish() {
        assert!(split_publish("a/b").is_ok());
        assert!(split_publish("a//b").is_ok());
        assert_eq!(split_publish("a/+/b"), Err(TopicError::WildcardInPublish));
        assert_eq!(split_publish("a/#"), Err(TopicError::WildcardInPublish));
        assert_eq!(split_publish(""), Err(TopicError::EmptyTopic));
    }

    #[test]
    fn tokenizer_validates_filters() {
        assert!(split_subscribe("a/+/b").is_ok());
        assert!(split_subscribe("#").is_ok());
        assert!(split_subscribe("a/#").is_ok());
        assert!(split_subscribe("+/+").is_ok());
        assert!(split_subscribe("a/#/b").is_err());
        assert!(split_subscribe("a/b#").is_err());
        assert!(split_subscribe("a/b+/c").is_err());
    }

    #[test]
    fn matching_laws() {
        assert!(m("a/+/c", "a/b/c"));
        assert!(!m("a/+/c", "a/b/d"));
        assert!(m("a/#", "a"));
        assert!(m("a/#", "a/b/c/d"));
        assert!(m("+/tennis/#", "sport/tennis/player1"));
        assert!(m("sport/+", "sport/"));
        assert!(m("#", "anything/at/all"));
        assert!(!m("a/+", "a/b/c"));
        assert!(!m("a/b", "a"));
    }

    #[test]
    fn filter_on_filter_matching() {
        fn p(s: &str) -> Levels<'_> {
            split_subscribe(s).expect("filter")
        }
        assert!(matches_filter(&p("secret/alice"), &p("secret/alice")));
        assert!(matches_filter(&p("secret/+"), &p("secret/alice")));
        assert!(matches_filter(&p("secret/alice"), &p("secret/+")));
        assert!(matches_filter(&p("secret/#"), &p("secret/alice/keys")));
        assert!(!matches_filter(&p("secret/alice"), &p("secret/bob")));
        assert!(!matches_filter(&p("secret/alice"), &p("secret/alice/keys")));
    }

    #[test]
    fn shared_filter_parsing() {
        assert_eq!(parse_shared("$share/g1/work/#"), Some(("g1", "work/#")));
        assert_eq!(parse_shared("$share/a-b_C9/t"), Some(("a-b_C9", "t")));
        assert_eq!(parse_shared("$share//t"), None);
        assert_eq!(parse_shared("$share/g1/"), None);
        assert_eq!(parse_shared("$share/g 1/t"), None);
        assert_eq!(parse_shared("work/#"), None);
    }

    #[test]
    fn store_grants_at_most_qos1() {
        let store = TopicStore::new();
        let granted = store
            .subscribe(sub("c1", "a/b", QoS::ExactlyOnce))
            .expect("subscribe");
        assert_eq!(granted, QoS::AtLeastOnce);
    }

    #[test]
    fn subscribe_unsubscribe_roundtrip() {
        let store = TopicStore::new();
        store.subscribe(sub("c1", "a/+", QoS::AtLeastOnce)).unwrap();
        assert_eq!(store.matches("a/b").len(), 1);
        assert!(store.unsubscribe("a/+", "c1", None));
        assert!(store.matches("a/b").is_empty());
        assert!(store.is_empty());
        assert!(!store.unsubscribe("a/+", "c1", None));
    }

    #[test]
    fn duplicate_subscribe_updates_qos_in_place() {
        let store = TopicStore::new();
        store.subscribe(sub("c1", "a/b", QoS::AtMostOnce)).unwrap();
        store.subscribe(sub("c1", "a/b", QoS::AtLeastOnce)).unwrap();
        let matched = store.matches("a/b");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].qos, QoS::AtLeastOnce);
    }

    #[test]
    fn overlapping_filters_collapse_to_one_per_filter() {
        let store = TopicStore::new();
        store.subscribe(sub("c1", "a/#", QoS::AtMostOnce)).unwrap();
        store.subscribe(sub("c1", "a/+", QoS::AtLeastOnce)).unwrap();
        // Two distinct filters survive; dedup to one delivery happens at dispatch
        assert_eq!(store.matches("a/b").len(), 2);
    }

    #[test]
    fn shared_and_exclusive_coexist() {
        let store = TopicStore::new();
        store
            .subscribe(shared_sub("c1", "g1", "work/#", QoS::AtMostOnce))
            .unwrap();
        store.subscribe(sub("c1", "work/#", QoS::AtMostOnce)).unwrap();
        let matched = store.matches("work/x");
        assert_eq!(matched.len(), 2);
        assert!(store.unsubscribe("work/#", "c1", Some("g1")));
        assert_eq!(store.matches("work/x").len(), 1);
    }

    #[test]
    fn sys_topics_do_not_match_root_wildcards() {
        let store = TopicStore::new();
        store.subscribe(sub("c1", "#", QoS::AtMostOnce)).unwrap();
        store.subscribe(sub("c2", "+/x", QoS::AtMostOnce)).unwrap();
        store.subscribe(sub("c3", "$SYS/#", QoS::AtMostOnce)).unwrap();
        let matched = store.matches("$SYS/x");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].client_id.as_ref(), "c3");
    }

    #[test]
    fn retained_roundtrip() {
        let store = TopicStore::new();
        let msg = RetainedMessage {
            topic: "a/b".into(),
            payload: Bytes::from_static(b"hello"),
            qos: QoS::AtLeastOnce,
        };
        store.retain(msg);

        let found = store.retained("a/b");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].payload.as_ref(), b"hello");

        // Empty payload clears the slot and prunes the path
        store.retain(RetainedMessage {
            topic: "a/b".into(),
            payload: Bytes::new(),
            qos: QoS::AtMostOnce,
        });
        assert!(store.retained("a/b").is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn retained_wildcard_expansion() {
        let store = TopicStore::new();
        for (topic, payload) in [("a/b", "1"), ("a/c", "2"), ("a/b/d", "3"), ("x/y", "4")] {
            store.retain(RetainedMessage {
                topic: topic.into(),
                payload: Bytes::from(payload.as_bytes().to_vec()),
                qos: QoS::AtMostOnce,
            });
        }

        assert_eq!(store.retained("a/+").len(), 2);
        assert_eq!(store.retained("a/#").len(), 3);
        assert_eq!(store.retained("#").len(), 4);
        assert_eq!(store.retained("a/b").len(), 1);
        assert!(store.retained("b/+").is_empty());
    }

    #[test]
    fn retained_sys_topics_hidden_from_root_wildcards() {
        let store = TopicStore::new();
        store.retain(RetainedMessage {
            topic: "$SYS/stats".into(),
            payload: Bytes::from_static(b"x"),
            qos: QoS::AtMostOnce,
        });
        assert!(store.retained("#").is_empty());
        assert!(store.retained("+/stats").is_empty());
        assert_eq!(store.retained("$SYS/stats").len(), 1);
    }
}
