//! In-memory session state
//!
//! A session records what a client is subscribed to and its will message,
//! keyed by client-id. Sessions survive disconnects so a clean-session=0
//! reconnect can re-attach its subscriptions; delivery state beyond
//! "subscribed with QoS x" is not tracked.

use std::sync::Arc;

use ahash::AHashMap;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::protocol::{Publish, QoS};

/// Connection status recorded on the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Disconnected,
}

/// Per-client session record.
pub struct Session {
    pub client_id: Arc<str>,
    /// Clean-session flag from the most recent CONNECT. Clean sessions are
    /// dropped entirely when their connection closes.
    pub clean: bool,
    /// Subscribed filters and their granted QoS, keyed by the filter string
    /// exactly as received (`$share/...` included).
    pub filters: AHashMap<String, QoS>,
    /// Will message registered at CONNECT, if any.
    pub will: Option<Publish>,
    pub state: SessionState,
}

impl Session {
    pub fn new(client_id: Arc<str>) -> Self {
        Self {
            client_id,
            clean: true,
            filters: AHashMap::with_capacity(8),
            will: None,
            state: SessionState::Connected,
        }
    }

    pub fn add_filter(&mut self, filter: String, qos: QoS) {
        self.filters.insert(filter, qos);
    }

    pub fn remove_filter(&mut self, filter: &str) -> bool {
        self.filters.remove(filter).is_some()
    }
}

/// Thread-safe session store.
pub struct SessionStore {
    sessions: DashMap<Arc<str>, Arc<RwLock<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Look up the session for a client-id.
    pub fn get(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(client_id).map(|r| r.clone())
    }

    /// Fetch the session for a connecting client.
    ///
    /// clean-session=1 always installs a fresh session. clean-session=0
    /// resumes an existing one (marking it connected) or creates it; the
    /// returned flag says whether prior state was resumed.
    pub fn get_or_create(
        &self,
        client_id: &str,
        clean_session: bool,
    ) -> (Arc<RwLock<Session>>, bool) {
        let client_id: Arc<str> = client_id.into();

        if !clean_session {
            if let Some(session) = self.sessions.get(&client_id) {
                let mut s = session.write();
                s.state = SessionState::Connected;
                s.will = None;
                drop(s);
                return (session.clone(), true);
            }
        }

        let session = Arc::new(RwLock::new(Session::new(client_id.clone())));
        self.sessions.insert(client_id, session.clone());
        (session, false)
    }

    /// Mark a session disconnected, keeping its filter map for resume.
    pub fn disconnect(&self, client_id: &str) {
        if let Some(session) = self.sessions.get(client_id) {
            let mut s = session.write();
            s.state = SessionState::Disconnected;
            s.will = None;
        }
    }

    /// Drop a session entirely.
    pub fn remove(&self, client_id: &str) {
        self.sessions.remove(client_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_session_replaces_prior_state() {
        let store = SessionStore::new();
        let (session, resumed) = store.get_or_create("c1", false);
        assert!(!resumed);
        session.write().add_filter("a/+".to_string(), QoS::AtLeastOnce);

        let (session, resumed) = store.get_or_create("c1", true);
        assert!(!resumed);
        assert!(session.read().filters.is_empty());
    }

    #[test]
    fn persistent_session_resumes_filters() {
        let store = SessionStore::new();
        let (session, _) = store.get_or_create("c1", false);
        session.write().add_filter("a/+".to_string(), QoS::AtLeastOnce);
        store.disconnect("c1");

        let (session, resumed) = store.get_or_create("c1", false);
        assert!(resumed);
        let s = session.read();
        assert_eq!(s.state, SessionState::Connected);
        assert_eq!(s.filters.get("a/+"), Some(&QoS::AtLeastOnce));
    }

    #[test]
    fn disconnect_clears_will_but_keeps_filters() {
        let store = SessionStore::new();
        let (session, _) = store.get_or_create("c1", false);
        {
            let mut s = session.write();
            s.add_filter("a".to_string(), QoS::AtMostOnce);
            s.will = Some(Publish {
                topic: "gone".into(),
                ..Default::default()
            });
        }
        store.disconnect("c1");
        let s = session.read();
        assert_eq!(s.state, SessionState::Disconnected);
        assert!(s.will.is_none());
        assert_eq!(s.filters.len(), 1);
    }

    #[test]
    fn remove_drops_session() {
        let store = SessionStore::new();
        store.get_or_create("c1", false);
        assert_eq!(store.len(), 1);
        store.remove("c1");
        assert!(store.is_empty());
    }
}
