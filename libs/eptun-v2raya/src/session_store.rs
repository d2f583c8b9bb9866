//! Process-wide v2rayA session state, keyed so that two configurations
//! pointed at different tenants (or different credentials against the
//! same tenant) never share a cookie jar or cached login.
//!
//! The teacher keeps this kind of thing as module-level mutable state;
//! here it's an explicit value a caller constructs and holds, per the
//! re-architecture note in the design notes — but still process-wide in
//! the one place that matters, the CLI entry point, which builds one
//! store and threads it through.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const COOKIE_REUSE_WINDOW: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub base_url: String,
    pub authorization: String,
    pub username: String,
    pub password: String,
}

impl SessionKey {
    pub fn new(base_url: &str, authorization: &str, username: &str, password: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            authorization: normalize_authorization(authorization),
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

fn normalize_authorization(raw: &str) -> String {
    raw.trim().to_string()
}

pub struct SessionState {
    pub client: reqwest::Client,
    pub authorization: Option<String>,
    pub cookie_session_ready: bool,
    pub last_login: Option<Instant>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .cookie_store(true)
                .build()
                .expect("reqwest client with cookie store"),
            authorization: None,
            cookie_session_ready: false,
            last_login: None,
        }
    }

    pub fn login_is_fresh(&self) -> bool {
        self.cookie_session_ready
            && self
                .last_login
                .map(|t| t.elapsed() < COOKIE_REUSE_WINDOW)
                .unwrap_or(false)
    }

    pub fn mark_logged_in(&mut self) {
        self.cookie_session_ready = true;
        self.last_login = Some(Instant::now());
    }
}

/// Process-wide map from session key to session state, one mutex per
/// entry so unrelated sessions never block each other.
#[derive(Default)]
pub struct SessionStateStore {
    entries: DashMap<SessionKey, Arc<Mutex<SessionState>>>,
}

impl SessionStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, key: SessionKey) -> Arc<Mutex<SessionState>> {
        self.entries
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(SessionState::new())))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_credentials_get_distinct_entries() {
        let store = SessionStateStore::new();
        let a = store.entry(SessionKey::new("http://h", "", "u1", "p"));
        let b = store.entry(SessionKey::new("http://h", "", "u2", "p"));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn same_key_reuses_entry() {
        let store = SessionStateStore::new();
        let a = store.entry(SessionKey::new("http://h", "Bearer x", "", ""));
        let b = store.entry(SessionKey::new("http://h", "Bearer x", "", ""));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn freshness_respects_reuse_window() {
        let mut state = SessionState::new();
        assert!(!state.login_is_fresh());
        state.mark_logged_in();
        assert!(state.login_is_fresh());
    }
}
