//! Shared session state: upstream cookies plus an optional bearer token
//!
//! The login flow and the browser session keeper both write here; every
//! forwarded request reads a snapshot.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Accumulated upstream session: cookie name/value pairs and an optional
/// bearer token recorded by a successful login.
#[derive(Debug, Clone, Default)]
pub struct Session {
    cookies: BTreeMap<String, String>,
    access_token: Option<String>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge cookies into this session, consuming and returning it.
    /// Same-name cookies are overwritten, all others are retained.
    pub fn with_cookies(mut self, cookies: impl IntoIterator<Item = (String, String)>) -> Self {
        self.cookies.extend(cookies);
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn cookies(&self) -> &BTreeMap<String, String> {
        &self.cookies
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    /// Render the cookies as a `Cookie` header value, or `None` when the
    /// session holds no cookies.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        let header = self
            .cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ");
        Some(header)
    }
}

/// Process-wide holder of the current [`Session`].
///
/// Concurrent readers take cloned snapshots; writers (a finished login or the
/// browser refresh task) merge under a single write lock.
#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<RwLock<Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Immutable snapshot of the current session.
    pub fn snapshot(&self) -> Session {
        self.inner.read().clone()
    }

    /// Merge cookies into the stored session.
    pub fn merge_cookies(&self, cookies: impl IntoIterator<Item = (String, String)>) {
        self.inner.write().cookies.extend(cookies);
    }

    /// Merge a whole session: its cookies, and its access token when set.
    pub fn merge(&self, session: &Session) {
        let mut guard = self.inner.write();
        guard
            .cookies
            .extend(session.cookies.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(token) = &session.access_token {
            guard.access_token = Some(token.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_cookies_overwrites_same_name() {
        let session = Session::new()
            .with_cookies([("a".to_string(), "1".to_string())])
            .with_cookies([
                ("a".to_string(), "2".to_string()),
                ("b".to_string(), "3".to_string()),
            ]);

        assert_eq!(session.cookies().get("a"), Some(&"2".to_string()));
        assert_eq!(session.cookies().get("b"), Some(&"3".to_string()));
    }

    #[test]
    fn test_cookie_header_format() {
        let session = Session::new().with_cookies([
            ("session".to_string(), "abc".to_string()),
            ("cf".to_string(), "xyz".to_string()),
        ]);

        // BTreeMap keeps names ordered, so the header is deterministic
        assert_eq!(session.cookie_header().unwrap(), "cf=xyz; session=abc");
        assert_eq!(Session::new().cookie_header(), None);
    }

    #[test]
    fn test_snapshot_is_isolated() {
        let store = SessionStore::new();
        store.merge_cookies([("a".to_string(), "1".to_string())]);

        let snapshot = store.snapshot();
        store.merge_cookies([("b".to_string(), "2".to_string())]);

        assert!(!snapshot.cookies().contains_key("b"));
        assert!(store.snapshot().cookies().contains_key("b"));
    }

    #[test]
    fn test_merge_keeps_existing_token() {
        let store = SessionStore::new();
        store.merge(&Session::new().with_access_token("token-1"));
        store.merge(&Session::new().with_cookies([("a".to_string(), "1".to_string())]));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.access_token(), Some("token-1"));
        assert_eq!(snapshot.cookies().get("a"), Some(&"1".to_string()));
    }
}
