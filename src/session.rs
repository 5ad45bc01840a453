//! Per-browser SP sessions and the steps that establish them.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::{utils::random_string, SamlError};

const SESSION_ID_LEN: usize = 43;

/// The authenticated subject, as stated by a verified assertion.
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    pub name_id: String,
    pub session_index: Option<String>,
    pub attributes: Vec<(String, Vec<String>)>,
}

#[derive(Debug, Clone)]
pub struct Session {
    authenticated: bool,
    goto_url: Option<String>,
    authn_request_id: Option<String>,
    principal: Option<Principal>,
    last_seen: Instant,
}

impl Default for Session {
    fn default() -> Self {
        Session {
            authenticated: false,
            goto_url: None,
            authn_request_id: None,
            principal: None,
            last_seen: Instant::now(),
        }
    }
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn goto_url(&self) -> Option<&str> {
        self.goto_url.as_deref()
    }

    /// Replaces any previously stored return URL.
    pub fn set_goto_url(&mut self, url: &str) {
        self.goto_url = Some(url.into());
    }

    pub fn authn_request_id(&self) -> Option<&str> {
        self.authn_request_id.as_deref()
    }

    pub fn set_authn_request_id(&mut self, id: &str) {
        self.authn_request_id = Some(id.into());
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }
}

pub fn mark_authenticated(session: &mut Session, principal: Principal) {
    session.authenticated = true;
    session.authn_request_id = None;
    session.principal = Some(principal);
}

/// Takes the return URL off the session. A session that never went through the
/// access filter has none, which is an error.
pub fn consume_goto_url(session: &mut Session) -> Result<String, SamlError> {
    session.goto_url.take().ok_or(SamlError::MissingGotoUrl)
}

/// Finishes the login answering `authn_request_id` and returns the return URL.
///
/// The session must still be waiting on that request. Nothing is changed
/// unless every step succeeds.
pub fn establish(
    session: &mut Session,
    authn_request_id: &str,
    principal: Principal,
) -> Result<String, SamlError> {
    if session.authn_request_id() != Some(authn_request_id) {
        return Err(SamlError::Correlation(format!(
            "AuthnRequest {authn_request_id:?} is no longer pending"
        )));
    }
    let goto_url = consume_goto_url(session)?;
    mark_authenticated(session, principal);
    Ok(goto_url)
}

/// In-memory session store keyed by the session cookie value.
#[derive(Debug)]
pub struct SessionStore {
    sessions: DashMap<String, Session>,
    idle_timeout: Duration,
}

impl SessionStore {
    pub fn new(idle_timeout: Duration) -> Self {
        SessionStore {
            sessions: DashMap::new(),
            idle_timeout,
        }
    }

    /// Starts a fresh session and returns its id.
    pub fn create(&self) -> String {
        let id = random_string(SESSION_ID_LEN);
        self.sessions.insert(id.clone(), Session::default());
        tracing::debug!(session = %short(&id), "session created");
        id
    }

    /// A snapshot of the session; idle sessions are dropped instead.
    pub fn get(&self, id: &str) -> Option<Session> {
        self.update(id, |session| session.clone()).ok()
    }

    /// Runs `f` on the live session under its entry lock.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut Session) -> R) -> Result<R, SamlError> {
        {
            let mut entry = self.sessions.get_mut(id).ok_or(SamlError::UnknownSession)?;
            if entry.last_seen.elapsed() < self.idle_timeout {
                entry.last_seen = Instant::now();
                return Ok(f(&mut entry));
            }
        }
        self.destroy(id);
        Err(SamlError::UnknownSession)
    }

    pub fn destroy(&self, id: &str) {
        if self.sessions.remove(id).is_some() {
            tracing::debug!(session = %short(id), "session destroyed");
        }
    }

    pub fn purge_idle(&self) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| session.last_seen.elapsed() < self.idle_timeout);
        before - self.sessions.len()
    }
}

// Session ids are bearer secrets; only a prefix goes into logs.
fn short(id: &str) -> &str {
    &id[..id.len().min(8)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal() -> Principal {
        Principal {
            name_id: "_subject".into(),
            session_index: None,
            attributes: vec![("username".into(), vec!["bob".into()])],
        }
    }

    #[test]
    fn goto_url_is_consumed_once() {
        let mut session = Session::default();
        session.set_goto_url("http://sp/app/first");
        session.set_goto_url("http://sp/app/second");
        assert_eq!(consume_goto_url(&mut session).unwrap(), "http://sp/app/second");
        assert!(matches!(
            consume_goto_url(&mut session),
            Err(SamlError::MissingGotoUrl)
        ));
    }

    #[test]
    fn marking_authenticated_records_principal() {
        let mut session = Session::default();
        session.set_authn_request_id("_req");
        mark_authenticated(&mut session, principal());
        assert!(session.is_authenticated());
        assert_eq!(session.principal(), Some(&principal()));
        assert_eq!(session.authn_request_id(), None);
    }

    #[test]
    fn establishing_consumes_pending_request() {
        let mut session = Session::default();
        session.set_authn_request_id("_req");
        session.set_goto_url("http://sp/app");
        assert_eq!(
            establish(&mut session, "_req", principal()).unwrap(),
            "http://sp/app"
        );
        assert!(session.is_authenticated());

        session.set_goto_url("http://sp/app");
        assert!(matches!(
            establish(&mut session, "_req", principal()),
            Err(SamlError::Correlation(_))
        ));
    }

    #[test]
    fn failed_establish_leaves_session_untouched() {
        let mut session = Session::default();
        session.set_authn_request_id("_req");
        assert!(matches!(
            establish(&mut session, "_req", principal()),
            Err(SamlError::MissingGotoUrl)
        ));
        assert!(!session.is_authenticated());
        assert_eq!(session.principal(), None);
        assert_eq!(session.authn_request_id(), Some("_req"));
    }

    #[test]
    fn store_isolates_sessions() {
        let store = SessionStore::new(Duration::from_secs(60));
        let a = store.create();
        let b = store.create();
        assert_ne!(a, b);

        store
            .update(&a, |session| mark_authenticated(session, principal()))
            .unwrap();
        assert!(store.get(&a).unwrap().is_authenticated());
        assert!(!store.get(&b).unwrap().is_authenticated());

        store.destroy(&a);
        assert!(store.get(&a).is_none());
        assert!(matches!(
            store.update(&a, |_| ()),
            Err(SamlError::UnknownSession)
        ));
    }

    #[test]
    fn idle_sessions_expire() {
        let store = SessionStore::new(Duration::ZERO);
        let id = store.create();
        assert!(store.get(&id).is_none());

        store.create();
        assert_eq!(store.purge_idle(), 1);
    }
}
