use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::session::Session;

/// How many configuration requests a new session may consume before it is
/// given up on and muted.
pub const NEW_SESSION_REQUESTS: i32 = 4;

/// Session plus the sender-owned bookkeeping: whether the server-side beacon
/// configuration was applied yet, whether the session is finished, and the
/// remaining configuration-request budget.
pub struct SessionWrapper {
    session: Session,
    beacon_config_set: AtomicBool,
    finished: AtomicBool,
    new_session_requests_left: AtomicI32,
}

impl SessionWrapper {
    fn new(session: Session) -> Self {
        Self {
            session,
            beacon_config_set: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            new_session_requests_left: AtomicI32::new(NEW_SESSION_REQUESTS),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_id(&self) -> i32 {
        self.session.session_id()
    }

    pub fn is_configured(&self) -> bool {
        self.beacon_config_set.load(Ordering::SeqCst)
    }

    /// Apply the server-assigned multiplicity and mark the session
    /// configured. Multiplicity 0 mutes the session entirely.
    pub fn update_configuration(&self, multiplicity: i32) {
        if let Some(beacon) = self.session.beacon() {
            beacon.set_multiplicity(multiplicity);
            if multiplicity <= 0 {
                beacon.clear_data();
            }
        }
        self.beacon_config_set.store(true, Ordering::SeqCst);
    }

    pub fn can_send_new_session_request(&self) -> bool {
        self.new_session_requests_left.load(Ordering::SeqCst) > 0
    }

    pub fn decrease_new_session_requests(&self) {
        self.new_session_requests_left.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

/// Mutex-protected queue of session wrappers shared between sessions (which
/// finish themselves) and the sending worker (which categorizes and drains
/// them).
pub struct SessionRegistry {
    sessions: Mutex<Vec<Arc<SessionWrapper>>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Register a freshly started session.
    pub fn put(&self, session: Session) {
        self.sessions
            .lock()
            .push(Arc::new(SessionWrapper::new(session)));
    }

    /// Mark the session with the given id as finished.
    pub fn finish_session(&self, session_id: i32) {
        let sessions = self.sessions.lock();
        if let Some(wrapper) = sessions.iter().find(|w| w.session_id() == session_id) {
            wrapper.finish();
        }
    }

    /// Sessions that still need their server-side beacon configuration.
    pub fn all_new_sessions(&self) -> Vec<Arc<SessionWrapper>> {
        self.sessions
            .lock()
            .iter()
            .filter(|w| !w.is_configured())
            .cloned()
            .collect()
    }

    /// Configured sessions that are still open.
    pub fn all_open_and_configured_sessions(&self) -> Vec<Arc<SessionWrapper>> {
        self.sessions
            .lock()
            .iter()
            .filter(|w| w.is_configured() && !w.is_finished())
            .cloned()
            .collect()
    }

    /// Configured sessions that have been ended and await transmission.
    pub fn all_finished_and_configured_sessions(&self) -> Vec<Arc<SessionWrapper>> {
        self.sessions
            .lock()
            .iter()
            .filter(|w| w.is_configured() && w.is_finished())
            .cloned()
            .collect()
    }

    /// All finished sessions, configured or not.
    pub fn all_finished_sessions(&self) -> Vec<Arc<SessionWrapper>> {
        self.sessions
            .lock()
            .iter()
            .filter(|w| w.is_finished())
            .cloned()
            .collect()
    }

    /// Remove one wrapper; true if it was present.
    pub fn remove(&self, wrapper: &Arc<SessionWrapper>) -> bool {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|w| !Arc::ptr_eq(w, wrapper));
        sessions.len() != before
    }

    /// Drain the registry, returning everything that was queued.
    pub fn take_all(&self) -> Vec<Arc<SessionWrapper>> {
        std::mem::take(&mut *self.sessions.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}
