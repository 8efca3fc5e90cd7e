pub mod action;
pub mod web_request;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::protocol::beacon::Beacon;
use crate::protocol::client::ApiClient;
use crate::protocol::response::StatusResponse;
use crate::sender::registry::SessionRegistry;

use self::action::RootAction;

/// An open monitoring session.
///
/// Cheap to clone; all clones refer to the same session. Every method is
/// safe to call at any time: after [`Session::end`] (or on the inert
/// variant handed out after agent shutdown) calls turn into no-ops and
/// child objects degrade the same way.
#[derive(Clone)]
pub struct Session {
    inner: Option<Arc<SessionInner>>,
}

pub(crate) struct SessionInner {
    beacon: Arc<Beacon>,
    registry: Arc<SessionRegistry>,
    /// −1 while the session is open.
    end_time: AtomicI64,
    open_root_actions: Mutex<Vec<RootAction>>,
}

impl Session {
    pub(crate) fn new(beacon: Arc<Beacon>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            inner: Some(Arc::new(SessionInner {
                beacon,
                registry,
                end_time: AtomicI64::new(-1),
                open_root_actions: Mutex::new(Vec::new()),
            })),
        }
    }

    /// Inert session that records nothing; returned after agent shutdown.
    pub(crate) fn inert() -> Self {
        Self { inner: None }
    }

    /// Emit the session-start record.
    pub(crate) fn start(&self) {
        if let Some(inner) = &self.inner {
            inner.beacon.start_session();
        }
    }

    pub(crate) fn beacon(&self) -> Option<&Arc<Beacon>> {
        self.inner.as_ref().map(|inner| &inner.beacon)
    }

    /// Session number, or 0 for the inert variant.
    pub fn session_id(&self) -> i32 {
        self.inner
            .as_ref()
            .map(|inner| inner.beacon.session_number())
            .unwrap_or(0)
    }

    /// Open a top-level action. A blank name or a closed session yields an
    /// inert action.
    pub fn enter_action(&self, name: &str) -> RootAction {
        let Some(inner) = &self.inner else {
            return RootAction::inert();
        };

        if name.trim().is_empty() {
            warn!("enter_action: name must not be empty");
            return RootAction::inert();
        }

        if self.is_session_ended() {
            return RootAction::inert();
        }

        let action = RootAction::open(Arc::clone(&inner.beacon), Arc::downgrade(inner), name);
        inner.open_root_actions.lock().push(action.clone());
        action
    }

    /// Tag the session with a user identifier. Blank tags are dropped.
    pub fn identify_user(&self, user_tag: &str) {
        let Some(inner) = &self.inner else {
            return;
        };

        if user_tag.trim().is_empty() {
            warn!("identify_user: tag must not be empty");
            return;
        }

        if self.is_session_ended() {
            return;
        }

        inner.beacon.identify_user(user_tag);
    }

    /// Report an unrecoverable crash. A blank name is dropped.
    pub fn report_crash(&self, error_name: &str, reason: &str, stacktrace: &str) {
        let Some(inner) = &self.inner else {
            return;
        };

        if error_name.trim().is_empty() {
            warn!("report_crash: error name must not be empty");
            return;
        }

        if self.is_session_ended() {
            return;
        }

        inner.beacon.report_crash(error_name, reason, stacktrace);
    }

    /// End the session. Only the first call takes effect: it closes all open
    /// root actions, emits the session-end record and hands the session to
    /// the sender for final transmission.
    pub fn end(&self) {
        let Some(inner) = &self.inner else {
            return;
        };

        let end_time = inner.beacon.current_timestamp();
        if inner
            .end_time
            .compare_exchange(-1, end_time, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        debug!(session = inner.beacon.session_number(), "ending session");

        let open_actions: Vec<RootAction> =
            std::mem::take(&mut *inner.open_root_actions.lock());
        for action in open_actions {
            action.leave_action();
        }

        inner.beacon.end_session(end_time);
        inner.registry.finish_session(inner.beacon.session_number());
    }

    /// End time in milliseconds, or −1 while the session is open.
    pub fn end_time(&self) -> i64 {
        self.inner
            .as_ref()
            .map(|inner| inner.end_time.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn is_session_ended(&self) -> bool {
        match &self.inner {
            Some(inner) => inner.end_time.load(Ordering::SeqCst) != -1,
            None => true,
        }
    }

    /// True if no action or event data is cached for this session.
    pub fn is_empty(&self) -> bool {
        self.inner
            .as_ref()
            .map(|inner| inner.beacon.is_empty())
            .unwrap_or(true)
    }

    /// Discard everything this session has cached so far.
    pub fn clear_captured_data(&self) {
        if let Some(inner) = &self.inner {
            inner.beacon.clear_data();
        }
    }

    /// Transmit this session's cached data through the given client.
    pub async fn send_beacon<C: ApiClient>(&self, client: &C) -> Option<StatusResponse> {
        match &self.inner {
            Some(inner) => inner.beacon.send(client).await,
            None => None,
        }
    }
}

impl SessionInner {
    /// Called by a root action when it is left, so the session forgets it.
    pub(crate) fn root_action_ended(&self, action_id: i32) {
        self.open_root_actions
            .lock()
            .retain(|action| action.id() != action_id);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::cache::BeaconCache;
    use crate::config::{Config, RuntimeSettings};
    use crate::providers::{
        DefaultThreadIdProvider, SystemTimingProvider, ThreadIdProvider, TimingProvider,
    };

    use super::*;

    pub(crate) struct SessionHarness {
        pub cache: Arc<BeaconCache>,
        pub registry: Arc<SessionRegistry>,
        pub session: Session,
    }

    pub(crate) fn harness() -> SessionHarness {
        harness_with_session_number(1)
    }

    pub(crate) fn harness_with_session_number(session_number: i32) -> SessionHarness {
        harness_in(session_number, Arc::new(SessionRegistry::new()))
    }

    /// Build a session registered into the given registry.
    pub(crate) fn harness_in(
        session_number: i32,
        registry: Arc<SessionRegistry>,
    ) -> SessionHarness {
        let cache = Arc::new(BeaconCache::new());
        let cfg = Arc::new(Config {
            endpoint_url: "https://example.com/mbeacon".to_string(),
            application_id: "app-id".to_string(),
            ..Default::default()
        });

        let beacon = Arc::new(Beacon::new(
            Arc::clone(&cache),
            cfg,
            Arc::new(RuntimeSettings::new()),
            Arc::new(SystemTimingProvider::new()) as Arc<dyn TimingProvider>,
            Arc::new(DefaultThreadIdProvider) as Arc<dyn ThreadIdProvider>,
            session_number,
        ));

        let session = Session::new(beacon, Arc::clone(&registry));
        registry.put(session.clone());

        SessionHarness {
            cache,
            registry,
            session,
        }
    }

    #[test]
    fn test_new_session_defaults() {
        let h = harness();
        assert_eq!(h.session.end_time(), -1);
        assert!(!h.session.is_session_ended());
        assert!(h.session.is_empty());
    }

    #[test]
    fn test_enter_action_with_empty_name_returns_inert() {
        let h = harness();

        let action = h.session.enter_action("");
        assert!(action.is_inert());

        let action = h.session.enter_action("   ");
        assert!(action.is_inert());

        assert!(h.session.is_empty());
    }

    #[test]
    fn test_open_action_is_not_yet_cached() {
        let h = harness();
        let action = h.session.enter_action("some action");
        assert!(!action.is_inert());
        assert!(h.session.is_empty());
    }

    #[test]
    fn test_left_action_lands_in_cache() {
        let h = harness();
        let action = h.session.enter_action("some action");
        action.leave_action();

        assert!(!h.session.is_empty());
        assert_eq!(h.cache.get_actions(1).len(), 1);
    }

    #[test]
    fn test_identify_user_blank_inputs_dropped() {
        let h = harness();
        h.session.identify_user("");
        h.session.identify_user("  ");
        assert!(h.session.is_empty());

        h.session.identify_user("user");
        assert!(!h.session.is_empty());
    }

    #[test]
    fn test_report_crash_blank_name_dropped() {
        let h = harness();
        h.session.report_crash("", "reason", "stack");
        assert!(h.session.is_empty());

        h.session.report_crash("crash", "reason", "stack");
        assert!(!h.session.is_empty());
    }

    #[test]
    fn test_end_is_idempotent() {
        let h = harness();
        h.session.end();

        let end_time = h.session.end_time();
        assert_ne!(end_time, -1);
        assert!(h.session.is_session_ended());

        // A second end must not produce another record or a new end time.
        let records = h.cache.get_events(1).len();
        h.session.end();
        assert_eq!(h.session.end_time(), end_time);
        assert_eq!(h.cache.get_events(1).len(), records);

        // Exactly one finished session in the registry.
        assert_eq!(h.registry.all_finished_sessions().len(), 1);
    }

    #[test]
    fn test_end_closes_open_root_actions() {
        let h = harness();
        let _a = h.session.enter_action("a");
        let _b = h.session.enter_action("b");

        h.session.end();

        // Two action records plus the session end event.
        assert_eq!(h.cache.get_actions(1).len(), 2);
        assert_eq!(h.cache.get_events(1).len(), 1);
    }

    #[test]
    fn test_no_new_data_after_end() {
        let h = harness();
        h.session.end();

        let action = h.session.enter_action("late");
        assert!(action.is_inert());

        h.session.identify_user("late-user");
        h.session.report_crash("late-crash", "r", "s");

        // Only the session end record exists.
        assert_eq!(h.cache.get_events(1).len(), 1);
        assert!(h.cache.get_actions(1).is_empty());
    }

    #[test]
    fn test_clear_captured_data() {
        let h = harness();
        h.session.identify_user("user");
        assert!(!h.session.is_empty());

        h.session.clear_captured_data();
        assert!(h.session.is_empty());
    }

    #[test]
    fn test_inert_session_is_a_no_op() {
        let session = Session::inert();
        assert!(session.is_session_ended());
        assert!(session.is_empty());
        assert_eq!(session.session_id(), 0);

        let action = session.enter_action("action");
        assert!(action.is_inert());

        session.identify_user("user");
        session.report_crash("crash", "r", "s");
        session.end();
    }
}
