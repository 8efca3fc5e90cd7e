use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

use crate::protocol::beacon::{ActionData, Beacon};

use super::web_request::WebRequestTracer;
use super::SessionInner;

struct ActionInner {
    beacon: Arc<Beacon>,
    id: i32,
    parent_id: i32,
    name: String,
    start_time_ms: i64,
    start_sequence_no: i32,
    /// −1 while the action is open.
    end_time: AtomicI64,
    end_sequence_no: AtomicI32,
    /// Open child actions; only root actions ever hold children.
    children: Mutex<Vec<Action>>,
    /// Owning session, set for root actions so they can deregister on leave.
    session: Weak<SessionInner>,
}

impl ActionInner {
    fn open(beacon: Arc<Beacon>, session: Weak<SessionInner>, name: &str, parent_id: i32) -> Self {
        let id = beacon.next_action_id();
        let start_sequence_no = beacon.next_sequence_number();
        let start_time_ms = beacon.current_timestamp();

        Self {
            beacon,
            id,
            parent_id,
            name: name.to_string(),
            start_time_ms,
            start_sequence_no,
            end_time: AtomicI64::new(-1),
            end_sequence_no: AtomicI32::new(-1),
            children: Mutex::new(Vec::new()),
            session,
        }
    }

    fn is_left(&self) -> bool {
        self.end_time.load(Ordering::SeqCst) != -1
    }

    fn report_event(&self, name: &str) {
        if name.trim().is_empty() {
            warn!(action = self.id, "report_event: name must not be empty");
            return;
        }
        if self.is_left() {
            return;
        }
        self.beacon.report_event(self.id, name);
    }

    fn report_int_value(&self, name: &str, value: i32) {
        if name.trim().is_empty() {
            warn!(action = self.id, "report_int_value: name must not be empty");
            return;
        }
        if self.is_left() {
            return;
        }
        self.beacon.report_int_value(self.id, name, value);
    }

    fn report_double_value(&self, name: &str, value: f64) {
        if name.trim().is_empty() {
            warn!(action = self.id, "report_double_value: name must not be empty");
            return;
        }
        if self.is_left() {
            return;
        }
        self.beacon.report_double_value(self.id, name, value);
    }

    fn report_string_value(&self, name: &str, value: &str) {
        if name.trim().is_empty() {
            warn!(action = self.id, "report_string_value: name must not be empty");
            return;
        }
        if self.is_left() {
            return;
        }
        self.beacon.report_string_value(self.id, name, value);
    }

    fn report_error(&self, name: &str, code: i32, reason: &str) {
        if name.trim().is_empty() {
            warn!(action = self.id, "report_error: name must not be empty");
            return;
        }
        if self.is_left() {
            return;
        }
        self.beacon.report_error(self.id, name, code, reason);
    }

    fn trace_web_request(&self, url: &str) -> WebRequestTracer {
        if url::Url::parse(url).is_err() {
            warn!(action = self.id, "trace_web_request: invalid URL");
            return WebRequestTracer::inert();
        }
        if self.is_left() {
            return WebRequestTracer::inert();
        }
        WebRequestTracer::open(Arc::clone(&self.beacon), self.id, url)
    }

    /// Close this action: stamp the end time once, close open children, emit
    /// the action record, and deregister from the owning session.
    fn leave(&self) {
        let end_time = self.beacon.current_timestamp();
        if self
            .end_time
            .compare_exchange(-1, end_time, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let children: Vec<Action> = std::mem::take(&mut *self.children.lock());
        for child in children {
            child.leave_action();
        }

        let end_sequence_no = self.beacon.next_sequence_number();
        self.end_sequence_no.store(end_sequence_no, Ordering::SeqCst);

        self.beacon.add_action(&ActionData {
            id: self.id,
            parent_id: self.parent_id,
            name: self.name.clone(),
            start_time_ms: self.start_time_ms,
            end_time_ms: self.end_time.load(Ordering::SeqCst),
            start_sequence_no: self.start_sequence_no,
            end_sequence_no,
        });

        if let Some(session) = self.session.upgrade() {
            session.root_action_ended(self.id);
        }
    }
}

/// Top-level action opened directly on a session. May own child actions.
#[derive(Clone)]
pub struct RootAction {
    inner: Option<Arc<ActionInner>>,
}

impl RootAction {
    pub(crate) fn open(beacon: Arc<Beacon>, session: Weak<SessionInner>, name: &str) -> Self {
        Self {
            inner: Some(Arc::new(ActionInner::open(beacon, session, name, 0))),
        }
    }

    pub(crate) fn inert() -> Self {
        Self { inner: None }
    }

    /// True for the no-op variant returned on invalid input or after close.
    pub fn is_inert(&self) -> bool {
        self.inner.is_none()
    }

    pub fn id(&self) -> i32 {
        self.inner.as_ref().map(|inner| inner.id).unwrap_or(0)
    }

    /// Open a child action on the level below this one.
    pub fn enter_action(&self, name: &str) -> Action {
        let Some(inner) = &self.inner else {
            return Action::inert();
        };

        if name.trim().is_empty() {
            warn!("enter_action: name must not be empty");
            return Action::inert();
        }

        if inner.is_left() {
            return Action::inert();
        }

        let child = Action {
            inner: Some(Arc::new(ActionInner::open(
                Arc::clone(&inner.beacon),
                Weak::new(),
                name,
                inner.id,
            ))),
        };
        inner.children.lock().push(child.clone());
        child
    }

    pub fn report_event(&self, name: &str) {
        if let Some(inner) = &self.inner {
            inner.report_event(name);
        }
    }

    pub fn report_int_value(&self, name: &str, value: i32) {
        if let Some(inner) = &self.inner {
            inner.report_int_value(name, value);
        }
    }

    pub fn report_double_value(&self, name: &str, value: f64) {
        if let Some(inner) = &self.inner {
            inner.report_double_value(name, value);
        }
    }

    pub fn report_string_value(&self, name: &str, value: &str) {
        if let Some(inner) = &self.inner {
            inner.report_string_value(name, value);
        }
    }

    pub fn report_error(&self, name: &str, code: i32, reason: &str) {
        if let Some(inner) = &self.inner {
            inner.report_error(name, code, reason);
        }
    }

    pub fn trace_web_request(&self, url: &str) -> WebRequestTracer {
        match &self.inner {
            Some(inner) => inner.trace_web_request(url),
            None => WebRequestTracer::inert(),
        }
    }

    /// Close this action and all of its open children. Idempotent.
    pub fn leave_action(&self) {
        if let Some(inner) = &self.inner {
            inner.leave();
        }
    }

    pub fn is_left(&self) -> bool {
        self.inner
            .as_ref()
            .map(|inner| inner.is_left())
            .unwrap_or(true)
    }
}

/// Child action below a root action.
#[derive(Clone)]
pub struct Action {
    inner: Option<Arc<ActionInner>>,
}

impl Action {
    pub(crate) fn inert() -> Self {
        Self { inner: None }
    }

    /// True for the no-op variant returned on invalid input or after close.
    pub fn is_inert(&self) -> bool {
        self.inner.is_none()
    }

    pub fn id(&self) -> i32 {
        self.inner.as_ref().map(|inner| inner.id).unwrap_or(0)
    }

    pub fn parent_id(&self) -> i32 {
        self.inner
            .as_ref()
            .map(|inner| inner.parent_id)
            .unwrap_or(0)
    }

    pub fn report_event(&self, name: &str) {
        if let Some(inner) = &self.inner {
            inner.report_event(name);
        }
    }

    pub fn report_int_value(&self, name: &str, value: i32) {
        if let Some(inner) = &self.inner {
            inner.report_int_value(name, value);
        }
    }

    pub fn report_double_value(&self, name: &str, value: f64) {
        if let Some(inner) = &self.inner {
            inner.report_double_value(name, value);
        }
    }

    pub fn report_string_value(&self, name: &str, value: &str) {
        if let Some(inner) = &self.inner {
            inner.report_string_value(name, value);
        }
    }

    pub fn report_error(&self, name: &str, code: i32, reason: &str) {
        if let Some(inner) = &self.inner {
            inner.report_error(name, code, reason);
        }
    }

    pub fn trace_web_request(&self, url: &str) -> WebRequestTracer {
        match &self.inner {
            Some(inner) => inner.trace_web_request(url),
            None => WebRequestTracer::inert(),
        }
    }

    /// Close this action. Idempotent.
    pub fn leave_action(&self) {
        if let Some(inner) = &self.inner {
            inner.leave();
        }
    }

    pub fn is_left(&self) -> bool {
        self.inner
            .as_ref()
            .map(|inner| inner.is_left())
            .unwrap_or(true)
    }
}
