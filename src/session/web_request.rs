use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;

use crate::protocol::beacon::{Beacon, WebRequestData};

struct WebRequestInner {
    beacon: Arc<Beacon>,
    parent_action_id: i32,
    url: String,
    tag: String,
    start_sequence_no: i32,
    started: AtomicBool,
    start_time_ms: AtomicI64,
    /// −1 while the request is running.
    end_time: AtomicI64,
    response_code: AtomicI32,
    bytes_sent: AtomicI32,
    bytes_received: AtomicI32,
}

/// Tracer for one outgoing web request of an action.
///
/// The tag returned by [`WebRequestTracer::tag`] is meant to travel with the
/// request (as a header) so the server side can link both ends. `start` and
/// `stop` are idempotent; setters are ignored once the tracer is stopped.
#[derive(Clone)]
pub struct WebRequestTracer {
    inner: Option<Arc<WebRequestInner>>,
}

impl WebRequestTracer {
    pub(crate) fn open(beacon: Arc<Beacon>, parent_action_id: i32, url: &str) -> Self {
        let start_sequence_no = beacon.next_sequence_number();
        let tag = beacon.create_tag(parent_action_id, start_sequence_no);
        let start_time_ms = beacon.current_timestamp();

        Self {
            inner: Some(Arc::new(WebRequestInner {
                beacon,
                parent_action_id,
                url: url.to_string(),
                tag,
                start_sequence_no,
                started: AtomicBool::new(false),
                start_time_ms: AtomicI64::new(start_time_ms),
                end_time: AtomicI64::new(-1),
                response_code: AtomicI32::new(-1),
                bytes_sent: AtomicI32::new(-1),
                bytes_received: AtomicI32::new(-1),
            })),
        }
    }

    pub(crate) fn inert() -> Self {
        Self { inner: None }
    }

    /// True for the no-op variant returned on invalid input or after close.
    pub fn is_inert(&self) -> bool {
        self.inner.is_none()
    }

    /// Tag to attach to the traced request.
    pub fn tag(&self) -> &str {
        self.inner.as_ref().map(|inner| inner.tag.as_str()).unwrap_or("")
    }

    /// Stamp the request start time. Only the first call takes effect.
    pub fn start(&self) -> &Self {
        if let Some(inner) = &self.inner {
            if !self.is_stopped()
                && inner
                    .started
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                inner
                    .start_time_ms
                    .store(inner.beacon.current_timestamp(), Ordering::SeqCst);
            }
        }
        self
    }

    pub fn set_response_code(&self, response_code: i32) -> &Self {
        if let Some(inner) = &self.inner {
            if !self.is_stopped() {
                inner.response_code.store(response_code, Ordering::SeqCst);
            }
        }
        self
    }

    pub fn set_bytes_sent(&self, bytes_sent: i32) -> &Self {
        if let Some(inner) = &self.inner {
            if !self.is_stopped() {
                inner.bytes_sent.store(bytes_sent, Ordering::SeqCst);
            }
        }
        self
    }

    pub fn set_bytes_received(&self, bytes_received: i32) -> &Self {
        if let Some(inner) = &self.inner {
            if !self.is_stopped() {
                inner.bytes_received.store(bytes_received, Ordering::SeqCst);
            }
        }
        self
    }

    /// Finish the trace and emit the web-request record. Only the first call
    /// takes effect.
    pub fn stop(&self) {
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

        let end_sequence_no = inner.beacon.next_sequence_number();

        inner.beacon.add_web_request(&WebRequestData {
            parent_action_id: inner.parent_action_id,
            url: inner.url.clone(),
            start_time_ms: inner.start_time_ms.load(Ordering::SeqCst),
            end_time_ms: end_time,
            start_sequence_no: inner.start_sequence_no,
            end_sequence_no,
            bytes_sent: inner.bytes_sent.load(Ordering::SeqCst),
            bytes_received: inner.bytes_received.load(Ordering::SeqCst),
            response_code: inner.response_code.load(Ordering::SeqCst),
        });
    }

    pub fn is_stopped(&self) -> bool {
        match &self.inner {
            Some(inner) => inner.end_time.load(Ordering::SeqCst) != -1,
            None => true,
        }
    }
}
