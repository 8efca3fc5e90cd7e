use std::fmt::Write as _;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::cache::BeaconCache;
use crate::config::{Config, RuntimeSettings, DEFAULT_MULTIPLICITY};
use crate::providers::{ThreadIdProvider, TimingProvider};

use super::client::ApiClient;
use super::response::StatusResponse;
use super::{AGENT_TECHNOLOGY_TYPE, AGENT_VERSION, PROTOCOL_VERSION};

/// Record separator within a beacon chunk.
const BEACON_DELIMITER: &str = "&";

/// Wire codes for the event kinds a beacon can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Action = 1,
    NamedEvent = 10,
    ValueString = 11,
    ValueInt = 12,
    ValueDouble = 13,
    SessionStart = 18,
    SessionEnd = 19,
    WebRequest = 30,
    Error = 40,
    Crash = 50,
    IdentifyUser = 60,
}

/// Closed action data handed to the encoder.
#[derive(Debug, Clone)]
pub struct ActionData {
    pub id: i32,
    pub parent_id: i32,
    pub name: String,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub start_sequence_no: i32,
    pub end_sequence_no: i32,
}

/// Finished web-request data handed to the encoder.
#[derive(Debug, Clone)]
pub struct WebRequestData {
    pub parent_action_id: i32,
    pub url: String,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub start_sequence_no: i32,
    pub end_sequence_no: i32,
    pub bytes_sent: i32,
    pub bytes_received: i32,
    pub response_code: i32,
}

/// Per-session beacon encoder.
///
/// Owns the session's monotonic sequence and action-id counters, serializes
/// every reported item into the wire key/value grammar and feeds it into the
/// cache under the session's id. Transmission drains the cache chunk by
/// chunk through [`Beacon::send`].
pub struct Beacon {
    session_number: i32,
    session_start_time: i64,
    next_sequence: AtomicI32,
    next_id: AtomicI32,
    multiplicity: AtomicI32,
    cache: Arc<BeaconCache>,
    cfg: Arc<Config>,
    settings: Arc<RuntimeSettings>,
    timing: Arc<dyn TimingProvider>,
    threads: Arc<dyn ThreadIdProvider>,
}

impl Beacon {
    pub fn new(
        cache: Arc<BeaconCache>,
        cfg: Arc<Config>,
        settings: Arc<RuntimeSettings>,
        timing: Arc<dyn TimingProvider>,
        threads: Arc<dyn ThreadIdProvider>,
        session_number: i32,
    ) -> Self {
        let session_start_time = timing.now_ms();

        Self {
            session_number,
            session_start_time,
            next_sequence: AtomicI32::new(1),
            next_id: AtomicI32::new(1),
            multiplicity: AtomicI32::new(DEFAULT_MULTIPLICITY),
            cache,
            cfg,
            settings,
            timing,
            threads,
        }
    }

    pub fn session_number(&self) -> i32 {
        self.session_number
    }

    pub fn session_start_time(&self) -> i64 {
        self.session_start_time
    }

    /// Next monotonic sequence number for this session.
    pub fn next_sequence_number(&self) -> i32 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Next action id for this session.
    pub fn next_action_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Current local timestamp.
    pub fn current_timestamp(&self) -> i64 {
        self.timing.now_ms()
    }

    /// Apply the per-session multiplicity the server assigned.
    pub fn set_multiplicity(&self, multiplicity: i32) {
        self.multiplicity.store(multiplicity, Ordering::SeqCst);
    }

    pub fn multiplicity(&self) -> i32 {
        self.multiplicity.load(Ordering::SeqCst)
    }

    /// Whether any data may be recorded right now.
    fn is_capture_on(&self) -> bool {
        self.settings.is_capture() && self.multiplicity() > 0
    }

    /// Tag value for instrumenting outgoing web requests.
    pub fn create_tag(&self, parent_action_id: i32, sequence_no: i32) -> String {
        format!(
            "MT_{}_{}_{}_{}_{}_{}_{}_{}",
            PROTOCOL_VERSION,
            self.settings.server_id(),
            self.cfg.device_id,
            self.session_number,
            self.cfg.application_id,
            parent_action_id,
            self.threads.current_thread_id(),
            sequence_no,
        )
    }

    // --- Recording ---

    /// Record the session start event.
    pub fn start_session(&self) {
        if !self.is_capture_on() {
            return;
        }

        let mut data = self.basic_event_data(EventKind::SessionStart, None);
        append_kv(&mut data, "pa", "0");
        append_i32(&mut data, "s0", self.next_sequence_number());
        append_i64(&mut data, "t0", 0);

        self.cache
            .add_event_data(self.session_number, self.session_start_time, data);
    }

    /// Record the session end event.
    pub fn end_session(&self, end_time_ms: i64) {
        if !self.is_capture_on() {
            return;
        }

        let mut data = self.basic_event_data(EventKind::SessionEnd, None);
        append_kv(&mut data, "pa", "0");
        append_i32(&mut data, "s0", self.next_sequence_number());
        append_i64(&mut data, "t0", self.time_since_session_start(end_time_ms));

        self.cache
            .add_event_data(self.session_number, end_time_ms, data);
    }

    /// Record a closed action.
    pub fn add_action(&self, action: &ActionData) {
        if !self.is_capture_on() {
            return;
        }

        let mut data = self.basic_event_data(EventKind::Action, Some(&action.name));
        append_i32(&mut data, "ca", action.id);
        append_i32(&mut data, "pa", action.parent_id);
        append_i32(&mut data, "s0", action.start_sequence_no);
        append_i64(
            &mut data,
            "t0",
            self.time_since_session_start(action.start_time_ms),
        );
        append_i32(&mut data, "s1", action.end_sequence_no);
        append_i64(&mut data, "t1", action.end_time_ms - action.start_time_ms);

        self.cache
            .add_action_data(self.session_number, action.start_time_ms, data);
    }

    /// Record a named event on an action.
    pub fn report_event(&self, parent_action_id: i32, name: &str) {
        if !self.is_capture_on() {
            return;
        }

        let (data, timestamp) = self.event_payload(EventKind::NamedEvent, Some(name), parent_action_id);
        self.cache.add_event_data(self.session_number, timestamp, data);
    }

    /// Record an integer value on an action.
    pub fn report_int_value(&self, parent_action_id: i32, name: &str, value: i32) {
        if !self.is_capture_on() {
            return;
        }

        let (mut data, timestamp) =
            self.event_payload(EventKind::ValueInt, Some(name), parent_action_id);
        append_i32(&mut data, "vl", value);
        self.cache.add_event_data(self.session_number, timestamp, data);
    }

    /// Record a floating-point value on an action.
    pub fn report_double_value(&self, parent_action_id: i32, name: &str, value: f64) {
        if !self.is_capture_on() {
            return;
        }

        let (mut data, timestamp) =
            self.event_payload(EventKind::ValueDouble, Some(name), parent_action_id);
        append_kv(&mut data, "vl", &value.to_string());
        self.cache.add_event_data(self.session_number, timestamp, data);
    }

    /// Record a string value on an action.
    pub fn report_string_value(&self, parent_action_id: i32, name: &str, value: &str) {
        if !self.is_capture_on() {
            return;
        }

        let (mut data, timestamp) =
            self.event_payload(EventKind::ValueString, Some(name), parent_action_id);
        append_kv(&mut data, "vl", value);
        self.cache.add_event_data(self.session_number, timestamp, data);
    }

    /// Record an error on an action.
    pub fn report_error(&self, parent_action_id: i32, name: &str, code: i32, reason: &str) {
        if !self.is_capture_on() || !self.settings.is_capture_errors() {
            return;
        }

        let (mut data, timestamp) =
            self.event_payload(EventKind::Error, Some(name), parent_action_id);
        append_i32(&mut data, "ev", code);
        append_kv(&mut data, "rs", reason);
        self.cache.add_event_data(self.session_number, timestamp, data);
    }

    /// Record a crash for the whole session.
    pub fn report_crash(&self, name: &str, reason: &str, stacktrace: &str) {
        if !self.is_capture_on() || !self.settings.is_capture_crashes() {
            return;
        }

        let (mut data, timestamp) = self.event_payload(EventKind::Crash, Some(name), 0);
        append_kv(&mut data, "rs", reason);
        append_kv(&mut data, "st", stacktrace);
        self.cache.add_event_data(self.session_number, timestamp, data);
    }

    /// Record the user identification event.
    pub fn identify_user(&self, user_tag: &str) {
        if !self.is_capture_on() {
            return;
        }

        let (data, timestamp) = self.event_payload(EventKind::IdentifyUser, Some(user_tag), 0);
        self.cache.add_event_data(self.session_number, timestamp, data);
    }

    /// Record a finished web request.
    pub fn add_web_request(&self, request: &WebRequestData) {
        if !self.is_capture_on() {
            return;
        }

        let mut data = self.basic_event_data(EventKind::WebRequest, Some(&request.url));
        append_i32(&mut data, "pa", request.parent_action_id);
        append_i32(&mut data, "s0", request.start_sequence_no);
        append_i64(
            &mut data,
            "t0",
            self.time_since_session_start(request.start_time_ms),
        );
        append_i32(&mut data, "s1", request.end_sequence_no);
        append_i64(&mut data, "t1", request.end_time_ms - request.start_time_ms);

        if request.bytes_sent >= 0 {
            append_i32(&mut data, "bs", request.bytes_sent);
        }
        if request.bytes_received >= 0 {
            append_i32(&mut data, "br", request.bytes_received);
        }
        if request.response_code >= 0 {
            append_i32(&mut data, "rc", request.response_code);
        }

        self.cache
            .add_event_data(self.session_number, request.start_time_ms, data);
    }

    // --- Cache passthroughs ---

    /// True if no data is cached for this session.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty(self.session_number)
    }

    /// Discard everything cached for this session.
    pub fn clear_data(&self) {
        self.cache.delete_entry(self.session_number);
    }

    // --- Transmission ---

    /// Drain this session's cached data: chunk, transmit, commit; roll back
    /// and stop on the first failed request. Returns the last response, or
    /// `None` when transmission failed at the transport level.
    pub async fn send<C: ApiClient>(&self, client: &C) -> Option<StatusResponse> {
        let max_size = self.settings.max_beacon_size_bytes().max(1) as usize;
        let mut response = None;

        loop {
            let prefix = self.mutable_basic_data();
            let chunk =
                self.cache
                    .next_chunk(self.session_number, &prefix, max_size, BEACON_DELIMITER);

            if chunk.is_empty() {
                // Nothing left; drop the exhausted in-flight snapshot.
                self.cache.remove_chunked(self.session_number);
                return response;
            }

            match client
                .send_beacon_request(&self.cfg.client_ip, chunk.as_bytes())
                .await
            {
                Some(resp) if resp.is_ok() => {
                    self.cache.remove_chunked(self.session_number);
                    response = Some(resp);
                }
                Some(resp) => {
                    debug!(
                        session = self.session_number,
                        status = resp.http_status,
                        "beacon send rejected, keeping data",
                    );
                    self.cache.reset_chunked(self.session_number);
                    return Some(resp);
                }
                None => {
                    debug!(
                        session = self.session_number,
                        "beacon send failed, keeping data",
                    );
                    self.cache.reset_chunked(self.session_number);
                    return None;
                }
            }
        }
    }

    // --- Encoding helpers ---

    fn time_since_session_start(&self, timestamp_ms: i64) -> i64 {
        timestamp_ms - self.session_start_time
    }

    /// Shared `et`/`na`/`it` head of every event payload.
    fn basic_event_data(&self, kind: EventKind, name: Option<&str>) -> String {
        let mut data = String::with_capacity(64);
        let _ = write!(data, "et={}", kind as i32);

        if let Some(name) = name {
            append_kv(&mut data, "na", name);
        }

        append_i32(&mut data, "it", self.threads.current_thread_id());
        data
    }

    /// Payload plus timestamp for the simple one-shot events.
    fn event_payload(
        &self,
        kind: EventKind,
        name: Option<&str>,
        parent_action_id: i32,
    ) -> (String, i64) {
        let timestamp = self.timing.now_ms();

        let mut data = self.basic_event_data(kind, name);
        append_i32(&mut data, "pa", parent_action_id);
        append_i32(&mut data, "s0", self.next_sequence_number());
        append_i64(&mut data, "t0", self.time_since_session_start(timestamp));

        (data, timestamp)
    }

    /// Chunk prefix: immutable identity data plus the current transmission
    /// timestamp, re-built for every chunk.
    fn mutable_basic_data(&self) -> String {
        let mut data = String::with_capacity(256);

        let _ = write!(data, "vv={PROTOCOL_VERSION}");
        append_kv(&mut data, "va", AGENT_VERSION);
        append_kv(&mut data, "ap", &self.cfg.application_id);
        append_kv(&mut data, "an", &self.cfg.application_name);
        append_kv(&mut data, "vn", &self.cfg.application_version);
        append_kv(&mut data, "pt", "1");
        append_kv(&mut data, "tt", AGENT_TECHNOLOGY_TYPE);
        append_kv(&mut data, "vi", &self.cfg.device_id.to_string());
        append_i32(&mut data, "sn", self.session_number);

        if !self.cfg.client_ip.is_empty() {
            append_kv(&mut data, "ip", &self.cfg.client_ip);
        }

        append_kv(&mut data, "os", &self.cfg.device.operating_system);
        append_kv(&mut data, "mf", &self.cfg.device.manufacturer);
        append_kv(&mut data, "md", &self.cfg.device.model_id);

        append_i64(
            &mut data,
            "tv",
            self.timing.to_cluster_time(self.session_start_time),
        );
        append_i64(
            &mut data,
            "tx",
            self.timing.to_cluster_time(self.timing.now_ms()),
        );
        append_i32(&mut data, "mp", self.multiplicity());

        data
    }
}

/// Append `&key=value` with a form-urlencoded value.
fn append_kv(out: &mut String, key: &str, value: &str) {
    out.push('&');
    out.push_str(key);
    out.push('=');
    out.extend(url::form_urlencoded::byte_serialize(value.as_bytes()));
}

fn append_i32(out: &mut String, key: &str, value: i32) {
    let _ = write!(out, "&{key}={value}");
}

fn append_i64(out: &mut String, key: &str, value: i64) {
    let _ = write!(out, "&{key}={value}");
}
