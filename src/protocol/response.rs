use crate::config::DEFAULT_MULTIPLICITY;

/// HTTP status code limit below which a response counts as successful.
const ERROR_STATUS: u16 = 400;

/// Status code the cluster uses for rate limiting.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// Iterate the `key=value` pairs of a query-string-style response body.
fn key_value_pairs(body: &str) -> impl Iterator<Item = (&str, &str)> {
    body.split('&').filter_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key.is_empty() {
            None
        } else {
            Some((key, value))
        }
    })
}

fn parse_i64(value: &str) -> Option<i64> {
    value.trim().parse().ok()
}

fn parse_i32(value: &str) -> Option<i32> {
    value.trim().parse().ok()
}

/// Decoded status response controlling capture behavior and send cadence.
///
/// Wire keys: `cp` capture on/off, `si` send interval in milliseconds,
/// `bl` beacon size limit in bytes, `sr` session report multiplicity,
/// `er`/`cr` error and crash capture, `id` server id. Missing keys keep
/// their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub capture: bool,
    pub capture_errors: bool,
    pub capture_crashes: bool,
    pub send_interval_ms: i64,
    pub max_beacon_size_bytes: i64,
    pub multiplicity: i32,
    pub server_id: i32,
    pub http_status: u16,
    /// Cooldown from a 429 response's `Retry-After` header, in milliseconds.
    pub retry_after_ms: Option<i64>,
}

impl StatusResponse {
    pub fn parse(body: &str, http_status: u16, retry_after_ms: Option<i64>) -> Self {
        let mut response = Self {
            capture: true,
            capture_errors: true,
            capture_crashes: true,
            send_interval_ms: -1,
            max_beacon_size_bytes: -1,
            multiplicity: DEFAULT_MULTIPLICITY,
            server_id: -1,
            http_status,
            retry_after_ms,
        };

        for (key, value) in key_value_pairs(body) {
            match key {
                "cp" => response.capture = value != "0",
                "er" => response.capture_errors = value != "0",
                "cr" => response.capture_crashes = value != "0",
                "si" => {
                    if let Some(v) = parse_i64(value) {
                        response.send_interval_ms = v;
                    }
                }
                "bl" => {
                    if let Some(v) = parse_i64(value) {
                        response.max_beacon_size_bytes = v;
                    }
                }
                "sr" => {
                    if let Some(v) = parse_i32(value) {
                        response.multiplicity = v;
                    }
                }
                "id" => {
                    if let Some(v) = parse_i32(value) {
                        response.server_id = v;
                    }
                }
                _ => {}
            }
        }

        response
    }

    pub fn is_ok(&self) -> bool {
        self.http_status < ERROR_STATUS
    }

    pub fn is_too_many_requests(&self) -> bool {
        self.http_status == TOO_MANY_REQUESTS
    }
}

/// Decoded time-sync response carrying the two server-side timestamps.
///
/// `t1` is the time the server received the request, `t2` the time it sent
/// the response; a missing or malformed key yields −1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSyncResponse {
    pub request_receive_time: i64,
    pub response_send_time: i64,
    pub http_status: u16,
    pub retry_after_ms: Option<i64>,
}

impl TimeSyncResponse {
    pub fn parse(body: &str, http_status: u16, retry_after_ms: Option<i64>) -> Self {
        let mut response = Self {
            request_receive_time: -1,
            response_send_time: -1,
            http_status,
            retry_after_ms,
        };

        for (key, value) in key_value_pairs(body) {
            match key {
                "t1" => {
                    if let Some(v) = parse_i64(value) {
                        response.request_receive_time = v;
                    }
                }
                "t2" => {
                    if let Some(v) = parse_i64(value) {
                        response.response_send_time = v;
                    }
                }
                _ => {}
            }
        }

        response
    }

    pub fn is_ok(&self) -> bool {
        self.http_status < ERROR_STATUS
    }

    pub fn is_too_many_requests(&self) -> bool {
        self.http_status == TOO_MANY_REQUESTS
    }

    /// Both server timestamps must be positive for the sample to be usable.
    pub fn is_valid(&self) -> bool {
        self.request_receive_time > 0 && self.response_send_time > 0
    }
}
