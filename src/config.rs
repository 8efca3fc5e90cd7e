use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::protocol::response::StatusResponse;

/// Default interval between open-session beacon sends.
pub const DEFAULT_SEND_INTERVAL: Duration = Duration::from_secs(120);

/// Default upper bound for a single beacon chunk in bytes.
pub const DEFAULT_MAX_BEACON_SIZE: i64 = 30 * 1024;

/// Default multiplicity applied before the server provides one.
pub const DEFAULT_MULTIPLICITY: i32 = 1;

/// Monitoring cluster flavor; selects URL shape and feature support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerFlavor {
    #[default]
    Dynatrace,
    AppMon,
}

impl ServerFlavor {
    /// AppMon clusters do not answer time-sync requests.
    pub fn supports_time_sync(&self) -> bool {
        matches!(self, ServerFlavor::Dynatrace)
    }
}

/// TLS trust behavior for the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustMode {
    /// Verify server certificates against the system roots.
    #[default]
    System,
    /// Accept any certificate. Only for test clusters.
    Insecure,
}

/// Device identification encoded into status queries and beacon prefixes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub operating_system: String,

    #[serde(default)]
    pub manufacturer: String,

    #[serde(default)]
    pub model_id: String,
}

/// Beacon cache bounds. A zero value disables the respective eviction
/// strategy.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Maximum age of a cached record before time eviction removes it.
    #[serde(default = "default_max_record_age", with = "humantime_serde")]
    pub max_record_age: Duration,

    /// Space eviction drains the cache down to this size.
    #[serde(default = "default_lower_memory_bound")]
    pub lower_memory_bound: i64,

    /// Space eviction starts once the cache exceeds this size.
    #[serde(default = "default_upper_memory_bound")]
    pub upper_memory_bound: i64,
}

impl CacheConfig {
    pub fn max_record_age_ms(&self) -> i64 {
        self.max_record_age.as_millis() as i64
    }
}

/// Static agent configuration. Server-mutable settings live in
/// [`RuntimeSettings`].
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Monitoring cluster endpoint, e.g. "https://tenant.example.com/mbeacon".
    #[serde(default)]
    pub endpoint_url: String,

    /// Application identifier issued by the cluster.
    #[serde(default)]
    pub application_id: String,

    /// Human-readable application name.
    #[serde(default)]
    pub application_name: String,

    /// Application version reported with every beacon.
    #[serde(default)]
    pub application_version: String,

    /// Unique device identifier.
    #[serde(default)]
    pub device_id: u64,

    /// Client IP reported with beacon requests; empty lets the server derive it.
    #[serde(default)]
    pub client_ip: String,

    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub server_flavor: ServerFlavor,

    #[serde(default)]
    pub trust: TrustMode,

    /// Timeout for a single HTTP request. Default: 30s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

// --- Default value functions ---

fn default_max_record_age() -> Duration {
    // 105 minutes, the classic maximum session duration.
    Duration::from_secs(105 * 60)
}

fn default_lower_memory_bound() -> i64 {
    80 * 1024 * 1024
}

fn default_upper_memory_bound() -> i64 {
    100 * 1024 * 1024
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_record_age: default_max_record_age(),
            lower_memory_bound: default_lower_memory_bound(),
            upper_memory_bound: default_upper_memory_bound(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint_url: String::new(),
            application_id: String::new(),
            application_name: String::new(),
            application_version: String::new(),
            device_id: 0,
            client_ip: String::new(),
            device: DeviceConfig::default(),
            cache: CacheConfig::default(),
            server_flavor: ServerFlavor::default(),
            trust: TrustMode::default(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate required fields and bound coherence.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint_url.is_empty() {
            bail!("endpoint_url is required");
        }

        if self.application_id.is_empty() {
            bail!("application_id is required");
        }

        if self.cache.lower_memory_bound < 0 || self.cache.upper_memory_bound < 0 {
            bail!("cache memory bounds must not be negative");
        }

        Ok(())
    }
}

/// Settings the server may change at runtime through status responses.
///
/// Readers (beacon encoder, state machine) load individual atomics; updates
/// arrive through the sending worker, which is the only writer.
pub struct RuntimeSettings {
    capture: AtomicBool,
    capture_errors: AtomicBool,
    capture_crashes: AtomicBool,
    send_interval_ms: AtomicI64,
    max_beacon_size_bytes: AtomicI64,
    server_id: AtomicI32,
}

impl RuntimeSettings {
    pub fn new() -> Self {
        Self {
            capture: AtomicBool::new(true),
            capture_errors: AtomicBool::new(true),
            capture_crashes: AtomicBool::new(true),
            send_interval_ms: AtomicI64::new(DEFAULT_SEND_INTERVAL.as_millis() as i64),
            max_beacon_size_bytes: AtomicI64::new(DEFAULT_MAX_BEACON_SIZE),
            server_id: AtomicI32::new(1),
        }
    }

    pub fn is_capture(&self) -> bool {
        self.capture.load(Ordering::SeqCst)
    }

    pub fn disable_capture(&self) {
        self.capture.store(false, Ordering::SeqCst);
    }

    pub fn enable_capture(&self) {
        self.capture.store(true, Ordering::SeqCst);
    }

    pub fn is_capture_errors(&self) -> bool {
        self.capture_errors.load(Ordering::SeqCst)
    }

    pub fn is_capture_crashes(&self) -> bool {
        self.capture_crashes.load(Ordering::SeqCst)
    }

    pub fn send_interval_ms(&self) -> i64 {
        self.send_interval_ms.load(Ordering::SeqCst)
    }

    pub fn max_beacon_size_bytes(&self) -> i64 {
        self.max_beacon_size_bytes.load(Ordering::SeqCst)
    }

    pub fn server_id(&self) -> i32 {
        self.server_id.load(Ordering::SeqCst)
    }

    /// Merge a successful status response into the current settings.
    pub fn merge_status_response(&self, response: &StatusResponse) {
        self.capture.store(response.capture, Ordering::SeqCst);
        self.capture_errors
            .store(response.capture_errors, Ordering::SeqCst);
        self.capture_crashes
            .store(response.capture_crashes, Ordering::SeqCst);

        if response.send_interval_ms > 0 {
            self.send_interval_ms
                .store(response.send_interval_ms, Ordering::SeqCst);
        }

        if response.max_beacon_size_bytes > 0 {
            self.max_beacon_size_bytes
                .store(response.max_beacon_size_bytes, Ordering::SeqCst);
        }

        if response.server_id > 0 {
            self.server_id.store(response.server_id, Ordering::SeqCst);
        }
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self::new()
    }
}
