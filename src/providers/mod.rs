use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Wall-clock time source with cluster-offset correction.
///
/// The sender's time-sync procedure computes the offset between the local
/// clock and the cluster clock and installs it via [`TimingProvider::initialize`].
/// All wire timestamps go through [`TimingProvider::to_cluster_time`].
pub trait TimingProvider: Send + Sync {
    /// Current local time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;

    /// Install the cluster time offset and whether the server supports time sync.
    fn initialize(&self, cluster_offset_ms: i64, sync_supported: bool);

    /// Convert a local timestamp into cluster time.
    fn to_cluster_time(&self, timestamp_ms: i64) -> i64;

    /// Whether the server supports time synchronization.
    fn is_sync_supported(&self) -> bool;
}

/// Default timing provider backed by the system clock.
pub struct SystemTimingProvider {
    cluster_offset_ms: AtomicI64,
    sync_supported: AtomicBool,
}

impl SystemTimingProvider {
    pub fn new() -> Self {
        Self {
            cluster_offset_ms: AtomicI64::new(0),
            sync_supported: AtomicBool::new(true),
        }
    }
}

impl Default for SystemTimingProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TimingProvider for SystemTimingProvider {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    fn initialize(&self, cluster_offset_ms: i64, sync_supported: bool) {
        self.cluster_offset_ms
            .store(cluster_offset_ms, Ordering::SeqCst);
        self.sync_supported.store(sync_supported, Ordering::SeqCst);
    }

    fn to_cluster_time(&self, timestamp_ms: i64) -> i64 {
        timestamp_ms + self.cluster_offset_ms.load(Ordering::SeqCst)
    }

    fn is_sync_supported(&self) -> bool {
        self.sync_supported.load(Ordering::SeqCst)
    }
}

/// Allocator for session numbers.
pub trait SessionIdProvider: Send + Sync {
    /// Next session number, always positive.
    fn next_id(&self) -> i32;
}

/// Default session-id provider: monotonically increasing from a random start,
/// wrapping within the positive i32 range.
pub struct DefaultSessionIdProvider {
    next: AtomicI32,
}

impl DefaultSessionIdProvider {
    pub fn new() -> Self {
        let initial = rand::thread_rng().gen_range(1..=i32::MAX);
        Self::with_initial_id(initial)
    }

    pub fn with_initial_id(initial: i32) -> Self {
        Self {
            next: AtomicI32::new(initial.max(1)),
        }
    }
}

impl Default for DefaultSessionIdProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionIdProvider for DefaultSessionIdProvider {
    fn next_id(&self) -> i32 {
        loop {
            let current = self.next.load(Ordering::SeqCst);
            let next = if current == i32::MAX { 1 } else { current + 1 };
            if self
                .next
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return current;
            }
        }
    }
}

/// Source of the calling thread's identifier, encoded into event records.
pub trait ThreadIdProvider: Send + Sync {
    fn current_thread_id(&self) -> i32;
}

/// Default thread-id provider hashing the opaque std thread id into a
/// positive i32.
pub struct DefaultThreadIdProvider;

impl ThreadIdProvider for DefaultThreadIdProvider {
    fn current_thread_id(&self) -> i32 {
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        let hash = hasher.finish();
        // Fold into the positive i32 range; 0 is reserved for "unknown".
        (((hash >> 32) as u32 ^ hash as u32) & 0x7fff_ffff).max(1) as i32
    }
}
