use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::providers::TimingProvider;

use super::BeaconCache;

/// Cache surface the eviction strategies operate on.
pub trait EvictionCache: Send + Sync {
    fn num_bytes(&self) -> i64;
    fn session_ids(&self) -> Vec<i32>;
    fn evict_by_age(&self, session_id: i32, min_timestamp: i64) -> usize;
    fn evict_by_count(&self, session_id: i32, count: usize) -> usize;
}

impl EvictionCache for BeaconCache {
    fn num_bytes(&self) -> i64 {
        BeaconCache::num_bytes(self)
    }

    fn session_ids(&self) -> Vec<i32> {
        BeaconCache::session_ids(self)
    }

    fn evict_by_age(&self, session_id: i32, min_timestamp: i64) -> usize {
        BeaconCache::evict_by_age(self, session_id, min_timestamp)
    }

    fn evict_by_count(&self, session_id: i32, count: usize) -> usize {
        BeaconCache::evict_by_count(self, session_id, count)
    }
}

/// Removes records that outlived the configured maximum age.
pub struct TimeEvictionStrategy<C> {
    cache: Arc<C>,
    timing: Arc<dyn TimingProvider>,
    max_age_ms: i64,
    last_run_ts: i64,
    disabled_logged: bool,
}

impl<C: EvictionCache> TimeEvictionStrategy<C> {
    pub fn new(cache: Arc<C>, timing: Arc<dyn TimingProvider>, max_age_ms: i64) -> Self {
        Self {
            cache,
            timing,
            max_age_ms,
            last_run_ts: -1,
            disabled_logged: false,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.max_age_ms <= 0
    }

    pub fn should_run(&self) -> bool {
        self.timing.now_ms() - self.last_run_ts >= self.max_age_ms
    }

    pub fn last_run_ts(&self) -> i64 {
        self.last_run_ts
    }

    pub fn execute(&mut self, cancel: &CancellationToken) {
        if self.is_disabled() {
            if !self.disabled_logged {
                info!("time eviction is disabled");
                self.disabled_logged = true;
            }
            return;
        }

        if self.last_run_ts < 0 {
            // First invocation only arms the timer.
            self.last_run_ts = self.timing.now_ms();
            return;
        }

        if self.should_run() {
            self.do_execute(cancel);
        }
    }

    fn do_execute(&mut self, cancel: &CancellationToken) {
        let now = self.timing.now_ms();
        let min_timestamp = now - self.max_age_ms;

        let mut removed = 0usize;
        for session_id in self.cache.session_ids() {
            if cancel.is_cancelled() {
                return;
            }
            removed += self.cache.evict_by_age(session_id, min_timestamp);
        }

        if removed > 0 {
            debug!(removed, "evicted records by age");
        }

        self.last_run_ts = now;
    }
}

/// Drains records across sessions until the cache is back below the
/// configured low-water mark.
pub struct SpaceEvictionStrategy<C> {
    cache: Arc<C>,
    lower_bound: i64,
    upper_bound: i64,
    disabled_logged: bool,
}

impl<C: EvictionCache> SpaceEvictionStrategy<C> {
    pub fn new(cache: Arc<C>, lower_bound: i64, upper_bound: i64) -> Self {
        Self {
            cache,
            lower_bound,
            upper_bound,
            disabled_logged: false,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.lower_bound <= 0 || self.upper_bound <= 0 || self.upper_bound < self.lower_bound
    }

    pub fn should_run(&self) -> bool {
        self.cache.num_bytes() > self.upper_bound
    }

    pub fn execute(&mut self, cancel: &CancellationToken) {
        if self.is_disabled() {
            if !self.disabled_logged {
                info!("space eviction is disabled");
                self.disabled_logged = true;
            }
            return;
        }

        if self.should_run() {
            self.do_execute(cancel);
        }
    }

    fn do_execute(&mut self, cancel: &CancellationToken) {
        let mut removed: HashMap<i32, usize> = HashMap::new();

        while !cancel.is_cancelled() && self.cache.num_bytes() > self.lower_bound {
            for session_id in self.cache.session_ids() {
                if cancel.is_cancelled() || self.cache.num_bytes() <= self.lower_bound {
                    break;
                }

                *removed.entry(session_id).or_default() +=
                    self.cache.evict_by_count(session_id, 1);
            }
        }

        for (session_id, count) in removed {
            debug!(session_id, removed = count, "evicted records by space");
        }
    }
}

/// Background worker running both eviction strategies whenever the cache
/// signals new data.
pub struct CacheEvictor {
    cache: Arc<BeaconCache>,
    timing: Arc<dyn TimingProvider>,
    cfg: CacheConfig,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl CacheEvictor {
    pub fn new(cache: Arc<BeaconCache>, timing: Arc<dyn TimingProvider>, cfg: CacheConfig) -> Self {
        Self {
            cache,
            timing,
            cfg,
            task: None,
        }
    }

    /// Spawn the eviction task. It blocks until the cache observer signals
    /// an add, then runs time eviction followed by space eviction, checking
    /// the cancellation token at every loop boundary.
    pub fn start(&mut self, cancel: CancellationToken) {
        if self.task.is_some() {
            return;
        }

        let notify = Arc::new(Notify::new());
        {
            let notify = Arc::clone(&notify);
            self.cache.add_observer(Box::new(move || {
                notify.notify_one();
            }));
        }

        let mut time_strategy = TimeEvictionStrategy::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.timing),
            self.cfg.max_record_age_ms(),
        );
        let mut space_strategy = SpaceEvictionStrategy::new(
            Arc::clone(&self.cache),
            self.cfg.lower_memory_bound,
            self.cfg.upper_memory_bound,
        );

        self.task = Some(tokio::spawn(async move {
            info!("cache evictor started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = notify.notified() => {
                        if cancel.is_cancelled() {
                            break;
                        }
                        time_strategy.execute(&cancel);

                        if cancel.is_cancelled() {
                            break;
                        }
                        space_strategy.execute(&cancel);
                    }
                }
            }

            debug!("cache evictor stopped");
        }));
    }

    /// Wait for the eviction task to finish after cancellation.
    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};

    use parking_lot::Mutex;

    use crate::providers::SystemTimingProvider;

    use super::*;

    /// Scriptable cache stub: pops one value from `num_bytes_script` per
    /// `num_bytes()` call (sticking to the last one when exhausted) and
    /// records every eviction call.
    struct StubCache {
        num_bytes_script: Mutex<Vec<i64>>,
        session_ids: Vec<i32>,
        evict_by_age_calls: Mutex<Vec<(i32, i64)>>,
        evict_by_count_calls: Mutex<Vec<(i32, usize)>>,
    }

    impl StubCache {
        fn new(num_bytes_script: Vec<i64>, session_ids: Vec<i32>) -> Self {
            Self {
                num_bytes_script: Mutex::new(num_bytes_script),
                session_ids,
                evict_by_age_calls: Mutex::new(Vec::new()),
                evict_by_count_calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl EvictionCache for StubCache {
        fn num_bytes(&self) -> i64 {
            let mut script = self.num_bytes_script.lock();
            if script.len() > 1 {
                script.remove(0)
            } else {
                script.first().copied().unwrap_or(0)
            }
        }

        fn session_ids(&self) -> Vec<i32> {
            self.session_ids.clone()
        }

        fn evict_by_age(&self, session_id: i32, min_timestamp: i64) -> usize {
            self.evict_by_age_calls.lock().push((session_id, min_timestamp));
            1
        }

        fn evict_by_count(&self, session_id: i32, count: usize) -> usize {
            self.evict_by_count_calls.lock().push((session_id, count));
            count
        }
    }

    struct FakeTiming {
        now: AtomicI64,
    }

    impl FakeTiming {
        fn new(now: i64) -> Self {
            Self {
                now: AtomicI64::new(now),
            }
        }

        fn advance(&self, delta: i64) {
            self.now.fetch_add(delta, Ordering::SeqCst);
        }
    }

    impl TimingProvider for FakeTiming {
        fn now_ms(&self) -> i64 {
            self.now.load(Ordering::SeqCst)
        }

        fn initialize(&self, _cluster_offset_ms: i64, _sync_supported: bool) {}

        fn to_cluster_time(&self, timestamp_ms: i64) -> i64 {
            timestamp_ms
        }

        fn is_sync_supported(&self) -> bool {
            true
        }
    }

    fn never_cancelled() -> CancellationToken {
        CancellationToken::new()
    }

    // --- Time eviction ---

    #[test]
    fn test_time_eviction_disabled_when_max_age_not_positive() {
        let cache = Arc::new(StubCache::new(vec![0], vec![]));
        let timing = Arc::new(FakeTiming::new(0));

        let strategy = TimeEvictionStrategy::new(Arc::clone(&cache), timing.clone(), 0);
        assert!(strategy.is_disabled());

        let strategy = TimeEvictionStrategy::new(cache, timing, -1);
        assert!(strategy.is_disabled());
    }

    #[test]
    fn test_time_eviction_first_run_only_arms_timer() {
        let cache = Arc::new(StubCache::new(vec![0], vec![1, 42]));
        let timing = Arc::new(FakeTiming::new(1000));

        let mut strategy =
            TimeEvictionStrategy::new(Arc::clone(&cache), timing.clone(), 100);
        assert_eq!(strategy.last_run_ts(), -1);

        strategy.execute(&never_cancelled());
        assert_eq!(strategy.last_run_ts(), 1000);
        assert!(cache.evict_by_age_calls.lock().is_empty());
    }

    #[test]
    fn test_time_eviction_runs_after_max_age_elapsed() {
        let cache = Arc::new(StubCache::new(vec![0], vec![1, 42]));
        let timing = Arc::new(FakeTiming::new(1000));

        let mut strategy =
            TimeEvictionStrategy::new(Arc::clone(&cache), timing.clone(), 100);
        strategy.execute(&never_cancelled()); // arms the timer

        timing.advance(99);
        strategy.execute(&never_cancelled());
        assert!(cache.evict_by_age_calls.lock().is_empty());

        timing.advance(1);
        strategy.execute(&never_cancelled());

        let calls = cache.evict_by_age_calls.lock();
        // now=1100, max_age=100 => min_timestamp 1000, once per session.
        assert_eq!(*calls, vec![(1, 1000), (42, 1000)]);
        drop(calls);
        assert_eq!(strategy.last_run_ts(), 1100);
    }

    #[test]
    fn test_time_eviction_stops_on_cancellation() {
        let cache = Arc::new(StubCache::new(vec![0], vec![1, 42]));
        let timing = Arc::new(FakeTiming::new(1000));

        let mut strategy =
            TimeEvictionStrategy::new(Arc::clone(&cache), timing.clone(), 100);
        strategy.execute(&never_cancelled());
        timing.advance(500);

        let cancel = CancellationToken::new();
        cancel.cancel();
        strategy.execute(&cancel);

        assert!(cache.evict_by_age_calls.lock().is_empty());
    }

    // --- Space eviction ---

    #[test]
    fn test_space_eviction_disabled_configurations() {
        let cache = Arc::new(StubCache::new(vec![0], vec![]));

        assert!(SpaceEvictionStrategy::new(Arc::clone(&cache), 0, 2000).is_disabled());
        assert!(SpaceEvictionStrategy::new(Arc::clone(&cache), -1, 2000).is_disabled());
        assert!(SpaceEvictionStrategy::new(Arc::clone(&cache), 1000, 0).is_disabled());
        assert!(SpaceEvictionStrategy::new(Arc::clone(&cache), 1000, 999).is_disabled());
        assert!(!SpaceEvictionStrategy::new(cache, 1000, 2000).is_disabled());
    }

    #[test]
    fn test_space_eviction_should_run_boundaries() {
        let cache = Arc::new(StubCache::new(vec![2001, 2000, 1999], vec![]));
        let strategy = SpaceEvictionStrategy::new(cache, 1000, 2000);

        assert!(strategy.should_run());
        assert!(!strategy.should_run());
        assert!(!strategy.should_run());
    }

    #[test]
    fn test_space_eviction_runs_until_lower_bound() {
        // shouldRun -> 2001; outer -> 2000; sid 1 -> 2000 (evict);
        // sid 42 -> 2000 (evict); outer -> 1500; sid 1 -> 1500 (evict);
        // sid 42 -> 1500 (evict); outer -> 1000 (exit).
        let cache = Arc::new(StubCache::new(
            vec![2001, 2000, 2000, 2000, 1500, 1500, 1500, 1000],
            vec![1, 42],
        ));

        let mut strategy = SpaceEvictionStrategy::new(Arc::clone(&cache), 1000, 2000);
        strategy.execute(&never_cancelled());

        let calls = cache.evict_by_count_calls.lock();
        assert_eq!(*calls, vec![(1, 1), (42, 1), (1, 1), (42, 1)]);
    }

    #[test]
    fn test_space_eviction_stops_mid_pass_when_below_lower_bound() {
        // shouldRun -> 2001; outer -> 2000; sid 1 -> 2000 (evict);
        // sid 42 -> 2000 (evict); outer -> 1500; sid 1 -> 1500 (evict);
        // sid 42 -> 1000 (skip); outer -> 1000 (exit).
        let cache = Arc::new(StubCache::new(
            vec![2001, 2000, 2000, 2000, 1500, 1500, 1000, 1000],
            vec![1, 42],
        ));

        let mut strategy = SpaceEvictionStrategy::new(Arc::clone(&cache), 1000, 2000);
        strategy.execute(&never_cancelled());

        assert_eq!(cache.evict_by_count_calls.lock().len(), 3);
    }

    #[test]
    fn test_space_eviction_respects_cancellation() {
        let cache = Arc::new(StubCache::new(vec![2001, 2000], vec![1, 42]));

        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut strategy = SpaceEvictionStrategy::new(Arc::clone(&cache), 1000, 2000);
        strategy.execute(&cancel);

        assert!(cache.evict_by_count_calls.lock().is_empty());
    }

    // --- Worker ---

    #[tokio::test(start_paused = true)]
    async fn test_evictor_wakes_on_cache_add() {
        let cache = Arc::new(BeaconCache::new());
        let timing: Arc<dyn TimingProvider> = Arc::new(SystemTimingProvider::new());

        // Tight space bounds so a couple of adds trigger eviction.
        let cfg = CacheConfig {
            max_record_age: std::time::Duration::ZERO, // time eviction disabled
            lower_memory_bound: 20,
            upper_memory_bound: 40,
        };

        let mut evictor = CacheEvictor::new(Arc::clone(&cache), timing, cfg);
        let cancel = CancellationToken::new();
        evictor.start(cancel.clone());

        for i in 0..8 {
            cache.add_event_data(1, i, "0123456789");
        }
        assert!(cache.num_bytes() > 40);

        // Yield until the evictor task has drained the cache.
        for _ in 0..100 {
            tokio::task::yield_now().await;
            if cache.num_bytes() <= 20 {
                break;
            }
        }
        assert!(cache.num_bytes() <= 20);

        cancel.cancel();
        evictor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_evictor_stops_promptly_when_cancelled() {
        let cache = Arc::new(BeaconCache::new());
        let timing: Arc<dyn TimingProvider> = Arc::new(SystemTimingProvider::new());

        let mut evictor = CacheEvictor::new(Arc::clone(&cache), timing, CacheConfig::default());
        let cancel = CancellationToken::new();
        evictor.start(cancel.clone());

        cancel.cancel();
        evictor.stop().await;

        // After shutdown, adds no longer wake anything; the data stays put.
        cache.add_event_data(1, 1, "data");
        assert_eq!(cache.get_events(1).len(), 1);
    }
}
