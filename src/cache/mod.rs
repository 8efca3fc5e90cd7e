pub mod entry;
pub mod eviction;
pub mod record;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use self::entry::CacheEntry;
use self::record::CacheRecord;

/// Callback invoked whenever sendable data is added to the cache.
pub type CacheObserverFn = Box<dyn Fn() + Send + Sync>;

/// Concurrent in-memory store of per-session beacon records.
///
/// The session-id → entry topology lives in a `DashMap`, so no global
/// read/write lock is needed; each entry carries its own mutex serializing
/// the four record lists. `cache_bytes` tracks the live (not in-flight)
/// bytes across all entries and is an aggregate hint: atomically updated,
/// possibly momentarily stale relative to concurrent adds.
///
/// Lock order is always topology → entry; no map operation happens while an
/// entry lock is held.
pub struct BeaconCache {
    entries: DashMap<i32, Arc<Mutex<CacheEntry>>>,
    cache_bytes: AtomicI64,
    observers: Mutex<Vec<CacheObserverFn>>,
}

impl Default for BeaconCache {
    fn default() -> Self {
        Self::new()
    }
}

impl BeaconCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            cache_bytes: AtomicI64::new(0),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Register an observer notified once per successful add, after the
    /// mutation is visible and the byte counter is updated.
    pub fn add_observer(&self, observer: CacheObserverFn) {
        self.observers.lock().push(observer);
    }

    /// Append an event record for the given session.
    pub fn add_event_data(&self, session_id: i32, timestamp_ms: i64, data: impl Into<String>) {
        let record = CacheRecord::new(timestamp_ms, data);
        let size = record.size_in_bytes();

        let entry = self.entry_or_insert(session_id);
        entry.lock().add_event_record(record);

        self.cache_bytes.fetch_add(size, Ordering::SeqCst);
        self.on_data_added();
    }

    /// Append an action record for the given session.
    pub fn add_action_data(&self, session_id: i32, timestamp_ms: i64, data: impl Into<String>) {
        let record = CacheRecord::new(timestamp_ms, data);
        let size = record.size_in_bytes();

        let entry = self.entry_or_insert(session_id);
        entry.lock().add_action_record(record);

        self.cache_bytes.fetch_add(size, Ordering::SeqCst);
        self.on_data_added();
    }

    /// Remove the whole entry for a session, subtracting its live bytes.
    pub fn delete_entry(&self, session_id: i32) {
        if let Some((_, entry)) = self.entries.remove(&session_id) {
            let live = entry.lock().live_bytes();
            self.cache_bytes.fetch_sub(live, Ordering::SeqCst);
        }
    }

    /// Snapshot of all session ids currently cached.
    pub fn session_ids(&self) -> Vec<i32> {
        self.entries.iter().map(|kv| *kv.key()).collect()
    }

    /// Snapshot of the pending event payloads for a session.
    pub fn get_events(&self, session_id: i32) -> Vec<String> {
        self.with_entry(session_id, |entry| {
            entry.event_data().map(|r| r.data().to_string()).collect()
        })
        .unwrap_or_default()
    }

    /// Snapshot of the pending action payloads for a session.
    pub fn get_actions(&self, session_id: i32) -> Vec<String> {
        self.with_entry(session_id, |entry| {
            entry.action_data().map(|r| r.data().to_string()).collect()
        })
        .unwrap_or_default()
    }

    /// Snapshot of the in-flight event records (inspection/tests).
    pub fn get_events_being_sent(&self, session_id: i32) -> Vec<CacheRecord> {
        self.with_entry(session_id, |entry| {
            entry.event_data_being_sent().cloned().collect()
        })
        .unwrap_or_default()
    }

    /// Snapshot of the in-flight action records (inspection/tests).
    pub fn get_actions_being_sent(&self, session_id: i32) -> Vec<CacheRecord> {
        self.with_entry(session_id, |entry| {
            entry.action_data_being_sent().cloned().collect()
        })
        .unwrap_or_default()
    }

    /// True if the session holds no record data at all.
    pub fn is_empty(&self, session_id: i32) -> bool {
        self.with_entry(session_id, |entry| entry.total_bytes() == 0)
            .unwrap_or(true)
    }

    /// Build the next transmission chunk for a session.
    ///
    /// On the first call of a chunking round the live lists are atomically
    /// snapshotted into the in-flight lists and their bytes leave the cache
    /// counter; the transmission is expected to either commit
    /// ([`BeaconCache::remove_chunked`]) or roll back
    /// ([`BeaconCache::reset_chunked`]) soon after.
    pub fn next_chunk(
        &self,
        session_id: i32,
        prefix: &str,
        max_size: usize,
        delimiter: &str,
    ) -> String {
        let Some(entry) = self.entry(session_id) else {
            return String::new();
        };

        let mut guard = entry.lock();

        if guard.needs_data_copy_before_chunking() {
            let live = guard.live_bytes();
            guard.copy_data_for_chunking();
            drop(guard);

            self.cache_bytes.fetch_sub(live, Ordering::SeqCst);
            guard = entry.lock();
        }

        guard.get_chunk(prefix, max_size, delimiter)
    }

    /// Commit the chunked records of a session after successful transmission.
    pub fn remove_chunked(&self, session_id: i32) {
        if let Some(entry) = self.entry(session_id) {
            entry.lock().remove_data_marked_for_sending();
        }
    }

    /// Roll the in-flight records of a session back into the live lists.
    pub fn reset_chunked(&self, session_id: i32) {
        let Some(entry) = self.entry(session_id) else {
            return;
        };

        let restored = {
            let mut guard = entry.lock();
            let before = guard.live_bytes();
            guard.reset_data_marked_for_sending();
            guard.live_bytes() - before
        };

        self.cache_bytes.fetch_add(restored, Ordering::SeqCst);
        self.on_data_added();
    }

    /// Evict live records older than `min_timestamp`; returns how many were
    /// removed. In-flight records are untouched.
    pub fn evict_by_age(&self, session_id: i32, min_timestamp: i64) -> usize {
        let Some(entry) = self.entry(session_id) else {
            return 0;
        };

        let removed = entry.lock().remove_records_older_than(min_timestamp);
        self.cache_bytes.fetch_sub(removed.bytes, Ordering::SeqCst);
        removed.records
    }

    /// Evict up to `count` of the oldest live records; returns how many were
    /// removed.
    pub fn evict_by_count(&self, session_id: i32, count: usize) -> usize {
        let Some(entry) = self.entry(session_id) else {
            return 0;
        };

        let removed = entry.lock().remove_oldest_records(count);
        self.cache_bytes.fetch_sub(removed.bytes, Ordering::SeqCst);
        removed.records
    }

    /// Live bytes across all entries (atomic read, may lag concurrent adds).
    pub fn num_bytes(&self) -> i64 {
        self.cache_bytes.load(Ordering::SeqCst)
    }

    fn entry(&self, session_id: i32) -> Option<Arc<Mutex<CacheEntry>>> {
        self.entries.get(&session_id).map(|kv| Arc::clone(&kv))
    }

    fn entry_or_insert(&self, session_id: i32) -> Arc<Mutex<CacheEntry>> {
        Arc::clone(
            &self
                .entries
                .entry(session_id)
                .or_insert_with(|| Arc::new(Mutex::new(CacheEntry::new()))),
        )
    }

    fn with_entry<T>(&self, session_id: i32, f: impl FnOnce(&CacheEntry) -> T) -> Option<T> {
        self.entry(session_id).map(|entry| f(&entry.lock()))
    }

    fn on_data_added(&self) {
        for observer in self.observers.lock().iter() {
            observer();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn record_bytes(payload: &str) -> i64 {
        8 + payload.len() as i64
    }

    #[test]
    fn test_add_updates_bytes_and_notifies_once() {
        let cache = BeaconCache::new();
        let notifications = Arc::new(AtomicUsize::new(0));

        let observed = Arc::clone(&notifications);
        cache.add_observer(Box::new(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        }));

        cache.add_event_data(1, 100, "ev");
        assert_eq!(cache.num_bytes(), record_bytes("ev"));
        assert_eq!(notifications.load(Ordering::SeqCst), 1);

        cache.add_action_data(1, 100, "act");
        assert_eq!(cache.num_bytes(), record_bytes("ev") + record_bytes("act"));
        assert_eq!(notifications.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_get_events_and_actions_in_insertion_order() {
        let cache = BeaconCache::new();
        cache.add_event_data(1, 1, "e1");
        cache.add_event_data(1, 2, "e2");
        cache.add_action_data(1, 1, "a1");

        assert_eq!(cache.get_events(1), vec!["e1", "e2"]);
        assert_eq!(cache.get_actions(1), vec!["a1"]);
        assert!(cache.get_events(99).is_empty());
    }

    #[test]
    fn test_session_ids_snapshot() {
        let cache = BeaconCache::new();
        cache.add_event_data(1, 1, "a");
        cache.add_event_data(42, 1, "b");

        let mut ids = cache.session_ids();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 42]);
    }

    #[test]
    fn test_delete_entry_subtracts_bytes() {
        let cache = BeaconCache::new();
        cache.add_event_data(1, 1, "ev");
        cache.add_action_data(2, 1, "act");

        cache.delete_entry(1);
        assert_eq!(cache.num_bytes(), record_bytes("act"));
        assert!(cache.is_empty(1));

        // Unknown ids are a no-op.
        cache.delete_entry(99);
        assert_eq!(cache.num_bytes(), record_bytes("act"));
    }

    #[test]
    fn test_next_chunk_snapshots_and_deducts_bytes() {
        let cache = BeaconCache::new();
        cache.add_action_data(1, 1, "act");
        cache.add_event_data(1, 2, "ev");

        let chunk = cache.next_chunk(1, "prefix", 1024, "&");
        assert_eq!(chunk, "prefix&act&ev");
        assert_eq!(cache.num_bytes(), 0);

        assert_eq!(cache.get_actions_being_sent(1).len(), 1);
        assert_eq!(cache.get_events_being_sent(1).len(), 1);
        assert!(cache.get_actions(1).is_empty());
        assert!(cache.get_events(1).is_empty());
    }

    #[test]
    fn test_next_chunk_for_unknown_session_is_empty() {
        let cache = BeaconCache::new();
        assert_eq!(cache.next_chunk(1, "prefix", 1024, "&"), "");
    }

    #[test]
    fn test_adds_during_chunking_stay_out_of_snapshot() {
        let cache = BeaconCache::new();
        cache.add_action_data(1, 1, "old");

        let _ = cache.next_chunk(1, "p", 1024, "&");
        cache.add_action_data(1, 2, "new");

        assert_eq!(cache.get_actions(1), vec!["new"]);
        assert_eq!(cache.get_actions_being_sent(1).len(), 1);
        assert_eq!(cache.num_bytes(), record_bytes("new"));
    }

    #[test]
    fn test_remove_chunked_commits() {
        let cache = BeaconCache::new();
        cache.add_action_data(1, 1, "act");

        let _ = cache.next_chunk(1, "p", 1024, "&");
        cache.remove_chunked(1);

        assert!(cache.is_empty(1));
        assert_eq!(cache.num_bytes(), 0);
        assert!(cache.get_actions_being_sent(1).is_empty());
    }

    #[test]
    fn test_reset_chunked_restores_bytes_and_notifies() {
        let cache = BeaconCache::new();
        let notifications = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&notifications);
        cache.add_observer(Box::new(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        }));

        cache.add_action_data(1, 1, "a1");
        cache.add_event_data(1, 2, "e1");
        let bytes_before = cache.num_bytes();
        let adds = notifications.load(Ordering::SeqCst);

        let _ = cache.next_chunk(1, "p", 1024, "&");
        cache.reset_chunked(1);

        assert_eq!(cache.num_bytes(), bytes_before);
        assert_eq!(cache.get_actions(1), vec!["a1"]);
        assert_eq!(cache.get_events(1), vec!["e1"]);
        assert_eq!(notifications.load(Ordering::SeqCst), adds + 1);
    }

    #[test]
    fn test_evict_by_age_removes_only_older_records() {
        let cache = BeaconCache::new();
        cache.add_event_data(1, 10, "old");
        cache.add_event_data(1, 20, "young");
        cache.add_action_data(1, 5, "older");

        let removed = cache.evict_by_age(1, 20);
        assert_eq!(removed, 2);
        assert_eq!(cache.get_events(1), vec!["young"]);
        assert!(cache.get_actions(1).is_empty());
        assert_eq!(cache.num_bytes(), record_bytes("young"));
    }

    #[test]
    fn test_evict_by_age_unknown_session() {
        let cache = BeaconCache::new();
        assert_eq!(cache.evict_by_age(1, 100), 0);
    }

    #[test]
    fn test_evict_by_count_prefers_actions() {
        let cache = BeaconCache::new();
        cache.add_event_data(1, 1, "e1");
        cache.add_action_data(1, 2, "a1");

        assert_eq!(cache.evict_by_count(1, 1), 1);
        assert!(cache.get_actions(1).is_empty());
        assert_eq!(cache.get_events(1), vec!["e1"]);

        assert_eq!(cache.evict_by_count(1, 5), 1);
        assert!(cache.is_empty(1));
    }

    #[test]
    fn test_byte_accounting_across_mixed_operations() {
        let cache = BeaconCache::new();
        cache.add_event_data(1, 1, "aaaa");
        cache.add_action_data(1, 2, "bb");
        cache.add_event_data(42, 3, "cccc");

        let expected = |cache: &BeaconCache| {
            let mut sum = 0;
            for sid in cache.session_ids() {
                sum += cache
                    .get_events(sid)
                    .iter()
                    .chain(cache.get_actions(sid).iter())
                    .map(|d| record_bytes(d))
                    .sum::<i64>();
            }
            sum
        };

        assert_eq!(cache.num_bytes(), expected(&cache));

        cache.evict_by_count(1, 1);
        assert_eq!(cache.num_bytes(), expected(&cache));

        let _ = cache.next_chunk(42, "p", 1024, "&");
        assert_eq!(cache.num_bytes(), expected(&cache));

        cache.reset_chunked(42);
        assert_eq!(cache.num_bytes(), expected(&cache));

        cache.delete_entry(1);
        assert_eq!(cache.num_bytes(), expected(&cache));
    }

    #[test]
    fn test_concurrent_adds_keep_counter_consistent() {
        let cache = Arc::new(BeaconCache::new());
        let mut handles = Vec::new();

        for sid in 0..4 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for i in 0..1000 {
                    cache.add_event_data(sid, i, "xxxxxxxx");
                }
            }));
        }

        for h in handles {
            h.join().expect("thread panicked");
        }

        assert_eq!(cache.num_bytes(), 4 * 1000 * (8 + 8));
        for sid in 0..4 {
            assert_eq!(cache.get_events(sid).len(), 1000);
        }
    }

    #[test]
    fn test_single_writer_order_preserved_under_concurrency() {
        let cache = Arc::new(BeaconCache::new());
        let mut handles = Vec::new();

        for sid in 0..4 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for i in 0..500 {
                    cache.add_event_data(sid, i, format!("ev-{i}"));
                }
            }));
        }

        for h in handles {
            h.join().expect("thread panicked");
        }

        for sid in 0..4 {
            let events = cache.get_events(sid);
            let expected: Vec<_> = (0..500).map(|i| format!("ev-{i}")).collect();
            assert_eq!(events, expected);
        }
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        #[derive(Debug, Clone)]
        enum Op {
            AddEvent { sid: i32, ts: i64, data: String },
            AddAction { sid: i32, ts: i64, data: String },
            EvictByAge { sid: i32, min_ts: i64 },
            EvictByCount { sid: i32, count: usize },
            Chunk { sid: i32 },
            ResetChunked { sid: i32 },
            RemoveChunked { sid: i32 },
            DeleteEntry { sid: i32 },
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            let sid = 0..4i32;
            let ts = 0..100i64;
            prop_oneof![
                (sid.clone(), ts.clone(), "[a-z]{0,12}")
                    .prop_map(|(sid, ts, data)| Op::AddEvent { sid, ts, data }),
                (sid.clone(), ts.clone(), "[a-z]{0,12}")
                    .prop_map(|(sid, ts, data)| Op::AddAction { sid, ts, data }),
                (sid.clone(), ts).prop_map(|(sid, min_ts)| Op::EvictByAge { sid, min_ts }),
                (sid.clone(), 0..5usize)
                    .prop_map(|(sid, count)| Op::EvictByCount { sid, count }),
                sid.clone().prop_map(|sid| Op::Chunk { sid }),
                sid.clone().prop_map(|sid| Op::ResetChunked { sid }),
                sid.clone().prop_map(|sid| Op::RemoveChunked { sid }),
                sid.prop_map(|sid| Op::DeleteEntry { sid }),
            ]
        }

        fn live_bytes_recomputed(cache: &BeaconCache) -> i64 {
            cache
                .session_ids()
                .into_iter()
                .map(|sid| {
                    cache
                        .get_events(sid)
                        .iter()
                        .chain(cache.get_actions(sid).iter())
                        .map(|d| 8 + d.len() as i64)
                        .sum::<i64>()
                })
                .sum()
        }

        proptest! {
            #[test]
            fn prop_num_bytes_matches_live_records(ops in prop::collection::vec(op_strategy(), 1..64)) {
                let cache = BeaconCache::new();

                for op in ops {
                    match op {
                        Op::AddEvent { sid, ts, data } => cache.add_event_data(sid, ts, data),
                        Op::AddAction { sid, ts, data } => cache.add_action_data(sid, ts, data),
                        Op::EvictByAge { sid, min_ts } => {
                            let _ = cache.evict_by_age(sid, min_ts);
                        }
                        Op::EvictByCount { sid, count } => {
                            let _ = cache.evict_by_count(sid, count);
                        }
                        Op::Chunk { sid } => {
                            let _ = cache.next_chunk(sid, "p", 64, "&");
                        }
                        Op::ResetChunked { sid } => cache.reset_chunked(sid),
                        Op::RemoveChunked { sid } => cache.remove_chunked(sid),
                        Op::DeleteEntry { sid } => cache.delete_entry(sid),
                    }

                    // In-flight bytes are deducted at chunking time, so the
                    // counter must always equal the recomputed live bytes.
                    prop_assert_eq!(cache.num_bytes(), live_bytes_recomputed(&cache));
                }
            }

            #[test]
            fn prop_reset_after_chunk_restores_entry_exactly(
                actions in prop::collection::vec((0..100i64, "[a-z]{0,8}"), 0..16),
                events in prop::collection::vec((0..100i64, "[a-z]{0,8}"), 0..16),
                max_size in 1..128usize,
            ) {
                let cache = BeaconCache::new();
                for (ts, data) in &actions {
                    cache.add_action_data(1, *ts, data.clone());
                }
                for (ts, data) in &events {
                    cache.add_event_data(1, *ts, data.clone());
                }

                let bytes_before = cache.num_bytes();
                let actions_before = cache.get_actions(1);
                let events_before = cache.get_events(1);

                let _ = cache.next_chunk(1, "prefix", max_size, "&");
                cache.reset_chunked(1);

                prop_assert_eq!(cache.num_bytes(), bytes_before);
                prop_assert_eq!(cache.get_actions(1), actions_before);
                prop_assert_eq!(cache.get_events(1), events_before);
            }

            #[test]
            fn prop_insertion_order_preserved(payloads in prop::collection::vec("[a-z]{1,8}", 1..32)) {
                let cache = BeaconCache::new();
                for (i, data) in payloads.iter().enumerate() {
                    cache.add_event_data(7, i as i64, data.clone());
                }

                prop_assert_eq!(cache.get_events(7), payloads);
            }

            #[test]
            fn prop_evict_by_age_leaves_exactly_young_records(
                records in prop::collection::vec((0..100i64, "[a-z]{1,4}"), 0..32),
                min_ts in 0..100i64,
            ) {
                let cache = BeaconCache::new();
                for (ts, data) in &records {
                    cache.add_event_data(1, *ts, data.clone());
                }

                let removed = cache.evict_by_age(1, min_ts);

                let expected_removed = records.iter().filter(|(ts, _)| *ts < min_ts).count();
                prop_assert_eq!(removed, expected_removed);

                let expected_kept: Vec<String> = records
                    .iter()
                    .filter(|(ts, _)| *ts >= min_ts)
                    .map(|(_, d)| d.clone())
                    .collect();
                prop_assert_eq!(cache.get_events(1), expected_kept);
            }
        }
    }
}
