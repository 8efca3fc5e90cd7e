use std::collections::VecDeque;

use super::record::CacheRecord;

/// Outcome of an eviction pass over one entry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Removed {
    pub records: usize,
    pub bytes: i64,
}

/// Per-session cache entry: records pending transmission plus an optional
/// snapshot reserved for the chunk currently in flight.
///
/// The entry itself is not synchronized; the cache wraps each entry in its
/// own mutex and serializes all access through it.
#[derive(Debug, Default)]
pub struct CacheEntry {
    event_data: VecDeque<CacheRecord>,
    action_data: VecDeque<CacheRecord>,
    event_data_being_sent: Option<VecDeque<CacheRecord>>,
    action_data_being_sent: Option<VecDeque<CacheRecord>>,
}

impl CacheEntry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_event_record(&mut self, record: CacheRecord) {
        self.event_data.push_back(record);
    }

    pub fn add_action_record(&mut self, record: CacheRecord) {
        self.action_data.push_back(record);
    }

    /// Sum of record sizes over all four lists.
    pub fn total_bytes(&self) -> i64 {
        let live: i64 = self
            .action_data
            .iter()
            .chain(self.event_data.iter())
            .map(CacheRecord::size_in_bytes)
            .sum();

        let in_flight: i64 = self
            .action_data_being_sent
            .iter()
            .flatten()
            .chain(self.event_data_being_sent.iter().flatten())
            .map(CacheRecord::size_in_bytes)
            .sum();

        live + in_flight
    }

    /// Bytes held in the live lists only; the cache-wide byte counter tracks
    /// exactly this across all entries.
    pub fn live_bytes(&self) -> i64 {
        self.action_data
            .iter()
            .chain(self.event_data.iter())
            .map(CacheRecord::size_in_bytes)
            .sum()
    }

    pub fn event_data(&self) -> impl Iterator<Item = &CacheRecord> {
        self.event_data.iter()
    }

    pub fn action_data(&self) -> impl Iterator<Item = &CacheRecord> {
        self.action_data.iter()
    }

    pub fn event_data_being_sent(&self) -> impl Iterator<Item = &CacheRecord> {
        self.event_data_being_sent.iter().flatten()
    }

    pub fn action_data_being_sent(&self) -> impl Iterator<Item = &CacheRecord> {
        self.action_data_being_sent.iter().flatten()
    }

    /// True while no chunking is in progress, i.e. the live lists must be
    /// snapshotted before a chunk can be built.
    pub fn needs_data_copy_before_chunking(&self) -> bool {
        self.action_data_being_sent.is_none() && self.event_data_being_sent.is_none()
    }

    /// Move the live lists into the in-flight snapshot, leaving the live
    /// lists empty. Records added afterwards accumulate in the live lists
    /// and are untouched by the in-flight transmission.
    pub fn copy_data_for_chunking(&mut self) {
        debug_assert!(self.needs_data_copy_before_chunking());
        self.action_data_being_sent = Some(std::mem::take(&mut self.action_data));
        self.event_data_being_sent = Some(std::mem::take(&mut self.event_data));
    }

    /// Assemble the next chunk from the in-flight lists.
    ///
    /// Starts with `prefix`; appends action records, then event records, each
    /// preceded by `delimiter`. The size check happens before appending, so a
    /// single record may push the chunk past `max_size`, but never extends a
    /// chunk that is already at or above it. Every chunk carries at least one
    /// record, or the send loop could spin on an oversized prefix without
    /// draining anything. Serialized records are marked;
    /// [`CacheEntry::remove_data_marked_for_sending`] commits exactly those.
    pub fn get_chunk(&mut self, prefix: &str, max_size: usize, delimiter: &str) -> String {
        if !self.has_data_to_send() {
            return String::new();
        }

        let mut chunk = String::with_capacity(max_size + prefix.len());
        chunk.push_str(prefix);
        let mut appended = false;

        for list in [
            self.action_data_being_sent.as_mut(),
            self.event_data_being_sent.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            for record in list.iter_mut() {
                if appended && chunk.len() >= max_size {
                    return chunk;
                }
                record.mark_for_sending();
                chunk.push_str(delimiter);
                chunk.push_str(record.data());
                appended = true;
            }
        }

        chunk
    }

    /// Commit: drop every in-flight record that was serialized into a chunk.
    /// Unmarked in-flight records stay for the next chunk; once none remain,
    /// the in-flight lists are cleared.
    pub fn remove_data_marked_for_sending(&mut self) {
        if let Some(list) = self.action_data_being_sent.as_mut() {
            while list.front().is_some_and(CacheRecord::is_marked_for_sending) {
                list.pop_front();
            }
        }
        if let Some(list) = self.event_data_being_sent.as_mut() {
            while list.front().is_some_and(CacheRecord::is_marked_for_sending) {
                list.pop_front();
            }
        }

        if !self.has_data_to_send() {
            self.action_data_being_sent = None;
            self.event_data_being_sent = None;
        }
    }

    /// Rollback: prepend the in-flight lists back onto the live lists,
    /// preserving record order, and clear all sending marks.
    pub fn reset_data_marked_for_sending(&mut self) {
        if let Some(mut list) = self.action_data_being_sent.take() {
            for record in list.iter_mut() {
                record.unset_sending_mark();
            }
            list.append(&mut self.action_data);
            self.action_data = list;
        }
        if let Some(mut list) = self.event_data_being_sent.take() {
            for record in list.iter_mut() {
                record.unset_sending_mark();
            }
            list.append(&mut self.event_data);
            self.event_data = list;
        }
    }

    /// Whether any in-flight data exists.
    pub fn has_data_to_send(&self) -> bool {
        self.action_data_being_sent
            .as_ref()
            .is_some_and(|l| !l.is_empty())
            || self
                .event_data_being_sent
                .as_ref()
                .is_some_and(|l| !l.is_empty())
    }

    /// Remove every live record with a timestamp strictly below `min_timestamp`.
    /// The in-flight lists are untouched.
    pub fn remove_records_older_than(&mut self, min_timestamp: i64) -> Removed {
        let mut removed = Removed::default();

        for list in [&mut self.action_data, &mut self.event_data] {
            list.retain(|record| {
                if record.timestamp_ms() < min_timestamp {
                    removed.records += 1;
                    removed.bytes += record.size_in_bytes();
                    false
                } else {
                    true
                }
            });
        }

        removed
    }

    /// Remove up to `count` of the oldest live records: the action list is
    /// drained front-first before the event list.
    pub fn remove_oldest_records(&mut self, count: usize) -> Removed {
        let mut removed = Removed::default();

        for list in [&mut self.action_data, &mut self.event_data] {
            while removed.records < count {
                match list.pop_front() {
                    Some(record) => {
                        removed.records += 1;
                        removed.bytes += record.size_in_bytes();
                    }
                    None => break,
                }
            }
        }

        removed
    }
}
