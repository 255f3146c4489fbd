//! Diagnostic counters for the render and disk threads.
//!
//! The audio thread must not log or block, so every degraded path counts
//! into one of these relaxed atomics instead. Off-thread observers take
//! snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

/// Engine-wide diagnostic counters.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Events dropped because a pool was exhausted or a payload was invalid.
    dropped_events: AtomicU64,
    /// Note-ons that found the note pool empty.
    note_pool_exhausted: AtomicU64,
    /// Voice launches that found the voice pool empty (pre-steal).
    voice_pool_exhausted: AtomicU64,
    /// Allocation failures on the event pool.
    event_pool_exhausted: AtomicU64,
    /// Audio-thread reads that found a stream ring short of data.
    stream_underruns: AtomicU64,
    /// Voices killed by the stealing scheduler.
    voices_stolen: AtomicU64,
    /// Steal requests that found no stealable voice or no spawn budget.
    steal_failures: AtomicU64,
    /// Voices killed by key group (exclusive group) conflicts.
    key_group_kills: AtomicU64,
    /// Script handlers that ran out of instruction budget in one fragment.
    script_overruns: AtomicU64,
    /// Disk streams launched.
    streams_launched: AtomicU64,
    /// Disk streams torn down and acknowledged by the disk thread.
    streams_deleted: AtomicU64,
}

macro_rules! counter {
    ($record:ident, $get:ident, $field:ident) => {
        #[inline]
        pub fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_dropped_event, dropped_events, dropped_events);
    counter!(record_note_pool_exhausted, note_pool_exhausted, note_pool_exhausted);
    counter!(record_voice_pool_exhausted, voice_pool_exhausted, voice_pool_exhausted);
    counter!(record_event_pool_exhausted, event_pool_exhausted, event_pool_exhausted);
    counter!(record_stream_underrun, stream_underruns, stream_underruns);
    counter!(record_voice_stolen, voices_stolen, voices_stolen);
    counter!(record_steal_failure, steal_failures, steal_failures);
    counter!(record_key_group_kill, key_group_kills, key_group_kills);
    counter!(record_script_overrun, script_overruns, script_overruns);
    counter!(record_stream_launched, streams_launched, streams_launched);
    counter!(record_stream_deleted, streams_deleted, streams_deleted);

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dropped_events: self.dropped_events(),
            note_pool_exhausted: self.note_pool_exhausted(),
            voice_pool_exhausted: self.voice_pool_exhausted(),
            event_pool_exhausted: self.event_pool_exhausted(),
            stream_underruns: self.stream_underruns(),
            voices_stolen: self.voices_stolen(),
            steal_failures: self.steal_failures(),
            key_group_kills: self.key_group_kills(),
            script_overruns: self.script_overruns(),
            streams_launched: self.streams_launched(),
            streams_deleted: self.streams_deleted(),
        }
    }
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub dropped_events: u64,
    pub note_pool_exhausted: u64,
    pub voice_pool_exhausted: u64,
    pub event_pool_exhausted: u64,
    pub stream_underruns: u64,
    pub voices_stolen: u64,
    pub steal_failures: u64,
    pub key_group_kills: u64,
    pub script_overruns: u64,
    pub streams_launched: u64,
    pub streams_deleted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = EngineMetrics::new();
        metrics.record_voice_stolen();
        metrics.record_voice_stolen();
        metrics.record_stream_underrun();
        let snap = metrics.snapshot();
        assert_eq!(snap.voices_stolen, 2);
        assert_eq!(snap.stream_underruns, 1);
        assert_eq!(snap.dropped_events, 0);
    }
}
