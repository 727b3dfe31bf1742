//! Streaming statistics helpers.

use std::f64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A running count/sum/max accumulator, used for the latency measurements
/// GVSP reception tracks (time since first/last packet, retention budget
/// actually used by a completed frame).
#[derive(Debug, Default)]
struct LatencyAccumulator {
    count: AtomicU64,
    sum_us: AtomicU64,
    max_us: AtomicU64,
}

impl LatencyAccumulator {
    fn record(&self, value: std::time::Duration) {
        let us = value.as_micros().min(u128::from(u64::MAX)) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let sum_us = self.sum_us.load(Ordering::Relaxed);
        LatencySnapshot {
            count,
            mean_us: if count == 0 { 0.0 } else { sum_us as f64 / count as f64 },
            max_us: self.max_us.load(Ordering::Relaxed),
        }
    }
}

/// Mean/max view of a [`LatencyAccumulator`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySnapshot {
    pub count: u64,
    pub mean_us: f64,
    pub max_us: u64,
}

/// Live, shareable GVSP stream counters. Cloning shares the same underlying
/// atomics (cheap `Arc` clone), matching how a receiver task and its consumer
/// both need to see the same running totals.
#[derive(Debug, Clone)]
pub struct StreamStatsAccumulator(Arc<StreamStatsInner>);

#[derive(Debug)]
struct StreamStatsInner {
    packets: AtomicU64,
    resends: AtomicU64,
    resend_ranges: AtomicU64,
    dropped_frames: AtomicU64,
    backpressure_drops: AtomicU64,
    late_frames: AtomicU64,
    pool_exhaustions: AtomicU64,
    completed_frames: AtomicU64,
    duplicate_packets: AtomicU64,
    since_first_packet: LatencyAccumulator,
    since_last_packet: LatencyAccumulator,
    frame_retention_used: LatencyAccumulator,
    start: Instant,
}

impl StreamStatsAccumulator {
    /// Create a new statistics accumulator.
    pub fn new() -> Self {
        Self(Arc::new(StreamStatsInner {
            packets: AtomicU64::new(0),
            resends: AtomicU64::new(0),
            resend_ranges: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            backpressure_drops: AtomicU64::new(0),
            late_frames: AtomicU64::new(0),
            pool_exhaustions: AtomicU64::new(0),
            completed_frames: AtomicU64::new(0),
            duplicate_packets: AtomicU64::new(0),
            since_first_packet: LatencyAccumulator::default(),
            since_last_packet: LatencyAccumulator::default(),
            frame_retention_used: LatencyAccumulator::default(),
            start: Instant::now(),
        }))
    }

    pub fn record_packet(&self) {
        self.0.packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate_packet(&self) {
        self.0.duplicate_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resend(&self) {
        self.0.resends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resend_ranges(&self, ranges: u64) {
        if ranges > 0 {
            self.0.resend_ranges.fetch_add(ranges, Ordering::Relaxed);
        }
    }

    pub fn record_drop(&self) {
        self.0.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backpressure_drop(&self) {
        self.0.backpressure_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_late_frame(&self) {
        self.0.late_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pool_exhaustion(&self) {
        self.0.pool_exhaustions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed_frame(&self) {
        self.0.completed_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the elapsed time between the leader packet and the packet that
    /// closed the frame out (trailer, or last payload packet in `ALL_IN`).
    pub fn record_since_first_packet(&self, elapsed: std::time::Duration) {
        self.0.since_first_packet.record(elapsed);
    }

    /// Record the gap between two consecutive packets belonging to the same frame.
    pub fn record_since_last_packet(&self, elapsed: std::time::Duration) {
        self.0.since_last_packet.record(elapsed);
    }

    /// Record how much of the configured frame retention budget a completed
    /// frame actually used before it closed.
    pub fn record_frame_retention_used(&self, elapsed: std::time::Duration) {
        self.0.frame_retention_used.record(elapsed);
    }

    /// Snapshot the current counters.
    pub fn snapshot(&self) -> StreamStats {
        let inner = &self.0;
        let elapsed = inner.start.elapsed().as_secs_f64().max(f64::EPSILON) as f32;
        let packets = inner.packets.load(Ordering::Relaxed);
        StreamStats {
            packets,
            resends: inner.resends.load(Ordering::Relaxed),
            resend_ranges: inner.resend_ranges.load(Ordering::Relaxed),
            dropped_frames: inner.dropped_frames.load(Ordering::Relaxed),
            backpressure_drops: inner.backpressure_drops.load(Ordering::Relaxed),
            late_frames: inner.late_frames.load(Ordering::Relaxed),
            pool_exhaustions: inner.pool_exhaustions.load(Ordering::Relaxed),
            completed_frames: inner.completed_frames.load(Ordering::Relaxed),
            duplicate_packets: inner.duplicate_packets.load(Ordering::Relaxed),
            since_first_packet: inner.since_first_packet.snapshot(),
            since_last_packet: inner.since_last_packet.snapshot(),
            frame_retention_used: inner.frame_retention_used.snapshot(),
            elapsed,
            packets_per_second: packets as f32 / elapsed,
        }
    }
}

impl Default for StreamStatsAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable view of collected GVSP statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamStats {
    pub packets: u64,
    pub resends: u64,
    pub resend_ranges: u64,
    pub dropped_frames: u64,
    pub backpressure_drops: u64,
    pub late_frames: u64,
    pub pool_exhaustions: u64,
    pub completed_frames: u64,
    pub duplicate_packets: u64,
    pub since_first_packet: LatencySnapshot,
    pub since_last_packet: LatencySnapshot,
    pub frame_retention_used: LatencySnapshot,
    pub elapsed: f32,
    pub packets_per_second: f32,
}

/// Event channel statistics.
#[derive(Debug)]
pub struct EventStats {
    received: AtomicU64,
    malformed: AtomicU64,
    filtered: AtomicU64,
    start: Instant,
}

impl EventStats {
    pub fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    pub fn record_event(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EventSnapshot {
        EventSnapshot {
            received: self.received.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            elapsed: self.start.elapsed().as_secs_f32(),
        }
    }
}

impl Default for EventStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable view of event statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventSnapshot {
    pub received: u64,
    pub malformed: u64,
    pub filtered: u64,
    pub elapsed: f32,
}

/// Action command dispatch statistics.
#[derive(Debug)]
pub struct ActionStats {
    sent: AtomicU64,
    acknowledgements: AtomicU64,
    failures: AtomicU64,
}

impl ActionStats {
    pub fn new() -> Self {
        Self {
            sent: AtomicU64::new(0),
            acknowledgements: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn record_send(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ack(&self) {
        self.acknowledgements.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ActionSnapshot {
        ActionSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            acknowledgements: self.acknowledgements.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for ActionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable view of action statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionSnapshot {
    pub sent: u64,
    pub acknowledgements: u64,
    pub failures: u64,
}

/// Timestamp synchronisation statistics.
#[derive(Debug)]
pub struct TimeStats {
    samples: AtomicU64,
    latches: AtomicU64,
    resets: AtomicU64,
}

impl TimeStats {
    pub fn new() -> Self {
        Self {
            samples: AtomicU64::new(0),
            latches: AtomicU64::new(0),
            resets: AtomicU64::new(0),
        }
    }

    pub fn record_sample(&self) {
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latch(&self) {
        self.latches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reset(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TimeSnapshot {
        TimeSnapshot {
            samples: self.samples.load(Ordering::Relaxed),
            latches: self.latches.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
        }
    }
}

impl Default for TimeStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable view of timestamp statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSnapshot {
    pub samples: u64,
    pub latches: u64,
    pub resets: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_snapshot_reflects_recorded_events() {
        let stats = StreamStatsAccumulator::new();
        stats.record_packet();
        stats.record_packet();
        stats.record_resend();
        stats.record_resend_ranges(2);
        stats.record_completed_frame();
        stats.record_since_first_packet(std::time::Duration::from_micros(500));
        stats.record_since_first_packet(std::time::Duration::from_micros(1500));

        let snap = stats.snapshot();
        assert_eq!(snap.packets, 2);
        assert_eq!(snap.resends, 1);
        assert_eq!(snap.resend_ranges, 2);
        assert_eq!(snap.completed_frames, 1);
        assert_eq!(snap.since_first_packet.count, 2);
        assert_eq!(snap.since_first_packet.max_us, 1500);
    }

    #[test]
    fn clone_shares_the_same_counters() {
        let stats = StreamStatsAccumulator::new();
        let handle = stats.clone();
        handle.record_packet();
        assert_eq!(stats.snapshot().packets, 1);
    }
}
