/**
 * ============================================================================
 * TIMELINE TRACKER MODULE
 * ============================================================================
 *
 * PURPOSE: Canonical audio clock of a recording session
 *
 * The timeline position is total_bytes_written / bytes_per_second, measured
 * from the origin instant set when capture begins. A gap is wall-clock time
 * elapsed since the origin that the position has not caught up with yet.
 *
 * INVARIANTS:
 * - Position never moves backward
 * - Gap byte counts are floored to whole sample frames, so the timeline
 *   under-advances slightly rather than running ahead of real time
 * - Negative elapsed time (clock skew, bursty delivery) yields no gap
 * - Before initialize() every query returns zero and advance() is a no-op
 *
 * The tracker itself is plain data. Callers keep it behind the single
 * mutex shared with the audio source so compute_gap + advance is atomic.
 *
 * ============================================================================
 */

use crate::recording::types::AudioFormat;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct TimelineTracker {
    format: Option<AudioFormat>,
    origin: Option<Instant>,
    bytes_written: u64,
    last_advance: Option<Instant>,
}

impl TimelineTracker {
    pub fn new() -> Self {
        Self::default()
    }

    // Fix the format and the wall-clock origin of the timeline
    pub fn initialize(&mut self, format: AudioFormat, origin: Instant) {
        if !format.is_usable() {
            return;
        }
        self.format = Some(format);
        self.origin = Some(origin);
        self.bytes_written = 0;
        self.last_advance = None;
    }

    pub fn is_initialized(&self) -> bool {
        self.format.is_some() && self.origin.is_some()
    }

    pub fn format(&self) -> Option<&AudioFormat> {
        self.format.as_ref()
    }

    pub fn origin(&self) -> Option<Instant> {
        self.origin
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    // Time covered by the bytes advanced so far
    pub fn position(&self) -> Duration {
        match &self.format {
            Some(format) => format.duration_of(self.bytes_written),
            None => Duration::ZERO,
        }
    }

    // Wall-clock time since the last advance (or since the origin)
    pub fn idle_for(&self, now: Instant) -> Duration {
        match self.last_advance.or(self.origin) {
            Some(since) => now.saturating_duration_since(since),
            None => Duration::ZERO,
        }
    }

    // Block-aligned silence needed to bring the timeline up to `now`.
    // Zero when uninitialized or when the gap is below `threshold`.
    pub fn compute_gap(&self, now: Instant, threshold: Duration) -> u64 {
        let (format, origin) = match (&self.format, self.origin) {
            (Some(format), Some(origin)) => (format, origin),
            _ => return 0,
        };

        let elapsed = now.saturating_duration_since(origin);
        let gap = elapsed.saturating_sub(self.position());
        if gap.is_zero() || gap < threshold {
            return 0;
        }

        format.bytes_for(gap)
    }

    // Record `bytes` of real or synthetic audio on the timeline
    pub fn advance(&mut self, bytes: u64, now: Instant) {
        if !self.is_initialized() {
            return;
        }
        self.bytes_written = self.bytes_written.saturating_add(bytes);
        self.last_advance = Some(now);
    }
}
