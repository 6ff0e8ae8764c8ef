//! Replay pacing.

use std::time::Duration;

use tokio::time::Instant;

use crate::record::{now_ms, Framing, Record};
use crate::stage::Transform;

/// Wall clock that follows the tokio clock, so paused-time tests can drive it.
#[derive(Debug, Clone, Copy)]
struct WallClock {
    start_ms: i64,
    start: Instant,
}

impl WallClock {
    fn new() -> Self {
        Self {
            start_ms: now_ms(),
            start: Instant::now(),
        }
    }

    fn now_ms(&self) -> i64 {
        self.start_ms + self.start.elapsed().as_millis() as i64
    }
}

/// Reproduces the original spacing of multiplexed log records.
///
/// The offset between wall clock and stream time is fixed at the first
/// record and re-established whenever stream time goes backwards (a looped
/// replay). Records are released in arrival order; while one is waiting no
/// further input is taken.
#[derive(Debug)]
pub struct TimestampThrottle {
    clock: WallClock,
    last_ms: i64,
    offset_ms: i64,
    pending: Option<(Instant, Record)>,
}

impl Default for TimestampThrottle {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestampThrottle {
    pub fn new() -> Self {
        let clock = WallClock::new();
        Self {
            last_ms: clock.now_ms(),
            clock,
            offset_ms: 0,
            pending: None,
        }
    }

    /// Milliseconds to hold a record stamped `record_ms`.
    fn delay_for(&mut self, record_ms: i64) -> i64 {
        let now = self.clock.now_ms();
        if record_ms < self.last_ms {
            self.offset_ms = now - record_ms;
        }
        self.last_ms = record_ms;
        record_ms - now + self.offset_ms
    }
}

impl Transform for TimestampThrottle {
    fn name(&self) -> &str {
        "timestamp-throttle"
    }

    fn handle_read(&mut self, record: Record, out: &mut Vec<Record>) {
        let timestamp_ms = match &record {
            Record::Tagged(t) if t.framing == Framing::Multiplexed => Some(t.timestamp_ms),
            _ => None,
        };
        let Some(timestamp_ms) = timestamp_ms else {
            out.push(record);
            return;
        };
        let delay = self.delay_for(timestamp_ms);
        if delay <= 0 {
            out.push(record);
        } else {
            let at = Instant::now() + Duration::from_millis(delay as u64);
            self.pending = Some((at, record));
        }
    }

    fn ready(&self) -> bool {
        self.pending.is_none()
    }

    fn poll_timeout(&self) -> Option<Instant> {
        self.pending.as_ref().map(|(at, _)| *at)
    }

    fn handle_timeout(&mut self, now: Instant, out: &mut Vec<Record>) {
        match self.pending.take() {
            Some((at, record)) if now >= at => out.push(record),
            other => self.pending = other,
        }
    }
}

/// Caps throughput at a fixed number of records per second.
#[derive(Debug)]
pub struct RateThrottle {
    interval: Duration,
    next_slot: Option<Instant>,
    pending: Option<Record>,
}

impl RateThrottle {
    pub fn new(records_per_second: u64) -> Self {
        Self {
            interval: Duration::from_secs(1) / records_per_second.max(1) as u32,
            next_slot: None,
            pending: None,
        }
    }

    fn take_slot(&mut self, now: Instant) {
        let slot = self.next_slot.map_or(now, |s| s.max(now));
        self.next_slot = Some(slot + self.interval);
    }
}

impl Transform for RateThrottle {
    fn name(&self) -> &str {
        "rate-throttle"
    }

    fn handle_read(&mut self, record: Record, out: &mut Vec<Record>) {
        let now = Instant::now();
        match self.next_slot {
            Some(slot) if slot > now => self.pending = Some(record),
            _ => {
                self.take_slot(now);
                out.push(record);
            }
        }
    }

    fn ready(&self) -> bool {
        self.pending.is_none()
    }

    fn poll_timeout(&self) -> Option<Instant> {
        self.pending.as_ref().and(self.next_slot)
    }

    fn handle_timeout(&mut self, now: Instant, out: &mut Vec<Record>) {
        if self.next_slot.map_or(true, |slot| now >= slot) {
            if let Some(record) = self.pending.take() {
                self.take_slot(now);
                out.push(record);
            }
        }
    }
}
