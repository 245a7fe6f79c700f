//! Wall-clock access. Window checks, log partitioning and retention all run
//! on local time, so the clock is injectable for tests.

use chrono::{FixedOffset, Local, NaiveDateTime, Offset, TimeZone, Timelike, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch (UTC).
    fn now_ms(&self) -> i64;

    /// Wall-clock local time for an epoch-ms instant.
    fn to_local(&self, ts_ms: i64) -> NaiveDateTime;

    /// Local minute of the day (0..=1439) right now.
    fn minute_of_day(&self) -> u16 {
        let local = self.to_local(self.now_ms());
        (local.hour() * 60 + local.minute()) as u16
    }
}

/// Host clock in the host's configured time zone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    fn to_local(&self, ts_ms: i64) -> NaiveDateTime {
        match Local.timestamp_millis_opt(ts_ms).single() {
            Some(dt) => dt.naive_local(),
            None => Local::now().naive_local(),
        }
    }
}

/// Settable clock at a fixed UTC offset.
#[derive(Debug)]
pub struct FixedClock {
    now_ms: AtomicI64,
    offset: FixedOffset,
}

impl FixedClock {
    pub fn new(now_ms: i64, offset: FixedOffset) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
            offset,
        }
    }

    /// UTC clock pinned at `h:m` on 2026-06-15.
    pub fn at_utc_hm(hour: u32, minute: u32) -> Self {
        let base = Utc
            .with_ymd_and_hms(2026, 6, 15, hour, minute, 0)
            .single()
            .map(|dt| dt.timestamp_millis())
            .unwrap_or_default();
        Self::new(base, Utc.fix())
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, delta: i64) {
        self.now_ms.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn to_local(&self, ts_ms: i64) -> NaiveDateTime {
        match self.offset.timestamp_millis_opt(ts_ms).single() {
            Some(dt) => dt.naive_local(),
            None => NaiveDateTime::default(),
        }
    }
}
