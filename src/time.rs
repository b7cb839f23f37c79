use chrono::{DateTime, TimeZone, Utc};
use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

pub type Timestamp = DateTime<Utc>;

/// Time authority for lease expiry. Only the store consults a clock; clients
/// never compare expiry against their own wall time.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> Timestamp;
}

/// Wall clock. Subject to NTP steps, so expiry is best-effort when used as
/// the store authority.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// Wall time anchored once, then advanced by tokio's monotonic clock.
/// Never goes backwards, and follows paused/advanced time in tests.
#[derive(Debug)]
pub struct MonotonicClock {
    anchor: Timestamp,
    started: tokio::time::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            anchor: Utc::now(),
            started: tokio::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        let elapsed = self.started.elapsed();
        deadline(self.anchor, elapsed).unwrap_or(self.anchor)
    }
}

/// Hand-driven clock for simulating pauses and expiry.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    /// Starts at the Unix epoch, which keeps test output readable.
    pub fn at_epoch() -> Self {
        Self {
            millis: AtomicI64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        let ms = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.millis.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, to: Timestamp) {
        self.millis.store(to.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        let ms = self.millis.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
    }
}

/// `now + ttl`, or `None` if it does not fit in a timestamp.
pub fn deadline(now: Timestamp, ttl: Duration) -> Option<Timestamp> {
    let ttl = chrono::Duration::from_std(ttl).ok()?;
    now.checked_add_signed(ttl)
}
