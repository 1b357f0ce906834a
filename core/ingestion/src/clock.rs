use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Wall-clock source in fractional unix seconds
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;

    fn now_millis(&self) -> i64 {
        (self.now() * 1000.0).round() as i64
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        Utc::now().timestamp_millis() as f64 / 1000.0
    }
}

/// Clock that only moves when told to. Used to drive the buffer state machine
/// through silence and analysis windows without sleeping.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start_secs: f64) -> Self {
        Self {
            millis: AtomicI64::new((start_secs * 1000.0).round() as i64),
        }
    }

    pub fn advance(&self, secs: f64) {
        self.millis
            .fetch_add((secs * 1000.0).round() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, secs: f64) {
        self.millis
            .store((secs * 1000.0).round() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        self.millis.load(Ordering::SeqCst) as f64 / 1000.0
    }
}

/// RFC3339 with millisecond precision and a `Z` suffix, so stored values
/// compare correctly as plain strings.
pub fn format_timestamp(secs: f64) -> String {
    let millis = (secs * 1000.0).round() as i64;
    DateTime::<Utc>::from_timestamp_millis(millis)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> Option<f64> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp_millis() as f64 / 1000.0)
}
