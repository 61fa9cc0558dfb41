use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::info;

pub const EVENT_FETCH_STARTED: &str = "FETCH STARTED";
pub const EVENT_FETCH_SUCCEEDED: &str = "FETCH SUCCEEDED";
pub const EVENT_FETCH_FAILED: &str = "FETCH FAILED";

/// Lifecycle event emitted by rank 0. Lost entries never fail a fetch.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    pub name: &'static str,
    pub dir: String,
    pub dataset_id: Option<u64>,
    pub timestamp: SystemTime,
    pub elapsed: Option<Duration>,
}

/// Bandwidth record for one completed transfer.
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub name: &'static str,
    pub src: String,
    pub dst: String,
    pub dataset_id: Option<u64>,
    pub started: SystemTime,
    pub elapsed: Duration,
    pub bytes: u64,
}

pub trait EventSink: Send + Sync {
    fn event(&self, event: &FetchEvent);
    fn transfer(&self, record: &TransferRecord);
}

fn seconds_since_epoch(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Default sink: writes through the `log` facade.
pub struct LogSink;

impl EventSink for LogSink {
    fn event(&self, event: &FetchEvent) {
        match (event.dataset_id, event.elapsed) {
            (Some(id), Some(elapsed)) => info!(
                "{} dir={} dataset={} at={} secs={:.3}",
                event.name,
                event.dir,
                id,
                seconds_since_epoch(event.timestamp),
                elapsed.as_secs_f64()
            ),
            (Some(id), None) => info!(
                "{} dir={} dataset={} at={}",
                event.name,
                event.dir,
                id,
                seconds_since_epoch(event.timestamp)
            ),
            (None, Some(elapsed)) => info!(
                "{} dir={} at={} secs={:.3}",
                event.name,
                event.dir,
                seconds_since_epoch(event.timestamp),
                elapsed.as_secs_f64()
            ),
            (None, None) => info!(
                "{} dir={} at={}",
                event.name,
                event.dir,
                seconds_since_epoch(event.timestamp)
            ),
        }
    }

    fn transfer(&self, record: &TransferRecord) {
        info!(
            "{} src={} dst={} dataset={:?} secs={:.3} bytes={}",
            record.name,
            record.src,
            record.dst,
            record.dataset_id,
            record.elapsed.as_secs_f64(),
            record.bytes
        );
    }
}

/// Wall-clock timestamp paired with a monotonic timer.
#[derive(Debug, Clone)]
pub struct AttemptTimer {
    started_at: SystemTime,
    start: Instant,
}

impl AttemptTimer {
    pub fn new() -> AttemptTimer {
        AttemptTimer {
            started_at: SystemTime::now(),
            start: Instant::now(),
        }
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for AttemptTimer {
    fn default() -> Self {
        Self::new()
    }
}
