//! Latest-reading cache.
//!
//! A single slot overwritten by every accepted sample, whether or not a
//! session is recording. Backed by a `watch` channel so each update is one
//! atomic replace and readers never observe a partial value.

use serde::Serialize;
use tokio::sync::watch;

use crate::sample::Sample;

/// The most recent sample seen from any producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LatestReading {
    /// Left sensor value.
    pub left: i64,
    /// Right sensor value.
    pub right: i64,
    /// Producer clock in milliseconds.
    pub device_time: i64,
    /// Server capture time in milliseconds since the Unix epoch.
    pub server_time: i64,
}

impl From<&Sample> for LatestReading {
    fn from(sample: &Sample) -> Self {
        Self {
            left: sample.left,
            right: sample.right,
            device_time: sample.device_time,
            server_time: sample.server_time,
        }
    }
}

/// Single-writer, many-reader store for the latest reading.
#[derive(Debug)]
pub struct LatestReadingCache {
    slot: watch::Sender<Option<LatestReading>>,
}

impl LatestReadingCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot }
    }

    /// Overwrite the slot with a sample.
    pub fn update(&self, sample: &Sample) {
        self.slot.send_replace(Some(LatestReading::from(sample)));
    }

    /// The current reading, or `None` if nothing has been seen yet.
    #[must_use]
    pub fn read(&self) -> Option<LatestReading> {
        *self.slot.borrow()
    }

    /// Receive every future update.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<LatestReading>> {
        self.slot.subscribe()
    }
}

impl Default for LatestReadingCache {
    fn default() -> Self {
        Self::new()
    }
}

/// JSON view of the cached reading.
///
/// `timestamp` is the producer's clock, as dashboards expect; it is `null`
/// while no reading has been seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReadingView {
    pub left: i64,
    pub right: i64,
    pub timestamp: Option<i64>,
    pub server_time: Option<i64>,
}

impl From<Option<LatestReading>> for ReadingView {
    fn from(reading: Option<LatestReading>) -> Self {
        match reading {
            Some(r) => Self {
                left: r.left,
                right: r.right,
                timestamp: Some(r.device_time),
                server_time: Some(r.server_time),
            },
            None => Self {
                left: 0,
                right: 0,
                timestamp: None,
                server_time: None,
            },
        }
    }
}
