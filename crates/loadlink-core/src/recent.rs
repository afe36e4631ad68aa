//! Recent readings of the recording session.

use serde::Serialize;
use std::collections::VecDeque;

use crate::sample::Sample;

/// Readings kept for the session data view.
pub const RECENT_CAPACITY: usize = 100;

/// One recorded reading as shown to dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecentReading {
    pub left: i64,
    pub right: i64,
    /// Producer clock in milliseconds.
    pub timestamp: i64,
}

impl From<&Sample> for RecentReading {
    fn from(sample: &Sample) -> Self {
        Self {
            left: sample.left,
            right: sample.right,
            timestamp: sample.device_time,
        }
    }
}

/// Bounded ring of the most recently recorded readings, oldest first.
#[derive(Debug, Clone)]
pub struct RecentReadings {
    readings: VecDeque<RecentReading>,
    max_recent: usize,
}

impl RecentReadings {
    /// Create an empty ring holding at most `max_recent` readings.
    #[must_use]
    pub fn new(max_recent: usize) -> Self {
        Self {
            readings: VecDeque::with_capacity(max_recent),
            max_recent,
        }
    }

    /// Add a reading, evicting the oldest once full.
    pub fn push(&mut self, sample: &Sample) {
        if self.max_recent == 0 {
            return;
        }
        if self.readings.len() == self.max_recent {
            self.readings.pop_front();
        }
        self.readings.push_back(RecentReading::from(sample));
    }

    /// Drop every reading.
    pub fn clear(&mut self) {
        self.readings.clear();
    }

    /// Copy of the readings, oldest first.
    #[must_use]
    pub fn to_vec(&self) -> Vec<RecentReading> {
        self.readings.iter().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

impl Default for RecentReadings {
    fn default() -> Self {
        Self::new(RECENT_CAPACITY)
    }
}
