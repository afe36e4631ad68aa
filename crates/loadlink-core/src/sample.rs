//! Sample and batch types.

use bytes::Bytes;
use chrono::Utc;
use loadlink_protocol::WireSample;
use serde::Serialize;

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// One sensor reading as accepted by the server.
///
/// `device_time` is the producer's own clock and is never recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Sample {
    /// Left sensor value.
    pub left: i64,
    /// Right sensor value.
    pub right: i64,
    /// Producer clock in milliseconds.
    pub device_time: i64,
    /// Server capture time in milliseconds since the Unix epoch.
    pub server_time: i64,
}

impl Sample {
    /// Create a sample from its wire form and a capture time.
    #[must_use]
    pub fn from_wire(wire: WireSample, server_time: i64) -> Self {
        Self {
            left: wire.l,
            right: wire.r,
            device_time: wire.t,
            server_time,
        }
    }
}

/// An ordered group of samples that arrived in one message.
///
/// The original payload is kept so the batch can be relayed verbatim.
#[derive(Debug, Clone)]
pub struct Batch {
    samples: Vec<Sample>,
    payload: Bytes,
}

impl Batch {
    /// Create a batch, stamping every sample with the current server time.
    #[must_use]
    pub fn new(samples: &[WireSample], payload: impl Into<Bytes>) -> Self {
        let server_time = now_millis();
        Self {
            samples: samples
                .iter()
                .map(|wire| Sample::from_wire(*wire, server_time))
                .collect(),
            payload: payload.into(),
        }
    }

    /// The samples, in arrival order.
    #[must_use]
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// The payload as received from the producer.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Number of samples in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Check if the batch has no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
