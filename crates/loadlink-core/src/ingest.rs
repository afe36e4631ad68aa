//! Producer batch ingestion.
//!
//! Every sample updates the latest-reading cache. While a session is
//! recording, samples are also appended to the session log and the batch
//! is relayed verbatim to every consumer except the sender. The cache is
//! always updated before the relay, so a consumer holding a relayed batch
//! can rely on the cache reflecting it.

use loadlink_transport::ConnectionId;
use std::sync::Arc;
use tracing::trace;

use crate::cache::LatestReadingCache;
use crate::relay::RelayRouter;
use crate::sample::Batch;
use crate::session::SessionController;

/// What happened to one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Samples applied to the cache.
    pub accepted: usize,
    /// Rows appended to the session log.
    pub persisted: u64,
    /// Consumers the batch was relayed to.
    pub relayed_to: usize,
    /// Consumers pruned while relaying.
    pub pruned: usize,
    /// Whether a session was recording when the batch was applied.
    pub active: bool,
}

/// Applies producer batches to the cache, session log and relay.
pub struct IngestPipeline {
    cache: Arc<LatestReadingCache>,
    session: Arc<SessionController>,
    relay: RelayRouter,
}

impl IngestPipeline {
    /// Create a pipeline.
    #[must_use]
    pub fn new(
        cache: Arc<LatestReadingCache>,
        session: Arc<SessionController>,
        relay: RelayRouter,
    ) -> Self {
        Self {
            cache,
            session,
            relay,
        }
    }

    /// Process one batch from `source`.
    ///
    /// `source` is `None` for batches that did not arrive on a connection.
    pub fn on_batch(&self, batch: &Batch, source: Option<&ConnectionId>) -> IngestOutcome {
        let recorded = self
            .session
            .record_batch(batch.samples(), |sample| self.cache.update(sample));

        let Some(persisted) = recorded else {
            trace!(samples = batch.len(), "Batch cached, no session");
            return IngestOutcome {
                accepted: batch.len(),
                ..IngestOutcome::default()
            };
        };

        let report = self.relay.broadcast(batch.payload(), source);
        trace!(
            samples = batch.len(),
            persisted,
            relayed_to = report.delivered,
            "Batch recorded"
        );

        IngestOutcome {
            accepted: batch.len(),
            persisted,
            relayed_to: report.delivered,
            pruned: report.pruned,
            active: true,
        }
    }
}
