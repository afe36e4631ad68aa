//! Best-effort fan-out to consumers.
//!
//! A frame is encoded once and pushed to every target. A target whose send
//! fails with a disconnect is pruned from the registry and never tried
//! again; a target that is merely backed up misses this frame only.

use bytes::Bytes;
use loadlink_protocol::Role;
use loadlink_transport::ConnectionId;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::registry::ConnectionRegistry;

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Connections the frame was handed to.
    pub delivered: usize,
    /// Connections removed because the send failed.
    pub pruned: usize,
    /// Connections that skipped the frame because their queue was full.
    pub skipped: usize,
}

/// Send `frame` to every connection holding `role`, except `exclude`.
pub(crate) fn deliver(
    registry: &ConnectionRegistry,
    role: Role,
    frame: &Bytes,
    exclude: Option<&ConnectionId>,
) -> DeliveryReport {
    let mut report = DeliveryReport::default();

    registry.for_each(role, |conn| {
        if exclude == Some(conn.id()) {
            return;
        }

        match conn.send(frame.clone()) {
            Ok(()) => {
                trace!(connection = %conn.id(), "Delivered frame");
                report.delivered += 1;
            }
            Err(e) if e.is_disconnect() => {
                warn!(connection = %conn.id(), role = %role, error = %e, "Pruning connection");
                registry.deregister(conn.id());
                conn.close();
                report.pruned += 1;
            }
            Err(e) => {
                debug!(connection = %conn.id(), error = %e, "Skipped frame");
                report.skipped += 1;
            }
        }
    });

    report
}

/// Fans producer batches out to consumers.
pub struct RelayRouter {
    registry: Arc<ConnectionRegistry>,
}

impl RelayRouter {
    /// Create a router over a registry.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Send `payload` to every consumer except `exclude`.
    ///
    /// Never aborts early: a failure on one consumer does not affect the rest.
    pub fn broadcast(&self, payload: &Bytes, exclude: Option<&ConnectionId>) -> DeliveryReport {
        deliver(&self.registry, Role::Consumer, payload, exclude)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadlink_transport::{Connection, SyntheticConnection};

    fn setup() -> (Arc<ConnectionRegistry>, RelayRouter) {
        let registry = Arc::new(ConnectionRegistry::new());
        let relay = RelayRouter::new(Arc::clone(&registry));
        (registry, relay)
    }

    fn add(registry: &ConnectionRegistry, id: &str, role: Role) -> Arc<SyntheticConnection> {
        let conn = Arc::new(SyntheticConnection::with_id(id));
        registry.register(Arc::clone(&conn) as Arc<dyn Connection>, role);
        conn
    }

    #[test]
    fn test_broadcast_reaches_consumers_only() {
        let (registry, relay) = setup();
        let c1 = add(&registry, "c1", Role::Consumer);
        let c2 = add(&registry, "c2", Role::Consumer);
        let p = add(&registry, "p", Role::Producer);

        let report = relay.broadcast(&Bytes::from_static(b"{\"samples\":[]}"), None);

        assert_eq!(report.delivered, 2);
        assert_eq!(c1.sent_count(), 1);
        assert_eq!(c2.sent_count(), 1);
        assert_eq!(p.sent_count(), 0);
    }

    #[test]
    fn test_broadcast_excludes_source() {
        let (registry, relay) = setup();
        let c1 = add(&registry, "c1", Role::Consumer);
        let c2 = add(&registry, "c2", Role::Consumer);

        relay.broadcast(&Bytes::from_static(b"{}"), Some(c1.id()));

        assert_eq!(c1.sent_count(), 0);
        assert_eq!(c2.sent_count(), 1);
    }

    #[test]
    fn test_failed_consumer_is_pruned_once() {
        let (registry, relay) = setup();
        let bad = add(&registry, "bad", Role::Consumer);
        let good = add(&registry, "good", Role::Consumer);
        bad.fail_sends(true);

        let first = relay.broadcast(&Bytes::from_static(b"{}"), None);
        assert_eq!(first.pruned, 1);
        assert_eq!(first.delivered, 1);
        assert_eq!(registry.count(Role::Consumer), 1);
        assert!(!bad.is_open());

        let second = relay.broadcast(&Bytes::from_static(b"{}"), None);
        assert_eq!(second.pruned, 0);
        assert_eq!(second.delivered, 1);
        assert_eq!(good.sent_count(), 2);
    }
}
