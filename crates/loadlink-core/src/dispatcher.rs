//! Operator command delivery to producers.

use loadlink_protocol::{codec, Role, ServerMessage};
use std::sync::Arc;
use tracing::{error, info};

use crate::registry::ConnectionRegistry;
use crate::relay::{deliver, DeliveryReport};

/// Pushes `{"command": ...}` frames to every producer.
///
/// Command strings are passed through verbatim. Producers whose send fails
/// are pruned the same way the relay prunes consumers.
pub struct CommandDispatcher {
    registry: Arc<ConnectionRegistry>,
}

impl CommandDispatcher {
    /// Create a dispatcher over a registry.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Send `command` to every producer.
    pub fn send(&self, command: &str) -> DeliveryReport {
        let frame = match codec::encode(&ServerMessage::command(command)) {
            Ok(frame) => frame,
            Err(e) => {
                error!(command = %command, error = %e, "Failed to encode command");
                return DeliveryReport::default();
            }
        };

        let report = deliver(&self.registry, Role::Producer, &frame, None);
        info!(
            command = %command,
            delivered = report.delivered,
            pruned = report.pruned,
            "Dispatched command"
        );
        report
    }

    /// Number of producers currently registered.
    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.registry.count(Role::Producer)
    }
}
