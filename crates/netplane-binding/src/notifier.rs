//! Port change notifications for agents.

use netplane_core::uuid::PortId;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::models::PortContext;

/// Fire-and-forget sink for port events.
///
/// Called only after the transaction that produced the change has closed.
#[cfg_attr(test, mockall::automock)]
pub trait PortNotifier: Send + Sync {
    /// A port changed.
    fn port_update(&self, context: &PortContext);

    /// A port was deleted.
    fn port_delete(&self, port_id: PortId);
}

/// Event emitted by [`ChannelNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    /// A port changed.
    Updated(Box<PortContext>),
    /// A port was deleted.
    Deleted(PortId),
}

/// Notifier forwarding events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: UnboundedSender<PortEvent>,
}

impl ChannelNotifier {
    /// Create a notifier and the receiving end of its channel.
    #[must_use]
    pub fn new() -> (Self, UnboundedReceiver<PortEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn send(&self, event: PortEvent) {
        if self.sender.send(event).is_err() {
            debug!("Dropping port event, no receiver");
        }
    }
}

impl PortNotifier for ChannelNotifier {
    fn port_update(&self, context: &PortContext) {
        self.send(PortEvent::Updated(Box::new(context.clone())));
    }

    fn port_delete(&self, port_id: PortId) {
        self.send(PortEvent::Deleted(port_id));
    }
}
