//! Notification seam — hands `FailureMessage`s to an external transport.
//!
//! Delivery is fire-and-forget: callers never wait for confirmation and a
//! failed hand-off is logged, not raised.

use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::types::FailureMessage;

/// Something that can page operators about a resource.
pub trait Notifier: Send + Sync {
    fn notify(&self, msg: &FailureMessage);
}

/// Emits alerts as `warn!` events only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, msg: &FailureMessage) {
        warn!(
            alert_uid = %msg.alert_uid,
            resource_id = %msg.resource_id,
            resource_type = %msg.resource_type,
            "failsafe notification"
        );
    }
}

/// Queues alerts on an unbounded channel drained by a delivery task.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<FailureMessage>,
}

impl ChannelNotifier {
    /// Create a notifier and the receiver its messages arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FailureMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, msg: &FailureMessage) {
        if self.tx.send(msg.clone()).is_err() {
            error!(
                alert_uid = %msg.alert_uid,
                "notification channel closed, dropping alert"
            );
        }
    }
}
