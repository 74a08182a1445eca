//! Egress writer: drains the egress queue onto control connections.

use std::time::Duration;

use tokio::sync::broadcast;

use parley_core::Message;
use parley_services::{ControlRegistry, MessageQueue, Transport};

pub struct EgressWriter {
    control: ControlRegistry,
    egress: MessageQueue<Message>,
    write_timeout: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl EgressWriter {
    pub fn new(
        control: ControlRegistry,
        egress: MessageQueue<Message>,
        write_timeout: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            control,
            egress,
            write_timeout,
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!(pending = self.egress.len(), "egress writer shutting down");
                    return Ok(());
                }

                msg = self.egress.pop() => {
                    self.deliver(msg).await;
                }
            }
        }
    }

    /// Write one message to its receiver. Returns whether it was sent.
    pub async fn deliver(&self, msg: Message) -> bool {
        let Some(uid) = msg.receiver() else {
            tracing::debug!(kind = ?msg.kind(), "egress message has no receiver");
            return false;
        };

        let handle = match self.control.get_handle(uid) {
            Ok(h) => h,
            Err(e) => {
                tracing::debug!(uid, error = %e, "egress receiver unavailable");
                return false;
            }
        };

        let frame = match msg.encode() {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(uid, error = %e, "failed to encode outbound message");
                return false;
            }
        };

        match handle.send_timeout(&frame, self.write_timeout).await {
            Ok(()) => {
                tracing::trace!(uid, bytes = frame.len(), "delivered");
                true
            }
            Err(e) => {
                tracing::warn!(uid, conn_id = handle.conn_id(), error = %e, "delivery failed, marking offline");
                self.control
                    .set_online_if_current(uid, handle.conn_id(), false);
                false
            }
        }
    }
}
