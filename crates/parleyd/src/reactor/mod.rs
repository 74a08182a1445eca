//! Connection reactor.
//!
//! One accept loop owns both listeners. Every accepted socket becomes a
//! task on tokio's readiness reactor: control connections stay there for
//! their whole life, bulk connections only until their File request has
//! been read, after which the socket is parked in the bulk registry for
//! the router to hand to the worker pool.

pub mod bulk;
pub mod control;

use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use parley_core::config::ReactorConfig;
use parley_core::Message;
use parley_services::{BulkRegistry, ControlRegistry, MessageQueue};

/// Pause after a failed accept (e.g. fd exhaustion) before retrying.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// State every connection task needs.
#[derive(Clone)]
pub struct ConnContext {
    pub control: ControlRegistry,
    pub bulk: BulkRegistry,
    pub ingress: MessageQueue<Message>,
    pub config: ReactorConfig,
    /// Bulk sockets are tuned for this transfer chunk size.
    pub chunk_size: usize,
}

impl ConnContext {
    /// Hand a preprocessed message to the router.
    pub(crate) fn forward(&self, msg: Message) {
        if let Some(dropped) = self.ingress.push(msg) {
            tracing::warn!(
                kind = ?dropped.kind(),
                sender = dropped.sender(),
                "ingress queue full, message dropped"
            );
        }
    }
}

pub struct Reactor {
    control_listener: TcpListener,
    bulk_listener: TcpListener,
    ctx: ConnContext,
    shutdown_tx: broadcast::Sender<()>,
    shutdown: broadcast::Receiver<()>,
}

impl Reactor {
    pub fn new(
        control_listener: TcpListener,
        bulk_listener: TcpListener,
        ctx: ConnContext,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        let shutdown = shutdown_tx.subscribe();
        Self {
            control_listener,
            bulk_listener,
            ctx,
            shutdown_tx,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("reactor shutting down");
                    return Ok(());
                }

                accepted = self.control_listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "control connection accepted");
                        tokio::spawn(control::serve(
                            stream,
                            self.ctx.clone(),
                            self.shutdown_tx.subscribe(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "control accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },

                accepted = self.bulk_listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "bulk connection accepted");
                        tokio::spawn(bulk::serve(
                            stream,
                            self.ctx.clone(),
                            self.shutdown_tx.subscribe(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "bulk accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
    }
}
