//! Periodic liveness sweep over both registries.
//!
//! Each tick evicts the users that stayed silent for a whole interval and
//! flags the rest offline until they show activity again.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};

use parley_core::UserId;
use parley_services::{BulkRegistry, ControlRegistry};

pub struct LivenessSweeper {
    control: ControlRegistry,
    bulk: BulkRegistry,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl LivenessSweeper {
    pub fn new(
        control: ControlRegistry,
        bulk: BulkRegistry,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            control,
            bulk,
            interval,
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("liveness sweeper shutting down");
                    return Ok(());
                }

                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }
    }

    /// One sweep. Returns the evicted control and bulk ids.
    pub fn sweep(&self) -> (Vec<UserId>, Vec<UserId>) {
        let control = self.control.scan_and_close_inactive();
        let bulk = self.bulk.scan_and_close_inactive();

        if !control.is_empty() {
            tracing::info!(evicted = ?control, remaining = self.control.len(), "evicted inactive users");
        }
        if !bulk.is_empty() {
            tracing::info!(evicted = ?bulk, "evicted unclaimed bulk connections");
        }
        tracing::debug!(
            control = self.control.len(),
            bulk = self.bulk.len(),
            "liveness sweep"
        );
        (control, bulk)
    }
}
