//! Transfer tracking: which bulk sessions are in flight and how far along.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use parley_core::{FileAction, UserId};
use parley_services::Progress;

pub type TransferId = u64;

struct ActiveTransfer {
    uid: UserId,
    filename: String,
    action: FileAction,
    progress: Progress,
    started_at: Instant,
}

/// Point-in-time view of one transfer.
#[derive(Debug, Clone)]
pub struct TransferSnapshot {
    pub id: TransferId,
    pub uid: UserId,
    pub filename: String,
    pub action: FileAction,
    pub transferred: u64,
    pub total: Option<u64>,
    pub elapsed: Duration,
}

#[derive(Clone, Default)]
pub struct TransferTracker {
    active: Arc<DashMap<TransferId, ActiveTransfer>>,
    next_id: Arc<AtomicU64>,
    completed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl TransferTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transfer that is about to start. The entry leaves the
    /// active set when the returned guard is finished or dropped; a guard
    /// dropped unfinished counts as a failure.
    pub fn begin(
        &self,
        uid: UserId,
        filename: &str,
        action: FileAction,
        progress: Progress,
    ) -> TransferGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.active.insert(
            id,
            ActiveTransfer {
                uid,
                filename: filename.to_string(),
                action,
                progress,
                started_at: Instant::now(),
            },
        );
        TransferGuard {
            tracker: self.clone(),
            id,
            finished: false,
        }
    }

    fn finish(&self, id: TransferId, ok: bool) -> Option<Duration> {
        let (_, entry) = self.active.remove(&id)?;
        let counter = if ok { &self.completed } else { &self.failed };
        counter.fetch_add(1, Ordering::Relaxed);
        Some(entry.started_at.elapsed())
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Vec<TransferSnapshot> {
        let mut out: Vec<_> = self
            .active
            .iter()
            .map(|e| TransferSnapshot {
                id: *e.key(),
                uid: e.uid,
                filename: e.filename.clone(),
                action: e.action,
                transferred: e.progress.transferred(),
                total: e.progress.total(),
                elapsed: e.started_at.elapsed(),
            })
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    /// Log in-flight transfers. Quiet when nothing is moving.
    pub fn log_stats(&self) {
        if self.active.is_empty() {
            return;
        }
        tracing::info!(
            active = self.active.len(),
            completed = self.completed(),
            failed = self.failed(),
            "transfer tracker stats"
        );
        for t in self.snapshot() {
            tracing::info!(
                uid = t.uid,
                file = %t.filename,
                action = ?t.action,
                bytes = t.transferred,
                total = ?t.total,
                elapsed_ms = t.elapsed.as_millis() as u64,
                "  transfer"
            );
        }
    }
}

/// Keeps one transfer in the active set for as long as it lives.
#[must_use = "dropping the guard ends the transfer as failed"]
pub struct TransferGuard {
    tracker: TransferTracker,
    id: TransferId,
    finished: bool,
}

impl TransferGuard {
    pub fn id(&self) -> TransferId {
        self.id
    }

    /// Record the outcome. Returns how long the transfer ran.
    pub fn finish(mut self, ok: bool) -> Duration {
        self.finished = true;
        self.tracker.finish(self.id, ok).unwrap_or_default()
    }
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        if !self.finished && self.tracker.finish(self.id, false).is_some() {
            tracing::debug!(id = self.id, "transfer abandoned");
        }
    }
}
