//! Bulk transfer protocol: moves one file over one dedicated connection.
//!
//! Both ends must run with the same [`TransferConfig`]. Stream layout:
//!
//! ```text
//! size-first:   [total u64] then chunks until `total` bytes have moved
//! sentinel:     chunks, then an empty chunk as end marker
//!
//! chunk:        [seq u32]? [len u32] [len bytes]
//!               seq only when acknowledged; the receiver echoes it back
//! ```
//!
//! Size-first without acknowledgement is the one exception: the payload
//! follows the size header as raw bytes with no chunk headers.

pub mod receive;
pub mod send;

pub use receive::BulkReceiver;
pub use send::BulkSender;

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parley_core::config::{Negotiation, TransferSettings};

use crate::repo::RepoError;

/// Progress is logged at debug level every this many chunks.
pub(crate) const PROGRESS_LOG_EVERY: u64 = 64;

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub negotiation: Negotiation,
    pub acknowledged: bool,
    pub chunk_size: usize,
    /// Transmissions per chunk before giving up.
    pub max_retries: u32,
    pub ack_timeout: Duration,
    pub size_guard: Duration,
    /// Longest a single read or write on the connection may stall.
    /// Zero disables the limit.
    pub io_timeout: Duration,
}

impl TransferConfig {
    /// Whether chunks carry a header.
    pub(crate) fn framed(&self) -> bool {
        self.acknowledged || self.negotiation == Negotiation::Sentinel
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self::from(&TransferSettings::default())
    }
}

impl From<&TransferSettings> for TransferConfig {
    fn from(s: &TransferSettings) -> Self {
        Self {
            negotiation: s.negotiation,
            acknowledged: s.acknowledged,
            chunk_size: s.chunk_size.max(1),
            max_retries: s.max_retries.max(1),
            ack_timeout: s.ack_timeout(),
            size_guard: s.size_guard(),
            io_timeout: s.io_timeout(),
        }
    }
}

/// Run one connection operation under `limit`. The inner result is the
/// operation's own outcome.
pub(crate) async fn guarded<T>(
    limit: Duration,
    op: impl Future<Output = io::Result<T>>,
) -> Result<io::Result<T>, TransferError> {
    if limit.is_zero() {
        return Ok(op.await);
    }
    tokio::time::timeout(limit, op)
        .await
        .map_err(|_| TransferError::Stalled { idle: limit })
}

// ── Progress ──────────────────────────────────────────────────────────────────

const TOTAL_UNKNOWN: u64 = u64::MAX;

/// Shared view of one session's progress.
#[derive(Debug, Clone)]
pub struct Progress {
    inner: Arc<Counters>,
}

#[derive(Debug)]
struct Counters {
    transferred: AtomicU64,
    total: AtomicU64,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            inner: Arc::new(Counters {
                transferred: AtomicU64::new(0),
                total: AtomicU64::new(TOTAL_UNKNOWN),
            }),
        }
    }
}

impl Progress {
    pub fn transferred(&self) -> u64 {
        self.inner.transferred.load(Ordering::Relaxed)
    }

    /// `None` until the total is known (never, on a sentinel receiver).
    pub fn total(&self) -> Option<u64> {
        match self.inner.total.load(Ordering::Relaxed) {
            TOTAL_UNKNOWN => None,
            t => Some(t),
        }
    }

    /// Completed fraction in `0.0..=1.0`, when the total is known.
    pub fn fraction(&self) -> Option<f64> {
        self.total().map(|total| match total {
            0 => 1.0,
            t => self.transferred() as f64 / t as f64,
        })
    }

    pub(crate) fn set_total(&self, total: u64) {
        self.inner.total.store(total, Ordering::Relaxed);
    }

    pub(crate) fn add(&self, n: u64) {
        self.inner.transferred.fetch_add(n, Ordering::Relaxed);
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream ended after {received} of {expected} bytes")]
    ShortRead { expected: u64, received: u64 },

    #[error("stream ended after {received} bytes without an end marker")]
    MissingEndMarker { received: u64 },

    #[error("chunk {seq} was not acknowledged")]
    RetriesExhausted { seq: u32 },

    #[error("out of order: expected sequence {expected}, got {got}")]
    OutOfOrder { expected: u32, got: u32 },

    #[error("peer made no progress for {idle:?}")]
    Stalled { idle: Duration },

    #[error("chunk of {len} bytes exceeds limit of {max}")]
    ChunkTooLarge { len: usize, max: usize },

    #[error(transparent)]
    Repo(#[from] RepoError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn config(negotiation: Negotiation, acknowledged: bool, chunk_size: usize) -> TransferConfig {
        TransferConfig {
            negotiation,
            acknowledged,
            chunk_size,
            max_retries: 3,
            ack_timeout: Duration::from_millis(500),
            size_guard: Duration::ZERO,
            io_timeout: Duration::from_secs(5),
        }
    }

    fn pattern(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i * 31 % 251) as u8).collect()
    }

    async fn transfer(config: TransferConfig, data: &[u8]) -> (u64, u64, Vec<u8>) {
        let (a, b) = duplex(4096);
        let sender = BulkSender::new(a, config.clone());
        let receiver = BulkReceiver::new(b, config);
        let progress = receiver.progress();

        let mut sink = Vec::new();
        let (sent, received) = tokio::join!(
            sender.send_from(data, data.len() as u64),
            receiver.receive_into(&mut sink),
        );
        assert_eq!(received.unwrap(), data.len() as u64);
        (sent.unwrap(), progress.transferred(), sink)
    }

    #[tokio::test]
    async fn every_mode_moves_every_size_intact() {
        const C: usize = 256;
        let sizes = [0, 1, C - 1, C, C + 1, 10 * C + 7];
        let modes = [
            (Negotiation::SizeFirst, false),
            (Negotiation::SizeFirst, true),
            (Negotiation::Sentinel, false),
            (Negotiation::Sentinel, true),
        ];

        for (negotiation, acknowledged) in modes {
            for n in sizes {
                let data = pattern(n);
                let (sent, transferred, sink) =
                    transfer(config(negotiation, acknowledged, C), &data).await;
                assert_eq!(sent, n as u64, "{negotiation:?}/{acknowledged} n={n}");
                assert_eq!(transferred, n as u64, "{negotiation:?}/{acknowledged} n={n}");
                assert!(sink == data, "{negotiation:?}/{acknowledged} n={n}: content differs");
            }
        }
    }

    #[test]
    fn progress_fraction() {
        let p = Progress::default();
        assert_eq!(p.total(), None);
        assert_eq!(p.fraction(), None);
        p.set_total(200);
        p.add(50);
        assert_eq!(p.fraction(), Some(0.25));
        p.set_total(0);
        assert_eq!(p.fraction(), Some(1.0));
    }

    #[test]
    fn config_from_settings_clamps_zeroes() {
        let settings = TransferSettings {
            chunk_size: 0,
            max_retries: 0,
            ..TransferSettings::default()
        };
        let config = TransferConfig::from(&settings);
        assert_eq!(config.chunk_size, 1);
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.io_timeout, Duration::from_secs(30));
        assert!(!config.framed());
    }
}
