//! Sending side of a bulk transfer.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use parley_core::config::Negotiation;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use super::{guarded, Progress, TransferConfig, TransferError, PROGRESS_LOG_EVERY};
use crate::repo::Repository;

pub struct BulkSender<S> {
    stream: S,
    config: TransferConfig,
    progress: Progress,
    /// Acknowledgement bytes read so far; survives a timed-out wait.
    acks: BytesMut,
}

enum Ack {
    Received,
    TimedOut,
}

impl<S> BulkSender<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, config: TransferConfig) -> Self {
        Self {
            stream,
            config,
            progress: Progress::default(),
            acks: BytesMut::with_capacity(64),
        }
    }

    pub fn progress(&self) -> Progress {
        self.progress.clone()
    }

    /// Stream `filename` from the repository, starting at `offset`.
    pub async fn send_file(
        self,
        repo: &Repository,
        filename: &str,
        offset: u64,
    ) -> Result<u64, TransferError> {
        let (file, remaining) = repo.open_read(filename, offset).await?;
        self.send_from(file, remaining).await
    }

    /// Send `total` bytes from `source`, then close the connection.
    /// Returns the number of payload bytes sent.
    pub async fn send_from<R>(mut self, mut source: R, total: u64) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let result = self.run(&mut source, total).await;
        let idle = self.config.io_timeout;
        if let Err(e) = guarded(idle, self.stream.shutdown())
            .await
            .and_then(|r| r.map_err(TransferError::from))
        {
            tracing::trace!(error = %e, "bulk sender shutdown");
        }
        result
    }

    async fn run<R>(&mut self, source: &mut R, total: u64) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let size_first = self.config.negotiation == Negotiation::SizeFirst;
        let idle = self.config.io_timeout;
        self.progress.set_total(total);

        if size_first {
            guarded(idle, self.stream.write_u64(total)).await??;
            guarded(idle, self.stream.flush()).await??;
            // Keep the header out of the first chunk's segment.
            if !self.config.size_guard.is_zero() {
                tokio::time::sleep(self.config.size_guard).await;
            }
        }

        let chunk_size = self.config.chunk_size;
        let mut buf = vec![0u8; chunk_size];
        let mut sent = 0u64;
        let mut seq = 0u32;

        loop {
            let want = if size_first {
                let left = total - sent;
                if left == 0 {
                    break;
                }
                left.min(chunk_size as u64) as usize
            } else {
                chunk_size
            };

            let n = read_full(source, &mut buf[..want]).await?;
            if size_first && n < want {
                return Err(TransferError::ShortRead {
                    expected: total,
                    received: sent + n as u64,
                });
            }
            if n == 0 {
                break;
            }

            self.send_chunk(seq, &buf[..n]).await?;
            sent += n as u64;
            seq = seq.wrapping_add(1);
            self.progress.add(n as u64);

            if u64::from(seq) % PROGRESS_LOG_EVERY == 0 {
                tracing::debug!(bytes = sent, total, chunks = seq, "bulk send progress");
            }
        }

        if !size_first {
            self.send_chunk(seq, &[]).await?;
        }
        guarded(idle, self.stream.flush()).await??;
        Ok(sent)
    }

    async fn send_chunk(&mut self, seq: u32, data: &[u8]) -> Result<(), TransferError> {
        let idle = self.config.io_timeout;
        if !self.config.framed() {
            guarded(idle, self.stream.write_all(data)).await??;
            return Ok(());
        }

        let mut header = BytesMut::with_capacity(8);
        if self.config.acknowledged {
            header.put_u32(seq);
        }
        header.put_u32(data.len() as u32);

        if !self.config.acknowledged {
            guarded(idle, self.stream.write_all(&header)).await??;
            guarded(idle, self.stream.write_all(data)).await??;
            return Ok(());
        }

        for attempt in 1..=self.config.max_retries {
            guarded(idle, self.stream.write_all(&header)).await??;
            guarded(idle, self.stream.write_all(data)).await??;
            guarded(idle, self.stream.flush()).await??;

            match self.await_ack(seq).await? {
                Ack::Received => return Ok(()),
                Ack::TimedOut => {
                    tracing::warn!(
                        seq,
                        attempt,
                        max = self.config.max_retries,
                        "chunk not acknowledged in time"
                    );
                }
            }
        }
        Err(TransferError::RetriesExhausted { seq })
    }

    /// Wait for `seq` to be echoed back. Stale acknowledgements from
    /// earlier retransmissions are skipped.
    async fn await_ack(&mut self, seq: u32) -> Result<Ack, TransferError> {
        let deadline = Instant::now() + self.config.ack_timeout;
        loop {
            while self.acks.len() >= 4 {
                let got = self.acks.get_u32();
                if got == seq {
                    return Ok(Ack::Received);
                }
                if got > seq {
                    return Err(TransferError::OutOfOrder { expected: seq, got });
                }
                tracing::trace!(seq, stale = got, "skipping stale ack");
            }

            match tokio::time::timeout_at(deadline, self.stream.read_buf(&mut self.acks)).await {
                Err(_) => return Ok(Ack::TimedOut),
                Ok(Ok(0)) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }
}

/// Fill `buf` unless the source ends first. Returns bytes read.
async fn read_full<R: AsyncRead + Unpin>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
