//! Receiving side of a bulk transfer.

use std::io;

use parley_core::config::Negotiation;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{guarded, Progress, TransferConfig, TransferError, PROGRESS_LOG_EVERY};
use crate::repo::Repository;

pub struct BulkReceiver<S> {
    stream: S,
    config: TransferConfig,
    progress: Progress,
}

impl<S> BulkReceiver<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, config: TransferConfig) -> Self {
        Self {
            stream,
            config,
            progress: Progress::default(),
        }
    }

    pub fn progress(&self) -> Progress {
        self.progress.clone()
    }

    /// Store the incoming stream as `filename` in the repository. A
    /// non-zero `offset` resumes an earlier partial upload.
    pub async fn receive_file(
        self,
        repo: &Repository,
        filename: &str,
        offset: u64,
    ) -> Result<u64, TransferError> {
        let file = repo.open_write(filename, offset).await?;
        self.receive_into(file).await
    }

    /// Copy the incoming payload into `sink`, then close the connection.
    /// Returns the number of payload bytes received.
    pub async fn receive_into<W>(mut self, mut sink: W) -> Result<u64, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let result = self.run(&mut sink).await;
        let flushed = sink.flush().await;
        let idle = self.config.io_timeout;
        if let Err(e) = guarded(idle, self.stream.shutdown())
            .await
            .and_then(|r| r.map_err(TransferError::from))
        {
            tracing::trace!(error = %e, "bulk receiver shutdown");
        }
        let received = result?;
        flushed?;
        Ok(received)
    }

    async fn run<W>(&mut self, sink: &mut W) -> Result<u64, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let idle = self.config.io_timeout;
        let total = match self.config.negotiation {
            Negotiation::SizeFirst => {
                let total = guarded(idle, self.stream.read_u64())
                    .await?
                    .map_err(|e| eof_as(e, || TransferError::ShortRead { expected: 0, received: 0 }))?;
                self.progress.set_total(total);
                Some(total)
            }
            Negotiation::Sentinel => None,
        };

        match total {
            Some(total) if !self.config.framed() => self.run_raw(sink, total).await,
            _ => self.run_framed(sink, total).await,
        }
    }

    /// Size-first without chunk headers.
    async fn run_raw<W>(&mut self, sink: &mut W, total: u64) -> Result<u64, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let idle = self.config.io_timeout;
        let mut buf = vec![0u8; self.config.chunk_size];
        let mut received = 0u64;
        let mut reads = 0u64;

        while received < total {
            let want = (total - received).min(buf.len() as u64) as usize;
            let n = guarded(idle, self.stream.read(&mut buf[..want])).await??;
            if n == 0 {
                return Err(TransferError::ShortRead {
                    expected: total,
                    received,
                });
            }
            sink.write_all(&buf[..n]).await?;
            received += n as u64;
            self.progress.add(n as u64);

            reads += 1;
            if reads % PROGRESS_LOG_EVERY == 0 {
                tracing::debug!(bytes = received, total, "bulk receive progress");
            }
        }
        Ok(received)
    }

    async fn run_framed<W>(&mut self, sink: &mut W, total: Option<u64>) -> Result<u64, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let acknowledged = self.config.acknowledged;
        let chunk_size = self.config.chunk_size;
        let idle = self.config.io_timeout;
        let mut buf = vec![0u8; chunk_size];
        let mut received = 0u64;
        let mut expected_seq = 0u32;

        let truncated = |received: u64| match total {
            Some(total) => TransferError::ShortRead { expected: total, received },
            None => TransferError::MissingEndMarker { received },
        };

        loop {
            if total.map_or(false, |t| received >= t) {
                break;
            }

            let seq = if acknowledged {
                Some(
                    guarded(idle, self.stream.read_u32())
                        .await?
                        .map_err(|e| eof_as(e, || truncated(received)))?,
                )
            } else {
                None
            };
            let len = guarded(idle, self.stream.read_u32())
                .await?
                .map_err(|e| eof_as(e, || truncated(received)))? as usize;
            if len > chunk_size {
                return Err(TransferError::ChunkTooLarge { len, max: chunk_size });
            }
            guarded(idle, self.stream.read_exact(&mut buf[..len]))
                .await?
                .map_err(|e| eof_as(e, || truncated(received)))?;

            if let Some(seq) = seq {
                if seq < expected_seq {
                    // Retransmission of a chunk already stored.
                    tracing::trace!(seq, expected = expected_seq, "duplicate chunk");
                    guarded(idle, self.stream.write_u32(seq)).await??;
                    continue;
                }
                if seq > expected_seq {
                    return Err(TransferError::OutOfOrder {
                        expected: expected_seq,
                        got: seq,
                    });
                }
            }

            if len == 0 && total.is_none() {
                if let Some(seq) = seq {
                    guarded(idle, self.stream.write_u32(seq)).await??;
                }
                break;
            }

            if let Some(total) = total {
                let left = (total - received) as usize;
                if len > left {
                    return Err(TransferError::ChunkTooLarge { len, max: left });
                }
            }

            sink.write_all(&buf[..len]).await?;
            received += len as u64;
            self.progress.add(len as u64);
            if let Some(seq) = seq {
                guarded(idle, self.stream.write_u32(seq)).await??;
            }
            expected_seq = expected_seq.wrapping_add(1);

            if u64::from(expected_seq) % PROGRESS_LOG_EVERY == 0 {
                tracing::debug!(bytes = received, chunks = expected_seq, "bulk receive progress");
            }
        }
        Ok(received)
    }
}

fn eof_as(e: io::Error, short: impl FnOnce() -> TransferError) -> TransferError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        short()
    } else {
        TransferError::Io(e)
    }
}
