//! Parley integration test harness.
//!
//! Every test starts its own server in-process on loopback with
//! OS-assigned ports and a scratch repository, then talks to it over real
//! TCP connections the way a client would.
//!
//!   cargo test --test integration

mod fault;
mod files;
mod messaging;
mod sessions;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use parley_core::config::{Negotiation, ParleyConfig};
use parley_core::wire;
use parley_core::{Identity, IdentityAction, Message, Text, UserId};
use parley_services::{ControlRegistry, TransferConfig};
use parleyd::Server;

// ── Harness ───────────────────────────────────────────────────────────────────

/// How long a test waits for something that should happen.
pub const WAIT: Duration = Duration::from_secs(5);
/// How long a test waits to be sure something does not happen.
pub const QUIET: Duration = Duration::from_millis(300);

static NEXT_REPO: AtomicUsize = AtomicUsize::new(0);

/// Knobs tests vary; everything else uses defaults.
pub struct Options {
    pub sweep: Duration,
    pub negotiation: Negotiation,
    pub acknowledged: bool,
    pub chunk_size: usize,
    pub max_decode_errors: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            sweep: Duration::from_secs(60),
            negotiation: Negotiation::SizeFirst,
            acknowledged: false,
            chunk_size: 4096,
            max_decode_errors: 8,
        }
    }
}

/// A running in-process server. Shut down and cleaned up on drop.
pub struct TestServer {
    pub control_addr: SocketAddr,
    pub bulk_addr: SocketAddr,
    pub control: ControlRegistry,
    pub repo: PathBuf,
    pub transfer: TransferConfig,
    shutdown: broadcast::Sender<()>,
    task: Option<JoinHandle<Result<()>>>,
}

impl TestServer {
    pub async fn start() -> Result<Self> {
        Self::start_with(Options::default()).await
    }

    pub async fn start_with(opts: Options) -> Result<Self> {
        let repo = std::env::temp_dir().join(format!(
            "parley-it-{}-{}",
            std::process::id(),
            NEXT_REPO.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = std::fs::remove_dir_all(&repo);

        let mut config = ParleyConfig::default();
        config.network.bind_addr = "127.0.0.1".to_string();
        config.network.control_port = 0;
        config.network.bulk_port = 0;
        config.registry.sweep_interval_ms = opts.sweep.as_millis() as u64;
        config.reactor.max_consecutive_decode_errors = opts.max_decode_errors;
        config.reactor.bulk_handshake_timeout_ms = 2_000;
        config.pool.min_workers = 1;
        config.pool.max_workers = 4;
        config.transfer.repo_path = repo.clone();
        config.transfer.negotiation = opts.negotiation;
        config.transfer.acknowledged = opts.acknowledged;
        config.transfer.chunk_size = opts.chunk_size;
        config.transfer.size_guard_ms = 10;
        let transfer = TransferConfig::from(&config.transfer);

        let server = Server::bind(config).await?;
        let (shutdown, _) = broadcast::channel(1);
        let control_addr = server.control_addr();
        let bulk_addr = server.bulk_addr();
        let control = server.control_registry();
        let task = tokio::spawn(server.run(shutdown.clone()));

        Ok(Self {
            control_addr,
            bulk_addr,
            control,
            repo,
            transfer,
            shutdown,
            task: Some(task),
        })
    }

    /// Connect a control client and log in as `uid`, waiting until the
    /// server has registered it.
    pub async fn login(&self, uid: UserId) -> Result<Client> {
        let mut client = Client::connect(self.control_addr).await?;
        client.identity(uid, IdentityAction::Login).await?;
        self.wait_until(|| self.control.is_online(uid))
            .await
            .with_context(|| format!("uid {uid} never came online"))?;
        Ok(client)
    }

    pub async fn wait_until(&self, cond: impl Fn() -> bool) -> Result<()> {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !cond() {
            if tokio::time::Instant::now() >= deadline {
                bail!("condition not met within {WAIT:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    /// Stop the server and wait for it to wind down.
    pub async fn stop(mut self) -> Result<()> {
        let _ = self.shutdown.send(());
        if let Some(task) = self.task.take() {
            tokio::time::timeout(WAIT, task)
                .await
                .context("server did not stop")???;
        }
        Ok(())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        let _ = std::fs::remove_dir_all(&self.repo);
    }
}

/// A control-channel client.
pub struct Client {
    stream: TcpStream,
    buf: BytesMut,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.context("connect control")?;
        Ok(Self {
            stream,
            buf: BytesMut::with_capacity(4096),
        })
    }

    pub async fn send(&mut self, msg: impl Into<Message>) -> Result<()> {
        let frame = msg.into().encode()?;
        self.send_raw(&frame).await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    pub async fn identity(&mut self, uid: UserId, action: IdentityAction) -> Result<()> {
        self.send(Identity::new(uid, action)).await
    }

    /// Next message from the server, or `None` if nothing arrives within
    /// `limit`. A closed connection is an error.
    pub async fn recv_within(&mut self, limit: Duration) -> Result<Option<Message>> {
        match tokio::time::timeout(limit, self.recv()).await {
            Ok(msg) => msg.map(Some),
            Err(_) => Ok(None),
        }
    }

    pub async fn recv(&mut self) -> Result<Message> {
        loop {
            if let Some(packet) = wire::next_frame(&mut self.buf)? {
                return Ok(Message::from_packet(&packet)?);
            }
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                bail!("server closed the connection");
            }
        }
    }

    /// Wait for a text message.
    pub async fn expect_text(&mut self) -> Result<Text> {
        match self.recv_within(WAIT).await? {
            Some(Message::Text(text)) => Ok(text),
            Some(other) => bail!("expected a text, got {other:?}"),
            None => bail!("no text within {WAIT:?}"),
        }
    }

    /// Whether the server closes this connection within `limit`.
    pub async fn closed_within(&mut self, limit: Duration) -> bool {
        let read = async {
            loop {
                match self.stream.read_buf(&mut self.buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => self.buf.clear(),
                }
            }
        };
        tokio::time::timeout(limit, read).await.is_ok()
    }
}

/// Open a bulk connection and send `request` as its opening frame.
pub async fn open_bulk(server: &TestServer, request: parley_core::File) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(server.bulk_addr)
        .await
        .context("connect bulk")?;
    stream.write_all(&Message::File(request).encode()?).await?;
    Ok(stream)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn server_binds_and_stops() {
    let server = TestServer::start().await.unwrap();
    assert_ne!(server.control_addr.port(), 0);
    assert_ne!(server.bulk_addr.port(), 0);
    assert_ne!(server.control_addr.port(), server.bulk_addr.port());
    assert!(server.repo.is_dir());
    server.stop().await.unwrap();
}
