//! Server composition: binds the listeners, builds the shared state and
//! runs every long-lived task until shutdown.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use parley_core::config::ParleyConfig;
use parley_services::{
    BulkRegistry, ControlRegistry, MessageQueues, Repository, TransferConfig, WorkerPool,
};

use crate::egress::EgressWriter;
use crate::liveness::LivenessSweeper;
use crate::reactor::{ConnContext, Reactor};
use crate::router::Router;
use crate::tracker::TransferTracker;

const STATS_INTERVAL: Duration = Duration::from_secs(10);

pub struct Server {
    config: ParleyConfig,
    control_listener: TcpListener,
    bulk_listener: TcpListener,
    control_addr: SocketAddr,
    bulk_addr: SocketAddr,
    control: ControlRegistry,
    bulk: BulkRegistry,
    queues: MessageQueues,
    pool: WorkerPool,
    repo: Repository,
    tracker: TransferTracker,
}

impl Server {
    /// Validate `config`, bind both listeners and prepare the repository.
    /// Must be called inside a tokio runtime.
    pub async fn bind(config: ParleyConfig) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let net = &config.network;

        let control_listener = TcpListener::bind((net.bind_addr.as_str(), net.control_port))
            .await
            .with_context(|| format!("failed to bind control port {}:{}", net.bind_addr, net.control_port))?;
        let bulk_listener = TcpListener::bind((net.bind_addr.as_str(), net.bulk_port))
            .await
            .with_context(|| format!("failed to bind bulk port {}:{}", net.bind_addr, net.bulk_port))?;
        let control_addr = control_listener.local_addr()?;
        let bulk_addr = bulk_listener.local_addr()?;

        let repo = Repository::new(&config.transfer.repo_path);
        repo.ensure()
            .await
            .context("failed to prepare file repository")?;

        let pool = WorkerPool::new(config.pool.min_workers, config.pool.max_workers);
        let queues = MessageQueues::from_config(&config.queue);

        tracing::info!(
            control = %control_addr,
            bulk = %bulk_addr,
            repo = %repo.root().display(),
            workers = pool.worker_count(),
            "parleyd listening"
        );

        Ok(Self {
            config,
            control_listener,
            bulk_listener,
            control_addr,
            bulk_addr,
            control: ControlRegistry::new(),
            bulk: BulkRegistry::new(),
            queues,
            pool,
            repo,
            tracker: TransferTracker::new(),
        })
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn bulk_addr(&self) -> SocketAddr {
        self.bulk_addr
    }

    pub fn control_registry(&self) -> ControlRegistry {
        self.control.clone()
    }

    pub fn bulk_registry(&self) -> BulkRegistry {
        self.bulk.clone()
    }

    pub fn tracker(&self) -> TransferTracker {
        self.tracker.clone()
    }

    pub fn queues(&self) -> MessageQueues {
        self.queues.clone()
    }

    /// Run until `shutdown_tx` fires or a task exits.
    ///
    /// Every task subscribes to `shutdown_tx` before this returns, so a
    /// shutdown sent before the future is first polled still stops it.
    pub fn run(self, shutdown_tx: broadcast::Sender<()>) -> impl Future<Output = Result<()>> {
        let mut shutdown_rx = shutdown_tx.subscribe();
        let Self {
            config,
            control_listener,
            bulk_listener,
            control,
            bulk,
            queues,
            pool,
            repo,
            tracker,
            ..
        } = self;
        let transfer = TransferConfig::from(&config.transfer);

        let ctx = ConnContext {
            control: control.clone(),
            bulk: bulk.clone(),
            ingress: queues.ingress.clone(),
            config: config.reactor.clone(),
            chunk_size: transfer.chunk_size,
        };

        let reactor = Reactor::new(control_listener, bulk_listener, ctx, shutdown_tx.clone());
        let router = Router::new(
            control.clone(),
            bulk.clone(),
            queues.clone(),
            pool.clone(),
            repo,
            transfer,
            tracker.clone(),
            shutdown_tx.subscribe(),
        );
        let egress = EgressWriter::new(
            control.clone(),
            queues.egress.clone(),
            config.reactor.write_timeout(),
            shutdown_tx.subscribe(),
        );
        let sweeper = LivenessSweeper::new(
            control.clone(),
            bulk,
            config.registry.sweep_interval(),
            shutdown_tx.subscribe(),
        );
        let mut stats_shutdown = shutdown_tx.subscribe();

        async move {
            let reactor_task = tokio::spawn(reactor.run());
            let router_task = tokio::spawn(router.run());
            let egress_task = tokio::spawn(egress.run());
            let sweeper_task = tokio::spawn(sweeper.run());

            let stats_printer = {
                let pool = pool.clone();
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(STATS_INTERVAL);
                    loop {
                        tokio::select! {
                            _ = stats_shutdown.recv() => return,
                            _ = interval.tick() => {}
                        }
                        tracing::info!(
                            users = control.len(),
                            online = control.online_ids().len(),
                            ingress = queues.ingress.len(),
                            egress = queues.egress.len(),
                            workers = pool.worker_count(),
                            outstanding = pool.outstanding(),
                            "server stats"
                        );
                        tracker.log_stats();
                    }
                })
            };

            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => tracing::info!("shutting down"),
                r = reactor_task  => tracing::error!("reactor exited: {:?}", r),
                r = router_task   => tracing::error!("router exited: {:?}", r),
                r = egress_task   => tracing::error!("egress writer exited: {:?}", r),
                r = sweeper_task  => tracing::error!("liveness sweeper exited: {:?}", r),
                r = stats_printer => tracing::error!("stats printer exited: {:?}", r),
            }

            let _ = shutdown_tx.send(());
            pool.shutdown();
            Ok(())
        }
    }
}
