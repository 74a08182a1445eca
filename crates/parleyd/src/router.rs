//! Message router: the single consumer of the ingress queue.
//!
//! Identity changes have already been applied by the reactor. Texts are
//! fanned out or delivered point-to-point through the egress queue. File
//! requests claim their bulk connection and run as a worker-pool task.

use anyhow::Result;
use tokio::sync::broadcast;

use parley_core::{DeliveryClass, File, FileAction, Message, Text, UserId, BROADCAST};
use parley_services::{
    BulkReceiver, BulkRegistry, BulkStream, ControlRegistry, MessageQueue, MessageQueues,
    Repository, TransferConfig, TransferError, Transport, WorkerPool,
};

use crate::tracker::TransferTracker;

pub struct Router {
    control: ControlRegistry,
    bulk: BulkRegistry,
    queues: MessageQueues,
    pool: WorkerPool,
    repo: Repository,
    transfer: TransferConfig,
    tracker: TransferTracker,
    shutdown: broadcast::Receiver<()>,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        control: ControlRegistry,
        bulk: BulkRegistry,
        queues: MessageQueues,
        pool: WorkerPool,
        repo: Repository,
        transfer: TransferConfig,
        tracker: TransferTracker,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            control,
            bulk,
            queues,
            pool,
            repo,
            transfer,
            tracker,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("router shutting down");
                    return Ok(());
                }

                msg = self.queues.ingress.pop() => self.route(msg),
            }
        }
    }

    pub fn route(&self, msg: Message) {
        match msg {
            Message::Identity(identity) => {
                tracing::trace!(uid = identity.uid, action = ?identity.action, "identity event");
            }
            Message::Text(text) => self.route_text(text),
            Message::File(request) => self.route_file(request),
        }
    }

    fn route_text(&self, text: Text) {
        if text.class == DeliveryClass::Group || text.receiver == BROADCAST {
            let recipients: Vec<UserId> = self
                .control
                .online_ids()
                .into_iter()
                .filter(|uid| *uid != text.sender)
                .collect();
            tracing::debug!(
                sender = text.sender,
                recipients = recipients.len(),
                bytes = text.content.len(),
                "broadcast text"
            );
            for uid in recipients {
                let mut copy = text.clone();
                copy.receiver = uid;
                push_egress(&self.queues.egress, copy);
            }
        } else if self.control.is_online(text.receiver) {
            tracing::debug!(sender = text.sender, receiver = text.receiver, "private text");
            push_egress(&self.queues.egress, text);
        } else {
            tracing::debug!(
                sender = text.sender,
                receiver = text.receiver,
                "private text to offline user dropped"
            );
        }
    }

    fn route_file(&self, request: File) {
        let uid = request.sender;
        let handle = match self.bulk.take(uid) {
            Some(h) => h,
            None => {
                tracing::warn!(uid, file = %request.filename, "file request without a bulk connection");
                self.notify(
                    uid,
                    &format!("transfer of {} failed: no bulk connection", request.filename),
                );
                return;
            }
        };
        tracing::debug!(uid, conn_id = handle.conn_id(), file = %request.filename, "scheduling transfer");

        let job = TransferJob {
            request: request.clone(),
            stream: handle.into_stream(),
            repo: self.repo.clone(),
            config: self.transfer.clone(),
            control: self.control.clone(),
            egress: self.queues.egress.clone(),
            tracker: self.tracker.clone(),
        };

        match self.pool.submit(job.run()) {
            Ok(task) => {
                let egress = self.queues.egress.clone();
                tokio::spawn(async move {
                    if let Err(e) = task.await {
                        tracing::error!(uid, file = %request.filename, error = %e, "transfer task died");
                        push_egress(
                            &egress,
                            Text::notice(
                                uid,
                                DeliveryClass::Private,
                                &format!("transfer of {} failed: {e}", request.filename),
                            ),
                        );
                    }
                });
            }
            Err(e) => {
                tracing::warn!(uid, error = %e, "worker pool rejected transfer");
                self.notify(uid, &format!("transfer of {} failed: {e}", request.filename));
            }
        }
    }

    fn notify(&self, uid: UserId, body: &str) {
        push_egress(
            &self.queues.egress,
            Text::notice(uid, DeliveryClass::Private, body),
        );
    }
}

fn push_egress(egress: &MessageQueue<Message>, text: Text) {
    if let Some(dropped) = egress.push(Message::Text(text)) {
        tracing::warn!(receiver = ?dropped.receiver(), "egress queue full, message dropped");
    }
}

/// One bulk session, run on a pool worker.
struct TransferJob {
    request: File,
    stream: BulkStream,
    repo: Repository,
    config: TransferConfig,
    control: ControlRegistry,
    egress: MessageQueue<Message>,
    tracker: TransferTracker,
}

impl TransferJob {
    async fn run(self) -> Result<u64, TransferError> {
        let File {
            sender: uid,
            ref filename,
            offset,
            action,
            ..
        } = self.request;

        let (result, tracked) = match action {
            FileAction::Upload => {
                let receiver = BulkReceiver::new(self.stream, self.config);
                let tracked = self.tracker.begin(uid, filename, action, receiver.progress());
                (receiver.receive_file(&self.repo, filename, offset).await, tracked)
            }
            FileAction::Download => {
                let sender = parley_services::BulkSender::new(self.stream, self.config);
                let tracked = self.tracker.begin(uid, filename, action, sender.progress());
                (sender.send_file(&self.repo, filename, offset).await, tracked)
            }
        };
        let elapsed = tracked.finish(result.is_ok());

        match &result {
            Ok(bytes) => {
                tracing::info!(
                    uid,
                    file = %filename,
                    action = ?action,
                    bytes,
                    offset,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "transfer complete"
                );
                if action == FileAction::Upload {
                    let body = format!("file available: {} ({} bytes)", filename, offset + bytes);
                    for recipient in self.control.online_ids() {
                        push_egress(
                            &self.egress,
                            Text::notice(recipient, DeliveryClass::Group, &body),
                        );
                    }
                }
            }
            Err(e) => {
                tracing::warn!(uid, file = %filename, action = ?action, error = %e, "transfer failed");
                push_egress(
                    &self.egress,
                    Text::notice(
                        uid,
                        DeliveryClass::Private,
                        &format!("transfer of {filename} failed: {e}"),
                    ),
                );
            }
        }
        result
    }
}
