//! Control-channel connection task.
//!
//! Reads frames, applies identity changes to the registry before anything
//! is queued, and forwards decoded messages to the router.

use bytes::BytesMut;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use parley_core::wire;
use parley_core::{Identity, IdentityAction, Message, UserId};
use parley_services::transport::next_conn_id;
use parley_services::{ConnId, ControlHandle, Transport, TransportError};

use super::ConnContext;

const READ_BUF_CAPACITY: usize = 4096;

/// Serve one control connection until it closes.
pub async fn serve(stream: TcpStream, ctx: ConnContext, mut shutdown: broadcast::Receiver<()>) {
    let conn_id = next_conn_id();
    let (handle, mut reader) = match ControlHandle::split(stream, conn_id) {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(conn_id, error = %e, "failed to set up control connection");
            return;
        }
    };

    let mut session = ControlSession {
        ctx,
        handle,
        conn_id,
        uid: None,
        decode_errors: 0,
    };
    let mut buf = BytesMut::with_capacity(READ_BUF_CAPACITY);

    let reason = loop {
        tokio::select! {
            _ = shutdown.recv() => break "server shutdown",

            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => break "peer closed",
                Ok(_) => {
                    if let Err(reason) = session.drain(&mut buf) {
                        break reason;
                    }
                }
                Err(TransportError::Closed) => break "closed locally",
                Err(e) => {
                    tracing::debug!(conn_id, error = %e, "control read failed");
                    break "read error";
                }
            },
        }
    };

    session.finish(reason).await;
}

struct ControlSession {
    ctx: ConnContext,
    handle: ControlHandle,
    conn_id: ConnId,
    /// The identity this connection logged in as.
    uid: Option<UserId>,
    decode_errors: u32,
}

impl ControlSession {
    /// Consume every complete frame in `buf`. Errors carry the reason the
    /// connection should be dropped.
    fn drain(&mut self, buf: &mut BytesMut) -> Result<(), &'static str> {
        loop {
            match wire::next_frame(buf) {
                Ok(Some(packet)) => match Message::from_packet(&packet) {
                    Ok(msg) => {
                        self.decode_errors = 0;
                        self.handle(msg);
                    }
                    Err(e) => self.malformed(&e, buf)?,
                },
                Ok(None) => return Ok(()),
                Err(e) => self.malformed(&e, buf)?,
            }
        }
    }

    fn malformed(
        &mut self,
        error: &dyn std::error::Error,
        buf: &BytesMut,
    ) -> Result<(), &'static str> {
        self.decode_errors += 1;
        tracing::warn!(
            conn_id = self.conn_id,
            uid = ?self.uid,
            error = %error,
            consecutive = self.decode_errors,
            "dropping malformed packet"
        );
        tracing::trace!(
            conn_id = self.conn_id,
            next = %hex::encode(&buf[..buf.len().min(16)]),
            "buffer after discard"
        );

        let limit = self.ctx.config.max_consecutive_decode_errors;
        if limit > 0 && self.decode_errors >= limit {
            return Err("too many malformed packets");
        }
        Ok(())
    }

    fn handle(&mut self, msg: Message) {
        match &msg {
            Message::Identity(identity) => self.apply_identity(identity),
            Message::Text(text) => {
                self.ctx
                    .control
                    .set_online_if_current(text.sender, self.conn_id, true);
            }
            Message::File(file) => {
                tracing::warn!(
                    conn_id = self.conn_id,
                    uid = file.sender,
                    file = %file.filename,
                    "file request on control channel ignored; use the bulk channel"
                );
                return;
            }
        }
        self.ctx.forward(msg);
    }

    fn apply_identity(&mut self, identity: &Identity) {
        let uid = identity.uid;
        let control = &self.ctx.control;

        match identity.action {
            IdentityAction::Login => {
                if let Some(previous) = self.uid.filter(|prev| *prev != uid) {
                    control.set_online_if_current(previous, self.conn_id, false);
                }
                if let Some(displaced) = control.add(uid, self.handle.clone()) {
                    if displaced.conn_id() != self.conn_id {
                        tracing::info!(
                            uid,
                            old_conn = displaced.conn_id(),
                            new_conn = self.conn_id,
                            "login replaces existing session"
                        );
                        displaced.close();
                    }
                }
                self.uid = Some(uid);
                tracing::info!(uid, conn_id = self.conn_id, peer = %self.handle.peer_addr(), "login");
            }
            IdentityAction::Logout => {
                control.set_online_if_current(uid, self.conn_id, false);
                tracing::info!(uid, conn_id = self.conn_id, "logout");
            }
            IdentityAction::Heartbeat => {
                if !control.set_online_if_current(uid, self.conn_id, true) {
                    tracing::debug!(uid, conn_id = self.conn_id, "heartbeat without login ignored");
                }
            }
            IdentityAction::Register => {
                let username = identity
                    .credentials
                    .as_ref()
                    .map(|c| c.username.as_str())
                    .unwrap_or_default();
                tracing::info!(uid, username, "register request (no account store)");
            }
        }
    }

    async fn finish(self, reason: &'static str) {
        if let Some(uid) = self.uid {
            self.ctx
                .control
                .set_online_if_current(uid, self.conn_id, false);
        }
        self.handle.shutdown().await;
        tracing::debug!(conn_id = self.conn_id, uid = ?self.uid, reason, "control connection closed");
    }
}
