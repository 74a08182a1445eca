//! Bulk-channel connection task.
//!
//! A bulk connection must open with a File request. Once it has, the socket
//! leaves the reactor: it is parked in the bulk registry under the sender's
//! id and the request is queued for the router.

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::Instant;

use parley_core::wire;
use parley_core::{File, Message};
use parley_services::transport::next_conn_id;
use parley_services::{BulkHandle, ConnId, Transport};

use super::ConnContext;

pub async fn serve(
    mut stream: TcpStream,
    ctx: ConnContext,
    mut shutdown: broadcast::Receiver<()>,
) {
    let conn_id = next_conn_id();
    let deadline = Instant::now() + ctx.config.bulk_handshake_timeout();
    let mut buf = BytesMut::with_capacity(1024);

    let request = tokio::select! {
        _ = shutdown.recv() => return,
        r = tokio::time::timeout_at(deadline, read_request(&mut stream, &mut buf, conn_id)) => match r {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(_) => {
                tracing::warn!(conn_id, "bulk connection sent no file request in time");
                return;
            }
        },
    };

    let handle = match BulkHandle::new(stream, buf.freeze(), conn_id) {
        Ok(h) => h,
        Err(e) => {
            tracing::warn!(conn_id, error = %e, "failed to wrap bulk connection");
            return;
        }
    };
    handle.tune(ctx.chunk_size);

    let uid = request.sender;
    let peer = handle.peer_addr();
    if let Some(stale) = ctx.bulk.add(uid, handle) {
        tracing::info!(uid, old_conn = stale.conn_id(), "replacing unclaimed bulk connection");
        stale.close();
    }
    tracing::info!(
        uid,
        conn_id,
        %peer,
        file = %request.filename,
        action = ?request.action,
        offset = request.offset,
        "bulk connection ready"
    );
    ctx.forward(Message::File(request));
}

/// Read until one whole frame is buffered. Anything other than a valid File
/// request closes the connection.
async fn read_request(stream: &mut TcpStream, buf: &mut BytesMut, conn_id: ConnId) -> Option<File> {
    loop {
        match wire::next_frame(buf) {
            Ok(Some(packet)) => {
                return match Message::from_packet(&packet) {
                    Ok(Message::File(request)) => Some(request),
                    Ok(other) => {
                        tracing::warn!(conn_id, kind = ?other.kind(), "bulk connection must open with a file request");
                        None
                    }
                    Err(e) => {
                        tracing::warn!(conn_id, error = %e, "undecodable bulk request");
                        None
                    }
                };
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(conn_id, error = %e, "malformed bulk request");
                return None;
            }
        }

        match stream.read_buf(buf).await {
            Ok(0) => {
                tracing::debug!(conn_id, "bulk connection closed before request");
                return None;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(conn_id, error = %e, "bulk read failed");
                return None;
            }
        }
    }
}
