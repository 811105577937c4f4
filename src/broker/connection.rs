//! Per-transport connection task: framed I/O, attach handshake, forwarding.
//!
//! Each host connection spawns a tokio task that:
//! 1. Wraps the socket in the length-prefixed JSON frame codec.
//! 2. Reads the first frame (must be `attach`) and forwards it to the
//!    broker loop, which answers with the `attach_ack`.
//! 3. Enters a select loop: forward host frames to the broker loop, write
//!    outbound `call` frames the broker routes to this transport.
//! 4. On disconnect, notifies the broker loop for cleanup.

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;

use crate::ipc::codec::{CodecError, DecodeResult, FrameCodec, decode_frame};
use crate::ipc::protocol::{Message, Status};

use super::transport::TransportId;

/// Command sent from a connection task to the broker loop.
///
/// `response_tx` is set only for frames answered synchronously (`attach`).
#[derive(Debug)]
pub struct BrokerCommand {
    pub request: Message,
    pub response_tx: Option<oneshot::Sender<Message>>,
    pub transport_id: TransportId,
}

/// Notification sent when a connection closes.
#[derive(Debug)]
pub struct DisconnectNotice {
    pub transport_id: TransportId,
}

/// Connection-level errors.
#[derive(Debug, thiserror::Error)]
enum ConnectionError {
    #[error("unexpected EOF during handshake")]
    HandshakeEof,
    #[error("first frame must be attach")]
    NotAttach,
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("broker loop closed")]
    BrokerGone,
    #[error("response channel closed")]
    ResponseDropped,
}

/// Spawn a connection handler task.
///
/// The task runs until the host disconnects or a protocol error occurs.
/// On exit, a [`DisconnectNotice`] is sent to the broker loop.
pub fn spawn_connection(
    stream: UnixStream,
    transport_id: TransportId,
    cmd_tx: mpsc::UnboundedSender<BrokerCommand>,
    outbound_rx: mpsc::UnboundedReceiver<Message>,
    disconnect_tx: mpsc::UnboundedSender<DisconnectNotice>,
) {
    tokio::spawn(async move {
        if let Err(e) = handle_connection(stream, transport_id, cmd_tx, outbound_rx).await {
            tracing::debug!(?transport_id, error = %e, "connection closed");
        }
        let _ = disconnect_tx.send(DisconnectNotice { transport_id });
    });
}

async fn handle_connection(
    stream: UnixStream,
    transport_id: TransportId,
    cmd_tx: mpsc::UnboundedSender<BrokerCommand>,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
) -> Result<(), ConnectionError> {
    let mut framed = Framed::new(stream, FrameCodec::new());

    // -- Handshake: first frame must be attach --
    let first_frame = framed
        .next()
        .await
        .ok_or(ConnectionError::HandshakeEof)??;

    let attach = match decode_frame(&first_frame) {
        DecodeResult::Ok(msg @ Message::Attach { .. }) => msg,
        DecodeResult::Ok(_) | DecodeResult::UnknownType(_) => return Err(ConnectionError::NotAttach),
        DecodeResult::Malformed(e) => return Err(ConnectionError::MalformedFrame(e)),
    };

    let ack = request(&cmd_tx, attach, transport_id).await?;
    let rejected = is_error_ack(&ack);
    framed.send(ack).await?;
    if rejected {
        return Ok(());
    }

    // -- Main loop: host frames + outbound calls --
    loop {
        tokio::select! {
            frame = framed.next() => {
                let raw = match frame {
                    Some(Ok(raw)) => raw,
                    Some(Err(e)) => return Err(ConnectionError::Codec(e)),
                    None => return Ok(()),
                };
                match decode_frame(&raw) {
                    DecodeResult::Ok(msg @ Message::Attach { .. }) => {
                        let ack = request(&cmd_tx, msg, transport_id).await?;
                        framed.send(ack).await?;
                    }
                    DecodeResult::Ok(msg) => forward(&cmd_tx, msg, transport_id)?,
                    DecodeResult::UnknownType(envelope) => {
                        tracing::debug!(?transport_id, msg_type = %envelope.msg_type, "unknown frame type ignored");
                    }
                    DecodeResult::Malformed(e) => return Err(ConnectionError::MalformedFrame(e)),
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(msg) => framed.send(msg).await?,
                    // Broker loop dropped the transport.
                    None => return Ok(()),
                }
            }
        }
    }
}

/// Hand a frame to the broker loop without waiting.
fn forward(
    cmd_tx: &mpsc::UnboundedSender<BrokerCommand>,
    request: Message,
    transport_id: TransportId,
) -> Result<(), ConnectionError> {
    cmd_tx
        .send(BrokerCommand {
            request,
            response_tx: None,
            transport_id,
        })
        .map_err(|_| ConnectionError::BrokerGone)
}

/// Send a frame to the broker loop and wait for its answer.
async fn request(
    cmd_tx: &mpsc::UnboundedSender<BrokerCommand>,
    request: Message,
    transport_id: TransportId,
) -> Result<Message, ConnectionError> {
    let (response_tx, response_rx) = oneshot::channel();
    cmd_tx
        .send(BrokerCommand {
            request,
            response_tx: Some(response_tx),
            transport_id,
        })
        .map_err(|_| ConnectionError::BrokerGone)?;
    response_rx.await.map_err(|_| ConnectionError::ResponseDropped)
}

fn is_error_ack(msg: &Message) -> bool {
    matches!(
        msg,
        Message::AttachAck {
            status: Status::Error,
            ..
        }
    )
}
