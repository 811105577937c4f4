//! Page-side transport connection.
//!
//! Attaches to the broker as one host transport and speaks the same
//! frames a browser tab would.

use std::path::Path;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use crate::capture::simulated::SimulateAction;
use crate::ipc::codec::LengthPrefixedCodec;
use crate::ipc::protocol::{Message, PROTOCOL_VERSION, SEND_JSON_RPC_HANDLER, Status};

use super::ClientError;

/// One `call` frame received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFrame {
    pub function: String,
    pub payload: String,
}

pub struct PageClient {
    framed: Framed<UnixStream, LengthPrefixedCodec>,
}

impl PageClient {
    /// Connect and attach displaying `url`.
    pub async fn attach(socket_path: &Path, url: &str) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|e| ClientError::Broker(format!("connect failed: {e}")))?;
        let mut framed = Framed::new(stream, LengthPrefixedCodec::new());

        framed
            .send(Message::Attach {
                version: PROTOCOL_VERSION,
                url: url.to_owned(),
            })
            .await
            .map_err(|e| ClientError::Broker(format!("send attach: {e}")))?;

        match framed.next().await {
            Some(Ok(Message::AttachAck {
                status: Status::Ok, ..
            })) => Ok(Self { framed }),
            Some(Ok(Message::AttachAck {
                status: Status::Error,
                error,
            })) => Err(ClientError::Broker(format!(
                "attach rejected: {}",
                error.unwrap_or_default()
            ))),
            other => Err(ClientError::Broker(format!(
                "unexpected attach response: {other:?}"
            ))),
        }
    }

    pub async fn focus(&mut self) -> Result<(), ClientError> {
        self.send(Message::Focus).await
    }

    /// Post a JSON-RPC request the way a page script would.
    pub async fn post(&mut self, body: &str) -> Result<(), ClientError> {
        self.send(Message::Script {
            handler: SEND_JSON_RPC_HANDLER.into(),
            url: None,
            body: body.to_owned(),
        })
        .await
    }

    pub async fn simulate(&mut self, action: SimulateAction) -> Result<(), ClientError> {
        self.send(Message::Simulate { action }).await
    }

    /// Wait up to `idle` for the next `call` frame.
    ///
    /// `Ok(None)` when the wait expires or the broker closes the connection.
    pub async fn next_call(&mut self, idle: Duration) -> Result<Option<CallFrame>, ClientError> {
        loop {
            let frame = match tokio::time::timeout(idle, self.framed.next()).await {
                Err(_elapsed) => return Ok(None),
                Ok(None) => return Ok(None),
                Ok(Some(frame)) => frame.map_err(|e| ClientError::Broker(format!("read: {e}")))?,
            };
            match frame {
                Message::Call { function, payload } => return Ok(Some(CallFrame { function, payload })),
                other => tracing::debug!(?other, "non-call frame ignored"),
            }
        }
    }

    async fn send(&mut self, msg: Message) -> Result<(), ClientError> {
        self.framed
            .send(msg)
            .await
            .map_err(|e| ClientError::Broker(format!("send: {e}")))
    }
}
