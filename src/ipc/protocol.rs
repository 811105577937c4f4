//! Host transport wire messages.
//!
//! One host connection stands for one browser tab or web view. All frames
//! are JSON objects tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::capture::simulated::SimulateAction;

/// All host transport frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Message {
    // -- Handshake --
    /// First frame of every connection: the tab attaches displaying `url`.
    #[serde(rename = "attach")]
    Attach { version: u32, url: String },

    #[serde(rename = "attach_ack")]
    AttachAck {
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // -- Host → broker --
    /// A script message posted by the page under `handler`.
    #[serde(rename = "script")]
    Script {
        handler: String,
        /// URL of the posting page, when the host knows it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        body: String,
    },

    #[serde(rename = "navigated")]
    Navigated { url: String },

    /// The tab became the foreground tab.
    #[serde(rename = "focus")]
    Focus,

    /// Raise a hardware event on the simulated capture layer.
    #[serde(rename = "simulate")]
    Simulate { action: SimulateAction },

    // -- Broker → host --
    /// Invoke page-side `function` with JSON-RPC text.
    #[serde(rename = "call")]
    Call { function: String, payload: String },
}

/// Handshake status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Host transport protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Script handler carrying JSON-RPC requests.
pub const SEND_JSON_RPC_HANDLER: &str = "sendJsonRpc";

/// Page-side function receiving solicited replies.
pub const REPLY_FUNCTION: &str = "replyJsonRpc";

/// Page-side function receiving push notifications.
pub const NOTIFY_FUNCTION: &str = "receiveJsonRpc";

/// Minimal envelope for recognizing frames of an unknown `type`.
#[derive(Debug, Deserialize)]
pub struct RawEnvelope {
    #[serde(rename = "type")]
    pub msg_type: String,
}
