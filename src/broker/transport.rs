//! Transport table: one entry per connected host tab.
//!
//! Sessions refer to their transport by [`TransportId`] only. A missing
//! entry is a normal condition: the tab has gone away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::ipc::protocol::Message;

/// Unique identifier for a host connection.
///
/// Monotonically increasing counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId(u64);

impl TransportId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug)]
struct Transport {
    /// Page currently displayed. `None` until attached.
    url: Option<String>,
    outbound: mpsc::UnboundedSender<Message>,
}

#[derive(Debug, Default)]
pub struct TransportTable {
    transports: HashMap<TransportId, Transport>,
}

impl TransportTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly accepted connection.
    pub fn insert(&mut self, id: TransportId, outbound: mpsc::UnboundedSender<Message>) {
        self.transports.insert(id, Transport { url: None, outbound });
    }

    /// Record the page displayed by `id`. Returns `false` for unknown ids.
    pub fn set_url(&mut self, id: TransportId, url: String) -> bool {
        match self.transports.get_mut(&id) {
            Some(transport) => {
                transport.url = Some(url);
                true
            }
            None => false,
        }
    }

    pub fn current_url(&self, id: TransportId) -> Option<&str> {
        self.transports.get(&id)?.url.as_deref()
    }

    pub fn remove(&mut self, id: TransportId) -> bool {
        self.transports.remove(&id).is_some()
    }

    /// Queue a frame for the connection task. `false` if it is gone.
    pub fn send(&self, id: TransportId, msg: Message) -> bool {
        match self.transports.get(&id) {
            Some(transport) => transport.outbound.send(msg).is_ok(),
            None => false,
        }
    }
}
