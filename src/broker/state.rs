//! Broker state: registry, transport table, capture handle.
//!
//! Owned exclusively by the broker loop. No concurrent access. Every entry
//! point runs a core operation into an [`Outbox`] and then flushes it:
//! deliveries pass the stale-session guard and go to their transport,
//! capture calls are spawned and come back as [`CallCompletion`]s.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::fanout;
use super::interpreter::{self, Origin};
use super::outbox::{CallCompletion, Outbox, may_deliver};
use super::registry::Registry;
use super::transport::{TransportId, TransportTable};
use crate::capture::simulated::SimulatedCapture;
use crate::capture::{CaptureEvent, CaptureLayer};
use crate::ipc::protocol::{Message, PROTOCOL_VERSION, SEND_JSON_RPC_HANDLER, Status};

pub struct BrokerState {
    registry: Registry,
    transports: TransportTable,
    capture: Arc<dyn CaptureLayer>,
    completions: mpsc::UnboundedSender<CallCompletion>,
    /// Target of `simulate` frames. `None` when backed by real hardware.
    simulator: Option<SimulatedCapture>,
}

impl BrokerState {
    pub fn new(
        capture: Arc<dyn CaptureLayer>,
        registry: Registry,
        completions: mpsc::UnboundedSender<CallCompletion>,
    ) -> Self {
        Self {
            registry,
            transports: TransportTable::new(),
            capture,
            completions,
            simulator: None,
        }
    }

    /// Accept `simulate` frames and apply them to `simulator`.
    pub fn with_simulator(mut self, simulator: SimulatedCapture) -> Self {
        self.simulator = Some(simulator);
        self
    }

    #[cfg(test)]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Track a new connection and the channel its frames go out on.
    pub fn add_transport(&mut self, id: TransportId, outbound: mpsc::UnboundedSender<Message>) {
        self.transports.insert(id, outbound);
    }

    /// Forget a connection and close every session opened through it.
    pub fn remove_transport(&mut self, id: TransportId) {
        self.transports.remove(id);
        let closed = self.registry.close_transport(id);
        if !closed.is_empty() {
            tracing::info!(transport = ?id, sessions = closed.len(), "transport gone, sessions closed");
        }
    }

    /// Handle one frame from a connection.
    ///
    /// Returns the frame to answer with, for frames that take one.
    pub fn handle_message(&mut self, id: TransportId, msg: Message) -> Option<Message> {
        match msg {
            Message::Attach { version, url } => Some(self.attach(id, version, url)),
            Message::Script { handler, url, body } => {
                if handler != SEND_JSON_RPC_HANDLER {
                    tracing::debug!(transport = ?id, handler = %handler, "script handler not handled by broker");
                    return None;
                }
                let mut out = Outbox::new();
                let page = url.as_deref().or(self.transports.current_url(id));
                match page {
                    Some(page) => {
                        let origin = Origin { transport: id, url: page };
                        interpreter::interpret(&mut self.registry, self.capture.as_ref(), origin, &body, &mut out);
                    }
                    None => tracing::warn!(transport = ?id, "script from unattached transport dropped"),
                }
                self.flush(out);
                None
            }
            Message::Navigated { url } => {
                self.navigated(id, url);
                None
            }
            Message::Focus => {
                self.focus(id);
                None
            }
            Message::Simulate { action } => {
                match &self.simulator {
                    Some(simulator) => simulator.apply(action),
                    None => tracing::warn!(transport = ?id, "simulate frame without simulated capture ignored"),
                }
                None
            }
            Message::AttachAck { .. } | Message::Call { .. } => {
                tracing::debug!(transport = ?id, "unexpected host frame ignored");
                None
            }
        }
    }

    fn attach(&mut self, id: TransportId, version: u32, url: String) -> Message {
        if version != PROTOCOL_VERSION {
            tracing::warn!(transport = ?id, version, "attach version mismatch");
            return Message::AttachAck {
                status: Status::Error,
                error: Some("version_mismatch".into()),
            };
        }
        if self.transports.current_url(id).is_some() {
            // A repeated attach is a page change on the same tab.
            tracing::debug!(transport = ?id, "transport re-attached");
            self.navigated(id, url);
        } else if self.transports.set_url(id, url) {
            tracing::debug!(transport = ?id, "transport attached");
        } else {
            return Message::AttachAck {
                status: Status::Error,
                error: Some("unknown_transport".into()),
            };
        }
        Message::AttachAck {
            status: Status::Ok,
            error: None,
        }
    }

    /// The tab now shows `url`: re-activate a session it opened there, or
    /// give up the active slot if this tab holds it.
    fn navigated(&mut self, id: TransportId, url: String) {
        if !self.transports.set_url(id, url.clone()) {
            return;
        }
        let mut out = Outbox::new();
        if let Some(handle) = self.registry.session_by_url(id, &url).map(|s| s.handle()) {
            let devices = self.capture.devices();
            self.registry.activate(handle, &devices, &mut out);
        } else if self.registry.active_session().is_some_and(|s| s.transport() == id) {
            self.registry.resign_active(&mut out);
        }
        self.flush(out);
    }

    fn focus(&mut self, id: TransportId) {
        let mut out = Outbox::new();
        let handle = self
            .transports
            .current_url(id)
            .and_then(|url| self.registry.session_by_url(id, url))
            .map(|s| s.handle());
        match handle {
            Some(handle) => {
                let devices = self.capture.devices();
                self.registry.activate(handle, &devices, &mut out);
            }
            None => self.registry.resign_active(&mut out),
        }
        self.flush(out);
    }

    pub fn handle_capture_event(&mut self, event: CaptureEvent) {
        let mut out = Outbox::new();
        fanout::dispatch_event(&self.registry, event, &mut out);
        self.flush(out);
    }

    pub fn handle_completion(&mut self, completion: CallCompletion) {
        let mut out = Outbox::new();
        self.registry.complete_call(completion, &mut out);
        self.flush(out);
    }

    fn flush(&mut self, out: Outbox) {
        let (deliveries, calls) = out.into_parts();

        for delivery in deliveries {
            if !may_deliver(&delivery.guard, self.transports.current_url(delivery.transport)) {
                tracing::debug!(transport = ?delivery.transport, "page changed, delivery suppressed");
                continue;
            }
            let payload = match delivery.payload.to_text() {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!(transport = ?delivery.transport, error = %e, "envelope serialization failed, delivery dropped");
                    continue;
                }
            };
            let msg = Message::Call {
                function: delivery.kind.function().to_owned(),
                payload,
            };
            if !self.transports.send(delivery.transport, msg) {
                tracing::debug!(transport = ?delivery.transport, "transport gone, delivery dropped");
            }
        }

        for call in calls {
            let (pending, future) = call.start(self.capture.as_ref());
            let completions = self.completions.clone();
            tokio::spawn(async move {
                let outcome = future.await;
                if completions.send(CallCompletion { call: pending, outcome }).is_err() {
                    tracing::debug!("broker loop gone, property outcome dropped");
                }
            });
        }
    }
}
