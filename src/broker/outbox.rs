//! Effects produced by broker operations.
//!
//! Core operations never touch a transport or the hardware directly. They
//! push [`Delivery`] and [`CaptureCall`] values here, and the broker state
//! carries them out once the operation returns.

use futures::future::BoxFuture;

use super::handle::{DeviceHandle, SessionHandle};
use super::transport::TransportId;
use crate::capture::{CaptureLayer, PropertyOutcome, PropertyTarget};
use crate::ipc::protocol::{NOTIFY_FUNCTION, REPLY_FUNCTION};
use crate::rpc::envelope::{RequestId, Response};
use crate::rpc::property::Property;

/// Stale-session guard.
///
/// A page only hears from the broker while its transport still displays
/// the page that opened the session.
pub fn may_deliver(recorded: &str, live: Option<&str>) -> bool {
    live == Some(recorded)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    /// Answers a specific request.
    Reply,
    /// Unsolicited push.
    Notify,
}

impl DeliveryKind {
    /// Page-side function the envelope is handed to.
    pub fn function(self) -> &'static str {
        match self {
            Self::Reply => REPLY_FUNCTION,
            Self::Notify => NOTIFY_FUNCTION,
        }
    }
}

/// One envelope bound for one transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub transport: TransportId,
    /// URL the transport must still display for the delivery to happen.
    pub guard: String,
    pub kind: DeliveryKind,
    pub payload: Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOp {
    Get,
    Set,
}

/// What a property call was addressed to, from the page's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOrigin {
    Session,
    Device(DeviceHandle),
}

/// Bookkeeping for an in-flight property call.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCall {
    pub session: SessionHandle,
    pub origin: CallOrigin,
    pub op: CallOp,
    pub request_id: Option<RequestId>,
}

impl PendingCall {
    /// Raw handle the page addressed.
    pub fn handle(&self) -> i64 {
        match self.origin {
            CallOrigin::Session => self.session.raw(),
            CallOrigin::Device(device) => device.raw(),
        }
    }
}

/// A property get/set to issue against the capture layer.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureCall {
    pub pending: PendingCall,
    pub target: PropertyTarget,
    pub property: Property,
}

impl CaptureCall {
    pub fn start(self, layer: &dyn CaptureLayer) -> (PendingCall, BoxFuture<'static, PropertyOutcome>) {
        let future = match self.pending.op {
            CallOp::Get => layer.get_property(self.target, self.property),
            CallOp::Set => layer.set_property(self.target, self.property),
        };
        (self.pending, future)
    }
}

/// A finished property call re-entering the broker loop.
#[derive(Debug, Clone, PartialEq)]
pub struct CallCompletion {
    pub call: PendingCall,
    pub outcome: PropertyOutcome,
}

#[derive(Debug, Default)]
pub struct Outbox {
    deliveries: Vec<Delivery>,
    calls: Vec<CaptureCall>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&mut self, transport: TransportId, guard: &str, payload: Response) {
        self.deliveries.push(Delivery {
            transport,
            guard: guard.to_owned(),
            kind: DeliveryKind::Reply,
            payload,
        });
    }

    pub fn notify(&mut self, transport: TransportId, guard: &str, payload: Response) {
        self.deliveries.push(Delivery {
            transport,
            guard: guard.to_owned(),
            kind: DeliveryKind::Notify,
            payload,
        });
    }

    pub fn call(&mut self, call: CaptureCall) {
        self.calls.push(call);
    }

    #[cfg(test)]
    pub fn deliveries(&self) -> &[Delivery] {
        &self.deliveries
    }

    #[cfg(test)]
    pub fn calls(&self) -> &[CaptureCall] {
        &self.calls
    }

    pub fn into_parts(self) -> (Vec<Delivery>, Vec<CaptureCall>) {
        (self.deliveries, self.calls)
    }
}
