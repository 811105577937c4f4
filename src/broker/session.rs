//! Sessions and their device bindings.
//!
//! A [`Session`] is one page's connection to the broker. Everything it sends
//! goes through the [`Outbox`] with the session's originating URL as guard.

use std::collections::BTreeMap;

use serde_json::json;

use super::handle::{DeviceHandle, SessionHandle};
use super::outbox::{CallCompletion, CallOp, CallOrigin, CaptureCall, Outbox, PendingCall};
use super::transport::TransportId;
use crate::capture::{AppInfo, DeviceInfo, PropertyTarget};
use crate::rpc::envelope::{Event, EventDataType, EventId, RequestId, Response};
use crate::rpc::error::BrokerError;
use crate::rpc::property::Property;

/// Ownership value sent when a session does not own a device.
pub const DISOWNED_ID: &str = "00000000-0000-0000-0000-000000000000";

/// One physical device as opened by one session.
#[derive(Debug, Clone)]
pub struct DeviceBinding {
    handle: DeviceHandle,
    device: DeviceInfo,
}

impl DeviceBinding {
    pub fn new(handle: DeviceHandle, device: DeviceInfo) -> Self {
        Self { handle, device }
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub fn guid(&self) -> &str {
        &self.device.guid
    }

    pub fn target(&self) -> PropertyTarget {
        PropertyTarget::Device(self.device.guid.clone())
    }
}

#[derive(Debug)]
pub struct Session {
    handle: SessionHandle,
    app_info: AppInfo,
    url: String,
    transport: TransportId,
    ownership_id: String,
    devices: BTreeMap<DeviceHandle, DeviceBinding>,
}

impl Session {
    pub fn new(handle: SessionHandle, app_info: AppInfo, url: String, transport: TransportId) -> Self {
        Self {
            handle,
            app_info,
            url,
            transport,
            ownership_id: uuid::Uuid::new_v4().to_string(),
            devices: BTreeMap::new(),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn app_info(&self) -> &AppInfo {
        &self.app_info
    }

    /// URL of the page that opened the session.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn transport(&self) -> TransportId {
        self.transport
    }

    #[cfg(test)]
    pub fn ownership_id(&self) -> &str {
        &self.ownership_id
    }

    pub fn binding(&self, handle: DeviceHandle) -> Option<&DeviceBinding> {
        self.devices.get(&handle)
    }

    pub fn binding_for_guid(&self, guid: &str) -> Option<&DeviceBinding> {
        self.devices.values().find(|b| b.guid() == guid)
    }

    pub fn has_opened(&self, guid: &str) -> bool {
        self.binding_for_guid(guid).is_some()
    }

    #[cfg(test)]
    pub fn bindings(&self) -> impl Iterator<Item = &DeviceBinding> {
        self.devices.values()
    }

    pub fn find_device_handle(&self, raw: i64) -> Option<DeviceHandle> {
        self.devices.keys().copied().find(|h| h.raw() == raw)
    }

    // -- Delivery --

    pub fn reply(&self, out: &mut Outbox, payload: Response) {
        out.reply(self.transport, &self.url, payload);
    }

    pub fn notify(&self, out: &mut Outbox, payload: Response) {
        out.notify(self.transport, &self.url, payload);
    }

    pub fn reply_error(
        &self,
        out: &mut Outbox,
        version: &str,
        error: &BrokerError,
        handle: i64,
        id: Option<RequestId>,
    ) {
        self.reply(out, Response::from_error(version, error, Some(handle), id));
    }

    // -- Devices --

    /// Open `device`, reusing an existing binding for its GUID.
    ///
    /// Replies with the binding handle, then grants ownership.
    pub fn open_device(
        &mut self,
        device: DeviceInfo,
        allocate: impl FnOnce() -> DeviceHandle,
        version: &str,
        id: Option<RequestId>,
        out: &mut Outbox,
    ) -> DeviceHandle {
        let handle = match self.binding_for_guid(&device.guid) {
            Some(existing) => existing.handle(),
            None => {
                let handle = allocate();
                self.devices.insert(handle, DeviceBinding::new(handle, device));
                handle
            }
        };
        self.reply(out, Response::handle(version, id, handle.raw()));
        self.change_ownership(handle, true, version, out);
        handle
    }

    /// Drop every binding without per-device notifications, then reply `0`.
    pub fn close(&mut self, version: &str, id: Option<RequestId>, out: &mut Outbox) {
        self.devices.clear();
        self.reply(out, Response::success(version, id, json!(0)));
    }

    pub fn close_device(
        &mut self,
        handle: DeviceHandle,
        version: &str,
        id: Option<RequestId>,
        out: &mut Outbox,
    ) -> Result<(), BrokerError> {
        if self.devices.remove(&handle).is_none() {
            return Err(BrokerError::InvalidHandle(BrokerError::HANDLE_NOT_FOUND));
        }
        self.reply(out, Response::success(version, id, json!(0)));
        Ok(())
    }

    // -- Ownership --

    pub fn change_ownership(&self, handle: DeviceHandle, owned: bool, version: &str, out: &mut Outbox) {
        let value = if owned { self.ownership_id.as_str() } else { DISOWNED_ID };
        let event = Event::new(EventId::DeviceOwnership, EventDataType::String, json!(value));
        self.notify(out, Response::event(version, handle.raw(), event));
    }

    /// Report ownership of every bound device.
    pub fn resume(&self, version: &str, out: &mut Outbox) {
        self.announce_ownership(true, version, out);
    }

    /// Report loss of ownership for every bound device.
    pub fn suspend(&self, version: &str, out: &mut Outbox) {
        self.announce_ownership(false, version, out);
    }

    fn announce_ownership(&self, owned: bool, version: &str, out: &mut Outbox) {
        for handle in self.devices.keys() {
            self.change_ownership(*handle, owned, version, out);
        }
    }

    // -- Properties --

    /// Build the capture call for a get/set addressed at `origin`.
    pub fn property_call(
        &self,
        origin: CallOrigin,
        op: CallOp,
        property: Property,
        request_id: Option<RequestId>,
    ) -> Result<CaptureCall, BrokerError> {
        let target = match origin {
            CallOrigin::Session => PropertyTarget::Capture,
            CallOrigin::Device(handle) => self
                .binding(handle)
                .map(DeviceBinding::target)
                .ok_or(BrokerError::InvalidHandle(BrokerError::HANDLE_NOT_FOUND))?,
        };
        Ok(CaptureCall {
            pending: PendingCall {
                session: self.handle,
                origin,
                op,
                request_id,
            },
            target,
            property,
        })
    }

    /// Turn a finished property call into a reply.
    ///
    /// Completions for a binding closed in the meantime are dropped.
    pub fn complete_call(&self, completion: CallCompletion, version: &str, out: &mut Outbox) {
        let CallCompletion { call, outcome } = completion;
        if let CallOrigin::Device(handle) = call.origin {
            if self.binding(handle).is_none() {
                tracing::debug!(session = %self.handle, device = %handle, "binding gone, dropping property reply");
                return;
            }
        }
        let handle = call.handle();
        let result = match outcome {
            Ok(Some(property)) => match call.op {
                CallOp::Get => property.to_result(),
                CallOp::Set => Ok(json!({ "handle": handle })),
            },
            Ok(None) => Err(BrokerError::MalformedCaptureProperty(
                "The capture layer reported success without a property".into(),
            )),
            Err(code) => Err(BrokerError::Capture {
                code,
                message: match call.op {
                    CallOp::Get => format!("There was an error getting the property. Result: {code}"),
                    CallOp::Set => format!("There was an error setting the property. Result: {code}"),
                },
            }),
        };
        match result {
            Ok(value) => self.reply(out, Response::success(version, call.request_id, value)),
            Err(error) => {
                if matches!(error, BrokerError::MalformedCaptureProperty(_)) {
                    tracing::error!(session = %self.handle, handle, error = %error, "capture layer broke its property contract");
                }
                self.reply_error(out, version, &error, handle, call.request_id);
            }
        }
    }
}
