//! Arbitration & fan-out of hardware events.
//!
//! Presence and status events go to every session. Errors go to the active
//! session. Decoded data goes to the active session only, and only when it
//! has opened the reporting device.

use serde_json::{Value, json};

use super::outbox::Outbox;
use super::registry::Registry;
use super::session::Session;
use crate::capture::{CaptureEvent, DecodedData, DeviceInfo, DeviceKind};
use crate::rpc::envelope::{Event, EventDataType, EventId, Response};
use crate::rpc::error::{BrokerError, ResultCode};

fn presence_value(device: &DeviceInfo) -> Value {
    json!({
        "guid": device.guid,
        "name": device.name,
        "type": device.device_type,
    })
}

fn decoded_value(data: &DecodedData) -> Value {
    json!({
        "data": data.data,
        "id": data.source_id,
        "name": data.source_name,
    })
}

fn send_event(session: &Session, version: &str, id: EventId, kind: EventDataType, value: Value, out: &mut Outbox) {
    let event = Event::new(id, kind, value);
    session.notify(out, Response::event(version, session.handle().raw(), event));
}

fn send_error(session: &Session, version: &str, code: ResultCode, message: String, out: &mut Outbox) {
    let error = BrokerError::Capture { code, message };
    session.notify(
        out,
        Response::from_error(version, &error, Some(session.handle().raw()), None),
    );
}

/// Device presence for one session; a failed result becomes an error notification.
fn send_presence(
    session: &Session,
    version: &str,
    id: EventId,
    device: &DeviceInfo,
    result: ResultCode,
    out: &mut Outbox,
) {
    if !result.is_success() {
        let message = format!(
            "There was an error with arrival or removal of the device: {}. Result: {result}",
            device.name
        );
        send_error(session, version, result, message, out);
        return;
    }
    send_event(session, version, id, EventDataType::DeviceInfo, presence_value(device), out);
}

/// Route one hardware event to the sessions that may see it.
pub fn dispatch_event(registry: &Registry, event: CaptureEvent, out: &mut Outbox) {
    let version = registry.rpc_version();
    match event {
        CaptureEvent::Error(code) => {
            if let Some(active) = registry.active_session() {
                send_error(active, version, code, String::new(), out);
            }
        }
        CaptureEvent::DeviceArrival { device, result } => {
            for session in registry.sessions() {
                send_presence(session, version, EventId::DeviceArrival, &device, result, out);
            }
        }
        CaptureEvent::DeviceRemoval { device, result } => {
            for session in registry.sessions() {
                send_presence(session, version, EventId::DeviceRemoval, &device, result, out);
            }
        }
        CaptureEvent::DeviceManagerArrival { device, result } => {
            for session in registry.sessions() {
                send_presence(session, version, EventId::DeviceManagerArrival, &device, result, out);
            }
        }
        CaptureEvent::DeviceManagerRemoval { device, result } => {
            for session in registry.sessions() {
                send_presence(session, version, EventId::DeviceManagerRemoval, &device, result, out);
            }
        }
        CaptureEvent::PowerState { state, .. } => {
            for session in registry.sessions() {
                send_event(session, version, EventId::Power, EventDataType::Byte, json!(state), out);
            }
        }
        CaptureEvent::BatteryLevel { level, .. } => {
            for session in registry.sessions() {
                send_event(session, version, EventId::BatteryLevel, EventDataType::Byte, json!(level), out);
            }
        }
        CaptureEvent::ButtonsState { state, .. } => {
            for session in registry.sessions() {
                send_event(session, version, EventId::Buttons, EventDataType::Byte, json!(state), out);
            }
        }
        CaptureEvent::DecodedData { device, data, result } => {
            let Some(active) = registry.active_session() else {
                tracing::debug!("decoded data with no active session dropped");
                return;
            };
            if !active.has_opened(&device.guid) {
                tracing::debug!(session = %active.handle(), guid = %device.guid, "active session has not opened device, decoded data dropped");
                return;
            }
            if result != ResultCode::NO_ERROR && result != ResultCode::CANCEL {
                let message = format!(
                    "There was an error receiving decoded data from the device: {}. Result: {result}",
                    device.name
                );
                send_error(active, version, result, message, out);
                return;
            }
            if let Some(data) = data {
                send_event(active, version, EventId::DecodedData, EventDataType::DecodedData, decoded_value(&data), out);
            }
        }
    }
}

/// Replay an arrival for every connected device, then resume ownership.
pub fn resend_device_arrival_events(session: &Session, devices: &[DeviceInfo], version: &str, out: &mut Outbox) {
    for device in devices {
        let id = match device.kind {
            DeviceKind::Device => EventId::DeviceArrival,
            DeviceKind::Manager => EventId::DeviceManagerArrival,
        };
        send_presence(session, version, id, device, ResultCode::NO_ERROR, out);
    }
    session.resume(version, out);
}
