//! Protocol interpreter: one inbound JSON-RPC request at a time.
//!
//! Parses the request, checks the fields each method needs, resolves the
//! addressed handle and invokes the registry or session operation. Errors
//! found before a session is resolved are answered on the requesting
//! transport only.

use super::outbox::{CallOp, CallOrigin, Outbox};
use super::registry::{Registry, Resolved};
use super::transport::TransportId;
use crate::capture::{AppInfo, CaptureLayer};
use crate::rpc::envelope::{Method, Request, RequestId, Response, Verified};
use crate::rpc::error::BrokerError;
use crate::rpc::property::Property;

/// Id echoed on a successful `openclient` reply when the request had none.
const OPEN_CLIENT_DEFAULT_ID: &str = "transport-openclient";

/// Where a request came from.
#[derive(Debug, Clone, Copy)]
pub struct Origin<'a> {
    pub transport: TransportId,
    /// URL of the posting page.
    pub url: &'a str,
}

/// Interpret one `sendJsonRpc` body.
pub fn interpret(
    registry: &mut Registry,
    capture: &dyn CaptureLayer,
    origin: Origin<'_>,
    body: &str,
    out: &mut Outbox,
) {
    let request = match Request::from_text(body) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(error = %e, "unparseable request");
            reply_early(registry, origin, &e, None, None, out);
            return;
        }
    };
    if let Some(version) = request.jsonrpc.as_deref() {
        registry.note_rpc_version(version);
    }
    let method = match request.method() {
        Ok(method) => method,
        Err(e) => {
            reply_early(registry, origin, &e, None, request.request_id(), out);
            return;
        }
    };
    tracing::debug!(?method, transport = ?origin.transport, "request");

    match method {
        Method::OpenClient => open_client(registry, capture, origin, &request, out),
        Method::OpenDevice => open_device(registry, capture, origin, &request, out),
        Method::Close => close(registry, origin, &request, out),
        Method::GetProperty => property(registry, origin, &request, CallOp::Get, out),
        Method::SetProperty => property(registry, origin, &request, CallOp::Set, out),
    }
}

fn reply_early(
    registry: &Registry,
    origin: Origin<'_>,
    error: &BrokerError,
    handle: Option<i64>,
    id: Option<RequestId>,
    out: &mut Outbox,
) {
    out.reply(
        origin.transport,
        origin.url,
        Response::from_error(registry.rpc_version(), error, handle, id),
    );
}

/// Require `handle` and `id`, replying to the origin when either is missing.
fn verify(registry: &Registry, origin: Origin<'_>, request: &Request, out: &mut Outbox) -> Option<Verified> {
    match request.verify() {
        Ok(verified) => Some(verified),
        Err((error, handle)) => {
            reply_early(registry, origin, &error, handle, request.request_id(), out);
            None
        }
    }
}

/// Resolve a handle among the sessions opened through the origin transport.
fn resolve(registry: &Registry, origin: Origin<'_>, raw: i64) -> Option<Resolved> {
    let resolved = registry.resolve(raw)?;
    let session = registry.session(resolved.session())?;
    if session.transport() != origin.transport {
        tracing::warn!(handle = raw, transport = ?origin.transport, "handle belongs to another transport");
        return None;
    }
    Some(resolved)
}

fn invalid_handle(registry: &Registry, origin: Origin<'_>, verified: Verified, out: &mut Outbox) {
    reply_early(
        registry,
        origin,
        &BrokerError::InvalidHandle(BrokerError::HANDLE_NOT_FOUND),
        Some(verified.handle),
        Some(RequestId::Int(verified.id)),
        out,
    );
}

fn open_client(
    registry: &mut Registry,
    capture: &dyn CaptureLayer,
    origin: Origin<'_>,
    request: &Request,
    out: &mut Outbox,
) {
    let id = request.request_id();
    let fields = (
        request.param_str("appId"),
        request.param_str("appKey"),
        request.param_str("developerId"),
    );
    let (Some(app_id), Some(app_key), Some(developer_id)) = fields else {
        reply_early(registry, origin, &BrokerError::invalid_parameter(), None, id, out);
        return;
    };
    let app = AppInfo {
        app_id: app_id.to_owned(),
        app_key: app_key.to_owned(),
        developer_id: developer_id.to_owned(),
    };
    let handle = match registry.open_session(app, origin.transport, origin.url.to_owned()) {
        Ok(handle) => handle,
        Err(e) => {
            reply_early(registry, origin, &e, None, id, out);
            return;
        }
    };
    let reply_id = id.unwrap_or_else(|| RequestId::Str(OPEN_CLIENT_DEFAULT_ID.to_owned()));
    if let Some(session) = registry.session(handle) {
        session.reply(out, Response::handle(registry.rpc_version(), Some(reply_id), handle.raw()));
    }
    registry.activate(handle, &capture.devices(), out);
}

fn open_device(
    registry: &mut Registry,
    capture: &dyn CaptureLayer,
    origin: Origin<'_>,
    request: &Request,
    out: &mut Outbox,
) {
    let Some(verified) = verify(registry, origin, request, out) else {
        return;
    };
    let Some(Resolved::Session(handle)) = resolve(registry, origin, verified.handle) else {
        invalid_handle(registry, origin, verified, out);
        return;
    };
    let id = Some(RequestId::Int(verified.id));
    let Some(session) = registry.session(handle) else {
        return;
    };
    let Some(guid) = request.param_str("guid") else {
        session.reply_error(out, registry.rpc_version(), &BrokerError::invalid_parameter(), verified.handle, id);
        return;
    };
    let Some(device) = capture.find_device(guid) else {
        let error = BrokerError::DeviceNotOpen(guid.to_owned());
        session.reply_error(out, registry.rpc_version(), &error, verified.handle, id);
        return;
    };
    registry.open_device(handle, device, id, out);
}

fn close(registry: &mut Registry, origin: Origin<'_>, request: &Request, out: &mut Outbox) {
    let Some(verified) = verify(registry, origin, request, out) else {
        return;
    };
    let id = Some(RequestId::Int(verified.id));
    let version = registry.rpc_version().to_owned();
    match resolve(registry, origin, verified.handle) {
        Some(Resolved::Session(handle)) => {
            if let Some(session) = registry.session_mut(handle) {
                session.close(&version, id, out);
            }
            registry.close_and_delete(handle);
        }
        Some(Resolved::Device(handle, device)) => {
            let Some(session) = registry.session_mut(handle) else {
                return;
            };
            if let Err(e) = session.close_device(device, &version, id.clone(), out) {
                session.reply_error(out, &version, &e, verified.handle, id);
            }
        }
        None => invalid_handle(registry, origin, verified, out),
    }
}

fn property(registry: &Registry, origin: Origin<'_>, request: &Request, op: CallOp, out: &mut Outbox) {
    let Some(verified) = verify(registry, origin, request, out) else {
        return;
    };
    let Some(resolved) = resolve(registry, origin, verified.handle) else {
        invalid_handle(registry, origin, verified, out);
        return;
    };
    let Some(session) = registry.session(resolved.session()) else {
        return;
    };
    let id = Some(RequestId::Int(verified.id));
    let params = request.params_or_empty();
    let parsed = match op {
        CallOp::Get => Property::for_get(&params),
        CallOp::Set => Property::for_set(&params),
    };
    let origin_kind = match resolved {
        Resolved::Session(_) => CallOrigin::Session,
        Resolved::Device(_, device) => CallOrigin::Device(device),
    };
    match parsed.and_then(|property| session.property_call(origin_kind, op, property, id.clone())) {
        Ok(call) => out.call(call),
        Err(e) => session.reply_error(out, registry.rpc_version(), &e, verified.handle, id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::handle::HandleAllocator;
    use crate::broker::outbox::{CallCompletion, DeliveryKind};
    use crate::capture::simulated::SimulatedCapture;
    use crate::capture::{DeviceInfo, DeviceKind, PropertyTarget};
    use crate::rpc::error::ResultCode;
    use serde_json::{Value, json};

    const URL: &str = "https://shop.example/scan";

    fn frozen() -> i64 {
        42_000
    }

    struct Harness {
        registry: Registry,
        capture: SimulatedCapture,
        transport: TransportId,
    }

    impl Harness {
        fn new() -> Self {
            let (capture, _events) = SimulatedCapture::new();
            capture.seed(DeviceInfo {
                guid: "ABC".into(),
                name: "S740".into(),
                device_type: 3,
                kind: DeviceKind::Device,
            });
            Self {
                registry: Registry::with_allocator(HandleAllocator::with_clock(frozen), None),
                capture,
                transport: TransportId::new(),
            }
        }

        fn send(&mut self, body: Value) -> Outbox {
            self.send_text(&body.to_string())
        }

        fn send_text(&mut self, body: &str) -> Outbox {
            let mut out = Outbox::new();
            let origin = Origin {
                transport: self.transport,
                url: URL,
            };
            interpret(&mut self.registry, &self.capture, origin, body, &mut out);
            out
        }

        fn open_client(&mut self) -> i64 {
            let out = self.send(json!({
                "jsonrpc": "2.0", "id": 1, "method": "openclient",
                "params": {
                    "appId": "web:shop.example",
                    "appKey": "MC0CFQD1tdTpaABkppmG",
                    "developerId": "bb57d8e1-f911-47ba-b510-693be162686a"
                }
            }));
            first(&out)["result"]["handle"].as_i64().unwrap()
        }

        fn open_device(&mut self, session: i64) -> i64 {
            let out = self.send(json!({
                "jsonrpc": "2.0", "id": 2, "method": "opendevice",
                "params": {"handle": session, "guid": "ABC"}
            }));
            first(&out)["result"]["handle"].as_i64().unwrap()
        }
    }

    fn first(out: &Outbox) -> Value {
        serde_json::to_value(&out.deliveries()[0].payload).unwrap()
    }

    #[test]
    fn open_client_replies_handle_and_activates() {
        let mut h = Harness::new();
        let out = h.send(json!({
            "jsonrpc": "2.0", "id": 1, "method": "openclient",
            "params": {
                "appId": "web:shop.example",
                "appKey": "key",
                "developerId": "bb57d8e1-f911-47ba-b510-693be162686a"
            }
        }));
        let reply = first(&out);
        assert_eq!(reply["id"], json!(1));
        assert!(reply["result"]["handle"].is_i64());
        assert_eq!(out.deliveries()[0].kind, DeliveryKind::Reply);
        // Snapshot replay of the seeded device follows the reply.
        let arrival = serde_json::to_value(&out.deliveries()[1].payload).unwrap();
        assert_eq!(arrival["result"]["event"]["id"], json!(1));
        assert!(h.registry.active().is_some());
    }

    #[test]
    fn open_client_without_id_echoes_default_id() {
        let mut h = Harness::new();
        let out = h.send(json!({
            "jsonrpc": "2.0", "method": "openclient",
            "params": {
                "appId": "web:shop.example",
                "appKey": "key",
                "developerId": "bb57d8e1-f911-47ba-b510-693be162686a"
            }
        }));
        let reply = first(&out);
        assert_eq!(reply["id"], json!("transport-openclient"));
        assert!(reply["result"]["handle"].is_i64());
    }

    #[test]
    fn open_client_with_missing_fields_is_invalid_parameter() {
        let mut h = Harness::new();
        let out = h.send(json!({"jsonrpc": "2.0", "id": 1, "method": "openclient", "params": {"appId": "web:x"}}));
        assert_eq!(first(&out)["error"]["code"], json!(ResultCode::INVALID_PARAMETER.0));
        assert!(h.registry.is_empty());
    }

    #[test]
    fn open_client_with_bad_identity_is_invalid_app_info() {
        let mut h = Harness::new();
        let out = h.send(json!({
            "jsonrpc": "2.0", "id": 1, "method": "openclient",
            "params": {"appId": "nocolon", "appKey": "k", "developerId": "bb57d8e1-f911-47ba-b510-693be162686a"}
        }));
        assert_eq!(first(&out)["error"]["code"], json!(ResultCode::INVALID_APP_INFO.0));
    }

    #[test]
    fn malformed_payload_gets_bare_error() {
        let mut h = Harness::new();
        let out = h.send_text("not json");
        let reply = first(&out);
        assert_eq!(reply["error"]["code"], json!(ResultCode::PARSE_ERROR.0));
        assert!(reply.get("id").is_none());
        assert_eq!(out.deliveries()[0].transport, h.transport);
    }

    #[test]
    fn unknown_method_is_malformed_json() {
        let mut h = Harness::new();
        let out = h.send(json!({"jsonrpc": "2.0", "id": 7, "method": "format"}));
        assert_eq!(first(&out)["error"]["code"], json!(ResultCode::PARSE_ERROR.0));
    }

    #[test]
    fn missing_handle_is_invalid_handle() {
        let mut h = Harness::new();
        let out = h.send(json!({"jsonrpc": "2.0", "id": 4, "method": "close", "params": {}}));
        let reply = first(&out);
        assert_eq!(reply["error"]["code"], json!(ResultCode::INVALID_HANDLE.0));
        assert_eq!(reply["error"]["data"]["handle"], json!(-1));
    }

    #[test]
    fn missing_id_goes_to_requester_not_active_session() {
        let mut h = Harness::new();
        let session = h.open_client();
        let other = TransportId::new();
        let mut out = Outbox::new();
        interpret(
            &mut h.registry,
            &h.capture,
            Origin { transport: other, url: "https://other.example/" },
            &json!({"jsonrpc": "2.0", "method": "close", "params": {"handle": session}}).to_string(),
            &mut out,
        );
        assert_eq!(out.deliveries().len(), 1);
        assert_eq!(out.deliveries()[0].transport, other);
        assert_eq!(first(&out)["error"]["code"], json!(ResultCode::INVALID_PARAMETER.0));
        assert!(h.registry.session(h.registry.active().unwrap()).is_some());
    }

    #[test]
    fn open_unknown_device_is_device_not_open() {
        let mut h = Harness::new();
        let session = h.open_client();
        let out = h.send(json!({
            "jsonrpc": "2.0", "id": 2, "method": "opendevice",
            "params": {"handle": session, "guid": "NOPE"}
        }));
        let reply = first(&out);
        assert_eq!(reply["error"]["code"], json!(ResultCode::DEVICE_NOT_OPEN.0));
        assert!(reply["error"]["message"].as_str().unwrap().contains("NOPE"));
    }

    #[test]
    fn open_device_then_close_session_invalidates_device() {
        let mut h = Harness::new();
        let session = h.open_client();
        let device = h.open_device(session);
        assert_ne!(device, session);

        let out = h.send(json!({"jsonrpc": "2.0", "id": 3, "method": "close", "params": {"handle": session}}));
        assert_eq!(first(&out), json!({"jsonrpc": "2.0", "id": 3, "result": 0}));

        let out = h.send(json!({
            "jsonrpc": "2.0", "id": 4, "method": "getproperty",
            "params": {"handle": device, "property": {"id": 1, "type": 2}}
        }));
        assert_eq!(first(&out)["error"]["code"], json!(ResultCode::INVALID_HANDLE.0));
        assert!(out.calls().is_empty());
    }

    #[test]
    fn close_device_keeps_session() {
        let mut h = Harness::new();
        let session = h.open_client();
        let device = h.open_device(session);
        let out = h.send(json!({"jsonrpc": "2.0", "id": 5, "method": "close", "params": {"handle": device}}));
        assert_eq!(first(&out)["result"], json!(0));
        assert_eq!(h.registry.len(), 1);
        assert_eq!(h.registry.resolve(device), None);
    }

    #[test]
    fn device_property_issues_call_against_guid() {
        let mut h = Harness::new();
        let session = h.open_client();
        let device = h.open_device(session);
        let out = h.send(json!({
            "jsonrpc": "2.0", "id": 6, "method": "getproperty",
            "params": {"handle": device, "property": {"id": 1, "type": 2}}
        }));
        assert!(out.deliveries().is_empty());
        assert_eq!(out.calls().len(), 1);
        assert_eq!(out.calls()[0].target, PropertyTarget::Device("ABC".into()));
    }

    #[test]
    fn session_property_targets_capture_layer() {
        let mut h = Harness::new();
        let session = h.open_client();
        let out = h.send(json!({
            "jsonrpc": "2.0", "id": 6, "method": "setproperty",
            "params": {"handle": session, "property": {"id": 9, "type": 5, "value": "Counter 2"}}
        }));
        assert_eq!(out.calls()[0].target, PropertyTarget::Capture);
    }

    #[test]
    fn unknown_property_type_is_invalid_parameter_without_call() {
        let mut h = Harness::new();
        let session = h.open_client();
        let device = h.open_device(session);
        let out = h.send(json!({
            "jsonrpc": "2.0", "id": 8, "method": "getproperty",
            "params": {"handle": device, "property": {"id": 1, "type": 99}}
        }));
        assert_eq!(first(&out)["error"]["code"], json!(ResultCode::INVALID_PARAMETER.0));
        assert!(out.calls().is_empty());
        assert_eq!(h.registry.len(), 1);
    }

    #[test]
    fn handle_from_other_transport_is_invalid() {
        let mut h = Harness::new();
        let session = h.open_client();
        let mut out = Outbox::new();
        interpret(
            &mut h.registry,
            &h.capture,
            Origin { transport: TransportId::new(), url: URL },
            &json!({"jsonrpc": "2.0", "id": 3, "method": "close", "params": {"handle": session}}).to_string(),
            &mut out,
        );
        assert_eq!(first(&out)["error"]["code"], json!(ResultCode::INVALID_HANDLE.0));
        assert_eq!(h.registry.len(), 1);
    }

    #[tokio::test]
    async fn property_call_completes_into_reply() {
        let mut h = Harness::new();
        let session = h.open_client();
        let out = h.send(json!({
            "jsonrpc": "2.0", "id": 11, "method": "setproperty",
            "params": {"handle": session, "property": {"id": 9, "type": 5, "value": "Counter 2"}}
        }));
        let (_, calls) = out.into_parts();
        let call = calls.into_iter().next().unwrap();
        let (pending, future) = call.start(&h.capture);
        let outcome = future.await;

        let mut out = Outbox::new();
        h.registry.complete_call(CallCompletion { call: pending, outcome }, &mut out);
        assert_eq!(
            first(&out),
            json!({"jsonrpc": "2.0", "id": 11, "result": {"handle": session}})
        );
    }

    #[test]
    fn request_version_is_echoed() {
        let mut h = Harness::new();
        let out = h.send(json!({"jsonrpc": "3.0", "id": 4, "method": "close", "params": {}}));
        assert_eq!(first(&out)["jsonrpc"], json!("3.0"));
    }
}
