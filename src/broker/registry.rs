//! Session registry: sessions, active pointer, handle namespace.
//!
//! Owned by [`super::state::BrokerState`]. Lookups return `None` rather than
//! failing; callers turn absence into `InvalidHandle`.

use std::collections::BTreeMap;

use super::fanout;
use super::handle::{DeviceHandle, HandleAllocator, SessionHandle};
use super::outbox::{CallCompletion, Outbox};
use super::session::{DeviceBinding, Session};
use super::transport::TransportId;
use crate::capture::{AppInfo, DeviceInfo};
use crate::rpc::envelope::{DEFAULT_JSONRPC_VERSION, RequestId};
use crate::rpc::error::BrokerError;

/// What a raw handle from a page refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    Session(SessionHandle),
    Device(SessionHandle, DeviceHandle),
}

impl Resolved {
    pub fn session(self) -> SessionHandle {
        match self {
            Self::Session(session) | Self::Device(session, _) => session,
        }
    }
}

#[derive(Debug)]
pub struct Registry {
    sessions: BTreeMap<SessionHandle, Session>,
    active: Option<SessionHandle>,
    /// Active session before the last activation.
    previous_active: Option<SessionHandle>,
    handles: HandleAllocator,
    /// Last protocol version tag announced by a page.
    rpc_version: String,
    bundle_id: Option<String>,
}

impl Registry {
    pub fn new(bundle_id: Option<String>) -> Self {
        Self::with_allocator(HandleAllocator::new(), bundle_id)
    }

    pub fn with_allocator(handles: HandleAllocator, bundle_id: Option<String>) -> Self {
        Self {
            sessions: BTreeMap::new(),
            active: None,
            previous_active: None,
            handles,
            rpc_version: DEFAULT_JSONRPC_VERSION.to_owned(),
            bundle_id,
        }
    }

    pub fn rpc_version(&self) -> &str {
        &self.rpc_version
    }

    pub fn note_rpc_version(&mut self, version: &str) {
        if version != self.rpc_version {
            tracing::debug!(version, "page protocol version noted");
            self.rpc_version = version.to_owned();
        }
    }

    // -- Lifecycle --

    /// Verify `app` and record a new, inactive session.
    pub fn open_session(
        &mut self,
        app: AppInfo,
        transport: TransportId,
        url: String,
    ) -> Result<SessionHandle, BrokerError> {
        if !app.verify(self.bundle_id.as_deref()) {
            tracing::warn!(app_id = %app.app_id, url = %url, "app info failed verification");
            return Err(BrokerError::InvalidAppInfo);
        }
        let handle = self.handles.session(self.sessions.len());
        self.sessions.insert(handle, Session::new(handle, app, url, transport));
        tracing::info!(%handle, ?transport, "session opened");
        Ok(handle)
    }

    /// Make `handle` the active session.
    ///
    /// The previous active session is suspended first. The new one is sent
    /// the current device snapshot and resumes ownership of its devices.
    /// Returns `false` for unknown handles.
    pub fn activate(&mut self, handle: SessionHandle, devices: &[DeviceInfo], out: &mut Outbox) -> bool {
        if !self.sessions.contains_key(&handle) {
            return false;
        }
        if self.active == Some(handle) {
            return true;
        }
        if let Some(previous) = self.active_session() {
            previous.suspend(&self.rpc_version, out);
        }
        self.previous_active = self.active;
        self.active = Some(handle);
        if let Some(session) = self.sessions.get(&handle) {
            fanout::resend_device_arrival_events(session, devices, &self.rpc_version, out);
            tracing::info!(%handle, app_id = %session.app_info().app_id, "session activated");
        }
        true
    }

    /// Suspend the active session and clear the pointer.
    pub fn resign_active(&mut self, out: &mut Outbox) {
        if let Some(active) = self.active_session() {
            active.suspend(&self.rpc_version, out);
            tracing::info!(handle = %active.handle(), "active session resigned");
        }
        self.previous_active = self.active.take();
    }

    /// Remove a session. No other session is promoted.
    pub fn close_and_delete(&mut self, handle: SessionHandle) -> Option<Session> {
        let session = self.sessions.remove(&handle)?;
        if self.active == Some(handle) {
            self.active = None;
        }
        if self.previous_active == Some(handle) {
            self.previous_active = None;
        }
        tracing::info!(%handle, "session closed");
        Some(session)
    }

    /// Remove every session opened through `transport`.
    pub fn close_transport(&mut self, transport: TransportId) -> Vec<SessionHandle> {
        let doomed: Vec<SessionHandle> = self
            .sessions
            .values()
            .filter(|s| s.transport() == transport)
            .map(Session::handle)
            .collect();
        for handle in &doomed {
            self.close_and_delete(*handle);
        }
        doomed
    }

    // -- Lookups --

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn session(&self, handle: SessionHandle) -> Option<&Session> {
        self.sessions.get(&handle)
    }

    pub fn session_mut(&mut self, handle: SessionHandle) -> Option<&mut Session> {
        self.sessions.get_mut(&handle)
    }

    /// Newest session opened by `url` through `transport`.
    pub fn session_by_url(&self, transport: TransportId, url: &str) -> Option<&Session> {
        self.sessions
            .values()
            .rev()
            .find(|s| s.transport() == transport && s.url() == url)
    }

    pub fn device_binding(&self, raw: i64) -> Option<(&Session, &DeviceBinding)> {
        self.sessions.values().find_map(|s| {
            let handle = s.find_device_handle(raw)?;
            s.binding(handle).map(|b| (s, b))
        })
    }

    /// Resolve a raw handle: sessions first, then device bindings.
    pub fn resolve(&self, raw: i64) -> Option<Resolved> {
        if let Some(session) = self.sessions.values().find(|s| s.handle().raw() == raw) {
            return Some(Resolved::Session(session.handle()));
        }
        self.device_binding(raw)
            .map(|(session, binding)| Resolved::Device(session.handle(), binding.handle()))
    }

    #[cfg(test)]
    pub fn active(&self) -> Option<SessionHandle> {
        self.active
    }

    pub fn active_session(&self) -> Option<&Session> {
        self.sessions.get(&self.active?)
    }

    #[cfg(test)]
    pub fn previous_active(&self) -> Option<SessionHandle> {
        self.previous_active
    }

    // -- Device ownership --

    /// Open `device` for `handle` and revoke it from every other session
    /// holding a binding for the same GUID, the previously active session
    /// first. Those bindings are kept.
    pub fn open_device(
        &mut self,
        handle: SessionHandle,
        device: DeviceInfo,
        id: Option<RequestId>,
        out: &mut Outbox,
    ) -> Option<DeviceHandle> {
        let population = self.sessions.len();
        let guid = device.guid.clone();
        let handles = &mut self.handles;
        let session = self.sessions.get_mut(&handle)?;
        let opened = session.open_device(device, || handles.device(population), &self.rpc_version, id, out);

        let previous = self.previous_active.filter(|p| *p != handle);
        let others = self
            .sessions
            .keys()
            .copied()
            .filter(|h| *h != handle && Some(*h) != previous);
        let holders: Vec<SessionHandle> = previous.into_iter().chain(others).collect();
        for other in holders.iter().filter_map(|h| self.sessions.get(h)) {
            if let Some(binding) = other.binding_for_guid(&guid) {
                tracing::info!(from = %other.handle(), to = %handle, %guid, "device ownership moved");
                other.change_ownership(binding.handle(), false, &self.rpc_version, out);
            }
        }
        Some(opened)
    }

    /// Deliver a finished property call to its session, if it still exists.
    pub fn complete_call(&self, completion: CallCompletion, out: &mut Outbox) {
        match self.sessions.get(&completion.call.session) {
            Some(session) => session.complete_call(completion, &self.rpc_version, out),
            None => {
                tracing::debug!(session = %completion.call.session, "session gone, dropping property reply");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::DeviceKind;
    use crate::rpc::envelope::Response;
    use crate::broker::session::DISOWNED_ID;
    use serde_json::{Value, json};
    use std::collections::HashSet;

    fn frozen() -> i64 {
        5_000
    }

    fn registry() -> Registry {
        Registry::with_allocator(HandleAllocator::with_clock(frozen), None)
    }

    fn app() -> AppInfo {
        AppInfo {
            app_id: "web:shop.example".into(),
            app_key: "key".into(),
            developer_id: "bb57d8e1-f911-47ba-b510-693be162686a".into(),
        }
    }

    fn device(guid: &str) -> DeviceInfo {
        DeviceInfo {
            guid: guid.into(),
            name: "S740".into(),
            device_type: 3,
            kind: DeviceKind::Device,
        }
    }

    fn values(out: &Outbox) -> Vec<Value> {
        out.deliveries()
            .iter()
            .map(|d| serde_json::to_value(&d.payload).unwrap())
            .collect()
    }

    fn ownership_for(out: &Outbox, transport: TransportId) -> Vec<Value> {
        out.deliveries()
            .iter()
            .filter(|d| d.transport == transport)
            .map(|d| serde_json::to_value(&d.payload).unwrap())
            .filter(|v| v["result"]["event"]["id"] == json!(10))
            .map(|v| v["result"]["event"]["value"].clone())
            .collect()
    }

    #[test]
    fn session_handles_are_unique() {
        let mut r = registry();
        let t = TransportId::new();
        let mut seen = HashSet::new();
        for i in 0..200 {
            let h = r.open_session(app(), t, format!("https://p{i}.example/")).unwrap();
            assert!(seen.insert(h));
        }
    }

    #[test]
    fn unverifiable_app_info_rejected() {
        let mut r = Registry::with_allocator(
            HandleAllocator::with_clock(frozen),
            Some("com.example.other".into()),
        );
        let err = r.open_session(app(), TransportId::new(), "https://a/".into()).unwrap_err();
        assert_eq!(err, BrokerError::InvalidAppInfo);
        assert!(r.is_empty());
    }

    #[test]
    fn open_session_does_not_activate() {
        let mut r = registry();
        r.open_session(app(), TransportId::new(), "https://a/".into()).unwrap();
        assert_eq!(r.active(), None);
    }

    #[test]
    fn activation_suspends_previous_before_promoting() {
        let mut r = registry();
        let (ta, tb) = (TransportId::new(), TransportId::new());
        let a = r.open_session(app(), ta, "https://a/".into()).unwrap();
        let b = r.open_session(app(), tb, "https://b/".into()).unwrap();
        let mut out = Outbox::new();
        r.activate(a, &[], &mut out);
        r.open_device(a, device("ABC"), None, &mut out);
        r.open_device(b, device("XYZ"), None, &mut out);

        let mut out = Outbox::new();
        assert!(r.activate(b, &[], &mut out));
        assert_eq!(r.active(), Some(b));
        assert_eq!(r.previous_active(), Some(a));

        let first = &out.deliveries()[0];
        assert_eq!(first.transport, ta);
        assert_eq!(ownership_for(&out, ta), vec![json!(DISOWNED_ID)]);
        let b_owner = r.session(b).unwrap().ownership_id().to_owned();
        assert_eq!(ownership_for(&out, tb), vec![json!(b_owner)]);
    }

    #[test]
    fn activation_replays_device_snapshot() {
        let mut r = registry();
        let t = TransportId::new();
        let a = r.open_session(app(), t, "https://a/".into()).unwrap();
        let mut manager = device("MGR");
        manager.kind = DeviceKind::Manager;
        let mut out = Outbox::new();
        r.activate(a, &[device("ABC"), manager], &mut out);

        let events: Vec<Value> = values(&out)
            .into_iter()
            .map(|v| v["result"]["event"]["id"].clone())
            .collect();
        assert_eq!(events, vec![json!(1), json!(11)]);
    }

    #[test]
    fn resign_clears_active() {
        let mut r = registry();
        let t = TransportId::new();
        let a = r.open_session(app(), t, "https://a/".into()).unwrap();
        let mut out = Outbox::new();
        r.activate(a, &[], &mut out);
        r.open_device(a, device("ABC"), None, &mut out);

        let mut out = Outbox::new();
        r.resign_active(&mut out);
        assert_eq!(r.active(), None);
        assert_eq!(ownership_for(&out, t), vec![json!(DISOWNED_ID)]);
    }

    #[test]
    fn closing_active_promotes_nobody() {
        let mut r = registry();
        let t = TransportId::new();
        let a = r.open_session(app(), t, "https://a/".into()).unwrap();
        let b = r.open_session(app(), t, "https://b/".into()).unwrap();
        let mut out = Outbox::new();
        r.activate(a, &[], &mut out);
        r.activate(b, &[], &mut out);
        r.close_and_delete(b);
        assert_eq!(r.active(), None);
        assert!(r.session(b).is_none());
        assert!(r.session(a).is_some());
    }

    #[test]
    fn handoff_revokes_without_deleting() {
        let mut r = registry();
        let (ta, tb) = (TransportId::new(), TransportId::new());
        let a = r.open_session(app(), ta, "https://a/".into()).unwrap();
        let b = r.open_session(app(), tb, "https://b/".into()).unwrap();
        let mut out = Outbox::new();
        let da = r.open_device(a, device("ABC"), None, &mut out).unwrap();

        let mut out = Outbox::new();
        let db = r.open_device(b, device("ABC"), None, &mut out).unwrap();
        assert_ne!(da, db);
        assert_eq!(ownership_for(&out, ta), vec![json!(DISOWNED_ID)]);
        assert!(r.session(a).unwrap().binding(da).is_some());
        assert_eq!(r.resolve(db.raw()), Some(Resolved::Device(b, db)));
    }

    #[test]
    fn handoff_revokes_previous_active_first() {
        let mut r = registry();
        let (ta, tb, tc) = (TransportId::new(), TransportId::new(), TransportId::new());
        let c = r.open_session(app(), tc, "https://c/".into()).unwrap();
        let a = r.open_session(app(), ta, "https://a/".into()).unwrap();
        let b = r.open_session(app(), tb, "https://b/".into()).unwrap();
        let mut out = Outbox::new();
        r.open_device(c, device("ABC"), None, &mut out);
        r.activate(a, &[], &mut out);
        r.open_device(a, device("ABC"), None, &mut out);
        r.activate(b, &[], &mut out);
        assert_eq!(r.previous_active(), Some(a));

        let mut out = Outbox::new();
        r.open_device(b, device("ABC"), None, &mut out);
        let revoked: Vec<TransportId> = out
            .deliveries()
            .iter()
            .filter(|d| d.transport != tb)
            .map(|d| d.transport)
            .collect();
        assert_eq!(revoked, vec![ta, tc]);
    }

    #[test]
    fn handoff_skips_previous_active_when_it_is_the_opener() {
        let mut r = registry();
        let (ta, tb) = (TransportId::new(), TransportId::new());
        let a = r.open_session(app(), ta, "https://a/".into()).unwrap();
        let b = r.open_session(app(), tb, "https://b/".into()).unwrap();
        let mut out = Outbox::new();
        r.open_device(b, device("ABC"), None, &mut out);
        r.activate(a, &[], &mut out);
        r.resign_active(&mut out);
        assert_eq!(r.previous_active(), Some(a));

        let mut out = Outbox::new();
        r.open_device(a, device("ABC"), None, &mut out);
        assert_eq!(ownership_for(&out, tb), vec![json!(DISOWNED_ID)]);
        assert_eq!(ownership_for(&out, ta).len(), 1);
    }

    #[test]
    fn resolve_is_flat() {
        let mut r = registry();
        let t = TransportId::new();
        let a = r.open_session(app(), t, "https://a/".into()).unwrap();
        let mut out = Outbox::new();
        let d = r.open_device(a, device("ABC"), None, &mut out).unwrap();
        assert_eq!(r.resolve(a.raw()), Some(Resolved::Session(a)));
        assert_eq!(r.resolve(d.raw()), Some(Resolved::Device(a, d)));
        assert_eq!(r.resolve(-3), None);
    }

    #[test]
    fn lookup_by_url_is_scoped_to_transport() {
        let mut r = registry();
        let (t1, t2) = (TransportId::new(), TransportId::new());
        let a = r.open_session(app(), t1, "https://a/".into()).unwrap();
        assert_eq!(r.session_by_url(t1, "https://a/").map(Session::handle), Some(a));
        assert!(r.session_by_url(t2, "https://a/").is_none());
    }

    #[test]
    fn lookup_by_url_prefers_newest_session() {
        let mut r = registry();
        let t = TransportId::new();
        let first = r.open_session(app(), t, "https://a/".into()).unwrap();
        let second = r.open_session(app(), t, "https://a/".into()).unwrap();
        assert!(second > first);
        assert_eq!(r.session_by_url(t, "https://a/").map(Session::handle), Some(second));
    }

    #[test]
    fn closing_transport_removes_its_sessions() {
        let mut r = registry();
        let (t1, t2) = (TransportId::new(), TransportId::new());
        let a = r.open_session(app(), t1, "https://a/".into()).unwrap();
        let b = r.open_session(app(), t1, "https://b/".into()).unwrap();
        let c = r.open_session(app(), t2, "https://c/".into()).unwrap();
        let closed = r.close_transport(t1);
        assert_eq!(closed, vec![a, b]);
        assert_eq!(r.len(), 1);
        assert!(r.session(c).is_some());
    }

    #[test]
    fn version_tag_follows_pages() {
        let mut r = registry();
        assert_eq!(r.rpc_version(), "2.0");
        r.note_rpc_version("2.1");
        let resp = Response::handle(r.rpc_version(), None, 1);
        assert_eq!(resp.jsonrpc, "2.1");
    }
}
