//! In-memory capture layer.
//!
//! Backs the daemon when no hardware SDK is linked and drives the broker
//! tests. Cloning shares the same device table and event channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, ready};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{
    AppInfo, CaptureEvent, CaptureLayer, DecodedData, DeviceInfo, DeviceKind, EventReceiver,
    EventSender, PropertyOutcome, PropertyTarget,
};
use crate::rpc::error::ResultCode;
use crate::rpc::property::Property;

/// A hardware happening to raise on the simulated layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SimulateAction {
    Connect {
        guid: String,
        name: String,
        #[serde(default)]
        device_type: u32,
        #[serde(default)]
        manager: bool,
    },
    Disconnect {
        guid: String,
    },
    /// `data` is sent as its UTF-8 bytes.
    Scan {
        guid: String,
        data: String,
        #[serde(default)]
        source_id: i32,
        #[serde(default)]
        source_name: String,
    },
    Power {
        guid: String,
        state: i32,
    },
    Battery {
        guid: String,
        level: i32,
    },
    Buttons {
        guid: String,
        state: i32,
    },
    Error {
        code: i32,
    },
}

#[derive(Default)]
struct Inner {
    devices: Vec<DeviceInfo>,
    properties: HashMap<(PropertyTarget, i32), Property>,
    scripted: HashMap<i32, PropertyOutcome>,
    failing_opens: u32,
    open_failure: ResultCode,
    open_attempts: u32,
    close_failure: Option<ResultCode>,
}

#[derive(Clone)]
pub struct SimulatedCapture {
    inner: Arc<Mutex<Inner>>,
    events: EventSender,
}

impl SimulatedCapture {
    pub fn new() -> (Self, EventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let layer = Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            events,
        };
        (layer, rx)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raise an arbitrary event on the bus.
    pub fn emit(&self, event: CaptureEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("capture event dropped, broker gone");
        }
    }

    /// Register a device without announcing it.
    pub fn seed(&self, device: DeviceInfo) {
        let mut inner = self.lock();
        inner.devices.retain(|d| d.guid != device.guid);
        inner.devices.push(device);
    }

    /// Register a device and raise its arrival event.
    pub fn connect(&self, device: DeviceInfo) {
        self.seed(device.clone());
        let result = ResultCode::NO_ERROR;
        self.emit(match device.kind {
            DeviceKind::Device => CaptureEvent::DeviceArrival { device, result },
            DeviceKind::Manager => CaptureEvent::DeviceManagerArrival { device, result },
        });
    }

    /// Forget a device and raise its removal event. Unknown GUIDs are ignored.
    pub fn disconnect(&self, guid: &str) {
        let removed = {
            let mut inner = self.lock();
            let pos = inner.devices.iter().position(|d| d.guid == guid);
            pos.map(|i| inner.devices.remove(i))
        };
        let Some(device) = removed else {
            return;
        };
        let result = ResultCode::NO_ERROR;
        self.emit(match device.kind {
            DeviceKind::Device => CaptureEvent::DeviceRemoval { device, result },
            DeviceKind::Manager => CaptureEvent::DeviceManagerRemoval { device, result },
        });
    }

    /// Raise a successful decoded-data event for a known device.
    pub fn scan(&self, guid: &str, data: DecodedData) {
        let Some(device) = self.find_device(guid) else {
            tracing::warn!(guid, "scan on unknown device ignored");
            return;
        };
        self.emit(CaptureEvent::DecodedData {
            device,
            data: Some(data),
            result: ResultCode::NO_ERROR,
        });
    }

    pub fn power(&self, guid: &str, state: i32) {
        if let Some(device) = self.known(guid, "power") {
            self.emit(CaptureEvent::PowerState { device, state });
        }
    }

    pub fn battery(&self, guid: &str, level: i32) {
        if let Some(device) = self.known(guid, "battery") {
            self.emit(CaptureEvent::BatteryLevel { device, level });
        }
    }

    pub fn buttons(&self, guid: &str, state: i32) {
        if let Some(device) = self.known(guid, "buttons") {
            self.emit(CaptureEvent::ButtonsState { device, state });
        }
    }

    /// Raise a layer-wide error report.
    pub fn raise_error(&self, code: ResultCode) {
        self.emit(CaptureEvent::Error(code));
    }

    /// Perform one simulated hardware action.
    pub fn apply(&self, action: SimulateAction) {
        tracing::debug!(?action, "simulated hardware action");
        match action {
            SimulateAction::Connect {
                guid,
                name,
                device_type,
                manager,
            } => self.connect(DeviceInfo {
                guid,
                name,
                device_type,
                kind: if manager { DeviceKind::Manager } else { DeviceKind::Device },
            }),
            SimulateAction::Disconnect { guid } => self.disconnect(&guid),
            SimulateAction::Scan {
                guid,
                data,
                source_id,
                source_name,
            } => self.scan(
                &guid,
                DecodedData {
                    data: data.into_bytes(),
                    source_id,
                    source_name,
                },
            ),
            SimulateAction::Power { guid, state } => self.power(&guid, state),
            SimulateAction::Battery { guid, level } => self.battery(&guid, level),
            SimulateAction::Buttons { guid, state } => self.buttons(&guid, state),
            SimulateAction::Error { code } => self.raise_error(ResultCode(code)),
        }
    }

    fn find_device(&self, guid: &str) -> Option<DeviceInfo> {
        self.lock().devices.iter().find(|d| d.guid == guid).cloned()
    }

    fn known(&self, guid: &str, event: &str) -> Option<DeviceInfo> {
        let device = self.find_device(guid);
        if device.is_none() {
            tracing::warn!(guid, event, "event on unknown device ignored");
        }
        device
    }

    /// Make the next `count` open attempts fail with `code`.
    #[cfg(test)]
    pub fn fail_opens(&self, count: u32, code: ResultCode) {
        let mut inner = self.lock();
        inner.failing_opens = count;
        inner.open_failure = code;
    }

    #[cfg(test)]
    pub fn fail_close(&self, code: ResultCode) {
        self.lock().close_failure = Some(code);
    }

    #[cfg(test)]
    pub fn open_attempts(&self) -> u32 {
        self.lock().open_attempts
    }

    /// Answer every get/set of property `id` with `outcome`.
    #[cfg(test)]
    pub fn script(&self, id: i32, outcome: PropertyOutcome) {
        self.lock().scripted.insert(id, outcome);
    }

    /// Store a property so later gets return it.
    #[cfg(test)]
    pub fn store(&self, target: PropertyTarget, property: Property) {
        self.lock().properties.insert((target, property.id), property);
    }

    fn target_exists(inner: &Inner, target: &PropertyTarget) -> bool {
        match target {
            PropertyTarget::Capture => true,
            PropertyTarget::Device(guid) => inner.devices.iter().any(|d| &d.guid == guid),
        }
    }
}

impl CaptureLayer for SimulatedCapture {
    fn open(&self, _app: &AppInfo) -> BoxFuture<'static, Result<(), ResultCode>> {
        let mut inner = self.lock();
        inner.open_attempts += 1;
        tracing::debug!(attempt = inner.open_attempts, "simulated capture open");
        let outcome = if inner.failing_opens > 0 {
            inner.failing_opens -= 1;
            Err(inner.open_failure)
        } else {
            Ok(())
        };
        ready(outcome).boxed()
    }

    fn close(&self) -> BoxFuture<'static, Result<(), ResultCode>> {
        let outcome = match self.lock().close_failure {
            Some(code) => Err(code),
            None => Ok(()),
        };
        ready(outcome).boxed()
    }

    fn devices(&self) -> Vec<DeviceInfo> {
        self.lock().devices.clone()
    }

    fn get_property(
        &self,
        target: PropertyTarget,
        property: Property,
    ) -> BoxFuture<'static, PropertyOutcome> {
        let inner = self.lock();
        let outcome = if let Some(scripted) = inner.scripted.get(&property.id) {
            scripted.clone()
        } else if !Self::target_exists(&inner, &target) {
            Err(ResultCode::NOT_FOUND)
        } else {
            inner
                .properties
                .get(&(target, property.id))
                .cloned()
                .map(Some)
                .ok_or(ResultCode::NOT_SUPPORTED)
        };
        ready(outcome).boxed()
    }

    fn set_property(
        &self,
        target: PropertyTarget,
        property: Property,
    ) -> BoxFuture<'static, PropertyOutcome> {
        let mut inner = self.lock();
        let outcome = if let Some(scripted) = inner.scripted.get(&property.id) {
            scripted.clone()
        } else if !Self::target_exists(&inner, &target) {
            Err(ResultCode::NOT_FOUND)
        } else {
            inner
                .properties
                .insert((target, property.id), property.clone());
            Ok(Some(property))
        };
        ready(outcome).boxed()
    }
}
