//! Capture layer seam: the shared hardware capability.
//!
//! The broker never talks to a device SDK directly. It holds one
//! [`CaptureLayer`] for the whole process and receives hardware events on a
//! single [`CaptureEvent`] channel handed over at construction time.

pub mod simulated;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::rpc::error::{BrokerError, ResultCode};
use crate::rpc::property::Property;

/// Application identity presented by a page or by the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub app_id: String,
    pub app_key: String,
    pub developer_id: String,
}

impl AppInfo {
    /// Verify the identity against the embedding application.
    ///
    /// `app_id` is `<platform>:<identifier>`; when `bundle_id` is given the
    /// identifier must equal it.
    pub fn verify(&self, bundle_id: Option<&str>) -> bool {
        let Some((platform, identifier)) = self.app_id.split_once(':') else {
            return false;
        };
        if platform.is_empty() || identifier.is_empty() || self.app_key.trim().is_empty() {
            return false;
        }
        if uuid::Uuid::parse_str(&self.developer_id).is_err() {
            return false;
        }
        bundle_id.is_none_or(|bundle| bundle == identifier)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Device,
    /// A device manager (e.g. a contactless reader hub).
    Manager,
}

/// A connected device as known to the capture layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub guid: String,
    pub name: String,
    pub device_type: u32,
    pub kind: DeviceKind,
}

/// Where a property get/set is aimed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyTarget {
    /// The shared capability itself (global capture settings).
    Capture,
    /// One connected device, by GUID.
    Device(String),
}

/// `Ok(None)` means the layer reported success without a property, which
/// breaks its own contract.
pub type PropertyOutcome = Result<Option<Property>, ResultCode>;

/// A decoded scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedData {
    pub data: Vec<u8>,
    pub source_id: i32,
    pub source_name: String,
}

/// Hardware-originated event, in the order the layer raised it.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Error(ResultCode),
    DeviceArrival { device: DeviceInfo, result: ResultCode },
    DeviceRemoval { device: DeviceInfo, result: ResultCode },
    DeviceManagerArrival { device: DeviceInfo, result: ResultCode },
    DeviceManagerRemoval { device: DeviceInfo, result: ResultCode },
    PowerState { device: DeviceInfo, state: i32 },
    BatteryLevel { device: DeviceInfo, level: i32 },
    ButtonsState { device: DeviceInfo, state: i32 },
    DecodedData {
        device: DeviceInfo,
        data: Option<DecodedData>,
        result: ResultCode,
    },
}

pub type EventSender = mpsc::UnboundedSender<CaptureEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<CaptureEvent>;

/// Capability-providing hardware collaborator.
///
/// Property calls return `'static` futures so the broker loop can spawn
/// them and pick the outcome up later as a completion message.
pub trait CaptureLayer: Send + Sync {
    fn open(&self, app: &AppInfo) -> BoxFuture<'static, Result<(), ResultCode>>;

    fn close(&self) -> BoxFuture<'static, Result<(), ResultCode>>;

    /// Snapshot of connected devices and device managers.
    fn devices(&self) -> Vec<DeviceInfo>;

    fn get_property(
        &self,
        target: PropertyTarget,
        property: Property,
    ) -> BoxFuture<'static, PropertyOutcome>;

    fn set_property(
        &self,
        target: PropertyTarget,
        property: Property,
    ) -> BoxFuture<'static, PropertyOutcome>;

    fn find_device(&self, guid: &str) -> Option<DeviceInfo> {
        self.devices().into_iter().find(|d| d.guid == guid)
    }
}

/// Default number of additional open attempts after the first failure.
pub const DEFAULT_OPEN_RETRIES: u32 = 2;

/// Open the capture layer, retrying up to `retries` more times.
///
/// Returns the number of attempts used on success.
///
/// # Errors
///
/// [`BrokerError::CaptureOpenFailed`] with the last result code once the
/// budget is spent.
pub async fn open_with_retries(
    layer: &dyn CaptureLayer,
    app: &AppInfo,
    retries: u32,
) -> Result<u32, BrokerError> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match layer.open(app).await {
            Ok(()) => {
                tracing::info!(attempts, "capture layer opened");
                return Ok(attempts);
            }
            Err(code) if attempts <= retries => {
                tracing::warn!(%code, attempts, "failed to open capture, attempting again");
            }
            Err(code) => {
                tracing::error!(%code, attempts, "failed to open capture");
                return Err(BrokerError::CaptureOpenFailed { attempts, code });
            }
        }
    }
}

/// Close the capture layer on shutdown.
pub async fn close(layer: &dyn CaptureLayer) -> Result<(), BrokerError> {
    layer.close().await.map_err(BrokerError::CaptureCloseFailed)
}
