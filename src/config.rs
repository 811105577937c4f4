//! Daemon configuration assembled from CLI flags and environment.

use std::path::PathBuf;

use crate::capture::{AppInfo, DeviceInfo, DeviceKind};

/// Socket directory under `$XDG_RUNTIME_DIR`.
const SOCKET_DIR: &str = "capbroker";
const SOCKET_NAME: &str = "broker.sock";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("$XDG_RUNTIME_DIR is not set and no --socket given")]
    NoRuntimeDir,
}

/// Everything the broker daemon needs to start.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub socket_path: PathBuf,
    /// Identity of the embedding application, used to open the capture layer.
    pub app_info: AppInfo,
    /// When set, page app ids must name this identifier.
    pub bundle_id: Option<String>,
    pub open_retries: u32,
    /// Devices present in the simulated capture layer at startup.
    pub devices: Vec<DeviceInfo>,
}

/// Resolve the broker socket path.
///
/// An explicit path wins; otherwise `$XDG_RUNTIME_DIR/capbroker/broker.sock`.
pub fn resolve_socket_path(explicit: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR").ok_or(ConfigError::NoRuntimeDir)?;
    Ok(PathBuf::from(runtime_dir).join(SOCKET_DIR).join(SOCKET_NAME))
}

/// Parse a `GUID=NAME` device entry.
///
/// Used as a clap value parser, hence the `String` error.
pub fn parse_device(entry: &str) -> Result<DeviceInfo, String> {
    let (guid, name) = entry
        .split_once('=')
        .ok_or_else(|| format!("expected GUID=NAME, got {entry:?}"))?;
    let (guid, name) = (guid.trim(), name.trim());
    if guid.is_empty() || name.is_empty() {
        return Err(format!("expected GUID=NAME, got {entry:?}"));
    }
    Ok(DeviceInfo {
        guid: guid.to_owned(),
        name: name.to_owned(),
        device_type: 0,
        kind: DeviceKind::Device,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_socket_wins() {
        let path = resolve_socket_path(Some(PathBuf::from("/tmp/x.sock"))).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/x.sock"));
    }

    #[test]
    fn device_entry_parses() {
        let device = parse_device("1F2E3D=Socket S740").unwrap();
        assert_eq!(device.guid, "1F2E3D");
        assert_eq!(device.name, "Socket S740");
        assert_eq!(device.kind, DeviceKind::Device);
    }

    #[test]
    fn device_entry_needs_both_parts() {
        assert!(parse_device("ABC").is_err());
        assert!(parse_device("=name").is_err());
        assert!(parse_device("ABC=").is_err());
    }
}
