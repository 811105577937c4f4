//! Error taxonomy for the JSON-RPC surface and the daemon.
//!
//! Page-facing errors are converted to error envelopes and returned to the
//! originating session. Hardware result codes travel through
//! [`BrokerError::Capture`] untouched.

use serde::{Deserialize, Serialize};

/// Result code as reported by the capture layer.
///
/// Codes raised by the hardware are opaque to the broker and are forwarded
/// verbatim. The associated constants are the codes the broker itself
/// synthesizes or needs to recognize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultCode(pub i32);

impl ResultCode {
    pub const NO_ERROR: Self = Self(0);
    /// The user dismissed a capture overlay. Not a failure for decoded data.
    pub const CANCEL: Self = Self(1);
    pub const INVALID_HANDLE: Self = Self(-11);
    pub const NOT_SUPPORTED: Self = Self(-15);
    pub const NOT_FOUND: Self = Self(-17);
    pub const INVALID_PARAMETER: Self = Self(-18);
    #[cfg(test)]
    pub const UNABLE_TO_OPEN: Self = Self(-27);
    pub const DEVICE_NOT_OPEN: Self = Self(-47);
    pub const INVALID_APP_INFO: Self = Self(-85);
    pub const OUTDATED_VERSION: Self = Self(-92);
    /// JSON-RPC 2.0 parse error.
    pub const PARSE_ERROR: Self = Self(-32700);
    /// JSON-RPC 2.0 internal error.
    pub const INTERNAL_ERROR: Self = Self(-32603);

    pub fn is_success(self) -> bool {
        self == Self::NO_ERROR
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Broker errors.
///
/// Variants down to `MalformedCaptureProperty` are recoverable: they become
/// an error envelope for the page and never stop the broker.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BrokerError {
    #[error("The AppInfo parameters are invalid")]
    InvalidAppInfo,
    #[error("{0}")]
    InvalidHandle(&'static str),
    #[error("{0}")]
    InvalidParameter(String),
    #[error("There is no device with guid: {0} open at this time")]
    DeviceNotOpen(String),
    #[error("{0}")]
    MalformedJson(String),
    #[error("{0}")]
    MalformedCaptureProperty(String),
    #[error("{0}")]
    PropertyTypeNotSupported(String),
    /// Part of the code table; nothing gates on page versions.
    #[allow(dead_code)]
    #[error("{0}")]
    OutdatedVersion(String),
    /// Non-success result reported by the capture layer.
    #[error("{message}")]
    Capture { code: ResultCode, message: String },
    #[error("capture layer failed to open after {attempts} attempts (result {code})")]
    CaptureOpenFailed { attempts: u32, code: ResultCode },
    #[error("capture layer failed to close (result {0})")]
    CaptureCloseFailed(ResultCode),
}

impl BrokerError {
    /// Message used when a handle parameter is absent.
    pub const HANDLE_NOT_SPECIFIED: &'static str = "A handle was not specified";
    /// Message used when a handle resolves to nothing.
    pub const HANDLE_NOT_FOUND: &'static str = "There is no client or device with the specified handle. \
         The desired client or device may have been recently closed";

    /// Wire code for the error envelope.
    pub fn code(&self) -> ResultCode {
        match self {
            Self::InvalidAppInfo => ResultCode::INVALID_APP_INFO,
            Self::InvalidHandle(_) => ResultCode::INVALID_HANDLE,
            Self::InvalidParameter(_) => ResultCode::INVALID_PARAMETER,
            Self::DeviceNotOpen(_) => ResultCode::DEVICE_NOT_OPEN,
            Self::MalformedJson(_) => ResultCode::PARSE_ERROR,
            Self::MalformedCaptureProperty(_) => ResultCode::INTERNAL_ERROR,
            Self::PropertyTypeNotSupported(_) => ResultCode::NOT_SUPPORTED,
            Self::OutdatedVersion(_) => ResultCode::OUTDATED_VERSION,
            Self::Capture { code, .. } => *code,
            Self::CaptureOpenFailed { code, .. } => *code,
            Self::CaptureCloseFailed(code) => *code,
        }
    }

    pub fn invalid_parameter() -> Self {
        Self::InvalidParameter(
            "There is a missing or invalid property in the JSON-RPC that is required".into(),
        )
    }
}
