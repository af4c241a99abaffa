//! Error types for PTP connection, transport and transaction failures.

use crate::ptp::codes::{self, ResponseCode};

pub type PtpResult<T> = Result<T, PtpError>;

/// Error types for PTP operations.
///
/// Variants are grouped by where they originate: transport setup and I/O,
/// protocol-level response codes and framing, timeouts, and payload downloads.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum PtpError {
    // ---- Transport ----
    /// Generic transport failure (socket or USB error that fits nothing more specific).
    Transport { message: String },
    /// The USB device exposes no still-image (6, 1, 1) interface.
    NoPtpInterface { device_id: String },
    /// The still-image interface exists but could not be claimed.
    ClaimFailed { device_id: String, message: String },
    /// The OS refused access to the device.
    PermissionDenied { device_id: String },
    /// Required endpoints or channels are missing.
    SetupFailed { message: String },
    /// The camera refused the TCP connection.
    ConnectionRefused { address: String },
    /// The PTP/IP responder answered the init handshake with INIT_FAIL.
    HandshakeFailed { reason: u32 },
    /// A bulk or socket transfer failed mid-way.
    TransferFailed { message: String },
    /// The device went away (unplugged, socket closed by peer).
    Disconnected,

    // ---- Protocol ----
    /// Corrupt or undersized container / dataset.
    MalformedContainer { reason: String },
    /// Device answered DeviceBusy (0x2019).
    DeviceBusy,
    /// Device answered GeneralError (0x2002).
    GeneralError,
    /// Device answered SessionNotOpen (0x2003).
    SessionNotOpen,
    /// OpenSession was rejected.
    OpenSessionFailed { code: u16 },
    /// Any other non-OK response code.
    Response { code: u16, operation: u16 },
    /// Data phase ended short of the declared length (below the degraded-data threshold).
    IncompleteData { received: u64, expected: u64 },

    // ---- Timeout ----
    /// No answer within the operation-scoped timeout.
    Timeout { operation: String },

    // ---- Download ----
    /// Object payload could not be fetched in full. Never degraded.
    DownloadFailed { handle: u32, reason: String },

    // ---- Usage ----
    /// No live connection.
    NotConnected,
}

/// Coarse grouping used by callers that only care about the kind of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transport,
    Protocol,
    Timeout,
    Download,
    Usage,
}

impl PtpError {
    /// Maps a non-OK response code to an error.
    pub fn from_response_code(code: u16, operation: u16) -> Self {
        match ResponseCode::from_u16(code) {
            Some(ResponseCode::GeneralError) => Self::GeneralError,
            Some(ResponseCode::SessionNotOpen) => Self::SessionNotOpen,
            Some(ResponseCode::DeviceBusy) => Self::DeviceBusy,
            _ => Self::Response { code, operation },
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedContainer { reason: reason.into() }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Returns true if the transaction engine may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::TransferFailed { .. }
                | Self::MalformedContainer { .. }
                | Self::IncompleteData { .. }
                | Self::DeviceBusy
                | Self::GeneralError
                | Self::SessionNotOpen
        )
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transport { .. }
            | Self::NoPtpInterface { .. }
            | Self::ClaimFailed { .. }
            | Self::PermissionDenied { .. }
            | Self::SetupFailed { .. }
            | Self::ConnectionRefused { .. }
            | Self::HandshakeFailed { .. }
            | Self::TransferFailed { .. }
            | Self::Disconnected => ErrorCategory::Transport,
            Self::MalformedContainer { .. }
            | Self::DeviceBusy
            | Self::GeneralError
            | Self::SessionNotOpen
            | Self::OpenSessionFailed { .. }
            | Self::Response { .. }
            | Self::IncompleteData { .. } => ErrorCategory::Protocol,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::DownloadFailed { .. } => ErrorCategory::Download,
            Self::NotConnected => ErrorCategory::Usage,
        }
    }

    /// Returns a user-friendly message for this error.
    pub fn user_message(&self) -> String {
        match self {
            Self::NoPtpInterface { .. } => "This USB device doesn't look like a camera (no PTP interface).".to_string(),
            Self::ClaimFailed { .. } => {
                "Another app is using the camera. Close other photo apps and try again.".to_string()
            }
            Self::PermissionDenied { .. } => "Permission to access the camera was denied.".to_string(),
            Self::ConnectionRefused { .. } | Self::HandshakeFailed { .. } => {
                "The camera refused the connection. Check that WiFi transfer is enabled on the camera.".to_string()
            }
            Self::Disconnected => "The camera was disconnected. Reconnect it to continue.".to_string(),
            Self::Timeout { .. } => "The camera didn't answer in time. It may be asleep or busy. Try again.".to_string(),
            Self::DeviceBusy => "The camera is busy. Wait a moment and try again.".to_string(),
            Self::DownloadFailed { .. } => "The photo couldn't be downloaded completely. Try again.".to_string(),
            Self::NotConnected => "No camera is connected.".to_string(),
            other => format!("Camera error: {other}"),
        }
    }
}

impl std::fmt::Display for PtpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport { message } => write!(f, "Transport error: {message}"),
            Self::NoPtpInterface { device_id } => write!(f, "No PTP interface on device {device_id}"),
            Self::ClaimFailed { device_id, message } => {
                write!(f, "Couldn't claim PTP interface on {device_id}: {message}")
            }
            Self::PermissionDenied { device_id } => write!(f, "Permission denied for device {device_id}"),
            Self::SetupFailed { message } => write!(f, "Transport setup failed: {message}"),
            Self::ConnectionRefused { address } => write!(f, "Connection refused by {address}"),
            Self::HandshakeFailed { reason } => write!(f, "PTP/IP init rejected (reason 0x{reason:08x})"),
            Self::TransferFailed { message } => write!(f, "Transfer failed: {message}"),
            Self::Disconnected => write!(f, "Device disconnected"),
            Self::MalformedContainer { reason } => write!(f, "Malformed container: {reason}"),
            Self::DeviceBusy => write!(f, "Device busy"),
            Self::GeneralError => write!(f, "Device reported GeneralError"),
            Self::SessionNotOpen => write!(f, "Session not open"),
            Self::OpenSessionFailed { code } => {
                write!(f, "OpenSession failed: {} (0x{code:04x})", codes::response_name(*code))
            }
            Self::Response { code, operation } => write!(
                f,
                "{} failed: {} (0x{code:04x})",
                codes::operation_name(*operation),
                codes::response_name(*code)
            ),
            Self::IncompleteData { received, expected } => {
                write!(f, "Incomplete data phase: {received} of {expected} bytes")
            }
            Self::Timeout { operation } => write!(f, "Timed out: {operation}"),
            Self::DownloadFailed { handle, reason } => write!(f, "Download of object 0x{handle:08x} failed: {reason}"),
            Self::NotConnected => write!(f, "Not connected"),
        }
    }
}

impl std::error::Error for PtpError {}

impl From<std::io::Error> for PtpError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Self::timeout(e.to_string()),
            ErrorKind::ConnectionRefused => Self::ConnectionRefused { address: e.to_string() },
            ErrorKind::PermissionDenied => Self::PermissionDenied {
                device_id: e.to_string(),
            },
            ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                Self::Disconnected
            }
            _ => Self::Transport { message: e.to_string() },
        }
    }
}
