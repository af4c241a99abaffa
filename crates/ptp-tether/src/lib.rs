//! Picture Transfer Protocol client for tethered (USB) and WiFi (PTP/IP) cameras.
//!
//! ```text
//! CameraConnection ── SessionManager ── TransactionEngine ── CommandTransport (usb | ptpip)
//!        └──────────── EventMonitor ─────────────────────── EventTransport
//! ```
//!
//! A host application drives everything through [`CameraConnection`]: connect,
//! list storages and objects, download objects and get told about new ones.

// Flag unused code early
#![warn(unused)]
// Warn on unused dependencies to catch platform-specific cfg mismatches
#![warn(unused_crate_dependencies)]
// Warn on redundant path prefixes (e.g., std::time::Duration when Duration is imported)
#![warn(unused_qualifications)]
// Use log::* macros instead of println!/eprintln! for proper log level control
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod events;
pub mod objects;
pub mod ptp;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::PtpConfig;
pub use connection::{CameraConnection, ConnectTarget};
pub use error::{ErrorCategory, PtpError, PtpResult};
pub use events::{EventMonitor, NewObjectListener};
pub use ptp::dataset::StringEncoding;
pub use session::{SessionManager, SessionState};
pub use transport::discovery::{CameraHotplug, UsbDeviceRef, list_cameras, watch_cameras};
pub use types::{ConnectResult, ConnectionType, DeviceInfo, ObjectHandleSummary, ObjectInfo, PtpEvent, StorageInfo};
