//! Camera connection lifecycle.
//!
//! `CameraConnection` is the boundary a host application talks to. It opens a
//! transport, opens the PTP session, starts the event monitor, and routes
//! enumeration and download calls through the session's transaction engine.
//!
//! ## Teardown order
//!
//! `disconnect` stops the event monitor and waits for it, then closes the
//! session (best effort), then releases the transport. An operation that's
//! still in flight keeps its own reference to the session and finishes or
//! times out on its own.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};

use crate::config::PtpConfig;
use crate::engine::TransactionEngine;
use crate::error::{PtpError, PtpResult};
use crate::events::{EventMonitor, NewObjectListener};
use crate::objects::{ALL_FORMATS, ANY_PARENT};
use crate::ptp::codes::PTPIP_PORT;
use crate::session::{SessionManager, SessionState};
use crate::transport::discovery::UsbDeviceRef;
use crate::transport::{TransportPair, ptpip, usb};
use crate::types::{ConnectResult, ConnectionType, DeviceInfo, ObjectHandleSummary, ObjectInfo, PtpEvent, StorageInfo};

/// Buffered events per subscriber before the slowest one starts lagging.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Where to find the camera.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ConnectTarget {
    Usb(UsbDeviceRef),
    Network { host: String, port: u16 },
}

impl ConnectTarget {
    /// A PTP/IP target on the standard port.
    pub fn network(host: impl Into<String>) -> Self {
        Self::Network {
            host: host.into(),
            port: PTPIP_PORT,
        }
    }

    fn connection_type(&self) -> ConnectionType {
        match self {
            Self::Usb(_) => ConnectionType::Usb,
            Self::Network { .. } => ConnectionType::Network,
        }
    }
}

/// Everything that lives exactly as long as one connection.
struct ActiveLink {
    sessions: Arc<SessionManager>,
    monitor: Option<EventMonitor>,
    connection_type: ConnectionType,
    device_info: Option<DeviceInfo>,
}

/// One camera connection. Safe to drop whether or not it was ever connected.
pub struct CameraConnection {
    config: PtpConfig,
    link: Mutex<Option<ActiveLink>>,
    listener: NewObjectListener,
    events: broadcast::Sender<PtpEvent>,
}

impl Default for CameraConnection {
    fn default() -> Self {
        Self::new(PtpConfig::default())
    }
}

impl CameraConnection {
    pub fn new(config: PtpConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            link: Mutex::new(None),
            listener: NewObjectListener::default(),
            events,
        }
    }

    pub fn config(&self) -> &PtpConfig {
        &self.config
    }

    /// Connects and opens the session. Never fails: the outcome is in the result.
    ///
    /// Connecting while already connected reports the existing connection.
    pub async fn connect(&self, target: ConnectTarget) -> ConnectResult {
        let mut link = self.link.lock().await;
        if let Some(active) = link.as_ref() {
            debug!("connect: already connected, keeping the existing session");
            return ConnectResult {
                connected: true,
                message: format!("Already connected to {}", describe(active.device_info.as_ref())),
                connection_type: Some(active.connection_type),
            };
        }

        let connection_type = target.connection_type();
        match self.try_connect(&target).await {
            Ok(active) => {
                let message = format!("Connected to {}", describe(active.device_info.as_ref()));
                info!("{}", message);
                *link = Some(active);
                ConnectResult {
                    connected: true,
                    message,
                    connection_type: Some(connection_type),
                }
            }
            Err(e) => {
                warn!("Camera connection failed: {}", e);
                ConnectResult {
                    connected: false,
                    message: e.user_message(),
                    connection_type: None,
                }
            }
        }
    }

    async fn try_connect(&self, target: &ConnectTarget) -> PtpResult<ActiveLink> {
        let TransportPair { command, events } = match target {
            ConnectTarget::Usb(device) => {
                info!("Connecting to USB camera {}", device.id);
                usb::open(device, &self.config).await?
            }
            ConnectTarget::Network { host, port } => {
                info!("Connecting to PTP/IP camera {}:{}", host, port);
                ptpip::connect(host, *port, &self.config).await?
            }
        };
        let connection_type = command.connection_type();
        let sessions = Arc::new(SessionManager::new(TransactionEngine::new(command, self.config.clone())));

        let device_info = match sessions.get_device_info().await {
            Ok(info) => {
                debug!(
                    "Camera: {} (serial {}, {} operations)",
                    info.display_name(),
                    info.serial_number,
                    info.operations_supported.len()
                );
                Some(info)
            }
            Err(e) => {
                warn!("GetDeviceInfo failed, continuing without it: {}", e);
                None
            }
        };

        if let Err(e) = sessions.open_session().await {
            sessions.shutdown().await;
            if let Some(mut events) = events {
                events.close().await;
            }
            return Err(e);
        }

        let monitor = match events {
            Some(source) => Some(EventMonitor::start(
                source,
                self.poll_interval(connection_type),
                self.listener.clone(),
                self.events.clone(),
            )),
            None => {
                warn!("Camera has no event channel, new objects won't be reported");
                None
            }
        };

        Ok(ActiveLink {
            sessions,
            monitor,
            connection_type,
            device_info,
        })
    }

    fn poll_interval(&self, connection_type: ConnectionType) -> Duration {
        Duration::from_millis(match connection_type {
            ConnectionType::Usb => self.config.usb_event_poll_ms,
            ConnectionType::Network => self.config.network_event_poll_ms,
        })
    }

    /// Stops the event monitor, closes the session and releases the transport.
    ///
    /// Idempotent: a second call, or a call without a connection, does nothing.
    pub async fn disconnect(&self) {
        let Some(active) = self.link.lock().await.take() else {
            debug!("disconnect: not connected");
            return;
        };
        info!("Disconnecting camera");

        if let Some(monitor) = active.monitor {
            monitor.stop().await;
        }
        active.sessions.close_session().await;
        active.sessions.shutdown().await;
        info!("Camera disconnected");
    }

    async fn sessions(&self) -> PtpResult<Arc<SessionManager>> {
        self.link
            .lock()
            .await
            .as_ref()
            .map(|active| Arc::clone(&active.sessions))
            .ok_or(PtpError::NotConnected)
    }

    /// All storages. A storage whose details can't be read is still listed, flagged `fallback`.
    pub async fn list_storages(&self) -> PtpResult<Vec<StorageInfo>> {
        let sessions = self.sessions().await?;
        let mut storages = Vec::new();
        for storage_id in sessions.get_storage_ids().await {
            storages.push(sessions.get_storage_info(storage_id).await);
        }
        Ok(storages)
    }

    /// Every object in a storage, across all folders and formats.
    pub async fn list_objects(&self, storage_id: u32) -> PtpResult<Vec<ObjectHandleSummary>> {
        let sessions = self.sessions().await?;
        let handles = sessions
            .get_object_handles(storage_id, ALL_FORMATS, ANY_PARENT)
            .await;
        Ok(handles
            .into_iter()
            .map(|handle| ObjectHandleSummary { handle, storage_id })
            .collect())
    }

    pub async fn get_object_info(&self, handle: u32) -> PtpResult<ObjectInfo> {
        let sessions = self.sessions().await?;
        Ok(sessions.get_object_info(handle).await)
    }

    /// Fetches the object's metadata, then its full payload.
    pub async fn download_object(&self, handle: u32) -> PtpResult<Vec<u8>> {
        let sessions = self.sessions().await?;
        let info = sessions.get_object_info(handle).await;
        let data = sessions.get_object(handle, &info).await?;
        info!("Downloaded {} ({} bytes)", info.filename, data.len());
        Ok(data)
    }

    /// Registers the new-object hook, replacing any previous one. Returns true if one was replaced.
    pub fn on_new_object(&self, callback: impl Fn(u32) + Send + Sync + 'static) -> bool {
        self.listener.set(Arc::new(callback))
    }

    pub fn clear_new_object_listener(&self) {
        self.listener.clear();
    }

    /// Every decoded device event, for as long as the receiver is kept.
    pub fn subscribe_events(&self) -> broadcast::Receiver<PtpEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> SessionState {
        match self.link.lock().await.as_ref() {
            Some(active) => active.sessions.state(),
            None => SessionState::Disconnected,
        }
    }

    pub async fn connection_type(&self) -> Option<ConnectionType> {
        self.link.lock().await.as_ref().map(|active| active.connection_type)
    }

    /// DeviceInfo fetched at connect, if the camera answered it.
    pub async fn device_info(&self) -> Option<DeviceInfo> {
        self.link
            .lock()
            .await
            .as_ref()
            .and_then(|active| active.device_info.clone())
    }
}

fn describe(device_info: Option<&DeviceInfo>) -> String {
    device_info.map_or_else(|| "camera".to_string(), DeviceInfo::display_name)
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod connection_test;
