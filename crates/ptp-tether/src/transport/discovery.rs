//! USB camera discovery.
//!
//! Lists connected cameras without opening them, and watches for cameras
//! being plugged in or removed.

use futures_util::StreamExt;
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::error::{PtpError, PtpResult};
use crate::ptp::codes::{STILL_IMAGE_INTERFACE, camera_vendor_name};

/// A USB camera found during enumeration. Enough to find it again for `usb::open`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsbDeviceRef {
    /// Format: "ptp-{bus}-{address}".
    pub id: String,
    pub bus_id: String,
    pub address: u8,
    /// For example, 0x04a9 for Canon.
    pub vendor_id: u16,
    pub product_id: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}

impl UsbDeviceRef {
    pub fn new(bus_id: &str, address: u8, vendor_id: u16, product_id: u16) -> Self {
        Self {
            id: device_id(bus_id, address),
            bus_id: bus_id.to_string(),
            address,
            vendor_id,
            product_id,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }

    /// Prefers the product string, then the vendor name, then raw ids.
    pub fn display_name(&self) -> String {
        if let Some(product) = &self.product {
            return product.clone();
        }
        if let Some(manufacturer) = &self.manufacturer {
            return format!("{manufacturer} camera");
        }
        if let Some(vendor) = camera_vendor_name(self.vendor_id) {
            return format!("{vendor} camera");
        }
        format!("USB camera ({:04x}:{:04x})", self.vendor_id, self.product_id)
    }
}

pub fn device_id(bus_id: &str, address: u8) -> String {
    format!("ptp-{bus_id}-{address}")
}

/// True if a device with these interface triples looks like a PTP camera.
///
/// The still-image triple is authoritative. Known camera vendors also count
/// when they expose any still-image class interface, since some bodies report a
/// vendor subclass.
pub fn is_camera(vendor_id: u16, interfaces: &[(u8, u8, u8)]) -> bool {
    let (still_image_class, _, _) = STILL_IMAGE_INTERFACE;
    interfaces.contains(&STILL_IMAGE_INTERFACE)
        || (camera_vendor_name(vendor_id).is_some()
            && interfaces.iter().any(|(class, _, _)| *class == still_image_class))
}

fn to_device_ref(info: &nusb::DeviceInfo) -> Option<UsbDeviceRef> {
    let interfaces: Vec<(u8, u8, u8)> = info
        .interfaces()
        .map(|i| (i.class(), i.subclass(), i.protocol()))
        .collect();
    if !is_camera(info.vendor_id(), &interfaces) {
        return None;
    }
    let mut device = UsbDeviceRef::new(info.bus_id(), info.device_address(), info.vendor_id(), info.product_id());
    device.manufacturer = info.manufacturer_string().map(str::to_string);
    device.product = info.product_string().map(str::to_string);
    device.serial_number = info.serial_number().map(str::to_string);
    Some(device)
}

/// Lists all connected PTP cameras.
///
/// Returns an empty list if enumeration fails.
pub async fn list_cameras() -> Vec<UsbDeviceRef> {
    match nusb::list_devices().await {
        Ok(devices) => {
            let cameras: Vec<UsbDeviceRef> = devices.filter_map(|info| to_device_ref(&info)).collect();
            debug!("Found {} PTP camera(s)", cameras.len());
            for camera in &cameras {
                debug!(
                    "PTP camera: id={}, vendor={:04x}, product={:04x}",
                    camera.id, camera.vendor_id, camera.product_id
                );
            }
            cameras
        }
        Err(e) => {
            warn!("Failed to enumerate USB devices: {}", e);
            Vec::new()
        }
    }
}

/// Finds the nusb device for a previously listed camera.
pub(crate) async fn find_device(device: &UsbDeviceRef) -> PtpResult<nusb::DeviceInfo> {
    let mut devices = nusb::list_devices().await.map_err(|e| PtpError::Transport {
        message: format!("USB enumeration failed: {e}"),
    })?;
    devices
        .find(|info| info.bus_id() == device.bus_id && info.device_address() == device.address)
        .ok_or(PtpError::Disconnected)
}

/// Camera plug/unplug notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraHotplug {
    Connected(UsbDeviceRef),
    Disconnected { id: String },
}

/// Watches USB hotplug events and reports cameras only.
///
/// The watcher runs on its own task until the receiver is dropped.
pub fn watch_cameras() -> PtpResult<mpsc::UnboundedReceiver<CameraHotplug>> {
    let mut stream = nusb::watch_devices().map_err(|e| PtpError::Transport {
        message: format!("USB hotplug watcher failed to start: {e}"),
    })?;
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut known: HashMap<nusb::DeviceId, String> = HashMap::new();
        debug!("USB camera hotplug watcher started");
        while let Some(event) = stream.next().await {
            let notification = match event {
                nusb::hotplug::HotplugEvent::Connected(info) => match to_device_ref(&info) {
                    Some(camera) => {
                        known.insert(info.id(), camera.id.clone());
                        CameraHotplug::Connected(camera)
                    }
                    None => continue,
                },
                nusb::hotplug::HotplugEvent::Disconnected(device_id) => match known.remove(&device_id) {
                    Some(id) => CameraHotplug::Disconnected { id },
                    None => continue,
                },
            };
            debug!("USB camera hotplug: {:?}", notification);
            if tx.send(notification).is_err() {
                debug!("USB camera hotplug receiver dropped, stopping watcher");
                return;
            }
        }
        error!("USB hotplug stream ended unexpectedly");
    });

    Ok(rx)
}
