//! Data model handed across the boundary to UI and persistence layers.
//!
//! These types are serialized to JSON (camelCase) so a host application can
//! forward them unchanged.

use serde::Serialize;

use crate::ptp::dataset::parse_ptp_datetime;

/// How the camera is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Usb,
    Network,
}

/// Outcome of `CameraConnection::connect`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResult {
    pub connected: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<ConnectionType>,
}

/// Snapshot of one storage unit. Re-fetched on demand, never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageInfo {
    pub storage_id: u32,
    /// 1 FixedROM, 2 RemovableROM, 3 FixedRAM, 4 RemovableRAM.
    pub storage_type: u16,
    pub filesystem_type: u16,
    /// 0 ReadWrite, 1 ReadOnly without deletion, 2 ReadOnly with deletion.
    pub access_capability: u16,
    /// In bytes.
    pub max_capacity: u64,
    /// In bytes.
    pub free_space: u64,
    pub free_object_count: u32,
    pub description: String,
    pub volume_label: String,
    /// True when the camera didn't answer GetStorageInfo and this record was synthesized.
    pub fallback: bool,
}

impl StorageInfo {
    pub fn fallback(storage_id: u32) -> Self {
        Self {
            storage_id,
            storage_type: 0,
            filesystem_type: 0,
            access_capability: 0,
            max_capacity: 0,
            free_space: 0,
            free_object_count: 0,
            description: String::new(),
            volume_label: String::new(),
            fallback: true,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.access_capability != 0
    }

    /// For example, "RemovableRAM".
    pub fn storage_type_name(&self) -> &'static str {
        match self.storage_type {
            1 => "FixedROM",
            2 => "RemovableROM",
            3 => "FixedRAM",
            4 => "RemovableRAM",
            _ => "Undefined",
        }
    }
}

/// Lightweight listing entry returned by `list_objects`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectHandleSummary {
    pub handle: u32,
    pub storage_id: u32,
}

/// Metadata for one object. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInfo {
    pub object_handle: u32,
    pub storage_id: u32,
    pub object_format: u16,
    pub protection_status: u16,
    /// Payload size in bytes (0xFFFFFFFF means "4 GiB or more").
    pub compressed_size: u32,
    pub thumb_format: u16,
    pub thumb_compressed_size: u32,
    pub thumb_width: u32,
    pub thumb_height: u32,
    pub image_width: u32,
    pub image_height: u32,
    pub image_bit_depth: u32,
    pub parent_object: u32,
    pub association_type: u16,
    pub sequence_number: u32,
    pub filename: String,
    /// Raw PTP date string, for example "20240315T142501".
    pub capture_date: String,
    pub modification_date: String,
    pub keywords: String,
    /// True when GetObjectInfo failed and this record was synthesized.
    pub fallback: bool,
}

/// Object format code for associations (folders).
pub const FORMAT_ASSOCIATION: u16 = 0x3001;

impl ObjectInfo {
    /// Record used when the camera never answered GetObjectInfo.
    ///
    /// Geometry and size are zeroed; the filename is derived from the handle.
    pub fn fallback(handle: u32) -> Self {
        Self {
            object_handle: handle,
            storage_id: 0,
            object_format: 0,
            protection_status: 0,
            compressed_size: 0,
            thumb_format: 0,
            thumb_compressed_size: 0,
            thumb_width: 0,
            thumb_height: 0,
            image_width: 0,
            image_height: 0,
            image_bit_depth: 0,
            parent_object: 0,
            association_type: 0,
            sequence_number: 0,
            filename: format!("Object_{handle:x}"),
            capture_date: String::new(),
            modification_date: String::new(),
            keywords: String::new(),
            fallback: true,
        }
    }

    pub fn is_association(&self) -> bool {
        self.object_format == FORMAT_ASSOCIATION
    }

    pub fn capture_time(&self) -> Option<chrono::NaiveDateTime> {
        parse_ptp_datetime(&self.capture_date)
    }
}

/// Device identity from GetDeviceInfo.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub standard_version: u16,
    pub vendor_extension_id: u32,
    pub vendor_extension_version: u16,
    pub vendor_extension_desc: String,
    pub functional_mode: u16,
    pub operations_supported: Vec<u16>,
    pub events_supported: Vec<u16>,
    pub device_properties_supported: Vec<u16>,
    pub capture_formats: Vec<u16>,
    pub image_formats: Vec<u16>,
    pub manufacturer: String,
    pub model: String,
    pub device_version: String,
    pub serial_number: String,
}

impl DeviceInfo {
    pub fn supports_operation(&self, code: u16) -> bool {
        self.operations_supported.contains(&code)
    }

    /// For example, "Canon EOS R6". Falls back to whichever part is known.
    pub fn display_name(&self) -> String {
        match (self.manufacturer.trim(), self.model.trim()) {
            ("", "") => "PTP camera".to_string(),
            (maker, "") => format!("{maker} camera"),
            ("", model) => model.to_string(),
            // Canon reports "Canon Inc." / "Canon EOS R6"; don't repeat the brand.
            (maker, model) if maker.split_whitespace().next().is_some_and(|brand| model.starts_with(brand)) => {
                model.to_string()
            }
            (maker, model) => format!("{maker} {model}"),
        }
    }
}

/// Asynchronous device event, decoded from an Event container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum PtpEvent {
    ObjectAdded { handle: u32 },
    CaptureComplete,
    DevicePropChanged { property: u16 },
    StoreAdded { storage_id: u32 },
    StoreRemoved { storage_id: u32 },
    StorageInfoChanged { storage_id: u32 },
    /// Any other standard or vendor event, passed through untouched.
    Other { code: u16, params: Vec<u32> },
}
