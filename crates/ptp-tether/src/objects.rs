//! Storage and object enumeration, object metadata and downloads.
//!
//! Enumeration degrades instead of failing: a camera that can't list its
//! storages still gets the default storage id, a failed handle listing is an
//! empty list, and a failed GetObjectInfo yields a fallback record. Downloads
//! never degrade: anything short of the full object is an error.

use log::{debug, warn};

use crate::error::{PtpError, PtpResult};
use crate::ptp::codes::{DEFAULT_STORAGE_ID, OperationCode};
use crate::ptp::dataset::{parse_device_info, parse_object_handles, parse_object_info, parse_storage_ids, parse_storage_info};
use crate::session::SessionManager;
use crate::types::{DeviceInfo, ObjectInfo, StorageInfo};

/// GetObjectHandles parameter meaning "all formats" / "whole storage".
pub const ALL_FORMATS: u32 = 0;
pub const ANY_PARENT: u32 = 0;
/// `compressed_size` value for objects of 4 GiB or more.
const SIZE_UNKNOWN: u32 = u32::MAX;

impl SessionManager {
    /// Storage ids, or `[0x00010001]` when the camera yields nothing usable.
    pub async fn get_storage_ids(&self) -> Vec<u32> {
        let result = async {
            let mut engine = self.session_engine("GetStorageIDs").await?;
            let data = engine
                .execute(OperationCode::GetStorageIds.code(), &[], true)
                .await?;
            parse_storage_ids(&data.unwrap_or_default())
        }
        .await;

        match result {
            Ok(ids) if !ids.is_empty() => {
                debug!("PTP storages: {:08x?}", ids);
                ids
            }
            Ok(_) => {
                warn!("Camera reported no storages, using 0x{:08x}", DEFAULT_STORAGE_ID);
                vec![DEFAULT_STORAGE_ID]
            }
            Err(e) => {
                warn!("GetStorageIDs failed ({}), using 0x{:08x}", e, DEFAULT_STORAGE_ID);
                vec![DEFAULT_STORAGE_ID]
            }
        }
    }

    /// Storage details, or a zeroed record flagged `fallback` if the camera doesn't answer.
    pub async fn get_storage_info(&self, storage_id: u32) -> StorageInfo {
        let encoding = self.config().string_encoding;
        let result = async {
            let mut engine = self.session_engine("GetStorageInfo").await?;
            let data = engine
                .execute(OperationCode::GetStorageInfo.code(), &[storage_id], true)
                .await?;
            parse_storage_info(storage_id, &data.unwrap_or_default(), encoding)
        }
        .await;

        result.unwrap_or_else(|e| {
            warn!("GetStorageInfo(0x{:08x}) failed: {}", storage_id, e);
            StorageInfo::fallback(storage_id)
        })
    }

    /// Object handles in a storage. Empty on failure.
    pub async fn get_object_handles(&self, storage_id: u32, format: u32, parent: u32) -> Vec<u32> {
        let result = async {
            let mut engine = self.session_engine("GetObjectHandles").await?;
            let data = engine
                .execute(
                    OperationCode::GetObjectHandles.code(),
                    &[storage_id, format, parent],
                    true,
                )
                .await?;
            parse_object_handles(&data.unwrap_or_default())
        }
        .await;

        match result {
            Ok(handles) => {
                debug!("PTP storage 0x{:08x}: {} object(s)", storage_id, handles.len());
                handles
            }
            Err(e) => {
                warn!("GetObjectHandles(0x{:08x}) failed: {}", storage_id, e);
                Vec::new()
            }
        }
    }

    /// Object metadata, or `ObjectInfo::fallback(handle)` if it can't be fetched.
    pub async fn get_object_info(&self, handle: u32) -> ObjectInfo {
        let encoding = self.config().string_encoding;
        let result = async {
            let mut engine = self.session_engine("GetObjectInfo").await?;
            let data = engine
                .execute(OperationCode::GetObjectInfo.code(), &[handle], true)
                .await?;
            parse_object_info(handle, &data.unwrap_or_default(), encoding)
        }
        .await;

        result.unwrap_or_else(|e| {
            warn!("GetObjectInfo(0x{:08x}) failed, using fallback record: {}", handle, e);
            ObjectInfo::fallback(handle)
        })
    }

    /// Downloads the full payload of `handle`.
    ///
    /// The result is exactly `info.compressed_size` bytes. A short transfer is
    /// `DownloadFailed`, never a partial file.
    pub async fn get_object(&self, handle: u32, info: &ObjectInfo) -> PtpResult<Vec<u8>> {
        let failed = |reason: String| PtpError::DownloadFailed { handle, reason };
        if info.fallback {
            return Err(failed("object metadata unavailable".to_string()));
        }
        let expected = info.compressed_size;
        if expected == SIZE_UNKNOWN {
            return Err(failed("object size not declared (4 GiB or more)".to_string()));
        }

        let data = async {
            let mut engine = self.session_engine("GetObject").await?;
            engine
                .execute_sized(OperationCode::GetObject.code(), &[handle], u64::from(expected))
                .await
        }
        .await
        .map_err(|e| failed(e.to_string()))?;

        let expected = expected as usize;
        match data.len() {
            n if n < expected => Err(failed(format!("received {n} of {expected} bytes"))),
            n if n > expected => {
                warn!(
                    "PTP object 0x{:08x}: received {} bytes, expected {}; truncating",
                    handle, n, expected
                );
                let mut data = data;
                data.truncate(expected);
                Ok(data)
            }
            _ => Ok(data),
        }
    }

    /// GetDeviceInfo, sent outside the session (transaction id 0, single attempt).
    pub async fn get_device_info(&self) -> PtpResult<DeviceInfo> {
        let encoding = self.config().string_encoding;
        let mut engine = self.lock("GetDeviceInfo").await?;
        let data = engine
            .execute_outside_session(OperationCode::GetDeviceInfo.code(), &[], true)
            .await?;
        parse_device_info(&data.unwrap_or_default(), encoding)
    }
}
