//! Parsing of data-phase payloads (StorageIDs, StorageInfo, ObjectHandles,
//! ObjectInfo, DeviceInfo).
//!
//! ## String policy
//!
//! PTP strings are a one-byte character count (including the terminating null)
//! followed by that many characters. The standard says UTF-16LE; some firmware
//! writes one byte per character instead. Which width to read is an explicit
//! `StringEncoding` choice (configurable, UTF-16LE by default), never guessed per
//! call site. In both modes the string ends at the first zero code unit even if
//! the count claims more.

use bytes::Buf;
use chrono::NaiveDateTime;
use serde::Deserialize;

use crate::error::{PtpError, PtpResult};
use crate::types::{DeviceInfo, ObjectInfo, StorageInfo};

/// Upper bound on a GetStorageIDs count.
pub const MAX_STORAGE_IDS: u32 = 100;
/// Upper bound on a GetObjectHandles count.
pub const MAX_OBJECT_HANDLES: u32 = 10_000;
/// Upper bound for the code arrays inside DeviceInfo.
const MAX_CODE_ARRAY: u32 = 4096;

/// Character width used when reading PTP strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StringEncoding {
    /// Standard PTP: count-prefixed UTF-16LE code units.
    #[default]
    Utf16,
    /// Count-prefixed single bytes, decoded as UTF-8 (lossy).
    Utf8,
}

/// Bounds-checked little-endian cursor over a payload.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    encoding: StringEncoding,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8], encoding: StringEncoding) -> Self {
        Self { buf, encoding }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn need(&self, bytes: usize, what: &str) -> PtpResult<()> {
        if self.buf.remaining() < bytes {
            return Err(PtpError::malformed(format!(
                "payload ends before {what} ({} of {bytes} bytes left)",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> PtpResult<u8> {
        self.need(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub fn read_u16(&mut self) -> PtpResult<u16> {
        self.need(2, "u16")?;
        Ok(self.buf.get_u16_le())
    }

    pub fn read_u32(&mut self) -> PtpResult<u32> {
        self.need(4, "u32")?;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_u64(&mut self) -> PtpResult<u64> {
        self.need(8, "u64")?;
        Ok(self.buf.get_u64_le())
    }

    /// Reads a count-prefixed PTP string according to the configured encoding.
    pub fn read_string(&mut self) -> PtpResult<String> {
        let count = self.read_u8()? as usize;
        if count == 0 {
            return Ok(String::new());
        }
        match self.encoding {
            StringEncoding::Utf16 => {
                self.need(count * 2, "UTF-16 string")?;
                let units: Vec<u16> = (0..count).map(|_| self.buf.get_u16_le()).collect();
                let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
                Ok(String::from_utf16_lossy(&units[..end]))
            }
            StringEncoding::Utf8 => {
                self.need(count, "8-bit string")?;
                let raw = &self.buf[..count];
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                let text = String::from_utf8_lossy(&raw[..end]).into_owned();
                self.buf.advance(count);
                Ok(text)
            }
        }
    }

    fn read_count(&mut self, max: u32, what: &str) -> PtpResult<usize> {
        let count = self.read_u32()?;
        if count > max {
            return Err(PtpError::malformed(format!("{what} count {count} exceeds {max}")));
        }
        Ok(count as usize)
    }

    /// Reads a u32-count-prefixed array of u16, rejecting counts above `max`.
    pub fn read_u16_array(&mut self, max: u32, what: &str) -> PtpResult<Vec<u16>> {
        let count = self.read_count(max, what)?;
        self.need(count * 2, what)?;
        Ok((0..count).map(|_| self.buf.get_u16_le()).collect())
    }

    /// Reads a u32-count-prefixed array of u32, rejecting counts above `max`
    /// before anything is allocated.
    pub fn read_u32_array(&mut self, max: u32, what: &str) -> PtpResult<Vec<u32>> {
        let count = self.read_count(max, what)?;
        self.need(count * 4, what)?;
        Ok((0..count).map(|_| self.buf.get_u32_le()).collect())
    }
}

pub fn parse_storage_ids(data: &[u8]) -> PtpResult<Vec<u32>> {
    PayloadReader::new(data, StringEncoding::default()).read_u32_array(MAX_STORAGE_IDS, "storage id")
}

pub fn parse_object_handles(data: &[u8]) -> PtpResult<Vec<u32>> {
    PayloadReader::new(data, StringEncoding::default()).read_u32_array(MAX_OBJECT_HANDLES, "object handle")
}

pub fn parse_storage_info(storage_id: u32, data: &[u8], encoding: StringEncoding) -> PtpResult<StorageInfo> {
    let mut r = PayloadReader::new(data, encoding);
    let storage_type = r.read_u16()?;
    let filesystem_type = r.read_u16()?;
    let access_capability = r.read_u16()?;
    let max_capacity = r.read_u64()?;
    let free_space = r.read_u64()?;
    let free_object_count = r.read_u32()?;
    // Some cameras stop after the numeric fields.
    let description = if r.remaining() > 0 { r.read_string()? } else { String::new() };
    let volume_label = if r.remaining() > 0 { r.read_string()? } else { String::new() };

    Ok(StorageInfo {
        storage_id,
        storage_type,
        filesystem_type,
        access_capability,
        max_capacity,
        free_space,
        free_object_count,
        description,
        volume_label,
        fallback: false,
    })
}

pub fn parse_object_info(handle: u32, data: &[u8], encoding: StringEncoding) -> PtpResult<ObjectInfo> {
    let mut r = PayloadReader::new(data, encoding);
    let storage_id = r.read_u32()?;
    let object_format = r.read_u16()?;
    let protection_status = r.read_u16()?;
    let compressed_size = r.read_u32()?;
    let thumb_format = r.read_u16()?;
    let thumb_compressed_size = r.read_u32()?;
    let thumb_width = r.read_u32()?;
    let thumb_height = r.read_u32()?;
    let image_width = r.read_u32()?;
    let image_height = r.read_u32()?;
    let image_bit_depth = r.read_u32()?;
    let parent_object = r.read_u32()?;
    let association_type = r.read_u16()?;
    let _association_desc = r.read_u32()?;
    let sequence_number = r.read_u32()?;
    let filename = r.read_string()?;
    let capture_date = if r.remaining() > 0 { r.read_string()? } else { String::new() };
    let modification_date = if r.remaining() > 0 { r.read_string()? } else { String::new() };
    let keywords = if r.remaining() > 0 { r.read_string()? } else { String::new() };

    Ok(ObjectInfo {
        object_handle: handle,
        storage_id,
        object_format,
        protection_status,
        compressed_size,
        thumb_format,
        thumb_compressed_size,
        thumb_width,
        thumb_height,
        image_width,
        image_height,
        image_bit_depth,
        parent_object,
        association_type,
        sequence_number,
        filename,
        capture_date,
        modification_date,
        keywords,
        fallback: false,
    })
}

pub fn parse_device_info(data: &[u8], encoding: StringEncoding) -> PtpResult<DeviceInfo> {
    let mut r = PayloadReader::new(data, encoding);
    Ok(DeviceInfo {
        standard_version: r.read_u16()?,
        vendor_extension_id: r.read_u32()?,
        vendor_extension_version: r.read_u16()?,
        vendor_extension_desc: r.read_string()?,
        functional_mode: r.read_u16()?,
        operations_supported: r.read_u16_array(MAX_CODE_ARRAY, "operations supported")?,
        events_supported: r.read_u16_array(MAX_CODE_ARRAY, "events supported")?,
        device_properties_supported: r.read_u16_array(MAX_CODE_ARRAY, "device properties supported")?,
        capture_formats: r.read_u16_array(MAX_CODE_ARRAY, "capture formats")?,
        image_formats: r.read_u16_array(MAX_CODE_ARRAY, "image formats")?,
        manufacturer: r.read_string()?,
        model: r.read_string()?,
        device_version: r.read_string()?,
        serial_number: r.read_string()?,
    })
}

/// Parses a PTP date string ("YYYYMMDDThhmmss", optionally followed by
/// ".s" tenths and a "Z" / "+hhmm" suffix, both ignored).
pub fn parse_ptp_datetime(value: &str) -> Option<NaiveDateTime> {
    let core = value.get(..15)?;
    NaiveDateTime::parse_from_str(core, "%Y%m%dT%H%M%S").ok()
}
