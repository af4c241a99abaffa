//! PTP container framing.
//!
//! Every USB PTP exchange is a container: a 12-byte little-endian header
//! (length, type, code, transaction id) followed by up to five u32 parameters
//! (command/response/event) or an opaque payload (data).

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{PtpError, PtpResult};

pub const HEADER_LEN: usize = 12;
pub const MAX_PARAMS: usize = 5;
/// Sanity bound for a declared container length. Anything larger is garbage.
pub const MAX_CONTAINER_LEN: u32 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
#[repr(u16)]
pub enum ContainerType {
    Command = 1,
    Data = 2,
    Response = 3,
    Event = 4,
}

impl ContainerType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Command),
            2 => Some(Self::Data),
            3 => Some(Self::Response),
            4 => Some(Self::Event),
            _ => None,
        }
    }
}

/// A decoded container header with its parameters.
///
/// `code` is an operation code for Command/Data, a response code for Response
/// and an event code for Event. Data containers carry no parameters; their
/// payload follows the header and is read separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub length: u32,
    pub kind: ContainerType,
    pub code: u16,
    pub transaction_id: u32,
    pub params: Vec<u32>,
}

impl Container {
    /// Number of payload bytes declared after the header.
    pub fn payload_len(&self) -> usize {
        (self.length as usize).saturating_sub(HEADER_LEN)
    }

    pub fn param(&self, index: usize) -> Option<u32> {
        self.params.get(index).copied()
    }
}

fn encode(kind: ContainerType, code: u16, transaction_id: u32, params: &[u32]) -> PtpResult<Vec<u8>> {
    if params.len() > MAX_PARAMS {
        return Err(PtpError::malformed(format!(
            "{} parameters (at most {MAX_PARAMS} allowed)",
            params.len()
        )));
    }
    let length = HEADER_LEN + params.len() * 4;
    let mut buf = BytesMut::with_capacity(length);
    buf.put_u32_le(length as u32);
    buf.put_u16_le(kind as u16);
    buf.put_u16_le(code);
    buf.put_u32_le(transaction_id);
    for param in params {
        buf.put_u32_le(*param);
    }
    Ok(buf.to_vec())
}

pub fn encode_command(op_code: u16, transaction_id: u32, params: &[u32]) -> PtpResult<Vec<u8>> {
    encode(ContainerType::Command, op_code, transaction_id, params)
}

pub fn encode_response(response_code: u16, transaction_id: u32, params: &[u32]) -> PtpResult<Vec<u8>> {
    encode(ContainerType::Response, response_code, transaction_id, params)
}

pub fn encode_event(event_code: u16, transaction_id: u32, params: &[u32]) -> PtpResult<Vec<u8>> {
    encode(ContainerType::Event, event_code, transaction_id, params)
}

/// Encodes a data container (host to device, or a device reply in tests).
pub fn encode_data(op_code: u16, transaction_id: u32, payload: &[u8]) -> PtpResult<Vec<u8>> {
    let length = u32::try_from(HEADER_LEN + payload.len())
        .map_err(|_| PtpError::malformed(format!("data payload of {} bytes is too large", payload.len())))?;
    let mut buf = BytesMut::with_capacity(length as usize);
    buf.put_u32_le(length);
    buf.put_u16_le(ContainerType::Data as u16);
    buf.put_u16_le(op_code);
    buf.put_u32_le(transaction_id);
    buf.put_slice(payload);
    Ok(buf.to_vec())
}

/// Decodes a container header, bounding the declared length to `[12, 10 MiB]`.
pub fn decode_header(bytes: &[u8]) -> PtpResult<Container> {
    decode_header_with_limit(bytes, MAX_CONTAINER_LEN)
}

/// Decodes a container header with a caller-chosen upper bound on `length`.
///
/// Data containers for object downloads legitimately exceed 10 MiB, so the
/// data phase passes the configured object size bound instead.
pub fn decode_header_with_limit(bytes: &[u8], max_length: u32) -> PtpResult<Container> {
    if bytes.len() < HEADER_LEN {
        return Err(PtpError::malformed(format!(
            "{} bytes available, header needs {HEADER_LEN}",
            bytes.len()
        )));
    }
    let mut cursor = bytes;
    let length = cursor.get_u32_le();
    let raw_kind = cursor.get_u16_le();
    let code = cursor.get_u16_le();
    let transaction_id = cursor.get_u32_le();

    if length < HEADER_LEN as u32 || length > max_length {
        return Err(PtpError::malformed(format!("declared length {length} out of bounds")));
    }
    let kind = ContainerType::from_u16(raw_kind)
        .ok_or_else(|| PtpError::malformed(format!("unknown container type 0x{raw_kind:04x}")))?;

    let mut params = Vec::new();
    if kind != ContainerType::Data {
        // Params are whatever whole u32s fit in both the declared length and the bytes we have.
        let declared = (length as usize - HEADER_LEN) / 4;
        let available = cursor.len() / 4;
        for _ in 0..declared.min(available).min(MAX_PARAMS) {
            params.push(cursor.get_u32_le());
        }
    }

    Ok(Container {
        length,
        kind,
        code,
        transaction_id,
        params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_round_trip() {
        let bytes = encode_command(0x1007, 3, &[0x0001_0001, 0, 0]).unwrap();
        assert_eq!(bytes.len(), 24);

        let container = decode_header(&bytes).unwrap();
        assert_eq!(container.length, 24);
        assert_eq!(container.kind, ContainerType::Command);
        assert_eq!(container.code, 0x1007);
        assert_eq!(container.transaction_id, 3);
        assert_eq!(container.params, vec![0x0001_0001, 0, 0]);
    }

    #[test]
    fn test_command_without_params() {
        let bytes = encode_command(0x1004, 2, &[]).unwrap();
        assert_eq!(bytes, vec![12, 0, 0, 0, 1, 0, 0x04, 0x10, 2, 0, 0, 0]);
        assert!(decode_header(&bytes).unwrap().params.is_empty());
    }

    #[test]
    fn test_length_field_matches_serialized_size() {
        for count in 0..=MAX_PARAMS {
            let params: Vec<u32> = (0..count as u32).collect();
            let bytes = encode_command(0x1002, 1, &params).unwrap();
            let declared = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            assert_eq!(declared as usize, bytes.len());
        }
    }

    #[test]
    fn test_too_many_params_rejected() {
        let err = encode_command(0x1002, 1, &[1, 2, 3, 4, 5, 6]).unwrap_err();
        assert!(matches!(err, PtpError::MalformedContainer { .. }));
    }

    #[test]
    fn test_decode_object_added_event() {
        let bytes = [
            0x14, 0, 0, 0, 0x04, 0, 0x02, 0x40, 0x01, 0, 0, 0, 0x2a, 0, 0, 0, 0, 0, 0, 0,
        ];
        let container = decode_header(&bytes).unwrap();
        assert_eq!(container.kind, ContainerType::Event);
        assert_eq!(container.code, 0x4002);
        assert_eq!(container.transaction_id, 1);
        assert_eq!(container.param(0), Some(0x2a));
    }

    #[test]
    fn test_decode_rejects_short_input() {
        let err = decode_header(&[0x0c, 0, 0, 0, 3, 0]).unwrap_err();
        assert!(matches!(err, PtpError::MalformedContainer { .. }));
    }

    #[test]
    fn test_decode_rejects_out_of_bounds_length() {
        let mut too_small = encode_response(0x2001, 1, &[]).unwrap();
        too_small[0] = 8;
        assert!(decode_header(&too_small).is_err());

        let mut too_large = encode_response(0x2001, 1, &[]).unwrap();
        too_large[..4].copy_from_slice(&(MAX_CONTAINER_LEN + 1).to_le_bytes());
        assert!(decode_header(&too_large).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let mut bytes = encode_response(0x2001, 1, &[]).unwrap();
        bytes[4] = 9;
        assert!(decode_header(&bytes).is_err());
    }

    #[test]
    fn test_large_data_header_with_limit() {
        let mut header = encode_data(0x1009, 7, &[]).unwrap();
        header[..4].copy_from_slice(&(64 * 1024 * 1024u32).to_le_bytes());
        assert!(decode_header(&header).is_err());

        let container = decode_header_with_limit(&header, u32::MAX).unwrap();
        assert_eq!(container.kind, ContainerType::Data);
        assert_eq!(container.payload_len(), 64 * 1024 * 1024 - HEADER_LEN);
        assert!(container.params.is_empty());
    }
}
