//! PTP/IP packet framing.
//!
//! Each packet is `length: u32 LE` (header included), `type: u32 LE`, then a
//! type-specific body. `PacketReader` keeps partially received bytes between
//! calls, so a read cut short by a timeout loses nothing.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{PtpError, PtpResult};
use crate::ptp::container::MAX_PARAMS;

pub const PACKET_HEADER_LEN: usize = 8;
pub const PTPIP_VERSION: u32 = 0x0001_0000;

/// Data phase flag in OPERATION_REQUEST.
pub const DATA_PHASE_NONE_OR_IN: u32 = 1;
pub const DATA_PHASE_OUT: u32 = 2;

pub const TYPE_INIT_COMMAND_REQUEST: u32 = 1;
pub const TYPE_INIT_COMMAND_ACK: u32 = 2;
pub const TYPE_INIT_EVENT_REQUEST: u32 = 3;
pub const TYPE_INIT_EVENT_ACK: u32 = 4;
pub const TYPE_INIT_FAIL: u32 = 5;
pub const TYPE_OPERATION_REQUEST: u32 = 6;
pub const TYPE_OPERATION_RESPONSE: u32 = 7;
pub const TYPE_EVENT: u32 = 8;
pub const TYPE_START_DATA: u32 = 9;
pub const TYPE_DATA: u32 = 10;
pub const TYPE_CANCEL: u32 = 11;
pub const TYPE_END_DATA: u32 = 12;
pub const TYPE_PROBE_REQUEST: u32 = 13;
pub const TYPE_PROBE_RESPONSE: u32 = 14;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    InitCommandRequest {
        guid: [u8; 16],
        name: String,
        version: u32,
    },
    InitCommandAck {
        connection_number: u32,
        guid: [u8; 16],
        name: String,
        version: u32,
    },
    InitEventRequest {
        connection_number: u32,
    },
    InitEventAck,
    InitFail {
        reason: u32,
    },
    OperationRequest {
        data_phase: u32,
        code: u16,
        transaction_id: u32,
        params: Vec<u32>,
    },
    OperationResponse {
        code: u16,
        transaction_id: u32,
        params: Vec<u32>,
    },
    Event {
        code: u16,
        transaction_id: u32,
        params: Vec<u32>,
    },
    StartData {
        transaction_id: u32,
        total_length: u64,
    },
    Data {
        transaction_id: u32,
        payload: Vec<u8>,
    },
    EndData {
        transaction_id: u32,
        payload: Vec<u8>,
    },
    Cancel {
        transaction_id: u32,
    },
    ProbeRequest,
    ProbeResponse,
}

impl Packet {
    pub fn packet_type(&self) -> u32 {
        match self {
            Packet::InitCommandRequest { .. } => TYPE_INIT_COMMAND_REQUEST,
            Packet::InitCommandAck { .. } => TYPE_INIT_COMMAND_ACK,
            Packet::InitEventRequest { .. } => TYPE_INIT_EVENT_REQUEST,
            Packet::InitEventAck => TYPE_INIT_EVENT_ACK,
            Packet::InitFail { .. } => TYPE_INIT_FAIL,
            Packet::OperationRequest { .. } => TYPE_OPERATION_REQUEST,
            Packet::OperationResponse { .. } => TYPE_OPERATION_RESPONSE,
            Packet::Event { .. } => TYPE_EVENT,
            Packet::StartData { .. } => TYPE_START_DATA,
            Packet::Data { .. } => TYPE_DATA,
            Packet::Cancel { .. } => TYPE_CANCEL,
            Packet::EndData { .. } => TYPE_END_DATA,
            Packet::ProbeRequest => TYPE_PROBE_REQUEST,
            Packet::ProbeResponse => TYPE_PROBE_RESPONSE,
        }
    }

    pub fn encode(&self) -> PtpResult<Vec<u8>> {
        let mut body = BytesMut::new();
        match self {
            Packet::InitCommandRequest { guid, name, version } => {
                body.put_slice(guid);
                put_name(&mut body, name);
                body.put_u32_le(*version);
            }
            Packet::InitCommandAck {
                connection_number,
                guid,
                name,
                version,
            } => {
                body.put_u32_le(*connection_number);
                body.put_slice(guid);
                put_name(&mut body, name);
                body.put_u32_le(*version);
            }
            Packet::InitEventRequest { connection_number } => body.put_u32_le(*connection_number),
            Packet::InitFail { reason } => body.put_u32_le(*reason),
            Packet::OperationRequest {
                data_phase,
                code,
                transaction_id,
                params,
            } => {
                check_params(params)?;
                body.put_u32_le(*data_phase);
                body.put_u16_le(*code);
                body.put_u32_le(*transaction_id);
                params.iter().for_each(|p| body.put_u32_le(*p));
            }
            Packet::OperationResponse {
                code,
                transaction_id,
                params,
            }
            | Packet::Event {
                code,
                transaction_id,
                params,
            } => {
                check_params(params)?;
                body.put_u16_le(*code);
                body.put_u32_le(*transaction_id);
                params.iter().for_each(|p| body.put_u32_le(*p));
            }
            Packet::StartData {
                transaction_id,
                total_length,
            } => {
                body.put_u32_le(*transaction_id);
                body.put_u64_le(*total_length);
            }
            Packet::Data {
                transaction_id,
                payload,
            }
            | Packet::EndData {
                transaction_id,
                payload,
            } => {
                body.put_u32_le(*transaction_id);
                body.put_slice(payload);
            }
            Packet::Cancel { transaction_id } => body.put_u32_le(*transaction_id),
            Packet::InitEventAck | Packet::ProbeRequest | Packet::ProbeResponse => {}
        }

        let length = u32::try_from(PACKET_HEADER_LEN + body.len())
            .map_err(|_| PtpError::malformed("PTP/IP packet too large"))?;
        let mut out = Vec::with_capacity(length as usize);
        out.put_u32_le(length);
        out.put_u32_le(self.packet_type());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decodes a packet body (everything after the 8-byte header).
    pub fn decode(packet_type: u32, body: &[u8]) -> PtpResult<Packet> {
        let mut cur = body;
        let packet = match packet_type {
            TYPE_INIT_COMMAND_REQUEST => {
                let guid = take_guid(&mut cur)?;
                let (name, version) = take_name_and_version(&mut cur)?;
                Packet::InitCommandRequest { guid, name, version }
            }
            TYPE_INIT_COMMAND_ACK => {
                let connection_number = take_u32(&mut cur)?;
                let guid = take_guid(&mut cur)?;
                let (name, version) = take_name_and_version(&mut cur)?;
                Packet::InitCommandAck {
                    connection_number,
                    guid,
                    name,
                    version,
                }
            }
            TYPE_INIT_EVENT_REQUEST => Packet::InitEventRequest {
                connection_number: take_u32(&mut cur)?,
            },
            TYPE_INIT_EVENT_ACK => Packet::InitEventAck,
            TYPE_INIT_FAIL => Packet::InitFail {
                // Some responders send a bare INIT_FAIL.
                reason: if cur.len() >= 4 { cur.get_u32_le() } else { 0 },
            },
            TYPE_OPERATION_REQUEST => {
                let data_phase = take_u32(&mut cur)?;
                let code = take_u16(&mut cur)?;
                let transaction_id = take_u32(&mut cur)?;
                Packet::OperationRequest {
                    data_phase,
                    code,
                    transaction_id,
                    params: take_params(&mut cur),
                }
            }
            TYPE_OPERATION_RESPONSE | TYPE_EVENT => {
                let code = take_u16(&mut cur)?;
                let transaction_id = take_u32(&mut cur)?;
                let params = take_params(&mut cur);
                if packet_type == TYPE_EVENT {
                    Packet::Event {
                        code,
                        transaction_id,
                        params,
                    }
                } else {
                    Packet::OperationResponse {
                        code,
                        transaction_id,
                        params,
                    }
                }
            }
            TYPE_START_DATA => {
                let transaction_id = take_u32(&mut cur)?;
                if cur.len() < 8 {
                    return Err(PtpError::malformed("START_DATA without total length"));
                }
                Packet::StartData {
                    transaction_id,
                    total_length: cur.get_u64_le(),
                }
            }
            TYPE_DATA => Packet::Data {
                transaction_id: take_u32(&mut cur)?,
                payload: cur.to_vec(),
            },
            TYPE_END_DATA => Packet::EndData {
                transaction_id: take_u32(&mut cur)?,
                payload: cur.to_vec(),
            },
            TYPE_CANCEL => Packet::Cancel {
                transaction_id: take_u32(&mut cur)?,
            },
            TYPE_PROBE_REQUEST => Packet::ProbeRequest,
            TYPE_PROBE_RESPONSE => Packet::ProbeResponse,
            other => return Err(PtpError::malformed(format!("unknown PTP/IP packet type {other}"))),
        };
        Ok(packet)
    }
}

fn check_params(params: &[u32]) -> PtpResult<()> {
    if params.len() > MAX_PARAMS {
        return Err(PtpError::malformed(format!(
            "{} parameters (at most {MAX_PARAMS} allowed)",
            params.len()
        )));
    }
    Ok(())
}

/// Null-terminated UTF-16LE, no count prefix.
fn put_name(buf: &mut BytesMut, name: &str) {
    for unit in name.encode_utf16() {
        buf.put_u16_le(unit);
    }
    buf.put_u16_le(0);
}

fn take_u16(cur: &mut &[u8]) -> PtpResult<u16> {
    if cur.len() < 2 {
        return Err(PtpError::malformed("PTP/IP packet truncated"));
    }
    Ok(cur.get_u16_le())
}

fn take_u32(cur: &mut &[u8]) -> PtpResult<u32> {
    if cur.len() < 4 {
        return Err(PtpError::malformed("PTP/IP packet truncated"));
    }
    Ok(cur.get_u32_le())
}

fn take_guid(cur: &mut &[u8]) -> PtpResult<[u8; 16]> {
    if cur.len() < 16 {
        return Err(PtpError::malformed("PTP/IP packet truncated in GUID"));
    }
    let mut guid = [0u8; 16];
    cur.copy_to_slice(&mut guid);
    Ok(guid)
}

fn take_name_and_version(cur: &mut &[u8]) -> PtpResult<(String, u32)> {
    let mut units = Vec::new();
    loop {
        let unit = take_u16(cur)?;
        if unit == 0 {
            break;
        }
        units.push(unit);
    }
    let name = String::from_utf16_lossy(&units);
    // Version is optional on some responders.
    let version = if cur.len() >= 4 { cur.get_u32_le() } else { 0 };
    Ok((name, version))
}

fn take_params(cur: &mut &[u8]) -> Vec<u32> {
    let mut params = Vec::new();
    while cur.len() >= 4 && params.len() < MAX_PARAMS {
        params.push(cur.get_u32_le());
    }
    params
}

/// Buffers socket input and yields whole packets.
#[derive(Debug)]
pub struct PacketReader {
    buf: BytesMut,
    max_packet_len: u32,
    /// Set once a header with an impossible length arrives. Packet boundaries
    /// are unknown from then on, until `clear`.
    lost_framing: bool,
}

impl PacketReader {
    pub fn new(max_packet_len: u32) -> Self {
        Self {
            buf: BytesMut::with_capacity(64 * 1024),
            max_packet_len,
            lost_framing: false,
        }
    }

    /// Reads the next packet. Cancel-safe: bytes received so far stay buffered.
    pub async fn next_packet<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> PtpResult<Packet> {
        loop {
            if let Some(packet) = self.try_parse()? {
                return Ok(packet);
            }
            let n = reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(PtpError::Disconnected);
            }
        }
    }

    fn try_parse(&mut self) -> PtpResult<Option<Packet>> {
        if self.buf.len() < PACKET_HEADER_LEN {
            return Ok(None);
        }
        let mut header = &self.buf[..PACKET_HEADER_LEN];
        let length = header.get_u32_le();
        let packet_type = header.get_u32_le();
        if (length as usize) < PACKET_HEADER_LEN || length > self.max_packet_len {
            self.lost_framing = true;
            return Err(PtpError::malformed(format!("PTP/IP packet length {length} out of bounds")));
        }
        if self.buf.len() < length as usize {
            self.buf.reserve(length as usize - self.buf.len());
            return Ok(None);
        }
        let frame = self.buf.split_to(length as usize);
        Packet::decode(packet_type, &frame[PACKET_HEADER_LEN..]).map(Some)
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// False after an out-of-bounds length header; the stream can't be resynced in place.
    pub fn in_sync(&self) -> bool {
        !self.lost_framing
    }

    /// Drops anything buffered.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.lost_framing = false;
    }
}

pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> PtpResult<()> {
    let bytes = packet.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
