//! PTP over TCP/IP (WiFi cameras).
//!
//! Connection setup opens two sockets to the responder:
//!
//! 1. Command channel: INIT_COMMAND_REQUEST → INIT_COMMAND_ACK (carries the
//!    connection number).
//! 2. Event channel: INIT_EVENT_REQUEST(connection number) → INIT_EVENT_ACK.
//!
//! INIT_FAIL on either step fails the connect with `HandshakeFailed`. Any
//! failure closes both sockets.

pub mod packet;

use async_trait::async_trait;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::config::PtpConfig;
use crate::error::{PtpError, PtpResult};
use crate::ptp::container::{Container, ContainerType, HEADER_LEN};
use crate::transport::{
    CommandTransport, DataDirection, EventTransport, Inbound, OperationRequest, OperationResponse, TransportPair,
};
use crate::types::ConnectionType;

use packet::{DATA_PHASE_NONE_OR_IN, DATA_PHASE_OUT, PTPIP_VERSION, Packet, PacketReader, write_packet};

/// Payload bytes per DATA packet when sending to the camera.
const SEND_CHUNK_LEN: usize = 64 * 1024;
/// How long `recover` waits for leftover bytes before declaring the socket drained.
const DRAIN_QUIET_PERIOD: Duration = Duration::from_millis(50);
/// Upper bound for buffer preallocation from a declared data length.
const MAX_PREALLOCATION: u64 = 16 * 1024 * 1024;

/// Friendly name announced in INIT_COMMAND_REQUEST.
fn client_name(config: &PtpConfig) -> String {
    config
        .client_name
        .clone()
        .or_else(sysinfo::System::host_name)
        .unwrap_or_else(|| "ptp-tether".to_string())
}

fn client_guid(config: &PtpConfig) -> [u8; 16] {
    let configured = config
        .client_guid
        .as_deref()
        .and_then(|s| match uuid::Uuid::parse_str(s) {
            Ok(guid) => Some(guid),
            Err(e) => {
                warn!("Ignoring invalid PTP/IP client GUID '{}': {}", s, e);
                None
            }
        });
    *configured.unwrap_or_else(uuid::Uuid::new_v4).as_bytes()
}

/// Connects both PTP/IP channels and runs the init handshakes.
pub async fn connect(host: &str, port: u16, config: &PtpConfig) -> PtpResult<TransportPair> {
    let address = format!("{host}:{port}");
    let timeout = config.handshake_timeout();
    let max_packet = config.max_object_bytes.max(config.max_container_bytes);
    info!("PTP/IP: connecting to {}", address);

    let mut command_stream = open_socket(&address, timeout).await?;
    let mut command_reader = PacketReader::new(max_packet);

    let init = Packet::InitCommandRequest {
        guid: client_guid(config),
        name: client_name(config),
        version: PTPIP_VERSION,
    };
    let ack = match handshake(&mut command_stream, &mut command_reader, &init, timeout, "INIT_COMMAND").await {
        Ok(ack) => ack,
        Err(e) => {
            close_stream(command_stream).await;
            return Err(e);
        }
    };
    let (connection_number, responder_name) = match ack {
        Packet::InitCommandAck {
            connection_number,
            name,
            ..
        } => (connection_number, name),
        other => {
            close_stream(command_stream).await;
            return Err(unexpected_handshake_packet("INIT_COMMAND_ACK", &other));
        }
    };
    debug!(
        "PTP/IP: command channel up, connection number {} ({})",
        connection_number, responder_name
    );

    let event_result = async {
        let mut event_stream = open_socket(&address, timeout).await?;
        let mut event_reader = PacketReader::new(config.max_container_bytes);
        let request = Packet::InitEventRequest { connection_number };
        match handshake(&mut event_stream, &mut event_reader, &request, timeout, "INIT_EVENT").await {
            Ok(Packet::InitEventAck) => Ok((event_stream, event_reader)),
            Ok(other) => {
                close_stream(event_stream).await;
                Err(unexpected_handshake_packet("INIT_EVENT_ACK", &other))
            }
            Err(e) => {
                close_stream(event_stream).await;
                Err(e)
            }
        }
    }
    .await;

    let (event_stream, event_reader) = match event_result {
        Ok(channel) => channel,
        Err(e) => {
            warn!("PTP/IP: event channel setup failed: {}", e);
            close_stream(command_stream).await;
            return Err(e);
        }
    };

    info!("PTP/IP: connected to '{}' at {}", responder_name, address);

    let command = PtpIpCommand {
        address: address.clone(),
        stream: Some(command_stream),
        reader: command_reader,
        connection_number,
        responder_name,
        pending_response: None,
        min_data_ratio: config.min_data_ratio,
        max_object_bytes: config.max_object_bytes,
    };
    let events = PtpIpEvents {
        address,
        stream: Some(event_stream),
        reader: event_reader,
    };
    Ok(TransportPair {
        command: Box::new(command),
        events: Some(Box::new(events)),
    })
}

async fn open_socket(address: &str, timeout: Duration) -> PtpResult<TcpStream> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Err(_) => return Err(PtpError::timeout(format!("connecting to {address}"))),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            return Err(PtpError::ConnectionRefused {
                address: address.to_string(),
            });
        }
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(stream)) => stream,
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn handshake(
    stream: &mut TcpStream,
    reader: &mut PacketReader,
    request: &Packet,
    timeout: Duration,
    stage: &str,
) -> PtpResult<Packet> {
    let exchange = async {
        write_packet(stream, request).await?;
        reader.next_packet(stream).await
    };
    match tokio::time::timeout(timeout, exchange).await {
        Err(_) => Err(PtpError::timeout(format!("PTP/IP {stage} handshake"))),
        Ok(Ok(Packet::InitFail { reason })) => {
            warn!("PTP/IP: {} rejected with reason 0x{:08x}", stage, reason);
            Err(PtpError::HandshakeFailed { reason })
        }
        Ok(result) => result,
    }
}

fn unexpected_handshake_packet(expected: &str, got: &Packet) -> PtpError {
    PtpError::malformed(format!(
        "expected {expected}, got packet type {}",
        got.packet_type()
    ))
}

async fn close_stream(mut stream: TcpStream) {
    if let Err(e) = stream.shutdown().await {
        debug!("PTP/IP: socket shutdown: {}", e);
    }
}

// ============================================================================
// Command channel
// ============================================================================

pub struct PtpIpCommand {
    address: String,
    stream: Option<TcpStream>,
    reader: PacketReader,
    connection_number: u32,
    responder_name: String,
    /// Response that arrived while a data phase was still being read.
    pending_response: Option<OperationResponse>,
    min_data_ratio: f64,
    max_object_bytes: u32,
}

impl PtpIpCommand {
    pub fn connection_number(&self) -> u32 {
        self.connection_number
    }

    pub fn responder_name(&self) -> &str {
        &self.responder_name
    }

    async fn write(&mut self, packet: &Packet, timeout: Duration) -> PtpResult<()> {
        let stream = self.stream.as_mut().ok_or(PtpError::Disconnected)?;
        match tokio::time::timeout(timeout, write_packet(stream, packet)).await {
            Ok(result) => result,
            Err(_) => Err(PtpError::timeout(format!("PTP/IP write to {}", self.address))),
        }
    }

    async fn read_until(&mut self, deadline: Instant) -> PtpResult<Packet> {
        let stream = self.stream.as_mut().ok_or(PtpError::Disconnected)?;
        match tokio::time::timeout_at(deadline, self.reader.next_packet(stream)).await {
            Ok(result) => result,
            Err(_) => Err(PtpError::timeout(format!("PTP/IP read from {}", self.address))),
        }
    }

    async fn answer_probe(&mut self) -> PtpResult<()> {
        debug!("PTP/IP: answering probe on command channel");
        self.write(&Packet::ProbeResponse, Duration::from_secs(1)).await
    }

    /// Sends OPERATION_REQUEST. `data_phase` is 1 (none or device-to-host) or 2 (host-to-device).
    pub async fn send_operation(
        &mut self,
        code: u16,
        data_phase: u32,
        transaction_id: u32,
        params: &[u32],
        timeout: Duration,
    ) -> PtpResult<()> {
        let packet = Packet::OperationRequest {
            data_phase,
            code,
            transaction_id,
            params: params.to_vec(),
        };
        self.write(&packet, timeout).await
    }

    /// Reads the next OPERATION_RESPONSE, skipping leftover data packets.
    pub async fn read_operation_response(&mut self, timeout: Duration) -> PtpResult<OperationResponse> {
        if let Some(response) = self.pending_response.take() {
            return Ok(response);
        }
        let deadline = Instant::now() + timeout;
        loop {
            match self.read_until(deadline).await? {
                Packet::OperationResponse {
                    code,
                    transaction_id,
                    params,
                } => {
                    return Ok(OperationResponse {
                        code,
                        transaction_id,
                        params,
                    });
                }
                Packet::ProbeRequest => self.answer_probe().await?,
                other => debug!(
                    "PTP/IP: skipping packet type {} while waiting for a response",
                    other.packet_type()
                ),
            }
        }
    }

    /// Reads START_DATA, DATA*, END_DATA for `transaction_id`.
    ///
    /// `timeout` applies to each packet. A phase that stalls after reaching
    /// `min_data_ratio` of the declared length is accepted as-is; below that
    /// it fails with `IncompleteData`.
    pub async fn read_data_phase(&mut self, transaction_id: u32, timeout: Duration) -> PtpResult<Inbound> {
        let total = loop {
            match self.read_until(Instant::now() + timeout).await? {
                Packet::StartData {
                    transaction_id: tid,
                    total_length,
                } if tid == transaction_id => break total_length,
                Packet::OperationResponse {
                    code,
                    transaction_id: tid,
                    params,
                } if tid >= transaction_id => {
                    return Ok(Inbound::Response(OperationResponse {
                        code,
                        transaction_id: tid,
                        params,
                    }));
                }
                Packet::ProbeRequest => self.answer_probe().await?,
                other => debug!(
                    "PTP/IP: skipping stale packet type {} before data phase of tid={}",
                    other.packet_type(),
                    transaction_id
                ),
            }
        };

        if total > u64::from(self.max_object_bytes) {
            return Err(PtpError::malformed(format!("declared data length {total} exceeds limit")));
        }

        let mut payload = Vec::with_capacity(total.min(MAX_PREALLOCATION) as usize);
        while (payload.len() as u64) < total {
            let packet = match self.read_until(Instant::now() + timeout).await {
                Ok(packet) => packet,
                Err(PtpError::Timeout { .. }) => {
                    warn!(
                        "PTP/IP: data phase tid={} stalled at {}/{} bytes",
                        transaction_id,
                        payload.len(),
                        total
                    );
                    break;
                }
                Err(e) => return Err(e),
            };
            match packet {
                Packet::Data {
                    transaction_id: tid,
                    payload: chunk,
                } if tid == transaction_id => payload.extend_from_slice(&chunk),
                Packet::EndData {
                    transaction_id: tid,
                    payload: chunk,
                } if tid == transaction_id => {
                    payload.extend_from_slice(&chunk);
                    break;
                }
                Packet::OperationResponse {
                    code,
                    transaction_id: tid,
                    params,
                } => {
                    self.pending_response = Some(OperationResponse {
                        code,
                        transaction_id: tid,
                        params,
                    });
                    break;
                }
                Packet::ProbeRequest => self.answer_probe().await?,
                other => debug!("PTP/IP: skipping packet type {} inside data phase", other.packet_type()),
            }
        }

        let received = payload.len() as u64;
        if received >= total {
            payload.truncate(total as usize);
            return Ok(Inbound::Data(payload));
        }
        if total > 0 && received as f64 >= total as f64 * self.min_data_ratio {
            warn!(
                "PTP/IP: accepting incomplete data phase tid={} ({} of {} bytes)",
                transaction_id, received, total
            );
            return Ok(Inbound::Data(payload));
        }
        Err(PtpError::IncompleteData {
            received,
            expected: total,
        })
    }

    /// Sends START_DATA, DATA* and a final END_DATA.
    pub async fn write_data_phase(&mut self, transaction_id: u32, payload: &[u8], timeout: Duration) -> PtpResult<()> {
        self.write(
            &Packet::StartData {
                transaction_id,
                total_length: payload.len() as u64,
            },
            timeout,
        )
        .await?;

        let mut chunks = payload.chunks(SEND_CHUNK_LEN).peekable();
        if chunks.peek().is_none() {
            return self
                .write(
                    &Packet::EndData {
                        transaction_id,
                        payload: Vec::new(),
                    },
                    timeout,
                )
                .await;
        }
        while let Some(chunk) = chunks.next() {
            let packet = if chunks.peek().is_some() {
                Packet::Data {
                    transaction_id,
                    payload: chunk.to_vec(),
                }
            } else {
                Packet::EndData {
                    transaction_id,
                    payload: chunk.to_vec(),
                }
            };
            self.write(&packet, timeout).await?;
        }
        Ok(())
    }

    /// Drops buffered input and whatever the socket still delivers.
    async fn drain(&mut self) {
        let mut drained = self.reader.buffered();
        self.reader.clear();
        self.pending_response = None;
        if let Some(stream) = self.stream.as_mut() {
            let mut scratch = [0u8; 4096];
            while let Ok(Ok(n)) = tokio::time::timeout(DRAIN_QUIET_PERIOD, stream.read(&mut scratch)).await {
                if n == 0 {
                    break;
                }
                drained += n;
            }
        }
        if drained > 0 {
            debug!("PTP/IP: discarded {} stale bytes from {}", drained, self.address);
        }
    }

    /// Closes the command socket. Idempotent.
    pub async fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            close_stream(stream).await;
            info!("PTP/IP: command channel to {} closed", self.address);
        }
    }
}

#[async_trait]
impl CommandTransport for PtpIpCommand {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Network
    }

    async fn send_request(&mut self, request: &OperationRequest, timeout: Duration) -> PtpResult<()> {
        let data_phase = match request.data_direction {
            DataDirection::Out => DATA_PHASE_OUT,
            DataDirection::None | DataDirection::In => DATA_PHASE_NONE_OR_IN,
        };
        self.send_operation(request.code, data_phase, request.transaction_id, &request.params, timeout)
            .await
    }

    async fn send_data(&mut self, request: &OperationRequest, payload: &[u8], timeout: Duration) -> PtpResult<()> {
        self.write_data_phase(request.transaction_id, payload, timeout).await
    }

    async fn receive_data(&mut self, request: &OperationRequest, timeout: Duration) -> PtpResult<Inbound> {
        self.read_data_phase(request.transaction_id, timeout).await
    }

    async fn receive_response(&mut self, timeout: Duration) -> PtpResult<OperationResponse> {
        self.read_operation_response(timeout).await
    }

    async fn recover(&mut self) {
        self.drain().await;
    }

    async fn close(&mut self) {
        PtpIpCommand::close(self).await;
    }
}

// ============================================================================
// Event channel
// ============================================================================

pub struct PtpIpEvents {
    address: String,
    stream: Option<TcpStream>,
    reader: PacketReader,
}

impl PtpIpEvents {
    /// Waits up to `timeout` for an EVENT packet. Answers probes along the way.
    pub async fn read_event_packet(&mut self, timeout: Duration) -> PtpResult<Option<Container>> {
        let stream = self.stream.as_mut().ok_or(PtpError::Disconnected)?;
        let packet = match tokio::time::timeout(timeout, self.reader.next_packet(stream)).await {
            Err(_) => return Ok(None),
            Ok(Ok(packet)) => packet,
            Ok(Err(e)) if !self.reader.in_sync() => {
                warn!("PTP/IP: event channel from {} lost framing ({}), closing it", self.address, e);
                self.close().await;
                return Err(PtpError::Transport {
                    message: format!("event channel lost framing: {e}"),
                });
            }
            Ok(Err(e)) => return Err(e),
        };
        match packet {
            Packet::Event {
                code,
                transaction_id,
                params,
            } => Ok(Some(Container {
                length: (HEADER_LEN + params.len() * 4) as u32,
                kind: ContainerType::Event,
                code,
                transaction_id,
                params,
            })),
            Packet::ProbeRequest => {
                debug!("PTP/IP: answering probe on event channel");
                let stream = self.stream.as_mut().ok_or(PtpError::Disconnected)?;
                write_packet(stream, &Packet::ProbeResponse).await?;
                Ok(None)
            }
            other => {
                debug!("PTP/IP: ignoring packet type {} on event channel", other.packet_type());
                Ok(None)
            }
        }
    }

    pub async fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            close_stream(stream).await;
            info!("PTP/IP: event channel to {} closed", self.address);
        }
    }
}

#[async_trait]
impl EventTransport for PtpIpEvents {
    async fn next_event(&mut self, timeout: Duration) -> PtpResult<Option<Container>> {
        self.read_event_packet(timeout).await
    }

    async fn close(&mut self) {
        PtpIpEvents::close(self).await;
    }
}

#[cfg(test)]
#[path = "ptpip_test.rs"]
mod ptpip_test;
