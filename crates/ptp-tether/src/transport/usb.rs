//! PTP over USB (tethered cameras).
//!
//! Claims the still-image interface (class 6, subclass 1, protocol 1), then
//! drives it with nusb:
//!
//! - bulk-OUT carries command and host-to-device data containers
//! - bulk-IN carries device-to-host data and response containers
//! - interrupt-IN (optional) carries event containers
//!
//! Each container is its own USB transfer, terminated by a short packet or a
//! zero-length packet.

use async_trait::async_trait;
use log::{debug, info, warn};
use nusb::descriptors::TransferType;
use nusb::transfer::{Buffer, Bulk, BulkOrInterrupt, Completion, EndpointDirection, In, Interrupt, Out, TransferError};
use nusb::{Endpoint, Interface};
use std::time::Duration;

use crate::config::PtpConfig;
use crate::error::{PtpError, PtpResult};
use crate::ptp::codes::STILL_IMAGE_INTERFACE;
use crate::ptp::container::{
    Container, ContainerType, HEADER_LEN, decode_header, decode_header_with_limit, encode_command, encode_data,
};
use crate::transport::discovery::{self, UsbDeviceRef};
use crate::transport::{
    CommandTransport, EventTransport, Inbound, OperationRequest, OperationResponse, TransportPair,
};
use crate::types::ConnectionType;

/// First bulk-IN read of a container. Large enough for any response in one go.
const FIRST_READ_LEN: usize = 64 * 1024;
/// Upper bound for a single follow-up bulk-IN read.
const MAX_READ_LEN: usize = 1024 * 1024;
const EVENT_READ_LEN: usize = 64;
/// Reaping a cancelled transfer after a timeout.
const CANCEL_REAP_TIMEOUT: Duration = Duration::from_millis(500);
/// Quiet period when draining bulk-IN during recovery.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(50);
/// Containers skipped while looking for the one that belongs to the current transaction.
const MAX_SKIPPED_CONTAINERS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    BulkIn,
    BulkOut,
    InterruptIn,
    Other,
}

impl EndpointKind {
    fn classify(address: u8, transfer_type: TransferType) -> Self {
        let is_in = address & 0x80 != 0;
        match (transfer_type, is_in) {
            (TransferType::Bulk, true) => Self::BulkIn,
            (TransferType::Bulk, false) => Self::BulkOut,
            (TransferType::Interrupt, true) => Self::InterruptIn,
            _ => Self::Other,
        }
    }
}

/// Endpoint addresses resolved from the still-image interface descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointSet {
    pub bulk_in: u8,
    pub bulk_out: u8,
    pub interrupt_in: Option<u8>,
    /// Bulk-IN max packet size; reads are sized in multiples of it.
    pub in_packet_size: usize,
    /// Bulk-OUT max packet size; decides when a write needs a zero-length packet.
    pub out_packet_size: usize,
}

/// Picks the first endpoint of each kind. Both bulk endpoints are required.
pub fn resolve_endpoints(endpoints: &[(u8, EndpointKind, usize)]) -> PtpResult<EndpointSet> {
    let find = |kind: EndpointKind| endpoints.iter().find(|(_, k, _)| *k == kind);
    let bulk_in = find(EndpointKind::BulkIn).ok_or_else(|| PtpError::SetupFailed {
        message: "still-image interface has no bulk-IN endpoint".to_string(),
    })?;
    let bulk_out = find(EndpointKind::BulkOut).ok_or_else(|| PtpError::SetupFailed {
        message: "still-image interface has no bulk-OUT endpoint".to_string(),
    })?;
    Ok(EndpointSet {
        bulk_in: bulk_in.0,
        bulk_out: bulk_out.0,
        interrupt_in: find(EndpointKind::InterruptIn).map(|(address, _, _)| *address),
        in_packet_size: bulk_in.2.max(1),
        out_packet_size: bulk_out.2.max(1),
    })
}

/// A write that fills its last packet exactly must be followed by a zero-length packet.
pub fn needs_zero_length_packet(len: usize, out_packet_size: usize) -> bool {
    len > 0 && len % out_packet_size.max(1) == 0
}

/// Chooses the PTP interface from `(number, class, subclass, protocol)` tuples.
/// An exact still-image triple wins over a bare still-image class.
pub fn pick_interface(interfaces: &[(u8, u8, u8, u8)]) -> Option<u8> {
    let (class, subclass, protocol) = STILL_IMAGE_INTERFACE;
    interfaces
        .iter()
        .find(|(_, c, s, p)| (*c, *s, *p) == (class, subclass, protocol))
        .or_else(|| interfaces.iter().find(|(_, c, _, _)| *c == class))
        .map(|(number, _, _, _)| *number)
}

pub fn round_up_to_packet(len: usize, max_packet: usize) -> usize {
    let max_packet = max_packet.max(1);
    len.max(1).div_ceil(max_packet) * max_packet
}

/// Maps an open/claim failure, looking at the OS error text the same way for every platform.
fn usb_error(device_id: &str, stage: &str, e: impl std::fmt::Display) -> PtpError {
    let message = e.to_string();
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("access denied") || lower.contains("not permitted") {
        PtpError::PermissionDenied {
            device_id: device_id.to_string(),
        }
    } else if lower.contains("busy") || lower.contains("exclusive access") || stage == "claim" {
        PtpError::ClaimFailed {
            device_id: device_id.to_string(),
            message,
        }
    } else if lower.contains("disconnected") || lower.contains("no such device") {
        PtpError::Disconnected
    } else {
        PtpError::Transport {
            message: format!("USB {stage} failed for {device_id}: {message}"),
        }
    }
}

fn transfer_error(e: TransferError, what: &str) -> PtpError {
    match e {
        TransferError::Disconnected => PtpError::Disconnected,
        TransferError::Cancelled => PtpError::timeout(what),
        TransferError::Stall => PtpError::TransferFailed {
            message: format!("{what}: endpoint stalled"),
        },
        other => PtpError::TransferFailed {
            message: format!("{what}: {other}"),
        },
    }
}

/// Waits for the oldest pending transfer. On timeout the transfer is cancelled and reaped.
async fn wait_for_completion<EpType: BulkOrInterrupt, Dir: EndpointDirection>(
    endpoint: &mut Endpoint<EpType, Dir>,
    timeout: Duration,
    what: &str,
) -> PtpResult<Completion> {
    match tokio::time::timeout(timeout, endpoint.next_complete()).await {
        Ok(completion) => Ok(completion),
        Err(_) => {
            endpoint.cancel_all();
            if tokio::time::timeout(CANCEL_REAP_TIMEOUT, endpoint.next_complete())
                .await
                .is_err()
            {
                warn!("{}: cancelled transfer did not complete", what);
            }
            Err(PtpError::timeout(what))
        }
    }
}

fn completed_bytes(completion: &Completion) -> Vec<u8> {
    let n = completion.actual_len.min(completion.buffer.len());
    completion.buffer[..n].to_vec()
}

/// Opens the camera, claims its still-image interface and resolves endpoints.
pub async fn open(device: &UsbDeviceRef, config: &PtpConfig) -> PtpResult<TransportPair> {
    let info = discovery::find_device(device).await?;
    let handle = match tokio::time::timeout(config.handshake_timeout(), info.open()).await {
        Err(_) => return Err(PtpError::timeout(format!("opening USB device {}", device.id))),
        Ok(result) => result.map_err(|e| usb_error(&device.id, "open", e))?,
    };

    let descriptor = handle.active_configuration().map_err(|e| PtpError::SetupFailed {
        message: format!("no active USB configuration on {}: {e}", device.id),
    })?;
    let candidates: Vec<(u8, u8, u8, u8)> = descriptor
        .interface_alt_settings()
        .map(|alt| (alt.interface_number(), alt.class(), alt.subclass(), alt.protocol()))
        .collect();
    let interface_number = pick_interface(&candidates).ok_or_else(|| PtpError::NoPtpInterface {
        device_id: device.id.clone(),
    })?;
    let endpoints: Vec<(u8, EndpointKind, usize)> = descriptor
        .interface_alt_settings()
        .filter(|alt| alt.interface_number() == interface_number)
        .flat_map(|alt| {
            alt.endpoints()
                .map(|ep| {
                    (
                        ep.address(),
                        EndpointKind::classify(ep.address(), ep.transfer_type()),
                        ep.max_packet_size(),
                    )
                })
                .collect::<Vec<_>>()
        })
        .collect();
    let set = resolve_endpoints(&endpoints)?;

    let interface = handle
        .detach_and_claim_interface(interface_number)
        .await
        .map_err(|e| usb_error(&device.id, "claim", e))?;
    debug!(
        "USB {}: claimed interface {} (bulk-in 0x{:02x}, bulk-out 0x{:02x}, interrupt {:?})",
        device.id, interface_number, set.bulk_in, set.bulk_out, set.interrupt_in
    );

    let bulk_in = interface
        .endpoint::<Bulk, In>(set.bulk_in)
        .map_err(|e| PtpError::SetupFailed {
            message: format!("bulk-IN 0x{:02x}: {e}", set.bulk_in),
        })?;
    let bulk_out = interface
        .endpoint::<Bulk, Out>(set.bulk_out)
        .map_err(|e| PtpError::SetupFailed {
            message: format!("bulk-OUT 0x{:02x}: {e}", set.bulk_out),
        })?;
    let events = match set.interrupt_in {
        Some(address) => match interface.endpoint::<Interrupt, In>(address) {
            Ok(endpoint) => Some(UsbEvents {
                device_id: device.id.clone(),
                max_packet_size: endpoint.max_packet_size().max(1),
                interrupt_in: Some(endpoint),
                interface: Some(interface.clone()),
            }),
            Err(e) => {
                warn!("USB {}: interrupt endpoint unusable, events disabled: {}", device.id, e);
                None
            }
        },
        None => {
            info!("USB {}: no interrupt endpoint, events disabled", device.id);
            None
        }
    };

    info!("USB: opened {} ({})", device.display_name(), device.id);
    let command = UsbCommand {
        device_id: device.id.clone(),
        interface: Some(interface),
        bulk_in: Some(bulk_in),
        bulk_out: Some(bulk_out),
        in_packet_size: set.in_packet_size,
        out_packet_size: set.out_packet_size,
        max_object_bytes: config.max_object_bytes,
    };
    Ok(TransportPair {
        command: Box::new(command),
        events: events.map(|e| Box::new(e) as Box<dyn EventTransport>),
    })
}

// ============================================================================
// Bulk (command) half
// ============================================================================

pub struct UsbCommand {
    device_id: String,
    interface: Option<Interface>,
    bulk_in: Option<Endpoint<Bulk, In>>,
    bulk_out: Option<Endpoint<Bulk, Out>>,
    in_packet_size: usize,
    out_packet_size: usize,
    max_object_bytes: u32,
}

impl UsbCommand {
    /// Writes `bytes` to bulk-OUT. Returns the number of bytes transferred.
    pub async fn write(&mut self, bytes: &[u8], timeout: Duration) -> PtpResult<usize> {
        let out_packet_size = self.out_packet_size;
        let endpoint = self.bulk_out.as_mut().ok_or(PtpError::Disconnected)?;
        endpoint.submit(Buffer::from(bytes.to_vec()));
        let completion = wait_for_completion(endpoint, timeout, "USB bulk write").await?;
        completion.status.map_err(|e| transfer_error(e, "USB bulk write"))?;

        // Terminate a transfer that ends on a packet boundary.
        if needs_zero_length_packet(bytes.len(), out_packet_size) {
            endpoint.submit(Buffer::from(Vec::<u8>::new()));
            let zlp = wait_for_completion(endpoint, timeout, "USB zero-length packet").await?;
            zlp.status.map_err(|e| transfer_error(e, "USB zero-length packet"))?;
        }
        Ok(completion.actual_len)
    }

    /// Reads up to `max_bytes` (rounded up to the packet size) from bulk-IN.
    pub async fn read(&mut self, max_bytes: usize, timeout: Duration) -> PtpResult<Vec<u8>> {
        let len = round_up_to_packet(max_bytes, self.in_packet_size);
        let endpoint = self.bulk_in.as_mut().ok_or(PtpError::Disconnected)?;
        let buffer = endpoint.allocate(len);
        endpoint.submit(buffer);
        let completion = wait_for_completion(endpoint, timeout, "USB bulk read").await?;
        completion.status.map_err(|e| transfer_error(e, "USB bulk read"))?;
        Ok(completed_bytes(&completion))
    }

    async fn write_container(&mut self, bytes: &[u8], timeout: Duration) -> PtpResult<()> {
        let written = self.write(bytes, timeout).await?;
        if written != bytes.len() {
            return Err(PtpError::TransferFailed {
                message: format!("short bulk write: {written} of {} bytes", bytes.len()),
            });
        }
        Ok(())
    }

    /// Reads one whole container: header first, then the rest of the declared length.
    async fn read_container(&mut self, timeout: Duration) -> PtpResult<(Container, Vec<u8>)> {
        let mut bytes = self.read(FIRST_READ_LEN, timeout).await?;
        if bytes.is_empty() {
            // Zero-length packet closing the previous transfer.
            bytes = self.read(FIRST_READ_LEN, timeout).await?;
        }
        let limit = self.max_object_bytes.saturating_add(HEADER_LEN as u32);
        let header = decode_header_with_limit(&bytes, limit)?;
        let declared = header.length as usize;

        if bytes.len() < declared {
            bytes.reserve(declared - bytes.len());
        }
        while bytes.len() < declared {
            let want = (declared - bytes.len()).min(MAX_READ_LEN);
            let chunk = self.read(want, timeout).await?;
            if chunk.is_empty() {
                break;
            }
            bytes.extend_from_slice(&chunk);
        }
        if bytes.len() < declared {
            return Err(PtpError::IncompleteData {
                received: (bytes.len() - HEADER_LEN) as u64,
                expected: (declared - HEADER_LEN) as u64,
            });
        }
        bytes.truncate(declared);
        let payload = bytes.split_off(HEADER_LEN);
        Ok((header, payload))
    }

    /// Clears a halt condition on both bulk endpoints. Best effort.
    pub async fn clear_stall(&mut self) {
        if let Some(endpoint) = self.bulk_in.as_mut()
            && let Err(e) = endpoint.clear_halt().await
        {
            debug!("USB {}: clear halt on bulk-IN: {}", self.device_id, e);
        }
        if let Some(endpoint) = self.bulk_out.as_mut()
            && let Err(e) = endpoint.clear_halt().await
        {
            debug!("USB {}: clear halt on bulk-OUT: {}", self.device_id, e);
        }
    }

    /// Discards whatever the camera still has queued on bulk-IN.
    async fn drain(&mut self) {
        let mut drained = 0usize;
        while let Ok(chunk) = self.read(FIRST_READ_LEN, DRAIN_TIMEOUT).await {
            if chunk.is_empty() {
                break;
            }
            drained += chunk.len();
        }
        if drained > 0 {
            debug!("USB {}: discarded {} stale bytes", self.device_id, drained);
        }
    }

    /// Releases the interface. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut endpoint) = self.bulk_in.take() {
            endpoint.cancel_all();
        }
        if let Some(mut endpoint) = self.bulk_out.take() {
            endpoint.cancel_all();
        }
        if self.interface.take().is_some() {
            info!("USB {}: interface released", self.device_id);
        }
    }
}

#[async_trait]
impl CommandTransport for UsbCommand {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Usb
    }

    async fn send_request(&mut self, request: &OperationRequest, timeout: Duration) -> PtpResult<()> {
        let bytes = encode_command(request.code, request.transaction_id, &request.params)?;
        self.write_container(&bytes, timeout).await
    }

    async fn send_data(&mut self, request: &OperationRequest, payload: &[u8], timeout: Duration) -> PtpResult<()> {
        let bytes = encode_data(request.code, request.transaction_id, payload)?;
        self.write_container(&bytes, timeout).await
    }

    async fn receive_data(&mut self, request: &OperationRequest, timeout: Duration) -> PtpResult<Inbound> {
        for _ in 0..MAX_SKIPPED_CONTAINERS {
            let (header, payload) = self.read_container(timeout).await?;
            let current = header.transaction_id >= request.transaction_id;
            match header.kind {
                ContainerType::Data if current => return Ok(Inbound::Data(payload)),
                ContainerType::Response if current => {
                    return Ok(Inbound::Response(OperationResponse {
                        code: header.code,
                        transaction_id: header.transaction_id,
                        params: header.params,
                    }));
                }
                kind => debug!(
                    "USB {}: skipping {:?} container for tid={} (want tid={})",
                    self.device_id, kind, header.transaction_id, request.transaction_id
                ),
            }
        }
        Err(PtpError::malformed(format!(
            "no data phase for tid={}",
            request.transaction_id
        )))
    }

    async fn receive_response(&mut self, timeout: Duration) -> PtpResult<OperationResponse> {
        for _ in 0..MAX_SKIPPED_CONTAINERS {
            let (header, _) = self.read_container(timeout).await?;
            if header.kind == ContainerType::Response {
                return Ok(OperationResponse {
                    code: header.code,
                    transaction_id: header.transaction_id,
                    params: header.params,
                });
            }
            debug!(
                "USB {}: skipping {:?} container while waiting for a response",
                self.device_id, header.kind
            );
        }
        Err(PtpError::malformed("no response container"))
    }

    async fn recover(&mut self) {
        self.clear_stall().await;
        self.drain().await;
    }

    async fn close(&mut self) {
        UsbCommand::close(self).await;
    }
}

// ============================================================================
// Interrupt (event) half
// ============================================================================

pub struct UsbEvents {
    device_id: String,
    interrupt_in: Option<Endpoint<Interrupt, In>>,
    max_packet_size: usize,
    /// Keeps the claim alive while only the event half is left.
    interface: Option<Interface>,
}

impl UsbEvents {
    /// Waits up to `timeout` for an event container on the interrupt endpoint.
    ///
    /// A pending transfer survives a timeout and is picked up by the next call.
    pub async fn read_event(&mut self, timeout: Duration) -> PtpResult<Option<Container>> {
        let len = round_up_to_packet(EVENT_READ_LEN, self.max_packet_size);
        let endpoint = self.interrupt_in.as_mut().ok_or(PtpError::Disconnected)?;
        if endpoint.pending() == 0 {
            let buffer = endpoint.allocate(len);
            endpoint.submit(buffer);
        }
        let completion = match tokio::time::timeout(timeout, endpoint.next_complete()).await {
            Err(_) => return Ok(None),
            Ok(completion) => completion,
        };
        match completion.status {
            Ok(()) => {}
            Err(TransferError::Cancelled) => return Ok(None),
            Err(e) => return Err(transfer_error(e, "USB interrupt read")),
        }
        let bytes = completed_bytes(&completion);
        if bytes.is_empty() {
            return Ok(None);
        }
        decode_header(&bytes).map(Some)
    }

    pub async fn close(&mut self) {
        if let Some(mut endpoint) = self.interrupt_in.take() {
            endpoint.cancel_all();
            debug!("USB {}: event endpoint closed", self.device_id);
        }
        if self.interface.take().is_some() {
            debug!("USB {}: event half released its interface handle", self.device_id);
        }
    }
}

#[async_trait]
impl EventTransport for UsbEvents {
    async fn next_event(&mut self, timeout: Duration) -> PtpResult<Option<Container>> {
        self.read_event(timeout).await
    }

    async fn close(&mut self) {
        UsbEvents::close(self).await;
    }
}
