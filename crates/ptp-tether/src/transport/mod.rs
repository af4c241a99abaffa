//! Transports carrying PTP transactions and events.
//!
//! Two concrete variants sit behind the same seam:
//!
//! - `usb`: a claimed still-image interface with bulk-IN/bulk-OUT endpoints for
//!   transactions and an optional interrupt-IN endpoint for events.
//! - `ptpip`: two TCP sockets (command and event channel) after the PTP/IP
//!   init handshake.
//!
//! The command side and the event side are split into two objects so the event
//! monitor can own its channel outright while the transaction engine owns the
//! command channel. They never share a lock.

pub mod discovery;
pub mod ptpip;
pub mod usb;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::PtpResult;
use crate::ptp::container::Container;
use crate::types::ConnectionType;

/// Direction of an operation's optional data phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    None,
    /// Device to host.
    In,
    /// Host to device.
    Out,
}

/// One outgoing operation, transport-agnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRequest {
    pub code: u16,
    pub transaction_id: u32,
    pub params: Vec<u32>,
    pub data_direction: DataDirection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResponse {
    pub code: u16,
    pub transaction_id: u32,
    pub params: Vec<u32>,
}

/// What arrived when a data phase was expected.
///
/// A camera that rejects an operation skips the data phase and answers with a
/// response straight away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Data(Vec<u8>),
    Response(OperationResponse),
}

/// Command channel: carries one transaction at a time.
#[async_trait]
pub trait CommandTransport: Send {
    fn connection_type(&self) -> ConnectionType;

    /// Sends the operation request (USB command container / PTP/IP OPERATION_REQUEST).
    async fn send_request(&mut self, request: &OperationRequest, timeout: Duration) -> PtpResult<()>;

    /// Sends a host-to-device data phase for `request`.
    async fn send_data(&mut self, request: &OperationRequest, payload: &[u8], timeout: Duration) -> PtpResult<()>;

    /// Reads the device-to-host data phase for `request`. `timeout` applies per read.
    async fn receive_data(&mut self, request: &OperationRequest, timeout: Duration) -> PtpResult<Inbound>;

    /// Reads the next response.
    async fn receive_response(&mut self, timeout: Duration) -> PtpResult<OperationResponse>;

    /// Best-effort recovery before a retry (clear stalls, drop buffered input).
    async fn recover(&mut self);

    /// Releases the underlying resource. Idempotent.
    async fn close(&mut self);
}

/// Event channel: owned exclusively by the event monitor.
#[async_trait]
pub trait EventTransport: Send {
    /// Waits up to `timeout` for an event container. `Ok(None)` means nothing arrived.
    async fn next_event(&mut self, timeout: Duration) -> PtpResult<Option<Container>>;

    /// Idempotent.
    async fn close(&mut self);
}

/// A connected transport, split into its command and (optional) event halves.
pub struct TransportPair {
    pub command: Box<dyn CommandTransport>,
    pub events: Option<Box<dyn EventTransport>>,
}
