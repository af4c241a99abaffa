//! Test doubles: scripted transports and a dataset writer for building camera replies.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{PtpError, PtpResult};
use crate::ptp::container::Container;
use crate::ptp::container::ContainerType;
use crate::transport::ptpip::packet::{PTPIP_VERSION, Packet, PacketReader, write_packet};
use crate::transport::{CommandTransport, EventTransport, Inbound, OperationRequest, OperationResponse};
use crate::types::ConnectionType;

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ============================================================================
// Dataset writer
// ============================================================================

/// Builds little-endian PTP datasets the way a camera would send them.
pub(crate) struct DatasetWriter {
    buf: BytesMut,
}

impl DatasetWriter {
    pub(crate) fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    pub(crate) fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub(crate) fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16_le(v);
        self
    }

    pub(crate) fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32_le(v);
        self
    }

    pub(crate) fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64_le(v);
        self
    }

    /// Standard PTP string: count (with null) then UTF-16LE units.
    pub(crate) fn string(&mut self, s: &str) -> &mut Self {
        if s.is_empty() {
            return self.u8(0);
        }
        let units: Vec<u16> = s.encode_utf16().collect();
        self.u8((units.len() + 1) as u8);
        for unit in units {
            self.u16(unit);
        }
        self.u16(0)
    }

    pub(crate) fn u16_array(&mut self, values: &[u16]) -> &mut Self {
        self.u32(values.len() as u32);
        for v in values {
            self.u16(*v);
        }
        self
    }

    pub(crate) fn u32_array(&mut self, values: &[u32]) -> &mut Self {
        self.u32(values.len() as u32);
        for v in values {
            self.u32(*v);
        }
        self
    }

    pub(crate) fn finish(&mut self) -> Vec<u8> {
        self.buf.split().to_vec()
    }

    /// A JPEG ObjectInfo dataset (6000x4000).
    pub(crate) fn object_info(storage_id: u32, filename: &str, size: u32, capture_date: &str) -> Vec<u8> {
        let mut w = Self::new();
        w.u32(storage_id)
            .u16(0x3801)
            .u16(0)
            .u32(size)
            .u16(0x3808)
            .u32(8_192)
            .u32(160)
            .u32(120)
            .u32(6000)
            .u32(4000)
            .u32(24)
            .u32(0)
            .u16(0)
            .u32(0)
            .u32(0)
            .string(filename)
            .string(capture_date)
            .string(capture_date)
            .string("");
        w.finish()
    }

    /// A RemovableRAM StorageInfo dataset.
    pub(crate) fn storage_info(label: &str, max_capacity: u64, free_space: u64) -> Vec<u8> {
        let mut w = Self::new();
        w.u16(4)
            .u16(2)
            .u16(0)
            .u64(max_capacity)
            .u64(free_space)
            .u32(1_000)
            .string("SD card")
            .string(label);
        w.finish()
    }

    pub(crate) fn device_info(manufacturer: &str, model: &str, operations: &[u16]) -> Vec<u8> {
        let mut w = Self::new();
        w.u16(100)
            .u32(6)
            .u16(100)
            .string("")
            .u16(0)
            .u16_array(operations)
            .u16_array(&[0x4002, 0x400d])
            .u16_array(&[])
            .u16_array(&[])
            .u16_array(&[0x3801])
            .string(manufacturer)
            .string(model)
            .string("1.0")
            .string("123456");
        w.finish()
    }
}

// ============================================================================
// Scripted command transport
// ============================================================================

/// What the fake camera does for one request.
#[derive(Debug, Clone)]
pub(crate) struct Reply {
    /// `None`: the camera skips the data phase and answers right away.
    pub(crate) data: Option<PtpResult<Vec<u8>>>,
    pub(crate) response: PtpResult<u16>,
    /// Emit a response for an older transaction before the real one.
    pub(crate) stale_response_first: bool,
}

impl Reply {
    pub(crate) fn ok() -> Self {
        Self::code(0x2001)
    }

    pub(crate) fn code(code: u16) -> Self {
        Self {
            data: None,
            response: Ok(code),
            stale_response_first: false,
        }
    }

    pub(crate) fn data(bytes: Vec<u8>) -> Self {
        Self {
            data: Some(Ok(bytes)),
            response: Ok(0x2001),
            stale_response_first: false,
        }
    }

    pub(crate) fn timeout() -> Self {
        Self {
            data: Some(Err(PtpError::timeout("scripted"))),
            response: Err(PtpError::timeout("scripted")),
            stale_response_first: false,
        }
    }

    /// Data arrives but the response never does.
    pub(crate) fn data_then_silence(bytes: Vec<u8>) -> Self {
        Self {
            data: Some(Ok(bytes)),
            response: Err(PtpError::timeout("scripted")),
            stale_response_first: false,
        }
    }

    pub(crate) fn silence() -> Self {
        Self {
            data: None,
            response: Err(PtpError::timeout("scripted")),
            stale_response_first: false,
        }
    }
}

pub(crate) type Handler = Box<dyn FnMut(&OperationRequest) -> Reply + Send>;

/// Observations shared between a test and its scripted transport.
#[derive(Clone, Default)]
pub(crate) struct Probe {
    pub(crate) requests: Arc<Mutex<Vec<OperationRequest>>>,
    pub(crate) sent_data: Arc<Mutex<Vec<Vec<u8>>>>,
    pub(crate) recoveries: Arc<AtomicUsize>,
    pub(crate) closed: Arc<AtomicBool>,
}

impl Probe {
    pub(crate) fn requests(&self) -> Vec<OperationRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn codes(&self) -> Vec<u16> {
        self.requests().iter().map(|r| r.code).collect()
    }

    pub(crate) fn transaction_ids(&self) -> Vec<u32> {
        self.requests().iter().map(|r| r.transaction_id).collect()
    }
}

pub(crate) struct ScriptedTransport {
    handler: Handler,
    pending: Option<(u32, Reply)>,
    probe: Probe,
}

impl ScriptedTransport {
    pub(crate) fn new(handler: impl FnMut(&OperationRequest) -> Reply + Send + 'static) -> (Self, Probe) {
        let probe = Probe::default();
        let transport = Self {
            handler: Box::new(handler),
            pending: None,
            probe: probe.clone(),
        };
        (transport, probe)
    }
}

#[async_trait]
impl CommandTransport for ScriptedTransport {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Usb
    }

    async fn send_request(&mut self, request: &OperationRequest, _timeout: Duration) -> PtpResult<()> {
        if self.probe.closed.load(Ordering::SeqCst) {
            return Err(PtpError::Disconnected);
        }
        self.probe.requests.lock().unwrap().push(request.clone());
        let reply = (self.handler)(request);
        self.pending = Some((request.transaction_id, reply));
        Ok(())
    }

    async fn send_data(&mut self, _request: &OperationRequest, payload: &[u8], _timeout: Duration) -> PtpResult<()> {
        self.probe.sent_data.lock().unwrap().push(payload.to_vec());
        Ok(())
    }

    async fn receive_data(&mut self, _request: &OperationRequest, _timeout: Duration) -> PtpResult<Inbound> {
        let Some((tid, reply)) = self.pending.as_mut() else {
            return Err(PtpError::timeout("no request pending"));
        };
        match reply.data.take() {
            Some(Ok(bytes)) => Ok(Inbound::Data(bytes)),
            Some(Err(e)) => Err(e),
            None => {
                let tid = *tid;
                let response = self.receive_response(Duration::ZERO).await?;
                debug_assert_eq!(response.transaction_id, tid);
                Ok(Inbound::Response(response))
            }
        }
    }

    async fn receive_response(&mut self, _timeout: Duration) -> PtpResult<OperationResponse> {
        let Some((tid, reply)) = self.pending.as_mut() else {
            return Err(PtpError::timeout("no request pending"));
        };
        if reply.stale_response_first {
            reply.stale_response_first = false;
            return Ok(OperationResponse {
                code: 0x2001,
                transaction_id: tid.wrapping_sub(1),
                params: Vec::new(),
            });
        }
        let tid = *tid;
        let response = reply.response.clone();
        self.pending = None;
        response.map(|code| OperationResponse {
            code,
            transaction_id: tid,
            params: Vec::new(),
        })
    }

    async fn recover(&mut self) {
        self.pending = None;
        self.probe.recoveries.fetch_add(1, Ordering::SeqCst);
    }

    async fn close(&mut self) {
        self.probe.closed.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Scripted event transport
// ============================================================================

pub(crate) struct ScriptedEvents {
    queue: Arc<Mutex<VecDeque<PtpResult<Container>>>>,
    closed: Arc<AtomicBool>,
}

/// Handle a test keeps to push events and check shutdown.
#[derive(Clone)]
pub(crate) struct EventFeed {
    queue: Arc<Mutex<VecDeque<PtpResult<Container>>>>,
    pub(crate) closed: Arc<AtomicBool>,
}

impl EventFeed {
    pub(crate) fn push(&self, code: u16, params: &[u32]) {
        self.queue.lock().unwrap().push_back(Ok(Container {
            length: (12 + params.len() * 4) as u32,
            kind: ContainerType::Event,
            code,
            transaction_id: 0,
            params: params.to_vec(),
        }));
    }

    pub(crate) fn push_error(&self, error: PtpError) {
        self.queue.lock().unwrap().push_back(Err(error));
    }
}

impl ScriptedEvents {
    pub(crate) fn new() -> (Self, EventFeed) {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let feed = EventFeed {
            queue: Arc::clone(&queue),
            closed: Arc::clone(&closed),
        };
        (Self { queue, closed }, feed)
    }
}

#[async_trait]
impl EventTransport for ScriptedEvents {
    async fn next_event(&mut self, timeout: Duration) -> PtpResult<Option<Container>> {
        let next = self.queue.lock().unwrap().pop_front();
        match next {
            Some(Ok(container)) => Ok(Some(container)),
            Some(Err(e)) => Err(e),
            None => {
                // Poll in small steps so freshly pushed events show up promptly.
                tokio::time::sleep(timeout.min(Duration::from_millis(10))).await;
                Ok(None)
            }
        }
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Fake PTP/IP camera
// ============================================================================

/// How the fake camera answers one operation.
#[derive(Debug, Clone, Default)]
pub(crate) struct CameraReply {
    /// Declared length and the bytes actually sent.
    pub(crate) data: Option<(u64, Vec<u8>)>,
    pub(crate) response: Option<u16>,
}

impl CameraReply {
    pub(crate) fn ok() -> Self {
        Self {
            data: None,
            response: Some(0x2001),
        }
    }

    pub(crate) fn code(code: u16) -> Self {
        Self {
            data: None,
            response: Some(code),
        }
    }

    pub(crate) fn data(bytes: Vec<u8>) -> Self {
        Self {
            data: Some((bytes.len() as u64, bytes)),
            response: Some(0x2001),
        }
    }

    /// Declares `declared` bytes but only sends `bytes`.
    pub(crate) fn short_data(declared: u64, bytes: Vec<u8>) -> Self {
        Self {
            data: Some((declared, bytes)),
            response: Some(0x2001),
        }
    }
}

/// An operation request as the fake camera saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SeenRequest {
    pub(crate) code: u16,
    pub(crate) transaction_id: u32,
    pub(crate) params: Vec<u32>,
}

/// A PTP/IP responder on 127.0.0.1 that accepts one client.
pub(crate) struct FakeCamera {
    pub(crate) port: u16,
    requests: Arc<Mutex<Vec<SeenRequest>>>,
    events: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
}

impl FakeCamera {
    pub(crate) async fn start(handler: impl FnMut(u16, &[u32]) -> CameraReply + Send + 'static) -> Self {
        Self::start_with(None, handler).await
    }

    /// `init_fail`: answer INIT_COMMAND_REQUEST with INIT_FAIL(reason).
    pub(crate) async fn start_with(
        init_fail: Option<u32>,
        mut handler: impl FnMut(u16, &[u32]) -> CameraReply + Send + 'static,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let (events, mut event_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let seen = Arc::clone(&requests);

        let task = tokio::spawn(async move {
            let (mut command, _) = listener.accept().await.unwrap();
            let mut reader = PacketReader::new(u32::MAX);
            match reader.next_packet(&mut command).await {
                Ok(Packet::InitCommandRequest { .. }) => {}
                _ => return,
            }
            if let Some(reason) = init_fail {
                let _ = write_packet(&mut command, &Packet::InitFail { reason }).await;
                return;
            }
            let ack = Packet::InitCommandAck {
                connection_number: 1,
                guid: [7; 16],
                name: "Fake EOS".to_string(),
                version: PTPIP_VERSION,
            };
            write_packet(&mut command, &ack).await.unwrap();

            let (mut event_socket, _) = listener.accept().await.unwrap();
            let mut event_reader = PacketReader::new(1024);
            match event_reader.next_packet(&mut event_socket).await {
                Ok(Packet::InitEventRequest { connection_number: 1 }) => {}
                _ => return,
            }
            write_packet(&mut event_socket, &Packet::InitEventAck).await.unwrap();
            tokio::spawn(async move {
                while let Some(bytes) = event_rx.recv().await {
                    if event_socket.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
            });

            while let Ok(packet) = reader.next_packet(&mut command).await {
                let Packet::OperationRequest {
                    code,
                    transaction_id,
                    params,
                    ..
                } = packet
                else {
                    continue;
                };
                seen.lock().unwrap().push(SeenRequest {
                    code,
                    transaction_id,
                    params: params.clone(),
                });
                let reply = handler(code, &params);
                if let Some((declared, bytes)) = reply.data {
                    let start = Packet::StartData {
                        transaction_id,
                        total_length: declared,
                    };
                    if write_packet(&mut command, &start).await.is_err() {
                        break;
                    }
                    let (first, last) = bytes.split_at(bytes.len() / 2);
                    let data = Packet::Data {
                        transaction_id,
                        payload: first.to_vec(),
                    };
                    let end = Packet::EndData {
                        transaction_id,
                        payload: last.to_vec(),
                    };
                    if write_packet(&mut command, &data).await.is_err() || write_packet(&mut command, &end).await.is_err() {
                        break;
                    }
                }
                if let Some(code) = reply.response {
                    let response = Packet::OperationResponse {
                        code,
                        transaction_id,
                        params: Vec::new(),
                    };
                    if write_packet(&mut command, &response).await.is_err() {
                        break;
                    }
                }
            }
        });

        Self {
            port,
            requests,
            events,
            task,
        }
    }

    pub(crate) fn send_event(&self, code: u16, params: &[u32]) {
        self.send_event_packet(&Packet::Event {
            code,
            transaction_id: 0,
            params: params.to_vec(),
        });
    }

    pub(crate) fn send_probe(&self) {
        self.send_event_packet(&Packet::ProbeRequest);
    }

    fn send_event_packet(&self, packet: &Packet) {
        self.send_event_bytes(packet.encode().unwrap());
    }

    /// Writes raw bytes to the event socket, framed or not.
    pub(crate) fn send_event_bytes(&self, bytes: Vec<u8>) {
        let _ = self.events.send(bytes);
    }

    pub(crate) fn requests(&self) -> Vec<SeenRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn codes(&self) -> Vec<u16> {
        self.requests().iter().map(|r| r.code).collect()
    }
}

impl Drop for FakeCamera {
    fn drop(&mut self) {
        self.task.abort();
    }
}
