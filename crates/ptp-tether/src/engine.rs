//! Transaction engine: one Command → (Data) → Response exchange at a time.
//!
//! The engine is only reachable through `SessionManager::lock`, so holding
//! `&mut TransactionEngine` *is* the per-device transaction lock.
//!
//! Per attempt: allocate the next transaction id, send the request, run the
//! optional data phase, read the response. Transient failures (timeouts,
//! short reads, GeneralError, DeviceBusy, SessionNotOpen, malformed frames)
//! are retried with linear backoff and transport recovery in between. Every
//! attempt gets a fresh transaction id.

use log::{debug, warn};

use crate::config::PtpConfig;
use crate::error::{PtpError, PtpResult};
use crate::ptp::codes::{self, ResponseCode};
use crate::session::Session;
use crate::transport::{CommandTransport, DataDirection, Inbound, OperationRequest, OperationResponse};
use crate::types::ConnectionType;

/// Stale responses tolerated before giving up on a single read.
const MAX_STALE_DISCARDS: usize = 8;

/// What the data phase of an operation looks like.
#[derive(Debug, Clone, Copy)]
enum Plan<'a> {
    NoData,
    /// Device to host, with the expected size if known (scales the read timeout).
    DataIn { expected: Option<u64> },
    DataOut(&'a [u8]),
}

impl Plan<'_> {
    fn direction(&self) -> DataDirection {
        match self {
            Plan::NoData => DataDirection::None,
            Plan::DataIn { .. } => DataDirection::In,
            Plan::DataOut(_) => DataDirection::Out,
        }
    }
}

pub struct TransactionEngine {
    transport: Box<dyn CommandTransport>,
    config: PtpConfig,
    session: Session,
}

impl TransactionEngine {
    pub fn new(transport: Box<dyn CommandTransport>, config: PtpConfig) -> Self {
        Self {
            transport,
            config,
            session: Session::new(0),
        }
    }

    pub fn config(&self) -> &PtpConfig {
        &self.config
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.transport.connection_type()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Starts a fresh session context; the next transaction id will be 1.
    pub(crate) fn begin_session(&mut self, session_id: u32) {
        self.session = Session::new(session_id);
    }

    /// Counts a transaction as successful even though it returned an error code
    /// the caller treats as success (SessionAlreadyOpen).
    pub(crate) fn note_success(&mut self) {
        self.session.record_success();
    }

    /// Runs `op_code` with the retry policy. Returns the data phase payload if
    /// `expects_data_in`.
    pub async fn execute(&mut self, op_code: u16, params: &[u32], expects_data_in: bool) -> PtpResult<Option<Vec<u8>>> {
        let plan = if expects_data_in {
            Plan::DataIn { expected: None }
        } else {
            Plan::NoData
        };
        self.run(op_code, params, plan, self.config.attempts()).await
    }

    /// Like `execute` with a data-in phase whose size is known up front.
    pub async fn execute_sized(&mut self, op_code: u16, params: &[u32], expected_len: u64) -> PtpResult<Vec<u8>> {
        let plan = Plan::DataIn {
            expected: Some(expected_len),
        };
        let data = self.run(op_code, params, plan, self.config.attempts()).await?;
        Ok(data.unwrap_or_default())
    }

    /// Runs `op_code` with a host-to-device data phase.
    pub async fn execute_with_data(&mut self, op_code: u16, params: &[u32], payload: &[u8]) -> PtpResult<()> {
        self.run(op_code, params, Plan::DataOut(payload), self.config.attempts())
            .await
            .map(|_| ())
    }

    /// Single attempt, no retries. Used for best-effort calls such as CloseSession.
    pub async fn execute_once(&mut self, op_code: u16, params: &[u32], expects_data_in: bool) -> PtpResult<Option<Vec<u8>>> {
        let plan = if expects_data_in {
            Plan::DataIn { expected: None }
        } else {
            Plan::NoData
        };
        self.run(op_code, params, plan, 1).await
    }

    /// Single attempt with transaction id 0, for operations allowed before
    /// OpenSession (GetDeviceInfo). Never touches the session counter.
    pub async fn execute_outside_session(&mut self, op_code: u16, params: &[u32], expects_data_in: bool) -> PtpResult<Option<Vec<u8>>> {
        let plan = if expects_data_in {
            Plan::DataIn { expected: None }
        } else {
            Plan::NoData
        };
        self.attempt(op_code, 0, params, plan, false).await
    }

    async fn run(&mut self, op_code: u16, params: &[u32], plan: Plan<'_>, attempts: u32) -> PtpResult<Option<Vec<u8>>> {
        let name = codes::operation_name(op_code);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = self.config.backoff(attempt - 1);
                debug!("PTP {}: backing off {:?} before attempt {}/{}", name, delay, attempt, attempts);
                tokio::time::sleep(delay).await;
                self.transport.recover().await;
            }

            let transaction_id = self.session.next_transaction_id();
            let may_synthesize = self.config.synthesize_missing_ok && self.session.has_succeeded();
            match self.attempt(op_code, transaction_id, params, plan, may_synthesize).await {
                Ok(data) => {
                    self.session.record_success();
                    return Ok(data);
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        "PTP {} (tid={}) attempt {}/{} failed: {}",
                        name, transaction_id, attempt, attempts, e
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    debug!("PTP {} (tid={}) failed without retry: {}", name, transaction_id, e);
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| PtpError::timeout(name)))
    }

    async fn attempt(
        &mut self,
        op_code: u16,
        transaction_id: u32,
        params: &[u32],
        plan: Plan<'_>,
        may_synthesize: bool,
    ) -> PtpResult<Option<Vec<u8>>> {
        let request = OperationRequest {
            code: op_code,
            transaction_id,
            params: params.to_vec(),
            data_direction: plan.direction(),
        };
        debug!(
            "PTP -> {} tid={} params={:08x?}",
            codes::operation_name(op_code),
            transaction_id,
            params
        );
        self.transport
            .send_request(&request, self.config.command_timeout())
            .await?;

        let mut data = None;
        match plan {
            Plan::NoData => {}
            Plan::DataOut(payload) => {
                let timeout = self.config.data_timeout(Some(payload.len() as u64));
                self.transport.send_data(&request, payload, timeout).await?;
            }
            Plan::DataIn { expected } => {
                let timeout = self.config.data_timeout(expected);
                match self.transport.receive_data(&request, timeout).await? {
                    Inbound::Data(bytes) => {
                        debug!("PTP <- data tid={} ({} bytes)", transaction_id, bytes.len());
                        data = Some(bytes);
                    }
                    Inbound::Response(response) => {
                        // Camera skipped the data phase.
                        check_response(op_code, &response)?;
                        return Ok(Some(Vec::new()));
                    }
                }
            }
        }

        let response = match self.read_response(transaction_id).await {
            Ok(response) => response,
            Err(PtpError::Timeout { .. }) if may_synthesize => {
                warn!(
                    "PTP {} tid={}: no response, assuming OK (compatibility shim)",
                    codes::operation_name(op_code),
                    transaction_id
                );
                OperationResponse {
                    code: ResponseCode::Ok.code(),
                    transaction_id,
                    params: Vec::new(),
                }
            }
            Err(e) => return Err(e),
        };
        check_response(op_code, &response)?;
        Ok(data)
    }

    /// Reads the response for `transaction_id`, dropping leftovers from earlier attempts.
    async fn read_response(&mut self, transaction_id: u32) -> PtpResult<OperationResponse> {
        for _ in 0..MAX_STALE_DISCARDS {
            let response = self
                .transport
                .receive_response(self.config.response_timeout())
                .await?;
            if transaction_id != 0 && response.transaction_id < transaction_id {
                debug!(
                    "PTP discarding stale response {} for tid={} (waiting for tid={})",
                    codes::response_name(response.code),
                    response.transaction_id,
                    transaction_id
                );
                continue;
            }
            debug!(
                "PTP <- {} tid={} params={:08x?}",
                codes::response_name(response.code),
                response.transaction_id,
                response.params
            );
            return Ok(response);
        }
        Err(PtpError::malformed(format!(
            "only stale responses while waiting for tid={transaction_id}"
        )))
    }

    pub async fn recover(&mut self) {
        self.transport.recover().await;
    }

    /// Closes the command transport. Idempotent.
    pub async fn close(&mut self) {
        self.transport.close().await;
    }
}

fn check_response(op_code: u16, response: &OperationResponse) -> PtpResult<()> {
    if response.code == ResponseCode::Ok.code() {
        Ok(())
    } else {
        Err(PtpError::from_response_code(response.code, op_code))
    }
}

#[cfg(test)]
#[path = "engine_test.rs"]
mod engine_test;
