//! Session lifecycle and the per-device transaction lock.

use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

use crate::config::PtpConfig;
use crate::engine::TransactionEngine;
use crate::error::{PtpError, PtpResult};
use crate::ptp::codes::{OperationCode, ResponseCode};

/// Session id sent with OpenSession. Any non-zero value works; one session per device.
pub const SESSION_ID: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    SessionOpen,
    Closing,
}

/// Transaction counter for one session.
///
/// Ids start at 1 and only ever grow while the session lives, retries included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: u32,
    last_transaction_id: u32,
    successful_transactions: u64,
}

impl Session {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            last_transaction_id: 0,
            successful_transactions: 0,
        }
    }

    pub fn next_transaction_id(&mut self) -> u32 {
        // 0 and 0xFFFFFFFF are reserved
        self.last_transaction_id = match self.last_transaction_id.wrapping_add(1) {
            0 | u32::MAX => 1,
            next => next,
        };
        self.last_transaction_id
    }

    pub fn last_transaction_id(&self) -> u32 {
        self.last_transaction_id
    }

    pub fn record_success(&mut self) {
        self.successful_transactions += 1;
    }

    pub fn has_succeeded(&self) -> bool {
        self.successful_transactions > 0
    }
}

/// Owns the transaction engine behind an async mutex and tracks session state.
///
/// Every operation goes through `lock` (or `session_engine`), which bounds how
/// long a caller waits behind an in-flight transaction.
pub struct SessionManager {
    engine: Mutex<TransactionEngine>,
    state: StdMutex<SessionState>,
    config: PtpConfig,
}

impl SessionManager {
    /// Wraps a freshly connected engine. State starts at `Connecting`.
    pub fn new(engine: TransactionEngine) -> Self {
        let config = engine.config().clone();
        Self {
            engine: Mutex::new(engine),
            state: StdMutex::new(SessionState::Connecting),
            config,
        }
    }

    pub fn config(&self) -> &PtpConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().map(|s| *s).unwrap_or(SessionState::Disconnected)
    }

    fn set_state(&self, next: SessionState) {
        if let Ok(mut state) = self.state.lock() {
            if *state != next {
                debug!("PTP session state {:?} -> {:?}", *state, next);
            }
            *state = next;
        }
    }

    /// Acquires the transaction lock with a timeout.
    pub async fn lock(&self, operation: &str) -> PtpResult<MutexGuard<'_, TransactionEngine>> {
        acquire_with_timeout(&self.engine, self.config.lock_timeout(), operation).await
    }

    /// Acquires the transaction lock, opening the session first if needed.
    pub async fn session_engine(&self, operation: &str) -> PtpResult<MutexGuard<'_, TransactionEngine>> {
        let mut engine = self.lock(operation).await?;
        match self.state() {
            SessionState::SessionOpen => {}
            SessionState::Connecting => self.open_with(&mut engine).await?,
            SessionState::Disconnected | SessionState::Closing => return Err(PtpError::NotConnected),
        }
        Ok(engine)
    }

    /// Opens the session. OK and SessionAlreadyOpen both count as success.
    pub async fn open_session(&self) -> PtpResult<()> {
        let mut engine = self.lock("OpenSession").await?;
        self.open_with(&mut engine).await
    }

    /// Opens the session once if it isn't open yet.
    pub async fn ensure_session_open(&self) -> PtpResult<()> {
        self.session_engine("ensure session").await.map(drop)
    }

    async fn open_with(&self, engine: &mut TransactionEngine) -> PtpResult<()> {
        self.set_state(SessionState::Connecting);
        engine.begin_session(SESSION_ID);

        match engine
            .execute(OperationCode::OpenSession.code(), &[SESSION_ID], false)
            .await
        {
            Ok(_) => info!("PTP session {} opened", SESSION_ID),
            Err(PtpError::Response { code, .. }) if code == ResponseCode::SessionAlreadyOpen.code() => {
                info!("PTP session {} was already open, reusing it", SESSION_ID);
                engine.note_success();
            }
            Err(e) => {
                warn!("PTP OpenSession failed: {}", e);
                return Err(match e {
                    PtpError::Response { code, .. } => PtpError::OpenSessionFailed { code },
                    PtpError::GeneralError => PtpError::OpenSessionFailed {
                        code: ResponseCode::GeneralError.code(),
                    },
                    PtpError::DeviceBusy => PtpError::OpenSessionFailed {
                        code: ResponseCode::DeviceBusy.code(),
                    },
                    other => other,
                });
            }
        }
        self.set_state(SessionState::SessionOpen);
        Ok(())
    }

    /// Best-effort CloseSession. Always ends in `Disconnected`.
    pub async fn close_session(&self) {
        if self.state() != SessionState::SessionOpen {
            self.set_state(SessionState::Disconnected);
            return;
        }
        self.set_state(SessionState::Closing);

        match self.lock("CloseSession").await {
            Ok(mut engine) => {
                if let Err(e) = engine
                    .execute_once(OperationCode::CloseSession.code(), &[], false)
                    .await
                {
                    debug!("PTP CloseSession not acknowledged: {}", e);
                }
            }
            Err(e) => warn!("Skipping CloseSession: {}", e),
        }
        self.set_state(SessionState::Disconnected);
    }

    /// Releases the command transport. Idempotent.
    pub async fn shutdown(&self) {
        self.set_state(SessionState::Disconnected);
        match self.lock("shutdown").await {
            Ok(mut engine) => engine.close().await,
            // Dropping the manager still releases the transport.
            Err(e) => warn!("Couldn't close PTP transport cleanly: {}", e),
        }
    }
}

/// Acquires a tokio mutex with a timeout so a wedged transaction can't block callers forever.
async fn acquire_with_timeout<'a, T>(
    mutex: &'a Mutex<T>,
    timeout: Duration,
    operation: &str,
) -> PtpResult<MutexGuard<'a, T>> {
    match tokio::time::timeout(timeout, mutex.lock()).await {
        Ok(guard) => Ok(guard),
        Err(_) => {
            warn!("Timed out waiting for PTP transaction lock ({}) after {:?}", operation, timeout);
            Err(PtpError::timeout(format!("waiting for device lock: {operation}")))
        }
    }
}
