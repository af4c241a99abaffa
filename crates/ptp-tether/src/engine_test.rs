//! Tests for the transaction engine: id allocation, retry policy and the
//! missing-response compatibility shim.

use super::*;
use crate::testing::{Probe, Reply, ScriptedTransport, init_logging};
use std::sync::atomic::Ordering;
use std::time::Duration;

fn engine_with(
    config: PtpConfig,
    handler: impl FnMut(&OperationRequest) -> Reply + Send + 'static,
) -> (TransactionEngine, Probe) {
    init_logging();
    let (transport, probe) = ScriptedTransport::new(handler);
    let mut engine = TransactionEngine::new(Box::new(transport), config);
    engine.begin_session(1);
    (engine, probe)
}

fn engine(handler: impl FnMut(&OperationRequest) -> Reply + Send + 'static) -> (TransactionEngine, Probe) {
    engine_with(PtpConfig::default(), handler)
}

// ============================================================================
// Transaction ids
// ============================================================================

#[tokio::test]
async fn test_transaction_ids_are_strictly_increasing() {
    let (mut engine, probe) = engine(|_| Reply::ok());
    for _ in 0..4 {
        engine.execute(0x1002, &[1], false).await.unwrap();
    }
    assert_eq!(probe.transaction_ids(), vec![1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn test_retry_uses_fresh_transaction_id() {
    let mut calls = 0;
    let (mut engine, probe) = engine(move |_| {
        calls += 1;
        if calls == 1 { Reply::timeout() } else { Reply::ok() }
    });
    engine.execute(0x1004, &[], false).await.unwrap();
    assert_eq!(probe.transaction_ids(), vec![1, 2]);
    assert_eq!(probe.recoveries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_outside_session_uses_transaction_zero() {
    let (mut engine, probe) = engine(|_| Reply::data(vec![1, 2, 3]));
    let data = engine.execute_outside_session(0x1001, &[], true).await.unwrap();
    assert_eq!(data, Some(vec![1, 2, 3]));
    assert_eq!(probe.transaction_ids(), vec![0]);

    // Session numbering is untouched.
    engine.execute(0x1002, &[1], false).await.unwrap();
    assert_eq!(probe.transaction_ids(), vec![0, 1]);
}

// ============================================================================
// Retry policy
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_persistent_timeout_gives_up_after_three_attempts() {
    let (mut engine, probe) = engine(|_| Reply::timeout());
    let err = engine.execute(0x1007, &[0x0001_0001, 0, 0], true).await.unwrap_err();
    assert!(matches!(err, PtpError::Timeout { .. }), "got {err:?}");
    assert_eq!(probe.requests().len(), 3);
    assert_eq!(probe.recoveries.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_attempt_count_follows_config() {
    let config = PtpConfig {
        max_attempts: 5,
        ..Default::default()
    };
    let (mut engine, probe) = engine_with(config, |_| Reply::timeout());
    assert!(engine.execute(0x1004, &[], true).await.is_err());
    assert_eq!(probe.requests().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_is_linear() {
    let (mut engine, _probe) = engine(|_| Reply::timeout());
    let started = tokio::time::Instant::now();
    let _ = engine.execute(0x1004, &[], false).await;
    // 100 ms before attempt 2, 200 ms before attempt 3.
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_millis(400));
}

#[tokio::test(start_paused = true)]
async fn test_general_error_is_retried_then_succeeds() {
    let mut calls = 0;
    let (mut engine, probe) = engine(move |_| {
        calls += 1;
        match calls {
            1 => Reply::code(0x2002),
            2 => Reply::code(0x2019),
            _ => Reply::data(vec![9]),
        }
    });
    let data = engine.execute(0x1008, &[5], true).await.unwrap();
    assert_eq!(data, Some(vec![9]));
    assert_eq!(probe.requests().len(), 3);
}

#[tokio::test]
async fn test_non_retryable_response_fails_immediately() {
    let (mut engine, probe) = engine(|_| Reply::code(0x2009));
    let err = engine.execute(0x1008, &[99], true).await.unwrap_err();
    assert_eq!(
        err,
        PtpError::Response {
            code: 0x2009,
            operation: 0x1008
        }
    );
    assert_eq!(probe.requests().len(), 1);
}

#[tokio::test]
async fn test_execute_once_does_not_retry() {
    let (mut engine, probe) = engine(|_| Reply::code(0x2002));
    assert_eq!(engine.execute_once(0x1003, &[], false).await, Err(PtpError::GeneralError));
    assert_eq!(probe.requests().len(), 1);
}

// ============================================================================
// Missing-response shim
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_missing_response_synthesized_after_success() {
    let (mut engine, probe) = engine(|request| match request.code {
        0x1002 => Reply::ok(),
        _ => Reply::data_then_silence(vec![0xAA; 16]),
    });
    engine.execute(0x1002, &[1], false).await.unwrap();

    let data = engine.execute(0x1008, &[5], true).await.unwrap();
    assert_eq!(data, Some(vec![0xAA; 16]));
    // Single attempt: the shim answered instead of a retry.
    assert_eq!(probe.transaction_ids(), vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_missing_response_not_synthesized_before_first_success() {
    let (mut engine, probe) = engine(|_| Reply::silence());
    let err = engine.execute(0x1002, &[1], false).await.unwrap_err();
    assert!(matches!(err, PtpError::Timeout { .. }));
    assert_eq!(probe.requests().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_missing_response_shim_can_be_disabled() {
    let config = PtpConfig {
        synthesize_missing_ok: false,
        ..Default::default()
    };
    let (mut engine, probe) = engine_with(config, |request| match request.code {
        0x1002 => Reply::ok(),
        _ => Reply::silence(),
    });
    engine.execute(0x1002, &[1], false).await.unwrap();
    let err = engine.execute(0x1004, &[], false).await.unwrap_err();
    assert!(matches!(err, PtpError::Timeout { .. }));
    assert_eq!(probe.requests().len(), 4);
}

// ============================================================================
// Responses and data phases
// ============================================================================

#[tokio::test]
async fn test_stale_response_is_discarded() {
    let (mut engine, probe) = engine(|_| Reply {
        stale_response_first: true,
        ..Reply::ok()
    });
    engine.execute(0x1002, &[1], false).await.unwrap();
    engine.execute(0x1004, &[], false).await.unwrap();
    assert_eq!(probe.transaction_ids(), vec![1, 2]);
}

#[tokio::test]
async fn test_skipped_data_phase_with_error_code() {
    let (mut engine, _probe) = engine(|_| Reply::code(0x2005));
    let err = engine.execute(0x1014, &[0x5001], true).await.unwrap_err();
    assert_eq!(
        err,
        PtpError::Response {
            code: 0x2005,
            operation: 0x1014
        }
    );
}

#[tokio::test]
async fn test_execute_sized_returns_payload() {
    let (mut engine, probe) = engine(|_| Reply::data(vec![7; 2048]));
    let data = engine.execute_sized(0x1009, &[5], 2048).await.unwrap();
    assert_eq!(data.len(), 2048);
    assert_eq!(probe.requests()[0].data_direction, DataDirection::In);
}

#[tokio::test]
async fn test_execute_with_data_sends_payload() {
    let (mut engine, probe) = engine(|_| Reply::ok());
    engine.execute_with_data(0x1016, &[0x5001], &[1, 0]).await.unwrap();
    assert_eq!(probe.requests()[0].data_direction, DataDirection::Out);
    assert_eq!(*probe.sent_data.lock().unwrap(), vec![vec![1, 0]]);
}

#[tokio::test]
async fn test_close_is_forwarded() {
    let (mut engine, probe) = engine(|_| Reply::ok());
    engine.close().await;
    assert!(probe.closed.load(Ordering::SeqCst));
    assert_eq!(engine.execute(0x1004, &[], false).await, Err(PtpError::Disconnected));
}
