//! Socket-level tests for the PTP/IP transport against a local fake responder.

use super::*;
use crate::testing::{CameraReply, FakeCamera, init_logging};

fn request(code: u16, transaction_id: u32, params: &[u32], data_direction: DataDirection) -> OperationRequest {
    OperationRequest {
        code,
        transaction_id,
        params: params.to_vec(),
        data_direction,
    }
}

fn fast_config() -> PtpConfig {
    PtpConfig {
        handshake_timeout_ms: 2_000,
        data_base_timeout_ms: 300,
        data_timeout_cap_ms: 300,
        ..Default::default()
    }
}

const READ_TIMEOUT: Duration = Duration::from_millis(500);

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_connect_runs_both_handshakes() {
    init_logging();
    let camera = FakeCamera::start(|_, _| CameraReply::ok()).await;
    let pair = connect("127.0.0.1", camera.port, &fast_config()).await.unwrap();
    assert_eq!(pair.command.connection_type(), ConnectionType::Network);
    assert!(pair.events.is_some());
}

#[tokio::test]
async fn test_init_fail_is_reported_with_reason() {
    let camera = FakeCamera::start_with(Some(0x0000_0001), |_, _| CameraReply::ok()).await;
    let err = connect("127.0.0.1", camera.port, &fast_config()).await.err();
    assert_eq!(err, Some(PtpError::HandshakeFailed { reason: 1 }));
}

#[tokio::test]
async fn test_connection_refused() {
    // Grab a free port, then release it so nothing listens there.
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let err = connect("127.0.0.1", port, &fast_config()).await.err();
    assert!(matches!(err, Some(PtpError::ConnectionRefused { .. })), "got {err:?}");
}

#[test]
fn test_client_identity_from_config() {
    let config = PtpConfig {
        client_name: Some("studio-mac".to_string()),
        client_guid: Some("6f1e2d3c-4b5a-4978-8a6b-5c4d3e2f1a0b".to_string()),
        ..Default::default()
    };
    assert_eq!(client_name(&config), "studio-mac");
    assert_eq!(client_guid(&config)[0], 0x6f);

    let random = PtpConfig::default();
    assert_ne!(client_guid(&random), client_guid(&random));
    assert!(!client_name(&random).is_empty());
}

// ============================================================================
// Transactions
// ============================================================================

#[tokio::test]
async fn test_request_and_response() {
    let camera = FakeCamera::start(|_, _| CameraReply::ok()).await;
    let mut pair = connect("127.0.0.1", camera.port, &fast_config()).await.unwrap();

    let open = request(0x1002, 1, &[1], DataDirection::None);
    pair.command.send_request(&open, READ_TIMEOUT).await.unwrap();
    let response = pair.command.receive_response(READ_TIMEOUT).await.unwrap();
    assert_eq!(response.code, 0x2001);
    assert_eq!(response.transaction_id, 1);
    assert_eq!(camera.requests()[0].params, vec![1]);
}

#[tokio::test]
async fn test_full_data_phase() {
    let payload: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
    let expected = payload.clone();
    let camera = FakeCamera::start(move |_, _| CameraReply::data(payload.clone())).await;
    let mut pair = connect("127.0.0.1", camera.port, &fast_config()).await.unwrap();

    let get = request(0x1009, 1, &[5], DataDirection::In);
    pair.command.send_request(&get, READ_TIMEOUT).await.unwrap();
    let data = pair.command.receive_data(&get, READ_TIMEOUT).await.unwrap();
    assert_eq!(data, Inbound::Data(expected));
    let response = pair.command.receive_response(READ_TIMEOUT).await.unwrap();
    assert_eq!(response.code, 0x2001);
}

#[tokio::test]
async fn test_data_phase_above_threshold_is_accepted() {
    let camera = FakeCamera::start(|_, _| CameraReply::short_data(1000, vec![1; 950])).await;
    let mut pair = connect("127.0.0.1", camera.port, &fast_config()).await.unwrap();

    let get = request(0x1008, 1, &[5], DataDirection::In);
    pair.command.send_request(&get, READ_TIMEOUT).await.unwrap();
    match pair.command.receive_data(&get, READ_TIMEOUT).await.unwrap() {
        Inbound::Data(bytes) => assert_eq!(bytes.len(), 950),
        other => panic!("expected data, got {other:?}"),
    }
}

#[tokio::test]
async fn test_data_phase_below_threshold_fails() {
    let camera = FakeCamera::start(|_, _| CameraReply::short_data(1000, vec![1; 500])).await;
    let mut pair = connect("127.0.0.1", camera.port, &fast_config()).await.unwrap();

    let get = request(0x1008, 1, &[5], DataDirection::In);
    pair.command.send_request(&get, READ_TIMEOUT).await.unwrap();
    let err = pair.command.receive_data(&get, READ_TIMEOUT).await.unwrap_err();
    assert_eq!(
        err,
        PtpError::IncompleteData {
            received: 500,
            expected: 1000
        }
    );
}

#[tokio::test]
async fn test_skipped_data_phase_yields_response() {
    let camera = FakeCamera::start(|_, _| CameraReply::code(0x2009)).await;
    let mut pair = connect("127.0.0.1", camera.port, &fast_config()).await.unwrap();

    let get = request(0x1008, 1, &[99], DataDirection::In);
    pair.command.send_request(&get, READ_TIMEOUT).await.unwrap();
    match pair.command.receive_data(&get, READ_TIMEOUT).await.unwrap() {
        Inbound::Response(response) => assert_eq!(response.code, 0x2009),
        other => panic!("expected response, got {other:?}"),
    }
}

#[tokio::test]
async fn test_missing_response_times_out() {
    let camera = FakeCamera::start(|_, _| CameraReply::default()).await;
    let mut pair = connect("127.0.0.1", camera.port, &fast_config()).await.unwrap();

    let close = request(0x1003, 1, &[], DataDirection::None);
    pair.command.send_request(&close, READ_TIMEOUT).await.unwrap();
    let err = pair
        .command
        .receive_response(Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, PtpError::Timeout { .. }));
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let camera = FakeCamera::start(|_, _| CameraReply::ok()).await;
    let mut pair = connect("127.0.0.1", camera.port, &fast_config()).await.unwrap();
    pair.command.close().await;
    pair.command.close().await;
    let open = request(0x1002, 1, &[1], DataDirection::None);
    assert_eq!(
        pair.command.send_request(&open, READ_TIMEOUT).await,
        Err(PtpError::Disconnected)
    );
}

// ============================================================================
// Event channel
// ============================================================================

#[tokio::test]
async fn test_event_channel_delivers_events_and_answers_probes() {
    let camera = FakeCamera::start(|_, _| CameraReply::ok()).await;
    let pair = connect("127.0.0.1", camera.port, &fast_config()).await.unwrap();
    let mut events = pair.events.unwrap();

    // Nothing queued yet.
    assert_eq!(events.next_event(Duration::from_millis(50)).await.unwrap(), None);

    camera.send_probe();
    camera.send_event(0x4002, &[42]);

    let mut received = None;
    for _ in 0..10 {
        if let Some(container) = events.next_event(READ_TIMEOUT).await.unwrap() {
            received = Some(container);
            break;
        }
    }
    let container = received.unwrap();
    assert_eq!(container.kind, ContainerType::Event);
    assert_eq!(container.code, 0x4002);
    assert_eq!(container.params, vec![42]);

    events.close().await;
    assert_eq!(
        events.next_event(Duration::from_millis(10)).await,
        Err(PtpError::Disconnected)
    );
}

#[tokio::test]
async fn test_event_channel_with_bad_length_header_closes() {
    let camera = FakeCamera::start(|_, _| CameraReply::ok()).await;
    let pair = connect("127.0.0.1", camera.port, &fast_config()).await.unwrap();
    let mut events = pair.events.unwrap();

    camera.send_event_bytes(vec![0xff, 0xff, 0xff, 0x7f, 0x08, 0, 0, 0]);

    let err = events.next_event(READ_TIMEOUT).await.unwrap_err();
    assert!(matches!(err, PtpError::Transport { .. }), "got {err:?}");
    assert!(!err.is_retryable());
    // The channel stays closed instead of failing again on the same bytes.
    assert_eq!(
        events.next_event(Duration::from_millis(10)).await,
        Err(PtpError::Disconnected)
    );
}
