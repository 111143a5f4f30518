//! Whole-tunnel behavior: raw documents in, envelopes out.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use tunnel_engine::EchoEngine;
use tunnel_relay::TaskState;
use tunnel_service::{TunnelConfig, TunnelService};
use tunnel_transport::InMemoryTransport;
use tunnel_types::{
    DeviceId, Envelope, MessageType, RegistrationBody, ResponseChunk, TaskId,
    DEFAULT_CHAT_PATH,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn service_with(transport: &Arc<InMemoryTransport>) -> Arc<TunnelService> {
    init_tracing();
    let service = TunnelService::new(
        TunnelConfig::default(),
        transport.clone(),
        Arc::new(EchoEngine::new()),
    )
    .expect("handler registration is duplicate-free");
    Arc::new(service)
}

async fn wait_for_sent(transport: &InMemoryTransport, count: usize) -> Vec<Envelope> {
    for _ in 0..200 {
        let sent = transport.sent().await;
        if sent.len() >= count {
            return sent;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {count} sent envelopes");
}

fn announce(device: &str) -> serde_json::Value {
    json!({
        "type": "device-registration",
        "from": device,
        "to": "gateway",
        "payload": {
            "deviceId": device,
            "capabilities": ["chat", "completion"],
            "version": "0.9.1"
        }
    })
}

#[tokio::test]
async fn startup_registers_every_type_in_both_directions() {
    let transport = Arc::new(InMemoryTransport::new());
    let service = service_with(&transport);

    // 13 message types, income and outcome each
    assert_eq!(service.registry().len(), 26);
}

#[tokio::test]
async fn registration_then_nested_stream_request_relays_chunks() {
    let transport = Arc::new(InMemoryTransport::new());
    let service = service_with(&transport);

    service.handle_inbound(announce("dev-1")).await;
    let sent = wait_for_sent(&transport, 1).await;
    match sent[0].decode_payload::<RegistrationBody>().unwrap() {
        RegistrationBody::Ack(ack) => assert!(ack.accepted),
        other => panic!("expected ack, got {other:?}"),
    }

    // legacy nested shape, normalized before validation
    service
        .handle_inbound(json!({
            "type": "chat-request-stream",
            "from": "dev-1",
            "to": "gateway",
            "payload": {
                "taskId": "t1",
                "data": {
                    "model": "m",
                    "messages": [{"role": "user", "content": "hi there"}]
                }
            }
        }))
        .await;

    // ack + "m: hi there" as three chunks + end marker
    let sent = wait_for_sent(&transport, 5).await;
    let chunks: Vec<ResponseChunk> = sent[1..]
        .iter()
        .map(|e| {
            assert_eq!(e.message_type, MessageType::ChatResponseStream);
            e.decode_payload().unwrap()
        })
        .collect();
    assert!(chunks.iter().all(|c| c.task_id.as_str() == "t1"));
    assert_eq!(chunks.iter().filter(|c| c.done).count(), 1);

    let record = service.relay().tasks().get(&TaskId::new("t1")).unwrap();
    assert_eq!(record.state, TaskState::Completed);
    assert!(record.streaming);
}

#[tokio::test]
async fn request_before_registration_is_rejected_without_a_task() {
    let transport = Arc::new(InMemoryTransport::new());
    let service = service_with(&transport);

    service
        .handle_inbound(json!({
            "type": "chat-request-no-stream",
            "from": "dev-1",
            "to": "gateway",
            "payload": { "taskId": "t1", "model": "m", "messages": [], "stream": false }
        }))
        .await;

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(service.relay().tasks().is_empty());
    assert_eq!(transport.sent_count().await, 0);
}

#[tokio::test]
async fn malformed_and_unknown_messages_do_not_stop_the_loop() {
    let transport = Arc::new(InMemoryTransport::new());
    let service = service_with(&transport);

    // not an object, unknown type, nested shape missing taskId
    service.handle_inbound(json!("garbage")).await;
    service
        .handle_inbound(json!({"type": "factory-reset", "from": "dev-1", "to": "g", "payload": {}}))
        .await;
    service
        .handle_inbound(json!({
            "type": "chat-request-stream",
            "from": "dev-1",
            "to": "g",
            "payload": { "data": { "model": "m" } }
        }))
        .await;

    // the loop still answers a well-formed ping
    service
        .handle_inbound(json!({
            "type": "ping",
            "from": "dev-1",
            "to": "gateway",
            "payload": { "token": "k", "timestamp": 7 }
        }))
        .await;

    let sent = wait_for_sent(&transport, 1).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message_type, MessageType::Pong);
}

#[tokio::test]
async fn inbound_loop_processes_documents_from_the_channel() {
    let transport = Arc::new(InMemoryTransport::new());
    let service = service_with(&transport);

    let (tx, rx) = tokio::sync::mpsc::channel(16);
    let handle = service.spawn_inbound(rx);

    tx.send(announce("dev-7")).await.unwrap();
    wait_for_sent(&transport, 1).await;
    assert!(service.sessions().is_registered(&DeviceId::new("dev-7")));

    drop(tx);
    handle.await.unwrap();
}

#[tokio::test]
async fn non_stream_example_yields_exactly_one_response() {
    let transport = Arc::new(InMemoryTransport::new());
    let service = service_with(&transport);

    service.handle_inbound(announce("dev-1")).await;
    wait_for_sent(&transport, 1).await;

    service
        .handle_inbound(json!({
            "type": "chat-request-no-stream",
            "from": "dev-1",
            "to": "gateway",
            "payload": {
                "taskId": "t1",
                "path": DEFAULT_CHAT_PATH,
                "model": "m",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": false
            }
        }))
        .await;

    let sent = wait_for_sent(&transport, 2).await;
    assert_eq!(sent[1].message_type, MessageType::ChatResponse);
    let response: tunnel_types::InferenceResponse = sent[1].decode_payload().unwrap();
    assert_eq!(response.task_id.as_str(), "t1");

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(transport.sent_count().await, 2);
}

#[tokio::test]
async fn shutdown_cancels_inbound_loop() {
    let transport = Arc::new(InMemoryTransport::new());
    let service = service_with(&transport);

    let (_tx, rx) = tokio::sync::mpsc::channel(16);
    let handle = service.spawn_inbound(rx);

    service.shutdown();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("inbound loop exits on shutdown")
        .unwrap();
}
