// ABOUTME: Streaming SDK backend tests against a mocked Messages API
// ABOUTME: Verifies text and tool-call translation, stream framing and API error reporting

use hatchery_agents::{
    AgentEvent, AgentRequest, AgentRunner, BackendKind, RunStatus, SdkBackend, SdkConfig,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sse(events: &[serde_json::Value]) -> String {
    events
        .iter()
        .map(|event| format!("event: {}\ndata: {}\n\n", event["type"].as_str().unwrap(), event))
        .collect()
}

fn runner(server: &MockServer, api_key: Option<&str>) -> AgentRunner {
    let config = SdkConfig {
        api_key: api_key.map(str::to_string),
        base_url: server.uri(),
        ..SdkConfig::default()
    };
    AgentRunner::new().register(Arc::new(SdkBackend::new(config).unwrap()))
}

#[tokio::test]
async fn test_text_and_tool_calls_are_streamed_in_order() {
    let server = MockServer::start().await;
    let body = sse(&[
        json!({"type": "message_start", "message": {"id": "msg_1", "role": "assistant"}}),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hello"}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": " world"}}),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "run_tests", "input": {}}}),
        json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"suite\":"}}),
        json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "\"unit\"}"}}),
        json!({"type": "content_block_stop", "index": 1}),
        json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}}),
        json!({"type": "message_stop"}),
    ]);

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-test"))
        .and(header("anthropic-version", "2023-06-01"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .expect(1)
        .mount(&server)
        .await;

    let events = runner(&server, Some("sk-test"))
        .start(AgentRequest::new(BackendKind::Sdk, "claude", "run the tests"))
        .unwrap()
        .collect()
        .await;

    assert_eq!(
        events,
        vec![
            AgentEvent::status(RunStatus::Started, None, None),
            AgentEvent::stdout("Hello"),
            AgentEvent::stdout(" world"),
            AgentEvent::ToolCall {
                id: "toolu_1".to_string(),
                name: "run_tests".to_string(),
                input: json!({"suite": "unit"}),
            },
            AgentEvent::status(RunStatus::Completed, None, None),
        ]
    );
}

#[tokio::test]
async fn test_request_env_key_overrides_config() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("x-api-key", "sk-from-request"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse(&[json!({"type": "message_stop"})])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let mut request = AgentRequest::new(BackendKind::Sdk, "claude", "hi");
    request
        .env
        .insert("ANTHROPIC_API_KEY".to_string(), "sk-from-request".to_string());
    let events = runner(&server, Some("sk-config")).start(request).unwrap().collect().await;

    assert_eq!(
        events.last().and_then(|e| e.terminal_status()),
        Some(RunStatus::Completed)
    );
}

#[tokio::test]
async fn test_api_error_fails_the_run() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid x-api-key"))
        .mount(&server)
        .await;

    let events = runner(&server, Some("bad"))
        .start(AgentRequest::new(BackendKind::Sdk, "claude", "hi"))
        .unwrap()
        .collect()
        .await;

    match events.last() {
        Some(AgentEvent::Status {
            status: RunStatus::Failed,
            message: Some(message),
            ..
        }) => assert!(message.contains("401")),
        other => panic!("unexpected final event: {:?}", other),
    }
}

#[tokio::test]
async fn test_stream_error_event_fails_the_run() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse(&[
                    json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "partial"}}),
                    json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}),
                ])),
        )
        .mount(&server)
        .await;

    let events = runner(&server, Some("sk-test"))
        .start(AgentRequest::new(BackendKind::Sdk, "claude", "hi"))
        .unwrap()
        .collect()
        .await;

    assert!(events.contains(&AgentEvent::stdout("partial")));
    match events.last() {
        Some(AgentEvent::Status {
            status: RunStatus::Failed,
            message: Some(message),
            ..
        }) => assert!(message.contains("Overloaded")),
        other => panic!("unexpected final event: {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_key_fails_without_calling_api() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let events = runner(&server, None)
        .start(AgentRequest::new(BackendKind::Sdk, "claude", "hi"))
        .unwrap()
        .collect()
        .await;

    assert_eq!(
        events.last().and_then(|e| e.terminal_status()),
        Some(RunStatus::Failed)
    );
}

/// Serve one streaming response whose body is written as separate HTTP chunks
async fn serve_in_chunks(chunks: Vec<Vec<u8>>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        let body_start = loop {
            let n = socket.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            if let Some(pos) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&request[..body_start]).to_lowercase();
        let content_length: usize = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .map(|v| v.trim().parse().unwrap())
            .unwrap_or(0);
        while request.len() < body_start + content_length {
            let n = socket.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
        }

        socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n")
            .await
            .unwrap();
        for chunk in chunks {
            socket
                .write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
                .await
                .unwrap();
            socket.write_all(&chunk).await.unwrap();
            socket.write_all(b"\r\n").await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        socket.write_all(b"0\r\n\r\n").await.unwrap();
        socket.flush().await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_crlf_stream_split_inside_a_character() {
    let text = "Tests pass \u{2713} caf\u{e9}";
    let body: String = [
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": text}}),
        json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}}),
        json!({"type": "message_stop"}),
    ]
    .iter()
    .map(|event| format!("event: {}\r\ndata: {}\r\n\r\n", event["type"].as_str().unwrap(), event))
    .collect();
    let bytes = body.into_bytes();

    // Cut inside the check mark, then between the CR and LF of a blank line
    let check = bytes
        .windows(3)
        .position(|w| w == "\u{2713}".as_bytes())
        .unwrap();
    let blank = bytes
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap();
    let cuts = [0, check + 1, check + 2, blank + 3, bytes.len()];
    let chunks = cuts.windows(2).map(|w| bytes[w[0]..w[1]].to_vec()).collect();

    let config = SdkConfig {
        api_key: Some("sk-test".to_string()),
        base_url: serve_in_chunks(chunks).await,
        ..SdkConfig::default()
    };
    let events = AgentRunner::new()
        .register(Arc::new(SdkBackend::new(config).unwrap()))
        .start(AgentRequest::new(BackendKind::Sdk, "claude", "hi"))
        .unwrap()
        .collect()
        .await;

    assert_eq!(
        events,
        vec![
            AgentEvent::status(RunStatus::Started, None, None),
            AgentEvent::stdout(text),
            AgentEvent::status(RunStatus::Completed, None, None),
        ]
    );
}
