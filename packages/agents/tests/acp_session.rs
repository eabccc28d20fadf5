// ABOUTME: Agent-protocol session tests against an in-process fake agent over a duplex pipe
// ABOUTME: Covers the handshake, update translation, permission prompts and cancellation

use hatchery_agents::backends::acp::run_session;
use hatchery_agents::{
    AgentEvent, AgentRequest, BackendKind, PromptTracker, RunContext, RunOutcome, RunStatus,
    RunnerError,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, PartialEq)]
enum Script {
    /// Stream text and a tool call, ask permission, call an unknown method
    Full,
    /// Stream one chunk and wait for session/cancel
    WaitForCancel,
    /// Hang up after the handshake
    HangUp,
}

async fn send(write: &mut WriteHalf<DuplexStream>, message: Value) {
    let mut line = serde_json::to_vec(&message).unwrap();
    line.push(b'\n');
    write.write_all(&line).await.unwrap();
    write.flush().await.unwrap();
}

fn update(update: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "session/update",
        "params": {"sessionId": "sess-1", "update": update}
    })
}

/// Plays the agent side and returns every message the client sent
async fn fake_agent(stream: DuplexStream, script: Script) -> Vec<Value> {
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();
    let mut seen = Vec::new();
    let mut prompt_id = None;

    while let Ok(Some(line)) = lines.next_line().await {
        let message: Value = serde_json::from_str(&line).unwrap();
        seen.push(message.clone());
        let id = message["id"].clone();

        match message["method"].as_str() {
            Some("initialize") => {
                send(
                    &mut write,
                    json!({"jsonrpc": "2.0", "id": id, "result": {"protocolVersion": 1, "agentCapabilities": {}}}),
                )
                .await
            }
            Some("session/new") => {
                if script == Script::HangUp {
                    return seen;
                }
                send(
                    &mut write,
                    json!({"jsonrpc": "2.0", "id": id, "result": {"sessionId": "sess-1"}}),
                )
                .await
            }
            Some("session/prompt") => {
                prompt_id = Some(id);
                send(
                    &mut write,
                    update(json!({
                        "sessionUpdate": "agent_message_chunk",
                        "content": {"type": "text", "text": "Looking at the code"}
                    })),
                )
                .await;
                if script == Script::Full {
                    send(
                        &mut write,
                        update(json!({
                            "sessionUpdate": "tool_call",
                            "toolCallId": "call_1",
                            "title": "Read file",
                            "kind": "read",
                            "rawInput": {"path": "src/lib.rs"}
                        })),
                    )
                    .await;
                    send(
                        &mut write,
                        json!({
                            "jsonrpc": "2.0",
                            "id": 100,
                            "method": "session/request_permission",
                            "params": {
                                "sessionId": "sess-1",
                                "toolCall": {"toolCallId": "call_2", "title": "Edit src/lib.rs"},
                                "options": [
                                    {"optionId": "allow", "name": "Allow", "kind": "allow_once"},
                                    {"optionId": "reject", "name": "Reject", "kind": "reject_once"}
                                ]
                            }
                        }),
                    )
                    .await;
                }
            }
            Some("session/cancel") => {
                if let Some(prompt_id) = prompt_id.take() {
                    send(
                        &mut write,
                        json!({"jsonrpc": "2.0", "id": prompt_id, "result": {"stopReason": "cancelled"}}),
                    )
                    .await;
                }
            }
            Some(_) => {}
            // Responses to our own requests
            None if id == json!(100) => {
                send(
                    &mut write,
                    json!({"jsonrpc": "2.0", "id": 101, "method": "fs/read_text_file", "params": {"path": "/etc/hosts"}}),
                )
                .await
            }
            None if id == json!(101) => {
                if let Some(prompt_id) = prompt_id.take() {
                    send(
                        &mut write,
                        json!({"jsonrpc": "2.0", "id": prompt_id, "result": {"stopReason": "end_turn"}}),
                    )
                    .await;
                }
            }
            None => {}
        }
    }
    seen
}

struct Harness {
    events: mpsc::Receiver<AgentEvent>,
    prompts: Arc<PromptTracker>,
    cancel: CancellationToken,
    session: tokio::task::JoinHandle<Result<RunOutcome, RunnerError>>,
    agent: tokio::task::JoinHandle<Vec<Value>>,
}

fn start(script: Script) -> Harness {
    let (client, agent_side) = tokio::io::duplex(16 * 1024);
    let (tx, rx) = mpsc::channel(64);
    let prompts = Arc::new(PromptTracker::new());
    let cancel = CancellationToken::new();
    let ctx = RunContext::new(tx, prompts.clone(), cancel.clone(), Some(Duration::from_secs(30)));

    let mut request = AgentRequest::new(BackendKind::Acp, "claude", "Fix the failing test");
    request.working_dir = Some("/workspace/repo".into());

    let session = tokio::spawn(async move {
        let (read, write) = tokio::io::split(client);
        run_session(read, write, &request, &ctx).await
    });
    let agent = tokio::spawn(fake_agent(agent_side, script));

    Harness {
        events: rx,
        prompts,
        cancel,
        session,
        agent,
    }
}

#[tokio::test]
async fn test_full_turn_translates_updates_and_permissions() {
    let mut harness = start(Script::Full);

    let mut events = Vec::new();
    while let Some(event) = harness.events.recv().await {
        if let AgentEvent::Prompt { id, message, options, .. } = &event {
            assert_eq!(message, "Allow Edit src/lib.rs?");
            assert_eq!(options[0].id, "allow");
            assert_eq!(options[0].label, "Allow");
            assert_eq!(options[0].value, json!("allow_once"));
            harness.prompts.answer(id, "allow").unwrap();
        }
        events.push(event);
    }

    let outcome = harness.session.await.unwrap().unwrap();
    assert_eq!(outcome, RunOutcome::completed(None));

    assert_eq!(events[0], AgentEvent::stdout("Looking at the code"));
    assert_eq!(
        events[1],
        AgentEvent::ToolCall {
            id: "call_1".to_string(),
            name: "Read file".to_string(),
            input: json!({"path": "src/lib.rs"}),
        }
    );
    assert!(matches!(events[2], AgentEvent::Prompt { .. }));
    assert!(matches!(
        &events[3],
        AgentEvent::PromptAnswered { option_id, .. } if option_id == "allow"
    ));
    assert_eq!(events.len(), 4);

    let seen = harness.agent.await.unwrap();
    let methods: Vec<&str> = seen.iter().filter_map(|m| m["method"].as_str()).collect();
    assert_eq!(methods, vec!["initialize", "session/new", "session/prompt"]);

    let new_session = &seen[1];
    assert_eq!(new_session["params"]["cwd"], "/workspace/repo");

    let permission_reply = seen.iter().find(|m| m["id"] == json!(100)).unwrap();
    assert_eq!(
        permission_reply["result"]["outcome"],
        json!({"outcome": "selected", "optionId": "allow"})
    );

    let unknown_reply = seen.iter().find(|m| m["id"] == json!(101)).unwrap();
    assert_eq!(unknown_reply["error"]["code"], json!(-32601));
}

#[tokio::test]
async fn test_cancel_sends_session_cancel() {
    let mut harness = start(Script::WaitForCancel);

    while let Some(event) = harness.events.recv().await {
        if event == AgentEvent::stdout("Looking at the code") {
            harness.cancel.cancel();
        }
    }

    let outcome = tokio::time::timeout(Duration::from_secs(10), harness.session)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Cancelled);

    let seen = harness.agent.await.unwrap();
    let cancel = seen
        .iter()
        .find(|m| m["method"] == "session/cancel")
        .expect("session/cancel was not sent");
    assert_eq!(cancel["params"]["sessionId"], "sess-1");
    assert!(cancel.get("id").is_none());
}

#[tokio::test]
async fn test_agent_hang_up_is_a_protocol_error() {
    let harness = start(Script::HangUp);

    let result = harness.session.await.unwrap();
    assert!(matches!(result, Err(RunnerError::Protocol(_))));
}
