// ABOUTME: Direct CLI backend tests driving real shell processes through the runner
// ABOUTME: Checks line streaming, tool-use lifting, stdin answers, exit codes and cancellation
#![cfg(unix)]

use hatchery_agents::{
    AgentCommand, AgentEvent, AgentRequest, AgentRunner, BackendKind, CliBackend, RunStatus,
};
use std::sync::Arc;
use std::time::Duration;

fn runner_for(script: &str) -> AgentRunner {
    let backend = CliBackend::empty().with_command("fake", AgentCommand::new("sh", ["-c", script]));
    AgentRunner::new().register(Arc::new(backend))
}

fn request() -> AgentRequest {
    AgentRequest::new(BackendKind::Cli, "fake", "do the thing")
}

#[tokio::test]
async fn test_lines_tool_calls_and_exit_code() {
    let script = r#"echo hello
echo '{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}}'
echo warning >&2
exit 3"#;
    let events = runner_for(script).start(request()).unwrap().collect().await;

    assert_eq!(events[0], AgentEvent::status(RunStatus::Started, None, None));
    assert!(events.contains(&AgentEvent::stdout("hello")));
    assert!(events.contains(&AgentEvent::stderr("warning")));
    assert!(events.iter().any(|e| matches!(
        e,
        AgentEvent::ToolCall { id, name, .. } if id == "t1" && name == "Bash"
    )));

    // stdout order is preserved
    let hello = events.iter().position(|e| *e == AgentEvent::stdout("hello")).unwrap();
    let tool = events
        .iter()
        .position(|e| matches!(e, AgentEvent::ToolCall { .. }))
        .unwrap();
    assert!(hello < tool);

    match events.last() {
        Some(AgentEvent::Status {
            status: RunStatus::Failed,
            exit_code: Some(3),
            message: Some(message),
        }) => assert!(message.contains("code 3")),
        other => panic!("unexpected final event: {:?}", other),
    }
}

#[tokio::test]
async fn test_prompt_placeholder_is_passed_as_argument() {
    let backend = CliBackend::empty().with_command(
        "fake",
        AgentCommand::new("sh", ["-c", "echo \"prompt: $0\"", "{prompt}"]),
    );
    let events = AgentRunner::new()
        .register(Arc::new(backend))
        .start(request())
        .unwrap()
        .collect()
        .await;

    assert!(events.contains(&AgentEvent::stdout("prompt: do the thing")));
    assert_eq!(
        events.last(),
        Some(&AgentEvent::status(RunStatus::Completed, Some(0), None))
    );
}

#[tokio::test]
async fn test_prompt_answer_is_written_to_stdin() {
    let script = r#"echo '{"type":"prompt","message":"Proceed?","options":["yes","no"]}'
read reply
echo "reply=$reply""#;
    let mut handle = runner_for(script).start(request()).unwrap();

    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        if let AgentEvent::Prompt { id, message, .. } = &event {
            assert_eq!(message, "Proceed?");
            handle.answer(id, "yes").unwrap();
        }
        events.push(event);
    }

    let reply = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::Stdout { text } if text.starts_with("reply=") => Some(text.clone()),
            _ => None,
        })
        .expect("agent never echoed the answer");
    assert!(reply.contains(r#""optionId":"yes""#));
    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::PromptAnswered { option_id, .. } if option_id == "yes")));
    assert_eq!(events.last().and_then(|e| e.terminal_status()), Some(RunStatus::Completed));
}

#[tokio::test]
async fn test_cancel_kills_the_process() {
    let mut handle = runner_for("echo started; sleep 30").start(request()).unwrap();

    let finished = tokio::time::timeout(Duration::from_secs(10), async {
        let mut last = None;
        while let Some(event) = handle.next_event().await {
            if event == AgentEvent::stdout("started") {
                handle.cancel();
            }
            last = Some(event);
        }
        last
    })
    .await
    .expect("cancelled run did not finish");

    assert_eq!(
        finished.and_then(|e| e.terminal_status()),
        Some(RunStatus::Cancelled)
    );
}

#[tokio::test]
async fn test_missing_program_fails_the_run() {
    let backend = CliBackend::empty().with_command(
        "fake",
        AgentCommand::new("/nonexistent/agent-binary", Vec::<String>::new()),
    );
    let events = AgentRunner::new()
        .register(Arc::new(backend))
        .start(request())
        .unwrap()
        .collect()
        .await;

    match events.last() {
        Some(AgentEvent::Status {
            status: RunStatus::Failed,
            message: Some(message),
            ..
        }) => assert!(message.contains("spawn")),
        other => panic!("unexpected final event: {:?}", other),
    }
}
