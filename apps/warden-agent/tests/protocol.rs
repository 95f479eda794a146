//! End-to-end exercises of the control protocol over a real TCP socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use warden_agent::auth::Authenticator;
use warden_agent::capability::Capabilities;
use warden_agent::logstore::LogStore;
use warden_agent::policy::{NetworkPolicy, PolicyError};
use warden_agent::registry::{build_registry, Services};
use warden_agent::schedule::Scheduler;
use warden_agent::server::Dispatcher;
use warden_agent::shell::{CommandLog, InterpreterCommand, ShellService};
use warden_agent::system::SystemProbe;
use warden_proto::token::TokenKeys;
use warden_proto::{envelope, Response};

const SECRET: &str = "integration-secret";

struct AllowAllPolicy;

impl NetworkPolicy for AllowAllPolicy {
    fn block(&self) -> Result<(), PolicyError> {
        Ok(())
    }

    fn unblock(&self) -> Result<(), PolicyError> {
        Ok(())
    }
}

fn interpreter() -> InterpreterCommand {
    #[cfg(unix)]
    {
        InterpreterCommand {
            program: "/bin/sh".to_string(),
            args: vec![
                "-c".to_string(),
                r#"while IFS= read -r line; do echo "echo:$line"; echo; done"#.to_string(),
            ],
        }
    }
    #[cfg(not(unix))]
    {
        InterpreterCommand::default()
    }
}

async fn start_agent(dir: &tempfile::TempDir) -> SocketAddr {
    let auth = Arc::new(Authenticator::new(TokenKeys::new(
        SECRET,
        chrono::Duration::minutes(5),
    )));
    let scheduler = Arc::new(Scheduler::new(
        Arc::new(AllowAllPolicy),
        Duration::from_secs(5),
    ));
    let shell = Arc::new(ShellService::new(
        interpreter(),
        CommandLog::new(dir.path().join("command_output.log")),
    ));
    let registry = Arc::new(build_registry(Services {
        shell,
        scheduler,
        capabilities: Capabilities::unsupported(),
        system: Arc::new(SystemProbe::new()),
        log_store: Arc::new(LogStore::new(dir.path().join("agent.log"))),
        probe_target: "127.0.0.1:1".to_string(),
        probe_timeout: Duration::from_millis(100),
    }));
    let dispatcher = Dispatcher::bind(
        "127.0.0.1:0".parse().unwrap(),
        auth,
        registry,
        Duration::from_millis(500),
    )
    .await
    .expect("bind dispatcher");
    let addr = dispatcher.local_addr().expect("local addr");
    tokio::spawn(dispatcher.serve());
    addr
}

fn token() -> String {
    TokenKeys::new(SECRET, chrono::Duration::minutes(5))
        .issue("integration")
        .0
}

/// One full protocol exchange: write the payload, optionally signal
/// end-of-request, then read the prefixed response frame to end of stream.
async fn exchange(addr: SocketAddr, payload: &[u8], half_close: bool) -> Response {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(payload).await.expect("send request");
    if half_close {
        stream.shutdown().await.expect("half close");
    }

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.expect("read response");
    let body_len = envelope::frame_length(&raw).expect("length prefix");
    assert_eq!(
        body_len,
        raw.len() - envelope::LENGTH_PREFIX_WIDTH,
        "length prefix must match the body byte count"
    );
    serde_json::from_slice(&raw[envelope::LENGTH_PREFIX_WIDTH..]).expect("response body")
}

fn request(command: &str, extra: serde_json::Value) -> Vec<u8> {
    let mut body = serde_json::json!({ "token": token(), "request": command });
    if let (Some(target), Some(source)) = (body.as_object_mut(), extra.as_object()) {
        for (key, value) in source {
            target.insert(key.clone(), value.clone());
        }
    }
    serde_json::to_vec(&body).unwrap()
}

#[tokio::test]
async fn check_connection_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_agent(&dir).await;
    let response = exchange(addr, &request("check_connection", serde_json::json!({})), false).await;
    assert!(response.success);
    assert_eq!(response.message, "Connected");
}

#[tokio::test]
async fn expired_token_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_agent(&dir).await;
    let stale = TokenKeys::new(SECRET, chrono::Duration::minutes(-5))
        .issue("integration")
        .0;
    let payload =
        serde_json::to_vec(&serde_json::json!({ "token": stale, "request": "check_connection" }))
            .unwrap();
    let response = exchange(addr, &payload, false).await;
    assert!(!response.success);
    assert_eq!(response.message, "Invalid or expired token.");
}

#[tokio::test]
async fn foreign_signature_is_rejected_with_same_message() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_agent(&dir).await;
    let forged = TokenKeys::new("other-secret", chrono::Duration::minutes(5))
        .issue("integration")
        .0;
    let payload =
        serde_json::to_vec(&serde_json::json!({ "token": forged, "request": "check_connection" }))
            .unwrap();
    let response = exchange(addr, &payload, false).await;
    assert!(!response.success);
    assert_eq!(response.message, "Invalid or expired token.");
}

#[tokio::test]
async fn unknown_command_closes_normally() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_agent(&dir).await;
    let response = exchange(addr, &request("make_coffee", serde_json::json!({})), false).await;
    assert!(!response.success);
    assert_eq!(response.message, "Unknown request.");
}

#[tokio::test]
async fn unparsable_body_yields_invalid_json_response() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_agent(&dir).await;
    let response = exchange(addr, b"{definitely not json", true).await;
    assert!(!response.success);
    assert_eq!(response.message, "Invalid JSON format.");
}

#[tokio::test]
async fn stalled_request_times_out_as_malformed() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_agent(&dir).await;
    // Partial JSON, connection left open: the idle timeout ends the read.
    let response = exchange(addr, b"{\"token\": \"", false).await;
    assert!(!response.success);
    assert_eq!(response.message, "Invalid JSON format.");
}

#[tokio::test]
async fn schedule_commands_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_agent(&dir).await;

    let response = exchange(
        addr,
        &request(
            "add_schedule",
            serde_json::json!({
                "schedule_type": "Recurring",
                "date_or_day": "Monday",
                "start_time": "08:00",
                "end_time": "10:00",
            }),
        ),
        false,
    )
    .await;
    assert!(response.success, "{}", response.message);
    assert_eq!(response.message, "Schedule added successfully.");

    let response = exchange(addr, &request("list_schedules", serde_json::json!({})), false).await;
    let entries = response.data.expect("schedule list");
    assert_eq!(entries.as_array().unwrap().len(), 1);
    assert_eq!(entries[0]["date_or_day"], "Monday");

    let response = exchange(
        addr,
        &request("remove_schedule", serde_json::json!({ "index": 5 })),
        false,
    )
    .await;
    assert!(!response.success);
    assert_eq!(response.message, "Invalid schedule index.");

    let response = exchange(addr, &request("list_schedules", serde_json::json!({})), false).await;
    assert_eq!(response.data.unwrap().as_array().unwrap().len(), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn execute_command_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_agent(&dir).await;
    let response = exchange(
        addr,
        &request("execute_command", serde_json::json!({ "command": "hi" })),
        false,
    )
    .await;
    assert!(response.success, "{}", response.message);
    assert_eq!(response.message, "Command executed successfully.");
    assert_eq!(response.data.unwrap()["output"], "echo:hi");

    let log = std::fs::read_to_string(dir.path().join("command_output.log")).unwrap();
    assert!(log.contains("echo:hi"));
}

#[tokio::test]
async fn capture_capabilities_answer_unsupported() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_agent(&dir).await;
    let response = exchange(addr, &request("start_keylogger", serde_json::json!({})), false).await;
    assert!(!response.success);
    assert!(response.message.contains("not supported"));
}
