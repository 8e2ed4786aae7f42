// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! End-to-end WebSocket scenarios against a live proxy backed by the
//! `mockls` mock analyzer (built alongside the test executable).

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use gantry_lsp::config::{AnalyzerConfig, Config};
use gantry_lsp::lsp::AnalyzerManager;
use gantry_lsp::server::{self, AppState};
use gantry_lsp::workspace::WorkspaceStore;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Locate the mockls binary next to the test executable.
fn mockls_bin() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .map_or_else(|| PathBuf::from("mockls"), |p| p.join("mockls"))
}

fn mock_config(languages: &[&str], extra_args: &[&str]) -> Config {
    let mut config = Config::default();
    for language in languages {
        config.analyzer.insert(
            (*language).to_string(),
            AnalyzerConfig {
                command: mockls_bin().to_string_lossy().to_string(),
                args: extra_args.iter().map(ToString::to_string).collect(),
            },
        );
    }
    config
}

struct TestServer {
    addr: SocketAddr,
    dir: tempfile::TempDir,
    manager: Arc<AnalyzerManager>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start(config: Config) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let workspace = WorkspaceStore::new(dir.path()).expect("workspace");
        let manager = AnalyzerManager::new(&config, workspace.root().to_path_buf());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");

        let state = Arc::new(AppState {
            config,
            workspace,
            manager: manager.clone(),
        });
        let handle = tokio::spawn(async move {
            let _ = server::run(state, listener).await;
        });

        Self {
            addr,
            dir,
            manager,
            handle,
        }
    }

    async fn connect(&self) -> WsClient {
        let (ws, _) = connect_async(format!("ws://{}/lsp", self.addr))
            .await
            .expect("websocket connect");
        ws
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn send(ws: &mut WsClient, value: Value) {
    ws.send(Message::Text(value.to_string())).await.expect("send");
}

/// Receives frames until `pred` matches one, within `timeout`.
async fn wait_for(
    ws: &mut WsClient,
    timeout: Duration,
    mut pred: impl FnMut(&Value) -> bool,
) -> Value {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for frame");
        let frame = tokio::time::timeout(remaining, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");

        if let Message::Text(text) = frame {
            let value: Value = serde_json::from_str(&text).expect("valid JSON frame");
            if pred(&value) {
                return value;
            }
        }
    }
}

fn response_with_id(id: u64) -> impl Fn(&Value) -> bool {
    move |v| v.get("id").and_then(Value::as_u64) == Some(id)
}

fn diagnostics_for(uri: &'static str) -> impl Fn(&Value) -> bool {
    move |v| {
        v.get("method").and_then(Value::as_str) == Some("textDocument/publishDiagnostics")
            && v["params"]["uri"].as_str() == Some(uri)
    }
}

fn initialize(id: u64) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": "initialize", "params": {} })
}

fn did_open(uri: &str, language_id: &str, version: i64, text: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "textDocument/didOpen",
        "params": {
            "textDocument": {
                "uri": uri,
                "languageId": language_id,
                "version": version,
                "text": text
            }
        }
    })
}

fn did_change(uri: &str, version: i64, text: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "textDocument/didChange",
        "params": {
            "textDocument": { "uri": uri, "version": version },
            "contentChanges": [{ "text": text }]
        }
    })
}

fn hover(id: u64, uri: &str, line: u32, character: u32) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "textDocument/hover",
        "params": {
            "textDocument": { "uri": uri },
            "position": { "line": line, "character": character }
        }
    })
}

#[tokio::test]
async fn initialize_is_answered_locally() {
    let server = TestServer::start(mock_config(&[], &[])).await;
    let mut ws = server.connect().await;

    send(&mut ws, initialize(1)).await;
    let reply = wait_for(&mut ws, Duration::from_secs(5), response_with_id(1)).await;

    let caps = &reply["result"]["capabilities"];
    assert_eq!(caps["textDocumentSync"], 1);
    assert_eq!(caps["hoverProvider"], true);
    assert_eq!(caps["definitionProvider"], true);
    assert_eq!(caps["referencesProvider"], true);
    assert_eq!(caps["documentFormattingProvider"], true);
    assert_eq!(caps["completionProvider"]["resolveProvider"], false);
    let triggers = caps["completionProvider"]["triggerCharacters"]
        .as_array()
        .expect("trigger characters");
    assert!(triggers.iter().any(|t| t == "."));
    assert_eq!(reply["result"]["serverInfo"]["name"], "gantry-lsp");
}

#[tokio::test]
async fn open_writes_file_and_returns_diagnostics() {
    let server = TestServer::start(mock_config(&["go"], &[])).await;
    let mut ws = server.connect().await;

    send(&mut ws, initialize(1)).await;
    wait_for(&mut ws, Duration::from_secs(5), response_with_id(1)).await;

    send(
        &mut ws,
        did_open(
            "file:///main.go",
            "go",
            1,
            "package main\nfunc main(){ x := 1 }\n",
        ),
    )
    .await;

    // Diagnostics come back in client URI space within the window.
    let diag = wait_for(
        &mut ws,
        Duration::from_secs(5),
        diagnostics_for("file:///main.go"),
    )
    .await;
    assert!(!diag["params"]["diagnostics"].as_array().expect("array").is_empty());

    // The proxy owns the workspace: the file must exist on disk.
    let on_disk = std::fs::read_to_string(server.dir.path().join("main.go")).expect("file");
    assert!(on_disk.contains("package main"));
}

#[tokio::test]
async fn completion_after_edit_sees_new_content() {
    let server = TestServer::start(mock_config(&["go"], &[])).await;
    let mut ws = server.connect().await;

    send(&mut ws, did_open("file:///main.go", "go", 1, "package main\n")).await;
    send(
        &mut ws,
        did_change("file:///main.go", 2, "package main\nPrintln marker\n"),
    )
    .await;
    send(
        &mut ws,
        json!({
            "jsonrpc": "2.0",
            "id": 42,
            "method": "textDocument/completion",
            "params": {
                "textDocument": { "uri": "file:///main.go" },
                "position": { "line": 1, "character": 4 }
            }
        }),
    )
    .await;

    let reply = wait_for(&mut ws, Duration::from_secs(5), response_with_id(42)).await;
    let labels: Vec<&str> = reply["result"]["items"]
        .as_array()
        .expect("items")
        .iter()
        .filter_map(|i| i["label"].as_str())
        .collect();
    assert!(labels.contains(&"Println"), "labels: {labels:?}");
}

#[tokio::test]
async fn per_uri_ordering_under_load() {
    let server = TestServer::start(mock_config(&["typescript"], &[])).await;
    let mut ws = server.connect().await;

    send(&mut ws, did_open("file:///a.ts", "typescript", 1, "round0")).await;
    for version in 2..=101 {
        send(
            &mut ws,
            did_change("file:///a.ts", version, &format!("round{}", version - 1)),
        )
        .await;
    }
    send(&mut ws, hover(7, "file:///a.ts", 0, 0)).await;

    // The hover handler runs behind all 100 edits, so the analyzer answers
    // from the final content and version.
    let mut versions = Vec::new();
    let reply = wait_for(&mut ws, Duration::from_secs(10), |v| {
        if v.get("method").and_then(Value::as_str) == Some("textDocument/publishDiagnostics")
            && let Some(msg) = v["params"]["diagnostics"][0]["message"].as_str()
            && let Some(version) = msg
                .rsplit_once("(v")
                .and_then(|(_, tail)| tail.trim_end_matches(')').parse::<i64>().ok())
        {
            versions.push(version);
        }
        v.get("id").and_then(Value::as_u64) == Some(7)
    })
    .await;

    let contents = reply["result"]["contents"]["value"].as_str().expect("hover");
    assert!(contents.contains("round100"), "hover: {contents}");
    assert!(contents.contains("(v101)"), "hover: {contents}");

    // Versions observed by the analyzer are strictly increasing.
    assert!(!versions.is_empty());
    for pair in versions.windows(2) {
        assert!(pair[0] < pair[1], "versions out of order: {versions:?}");
    }
}

#[tokio::test]
async fn unknown_method_is_rejected() {
    let server = TestServer::start(mock_config(&[], &[])).await;
    let mut ws = server.connect().await;

    send(
        &mut ws,
        json!({ "jsonrpc": "2.0", "id": 3, "method": "workspace/symbol", "params": {} }),
    )
    .await;
    let reply = wait_for(&mut ws, Duration::from_secs(5), response_with_id(3)).await;
    assert_eq!(reply["error"]["code"], -32601);
}

#[tokio::test]
async fn oversized_frame_keeps_connection_open() {
    let mut config = mock_config(&[], &[]);
    config.max_frame_bytes = 1024;
    let server = TestServer::start(config).await;
    let mut ws = server.connect().await;

    let padding = "x".repeat(4096);
    send(
        &mut ws,
        json!({
            "jsonrpc": "2.0",
            "id": 5,
            "method": "textDocument/hover",
            "params": { "padding": padding }
        }),
    )
    .await;

    let reply = wait_for(&mut ws, Duration::from_secs(5), response_with_id(5)).await;
    assert_eq!(reply["error"]["code"], -32600);

    // The connection survives: a normal request still gets answered.
    send(&mut ws, initialize(6)).await;
    let reply = wait_for(&mut ws, Duration::from_secs(5), response_with_id(6)).await;
    assert!(reply["result"]["capabilities"].is_object());
}

#[tokio::test]
async fn disconnect_closes_owned_documents() {
    let server = TestServer::start(mock_config(&["go"], &[])).await;

    let mut first = server.connect().await;
    send(
        &mut first,
        did_open("file:///owned.go", "go", 1, "package main\n"),
    )
    .await;
    wait_for(
        &mut first,
        Duration::from_secs(5),
        diagnostics_for("file:///owned.go"),
    )
    .await;

    first.close(None).await.expect("close");
    drop(first);

    // Give the teardown a moment to forward didClose.
    tokio::time::sleep(Duration::from_millis(500)).await;

    // The analyzer stays alive for the idle window...
    let analyzer = server.manager.get_live("go").await.expect("analyzer alive");
    assert!(analyzer.is_alive());

    // ...but the document was closed: a fresh session's hover finds nothing.
    let mut second = server.connect().await;
    send(&mut second, hover(9, "file:///owned.go", 0, 1)).await;
    let reply = wait_for(&mut second, Duration::from_secs(5), response_with_id(9)).await;
    assert!(reply["result"].is_null(), "expected null hover: {reply}");
}

#[tokio::test]
async fn crashed_analyzer_is_restarted_on_next_request() {
    // mockls exits right after its second response (initialize, hover).
    let server = TestServer::start(mock_config(&["go"], &["--drop-after", "2"])).await;
    let mut ws = server.connect().await;

    send(&mut ws, did_open("file:///c.go", "go", 1, "package main\n")).await;
    send(&mut ws, hover(11, "file:///c.go", 0, 1)).await;
    let reply = wait_for(&mut ws, Duration::from_secs(5), response_with_id(11)).await;
    assert!(reply.get("error").is_none());

    // Wait until the crash is observed.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if server.manager.get_live("go").await.is_none() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "analyzer never died"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // The next request spawns a replacement (within the restart budget)
    // and succeeds; the fresh analyzer has no open documents, so the
    // result is null but not an error.
    send(&mut ws, hover(12, "file:///c.go", 0, 1)).await;
    let reply = wait_for(&mut ws, Duration::from_secs(10), response_with_id(12)).await;
    assert!(
        reply.get("error").is_none(),
        "restart should succeed: {reply}"
    );

    let analyzer = server.manager.get_live("go").await.expect("replacement");
    assert!(analyzer.is_alive());
}
