// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Supervision of one analyzer subprocess for one languageId.
//!
//! Speaks LSP over the child's stdio with Content-Length framing. A reader
//! task routes responses to pending requests by id and pushes
//! server-initiated notifications into the currently bound session sink.
//! Stderr is drained into the logs.

use anyhow::{Context, Result, anyhow};
use bytes::BytesMut;
use lsp_types::{
    ClientCapabilities, CompletionClientCapabilities, CompletionItemCapability,
    DocumentSymbolClientCapabilities, GotoCapability, HoverClientCapabilities, InitializeParams,
    InitializeResult, InitializedParams, MarkupKind, PublishDiagnosticsClientCapabilities,
    TextDocumentClientCapabilities, WorkspaceClientCapabilities, WorkspaceFolder,
};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use super::protocol::{
    self, NotificationMessage, RequestId, RequestMessage, ResponseMessage, encode_framed,
};
use super::state::{AnalyzerState, AnalyzerStatus};
use crate::error::METHOD_NOT_FOUND;

/// Destination for analyzer-originated notifications: the bound session's
/// outbound channel. Swapped atomically when a new session takes over.
pub type NotificationSink = mpsc::UnboundedSender<NotificationMessage>;

/// Grace period for the shutdown/exit handshake before SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Manages communication with one analyzer subprocess.
#[derive(Debug)]
pub struct AnalyzerProcess {
    language: String,
    next_id: AtomicI64,
    stdin: Arc<Mutex<ChildStdin>>,
    pending: Arc<Mutex<HashMap<RequestId, oneshot::Sender<ResponseMessage>>>>,
    sink: Arc<StdMutex<NotificationSink>>,
    alive: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    last_used: StdMutex<Instant>,
    spawn_time: Instant,
    child: Mutex<Child>,
    _reader_handle: tokio::task::JoinHandle<()>,
    _stderr_handle: tokio::task::JoinHandle<()>,
}

impl AnalyzerProcess {
    /// Spawns the analyzer process and starts the reader tasks.
    ///
    /// # Errors
    ///
    /// Fails fast if the binary cannot be started; this is a user-facing
    /// configuration error.
    pub fn spawn(
        command: &str,
        args: &[String],
        language: &str,
        sink: NotificationSink,
    ) -> Result<Self> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn analyzer for {language}: {command}"))?;

        let stdin = child.stdin.take().context("stdin not captured")?;
        let stdout = child.stdout.take().context("stdout not captured")?;
        let stderr = child.stderr.take().context("stderr not captured")?;

        let stdin = Arc::new(Mutex::new(stdin));
        let pending: Arc<Mutex<HashMap<RequestId, oneshot::Sender<ResponseMessage>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let sink = Arc::new(StdMutex::new(sink));
        let alive = Arc::new(AtomicBool::new(true));
        let state = Arc::new(AtomicU8::new(AnalyzerState::Spawning.as_u8()));

        let reader_handle = tokio::spawn(Self::reader_task(
            stdin.clone(),
            stdout,
            pending.clone(),
            sink.clone(),
            alive.clone(),
            state.clone(),
            language.to_string(),
        ));

        let stderr_handle = tokio::spawn(Self::stderr_task(stderr, language.to_string()));

        Ok(Self {
            language: language.to_string(),
            next_id: AtomicI64::new(1),
            stdin,
            pending,
            sink,
            alive,
            state,
            last_used: StdMutex::new(Instant::now()),
            spawn_time: Instant::now(),
            child: Mutex::new(child),
            _reader_handle: reader_handle,
            _stderr_handle: stderr_handle,
        })
    }

    /// Background task that reads analyzer messages and routes them.
    async fn reader_task(
        stdin: Arc<Mutex<ChildStdin>>,
        stdout: ChildStdout,
        pending: Arc<Mutex<HashMap<RequestId, oneshot::Sender<ResponseMessage>>>>,
        sink: Arc<StdMutex<NotificationSink>>,
        alive: Arc<AtomicBool>,
        state: Arc<AtomicU8>,
        language: String,
    ) {
        let mut reader = BufReader::new(stdout);
        let mut buffer = BytesMut::with_capacity(8192);

        'read: loop {
            let mut temp = [0u8; 4096];
            match reader.read(&mut temp).await {
                Ok(0) => {
                    debug!("[{language}] analyzer stdout closed");
                    break;
                }
                Ok(n) => {
                    buffer.extend_from_slice(&temp[..n]);
                }
                Err(e) => {
                    error!("[{language}] error reading analyzer stdout: {e}");
                    break;
                }
            }

            loop {
                let message_str = match protocol::try_parse_message(&mut buffer) {
                    Ok(Some(message)) => message,
                    Ok(None) => break,
                    Err(e) => {
                        // Framing errors are not recoverable in place.
                        error!("[{language}] framing error on analyzer stream: {e}");
                        break 'read;
                    }
                };

                trace!("[{language}] <- {message_str}");

                let value: serde_json::Value = match serde_json::from_str(&message_str) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("[{language}] invalid JSON from analyzer: {e}");
                        break 'read;
                    }
                };

                if let Some(method) = value.get("method").and_then(|m| m.as_str()) {
                    if let Some(id) = value.get("id") {
                        // Server-initiated request (workspace/configuration,
                        // client/registerCapability, ...). Reply with
                        // MethodNotFound so the analyzer does not block.
                        debug!("[{language}] server request {method} (id {id})");
                        let response = ResponseMessage::failure(
                            serde_json::from_value(id.clone()).ok(),
                            METHOD_NOT_FOUND,
                            format!("Method '{method}' not supported by client"),
                        );
                        if let Ok(bytes) = encode_framed(&response) {
                            let mut stdin_guard = stdin.lock().await;
                            if let Err(e) = stdin_guard.write_all(&bytes).await {
                                warn!("[{language}] failed to answer server request: {e}");
                            } else if let Err(e) = stdin_guard.flush().await {
                                warn!("[{language}] failed to flush: {e}");
                            }
                        }
                    } else if let Ok(notification) =
                        serde_json::from_value::<NotificationMessage>(value)
                    {
                        if notification.method == "window/logMessage" {
                            if let Some(msg) =
                                notification.params.get("message").and_then(|m| m.as_str())
                            {
                                debug!("[{language}] log: {msg}");
                            }
                        }
                        // Deliver in arrival order to the bound sink. A send
                        // failure just means no session is listening right now.
                        let bound = sink.lock().unwrap_or_else(|e| e.into_inner()).clone();
                        if bound.send(notification).is_err() {
                            trace!("[{language}] dropped notification (no bound session)");
                        }
                    }
                } else if value.get("id").is_some() {
                    if let Ok(response) = serde_json::from_value::<ResponseMessage>(value)
                        && let Some(id) = &response.id
                    {
                        let mut pending = pending.lock().await;
                        if let Some(sender) = pending.remove(id) {
                            let _ = sender.send(response);
                        } else {
                            // Late response for a cancelled or restarted request.
                            trace!("[{language}] dropping late response for {id:?}");
                        }
                    }
                } else {
                    warn!("[{language}] unknown message shape from analyzer");
                }
            }
        }

        alive.store(false, Ordering::SeqCst);
        let previous = AnalyzerState::from_u8(state.load(Ordering::SeqCst));
        if !matches!(previous, AnalyzerState::Stopping | AnalyzerState::Stopped) {
            state.store(AnalyzerState::Crashed.as_u8(), Ordering::SeqCst);
            warn!("[{language}] analyzer connection lost");
        }

        // Fail everything still in flight.
        pending.lock().await.clear();
    }

    /// Drains analyzer stderr into the logs.
    async fn stderr_task(stderr: tokio::process::ChildStderr, language: String) {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("[{language}] stderr: {line}");
        }
    }

    /// Sends a request and waits for the matching response.
    ///
    /// No per-request timeout is applied; a crashed or stopping analyzer
    /// cancels all pending requests instead.
    ///
    /// # Errors
    ///
    /// Returns an error if the analyzer goes away before replying.
    pub async fn request(&self, method: &str, params: serde_json::Value) -> Result<ResponseMessage> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let request = RequestMessage::new(id.clone(), method, params);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if let Err(e) = self.send_message(&request).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(response) => Ok(response),
            Err(_) => Err(anyhow!(
                "analyzer for '{}' went away while awaiting '{method}'",
                self.language
            )),
        }
    }

    /// Sends a notification (no response expected).
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be written.
    pub async fn notify(&self, method: &str, params: serde_json::Value) -> Result<()> {
        let notification = NotificationMessage::new(method, params);
        self.send_message(&notification).await
    }

    /// Sends a framed JSON-RPC message and refreshes the idle clock.
    async fn send_message<T: serde::Serialize>(&self, message: &T) -> Result<()> {
        let bytes = encode_framed(message)?;
        self.touch();

        let mut stdin = self.stdin.lock().await;
        stdin.write_all(&bytes).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Performs the LSP initialize handshake with a deadline.
    ///
    /// # Errors
    ///
    /// On timeout or error the child is killed and the analyzer is marked
    /// crashed.
    pub async fn initialize(&self, root: &Path, deadline: Duration) -> Result<InitializeResult> {
        self.state
            .store(AnalyzerState::Initializing.as_u8(), Ordering::SeqCst);

        let root_uri: lsp_types::Uri = format!("file://{}", root.display())
            .parse()
            .map_err(|e| anyhow!("Invalid workspace root {:?}: {e}", root))?;

        let params = InitializeParams {
            process_id: Some(std::process::id()),
            capabilities: declared_capabilities(),
            workspace_folders: Some(vec![WorkspaceFolder {
                uri: root_uri,
                name: root
                    .file_name()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "workspace".to_string()),
            }]),
            ..Default::default()
        };

        let handshake = async {
            let response = self
                .request("initialize", serde_json::to_value(params)?)
                .await?;
            if let Some(error) = response.error {
                anyhow::bail!("initialize failed: {} {}", error.code, error.message);
            }
            let result: InitializeResult =
                serde_json::from_value(response.result.unwrap_or(serde_json::Value::Null))
                    .context("Failed to parse initialize result")?;
            self.notify("initialized", serde_json::to_value(InitializedParams {})?)
                .await?;
            Ok::<_, anyhow::Error>(result)
        };

        match tokio::time::timeout(deadline, handshake).await {
            Ok(Ok(result)) => {
                if let Some(info) = &result.server_info {
                    debug!(
                        "[{}] analyzer ready: {} {}",
                        self.language,
                        info.name,
                        info.version.as_deref().unwrap_or("")
                    );
                }
                self.state
                    .store(AnalyzerState::Running.as_u8(), Ordering::SeqCst);
                Ok(result)
            }
            Ok(Err(e)) => {
                self.mark_crashed().await;
                Err(e)
            }
            Err(_) => {
                self.mark_crashed().await;
                Err(anyhow!(
                    "analyzer for '{}' did not initialize within {deadline:?}",
                    self.language
                ))
            }
        }
    }

    /// Kills the child and records the crash.
    async fn mark_crashed(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.state
            .store(AnalyzerState::Crashed.as_u8(), Ordering::SeqCst);
        let _ = self.child.lock().await.kill().await;
        self.pending.lock().await.clear();
    }

    /// Graceful stop: shutdown request, exit notification, grace period,
    /// then SIGKILL. Pending requests are cancelled. Idempotent.
    pub async fn stop(&self) {
        let current = self.state();
        if matches!(current, AnalyzerState::Stopping | AnalyzerState::Stopped) {
            return;
        }
        self.state
            .store(AnalyzerState::Stopping.as_u8(), Ordering::SeqCst);

        if self.alive.load(Ordering::SeqCst) {
            let shutdown = async {
                let _ = self.request("shutdown", serde_json::Value::Null).await;
                let _ = self.notify("exit", serde_json::Value::Null).await;
            };
            if tokio::time::timeout(STOP_GRACE, shutdown).await.is_err() {
                debug!("[{}] shutdown handshake timed out", self.language);
            }
        }

        {
            let mut child = self.child.lock().await;
            match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!("[{}] analyzer exited: {status}", self.language),
                _ => {
                    warn!("[{}] analyzer did not exit, killing", self.language);
                    let _ = child.kill().await;
                }
            }
        }

        self.alive.store(false, Ordering::SeqCst);
        self.pending.lock().await.clear();
        self.state
            .store(AnalyzerState::Stopped.as_u8(), Ordering::SeqCst);
    }

    /// Rebinds the notification sink to a new session.
    pub fn bind_sink(&self, sink: NotificationSink) {
        *self.sink.lock().unwrap_or_else(|e| e.into_inner()) = sink;
    }

    /// Sends a notification directly to the bound sink (used to surface
    /// analyzer failures as `window/showMessage`).
    pub fn push_to_sink(&self, notification: NotificationMessage) {
        let bound = self.sink.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let _ = bound.send(notification);
    }

    /// Refreshes the idle clock.
    pub fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// Time since the last outbound message.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// True while the analyzer connection is up.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> AnalyzerState {
        AnalyzerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// The language this analyzer serves.
    #[must_use]
    pub fn language(&self) -> &str {
        &self.language
    }

    /// Snapshot for logs and the doctor command.
    pub async fn status(&self) -> AnalyzerStatus {
        AnalyzerStatus {
            language: self.language.clone(),
            state: self.state(),
            uptime_secs: self.spawn_time.elapsed().as_secs(),
            pending_requests: self.pending.lock().await.len(),
        }
    }
}

/// The client capabilities Gantry declares to every analyzer.
fn declared_capabilities() -> ClientCapabilities {
    ClientCapabilities {
        text_document: Some(TextDocumentClientCapabilities {
            hover: Some(HoverClientCapabilities {
                content_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
                ..Default::default()
            }),
            completion: Some(CompletionClientCapabilities {
                completion_item: Some(CompletionItemCapability {
                    snippet_support: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            definition: Some(GotoCapability {
                link_support: Some(true),
                ..Default::default()
            }),
            references: Some(Default::default()),
            document_symbol: Some(DocumentSymbolClientCapabilities {
                hierarchical_document_symbol_support: Some(true),
                ..Default::default()
            }),
            publish_diagnostics: Some(PublishDiagnosticsClientCapabilities {
                related_information: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }),
        workspace: Some(WorkspaceClientCapabilities {
            workspace_folders: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}
