// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Per-client proxy session.
//!
//! One session exists per WebSocket connection. It classifies incoming
//! JSON-RPC messages, schedules every `textDocument.uri`-bearing handler
//! behind the per-URI FIFO lock, keeps the workspace store in sync,
//! rewrites URIs between client space (workspace-relative) and analyzer
//! space (absolute paths under the root), and pumps analyzer-originated
//! notifications back to the client.
//!
//! Clients and analyzers live in different URI spaces:
//! `file:///src/main.go` on the wire maps to
//! `file:///<workspace-root>/src/main.go` at the analyzer, in both
//! directions, including URIs inside responses and notifications.

use anyhow::{Result, anyhow};
use lsp_types::{DidChangeTextDocumentParams, DidOpenTextDocumentParams};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::{INVALID_REQUEST, METHOD_NOT_FOUND_MARKER, WorkspaceError, classify_error};
use crate::lock::UriLocks;
use crate::lsp::protocol::{Incoming, NotificationMessage, RequestMessage, ResponseMessage};
use crate::lsp::{AnalyzerManager, AnalyzerProcess, NotificationSink};
use crate::workspace::WorkspaceStore;

/// Requests the session forwards to an analyzer.
const FORWARDED_REQUESTS: &[&str] = &[
    "textDocument/completion",
    "textDocument/hover",
    "textDocument/definition",
    "textDocument/references",
    "textDocument/formatting",
];

/// Direction of a URI rewrite.
#[derive(Clone, Copy)]
enum Rewrite {
    /// Client space -> analyzer space (absolute under the root).
    ToAnalyzer,
    /// Analyzer space -> client space (workspace-relative).
    ToClient,
}

/// Server-side state for one connected browser client.
pub struct ProxySession {
    id: String,
    outbound: mpsc::UnboundedSender<String>,
    workspace: Arc<WorkspaceStore>,
    manager: Arc<AnalyzerManager>,
    locks: UriLocks,
    open_docs: StdMutex<HashSet<String>>,
    notif_tx: NotificationSink,
}

impl ProxySession {
    /// Creates a session and starts its notification pump.
    ///
    /// `outbound` receives serialized JSON-RPC frames for the WebSocket
    /// write task.
    pub fn new(
        id: String,
        workspace: Arc<WorkspaceStore>,
        manager: Arc<AnalyzerManager>,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Arc<Self> {
        let (notif_tx, mut notif_rx) = mpsc::unbounded_channel::<NotificationMessage>();

        let session = Arc::new(Self {
            id,
            outbound,
            workspace,
            manager,
            locks: UriLocks::new(),
            open_docs: StdMutex::new(HashSet::new()),
            notif_tx,
        });

        // Analyzer-originated notifications flow here while this session is
        // the bound sink; URIs are translated back to client space. The pump
        // holds only a weak handle so a disposed session can be freed even
        // while an analyzer still points at its old sink.
        let pump = Arc::downgrade(&session);
        tokio::spawn(async move {
            while let Some(mut notification) = notif_rx.recv().await {
                let Some(session) = pump.upgrade() else { break };
                session.rewrite_uris(&mut notification.params, Rewrite::ToClient);
                session.send_notification(&notification);
            }
        });

        session
    }

    /// The opaque session id assigned by the transport.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Entry point for one WebSocket text frame.
    ///
    /// Classification and queueing are synchronous so that per-URI FIFO
    /// positions follow socket arrival order; handlers then run as
    /// independent tasks.
    pub fn handle_text(self: &Arc<Self>, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                // No id is recoverable from an unparseable frame.
                warn!("[{}] dropping unparseable frame: {e}", self.id);
                return;
            }
        };

        let message = match Incoming::classify(value) {
            Ok(message) => message,
            Err(e) => {
                warn!("[{}] invalid message: {e}", self.id);
                self.send_response(&ResponseMessage::failure(
                    None,
                    INVALID_REQUEST,
                    format!("invalid request: {e}"),
                ));
                return;
            }
        };

        match message {
            Incoming::Request(request) => {
                let uri = document_uri(&request.params);
                let session = self.clone();
                match uri {
                    Some(uri) => {
                        let mut permit = self.locks.acquire(&uri);
                        tokio::spawn(async move {
                            permit.acquired().await;
                            let response = session.dispatch_request(request).await;
                            session.send_response(&response);
                        });
                    }
                    None => {
                        tokio::spawn(async move {
                            let response = session.dispatch_request(request).await;
                            session.send_response(&response);
                        });
                    }
                }
            }
            Incoming::Notification(notification) => {
                let uri = document_uri(&notification.params);
                let session = self.clone();
                match uri {
                    Some(uri) => {
                        let mut permit = self.locks.acquire(&uri);
                        tokio::spawn(async move {
                            permit.acquired().await;
                            if let Err(e) = session.dispatch_notification(notification).await {
                                debug!("[{}] notification handler: {e:#}", session.id);
                            }
                        });
                    }
                    None => {
                        tokio::spawn(async move {
                            if let Err(e) = session.dispatch_notification(notification).await {
                                debug!("[{}] notification handler: {e:#}", session.id);
                            }
                        });
                    }
                }
            }
            Incoming::Response(response) => {
                // The proxy never sends client-directed requests.
                trace!("[{}] ignoring client response {:?}", self.id, response.id);
            }
        }
    }

    /// Reports a frame that exceeded the configured size ceiling. The
    /// connection stays open.
    pub fn reject_oversized(&self, text: &str, limit: usize) {
        // Best effort at recovering the id from the oversized frame.
        let id = serde_json::from_str::<Value>(text)
            .ok()
            .and_then(|v| v.get("id").cloned())
            .and_then(|id| serde_json::from_value(id).ok());
        warn!("[{}] frame over {limit} bytes rejected", self.id);
        self.send_response(&ResponseMessage::failure(
            id,
            INVALID_REQUEST,
            format!("frame exceeds {limit} byte limit"),
        ));
    }

    // ── Requests ────────────────────────────────────────────────────────

    async fn dispatch_request(self: &Arc<Self>, request: RequestMessage) -> ResponseMessage {
        let id = request.id.clone();
        let method = request.method.as_str();

        let outcome = match method {
            "initialize" => Ok(self.initialize_result()),
            "shutdown" => Ok(Value::Null),
            m if FORWARDED_REQUESTS.contains(&m) => {
                return self.forward_request(request).await;
            }
            other => Err(anyhow!("{METHOD_NOT_FOUND_MARKER}{other}")),
        };

        match outcome {
            Ok(result) => ResponseMessage::success(id, result),
            Err(e) => {
                let (code, message) = classify_error(&e);
                ResponseMessage::failure(Some(id), code, message)
            }
        }
    }

    /// Routes a document request to the right analyzer and returns its
    /// answer (result or error) under the client's original id.
    async fn forward_request(self: &Arc<Self>, request: RequestMessage) -> ResponseMessage {
        let id = request.id.clone();

        let Some(uri) = document_uri(&request.params) else {
            return ResponseMessage::failure(
                Some(id),
                INVALID_REQUEST,
                format!("{} requires params.textDocument.uri", request.method),
            );
        };

        match self.route(&uri, &request.method, request.params).await {
            Ok(mut response) => {
                if let Some(result) = response.result.as_mut() {
                    self.rewrite_uris(result, Rewrite::ToClient);
                }
                response.id = Some(id);
                response
            }
            Err(e) => {
                let (code, message) = classify_error(&e);
                ResponseMessage::failure(Some(id), code, message)
            }
        }
    }

    /// Sends a request to the analyzer responsible for `uri`.
    async fn route(&self, uri: &str, method: &str, mut params: Value) -> Result<ResponseMessage> {
        let analyzer = self.analyzer_for(uri).await?;
        self.rewrite_uris(&mut params, Rewrite::ToAnalyzer);
        analyzer.request(method, params).await
    }

    /// Looks up the analyzer for a document, spawning lazily and binding
    /// this session as the notification sink.
    async fn analyzer_for(&self, uri: &str) -> Result<Arc<AnalyzerProcess>> {
        let language = self.workspace.document_language(uri).await;
        self.manager
            .get_or_create(&language, self.notif_tx.clone())
            .await
    }

    /// The locally answered `initialize` result.
    fn initialize_result(&self) -> Value {
        serde_json::json!({
            "capabilities": {
                "textDocumentSync": 1,
                "completionProvider": {
                    "triggerCharacters": [".", ":", "<", "\"", "/", "@"],
                    "resolveProvider": false
                },
                "hoverProvider": true,
                "definitionProvider": true,
                "referencesProvider": true,
                "documentFormattingProvider": true
            },
            "serverInfo": {
                "name": "gantry-lsp",
                "version": env!("CARGO_PKG_VERSION")
            }
        })
    }

    // ── Notifications ───────────────────────────────────────────────────

    async fn dispatch_notification(
        self: &Arc<Self>,
        notification: NotificationMessage,
    ) -> Result<()> {
        match notification.method.as_str() {
            "initialized" => Ok(()),
            "textDocument/didOpen" => self.handle_did_open(notification.params).await,
            "textDocument/didChange" => self.handle_did_change(notification.params).await,
            "textDocument/didSave" => self.handle_did_save(notification.params).await,
            "textDocument/didClose" => self.handle_did_close(notification.params).await,
            other => {
                debug!("[{}] ignoring notification {other}", self.id);
                Ok(())
            }
        }
    }

    async fn handle_did_open(self: &Arc<Self>, params: Value) -> Result<()> {
        let parsed: DidOpenTextDocumentParams =
            serde_json::from_value(params).map_err(|e| anyhow!("malformed didOpen: {e}"))?;
        let doc = parsed.text_document;
        let uri = doc.uri.as_str().to_string();

        // Workspace write failures other than escape are logged and the
        // analyzer still gets the in-memory content so the editor keeps
        // working.
        let version = match self
            .workspace
            .open_document(&uri, &doc.text, &doc.language_id, doc.version)
            .await
        {
            Ok(version) => version,
            Err(WorkspaceError::Security(p)) => {
                return Err(WorkspaceError::Security(p).into());
            }
            Err(e) => {
                warn!("[{}] didOpen write failed for {uri}: {e}", self.id);
                doc.version.max(1)
            }
        };

        if let Ok(key) = self.workspace.normalize_uri(&uri) {
            self.open_docs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(key);
        }

        let analyzer = self.analyzer_for(&uri).await?;
        let mut forwarded = serde_json::json!({
            "textDocument": {
                "uri": uri,
                "languageId": doc.language_id,
                "version": version,
                "text": doc.text,
            }
        });
        self.rewrite_uris(&mut forwarded, Rewrite::ToAnalyzer);
        analyzer.notify("textDocument/didOpen", forwarded).await
    }

    async fn handle_did_change(self: &Arc<Self>, params: Value) -> Result<()> {
        let parsed: DidChangeTextDocumentParams =
            serde_json::from_value(params).map_err(|e| anyhow!("malformed didChange: {e}"))?;
        let uri = parsed.text_document.uri.as_str().to_string();
        let client_version = parsed.text_document.version;

        // Reconstruct the full document text. Full-content changes replace
        // outright; ranged deltas are applied to the last stored content.
        let starts_full = parsed
            .content_changes
            .first()
            .is_some_and(|c| c.range.is_none());

        let mut text = if starts_full {
            String::new()
        } else {
            match self.workspace.read_file(&uri).await {
                Ok(content) => content.text,
                Err(WorkspaceError::NotFound(_)) => {
                    // Unknown URI with only deltas cannot be reconstructed.
                    return Err(WorkspaceError::NotFound(uri).into());
                }
                Err(e) => return Err(e.into()),
            }
        };

        for change in &parsed.content_changes {
            match change.range {
                None => {
                    text.clear();
                    text.push_str(&change.text);
                }
                Some(range) => apply_edit(&mut text, range, &change.text),
            }
        }

        let version = match self
            .workspace
            .change_document(&uri, &text, client_version)
            .await
        {
            Ok(version) => version,
            Err(WorkspaceError::Security(p)) => return Err(WorkspaceError::Security(p).into()),
            Err(e) => {
                warn!("[{}] didChange write failed for {uri}: {e}", self.id);
                client_version
            }
        };

        let analyzer = self.analyzer_for(&uri).await?;
        let mut forwarded = serde_json::json!({
            "textDocument": { "uri": uri, "version": version },
            "contentChanges": [{ "text": text }]
        });
        self.rewrite_uris(&mut forwarded, Rewrite::ToAnalyzer);
        analyzer.notify("textDocument/didChange", forwarded).await
    }

    async fn handle_did_save(self: &Arc<Self>, params: Value) -> Result<()> {
        let uri = document_uri(&params).ok_or_else(|| anyhow!("malformed didSave"))?;

        if let Some(text) = params.get("text").and_then(Value::as_str) {
            match self.workspace.save_document(&uri, text).await {
                Ok(()) | Err(WorkspaceError::NotFound(_)) => {}
                Err(WorkspaceError::Security(p)) => {
                    return Err(WorkspaceError::Security(p).into());
                }
                Err(e) => warn!("[{}] didSave write failed for {uri}: {e}", self.id),
            }
        }

        let analyzer = self.analyzer_for(&uri).await?;
        let mut forwarded = params;
        self.rewrite_uris(&mut forwarded, Rewrite::ToAnalyzer);
        analyzer.notify("textDocument/didSave", forwarded).await
    }

    async fn handle_did_close(self: &Arc<Self>, params: Value) -> Result<()> {
        let uri = document_uri(&params).ok_or_else(|| anyhow!("malformed didClose"))?;

        self.workspace.close_document(&uri).await;
        if let Ok(key) = self.workspace.normalize_uri(&uri) {
            self.open_docs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&key);
        }

        let analyzer = self.analyzer_for(&uri).await?;
        let mut forwarded = params;
        self.rewrite_uris(&mut forwarded, Rewrite::ToAnalyzer);
        analyzer.notify("textDocument/didClose", forwarded).await
    }

    // ── Teardown ────────────────────────────────────────────────────────

    /// Disposes the session after its socket closed: every owned URI gets
    /// exactly one `didClose`, queued behind any still-pending work for
    /// that URI. Analyzers stay up for the idle window.
    pub async fn dispose(self: &Arc<Self>) {
        let owned: Vec<String> = {
            let mut docs = self.open_docs.lock().unwrap_or_else(|e| e.into_inner());
            docs.drain().collect()
        };

        debug!("[{}] session closing, {} open docs", self.id, owned.len());

        for uri in owned {
            let mut permit = self.locks.acquire(&uri);
            permit.acquired().await;

            self.workspace.close_document(&uri).await;

            let language = self.workspace.document_language(&uri).await;
            if let Some(analyzer) = self.manager.get_live(&language).await {
                let mut params = serde_json::json!({ "textDocument": { "uri": uri } });
                self.rewrite_uris(&mut params, Rewrite::ToAnalyzer);
                if let Err(e) = analyzer.notify("textDocument/didClose", params).await {
                    debug!("[{}] didClose on teardown failed: {e}", self.id);
                }
            }
        }
    }

    // ── Wire helpers ────────────────────────────────────────────────────

    fn send_response(&self, response: &ResponseMessage) {
        if let Ok(json) = serde_json::to_string(response)
            && self.outbound.send(json).is_err()
        {
            trace!("[{}] client gone, dropping response", self.id);
        }
    }

    fn send_notification(&self, notification: &NotificationMessage) {
        if let Ok(json) = serde_json::to_string(notification)
            && self.outbound.send(json).is_err()
        {
            trace!("[{}] client gone, dropping notification", self.id);
        }
    }

    /// Rewrites every `uri` / `targetUri` field in a JSON tree between the
    /// client and analyzer URI spaces.
    fn rewrite_uris(&self, value: &mut Value, direction: Rewrite) {
        match value {
            Value::Object(map) => {
                for (key, entry) in map.iter_mut() {
                    if (key == "uri" || key == "targetUri")
                        && let Some(uri) = entry.as_str()
                        && let Some(mapped) = self.map_uri(uri, direction)
                    {
                        *entry = Value::String(mapped);
                    } else {
                        self.rewrite_uris(entry, direction);
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.rewrite_uris(item, direction);
                }
            }
            _ => {}
        }
    }

    fn map_uri(&self, uri: &str, direction: Rewrite) -> Option<String> {
        match direction {
            Rewrite::ToAnalyzer => {
                let path = self.workspace.uri_to_path(uri).ok()?;
                Some(format!("file://{}", path.display()))
            }
            Rewrite::ToClient => {
                let path = uri.strip_prefix("file://")?;
                let root = self.workspace.root().to_string_lossy();
                let rel = std::path::Path::new(path).strip_prefix(&*root).ok()?;
                Some(format!(
                    "file:///{}",
                    rel.to_string_lossy().replace('\\', "/")
                ))
            }
        }
    }
}

/// Extracts `params.textDocument.uri` when present.
fn document_uri(params: &Value) -> Option<String> {
    params
        .get("textDocument")
        .and_then(|td| td.get("uri"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

/// Applies one ranged content change to `text`. Positions are
/// line/character with characters counted in UTF-16 code units, per LSP.
fn apply_edit(text: &mut String, range: lsp_types::Range, replacement: &str) {
    let start = position_offset(text, range.start.line, range.start.character);
    let end = position_offset(text, range.end.line, range.end.character).max(start);
    text.replace_range(start..end, replacement);
}

/// Byte offset of an LSP position, clamped to the text bounds.
fn position_offset(text: &str, line: u32, character: u32) -> usize {
    let mut offset = 0;
    for (idx, candidate) in text.split_inclusive('\n').enumerate() {
        if idx == line as usize {
            let mut units = 0u32;
            for (byte, ch) in candidate.char_indices() {
                if units >= character || ch == '\n' {
                    return offset + byte;
                }
                units += ch.len_utf16() as u32;
            }
            return offset + candidate.len();
        }
        offset += candidate.len();
    }
    text.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsp_types::{Position, Range};

    fn range(sl: u32, sc: u32, el: u32, ec: u32) -> Range {
        Range {
            start: Position {
                line: sl,
                character: sc,
            },
            end: Position {
                line: el,
                character: ec,
            },
        }
    }

    #[test]
    fn document_uri_extraction() {
        let params = serde_json::json!({
            "textDocument": { "uri": "file:///a.go" },
            "position": { "line": 0, "character": 0 }
        });
        assert_eq!(document_uri(&params).as_deref(), Some("file:///a.go"));
        assert_eq!(document_uri(&serde_json::json!({})), None);
    }

    #[test]
    fn apply_edit_single_line() {
        let mut text = "let x = 1;".to_string();
        apply_edit(&mut text, range(0, 8, 0, 9), "2");
        assert_eq!(text, "let x = 2;");
    }

    #[test]
    fn apply_edit_across_lines() {
        let mut text = "alpha\nbeta\ngamma\n".to_string();
        apply_edit(&mut text, range(0, 5, 2, 0), " ");
        assert_eq!(text, "alpha gamma\n");
    }

    #[test]
    fn apply_edit_insertion() {
        let mut text = "fn main() {}\n".to_string();
        apply_edit(&mut text, range(0, 11, 0, 11), " println!(); ");
        assert_eq!(text, "fn main() { println!(); }\n");
    }

    #[test]
    fn apply_edit_utf16_characters() {
        // '𝕏' is two UTF-16 code units; the edit lands after it.
        let mut text = "𝕏y".to_string();
        apply_edit(&mut text, range(0, 2, 0, 3), "z");
        assert_eq!(text, "𝕏z");
    }

    #[test]
    fn position_offset_clamps_to_bounds() {
        let text = "ab\ncd";
        assert_eq!(position_offset(text, 9, 0), text.len());
        assert_eq!(position_offset(text, 1, 99), text.len());
        assert_eq!(position_offset(text, 0, 99), 2);
    }

    #[tokio::test]
    async fn uri_mapping_is_bidirectional() {
        let dir = tempfile::tempdir().expect("tempdir");
        let workspace = WorkspaceStore::new(dir.path()).expect("store");
        let manager =
            AnalyzerManager::new(&crate::config::Config::default(), dir.path().to_path_buf());
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let session = ProxySession::new("s1".into(), workspace.clone(), manager, out_tx);

        let analyzer_uri = session
            .map_uri("file:///src/main.go", Rewrite::ToAnalyzer)
            .expect("to analyzer");
        assert_eq!(
            analyzer_uri,
            format!("file://{}/src/main.go", workspace.root().display())
        );

        let back = session
            .map_uri(&analyzer_uri, Rewrite::ToClient)
            .expect("to client");
        assert_eq!(back, "file:///src/main.go");
    }

    #[tokio::test]
    async fn rewrite_touches_nested_uris_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let workspace = WorkspaceStore::new(dir.path()).expect("store");
        let manager =
            AnalyzerManager::new(&crate::config::Config::default(), dir.path().to_path_buf());
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let session = ProxySession::new("s2".into(), workspace.clone(), manager, out_tx);

        let mut value = serde_json::json!({
            "uri": "file:///a.ts",
            "nested": [{ "targetUri": "file:///b.ts", "label": "file:///not-a-uri-key" }]
        });
        session.rewrite_uris(&mut value, Rewrite::ToAnalyzer);

        let root = workspace.root().display().to_string();
        assert_eq!(value["uri"], format!("file://{root}/a.ts"));
        assert_eq!(value["nested"][0]["targetUri"], format!("file://{root}/b.ts"));
        // Non-URI keys are untouched.
        assert_eq!(value["nested"][0]["label"], "file:///not-a-uri-key");
    }
}
