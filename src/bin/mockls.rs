// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! A configurable mock analyzer for testing the proxy.
//!
//! Speaks LSP over stdin/stdout using Content-Length framed JSON-RPC. CLI
//! flags control timing and failure modes. No tokio — uses `std::thread`
//! for deferred notifications.
//!
//! Diagnostics messages embed the document version the server last saw,
//! so ordering tests can assert what reached the analyzer and when.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Mock analyzer for integration testing.
#[derive(Parser, Debug)]
#[command(name = "mockls")]
struct Args {
    /// Accepted for typescript-language-server compatibility; stdio is the
    /// only transport anyway.
    #[arg(long)]
    stdio: bool,

    /// Sleep before every response (milliseconds).
    #[arg(long, default_value_t = 0)]
    response_delay: u64,

    /// Delay before publishing diagnostics (milliseconds).
    #[arg(long, default_value_t = 0)]
    diagnostics_delay: u64,

    /// Never publish diagnostics.
    #[arg(long)]
    no_diagnostics: bool,

    /// Close down after n responses (simulate crash).
    #[arg(long)]
    drop_after: Option<u64>,

    /// Exit abruptly n milliseconds after startup (simulate an external
    /// kill).
    #[arg(long)]
    die_after: Option<u64>,

    /// Never respond to this method (repeatable).
    #[arg(long)]
    hang_on: Vec<String>,

    /// Return `InternalError` for this method (repeatable).
    #[arg(long)]
    fail_on: Vec<String>,
}

/// A JSON-RPC request.
#[derive(Debug, Deserialize)]
struct Request {
    #[allow(dead_code, reason = "Required by JSON-RPC protocol")]
    jsonrpc: String,
    id: Option<Value>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
}

/// A JSON-RPC response.
#[derive(Debug, Serialize)]
struct Response {
    jsonrpc: String,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

/// JSON-RPC error object.
#[derive(Debug, Serialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Thread-safe writer handle. Wraps `std::io::Stdout` for production, or a
/// shared `Vec<u8>` for tests.
type Writer = Arc<Mutex<Box<dyn Write + Send>>>;

fn stdout_writer() -> Writer {
    Arc::new(Mutex::new(Box::new(std::io::stdout())))
}

#[cfg(test)]
fn buffer_writer() -> (Writer, Arc<Mutex<Vec<u8>>>) {
    let buf = Arc::new(Mutex::new(Vec::<u8>::new()));
    let writer: Box<dyn Write + Send> = Box::new(SharedVecWriter(buf.clone()));
    (Arc::new(Mutex::new(writer)), buf)
}

#[cfg(test)]
struct SharedVecWriter(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl Write for SharedVecWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .map_err(|e| std::io::Error::other(e.to_string()))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Tracked document state.
struct Doc {
    version: i64,
    text: String,
}

/// Shared state for the mock analyzer.
struct MockAnalyzer {
    args: Args,
    documents: HashMap<String, Doc>,
    response_count: u64,
    writer: Writer,
}

impl MockAnalyzer {
    fn new(args: Args, writer: Writer) -> Self {
        Self {
            args,
            documents: HashMap::new(),
            response_count: 0,
            writer,
        }
    }

    /// Run the analyzer, reading from the given reader.
    fn run(&mut self, reader: &mut dyn Read) {
        let mut buffer = Vec::new();
        let mut temp = [0u8; 4096];

        loop {
            match reader.read(&mut temp) {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer.extend_from_slice(&temp[..n]),
            }

            while let Some((message, consumed)) = try_parse_message(&buffer) {
                buffer.drain(..consumed);

                let Ok(request) = serde_json::from_str::<Request>(&message) else {
                    continue;
                };

                self.handle_message(request);
            }
        }
    }

    fn handle_message(&mut self, request: Request) {
        let Some(method) = request.method.clone() else {
            return;
        };

        if request.id.is_some() {
            self.handle_request(&method, request);
        } else {
            self.handle_notification(&method, &request.params);
        }
    }

    fn handle_request(&mut self, method: &str, request: Request) {
        let Some(id) = request.id else { return };

        if self.args.hang_on.iter().any(|m| m == method) {
            return;
        }

        if self.args.response_delay > 0 {
            std::thread::sleep(Duration::from_millis(self.args.response_delay));
        }

        if self.args.fail_on.iter().any(|m| m == method) {
            self.send_response(&Response {
                jsonrpc: "2.0".to_string(),
                id,
                result: None,
                error: Some(RpcError {
                    code: -32603,
                    message: format!("mockls: configured to fail on {method}"),
                }),
            });
            return;
        }

        let result = match method {
            "initialize" => Some(handle_initialize()),
            "shutdown" => Some(Value::Null),
            "textDocument/hover" => self.handle_hover(&request.params),
            "textDocument/definition" => self.handle_definition(&request.params),
            "textDocument/references" => self.handle_references(&request.params),
            "textDocument/completion" => self.handle_completion(&request.params),
            "textDocument/formatting" => self.handle_formatting(&request.params),
            _ => {
                self.send_response(&Response {
                    jsonrpc: "2.0".to_string(),
                    id,
                    result: None,
                    error: Some(RpcError {
                        code: -32601,
                        message: format!("mockls: method not found: {method}"),
                    }),
                });
                return;
            }
        };

        self.send_response(&Response {
            jsonrpc: "2.0".to_string(),
            id,
            result,
            error: None,
        });
    }

    fn handle_notification(&mut self, method: &str, params: &Value) {
        match method {
            "textDocument/didOpen" => {
                if let Some(td) = params.get("textDocument") {
                    let uri = td.get("uri").and_then(Value::as_str).unwrap_or_default();
                    let text = td.get("text").and_then(Value::as_str).unwrap_or_default();
                    let version = td.get("version").and_then(Value::as_i64).unwrap_or(1);
                    self.documents.insert(
                        uri.to_string(),
                        Doc {
                            version,
                            text: text.to_string(),
                        },
                    );

                    if !self.args.no_diagnostics {
                        self.publish_diagnostics(uri, version);
                    }
                }
            }
            "textDocument/didChange" => {
                let uri = params
                    .get("textDocument")
                    .and_then(|td| td.get("uri"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let version = params
                    .get("textDocument")
                    .and_then(|td| td.get("version"))
                    .and_then(Value::as_i64)
                    .unwrap_or(0);

                if let Some(text) = params
                    .get("contentChanges")
                    .and_then(Value::as_array)
                    .and_then(|arr| arr.last())
                    .and_then(|c| c.get("text"))
                    .and_then(Value::as_str)
                {
                    self.documents.insert(
                        uri.clone(),
                        Doc {
                            version,
                            text: text.to_string(),
                        },
                    );
                }

                if !self.args.no_diagnostics {
                    self.publish_diagnostics(&uri, version);
                }
            }
            "textDocument/didSave" => {
                if let Some(td) = params.get("textDocument") {
                    let uri = td.get("uri").and_then(Value::as_str).unwrap_or_default();
                    let version = self.documents.get(uri).map_or(0, |d| d.version);
                    if !self.args.no_diagnostics {
                        self.publish_diagnostics(uri, version);
                    }
                }
            }
            "textDocument/didClose" => {
                if let Some(td) = params.get("textDocument") {
                    let uri = td.get("uri").and_then(Value::as_str).unwrap_or_default();
                    self.documents.remove(uri);
                }
            }
            "exit" => {
                std::process::exit(0);
            }
            // initialized and everything else is silently accepted
            _ => {}
        }
    }

    fn handle_hover(&self, params: &Value) -> Option<Value> {
        let (uri, line, col) = extract_position(params)?;
        let doc = self.documents.get(uri)?;
        let word = extract_word(&doc.text, line, col)?;

        Some(serde_json::json!({
            "contents": {
                "kind": "markdown",
                "value": format!("```\n{word}\n```\n(v{})", doc.version)
            }
        }))
    }

    fn handle_definition(&self, params: &Value) -> Option<Value> {
        let (uri, line, col) = extract_position(params)?;
        let doc = self.documents.get(uri)?;
        let word = extract_word(&doc.text, line, col)?;

        let def_patterns = [
            format!("func {word}"),
            format!("function {word}"),
            format!("fn {word}"),
            format!("let {word}"),
            format!("const {word}"),
            format!("var {word}"),
        ];

        for (line_idx, line_text) in doc.text.lines().enumerate() {
            for pattern in &def_patterns {
                if let Some(col_idx) = line_text.find(pattern.as_str()) {
                    return Some(location_json(
                        uri,
                        line_idx,
                        col_idx,
                        col_idx + pattern.len(),
                    ));
                }
            }
        }

        // Fall back to first occurrence
        for (line_idx, line_text) in doc.text.lines().enumerate() {
            if let Some(col_idx) = line_text.find(&word) {
                return Some(location_json(uri, line_idx, col_idx, col_idx + word.len()));
            }
        }

        None
    }

    fn handle_references(&self, params: &Value) -> Option<Value> {
        let (uri, line, col) = extract_position(params)?;
        let doc = self.documents.get(uri)?;
        let word = extract_word(&doc.text, line, col)?;

        let mut locations = Vec::new();
        for (line_idx, line_text) in doc.text.lines().enumerate() {
            let mut start = 0;
            while let Some(pos) = line_text[start..].find(&word) {
                let col_idx = start + pos;
                locations.push(location_json(uri, line_idx, col_idx, col_idx + word.len()));
                start = col_idx + word.len();
            }
        }

        Some(Value::Array(locations))
    }

    /// Completion items are the distinct words of the document, so tests
    /// can assert that edits reached the analyzer before the request.
    fn handle_completion(&self, params: &Value) -> Option<Value> {
        let uri = params
            .get("textDocument")
            .and_then(|td| td.get("uri"))
            .and_then(Value::as_str)?;
        let doc = self.documents.get(uri)?;

        let mut words: Vec<&str> = doc
            .text
            .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .filter(|w| w.len() > 1)
            .collect();
        words.sort_unstable();
        words.dedup();

        let items: Vec<Value> = words
            .into_iter()
            .take(100)
            .map(|w| serde_json::json!({ "label": w, "kind": 1 }))
            .collect();

        Some(serde_json::json!({ "isIncomplete": false, "items": items }))
    }

    /// Formatting trims trailing whitespace and guarantees a final newline.
    fn handle_formatting(&self, params: &Value) -> Option<Value> {
        let uri = params
            .get("textDocument")
            .and_then(|td| td.get("uri"))
            .and_then(Value::as_str)?;
        let doc = self.documents.get(uri)?;

        let mut formatted: String = doc
            .text
            .lines()
            .map(|l| l.trim_end())
            .collect::<Vec<_>>()
            .join("\n");
        formatted.push('\n');

        let line_count = doc.text.lines().count();
        Some(serde_json::json!([{
            "range": {
                "start": { "line": 0, "character": 0 },
                "end": { "line": line_count + 1, "character": 0 }
            },
            "newText": formatted
        }]))
    }

    fn publish_diagnostics(&self, uri: &str, version: i64) {
        let delay = self.args.diagnostics_delay;
        let uri_owned = uri.to_string();
        let writer = self.writer.clone();

        if delay > 0 {
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(delay));
                send_diagnostics_notification(&writer, &uri_owned, version);
            });
        } else {
            send_diagnostics_notification(&self.writer, uri, version);
        }
    }

    fn send_response(&mut self, response: &Response) {
        let Ok(json) = serde_json::to_string(response) else {
            return;
        };

        write_framed(&self.writer, &json);

        self.response_count += 1;

        if let Some(max) = self.args.drop_after
            && self.response_count >= max
        {
            std::process::exit(1);
        }
    }
}

fn handle_initialize() -> Value {
    serde_json::json!({
        "capabilities": {
            "hoverProvider": true,
            "definitionProvider": true,
            "referencesProvider": true,
            "documentFormattingProvider": true,
            "completionProvider": {
                "triggerCharacters": ["."],
                "resolveProvider": false
            },
            "textDocumentSync": {
                "openClose": true,
                "change": 1,
                "save": { "includeText": false }
            }
        },
        "serverInfo": { "name": "mockls", "version": "1.0.0" }
    })
}

/// Extract `(uri, line, col)` from a `textDocument/position` params object.
fn extract_position(params: &Value) -> Option<(&str, usize, usize)> {
    let uri = params
        .get("textDocument")
        .and_then(|td| td.get("uri"))
        .and_then(Value::as_str)?;
    let line = usize::try_from(
        params
            .get("position")
            .and_then(|p| p.get("line"))
            .and_then(Value::as_u64)?,
    )
    .ok()?;
    let col = usize::try_from(
        params
            .get("position")
            .and_then(|p| p.get("character"))
            .and_then(Value::as_u64)?,
    )
    .ok()?;
    Some((uri, line, col))
}

/// Build a JSON `Location` object.
fn location_json(uri: &str, line: usize, start: usize, end: usize) -> Value {
    serde_json::json!({
        "uri": uri,
        "range": {
            "start": { "line": line, "character": start },
            "end": { "line": line, "character": end }
        }
    })
}

/// Write a Content-Length framed JSON string.
fn write_framed(writer: &Writer, json: &str) {
    let header = format!("Content-Length: {}\r\n\r\n", json.len());
    let Ok(mut w) = writer.lock() else { return };
    let _ = w.write_all(header.as_bytes());
    let _ = w.write_all(json.as_bytes());
    let _ = w.flush();
}

/// Send a `publishDiagnostics` notification tagged with the version the
/// analyzer saw.
fn send_diagnostics_notification(writer: &Writer, uri: &str, version: i64) {
    let value = serde_json::json!({
        "jsonrpc": "2.0",
        "method": "textDocument/publishDiagnostics",
        "params": {
            "uri": uri,
            "diagnostics": [{
                "range": {
                    "start": { "line": 0, "character": 0 },
                    "end": { "line": 0, "character": 1 }
                },
                "severity": 2,
                "source": "mockls",
                "message": format!("mockls: mock diagnostic (v{version})")
            }]
        }
    });
    let Ok(json) = serde_json::to_string(&value) else {
        return;
    };
    write_framed(writer, &json);
}

/// Parse a Content-Length framed message from a buffer.
/// Returns the message string and the number of bytes consumed.
fn try_parse_message(buffer: &[u8]) -> Option<(String, usize)> {
    let header_end = buffer.windows(4).position(|w| w == b"\r\n\r\n")?;
    let headers = std::str::from_utf8(&buffer[..header_end]).ok()?;

    let mut content_length: Option<usize> = None;
    for line in headers.lines() {
        if line.to_ascii_lowercase().starts_with("content-length:") {
            content_length = line
                .split_once(':')
                .and_then(|(_, v)| v.trim().parse().ok());
        }
    }

    let content_length = content_length?;
    let total = header_end + 4 + content_length;

    if buffer.len() < total {
        return None;
    }

    let body = std::str::from_utf8(&buffer[header_end + 4..total]).ok()?;
    Some((body.to_string(), total))
}

/// Extract the word at a given line and column from content.
fn extract_word(content: &str, line: usize, col: usize) -> Option<String> {
    let line_text = content.lines().nth(line)?;

    if col >= line_text.len() {
        return None;
    }

    let bytes = line_text.as_bytes();

    let start = (0..=col)
        .rev()
        .find(|&i| !is_word_char(bytes[i]))
        .map_or(0, |i| i + 1);

    let end = (col..bytes.len())
        .find(|&i| !is_word_char(bytes[i]))
        .unwrap_or(bytes.len());

    if start >= end {
        return None;
    }

    Some(line_text[start..end].to_string())
}

const fn is_word_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn main() {
    let args = Args::parse();

    if let Some(ms) = args.die_after {
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(ms));
            std::process::exit(1);
        });
    }

    let writer = stdout_writer();
    let mut analyzer = MockAnalyzer::new(args, writer);
    let mut stdin = std::io::stdin().lock();
    analyzer.run(&mut stdin);
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    reason = "Tests use expect/unwrap for clear failure messages"
)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn default_args() -> Args {
        Args {
            stdio: false,
            response_delay: 0,
            diagnostics_delay: 0,
            no_diagnostics: false,
            drop_after: None,
            die_after: None,
            hang_on: vec![],
            fail_on: vec![],
        }
    }

    fn frame(body: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body).into_bytes()
    }

    fn extract_messages(data: &[u8]) -> Vec<Value> {
        let mut messages = Vec::new();
        let mut buf = data.to_vec();
        while let Some((msg, consumed)) = try_parse_message(&buf) {
            if let Ok(v) = serde_json::from_str::<Value>(&msg) {
                messages.push(v);
            }
            buf.drain(..consumed);
        }
        messages
    }

    fn run_with(args: Args, input: &[u8]) -> Vec<Value> {
        let (writer, buf) = buffer_writer();
        let mut analyzer = MockAnalyzer::new(args, writer);
        let mut reader = Cursor::new(input.to_vec());
        analyzer.run(&mut reader);
        let data = buf
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        extract_messages(&data)
    }

    fn initialize_request(id: u64) -> String {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "initialize",
            "params": { "processId": null, "capabilities": {} }
        })
        .to_string()
    }

    fn did_open(uri: &str, text: &str, version: u64) -> String {
        serde_json::json!({
            "jsonrpc": "2.0",
            "method": "textDocument/didOpen",
            "params": {
                "textDocument": {
                    "uri": uri,
                    "languageId": "go",
                    "version": version,
                    "text": text
                }
            }
        })
        .to_string()
    }

    #[test]
    fn initialize_advertises_proxied_capabilities() {
        let input = frame(&initialize_request(1));
        let messages = run_with(default_args(), &input);

        let caps = &messages[0]["result"]["capabilities"];
        assert_eq!(caps["hoverProvider"], true);
        assert_eq!(caps["definitionProvider"], true);
        assert_eq!(caps["referencesProvider"], true);
        assert_eq!(caps["documentFormattingProvider"], true);
        assert!(caps["completionProvider"].is_object());
    }

    #[test]
    fn diagnostics_tagged_with_version() {
        let uri = "file:///tmp/x.go";
        let mut input = frame(&initialize_request(1));
        input.extend(frame(&did_open(uri, "package main\n", 7)));

        let messages = run_with(default_args(), &input);

        let diag = messages
            .iter()
            .find(|m| {
                m.get("method").and_then(Value::as_str) == Some("textDocument/publishDiagnostics")
            })
            .expect("publishDiagnostics");
        assert_eq!(diag["params"]["uri"], uri);
        let msg = diag["params"]["diagnostics"][0]["message"]
            .as_str()
            .unwrap();
        assert!(msg.contains("(v7)"), "got {msg}");
    }

    #[test]
    fn completion_lists_document_words() {
        let uri = "file:///tmp/y.go";
        let completion = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "textDocument/completion",
            "params": {
                "textDocument": { "uri": uri },
                "position": { "line": 0, "character": 0 }
            }
        })
        .to_string();

        let mut input = frame(&initialize_request(1));
        input.extend(frame(&did_open(uri, "package main\nfunc Greet() {}\n", 1)));
        input.extend(frame(&completion));

        let messages = run_with(default_args(), &input);
        let reply = messages
            .iter()
            .find(|m| m.get("id").and_then(Value::as_u64) == Some(2))
            .expect("completion reply");

        let labels: Vec<&str> = reply["result"]["items"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|i| i["label"].as_str())
            .collect();
        assert!(labels.contains(&"Greet"), "labels: {labels:?}");
        assert!(labels.contains(&"package"));
    }

    #[test]
    fn formatting_adds_trailing_newline() {
        let uri = "file:///tmp/z.go";
        let formatting = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "textDocument/formatting",
            "params": {
                "textDocument": { "uri": uri },
                "options": { "tabSize": 4, "insertSpaces": true }
            }
        })
        .to_string();

        let mut input = frame(&initialize_request(1));
        input.extend(frame(&did_open(uri, "package main   \nfunc main() {}", 1)));
        input.extend(frame(&formatting));

        let messages = run_with(default_args(), &input);
        let reply = messages
            .iter()
            .find(|m| m.get("id").and_then(Value::as_u64) == Some(3))
            .expect("formatting reply");

        let new_text = reply["result"][0]["newText"].as_str().unwrap();
        assert_eq!(new_text, "package main\nfunc main() {}\n");
    }

    #[test]
    fn unknown_method_returns_not_found() {
        let bogus = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 9,
            "method": "workspace/executeCommand",
            "params": {}
        })
        .to_string();

        let mut input = frame(&initialize_request(1));
        input.extend(frame(&bogus));

        let messages = run_with(default_args(), &input);
        let reply = messages
            .iter()
            .find(|m| m.get("id").and_then(Value::as_u64) == Some(9))
            .expect("error reply");
        assert_eq!(reply["error"]["code"], -32601);
    }

    #[test]
    fn fail_on_returns_internal_error() {
        let mut args = default_args();
        args.fail_on = vec!["textDocument/hover".to_string()];

        let hover = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 4,
            "method": "textDocument/hover",
            "params": {
                "textDocument": { "uri": "file:///nope" },
                "position": { "line": 0, "character": 0 }
            }
        })
        .to_string();

        let mut input = frame(&initialize_request(1));
        input.extend(frame(&hover));

        let messages = run_with(args, &input);
        let reply = messages
            .iter()
            .find(|m| m.get("id").and_then(Value::as_u64) == Some(4))
            .expect("error reply");
        assert_eq!(reply["error"]["code"], -32603);
    }

    #[test]
    fn did_close_forgets_document() {
        let uri = "file:///tmp/closed.go";
        let close = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "textDocument/didClose",
            "params": { "textDocument": { "uri": uri } }
        })
        .to_string();
        let hover = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 5,
            "method": "textDocument/hover",
            "params": {
                "textDocument": { "uri": uri },
                "position": { "line": 0, "character": 1 }
            }
        })
        .to_string();

        let mut input = frame(&initialize_request(1));
        input.extend(frame(&did_open(uri, "package main\n", 1)));
        input.extend(frame(&close));
        input.extend(frame(&hover));

        let messages = run_with(default_args(), &input);
        let reply = messages
            .iter()
            .find(|m| m.get("id").and_then(Value::as_u64) == Some(5))
            .expect("hover reply");
        assert!(reply["result"].is_null());
    }
}
