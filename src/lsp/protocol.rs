// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! JSON-RPC 2.0 message envelopes and the Content-Length stream codec.
//!
//! Analyzer stdio frames every message as `Content-Length: <N>\r\n\r\n`
//! followed by exactly N UTF-8 JSON bytes; WebSocket frames carry one JSON
//! message each. Payloads (`params`, `result`, `error.data`) stay opaque
//! `serde_json::Value`s and are only inspected at handler boundaries.

use anyhow::{Context, Result};
use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};

/// A request or response id. LSP allows both integers and strings; the
/// proxy allocates integers for analyzer-directed requests but must echo
/// whatever shape a client chose.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    /// A numeric id.
    Number(i64),
    /// A string id.
    String(String),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

/// The error member of a failed response.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ResponseError {
    /// JSON-RPC error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details, passed through untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// A request: carries both an id and a method.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RequestMessage {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Correlates the eventual response.
    pub id: RequestId,
    /// LSP method name.
    pub method: String,
    /// Opaque parameters; absent params deserialize to `null`.
    #[serde(default)]
    pub params: serde_json::Value,
}

/// A response: carries an id and either `result` or `error`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ResponseMessage {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Id of the request being answered; `null` for unanswerable input.
    pub id: Option<RequestId>,
    /// Success payload, passed through untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Failure payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

/// A notification: carries a method but no id, and expects no reply.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NotificationMessage {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// LSP method name.
    pub method: String,
    /// Opaque parameters; absent params deserialize to `null`.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl RequestMessage {
    /// Builds a request envelope.
    pub fn new(id: RequestId, method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

impl ResponseMessage {
    /// Builds a success response carrying `result` under `id`.
    pub fn success(id: RequestId, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Builds an error response under `id` (or none for unanswerable input).
    pub fn failure(id: Option<RequestId>, code: i64, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(ResponseError {
                code,
                message,
                data: None,
            }),
        }
    }
}

impl NotificationMessage {
    /// Builds a notification envelope.
    pub fn new(method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// A decoded incoming message, classified by shape.
///
/// A *request* has both `id` and `method`; a *response* has `id` and either
/// `result` or `error`; a *notification* has `method` but no `id`.
#[derive(Debug)]
pub enum Incoming {
    /// Request: carries `id` and `method`.
    Request(RequestMessage),
    /// Response: carries `id` without `method`.
    Response(ResponseMessage),
    /// Notification: carries `method` without `id`.
    Notification(NotificationMessage),
}

impl Incoming {
    /// Classifies a parsed JSON value into a message kind.
    ///
    /// # Errors
    ///
    /// Returns an error for objects with neither `method` nor `id` and for
    /// envelopes that fail deserialization.
    pub fn classify(value: serde_json::Value) -> Result<Self> {
        let has_method = value.get("method").is_some();
        let has_id = value.get("id").is_some_and(|id| !id.is_null());

        match (has_method, has_id) {
            (true, true) => Ok(Self::Request(
                serde_json::from_value(value).context("malformed request envelope")?,
            )),
            (true, false) => Ok(Self::Notification(
                serde_json::from_value(value).context("malformed notification envelope")?,
            )),
            (false, true) => Ok(Self::Response(
                serde_json::from_value(value).context("malformed response envelope")?,
            )),
            (false, false) => anyhow::bail!("message has neither method nor id"),
        }
    }
}

/// Parses one Content-Length framed message out of `buffer`, if complete.
///
/// Consumed bytes are removed from the buffer; an incomplete header or
/// body leaves it untouched for the next read.
///
/// # Errors
///
/// Returns an error if headers are not UTF-8, `Content-Length` is invalid
/// or missing, or the body is not UTF-8. Framing errors are not recoverable
/// in place; callers must fail the stream.
pub fn try_parse_message(buffer: &mut BytesMut) -> Result<Option<String>> {
    let Some(header_end) = buffer.windows(4).position(|w| w == b"\r\n\r\n") else {
        return Ok(None);
    };

    let headers =
        std::str::from_utf8(&buffer[..header_end]).context("frame headers are not UTF-8")?;

    let mut content_length = None;
    for line in headers.lines() {
        if let Some(value) = header_value(line, "content-length") {
            content_length = Some(
                value
                    .trim()
                    .parse::<usize>()
                    .context("invalid Content-Length value")?,
            );
        }
    }
    let content_length = content_length.context("frame header missing Content-Length")?;

    let body_start = header_end + 4;
    if buffer.len() < body_start + content_length {
        return Ok(None);
    }

    buffer.advance(body_start);
    let body = buffer.split_to(content_length);
    let message = String::from_utf8(body.to_vec()).context("frame body is not UTF-8")?;
    Ok(Some(message))
}

/// Returns the value of `line` when its header name matches, ASCII
/// case-insensitively.
fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (key, value) = line.split_once(':')?;
    key.trim().eq_ignore_ascii_case(name).then_some(value)
}

/// Serializes a message with its Content-Length header for a stdio stream.
///
/// # Errors
///
/// Returns an error if the message cannot be serialized.
pub fn encode_framed<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_string(message)?;
    let mut out = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    out.extend_from_slice(body.as_bytes());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(buffer: &mut BytesMut) -> Option<Incoming> {
        let text = try_parse_message(buffer).expect("framing ok")?;
        let value: serde_json::Value = serde_json::from_str(&text).expect("valid JSON");
        Some(Incoming::classify(value).expect("classifiable"))
    }

    #[test]
    fn request_round_trips_through_codec() {
        let hover = RequestMessage::new(
            RequestId::Number(7),
            "textDocument/hover",
            json!({
                "textDocument": { "uri": "file:///main.go" },
                "position": { "line": 3, "character": 12 }
            }),
        );
        let mut buffer = BytesMut::from(&encode_framed(&hover).expect("encode")[..]);

        let Some(Incoming::Request(decoded)) = decode(&mut buffer) else {
            panic!("expected a request");
        };
        assert_eq!(decoded.id, RequestId::Number(7));
        assert_eq!(decoded.method, "textDocument/hover");
        assert_eq!(
            decoded.params["textDocument"]["uri"].as_str(),
            Some("file:///main.go")
        );
        assert!(buffer.is_empty(), "frame fully consumed");
    }

    #[test]
    fn body_split_across_reads_completes_later() {
        let open = NotificationMessage::new(
            "textDocument/didOpen",
            json!({ "textDocument": { "uri": "file:///a.ts", "text": "let x = 1;" } }),
        );
        let bytes = encode_framed(&open).expect("encode");
        let split = bytes.len() / 2;

        let mut buffer = BytesMut::from(&bytes[..split]);
        assert!(
            try_parse_message(&mut buffer).expect("framing ok").is_none(),
            "half a frame is not a message"
        );

        buffer.extend_from_slice(&bytes[split..]);
        let Some(Incoming::Notification(decoded)) = decode(&mut buffer) else {
            panic!("expected a notification");
        };
        assert_eq!(decoded.method, "textDocument/didOpen");
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let change = NotificationMessage::new(
            "textDocument/didChange",
            json!({ "textDocument": { "uri": "file:///a.ts", "version": 2 } }),
        );
        let completion = RequestMessage::new(RequestId::Number(1), "textDocument/completion", json!({}));

        let mut bytes = encode_framed(&change).expect("encode");
        bytes.extend(encode_framed(&completion).expect("encode"));
        let mut buffer = BytesMut::from(&bytes[..]);

        assert!(matches!(
            decode(&mut buffer),
            Some(Incoming::Notification(n)) if n.method == "textDocument/didChange"
        ));
        assert!(matches!(
            decode(&mut buffer),
            Some(Incoming::Request(r)) if r.method == "textDocument/completion"
        ));
        assert!(buffer.is_empty());
    }

    #[test]
    fn header_casing_and_extra_headers_are_tolerated() {
        let body = r#"{"jsonrpc":"2.0","method":"initialized","params":{}}"#;
        let raw = format!(
            "CONTENT-LENGTH: {}\r\nContent-Type: application/vscode-jsonrpc; charset=utf-8\r\n\r\n{body}",
            body.len()
        );
        let mut buffer = BytesMut::from(raw.as_str());

        let message = try_parse_message(&mut buffer)
            .expect("framing ok")
            .expect("complete frame");
        assert_eq!(message, body);
    }

    #[test]
    fn missing_length_header_fails_the_stream() {
        let mut buffer = BytesMut::from("Content-Type: text/plain\r\n\r\n{}");
        assert!(try_parse_message(&mut buffer).is_err());
    }

    #[test]
    fn unparseable_length_fails_the_stream() {
        let mut buffer = BytesMut::from("Content-Length: lots\r\n\r\n{}");
        assert!(try_parse_message(&mut buffer).is_err());
    }

    #[test]
    fn non_utf8_body_fails_the_stream() {
        let mut buffer = BytesMut::from(&b"Content-Length: 2\r\n\r\n\xff\xfe"[..]);
        assert!(try_parse_message(&mut buffer).is_err());
    }

    #[test]
    fn incomplete_header_waits_for_more_input() {
        let mut buffer = BytesMut::from("Content-Length: 10\r\n");
        assert!(try_parse_message(&mut buffer).expect("framing ok").is_none());
        assert_eq!(&buffer[..], b"Content-Length: 10\r\n");
    }

    #[test]
    fn classify_splits_by_shape() {
        let request = json!({ "jsonrpc": "2.0", "id": 1, "method": "textDocument/definition" });
        assert!(matches!(
            Incoming::classify(request).expect("classify"),
            Incoming::Request(_)
        ));

        let notification = json!({ "jsonrpc": "2.0", "method": "textDocument/didSave" });
        assert!(matches!(
            Incoming::classify(notification).expect("classify"),
            Incoming::Notification(_)
        ));

        let response = json!({ "jsonrpc": "2.0", "id": 4, "result": { "items": [] } });
        assert!(matches!(
            Incoming::classify(response).expect("classify"),
            Incoming::Response(_)
        ));
    }

    #[test]
    fn null_id_counts_as_notification() {
        // Some clients send "id": null on notifications; that is not a
        // request and must not be answered.
        let value = json!({ "jsonrpc": "2.0", "id": null, "method": "initialized" });
        assert!(matches!(
            Incoming::classify(value).expect("classify"),
            Incoming::Notification(_)
        ));
    }

    #[test]
    fn shapeless_message_is_rejected() {
        assert!(Incoming::classify(json!({ "jsonrpc": "2.0" })).is_err());
    }

    #[test]
    fn string_ids_are_echoed_intact() {
        let request = json!({ "jsonrpc": "2.0", "id": "init-1", "method": "initialize" });
        let Incoming::Request(decoded) = Incoming::classify(request).expect("classify") else {
            panic!("expected a request");
        };
        assert_eq!(decoded.id, RequestId::String("init-1".to_string()));

        let reply = ResponseMessage::success(decoded.id, json!({ "capabilities": {} }));
        let wire = serde_json::to_string(&reply).expect("serialize");
        assert!(wire.contains(r#""id":"init-1""#), "wire: {wire}");
    }

    #[test]
    fn absent_params_default_to_null() {
        let value = json!({ "jsonrpc": "2.0", "method": "initialized" });
        let Incoming::Notification(decoded) = Incoming::classify(value).expect("classify") else {
            panic!("expected a notification");
        };
        assert!(decoded.params.is_null());
    }

    #[test]
    fn failure_without_id_serializes_null_id() {
        let reply = ResponseMessage::failure(None, -32600, "frame too large".to_string());
        let wire = serde_json::to_string(&reply).expect("serialize");
        assert!(wire.contains(r#""id":null"#), "wire: {wire}");
        assert!(wire.contains(r#""code":-32600"#));
        assert!(!wire.contains("result"), "error replies carry no result");
    }

    #[test]
    fn success_omits_error_member() {
        let reply = ResponseMessage::success(RequestId::Number(9), json!(null));
        let wire = serde_json::to_string(&reply).expect("serialize");
        assert!(wire.contains(r#""result":null"#));
        assert!(!wire.contains("error"));
    }

    #[test]
    fn payload_text_survives_round_trip() {
        // Params must not be canonicalized on the way through the proxy.
        let open = NotificationMessage::new(
            "textDocument/didOpen",
            json!({ "textDocument": { "uri": "file:///a.go", "text": "package main\n\t// \u{1F980}\n" } }),
        );
        let bytes = encode_framed(&open).expect("encode");
        let mut buffer = BytesMut::from(&bytes[..]);

        let Some(Incoming::Notification(decoded)) = decode(&mut buffer) else {
            panic!("expected a notification");
        };
        assert_eq!(
            decoded.params["textDocument"]["text"].as_str(),
            Some("package main\n\t// \u{1F980}\n")
        );
    }
}
