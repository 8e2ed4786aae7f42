// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Error taxonomy shared by the RPC and HTTP boundaries.
//!
//! Handlers propagate `anyhow::Error` internally; at the dispatch boundary
//! a single classifier maps them to JSON-RPC error codes. The workspace
//! store uses a typed error so the HTTP layer can distinguish security
//! refusals from missing files without string matching.

use thiserror::Error;

/// JSON-RPC parse error.
pub const PARSE_ERROR: i64 = -32700;
/// JSON-RPC invalid request (missing `method`, bad envelope, frame too big).
pub const INVALID_REQUEST: i64 = -32600;
/// JSON-RPC method not found.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC internal error (document/security/analyzer failures).
pub const INTERNAL_ERROR: i64 = -32603;

/// Marker prefix for unknown-method errors raised inside dispatch.
pub(crate) const METHOD_NOT_FOUND_MARKER: &str = "METHOD_NOT_FOUND:";

/// Errors raised by the workspace store.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// The resolved path escapes the workspace root. Refused before I/O.
    #[error("path escapes workspace root: {0}")]
    Security(String),

    /// The operation referenced a URI or path that is not present.
    #[error("document not found: {0}")]
    NotFound(String),

    /// Underlying filesystem failure.
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error raised when a language has no usable analyzer (not configured,
/// binary missing, or start failed beyond the restart budget).
#[derive(Debug, Error)]
#[error("no analyzer available for '{language}': {reason}")]
pub struct AnalyzerUnavailable {
    /// The language that could not be served.
    pub language: String,
    /// Human-readable reason.
    pub reason: String,
}

/// Maps a handler error to a JSON-RPC `(code, message)` pair.
///
/// Internal details never reach the client verbatim; everything collapses
/// into one of the spec'd codes with a stable message shape.
pub fn classify_error(e: &anyhow::Error) -> (i64, String) {
    if let Some(ws) = e.downcast_ref::<WorkspaceError>() {
        return match ws {
            WorkspaceError::Security(p) => {
                (INTERNAL_ERROR, format!("security error: path refused: {p}"))
            }
            WorkspaceError::NotFound(u) => (INTERNAL_ERROR, format!("document not found: {u}")),
            WorkspaceError::Io(_) => (INTERNAL_ERROR, "filesystem error".to_string()),
        };
    }

    if let Some(ua) = e.downcast_ref::<AnalyzerUnavailable>() {
        return (INTERNAL_ERROR, ua.to_string());
    }

    let msg = e.to_string();
    if let Some(method) = msg.strip_prefix(METHOD_NOT_FOUND_MARKER) {
        return (METHOD_NOT_FOUND, format!("method not found: {method}"));
    }

    tracing::error!("internal error: {e:#}");
    (INTERNAL_ERROR, "internal error".to_string())
}
