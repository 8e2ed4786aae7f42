// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Gantry is a language-server proxy for a browser-hosted code editor.
//!
//! Browser clients speak LSP over WebSocket; Gantry owns a workspace on
//! disk, serializes per-document traffic, and multiplexes all clients onto
//! a small pool of per-language analyzer subprocesses (gopls,
//! typescript-language-server, ...) speaking LSP over stdio.

/// Configuration loading (defaults, file, environment).
pub mod config;
/// Error taxonomy and JSON-RPC error classification.
pub mod error;
/// Per-URI FIFO locks for per-document ordering.
pub mod lock;
/// Analyzer subprocess supervision and management.
pub mod lsp;
/// Per-client proxy session state and LSP dispatch.
pub mod proxy;
/// HTTP file API over the workspace store.
pub mod rest;
/// WebSocket transport server.
pub mod server;
/// Workspace file store: URI mapping, path safety, version tracking.
pub mod workspace;
