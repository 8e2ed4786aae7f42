// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Analyzer lifecycle state machine.

use serde::Serialize;

/// State of one analyzer subprocess.
///
/// Normal path: `Spawning -> Initializing -> Running -> Stopping ->
/// Stopped`. `Crashed` is entered from any non-`Stopped` state when the
/// child exits unexpectedly or its stdout closes; the manager decides
/// whether a fresh `Spawning` follows (restart budget permitting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalyzerState {
    /// Child process is being started.
    Spawning,
    /// `initialize` handshake in flight.
    Initializing,
    /// Accepting requests and notifications.
    Running,
    /// Graceful shutdown in progress.
    Stopping,
    /// Terminated cleanly.
    Stopped,
    /// Terminated unexpectedly.
    Crashed,
}

impl AnalyzerState {
    /// Packs the state for atomic storage.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Spawning => 0,
            Self::Initializing => 1,
            Self::Running => 2,
            Self::Stopping => 3,
            Self::Stopped => 4,
            Self::Crashed => 5,
        }
    }

    /// Unpacks an atomically stored state.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Spawning,
            1 => Self::Initializing,
            2 => Self::Running,
            3 => Self::Stopping,
            5 => Self::Crashed,
            _ => Self::Stopped,
        }
    }

    /// True once the analyzer can no longer serve requests.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }
}

impl std::fmt::Display for AnalyzerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Spawning => "spawning",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// Point-in-time snapshot of one analyzer, for logs and the doctor command.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzerStatus {
    /// The language this analyzer serves.
    pub language: String,
    /// Current lifecycle state.
    pub state: AnalyzerState,
    /// Seconds since the child was spawned.
    pub uptime_secs: u64,
    /// Requests awaiting a reply.
    pub pending_requests: usize,
}
