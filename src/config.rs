// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// HTTP + WebSocket listen port (default: 3001)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Absolute workspace root directory (default: /tmp/online-editor)
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    /// Path to the `go` analyzer binary (default: gopls)
    #[serde(default = "default_gopls_path")]
    pub gopls_path: String,

    /// Path to the typescript/javascript analyzer binary
    /// (default: typescript-language-server, spawned with --stdio)
    #[serde(default = "default_ts_server_path")]
    pub ts_server_path: String,

    /// Log level: error|warning|info|debug (default: info)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Allowed origin for HTTP requests (default: http://localhost:3000)
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,

    /// Analyzer idle shutdown in seconds (default: 300)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// Analyzer initialize deadline in seconds (default: 10)
    #[serde(default = "default_init_timeout")]
    pub init_timeout: u64,

    /// Analyzer restarts allowed per window (default: 3)
    #[serde(default = "default_restart_max")]
    pub restart_max: u32,

    /// Restart budget window in seconds (default: 60)
    #[serde(default = "default_restart_window")]
    pub restart_window: u64,

    /// WebSocket frame size ceiling in bytes (default: 16 MiB)
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Hard-kill deadline on graceful shutdown in seconds (default: 10)
    #[serde(default = "default_shutdown_deadline")]
    pub shutdown_deadline: u64,

    /// Extra analyzer definitions keyed by language ID. Entries here
    /// override the built-in go/typescript/javascript commands.
    #[serde(default)]
    pub analyzer: HashMap<String, AnalyzerConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalyzerConfig {
    /// The command to execute (e.g., "gopls")
    pub command: String,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_port() -> u16 {
    3001
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("/tmp/online-editor")
}

fn default_gopls_path() -> String {
    "gopls".to_string()
}

fn default_ts_server_path() -> String {
    "typescript-language-server".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cors_origin() -> String {
    "http://localhost:3000".to_string()
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_init_timeout() -> u64 {
    10
}

fn default_restart_max() -> u32 {
    3
}

fn default_restart_window() -> u64 {
    60
}

fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_shutdown_deadline() -> u64 {
    10
}

impl Config {
    /// Load configuration from defaults, an optional file, and the environment.
    ///
    /// Environment keys are the upper-case field names (`PORT`,
    /// `WORKSPACE_ROOT`, `GOPLS_PATH`, `TS_SERVER_PATH`, `LOG_LEVEL`,
    /// `CORS_ORIGIN`, ...). The environment wins over the file.
    pub fn load(explicit_file: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = explicit_file {
            builder = builder.add_source(config::File::from(path));
        }

        // try_parsing lets numeric keys (PORT, IDLE_TIMEOUT, ...) arrive as
        // environment strings.
        builder = builder.add_source(config::Environment::default().try_parsing(true));

        let config = builder.build().context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Returns the full analyzer table: built-in entries for `go`,
    /// `typescript` and `javascript` overlaid with any `[analyzer.<lang>]`
    /// definitions from the config file.
    pub fn analyzers(&self) -> HashMap<String, AnalyzerConfig> {
        let mut table = HashMap::new();

        table.insert(
            "go".to_string(),
            AnalyzerConfig {
                command: self.gopls_path.clone(),
                args: vec![],
            },
        );

        let ts = AnalyzerConfig {
            command: self.ts_server_path.clone(),
            args: vec!["--stdio".to_string()],
        };
        table.insert("typescript".to_string(), ts.clone());
        table.insert("javascript".to_string(), ts);

        for (lang, cfg) in &self.analyzer {
            table.insert(lang.clone(), cfg.clone());
        }

        table
    }

    /// The analyzer idle timeout as a `Duration`.
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    /// The initialize deadline as a `Duration`.
    pub const fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout)
    }

    /// The restart budget window as a `Duration`.
    pub const fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window)
    }

    /// Translates the `LOG_LEVEL` key into a tracing directive.
    pub fn tracing_directive(&self) -> &'static str {
        match self.log_level.as_str() {
            "error" => "error",
            "warning" => "warn",
            "debug" => "debug",
            _ => "info",
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            workspace_root: default_workspace_root(),
            gopls_path: default_gopls_path(),
            ts_server_path: default_ts_server_path(),
            log_level: default_log_level(),
            cors_origin: default_cors_origin(),
            idle_timeout: default_idle_timeout(),
            init_timeout: default_init_timeout(),
            restart_max: default_restart_max(),
            restart_window: default_restart_window(),
            max_frame_bytes: default_max_frame_bytes(),
            shutdown_deadline: default_shutdown_deadline(),
            analyzer: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.port, 3001);
        assert_eq!(config.workspace_root, PathBuf::from("/tmp/online-editor"));
        assert_eq!(config.gopls_path, "gopls");
        assert_eq!(config.ts_server_path, "typescript-language-server");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.cors_origin, "http://localhost:3000");
        assert_eq!(config.idle_timeout, 300);
        assert_eq!(config.max_frame_bytes, 16 * 1024 * 1024);
    }

    #[test]
    fn builtin_analyzers_present() {
        let config = Config::default();
        let table = config.analyzers();

        let go = table.get("go").expect("go analyzer");
        assert_eq!(go.command, "gopls");
        assert!(go.args.is_empty());

        let ts = table.get("typescript").expect("typescript analyzer");
        assert_eq!(ts.command, "typescript-language-server");
        assert_eq!(ts.args, vec!["--stdio".to_string()]);

        let js = table.get("javascript").expect("javascript analyzer");
        assert_eq!(js.command, ts.command);
    }

    #[test]
    fn file_entries_override_builtins() {
        let mut config = Config::default();
        config.analyzer.insert(
            "go".to_string(),
            AnalyzerConfig {
                command: "/opt/gopls".to_string(),
                args: vec!["-rpc.trace".to_string()],
            },
        );
        config.analyzer.insert(
            "python".to_string(),
            AnalyzerConfig {
                command: "pylsp".to_string(),
                args: vec![],
            },
        );

        let table = config.analyzers();
        assert_eq!(table["go"].command, "/opt/gopls");
        assert_eq!(table["python"].command, "pylsp");
    }

    #[test]
    fn log_level_maps_to_directive() {
        let mut config = Config::default();
        assert_eq!(config.tracing_directive(), "info");
        config.log_level = "warning".to_string();
        assert_eq!(config.tracing_directive(), "warn");
        config.log_level = "nonsense".to_string();
        assert_eq!(config.tracing_directive(), "info");
    }
}
