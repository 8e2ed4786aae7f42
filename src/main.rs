// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Gantry server entry point.
//!
//! Wires configuration, the workspace store, the analyzer manager and the
//! transport together, and owns graceful shutdown: on signal the listener
//! and sessions are dropped, analyzers are stopped cooperatively, and the
//! process hard-exits if the deadline passes.

#![allow(clippy::print_stdout, reason = "CLI output goes to stdout")]

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gantry_lsp::config::Config;
use gantry_lsp::lsp::{AnalyzerManager, AnalyzerProcess};
use gantry_lsp::server::{self, AppState};
use gantry_lsp::workspace::WorkspaceStore;

/// Command-line arguments for Gantry.
#[derive(Parser, Debug)]
#[command(name = "gantry")]
#[command(version)]
#[command(about = "Language-server proxy for a browser-hosted editor")]
struct Args {
    /// The subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to a configuration file (environment variables still win).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Listen port override.
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Workspace root override.
    #[arg(short, long, global = true)]
    workspace: Option<PathBuf>,
}

/// Subcommands supported by Gantry.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the proxy server (default if no subcommand given).
    Serve,

    /// Check configured analyzer binaries and their initialize handshakes.
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.clone())?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(workspace) = args.workspace {
        config.workspace_root = workspace;
    }

    match args.command {
        None | Some(Command::Serve) => run_server(config).await,
        Some(Command::Doctor) => run_doctor(config).await,
    }
}

/// Runs the proxy server until a shutdown signal arrives.
async fn run_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("gantry_lsp={}", config.tracing_directive()).parse()?)
                .add_directive(format!("gantry={}", config.tracing_directive()).parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let workspace = WorkspaceStore::new(&config.workspace_root)?;
    let manager = AnalyzerManager::new(&config, workspace.root().to_path_buf());

    // Idle reclamation is disabled with IDLE_TIMEOUT=0.
    let reaper = (config.idle_timeout > 0).then(|| manager.spawn_idle_reaper());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Gantry listening on {addr}");
    info!("Workspace root: {}", workspace.root().display());
    info!(
        "Configured analyzers: {}",
        sorted_languages(&manager).join(", ")
    );

    let shutdown_deadline = Duration::from_secs(config.shutdown_deadline);
    let state = Arc::new(AppState {
        config,
        workspace,
        manager: manager.clone(),
    });

    // Dropping the serve future closes the listener and every session;
    // sessions send didClose for their open documents as they unwind.
    tokio::select! {
        result = server::run(state, listener) => {
            result?;
        }
        () = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    if let Some(reaper) = reaper {
        reaper.abort();
    }

    info!("Stopping analyzers");
    if tokio::time::timeout(shutdown_deadline, manager.stop_all())
        .await
        .is_err()
    {
        error!("Shutdown deadline of {shutdown_deadline:?} expired");
        std::process::exit(1);
    }

    info!("Shutdown complete");
    Ok(())
}

/// Resolves on SIGTERM (Unix) or Ctrl-C.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("Failed to register SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Checks each configured analyzer: binary present, spawn, initialize.
async fn run_doctor(config: Config) -> Result<()> {
    let workspace = WorkspaceStore::new(&config.workspace_root)?;
    let table = config.analyzers();

    let mut languages: Vec<&String> = table.keys().collect();
    languages.sort();

    let width = languages.iter().map(|l| l.len()).max().unwrap_or(8);

    for language in languages {
        let analyzer_config = &table[language];
        let display = format!("{language:<width$}");

        if !binary_exists(&analyzer_config.command) {
            println!(
                "{display}  {}  ✗ command not found",
                analyzer_config.command
            );
            continue;
        }

        let (sink, _rx) = tokio::sync::mpsc::unbounded_channel();
        let probe = AnalyzerProcess::spawn(
            &analyzer_config.command,
            &analyzer_config.args,
            language,
            sink,
        );

        match probe {
            Ok(analyzer) => {
                match analyzer
                    .initialize(workspace.root(), config.init_timeout())
                    .await
                {
                    Ok(result) => {
                        let name = result
                            .server_info
                            .map(|i| i.name)
                            .unwrap_or_else(|| "unknown".to_string());
                        println!("{display}  {}  ✓ ready ({name})", analyzer_config.command);
                    }
                    Err(e) => {
                        println!(
                            "{display}  {}  ✗ initialize failed: {e}",
                            analyzer_config.command
                        );
                    }
                }
                analyzer.stop().await;
            }
            Err(e) => {
                println!(
                    "{display}  {}  ✗ spawn failed: {e}",
                    analyzer_config.command
                );
            }
        }
    }

    Ok(())
}

/// Checks whether a binary can be found on `$PATH`.
fn binary_exists(command: &str) -> bool {
    if command.contains('/') {
        return std::path::Path::new(command).exists();
    }

    let path_var = std::env::var("PATH").unwrap_or_default();
    std::env::split_paths(&path_var).any(|dir| dir.join(command).is_file())
}

/// Sorted languageIds of the configured analyzer table.
fn sorted_languages(manager: &AnalyzerManager) -> Vec<String> {
    let mut languages: Vec<String> = manager.table().keys().cloned().collect();
    languages.sort();
    languages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_exists_finds_sh() {
        assert!(binary_exists("sh") || binary_exists("/bin/sh"));
        assert!(!binary_exists("definitely-not-a-real-binary-name"));
    }
}
