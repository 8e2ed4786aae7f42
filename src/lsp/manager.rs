// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Lifecycle management for analyzer processes.
//!
//! At most one analyzer exists per languageId. Starts are lazy and
//! coalesced per language: the first caller spawns and initializes, later
//! callers wait on the same slot and receive the same analyzer. Crashed
//! analyzers are replaced subject to a sliding-window restart budget, and
//! an idle reaper stops analyzers that have seen no outbound traffic for
//! the configured timeout.

use anyhow::Result;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::analyzer::{AnalyzerProcess, NotificationSink};
use super::protocol::NotificationMessage;
use super::state::AnalyzerStatus;
use crate::config::{AnalyzerConfig, Config};
use crate::error::AnalyzerUnavailable;

/// Delay before respawning a crashed analyzer.
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Per-language slot: the live analyzer (if any) plus its restart history.
struct Slot {
    analyzer: Option<Arc<AnalyzerProcess>>,
    attempts: VecDeque<Instant>,
}

/// Dictionary of at-most-one analyzer per languageId.
pub struct AnalyzerManager {
    table: HashMap<String, AnalyzerConfig>,
    workspace_root: PathBuf,
    init_timeout: Duration,
    idle_timeout: Duration,
    restart_max: u32,
    restart_window: Duration,
    slots: StdMutex<HashMap<String, Arc<Mutex<Slot>>>>,
}

impl AnalyzerManager {
    /// Creates a manager for the configured analyzer table.
    #[must_use]
    pub fn new(config: &Config, workspace_root: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            table: config.analyzers(),
            workspace_root,
            init_timeout: config.init_timeout(),
            idle_timeout: config.idle_timeout(),
            restart_max: config.restart_max,
            restart_window: config.restart_window(),
            slots: StdMutex::new(HashMap::new()),
        })
    }

    /// Returns the analyzer for `language`, spawning it if necessary, and
    /// rebinds its notification sink to the calling session.
    ///
    /// Concurrent callers for the same language wait on one in-flight
    /// start; distinct languages start independently.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyzerUnavailable`] if the language has no configured
    /// command or starting fails beyond the restart budget. Neither case
    /// crashes the process.
    pub async fn get_or_create(
        &self,
        language: &str,
        sink: NotificationSink,
    ) -> Result<Arc<AnalyzerProcess>> {
        let Some(cfg) = self.table.get(language) else {
            return Err(AnalyzerUnavailable {
                language: language.to_string(),
                reason: "no analyzer configured".to_string(),
            }
            .into());
        };

        let slot = self.slot(language);
        let mut guard = slot.lock().await;

        let crashed_before = if let Some(analyzer) = &guard.analyzer {
            if analyzer.is_alive() && !analyzer.state().is_terminal() {
                analyzer.touch();
                analyzer.bind_sink(sink);
                return Ok(analyzer.clone());
            }
            warn!("analyzer for {language} is {}, replacing", analyzer.state());
            guard.analyzer = None;
            true
        } else {
            false
        };

        // A fresh language (no crash, no failed attempts) starts without
        // touching the budget; anything with history goes through it.
        if crashed_before || !guard.attempts.is_empty() {
            if !budget_allows(
                &mut guard.attempts,
                Instant::now(),
                self.restart_max,
                self.restart_window,
            ) {
                let reason = format!(
                    "restart budget exhausted ({} starts within {:?})",
                    self.restart_max, self.restart_window
                );
                let _ = sink.send(show_message_error(format!(
                    "Analyzer for {language} keeps crashing; giving up: {reason}"
                )));
                return Err(AnalyzerUnavailable {
                    language: language.to_string(),
                    reason,
                }
                .into());
            }
            if crashed_before {
                tokio::time::sleep(RESTART_DELAY).await;
            }
        }

        info!(
            "Spawning analyzer for {language}: {} {}",
            cfg.command,
            cfg.args.join(" ")
        );

        let analyzer = match AnalyzerProcess::spawn(&cfg.command, &cfg.args, language, sink.clone())
        {
            Ok(analyzer) => Arc::new(analyzer),
            Err(e) => {
                guard.attempts.push_back(Instant::now());
                let _ = sink.send(show_message_error(format!(
                    "Failed to start analyzer for {language}: {e}"
                )));
                return Err(AnalyzerUnavailable {
                    language: language.to_string(),
                    reason: format!("spawn failed: {e}"),
                }
                .into());
            }
        };

        if let Err(e) = analyzer
            .initialize(&self.workspace_root, self.init_timeout)
            .await
        {
            guard.attempts.push_back(Instant::now());
            let _ = sink.send(show_message_error(format!(
                "Analyzer for {language} failed to initialize: {e}"
            )));
            return Err(AnalyzerUnavailable {
                language: language.to_string(),
                reason: format!("initialize failed: {e}"),
            }
            .into());
        }

        guard.analyzer = Some(analyzer.clone());
        Ok(analyzer)
    }

    /// Fetches or creates the per-language slot.
    fn slot(&self, language: &str) -> Arc<Mutex<Slot>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .entry(language.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Slot {
                    analyzer: None,
                    attempts: VecDeque::new(),
                }))
            })
            .clone()
    }

    /// All current slots (snapshot).
    fn all_slots(&self) -> Vec<(String, Arc<Mutex<Slot>>)> {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(lang, slot)| (lang.clone(), slot.clone()))
            .collect()
    }

    /// The live analyzer for `language`, if one is currently running.
    /// Never spawns; used by session teardown so closing documents does
    /// not resurrect a stopped analyzer.
    pub async fn get_live(&self, language: &str) -> Option<Arc<AnalyzerProcess>> {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(language)
            .cloned()?;
        let guard = slot.lock().await;
        guard.analyzer.clone().filter(|a| a.is_alive())
    }

    /// Stops the analyzer for one language. Idempotent.
    pub async fn stop(&self, language: &str) {
        let slot = self.slot(language);
        let analyzer = slot.lock().await.analyzer.take();
        if let Some(analyzer) = analyzer {
            info!("Stopping analyzer for {language}");
            analyzer.stop().await;
        }
    }

    /// Stops every analyzer. Idempotent.
    pub async fn stop_all(&self) {
        for (language, slot) in self.all_slots() {
            let analyzer = slot.lock().await.analyzer.take();
            if let Some(analyzer) = analyzer {
                info!("Stopping analyzer for {language}");
                analyzer.stop().await;
            }
        }
    }

    /// Status snapshots of all live analyzers.
    pub async fn statuses(&self) -> Vec<AnalyzerStatus> {
        let mut out = Vec::new();
        for (_, slot) in self.all_slots() {
            if let Some(analyzer) = &slot.lock().await.analyzer {
                out.push(analyzer.status().await);
            }
        }
        out
    }

    /// True if a command is configured for `language`.
    #[must_use]
    pub fn supports(&self, language: &str) -> bool {
        self.table.contains_key(language)
    }

    /// The configured analyzer table.
    #[must_use]
    pub const fn table(&self) -> &HashMap<String, AnalyzerConfig> {
        &self.table
    }

    /// Spawns the background task that stops idle analyzers.
    ///
    /// Idle is per-language: traffic for one language never keeps another
    /// language's analyzer alive.
    pub fn spawn_idle_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let check_interval = manager.idle_timeout.min(Duration::from_secs(60));

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(check_interval).await;

                for (language, slot) in manager.all_slots() {
                    let analyzer = {
                        let mut guard = slot.lock().await;
                        match &guard.analyzer {
                            Some(a) if a.is_alive() && a.idle_for() >= manager.idle_timeout => {
                                guard.analyzer.take()
                            }
                            _ => None,
                        }
                    };

                    if let Some(analyzer) = analyzer {
                        info!(
                            "Stopping idle analyzer for {language} (idle {:?})",
                            analyzer.idle_for()
                        );
                        analyzer.stop().await;
                    } else {
                        debug!("analyzer for {language} still busy or gone");
                    }
                }
            }
        })
    }
}

/// Prunes attempts outside the window and admits the next one if the
/// budget allows. Records the attempt when admitted.
fn budget_allows(
    attempts: &mut VecDeque<Instant>,
    now: Instant,
    max: u32,
    window: Duration,
) -> bool {
    while let Some(front) = attempts.front() {
        if now.duration_since(*front) > window {
            attempts.pop_front();
        } else {
            break;
        }
    }

    if attempts.len() >= max as usize {
        return false;
    }
    attempts.push_back(now);
    true
}

/// Builds a `window/showMessage` error notification.
fn show_message_error(message: String) -> NotificationMessage {
    NotificationMessage::new(
        "window/showMessage",
        serde_json::json!({ "type": 1, "message": message }),
    )
}
