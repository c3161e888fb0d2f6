use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use serde::{Deserialize, Serialize};
use log::{info, error};

use crate::data::loader::{TickLoader, TickRow};
use crate::data::stream::TickLog;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReplayState {
    Stopped,
    Running,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayCommand {
    Start,
    Pause,
    Resume,
    Stop,
    Restart,
}

impl std::str::FromStr for ReplayCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            other => Err(format!("Unknown replay command: {}", other)),
        }
    }
}

/// Replays CSV tick files into the upstream log, one tick per symbol per interval.
pub struct ReplayController {
    state: watch::Sender<ReplayState>,
    log: Arc<dyn TickLog>,
    data_dir: PathBuf,
    interval: Duration,
    handles: Mutex<Vec<JoinHandle<()>>>,
    loaded: Mutex<HashMap<String, usize>>,
}

impl ReplayController {
    pub fn new(log: Arc<dyn TickLog>, data_dir: PathBuf, interval: Duration) -> Self {
        Self {
            state: watch::channel(ReplayState::Stopped).0,
            log,
            data_dir,
            interval,
            handles: Mutex::new(Vec::new()),
            loaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_state(&self) -> ReplayState {
        *self.state.borrow()
    }

    pub fn execute_command(&self, command: ReplayCommand) -> Result<String, String> {
        match (self.get_state(), command) {
            (ReplayState::Stopped, ReplayCommand::Start) => {
                let data = TickLoader::load_multiple_symbols(&self.data_dir)
                    .map_err(|e| format!("Failed to load data: {}", e))?;
                Ok(self.start_with(data))
            }
            (ReplayState::Running, ReplayCommand::Pause) => {
                self.state.send_replace(ReplayState::Paused);
                info!("Replay paused");
                Ok("Replay paused".to_string())
            }
            (ReplayState::Paused, ReplayCommand::Resume) => {
                self.state.send_replace(ReplayState::Running);
                info!("Replay resumed");
                Ok("Replay resumed".to_string())
            }
            (_, ReplayCommand::Stop) => Ok(self.stop()),
            (_, ReplayCommand::Restart) => {
                self.stop();
                self.execute_command(ReplayCommand::Start)
            }
            (current, cmd) => Err(format!("Cannot execute {:?} while in state {:?}", cmd, current)),
        }
    }

    /// Starts replaying already loaded rows.
    pub fn start_with(&self, data: HashMap<String, Vec<TickRow>>) -> String {
        self.clear_handles();
        self.state.send_replace(ReplayState::Running);

        let counts: HashMap<String, usize> = data.iter().map(|(s, rows)| (s.clone(), rows.len())).collect();
        let total: usize = counts.values().sum();
        let symbol_count = counts.len();

        let handles: Vec<JoinHandle<()>> = data
            .into_iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(symbol, rows)| self.spawn_symbol_replay(symbol, rows))
            .collect();

        if let Ok(mut slot) = self.handles.lock() {
            *slot = handles;
        }
        if let Ok(mut loaded) = self.loaded.lock() {
            *loaded = counts;
        }

        info!("Replay started for {} symbols with {} ticks", symbol_count, total);
        format!("Replay started for {} symbols with {} ticks", symbol_count, total)
    }

    fn stop(&self) -> String {
        self.clear_handles();
        self.state.send_replace(ReplayState::Stopped);
        if let Ok(mut loaded) = self.loaded.lock() {
            loaded.clear();
        }
        info!("Replay stopped");
        "Replay stopped".to_string()
    }

    fn spawn_symbol_replay(&self, symbol: String, rows: Vec<TickRow>) -> JoinHandle<()> {
        let log = self.log.clone();
        let mut state = self.state.subscribe();
        let period = self.interval;

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            info!("Replaying {} ({} ticks, cycling)", symbol, rows.len());

            for row in rows.iter().cycle() {
                timer.tick().await;

                // park while paused, leave on stop
                let current = state
                    .wait_for(|s| *s != ReplayState::Paused)
                    .await
                    .map(|s| *s);
                if !matches!(current, Ok(ReplayState::Running)) {
                    break;
                }

                let fields = row.to_fields(&symbol, chrono::Utc::now().timestamp_millis());
                if let Err(e) = log.append(fields).await {
                    error!("Replay append for {} failed: {}", symbol, e);
                }
            }

            info!("Replay for {} ended", symbol);
        })
    }

    fn clear_handles(&self) {
        if let Ok(mut handles) = self.handles.lock() {
            for handle in handles.drain(..) {
                handle.abort();
            }
        }
    }

    pub fn get_status_info(&self) -> (ReplayState, usize, usize) {
        let (symbols, ticks) = self.loaded.lock()
            .map(|loaded| (loaded.len(), loaded.values().sum()))
            .unwrap_or((0, 0));
        (self.get_state(), symbols, ticks)
    }
}

impl Drop for ReplayController {
    fn drop(&mut self) {
        self.clear_handles();
    }
}
