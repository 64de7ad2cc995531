//! Progress events and the sinks that receive them.
//!
//! Sinks observe a run; they cannot influence it. `RunLog` keeps a persisted
//! JSON timeline of every event in `{DATA_DIR}/runs/{run_id}.json`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

/// Root data directory, controlled by `DATA_DIR` (default: `"data"`).
pub fn data_dir() -> PathBuf {
    PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string()))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    RunStarted {
        run_id: String,
        rounds: u32,
        candidates_per_round: usize,
    },
    RoundStarted {
        round: u32,
        candidates: usize,
    },
    CandidateScored {
        round: u32,
        payload: String,
        times_shown: u32,
        times_selected: u32,
        percentage: f64,
    },
    CandidateEliminated {
        round: u32,
        payload: String,
        percentage: f64,
        threshold: f64,
    },
    RefinementFailed {
        round: u32,
        payload: String,
        error: String,
    },
    /// A candidate whose payload repeated an earlier one was merged away.
    DuplicateDropped {
        round: u32,
        payload: String,
    },
    RoundCompleted {
        round: u32,
        survivors: usize,
        refined: usize,
    },
    FinalEvaluation {
        candidates: usize,
    },
    RunFinished {
        run_id: String,
        rounds_completed: u32,
        candidates: usize,
    },
    RunFailed {
        run_id: String,
        round: u32,
        error: String,
    },
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent);
}

/// Discards everything.
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn emit(&self, _event: &ProgressEvent) {}
}

/// Writes each event as a structured log line.
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn emit(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::RunStarted {
                run_id,
                rounds,
                candidates_per_round,
            } => info!(run_id = run_id.as_str(), rounds, candidates_per_round, "Run started"),
            ProgressEvent::RoundStarted { round, candidates } => {
                info!(round, candidates, "Round started")
            }
            ProgressEvent::CandidateScored {
                round,
                payload,
                times_shown,
                times_selected,
                percentage,
            } => info!(
                round,
                candidate = payload.as_str(),
                times_shown,
                times_selected,
                percentage = %format!("{percentage:.1}"),
                "Candidate scored"
            ),
            ProgressEvent::CandidateEliminated {
                round,
                payload,
                percentage,
                threshold,
            } => info!(
                round,
                candidate = payload.as_str(),
                percentage = %format!("{percentage:.1}"),
                threshold,
                "Candidate eliminated"
            ),
            ProgressEvent::RefinementFailed {
                round,
                payload,
                error,
            } => warn!(
                round,
                candidate = payload.as_str(),
                error = error.as_str(),
                "Refinement failed, candidate dropped"
            ),
            ProgressEvent::DuplicateDropped { round, payload } => warn!(
                round,
                candidate = payload.as_str(),
                "Duplicate payload dropped"
            ),
            ProgressEvent::RoundCompleted {
                round,
                survivors,
                refined,
            } => info!(round, survivors, refined, "Round completed"),
            ProgressEvent::FinalEvaluation { candidates } => {
                info!(candidates, "Final evaluation")
            }
            ProgressEvent::RunFinished {
                run_id,
                rounds_completed,
                candidates,
            } => info!(run_id = run_id.as_str(), rounds_completed, candidates, "Run finished"),
            ProgressEvent::RunFailed {
                run_id,
                round,
                error,
            } => warn!(run_id = run_id.as_str(), round, error = error.as_str(), "Run failed"),
        }
    }
}

/// Forwards events to an unbounded channel. A dropped receiver is ignored.
pub struct ChannelSink {
    tx: UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<ProgressEvent>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: &ProgressEvent) {
        let _ = self.tx.send(event.clone());
    }
}

// ---------------------------------------------------------------------------
// RunLog
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct LoggedEvent {
    seq: u32,
    ts: DateTime<Utc>,
    #[serde(flatten)]
    event: ProgressEvent,
}

#[derive(Default)]
struct Timeline {
    events: Vec<LoggedEvent>,
    seq: u32,
}

/// Sequenced, timestamped record of a run, saved as one JSON file.
pub struct RunLog {
    run_id: String,
    started_at: DateTime<Utc>,
    timeline: Mutex<Timeline>,
}

impl RunLog {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: Utc::now(),
            timeline: Mutex::new(Timeline::default()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Timeline> {
        self.timeline.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Save under `{DATA_DIR}/runs/`.
    pub fn save(&self) -> Result<PathBuf> {
        self.save_to(&data_dir().join("runs"))
    }

    /// Serialize the timeline to `{dir}/{run_id}.json`. Returns the path.
    pub fn save_to(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.json", self.run_id));

        let timeline = self.lock();
        let output = SerializedRunLog {
            run_id: &self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            events: &timeline.events,
        };
        std::fs::write(&path, serde_json::to_string_pretty(&output)?)?;
        info!(path = %path.display(), events = timeline.events.len(), "Run log saved");

        Ok(path)
    }
}

impl ProgressSink for RunLog {
    fn emit(&self, event: &ProgressEvent) {
        let mut timeline = self.lock();
        let seq = timeline.seq;
        timeline.events.push(LoggedEvent {
            seq,
            ts: Utc::now(),
            event: event.clone(),
        });
        timeline.seq += 1;
    }
}

#[derive(Serialize)]
struct SerializedRunLog<'a> {
    run_id: &'a str,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    events: &'a [LoggedEvent],
}
