//! Round controller: the generate → evaluate → filter → refine loop.
//!
//! Round 1 generates the initial set; every later round evaluates the refined
//! set produced by the round before it. Rounds are strictly sequential, and
//! each stage hands the next an immutable value (`RoundRecord`,
//! `BatchReport`) instead of sharing mutable state.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RunConfig;
use crate::error::LabError;
use crate::evaluator::{BatchEvaluator, BatchReport};
use crate::events::{ProgressEvent, ProgressSink};
use crate::oracle::Oracle;
use crate::retry::{retry_with, RetryPolicy};
use crate::traits::{Generator, Refiner};
use crate::trial::TrialRunner;
use crate::types::{Candidate, ComparisonPool, Persona, ScoreCard};

/// Everything a run needs besides configuration.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: String,
    pub initial_context: String,
    pub comparison_pool: ComparisonPool,
    pub personas: Vec<Persona>,
}

impl RunRequest {
    pub fn new(
        initial_context: impl Into<String>,
        comparison_pool: ComparisonPool,
        personas: Vec<Persona>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            initial_context: initial_context.into(),
            comparison_pool,
            personas,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    Generating,
    Evaluating,
    Filtering,
    Refining,
    /// Re-scoring the final set after the last round.
    Finalizing,
    Done,
}

/// The candidate set of one round and, once evaluated, its scores.
#[derive(Debug, Clone, Serialize)]
pub struct RoundRecord {
    pub round: u32,
    pub candidates: Vec<Candidate>,
    pub report: Option<BatchReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FinalCandidate {
    pub candidate: Candidate,
    /// Present when the final set was evaluated again after the last round.
    pub score: Option<ScoreCard>,
}

impl FinalCandidate {
    /// Fresh score if there is one, otherwise the parent's carried score.
    pub fn percentage(&self) -> Option<f64> {
        self.score
            .map(|s| s.percentage())
            .or(self.candidate.prior_percentage)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub rounds_completed: u32,
    /// Ranked best first.
    pub candidates: Vec<FinalCandidate>,
    pub rounds: Vec<RoundRecord>,
}

/// Why a run stopped, where, and the last round it got through.
#[derive(Debug, Clone, Error)]
#[error("run failed in round {round} while {phase:?}: {kind}")]
pub struct RunFailure {
    pub round: u32,
    pub phase: RoundPhase,
    pub kind: LabError,
    pub last_round: Option<RoundRecord>,
}

impl RunFailure {
    pub fn is_cancelled(&self) -> bool {
        self.kind == LabError::Cancelled
    }
}

/// Where the loop currently is. Read back to describe a failure.
struct Progress {
    round: u32,
    phase: RoundPhase,
    last_round: Option<RoundRecord>,
    history: Vec<RoundRecord>,
}

pub struct RoundController {
    generator: Arc<dyn Generator>,
    refiner: Arc<dyn Refiner>,
    evaluator: BatchEvaluator,
    config: RunConfig,
    sink: Arc<dyn ProgressSink>,
    cancelled: Arc<AtomicBool>,
}

impl RoundController {
    pub fn new(
        generator: Arc<dyn Generator>,
        refiner: Arc<dyn Refiner>,
        oracle: Arc<dyn Oracle>,
        config: RunConfig,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Self, LabError> {
        config.validate()?;
        let runner = TrialRunner::new(oracle, config.oracle_retry, config.oracle_timeout);
        let evaluator = BatchEvaluator::new(runner, config.sampling, config.max_concurrency);
        Ok(Self {
            generator,
            refiner,
            evaluator,
            config,
            sink,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Share a caller-owned cancellation flag.
    pub fn with_cancellation(mut self, cancelled: Arc<AtomicBool>) -> Self {
        self.cancelled = cancelled;
        self
    }

    /// Setting the returned flag stops the run at the next checkpoint.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome, RunFailure> {
        info!(
            run_id = request.run_id.as_str(),
            rounds = self.config.round_count,
            decoys = request.comparison_pool.len(),
            personas = request.personas.len(),
            "Starting run"
        );
        self.sink.emit(&ProgressEvent::RunStarted {
            run_id: request.run_id.clone(),
            rounds: self.config.round_count,
            candidates_per_round: self.config.candidates_per_round,
        });

        let mut progress = Progress {
            round: 1,
            phase: RoundPhase::Generating,
            last_round: None,
            history: Vec::new(),
        };

        match self.drive(&request, &mut progress).await {
            Ok(candidates) => {
                self.sink.emit(&ProgressEvent::RunFinished {
                    run_id: request.run_id.clone(),
                    rounds_completed: self.config.round_count,
                    candidates: candidates.len(),
                });
                Ok(RunOutcome {
                    run_id: request.run_id,
                    rounds_completed: self.config.round_count,
                    candidates,
                    rounds: progress.history,
                })
            }
            Err(kind) => {
                self.sink.emit(&ProgressEvent::RunFailed {
                    run_id: request.run_id.clone(),
                    round: progress.round,
                    error: kind.to_string(),
                });
                Err(RunFailure {
                    round: progress.round,
                    phase: progress.phase,
                    kind,
                    last_round: progress.last_round,
                })
            }
        }
    }

    async fn drive(
        &self,
        request: &RunRequest,
        progress: &mut Progress,
    ) -> Result<Vec<FinalCandidate>, LabError> {
        self.checkpoint()?;
        let mut current = self.generate(request).await?;

        for round in 1..=self.config.round_count {
            progress.round = round;
            self.checkpoint()?;
            self.sink.emit(&ProgressEvent::RoundStarted {
                round,
                candidates: current.len(),
            });

            progress.phase = RoundPhase::Evaluating;
            let mut record = RoundRecord {
                round,
                candidates: current,
                report: None,
            };
            progress.last_round = Some(record.clone());
            let report = self.evaluate(&record.candidates, request).await?;
            self.emit_scores(round, &report);
            record.report = Some(report);
            progress.last_round = Some(record.clone());

            progress.phase = RoundPhase::Filtering;
            self.checkpoint()?;
            let survivors = self.filter(round, &record)?;
            let survivor_count = survivors.len();

            progress.phase = RoundPhase::Refining;
            self.checkpoint()?;
            current = self.refine_all(round, survivors).await?;

            self.sink.emit(&ProgressEvent::RoundCompleted {
                round,
                survivors: survivor_count,
                refined: current.len(),
            });
            info!(round, survivors = survivor_count, refined = current.len(), "Round complete");
            progress.history.push(record);
        }

        progress.phase = RoundPhase::Finalizing;
        let finals = self.finalize(current, request).await?;
        progress.phase = RoundPhase::Done;
        Ok(finals)
    }

    fn checkpoint(&self) -> Result<(), LabError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(LabError::Cancelled);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Generating
    // -------------------------------------------------------------------------

    async fn generate(&self, request: &RunRequest) -> Result<Vec<Candidate>, LabError> {
        let count = self.config.candidates_per_round;

        let mut payloads = if count == 0 {
            Vec::new()
        } else {
            bounded_call(
                &self.config.generation_retry,
                self.config.generation_timeout,
                "generation",
                || self.generator.generate(&request.initial_context, count),
            )
            .await
            .map_err(|e| LabError::GenerationFailed(format!("{e:#}")))?
        };
        payloads.extend(self.config.extra_candidates.iter().cloned());

        let candidates = self.drop_duplicates(
            1,
            payloads
                .into_iter()
                .filter(|p| !p.trim().is_empty())
                .map(|p| Candidate::seed(p, 1))
                .collect(),
        );
        if candidates.is_empty() {
            return Err(LabError::EmptyCandidateSet);
        }

        info!(
            requested = count,
            extra = self.config.extra_candidates.len(),
            candidates = candidates.len(),
            "Initial candidate set ready"
        );
        Ok(candidates)
    }

    // -------------------------------------------------------------------------
    // Evaluating
    // -------------------------------------------------------------------------

    async fn evaluate(
        &self,
        candidates: &[Candidate],
        request: &RunRequest,
    ) -> Result<BatchReport, LabError> {
        let payloads: Vec<String> = candidates.iter().map(|c| c.payload.clone()).collect();
        self.evaluator
            .evaluate(
                &payloads,
                &request.comparison_pool,
                &request.personas,
                &self.cancelled,
            )
            .await
    }

    fn emit_scores(&self, round: u32, report: &BatchReport) {
        for entry in report.entries() {
            self.sink.emit(&ProgressEvent::CandidateScored {
                round,
                payload: entry.payload.clone(),
                times_shown: entry.score.times_shown(),
                times_selected: entry.score.times_selected(),
                percentage: entry.score.percentage(),
            });
        }
    }

    // -------------------------------------------------------------------------
    // Filtering
    // -------------------------------------------------------------------------

    fn filter(
        &self,
        round: u32,
        record: &RoundRecord,
    ) -> Result<Vec<(Candidate, ScoreCard)>, LabError> {
        let threshold = self.config.survival_threshold;
        let mut seen = HashSet::new();
        let mut survivors = Vec::new();

        for candidate in &record.candidates {
            if !seen.insert(candidate.payload.as_str()) {
                continue;
            }
            let score = record
                .report
                .as_ref()
                .and_then(|r| r.get(&candidate.payload))
                .unwrap_or_default();

            if score.percentage() >= threshold {
                survivors.push((candidate.clone(), score));
            } else {
                self.sink.emit(&ProgressEvent::CandidateEliminated {
                    round,
                    payload: candidate.payload.clone(),
                    percentage: score.percentage(),
                    threshold,
                });
            }
        }

        if survivors.is_empty() {
            warn!(round, threshold, "Every candidate fell below the survival threshold");
            return Err(LabError::AllCandidatesEliminated { threshold });
        }
        Ok(survivors)
    }

    // -------------------------------------------------------------------------
    // Refining
    // -------------------------------------------------------------------------

    async fn refine_all(
        &self,
        round: u32,
        survivors: Vec<(Candidate, ScoreCard)>,
    ) -> Result<Vec<Candidate>, LabError> {
        let expected = survivors.len();
        let refiner = &self.refiner;
        let config = &self.config;
        let cancelled = &self.cancelled;

        let outcomes: Vec<_> = stream::iter(survivors)
            .take_while(|_| futures::future::ready(!cancelled.load(Ordering::SeqCst)))
            .map(|(candidate, score)| async move {
                let result = bounded_call(
                    &config.refinement_retry,
                    config.refinement_timeout,
                    "refinement",
                    || refiner.refine(&candidate, &score),
                )
                .await
                .and_then(|payload| {
                    let payload = payload.trim().to_string();
                    if payload.is_empty() {
                        Err(anyhow!("refinement returned an empty payload"))
                    } else {
                        Ok(payload)
                    }
                });
                (candidate, score, result)
            })
            .buffered(config.refine_concurrency.min(expected).max(1))
            .collect()
            .await;

        if outcomes.len() < expected {
            return Err(LabError::Cancelled);
        }

        let mut refined = Vec::with_capacity(outcomes.len());
        for (candidate, score, result) in outcomes {
            match result {
                Ok(payload) => refined.push(candidate.child(payload, score.percentage())),
                Err(e) => {
                    warn!(
                        round,
                        candidate = ai_client::truncate_to_char_boundary(&candidate.payload, 60),
                        error = %e,
                        "Refinement failed, dropping candidate"
                    );
                    self.sink.emit(&ProgressEvent::RefinementFailed {
                        round,
                        payload: candidate.payload.clone(),
                        error: format!("{e:#}"),
                    });
                }
            }
        }

        let refined = self.drop_duplicates(round, refined);
        if refined.is_empty() {
            return Err(LabError::AllCandidatesEliminated {
                threshold: self.config.survival_threshold,
            });
        }
        Ok(refined)
    }

    fn drop_duplicates(&self, round: u32, candidates: Vec<Candidate>) -> Vec<Candidate> {
        let (kept, dropped) = dedup_by_payload(candidates);
        for candidate in dropped {
            warn!(
                round,
                candidate = ai_client::truncate_to_char_boundary(&candidate.payload, 60),
                "Duplicate payload, keeping the first occurrence"
            );
            self.sink.emit(&ProgressEvent::DuplicateDropped {
                round,
                payload: candidate.payload,
            });
        }
        kept
    }

    // -------------------------------------------------------------------------
    // Final selection
    // -------------------------------------------------------------------------

    async fn finalize(
        &self,
        candidates: Vec<Candidate>,
        request: &RunRequest,
    ) -> Result<Vec<FinalCandidate>, LabError> {
        let mut finals: Vec<FinalCandidate> = if self.config.final_evaluation {
            self.checkpoint()?;
            self.sink.emit(&ProgressEvent::FinalEvaluation {
                candidates: candidates.len(),
            });
            let report = self.evaluate(&candidates, request).await?;
            self.emit_scores(self.config.round_count, &report);
            candidates
                .into_iter()
                .map(|candidate| {
                    let score = report.get(&candidate.payload);
                    FinalCandidate { candidate, score }
                })
                .collect()
        } else {
            candidates
                .into_iter()
                .map(|candidate| FinalCandidate {
                    candidate,
                    score: None,
                })
                .collect()
        };

        finals.sort_by(|a, b| {
            let a = a.percentage().unwrap_or(f64::NEG_INFINITY);
            let b = b.percentage().unwrap_or(f64::NEG_INFINITY);
            b.total_cmp(&a)
        });
        if let Some(limit) = self.config.final_count {
            finals.truncate(limit);
        }
        Ok(finals)
    }
}

/// Keep the first candidate for every distinct payload. Returns the kept
/// candidates and the dropped repeats, both in input order.
fn dedup_by_payload(candidates: Vec<Candidate>) -> (Vec<Candidate>, Vec<Candidate>) {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .partition(|c| seen.insert(c.payload.clone()))
}

/// One capability call bounded by a per-attempt timeout and a retry budget.
async fn bounded_call<T, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    label: &str,
    op: F,
) -> anyhow::Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let (result, attempts) = retry_with(
        policy,
        label,
        |_: &anyhow::Error| true,
        || {
            let call = op();
            async move {
                match tokio::time::timeout(timeout, call).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!("timed out after {}ms", timeout.as_millis())),
                }
            }
        },
    )
    .await;
    result.map_err(|e| e.context(format!("{label} failed after {attempts} attempt(s)")))
}
