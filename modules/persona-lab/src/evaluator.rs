//! Batch evaluator: fans trials for a whole candidate set out concurrently
//! and freezes the resulting scoreboard.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures::stream::{self, StreamExt};
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::LabError;
use crate::scoreboard::Scoreboard;
use crate::trial::TrialRunner;
use crate::types::{CandidateScore, ComparisonPool, Persona, ScoreCard};

/// How personas are assigned to trials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PersonaSampling {
    /// `trials_per_candidate` personas are drawn with replacement once per
    /// batch; every candidate faces that same panel.
    Random { trials_per_candidate: u32 },
    /// Every persona judges every candidate `checks_per_persona` times.
    Exhaustive { checks_per_persona: u32 },
}

impl PersonaSampling {
    pub fn trial_count(&self, candidates: usize, personas: usize) -> usize {
        match *self {
            PersonaSampling::Random {
                trials_per_candidate,
            } => candidates * trials_per_candidate as usize,
            PersonaSampling::Exhaustive { checks_per_persona } => {
                candidates * personas * checks_per_persona as usize
            }
        }
    }
}

/// Frozen result of one batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    entries: Vec<CandidateScore>,
    trials_submitted: usize,
    trials_failed: usize,
}

impl BatchReport {
    /// Scores in registration order (first appearance in the input).
    pub fn entries(&self) -> &[CandidateScore] {
        &self.entries
    }

    pub fn get(&self, payload: &str) -> Option<ScoreCard> {
        self.entries
            .iter()
            .find(|e| e.payload == payload)
            .map(|e| e.score)
    }

    /// Highest percentage first; ties keep registration order.
    pub fn ranked(&self) -> Vec<&CandidateScore> {
        let mut ranked: Vec<&CandidateScore> = self.entries.iter().collect();
        ranked.sort_by(|a, b| b.score.percentage().total_cmp(&a.score.percentage()));
        ranked
    }

    pub fn trials_submitted(&self) -> usize {
        self.trials_submitted
    }

    /// Trials whose oracle call failed and were recorded as misses.
    pub fn trials_failed(&self) -> usize {
        self.trials_failed
    }

    pub fn total_shown(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| e.score.times_shown() as u64)
            .sum()
    }
}

/// Evaluates a candidate set against a fixed comparison pool.
pub struct BatchEvaluator {
    runner: TrialRunner,
    sampling: PersonaSampling,
    max_concurrency: usize,
}

impl BatchEvaluator {
    pub fn new(runner: TrialRunner, sampling: PersonaSampling, max_concurrency: usize) -> Self {
        Self {
            runner,
            sampling,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn sampling(&self) -> PersonaSampling {
        self.sampling
    }

    /// Assign a persona to every trial. Trials for the same candidate are
    /// contiguous here, but dispatch does not preserve that order.
    fn plan<'a>(
        &self,
        candidates: &'a [String],
        personas: &'a [Persona],
    ) -> Vec<(&'a str, &'a Persona)> {
        let panel: Vec<&Persona> = match self.sampling {
            PersonaSampling::Random {
                trials_per_candidate,
            } => {
                let mut rng = rand::rng();
                (0..trials_per_candidate)
                    .filter_map(|_| personas.choose(&mut rng))
                    .collect()
            }
            PersonaSampling::Exhaustive { checks_per_persona } => personas
                .iter()
                .flat_map(|p| std::iter::repeat_n(p, checks_per_persona as usize))
                .collect(),
        };

        candidates
            .iter()
            .flat_map(|c| panel.iter().map(move |p| (c.as_str(), *p)))
            .collect()
    }

    /// Run every trial for `candidates` and return the frozen scores.
    ///
    /// Trial failures are recorded as misses and never abort the batch. If
    /// `cancelled` is raised, no further trials are submitted, in-flight ones
    /// drain, and the batch reports [`LabError::Cancelled`].
    pub async fn evaluate(
        &self,
        candidates: &[String],
        pool: &ComparisonPool,
        personas: &[Persona],
        cancelled: &AtomicBool,
    ) -> Result<BatchReport, LabError> {
        if candidates.is_empty() {
            return Err(LabError::EmptyCandidateSet);
        }
        if personas.is_empty() {
            return Err(LabError::EmptyPersonaRoster);
        }

        let scoreboard = Scoreboard::register(candidates.iter().cloned());
        let plan = self.plan(candidates, personas);
        let total = plan.len();
        let concurrency = total.clamp(1, self.max_concurrency);

        info!(
            candidates = scoreboard.len(),
            decoys = pool.len(),
            personas = personas.len(),
            trials = total,
            concurrency,
            "Evaluating batch"
        );

        let submitted = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let runner = &self.runner;
        let board = &scoreboard;
        let submitted_ref = &submitted;
        let failed_ref = &failed;

        stream::iter(plan)
            .take_while(|_| futures::future::ready(!cancelled.load(Ordering::SeqCst)))
            .map(|(candidate, persona)| {
                submitted_ref.fetch_add(1, Ordering::SeqCst);
                async move {
                    let trial = runner.run_trial(candidate, pool, persona).await;
                    if trial.failure().is_some() {
                        failed_ref.fetch_add(1, Ordering::SeqCst);
                    }
                    board.record_result(candidate, trial.hit());
                }
            })
            .buffer_unordered(concurrency)
            .for_each(|()| futures::future::ready(()))
            .await;

        let trials_submitted = submitted.into_inner();
        let trials_failed = failed.into_inner();

        if trials_submitted < total {
            info!(
                submitted = trials_submitted,
                planned = total,
                "Batch cancelled before all trials were dispatched"
            );
            return Err(LabError::Cancelled);
        }

        let report = BatchReport {
            entries: scoreboard.snapshot(),
            trials_submitted,
            trials_failed,
        };
        debug_assert_eq!(report.total_shown(), trials_submitted as u64);

        debug!(
            trials = trials_submitted,
            failed = trials_failed,
            "Batch complete"
        );

        Ok(report)
    }
}
