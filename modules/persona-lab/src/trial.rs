//! Trial runner: one randomized presentation of a candidate among the decoys.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::warn;

use crate::oracle::{Oracle, OracleError};
use crate::retry::{retry_with, RetryPolicy};
use crate::types::{ComparisonPool, Persona};

/// Outcome of the judging call for one trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrialOutcome {
    /// The oracle picked this 1-based position.
    Selected(usize),
    /// Every attempt failed, or the answer was unusable. Counts as a miss.
    Failed(OracleError),
}

/// One evaluation event. Built once by [`TrialRunner::run_trial`] and never
/// mutated afterwards.
#[derive(Debug, Clone)]
pub struct Trial {
    candidate: String,
    persona: Persona,
    display: Vec<String>,
    true_position: usize,
    outcome: TrialOutcome,
    attempts: u32,
}

impl Trial {
    pub fn candidate(&self) -> &str {
        &self.candidate
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    /// Items in the order they were shown.
    pub fn display(&self) -> &[String] {
        &self.display
    }

    /// 1-based position of the candidate in `display`.
    pub fn true_position(&self) -> usize {
        self.true_position
    }

    pub fn outcome(&self) -> &TrialOutcome {
        &self.outcome
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn hit(&self) -> bool {
        matches!(self.outcome, TrialOutcome::Selected(p) if p == self.true_position)
    }

    pub fn failure(&self) -> Option<&OracleError> {
        match &self.outcome {
            TrialOutcome::Failed(e) => Some(e),
            TrialOutcome::Selected(_) => None,
        }
    }
}

/// Build `pool ++ [candidate]`, shuffle it, and return it with the
/// candidate's 1-based position. The position is tracked by slot, so a
/// candidate identical to a decoy is still located correctly.
pub fn shuffled_display<R: Rng + ?Sized>(
    candidate: &str,
    pool: &ComparisonPool,
    rng: &mut R,
) -> (Vec<String>, usize) {
    let candidate_slot = pool.len();
    let mut slots: Vec<usize> = (0..=candidate_slot).collect();
    slots.shuffle(rng);

    let mut true_position = 0;
    let display = slots
        .iter()
        .enumerate()
        .map(|(position, &slot)| {
            if slot == candidate_slot {
                true_position = position + 1;
                candidate.to_string()
            } else {
                pool.items()[slot].clone()
            }
        })
        .collect();

    (display, true_position)
}

/// Runs single trials against an oracle, with per-call timeout and a bounded
/// retry budget for transient failures.
#[derive(Clone)]
pub struct TrialRunner {
    oracle: Arc<dyn Oracle>,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl TrialRunner {
    pub fn new(oracle: Arc<dyn Oracle>, retry: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            oracle,
            retry,
            call_timeout,
        }
    }

    /// Run one trial. Never fails: oracle failures become a recorded miss.
    pub async fn run_trial(
        &self,
        candidate: &str,
        pool: &ComparisonPool,
        persona: &Persona,
    ) -> Trial {
        let (display, true_position) = shuffled_display(candidate, pool, &mut rand::rng());

        let oracle = &self.oracle;
        let shown = &display;
        let call_timeout = self.call_timeout;
        let (result, attempts) = retry_with(
            &self.retry,
            "oracle",
            OracleError::is_retryable,
            || async move {
                match tokio::time::timeout(call_timeout, oracle.judge(shown, persona)).await {
                    Ok(Ok(position)) if !(1..=shown.len()).contains(&position) => {
                        Err(OracleError::AmbiguousResponse(format!(
                            "position {position} out of range 1..={}",
                            shown.len()
                        )))
                    }
                    Ok(result) => result,
                    Err(_) => Err(OracleError::Unavailable(format!(
                        "timed out after {}ms",
                        call_timeout.as_millis()
                    ))),
                }
            },
        )
        .await;

        let outcome = match result {
            Ok(position) => TrialOutcome::Selected(position),
            Err(e) => {
                warn!(
                    candidate = ai_client::truncate_to_char_boundary(candidate, 60),
                    attempts,
                    error = %e,
                    "Trial failed, counting as miss"
                );
                TrialOutcome::Failed(e)
            }
        };

        Trial {
            candidate: candidate.to_string(),
            persona: persona.clone(),
            display,
            true_position,
            outcome,
            attempts,
        }
    }
}
