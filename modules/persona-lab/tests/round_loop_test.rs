//! End-to-end runs of the round controller against scripted capabilities.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use persona_lab::testing::{
    CancelAfter, ConstantRefiner, FailingRefiner, FixedOracle, MockGenerator, ScriptedOracle,
    SuffixRefiner,
};
use persona_lab::{
    ChannelSink, ComparisonPool, LabError, NoopSink, Oracle, Persona, PersonaSampling,
    ProgressEvent, Refiner, RetryPolicy, RoundController, RoundPhase, RunConfig, RunRequest,
};
use tokio::sync::mpsc::UnboundedReceiver;

const DECOYS: [&str; 2] = ["A", "B"];

fn config(rounds: u32, threshold: f64) -> RunConfig {
    RunConfig {
        round_count: rounds,
        candidates_per_round: 10,
        sampling: PersonaSampling::Random {
            trials_per_candidate: 10,
        },
        survival_threshold: threshold,
        oracle_retry: RetryPolicy::none(),
        generation_retry: RetryPolicy::none(),
        refinement_retry: RetryPolicy::none(),
        ..RunConfig::default()
    }
}

fn request() -> RunRequest {
    RunRequest::new(
        "a channel about home baking",
        ComparisonPool::new(DECOYS).unwrap(),
        Persona::roster(["a night-shift nurse who bakes on weekends"]).unwrap(),
    )
}

fn controller(
    generator: Arc<MockGenerator>,
    refiner: Arc<dyn Refiner>,
    oracle: Arc<dyn Oracle>,
    config: RunConfig,
) -> (RoundController, UnboundedReceiver<ProgressEvent>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let controller = RoundController::new(
        generator,
        refiner,
        oracle,
        config,
        Arc::new(ChannelSink::new(tx)),
    )
    .unwrap();
    (controller, rx)
}

fn drain(rx: &mut UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn only_the_winner_is_refined_across_two_rounds() {
    let generator = Arc::new(MockGenerator::new(["X", "Y"]));
    let refiner = Arc::new(SuffixRefiner::new("+"));
    let oracle = ScriptedOracle::new(DECOYS)
        .with_rate("X", 6, 10)
        .with_rate("Y", 4, 10)
        .with_rate("X+", 7, 10);
    let (controller, mut rx) = controller(
        generator.clone(),
        refiner.clone(),
        Arc::new(oracle),
        config(2, 50.0),
    );

    let outcome = controller.run(request()).await.unwrap();

    assert_eq!(outcome.rounds_completed, 2);
    assert_eq!(outcome.candidates.len(), 1);
    let winner = &outcome.candidates[0].candidate;
    assert_eq!(winner.payload, "X++");
    assert_eq!(winner.round, 3);
    assert_eq!(winner.prior_percentage, Some(70.0));

    // Round 2 worked on the refined set; nothing was regenerated.
    assert_eq!(generator.calls(), 1);
    assert_eq!(
        refiner.seen(),
        vec![("X".to_string(), 60.0), ("X+".to_string(), 70.0)]
    );

    // Lineage: round 2's candidate is X's child.
    let round1 = &outcome.rounds[0];
    let round2 = &outcome.rounds[1];
    let x = round1.candidates.iter().find(|c| c.payload == "X").unwrap();
    assert_eq!(round2.candidates.len(), 1);
    assert_eq!(round2.candidates[0].parent_id.as_deref(), Some(x.id.as_str()));
    assert_eq!(winner.parent_id.as_deref(), Some(round2.candidates[0].id.as_str()));

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        ProgressEvent::CandidateEliminated { round: 1, payload, .. } if payload == "Y"
    )));
    assert!(matches!(events.first(), Some(ProgressEvent::RunStarted { .. })));
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::RunFinished { rounds_completed: 2, candidates: 1, .. })
    ));
}

#[tokio::test]
async fn scores_reflect_exact_selection_ratios() {
    let oracle = ScriptedOracle::new(DECOYS)
        .with_rate("X", 6, 10)
        .with_rate("Y", 4, 10);
    let (controller, _rx) = controller(
        Arc::new(MockGenerator::new(["X", "Y"])),
        Arc::new(SuffixRefiner::new("+")),
        Arc::new(oracle),
        config(1, 0.0),
    );

    let outcome = controller.run(request()).await.unwrap();
    let report = outcome.rounds[0].report.as_ref().unwrap();
    assert_eq!(report.trials_submitted(), 20);
    assert_eq!(report.total_shown(), 20);

    let x = report.get("X").unwrap();
    assert_eq!((x.times_shown(), x.times_selected()), (10, 6));
    assert_eq!(x.percentage(), 60.0);
    let y = report.get("Y").unwrap();
    assert_eq!(y.percentage(), 40.0);

    let ranked: Vec<&str> = report.ranked().iter().map(|e| e.payload.as_str()).collect();
    assert_eq!(ranked, vec!["X", "Y"]);
}

#[tokio::test]
async fn threshold_is_inclusive() {
    let oracle = ScriptedOracle::new(DECOYS)
        .with_rate("X", 5, 10)
        .with_rate("Y", 4, 10);
    let (controller, _rx) = controller(
        Arc::new(MockGenerator::new(["X", "Y"])),
        Arc::new(SuffixRefiner::new("+")),
        Arc::new(oracle),
        config(1, 50.0),
    );

    let outcome = controller.run(request()).await.unwrap();
    let payloads: Vec<&str> = outcome
        .candidates
        .iter()
        .map(|f| f.candidate.payload.as_str())
        .collect();
    assert_eq!(payloads, vec!["X+"]);
}

#[tokio::test]
async fn everyone_below_threshold_fails_the_run() {
    let oracle = ScriptedOracle::new(DECOYS)
        .with_rate("X", 1, 10)
        .with_rate("Y", 2, 10);
    let refiner = Arc::new(SuffixRefiner::new("+"));
    let (controller, mut rx) = controller(
        Arc::new(MockGenerator::new(["X", "Y"])),
        refiner.clone(),
        Arc::new(oracle),
        config(2, 50.0),
    );

    let failure = controller.run(request()).await.unwrap_err();
    assert_eq!(
        failure.kind,
        LabError::AllCandidatesEliminated { threshold: 50.0 }
    );
    assert_eq!(failure.round, 1);
    assert_eq!(failure.phase, RoundPhase::Filtering);

    let last = failure.last_round.expect("scored round attached");
    assert_eq!(last.round, 1);
    assert_eq!(last.report.unwrap().get("Y").unwrap().percentage(), 20.0);
    assert_eq!(refiner.calls(), 0);

    let events = drain(&mut rx);
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::RunFailed { round: 1, .. })
    ));
}

#[tokio::test]
async fn failed_refinement_drops_only_that_candidate() {
    let oracle = ScriptedOracle::new(DECOYS)
        .with_rate("X", 8, 10)
        .with_rate("Y", 6, 10);
    let refiner = Arc::new(SuffixRefiner::new("+").failing_on("Y"));
    let (controller, mut rx) = controller(
        Arc::new(MockGenerator::new(["X", "Y"])),
        refiner.clone(),
        Arc::new(oracle),
        config(1, 50.0),
    );

    let outcome = controller.run(request()).await.unwrap();
    assert_eq!(outcome.candidates.len(), 1);
    assert_eq!(outcome.candidates[0].candidate.payload, "X+");
    assert_eq!(refiner.calls(), 2);

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        ProgressEvent::RefinementFailed { payload, .. } if payload == "Y"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        ProgressEvent::RoundCompleted { round: 1, survivors: 2, refined: 1 }
    )));
}

#[tokio::test]
async fn failing_every_refinement_fails_the_round() {
    let oracle = ScriptedOracle::new(DECOYS).with_rate("X", 9, 10);
    let (controller, _rx) = controller(
        Arc::new(MockGenerator::new(["X"])),
        Arc::new(FailingRefiner),
        Arc::new(oracle),
        config(1, 10.0),
    );

    let failure = controller.run(request()).await.unwrap_err();
    assert!(matches!(
        failure.kind,
        LabError::AllCandidatesEliminated { .. }
    ));
    assert_eq!(failure.phase, RoundPhase::Refining);
}

#[tokio::test]
async fn extra_candidates_join_the_first_round() {
    let oracle = Arc::new(
        ScriptedOracle::new(DECOYS)
            .with_rate("X", 5, 10)
            .with_rate("Supplied", 5, 10),
    );
    let config = config(1, 0.0).with_extra_candidates(vec!["Supplied".to_string()]);
    let (controller, _rx) = controller(
        Arc::new(MockGenerator::new(["X"])),
        Arc::new(SuffixRefiner::new("+")),
        oracle.clone(),
        config,
    );

    let outcome = controller.run(request()).await.unwrap();
    assert_eq!(oracle.trials_for("Supplied"), 10);
    assert_eq!(outcome.rounds[0].candidates.len(), 2);
    assert_eq!(outcome.candidates.len(), 2);
}

#[tokio::test]
async fn final_evaluation_ranks_and_truncates() {
    let oracle = ScriptedOracle::new(DECOYS)
        .with_default_rate(5, 10)
        .with_rate("P+", 2, 10)
        .with_rate("Q+", 9, 10)
        .with_rate("R+", 6, 10);
    let config = RunConfig {
        final_evaluation: true,
        final_count: Some(2),
        ..config(1, 0.0)
    };
    let (controller, mut rx) = controller(
        Arc::new(MockGenerator::new(["P", "Q", "R"])),
        Arc::new(SuffixRefiner::new("+")),
        Arc::new(oracle),
        config,
    );

    let outcome = controller.run(request()).await.unwrap();
    let ranked: Vec<(&str, Option<f64>)> = outcome
        .candidates
        .iter()
        .map(|f| (f.candidate.payload.as_str(), f.score.map(|s| s.percentage())))
        .collect();
    assert_eq!(ranked, vec![("Q+", Some(90.0)), ("R+", Some(60.0))]);

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, ProgressEvent::FinalEvaluation { candidates: 3 })));
}

#[tokio::test]
async fn empty_generation_is_an_empty_candidate_set() {
    let (controller, _rx) = controller(
        Arc::new(MockGenerator::new(Vec::<String>::new())),
        Arc::new(SuffixRefiner::new("+")),
        Arc::new(FixedOracle::new(1)),
        config(1, 0.0),
    );
    let failure = controller.run(request()).await.unwrap_err();
    assert_eq!(failure.kind, LabError::EmptyCandidateSet);
    assert_eq!(failure.phase, RoundPhase::Generating);
}

#[tokio::test]
async fn zero_candidates_per_round_is_an_empty_candidate_set() {
    let generator = Arc::new(MockGenerator::new(["X"]));
    let config = RunConfig {
        candidates_per_round: 0,
        ..config(1, 0.0)
    };
    let (controller, _rx) = controller(
        generator.clone(),
        Arc::new(SuffixRefiner::new("+")),
        Arc::new(FixedOracle::new(1)),
        config,
    );
    let failure = controller.run(request()).await.unwrap_err();
    assert_eq!(failure.kind, LabError::EmptyCandidateSet);
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn generator_failure_is_reported_after_retries() {
    let generator = Arc::new(MockGenerator::failing());
    let config = RunConfig {
        generation_retry: RetryPolicy::immediate(3),
        ..config(1, 0.0)
    };
    let (controller, _rx) = controller(
        generator.clone(),
        Arc::new(SuffixRefiner::new("+")),
        Arc::new(FixedOracle::new(1)),
        config,
    );
    let failure = controller.run(request()).await.unwrap_err();
    assert!(matches!(failure.kind, LabError::GenerationFailed(_)));
    assert_eq!(generator.calls(), 3);
}

#[tokio::test]
async fn cancellation_during_evaluation_is_reported_as_cancelled() {
    let flag = Arc::new(AtomicBool::new(false));
    let oracle = CancelAfter::new(flag.clone(), 3, FixedOracle::new(1));
    let config = RunConfig {
        max_concurrency: 1,
        sampling: PersonaSampling::Random {
            trials_per_candidate: 50,
        },
        ..config(2, 0.0)
    };
    let refiner = Arc::new(SuffixRefiner::new("+"));
    let (controller, mut rx) = controller(
        Arc::new(MockGenerator::new(["X", "Y"])),
        refiner.clone(),
        Arc::new(oracle),
        config,
    );
    let controller = controller.with_cancellation(flag);

    let failure = controller.run(request()).await.unwrap_err();
    assert!(failure.is_cancelled());
    assert_eq!(failure.phase, RoundPhase::Evaluating);
    assert_eq!(refiner.calls(), 0);

    let events = drain(&mut rx);
    assert!(matches!(events.last(), Some(ProgressEvent::RunFailed { .. })));
}

#[tokio::test]
async fn cancellation_in_a_later_round_reports_that_rounds_candidates() {
    let flag = Arc::new(AtomicBool::new(false));
    let scripted = ScriptedOracle::new(DECOYS)
        .with_rate("X", 6, 10)
        .with_rate("Y", 4, 10);
    // Round 1 judges 20 trials; the flag goes up three trials into round 2.
    let oracle = CancelAfter::new(flag.clone(), 23, scripted);
    let config = RunConfig {
        max_concurrency: 1,
        ..config(2, 50.0)
    };
    let refiner = Arc::new(SuffixRefiner::new("+"));
    let (controller, _rx) = controller(
        Arc::new(MockGenerator::new(["X", "Y"])),
        refiner.clone(),
        Arc::new(oracle),
        config,
    );
    let controller = controller.with_cancellation(flag);

    let failure = controller.run(request()).await.unwrap_err();
    assert!(failure.is_cancelled());
    assert_eq!(failure.round, 2);
    assert_eq!(failure.phase, RoundPhase::Evaluating);
    assert_eq!(refiner.calls(), 1);

    let last = failure.last_round.expect("round 2 was entered");
    assert_eq!(last.round, 2);
    let payloads: Vec<&str> = last.candidates.iter().map(|c| c.payload.as_str()).collect();
    assert_eq!(payloads, vec!["X+"]);
    assert!(last.report.is_none());
}

#[tokio::test]
async fn cancellation_during_final_evaluation_names_that_phase() {
    let flag = Arc::new(AtomicBool::new(false));
    // Round 1 judges 20 trials; the flag goes up during the final re-scoring.
    let oracle = CancelAfter::new(flag.clone(), 23, FixedOracle::new(1));
    let config = RunConfig {
        max_concurrency: 1,
        final_evaluation: true,
        ..config(1, 0.0)
    };
    let (controller, _rx) = controller(
        Arc::new(MockGenerator::new(["X", "Y"])),
        Arc::new(SuffixRefiner::new("+")),
        Arc::new(oracle),
        config,
    );
    let controller = controller.with_cancellation(flag);

    let failure = controller.run(request()).await.unwrap_err();
    assert!(failure.is_cancelled());
    assert_eq!(failure.round, 1);
    assert_eq!(failure.phase, RoundPhase::Finalizing);
    let last = failure.last_round.expect("round 1 completed");
    assert_eq!(last.round, 1);
    assert!(last.report.is_some());
}

#[tokio::test]
async fn identical_refinements_are_merged_and_reported() {
    let (controller, mut rx) = controller(
        Arc::new(MockGenerator::new(["X", "Y"])),
        Arc::new(ConstantRefiner::new("Z")),
        Arc::new(FixedOracle::new(1)),
        config(1, 0.0),
    );

    let outcome = controller.run(request()).await.unwrap();
    let payloads: Vec<&str> = outcome
        .candidates
        .iter()
        .map(|f| f.candidate.payload.as_str())
        .collect();
    assert_eq!(payloads, vec!["Z"]);

    let events = drain(&mut rx);
    let dropped: Vec<&ProgressEvent> = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::DuplicateDropped { .. }))
        .collect();
    assert_eq!(
        dropped,
        vec![&ProgressEvent::DuplicateDropped {
            round: 1,
            payload: "Z".to_string(),
        }]
    );
    assert!(events.contains(&ProgressEvent::RoundCompleted {
        round: 1,
        survivors: 2,
        refined: 1,
    }));
}

#[tokio::test]
async fn noop_sink_runs_to_completion() {
    let oracle = ScriptedOracle::new(DECOYS).with_default_rate(1, 1);
    let controller = RoundController::new(
        Arc::new(MockGenerator::new(["X", "Y", "Z"])),
        Arc::new(SuffixRefiner::new("!")),
        Arc::new(oracle),
        config(3, 100.0),
        Arc::new(NoopSink),
    )
    .unwrap();

    let outcome = controller.run(request()).await.unwrap();
    let mut payloads: Vec<String> = outcome
        .candidates
        .into_iter()
        .map(|f| f.candidate.payload)
        .collect();
    payloads.sort();
    assert_eq!(payloads, vec!["X!!!", "Y!!!", "Z!!!"]);
}
