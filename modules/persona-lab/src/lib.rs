//! persona-lab: estimates the relative appeal of candidate content by
//! showing it to simulated personas alongside a fixed decoy pool, then keeps
//! and refines the winners over several rounds.
//!
//! Domain-agnostic: candidates, decoys and personas are opaque text. The
//! judging, generation and refinement capabilities are injected as trait
//! objects; `capabilities` and `oracle` provide LLM-backed implementations.

pub mod capabilities;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod events;
pub mod oracle;
pub mod retry;
pub mod rounds;
pub mod scoreboard;
pub mod structured;
pub mod traits;
pub mod trial;
pub mod types;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use capabilities::{LlmGenerator, LlmRefiner, LlmRepairer};
pub use config::{load_comparison_file, load_config, AppConfig, ComparisonFile, FileConfig, RunConfig};
pub use error::LabError;
pub use evaluator::{BatchEvaluator, BatchReport, PersonaSampling};
pub use events::{ChannelSink, NoopSink, ProgressEvent, ProgressSink, RunLog, TracingSink};
pub use oracle::{parse_selection, LlmOracle, Oracle, OracleError, ResponseParsing};
pub use retry::RetryPolicy;
pub use rounds::{
    FinalCandidate, RoundController, RoundPhase, RoundRecord, RunFailure, RunOutcome, RunRequest,
};
pub use scoreboard::Scoreboard;
pub use structured::{parse_structured, ParseError};
pub use traits::{Generator, Refiner, Repairer};
pub use trial::{Trial, TrialOutcome, TrialRunner};
pub use types::{Candidate, CandidateScore, ComparisonPool, Persona, ScoreCard};
