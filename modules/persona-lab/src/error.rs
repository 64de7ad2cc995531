use thiserror::Error;

/// Run-level failures. Trial and refinement failures never surface here;
/// they are absorbed inside the round that produced them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LabError {
    #[error("Candidate set is empty")]
    EmptyCandidateSet,

    #[error("All candidates eliminated (survival threshold {threshold}%)")]
    AllCandidatesEliminated { threshold: f64 },

    #[error("Comparison pool is empty")]
    EmptyComparisonPool,

    #[error("Persona roster is empty")]
    EmptyPersonaRoster,

    #[error("Invalid persona: {0}")]
    InvalidPersona(String),

    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Run cancelled")]
    Cancelled,
}
