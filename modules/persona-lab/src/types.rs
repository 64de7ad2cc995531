//! Data model: candidates, score cards, personas and the comparison pool.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LabError;

// =============================================================================
// Candidate
// =============================================================================

/// One content item under evaluation.
///
/// Identity inside a round is the `payload`. Across rounds a refined
/// candidate is a new value linked to its ancestor only by `parent_id` and
/// the carried-forward `prior_percentage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub parent_id: Option<String>,
    /// Round in which this candidate is first evaluated (1-based).
    pub round: u32,
    pub created_at: DateTime<Utc>,
    pub payload: String,
    /// Percentage the parent scored before refinement.
    pub prior_percentage: Option<f64>,
}

impl Candidate {
    /// A candidate with no ancestor (generated or supplied up front).
    pub fn seed(payload: impl Into<String>, round: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            round,
            created_at: Utc::now(),
            payload: payload.into(),
            prior_percentage: None,
        }
    }

    /// A refined descendant entering the next round.
    pub fn child(&self, payload: impl Into<String>, percentage: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: Some(self.id.clone()),
            round: self.round + 1,
            created_at: Utc::now(),
            payload: payload.into(),
            prior_percentage: Some(percentage),
        }
    }
}

// =============================================================================
// ScoreCard
// =============================================================================

/// Frozen shown/selected counts for one candidate.
///
/// `times_selected <= times_shown` always holds; `percentage` is 0 when the
/// candidate was never shown.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreCard {
    times_shown: u32,
    times_selected: u32,
    percentage: f64,
}

impl ScoreCard {
    pub fn new(times_shown: u32, times_selected: u32) -> Self {
        let times_selected = times_selected.min(times_shown);
        let percentage = if times_shown == 0 {
            0.0
        } else {
            (times_selected as f64 * 100.0) / times_shown as f64
        };
        Self {
            times_shown,
            times_selected,
            percentage,
        }
    }

    pub fn times_shown(&self) -> u32 {
        self.times_shown
    }

    pub fn times_selected(&self) -> u32 {
        self.times_selected
    }

    pub fn percentage(&self) -> f64 {
        self.percentage
    }
}

impl Default for ScoreCard {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

/// A payload and its frozen score, as reported by one evaluation batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateScore {
    pub payload: String,
    pub score: ScoreCard,
}

// =============================================================================
// Persona
// =============================================================================

/// Who is judging. Opaque, but never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Persona(String);

impl Persona {
    pub fn new(description: impl Into<String>) -> Result<Self, LabError> {
        let description = description.into();
        if description.trim().is_empty() {
            return Err(LabError::InvalidPersona(
                "persona description is empty".to_string(),
            ));
        }
        Ok(Self(description))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Build a roster, rejecting empty rosters and empty descriptions.
    pub fn roster<I, S>(descriptions: I) -> Result<Vec<Persona>, LabError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let roster = descriptions
            .into_iter()
            .map(Persona::new)
            .collect::<Result<Vec<_>, _>>()?;
        if roster.is_empty() {
            return Err(LabError::EmptyPersonaRoster);
        }
        Ok(roster)
    }
}

impl TryFrom<String> for Persona {
    type Error = LabError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Persona::new(value)
    }
}

impl From<Persona> for String {
    fn from(persona: Persona) -> Self {
        persona.0
    }
}

impl fmt::Display for Persona {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// ComparisonPool
// =============================================================================

/// Fixed decoys shown next to every candidate. Never scored or filtered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComparisonPool {
    items: Vec<String>,
}

impl ComparisonPool {
    pub fn new<I, S>(items: I) -> Result<Self, LabError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let items: Vec<String> = items.into_iter().map(Into::into).collect();
        if items.is_empty() {
            return Err(LabError::EmptyComparisonPool);
        }
        Ok(Self { items })
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_is_zero_when_never_shown() {
        let card = ScoreCard::new(0, 0);
        assert_eq!(card.percentage(), 0.0);
    }

    #[test]
    fn percentage_from_counts() {
        assert_eq!(ScoreCard::new(5, 3).percentage(), 60.0);
        assert_eq!(ScoreCard::new(4, 2).percentage(), 50.0);
        assert_eq!(ScoreCard::new(3, 3).percentage(), 100.0);
    }

    #[test]
    fn selected_never_exceeds_shown() {
        let card = ScoreCard::new(2, 7);
        assert_eq!(card.times_selected(), 2);
        assert_eq!(card.percentage(), 100.0);
    }

    #[test]
    fn empty_persona_rejected() {
        assert!(matches!(Persona::new("   "), Err(LabError::InvalidPersona(_))));
        assert!(Persona::new("a retired engineer who loves trains").is_ok());
    }

    #[test]
    fn empty_roster_rejected() {
        let empty: Vec<String> = vec![];
        assert_eq!(Persona::roster(empty), Err(LabError::EmptyPersonaRoster));
    }

    #[test]
    fn persona_deserialization_validates() {
        let ok: Persona = serde_json::from_str("\"a student\"").unwrap();
        assert_eq!(ok.as_str(), "a student");
        assert!(serde_json::from_str::<Persona>("\"\"").is_err());
    }

    #[test]
    fn empty_pool_rejected() {
        let empty: Vec<String> = vec![];
        assert_eq!(ComparisonPool::new(empty), Err(LabError::EmptyComparisonPool));
        assert_eq!(ComparisonPool::new(["A", "B"]).unwrap().len(), 2);
    }

    #[test]
    fn child_links_to_parent_and_carries_score() {
        let parent = Candidate::seed("How I built a cabin", 1);
        let child = parent.child("I Built a Cabin in 30 Days", 60.0);
        assert_eq!(child.parent_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(child.round, 2);
        assert_eq!(child.prior_percentage, Some(60.0));
        assert_ne!(child.id, parent.id);
    }
}
