//! Capability seams injected into the round controller.
//!
//! Each trait is one external capability. The controller bounds every call
//! with a timeout and a retry budget, so implementations should make a single
//! attempt and return.

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{Candidate, ScoreCard};

/// Produces the initial candidate set from free-form context.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Up to `count` payloads. Returning fewer is allowed; returning none
    /// fails the run.
    async fn generate(&self, context: &str, count: usize) -> Result<Vec<String>>;
}

/// Produces exactly one improved payload from a scored candidate.
#[async_trait]
pub trait Refiner: Send + Sync {
    async fn refine(&self, candidate: &Candidate, score: &ScoreCard) -> Result<String>;
}

/// Rewrites malformed structured output into something parseable.
#[async_trait]
pub trait Repairer: Send + Sync {
    async fn repair(&self, text: &str) -> Result<String>;
}
