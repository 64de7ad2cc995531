// Test mocks for the persona-lab pipeline.
//
// One family per trait boundary:
// - Oracles: FixedOracle, RandomOracle, ScriptedOracle (exact per-candidate
//   hit ratios), FlakyOracle, FailingOracle, SlowOracle, CancelAfter
// - MockGenerator (Generator), SuffixRefiner / FailingRefiner (Refiner),
//   StaticRepairer (Repairer)
// - QueuedModel (ai_client::ChatModel) for the LLM-backed capabilities

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ai_client::{AiError, ChatModel};
use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::Rng;

use crate::oracle::{validate_request, Oracle, OracleError};
use crate::traits::{Generator, Refiner, Repairer};
use crate::types::{Candidate, Persona, ScoreCard};

// ---------------------------------------------------------------------------
// Oracles
// ---------------------------------------------------------------------------

/// Always picks the same position, whatever is shown.
pub struct FixedOracle {
    position: usize,
}

impl FixedOracle {
    pub fn new(position: usize) -> Self {
        Self { position }
    }
}

#[async_trait]
impl Oracle for FixedOracle {
    async fn judge(&self, display: &[String], persona: &Persona) -> Result<usize, OracleError> {
        validate_request(display, persona)?;
        Ok(self.position.clamp(1, display.len()))
    }
}

/// Picks uniformly at random.
pub struct RandomOracle;

#[async_trait]
impl Oracle for RandomOracle {
    async fn judge(&self, display: &[String], persona: &Persona) -> Result<usize, OracleError> {
        validate_request(display, persona)?;
        Ok(rand::rng().random_range(1..=display.len()))
    }
}

/// Selects each candidate with an exact, scripted ratio: out of every
/// `period` trials of a payload, the first `hits` are hits. Misses pick a
/// decoy. Payloads without a script use the default ratio (never picked).
pub struct ScriptedOracle {
    decoys: HashSet<String>,
    rates: HashMap<String, (u32, u32)>,
    default_rate: (u32, u32),
    counters: Mutex<HashMap<String, u32>>,
}

impl ScriptedOracle {
    pub fn new<I, S>(decoys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            decoys: decoys.into_iter().map(Into::into).collect(),
            rates: HashMap::new(),
            default_rate: (0, 1),
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_rate(mut self, payload: &str, hits: u32, period: u32) -> Self {
        self.rates.insert(payload.to_string(), (hits, period.max(1)));
        self
    }

    pub fn with_default_rate(mut self, hits: u32, period: u32) -> Self {
        self.default_rate = (hits, period.max(1));
        self
    }

    /// Trials judged so far for `payload`.
    pub fn trials_for(&self, payload: &str) -> u32 {
        self.counters
            .lock()
            .unwrap()
            .get(payload)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn judge(&self, display: &[String], persona: &Persona) -> Result<usize, OracleError> {
        validate_request(display, persona)?;

        let candidate_slot = display
            .iter()
            .position(|item| !self.decoys.contains(item))
            .ok_or_else(|| OracleError::InvalidRequest("no candidate in display".into()))?;
        let decoy_slot = display
            .iter()
            .position(|item| self.decoys.contains(item))
            .ok_or_else(|| OracleError::InvalidRequest("no decoy in display".into()))?;

        let payload = &display[candidate_slot];
        let (hits, period) = self
            .rates
            .get(payload)
            .copied()
            .unwrap_or(self.default_rate);

        let n = {
            let mut counters = self.counters.lock().unwrap();
            let counter = counters.entry(payload.clone()).or_insert(0);
            let n = *counter;
            *counter += 1;
            n
        };

        if n % period < hits {
            Ok(candidate_slot + 1)
        } else {
            Ok(decoy_slot + 1)
        }
    }
}

/// Fails with `Unavailable` for the first `failures` calls, then delegates.
pub struct FlakyOracle<O> {
    failures: usize,
    inner: O,
    calls: AtomicUsize,
}

impl<O: Oracle> FlakyOracle<O> {
    pub fn new(failures: usize, inner: O) -> Self {
        Self {
            failures,
            inner,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<O: Oracle> Oracle for FlakyOracle<O> {
    async fn judge(&self, display: &[String], persona: &Persona) -> Result<usize, OracleError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(OracleError::Unavailable(format!("flaky call {}", call + 1)));
        }
        self.inner.judge(display, persona).await
    }
}

/// Always fails with the given error.
pub struct FailingOracle {
    error: OracleError,
    calls: AtomicUsize,
}

impl FailingOracle {
    pub fn new(error: OracleError) -> Self {
        Self {
            error,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Oracle for FailingOracle {
    async fn judge(&self, _display: &[String], _persona: &Persona) -> Result<usize, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// Answers position 1 after sleeping.
pub struct SlowOracle {
    delay: Duration,
}

impl SlowOracle {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Oracle for SlowOracle {
    async fn judge(&self, _display: &[String], _persona: &Persona) -> Result<usize, OracleError> {
        tokio::time::sleep(self.delay).await;
        Ok(1)
    }
}

/// Delegates to `inner` and raises `flag` once `after` calls have been made.
pub struct CancelAfter<O> {
    flag: Arc<AtomicBool>,
    after: usize,
    inner: O,
    calls: AtomicUsize,
}

impl<O: Oracle> CancelAfter<O> {
    pub fn new(flag: Arc<AtomicBool>, after: usize, inner: O) -> Self {
        Self {
            flag,
            after,
            inner,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<O: Oracle> Oracle for CancelAfter<O> {
    async fn judge(&self, display: &[String], persona: &Persona) -> Result<usize, OracleError> {
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if calls >= self.after {
            self.flag.store(true, Ordering::SeqCst);
        }
        self.inner.judge(display, persona).await
    }
}

// ---------------------------------------------------------------------------
// Generator / Refiner / Repairer
// ---------------------------------------------------------------------------

/// Returns a fixed list (truncated to the requested count), or always fails.
pub struct MockGenerator {
    items: Vec<String>,
    fail: bool,
    calls: AtomicUsize,
}

impl MockGenerator {
    pub fn new<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            items: items.into_iter().map(Into::into).collect(),
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            items: Vec::new(),
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for MockGenerator {
    async fn generate(&self, _context: &str, count: usize) -> Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            bail!("MockGenerator: generation unavailable");
        }
        Ok(self.items.iter().take(count).cloned().collect())
    }
}

/// Appends a suffix. Payloads registered with `failing_on` always fail.
pub struct SuffixRefiner {
    suffix: String,
    failing: HashSet<String>,
    seen: Mutex<Vec<(String, f64)>>,
}

impl SuffixRefiner {
    pub fn new(suffix: &str) -> Self {
        Self {
            suffix: suffix.to_string(),
            failing: HashSet::new(),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_on(mut self, payload: &str) -> Self {
        self.failing.insert(payload.to_string());
        self
    }

    /// `(payload, percentage)` of every refine call, in call order.
    pub fn seen(&self) -> Vec<(String, f64)> {
        self.seen.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl Refiner for SuffixRefiner {
    async fn refine(&self, candidate: &Candidate, score: &ScoreCard) -> Result<String> {
        self.seen
            .lock()
            .unwrap()
            .push((candidate.payload.clone(), score.percentage()));
        if self.failing.contains(&candidate.payload) {
            bail!("SuffixRefiner: refusing {}", candidate.payload);
        }
        Ok(format!("{}{}", candidate.payload, self.suffix))
    }
}

/// Rewrites every candidate to the same payload.
pub struct ConstantRefiner {
    payload: String,
}

impl ConstantRefiner {
    pub fn new(payload: &str) -> Self {
        Self {
            payload: payload.to_string(),
        }
    }
}

#[async_trait]
impl Refiner for ConstantRefiner {
    async fn refine(&self, _candidate: &Candidate, _score: &ScoreCard) -> Result<String> {
        Ok(self.payload.clone())
    }
}

/// Every refinement fails.
pub struct FailingRefiner;

#[async_trait]
impl Refiner for FailingRefiner {
    async fn refine(&self, candidate: &Candidate, _score: &ScoreCard) -> Result<String> {
        bail!("FailingRefiner: cannot refine {}", candidate.payload)
    }
}

/// Returns the same text for every repair request.
pub struct StaticRepairer {
    output: String,
    calls: AtomicUsize,
}

impl StaticRepairer {
    pub fn new(output: &str) -> Self {
        Self {
            output: output.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Repairer for StaticRepairer {
    async fn repair(&self, _text: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.output.clone())
    }
}

// ---------------------------------------------------------------------------
// QueuedModel
// ---------------------------------------------------------------------------

/// Chat model that replays queued replies and records every prompt.
pub struct QueuedModel {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<(String, String)>>,
}

impl QueuedModel {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// `(system, user)` pairs, in call order.
    pub fn prompts(&self) -> Vec<(String, String)> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatModel for QueuedModel {
    async fn chat_completion(&self, system: &str, user: &str) -> ai_client::Result<String> {
        self.prompts
            .lock()
            .unwrap()
            .push((system.to_string(), user.to_string()));
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(AiError::EmptyResponse("QueuedModel: no replies left"))
    }

    fn model_name(&self) -> &str {
        "queued"
    }
}
