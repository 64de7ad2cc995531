//! Scoreboard: per-candidate shown/selected tallies for one evaluation batch.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::warn;

use crate::types::{CandidateScore, ScoreCard};

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    shown: u32,
    selected: u32,
}

/// Thread-safe accumulator keyed by candidate payload.
///
/// The key set is fixed at registration; after that each entry is guarded by
/// its own lock, so concurrent recorders for different candidates never
/// contend and a record for one candidate is a single atomic update.
#[derive(Debug)]
pub struct Scoreboard {
    order: Vec<String>,
    entries: HashMap<String, Mutex<Tally>>,
}

impl Scoreboard {
    /// Create a `{0, 0}` entry for every distinct payload. Duplicates share
    /// one entry; registration order is the order of first appearance.
    pub fn register<I, S>(candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut order = Vec::new();
        let mut entries = HashMap::new();
        for candidate in candidates {
            let candidate = candidate.into();
            if !entries.contains_key(&candidate) {
                entries.insert(candidate.clone(), Mutex::new(Tally::default()));
                order.push(candidate);
            }
        }
        Self { order, entries }
    }

    /// Count one showing, and one selection if `hit`. Returns `false` (and
    /// records nothing) for a payload that was never registered.
    pub fn record_result(&self, candidate: &str, hit: bool) -> bool {
        let Some(entry) = self.entries.get(candidate) else {
            warn!(
                candidate = ai_client::truncate_to_char_boundary(candidate, 60),
                "Result for unregistered candidate ignored"
            );
            return false;
        };
        let mut tally = entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        tally.shown += 1;
        if hit {
            tally.selected += 1;
        }
        true
    }

    /// Frozen scores in registration order. Read-only; repeated calls return
    /// identical values once recording has stopped.
    pub fn snapshot(&self) -> Vec<CandidateScore> {
        self.order
            .iter()
            .map(|payload| {
                let tally = self
                    .entries
                    .get(payload)
                    .map(|entry| *entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
                    .unwrap_or_default();
                CandidateScore {
                    payload: payload.clone(),
                    score: ScoreCard::new(tally.shown, tally.selected),
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn registered_candidates_start_at_zero() {
        let board = Scoreboard::register(["x", "y"]);
        let snapshot = board.snapshot();
        assert_eq!(snapshot.len(), 2);
        for entry in snapshot {
            assert_eq!(entry.score, ScoreCard::new(0, 0));
            assert_eq!(entry.score.percentage(), 0.0);
        }
    }

    #[test]
    fn duplicates_share_one_entry() {
        let board = Scoreboard::register(["x", "y", "x"]);
        assert_eq!(board.len(), 2);
        board.record_result("x", true);
        board.record_result("x", false);
        let snapshot = board.snapshot();
        assert_eq!(snapshot[0].payload, "x");
        assert_eq!(snapshot[0].score.times_shown(), 2);
        assert_eq!(snapshot[0].score.times_selected(), 1);
    }

    #[test]
    fn unregistered_results_are_rejected() {
        let board = Scoreboard::register(["x"]);
        assert!(!board.record_result("ghost", true));
        assert_eq!(board.len(), 1);
        assert_eq!(board.snapshot()[0].score.times_shown(), 0);
    }

    #[test]
    fn misses_increment_shown_only() {
        let board = Scoreboard::register(["x"]);
        board.record_result("x", false);
        board.record_result("x", false);
        board.record_result("x", true);
        let score = board.snapshot()[0].score;
        assert_eq!(score.times_shown(), 3);
        assert_eq!(score.times_selected(), 1);
    }

    #[test]
    fn snapshot_is_stable() {
        let board = Scoreboard::register(["x", "y"]);
        board.record_result("x", true);
        board.record_result("y", false);
        assert_eq!(board.snapshot(), board.snapshot());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_records_are_never_lost() {
        let board = Arc::new(Scoreboard::register(["x", "y", "z"]));
        let mut handles = Vec::new();
        for worker in 0..8u32 {
            let board = board.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..500u32 {
                    let candidate = ["x", "y", "z"][((worker + i) % 3) as usize];
                    board.record_result(candidate, i % 2 == 0);
                    if i % 50 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = board.snapshot();
        let shown: u32 = snapshot.iter().map(|e| e.score.times_shown()).sum();
        let selected: u32 = snapshot.iter().map(|e| e.score.times_selected()).sum();
        assert_eq!(shown, 8 * 500);
        assert_eq!(selected, 8 * 250);
        for entry in &snapshot {
            assert!(entry.score.times_selected() <= entry.score.times_shown());
        }
    }
}
