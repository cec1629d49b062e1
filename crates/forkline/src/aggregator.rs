//! Merges repeated attempts of the same work item into one result.
//!
//! Classification over an item's ordered attempts:
//! - no attempts: `Unknown`
//! - skips are ignored once anything else ran; only skips: `Skipped`
//! - every remaining attempt succeeded: `Success`
//! - at least one success and one failure/error, in any order: `Flake`
//! - otherwise the last failure/error decides between `Failure` and `Error`

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::bridge::protocol::{FailureDetail, LifecycleEvent, LifecycleKind, RunMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Error,
    Skipped,
}

impl Outcome {
    /// Outcome of a terminal lifecycle event; `None` for start/set events.
    pub fn from_lifecycle(kind: LifecycleKind) -> Option<Self> {
        match kind {
            LifecycleKind::TestSucceeded => Some(Self::Success),
            LifecycleKind::TestFailed => Some(Self::Failure),
            LifecycleKind::TestError => Some(Self::Error),
            LifecycleKind::TestSkipped | LifecycleKind::TestAssumptionFailure => {
                Some(Self::Skipped)
            }
            LifecycleKind::TestsetStarting
            | LifecycleKind::TestsetCompleted
            | LifecycleKind::TestStarting => None,
        }
    }

    fn is_bad(&self) -> bool {
        matches!(self, Self::Failure | Self::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Success,
    Failure,
    Error,
    Flake,
    Skipped,
    Unknown,
}

/// One run of a work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub run_mode: RunMode,
    pub attempt_id: Option<i64>,
    pub outcome: Outcome,
    pub elapsed_millis: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDetail>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub output: Vec<String>,
}

impl Attempt {
    pub fn new(outcome: Outcome, run_mode: RunMode) -> Self {
        Self {
            run_mode,
            attempt_id: None,
            outcome,
            elapsed_millis: None,
            failure: None,
            output: Vec::new(),
        }
    }

    /// Attempt closed by a terminal lifecycle event.
    pub fn from_event(event: &LifecycleEvent) -> Option<Self> {
        let outcome = Outcome::from_lifecycle(event.kind)?;
        Some(Self {
            run_mode: event.run_mode,
            attempt_id: event.attempt_id,
            outcome,
            elapsed_millis: event.entry.elapsed_millis,
            failure: event.entry.failure.clone(),
            output: Vec::new(),
        })
    }

    pub fn with_elapsed_millis(mut self, elapsed: i32) -> Self {
        self.elapsed_millis = Some(elapsed);
        self
    }

    pub fn with_failure(mut self, failure: FailureDetail) -> Self {
        self.failure = Some(failure);
        self
    }
}

pub fn classify(attempts: &[Attempt]) -> Classification {
    if attempts.is_empty() {
        return Classification::Unknown;
    }
    let mut ran = attempts.iter().filter(|a| a.outcome != Outcome::Skipped).peekable();
    if ran.peek().is_none() {
        return Classification::Skipped;
    }

    let mut any_success = false;
    let mut last_bad = None;
    for attempt in ran {
        match attempt.outcome {
            Outcome::Success => any_success = true,
            Outcome::Failure | Outcome::Error => last_bad = Some(attempt.outcome),
            Outcome::Skipped => {}
        }
    }

    match (any_success, last_bad) {
        (true, None) => Classification::Success,
        (true, Some(_)) => Classification::Flake,
        (false, Some(Outcome::Error)) => Classification::Error,
        (false, Some(_)) => Classification::Failure,
        (false, None) => Classification::Unknown,
    }
}

/// Index of the attempt whose timing and output represent the item.
fn canonical_index(attempts: &[Attempt], classification: Classification) -> usize {
    match classification {
        Classification::Success => attempts
            .iter()
            .position(|a| a.outcome == Outcome::Success)
            .unwrap_or(0),
        Classification::Failure | Classification::Error => attempts
            .iter()
            .rposition(|a| a.outcome.is_bad())
            .unwrap_or(0),
        Classification::Flake | Classification::Skipped | Classification::Unknown => 0,
    }
}

/// Result of one work item across all its attempts, for the external reporter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedResult {
    pub item_id: String,
    pub classification: Classification,
    /// Timing of the canonical attempt (the first one for a flake).
    pub elapsed_millis: Option<i32>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub output: Vec<String>,
    /// Failure detail of every attempt that had one, in attempt order.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub failures: Vec<FailureDetail>,
    pub attempts: Vec<Attempt>,
}

impl MergedResult {
    pub fn from_attempts(item_id: impl Into<String>, attempts: Vec<Attempt>) -> Self {
        let classification = classify(&attempts);
        let canonical = attempts.get(canonical_index(&attempts, classification));
        Self {
            item_id: item_id.into(),
            classification,
            elapsed_millis: canonical.and_then(|a| a.elapsed_millis),
            output: canonical.map(|a| a.output.clone()).unwrap_or_default(),
            failures: attempts.iter().filter_map(|a| a.failure.clone()).collect(),
            attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub completed: usize,
    pub errors: usize,
    pub failures: usize,
    pub skipped: usize,
    pub flakes: usize,
}

impl RunStatistics {
    fn add(&mut self, result: &MergedResult) {
        match result.classification {
            Classification::Success => {
                self.completed += result
                    .attempts
                    .iter()
                    .filter(|a| a.outcome == Outcome::Success)
                    .count();
            }
            Classification::Flake => {
                self.completed += 1;
                self.flakes += 1;
            }
            Classification::Failure => {
                self.completed += 1;
                self.failures += 1;
            }
            Classification::Error => {
                self.completed += 1;
                self.errors += 1;
            }
            Classification::Skipped => {
                self.completed += 1;
                self.skipped += 1;
            }
            Classification::Unknown => {}
        }
    }

    pub fn had_failures(&self) -> bool {
        self.errors > 0 || self.failures > 0
    }
}

/// Per-session history: item id -> attempts in arrival order, across run modes.
#[derive(Debug, Default)]
pub struct AttemptHistory {
    items: DashMap<String, Vec<Attempt>>,
}

impl AttemptHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, item_id: impl Into<String>, attempt: Attempt) {
        let item_id = item_id.into();
        tracing::debug!(
            item = %item_id,
            outcome = ?attempt.outcome,
            run_mode = ?attempt.run_mode,
            "Recorded attempt"
        );
        self.items.entry(item_id).or_default().push(attempt);
    }

    pub fn classify(&self, item_id: &str) -> Classification {
        self.items
            .get(item_id)
            .map(|attempts| classify(&attempts))
            .unwrap_or(Classification::Unknown)
    }

    pub fn attempts(&self, item_id: &str) -> Vec<Attempt> {
        self.items.get(item_id).map(|a| a.value().clone()).unwrap_or_default()
    }

    pub fn merged(&self, item_id: &str) -> Option<MergedResult> {
        let attempts = self.items.get(item_id)?.value().clone();
        Some(MergedResult::from_attempts(item_id, attempts))
    }

    /// Every item's merged result, sorted by item id.
    pub fn merged_results(&self) -> Vec<MergedResult> {
        let mut results: Vec<_> = self
            .items
            .iter()
            .map(|entry| MergedResult::from_attempts(entry.key().clone(), entry.value().clone()))
            .collect();
        results.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        results
    }

    pub fn statistics(&self) -> RunStatistics {
        let mut stats = RunStatistics::default();
        for result in self.merged_results() {
            stats.add(&result);
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Forget every attempt (session end or forced reset).
    pub fn reset(&self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(outcome: Outcome) -> Attempt {
        Attempt::new(outcome, RunMode::Normal)
    }

    fn rerun(outcome: Outcome) -> Attempt {
        Attempt::new(outcome, RunMode::RerunAfterFailure)
    }

    #[test]
    fn classification_rules() {
        use Outcome::*;
        let cases: &[(&[Outcome], Classification)] = &[
            (&[], Classification::Unknown),
            (&[Success], Classification::Success),
            (&[Success, Success], Classification::Success),
            (&[Failure, Failure], Classification::Failure),
            (&[Error, Success], Classification::Flake),
            (&[Success, Failure], Classification::Flake),
            (&[Skipped], Classification::Skipped),
            (&[Skipped, Skipped], Classification::Skipped),
            (&[Skipped, Success], Classification::Success),
            (&[Failure, Skipped], Classification::Failure),
            (&[Failure, Error], Classification::Error),
            (&[Error, Failure], Classification::Failure),
            (&[Error, Skipped, Failure, Success], Classification::Flake),
        ];
        for (outcomes, expected) in cases {
            let attempts: Vec<_> = outcomes.iter().map(|o| run(*o)).collect();
            assert_eq!(classify(&attempts), *expected, "{outcomes:?}");
        }
    }

    #[test]
    fn outcomes_from_lifecycle() {
        assert_eq!(
            Outcome::from_lifecycle(LifecycleKind::TestAssumptionFailure),
            Some(Outcome::Skipped)
        );
        assert_eq!(Outcome::from_lifecycle(LifecycleKind::TestError), Some(Outcome::Error));
        assert_eq!(Outcome::from_lifecycle(LifecycleKind::TestStarting), None);
    }

    #[test]
    fn flake_keeps_first_timing_and_every_failure() {
        let history = AttemptHistory::new();
        history.record(
            "pkg.T#t",
            run(Outcome::Failure)
                .with_elapsed_millis(120)
                .with_failure(FailureDetail::new("expected true")),
        );
        history.record("pkg.T#t", rerun(Outcome::Success).with_elapsed_millis(95));

        let merged = history.merged("pkg.T#t").unwrap();
        assert_eq!(merged.classification, Classification::Flake);
        assert_eq!(merged.elapsed_millis, Some(120));
        assert_eq!(merged.failures, vec![FailureDetail::new("expected true")]);
        assert_eq!(merged.attempts[1].elapsed_millis, Some(95));
    }

    #[test]
    fn failure_uses_last_failing_attempt() {
        let merged = MergedResult::from_attempts(
            "a",
            vec![
                run(Outcome::Error).with_elapsed_millis(1),
                rerun(Outcome::Failure).with_elapsed_millis(2),
            ],
        );
        assert_eq!(merged.classification, Classification::Failure);
        assert_eq!(merged.elapsed_millis, Some(2));
    }

    #[test]
    fn unknown_item() {
        let history = AttemptHistory::new();
        assert_eq!(history.classify("missing"), Classification::Unknown);
        assert!(history.merged("missing").is_none());
    }

    #[test]
    fn statistics_and_reset() {
        let history = AttemptHistory::new();
        history.record("a", run(Outcome::Success));
        history.record("b", run(Outcome::Failure));
        history.record("b", rerun(Outcome::Success));
        history.record("c", run(Outcome::Error));
        history.record("c", rerun(Outcome::Error));
        history.record("d", run(Outcome::Skipped));
        history.record("e", run(Outcome::Failure));

        let stats = history.statistics();
        insta::assert_json_snapshot!(stats, @r#"
        {
          "completed": 5,
          "errors": 1,
          "failures": 1,
          "skipped": 1,
          "flakes": 1
        }
        "#);
        assert!(stats.had_failures());

        history.reset();
        assert!(history.is_empty());
        assert_eq!(history.statistics(), RunStatistics::default());
    }

    #[test]
    fn merged_result_serializes() {
        let merged = MergedResult::from_attempts(
            "pkg.T#t",
            vec![
                Attempt {
                    attempt_id: Some(1),
                    ..run(Outcome::Failure)
                        .with_elapsed_millis(120)
                        .with_failure(FailureDetail::new("boom"))
                },
                Attempt {
                    attempt_id: Some(2),
                    ..rerun(Outcome::Success).with_elapsed_millis(95)
                },
            ],
        );
        insta::assert_json_snapshot!(merged, @r#"
        {
          "item_id": "pkg.T#t",
          "classification": "flake",
          "elapsed_millis": 120,
          "failures": [
            {
              "message": "boom"
            }
          ],
          "attempts": [
            {
              "run_mode": "normal",
              "attempt_id": 1,
              "outcome": "failure",
              "elapsed_millis": 120,
              "failure": {
                "message": "boom"
              }
            },
            {
              "run_mode": "rerun_after_failure",
              "attempt_id": 2,
              "outcome": "success",
              "elapsed_millis": 95
            }
          ]
        }
        "#);
    }
}
