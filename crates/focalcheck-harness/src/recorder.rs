//! Non-terminating assertion recording.
//!
//! Every `record_*` call appends an [`AssertionResult`] and returns whether it
//! passed. Nothing here panics on a failed check: the enclosing case keeps
//! running so later checks still contribute to the run.

use std::fmt::Debug;
use std::panic::{AssertUnwindSafe, catch_unwind};

use serde::{Deserialize, Serialize};

use crate::case::CaseError;

/// Outcome of a single check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionResult {
    /// What was checked.
    pub description: String,
    /// Whether the check held.
    pub passed: bool,
    /// Rendered actual/expected values for failed checks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail_message: Option<String>,
}

/// Pass/fail/total counts produced by [`AssertionRecorder::summarize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionSummary {
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

/// Ordered log of check outcomes for one test case.
///
/// Counts are derived from `results`, so a deserialized recorder always agrees
/// with its own log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionRecorder {
    results: Vec<AssertionResult>,
}

impl AssertionRecorder {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, description: impl Into<String>, passed: bool, detail: Option<String>) -> bool {
        self.results.push(AssertionResult {
            description: description.into(),
            passed,
            detail_message: detail,
        });
        passed
    }

    /// Record `actual == expected`.
    ///
    /// A mismatch stores `expected <e>, got <a>` using the `Debug` renderings.
    pub fn record_equals<T: PartialEq + Debug>(
        &mut self,
        actual: T,
        expected: T,
        description: impl Into<String>,
    ) -> bool {
        if actual == expected {
            self.push(description, true, None)
        } else {
            let detail = format!("expected {expected:?}, got {actual:?}");
            self.push(description, false, Some(detail))
        }
    }

    /// Record `actual != unexpected`.
    pub fn record_not_equals<T: PartialEq + Debug>(
        &mut self,
        actual: T,
        unexpected: T,
        description: impl Into<String>,
    ) -> bool {
        if actual != unexpected {
            self.push(description, true, None)
        } else {
            let detail = format!("expected anything but {unexpected:?}, got {actual:?}");
            self.push(description, false, Some(detail))
        }
    }

    /// Record a boolean condition that must hold.
    pub fn record_true(&mut self, condition: bool, description: impl Into<String>) -> bool {
        let detail = (!condition).then(|| "expected true, got false".to_string());
        self.push(description, condition, detail)
    }

    /// Record a boolean condition that must not hold.
    pub fn record_false(&mut self, condition: bool, description: impl Into<String>) -> bool {
        let detail = condition.then(|| "expected false, got true".to_string());
        self.push(description, !condition, detail)
    }

    /// Record `|actual - expected| <= tolerance`. NaN never passes.
    pub fn record_near(
        &mut self,
        actual: f64,
        expected: f64,
        tolerance: f64,
        description: impl Into<String>,
    ) -> bool {
        let delta = (actual - expected).abs();
        if delta <= tolerance {
            self.push(description, true, None)
        } else {
            let detail = format!("expected {expected} +/- {tolerance}, got {actual} (delta {delta})");
            self.push(description, false, Some(detail))
        }
    }

    /// Record that an optional value is present.
    pub fn record_some<T>(&mut self, value: &Option<T>, description: impl Into<String>) -> bool {
        let detail = value.is_none().then(|| "expected Some(..), got None".to_string());
        self.push(description, value.is_some(), detail)
    }

    /// Record that an optional value is absent.
    pub fn record_none<T: Debug>(&mut self, value: &Option<T>, description: impl Into<String>) -> bool {
        match value {
            None => self.push(description, true, None),
            Some(v) => {
                let detail = format!("expected None, got Some({v:?})");
                self.push(description, false, Some(detail))
            }
        }
    }

    /// Record that two byte slices are identical, naming the first differing offset.
    pub fn record_bytes_equal(
        &mut self,
        actual: &[u8],
        expected: &[u8],
        description: impl Into<String>,
    ) -> bool {
        if actual == expected {
            return self.push(description, true, None);
        }
        let detail = match actual.iter().zip(expected).position(|(a, e)| a != e) {
            Some(offset) => format!(
                "first difference at offset {offset}: expected 0x{:02x}, got 0x{:02x}",
                expected[offset], actual[offset]
            ),
            None => format!(
                "length mismatch: expected {} bytes, got {}",
                expected.len(),
                actual.len()
            ),
        };
        self.push(description, false, Some(detail))
    }

    /// Record that two references point at the same object.
    pub fn record_same<T: ?Sized>(&mut self, a: &T, b: &T, description: impl Into<String>) -> bool {
        let same = std::ptr::eq(a, b);
        let detail = (!same).then(|| "references point at different objects".to_string());
        self.push(description, same, detail)
    }

    /// Record that `f` panics. The panic is contained here.
    pub fn record_panics<F, R>(&mut self, description: impl Into<String>, f: F) -> bool
    where
        F: FnOnce() -> R,
    {
        let panicked = catch_unwind(AssertUnwindSafe(f)).is_err();
        let detail = (!panicked).then(|| "expected a panic, call returned normally".to_string());
        self.push(description, panicked, detail)
    }

    /// Record `condition` and stop the case when it does not hold.
    ///
    /// The returned error is meant to be propagated with `?`; the runner
    /// classifies a case halted this way as failed rather than errored.
    pub fn require(&mut self, condition: bool, description: impl Into<String>) -> Result<(), CaseError> {
        let description = description.into();
        if self.record_true(condition, description.clone()) {
            Ok(())
        } else {
            Err(CaseError::RequirementFailed { description })
        }
    }

    /// All recorded outcomes, in order.
    #[must_use]
    pub fn results(&self) -> &[AssertionResult] {
        &self.results
    }

    /// Only the failed outcomes.
    pub fn failures(&self) -> impl Iterator<Item = &AssertionResult> {
        self.results.iter().filter(|r| !r.passed)
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.failures().count()
    }

    /// Pass/fail/total counts.
    #[must_use]
    pub fn summarize(&self) -> AssertionSummary {
        let total = self.total_count();
        let failed = self.failure_count();
        AssertionSummary {
            passed: total - failed,
            failed,
            total,
        }
    }
}

/// Record a boolean check, using the expression text as description.
#[macro_export]
macro_rules! check {
    ($recorder:expr, $cond:expr $(,)?) => {
        $recorder.record_true($cond, stringify!($cond))
    };
    ($recorder:expr, $cond:expr, $($msg:tt)+) => {
        $recorder.record_true($cond, format!($($msg)+))
    };
}

/// Record an equality check, using the expression text as description.
#[macro_export]
macro_rules! check_eq {
    ($recorder:expr, $actual:expr, $expected:expr $(,)?) => {
        $recorder.record_equals(
            $actual,
            $expected,
            concat!(stringify!($actual), " == ", stringify!($expected)),
        )
    };
    ($recorder:expr, $actual:expr, $expected:expr, $($msg:tt)+) => {
        $recorder.record_equals($actual, $expected, format!($($msg)+))
    };
}

/// Record an inequality check, using the expression text as description.
#[macro_export]
macro_rules! check_ne {
    ($recorder:expr, $actual:expr, $unexpected:expr $(,)?) => {
        $recorder.record_not_equals(
            $actual,
            $unexpected,
            concat!(stringify!($actual), " != ", stringify!($unexpected)),
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_check_does_not_stop_later_checks() {
        let mut rec = AssertionRecorder::new();
        assert!(!rec.record_equals(4, 5, "answer"));
        assert!(rec.record_true(true, "still running"));
        assert_eq!(rec.total_count(), 2);
        assert_eq!(rec.failure_count(), 1);
        assert_eq!(
            rec.results()[0].detail_message.as_deref(),
            Some("expected 5, got 4")
        );
    }

    #[test]
    fn counts_match_results() {
        let mut rec = AssertionRecorder::new();
        rec.record_true(false, "a");
        rec.record_false(false, "b");
        rec.record_not_equals("x", "x", "c");
        rec.record_some(&Some(1), "d");
        rec.record_none(&Some(2), "e");
        let summary = rec.summarize();
        assert_eq!(summary.total, rec.results().len());
        assert_eq!(summary.failed, rec.failures().count());
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.passed, 2);
    }

    #[test]
    fn deserialized_counts_follow_the_results() {
        let doc = serde_json::json!({
            "results": [
                { "description": "a", "passed": true },
                { "description": "b", "passed": false, "detail_message": "expected 1, got 2" },
                { "description": "c", "passed": false },
            ],
            "total_count": 10,
            "failure_count": 0,
        });
        let rec: AssertionRecorder = serde_json::from_value(doc).unwrap();
        assert_eq!(rec.total_count(), 3);
        assert_eq!(rec.failure_count(), 2);
        assert_eq!(rec.summarize().passed, 1);

        let back = serde_json::to_value(&rec).unwrap();
        assert!(back.get("failure_count").is_none());
    }

    #[test]
    fn near_rejects_nan_and_wide_deltas() {
        let mut rec = AssertionRecorder::new();
        assert!(rec.record_near(1.0005, 1.0, 0.001, "close"));
        assert!(!rec.record_near(1.1, 1.0, 0.001, "far"));
        assert!(!rec.record_near(f64::NAN, 1.0, 0.001, "nan"));
    }

    #[test]
    fn bytes_report_first_difference() {
        let mut rec = AssertionRecorder::new();
        rec.record_bytes_equal(&[1, 2, 9], &[1, 2, 3], "diff");
        rec.record_bytes_equal(&[1, 2], &[1, 2, 3], "short");
        let details: Vec<_> = rec
            .failures()
            .map(|r| r.detail_message.clone().unwrap_or_default())
            .collect();
        assert_eq!(
            details[0],
            "first difference at offset 2: expected 0x03, got 0x09"
        );
        assert_eq!(details[1], "length mismatch: expected 3 bytes, got 2");
    }

    #[test]
    fn same_compares_identity_not_value() {
        let a = String::from("x");
        let b = String::from("x");
        let mut rec = AssertionRecorder::new();
        assert!(rec.record_same(&a, &a, "same"));
        assert!(!rec.record_same(&a, &b, "equal but distinct"));
    }

    #[test]
    fn record_panics_contains_the_panic() {
        let mut rec = AssertionRecorder::new();
        assert!(rec.record_panics("boom", || panic!("boom")));
        assert!(!rec.record_panics("quiet", || 1 + 1));
        assert_eq!(rec.failure_count(), 1);
    }

    #[test]
    fn require_records_and_halts() {
        let mut rec = AssertionRecorder::new();
        assert!(rec.require(true, "ok").is_ok());
        let err = rec.require(false, "buffer allocated").unwrap_err();
        assert!(matches!(err, CaseError::RequirementFailed { .. }));
        assert_eq!(rec.failure_count(), 1);
    }

    #[test]
    fn macros_stringify_expressions() {
        let mut rec = AssertionRecorder::new();
        let x = 2;
        check_eq!(rec, x + 2, 5);
        check!(rec, x > 1);
        check_ne!(rec, x, 3);
        assert_eq!(rec.results()[0].description, "x + 2 == 5");
        assert_eq!(rec.results()[1].description, "x > 1");
        assert_eq!(rec.results()[2].description, "x != 3");
        assert_eq!(rec.failure_count(), 1);
    }
}
