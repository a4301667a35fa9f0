//! Console reporting, exit-code mapping and machine-readable run reports.

use std::io::Write;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::runner::{Outcome, TestRunResult};

/// Aggregate counts across a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub total: usize,
}

impl RunSummary {
    #[must_use]
    pub fn from_results(results: &[TestRunResult]) -> Self {
        let count = |o: Outcome| results.iter().filter(|r| r.outcome == o).count();
        Self {
            passed: count(Outcome::Passed),
            failed: count(Outcome::Failed),
            errored: count(Outcome::Errored),
            total: results.len(),
        }
    }

    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} passed, {} failed, {} errored, {} total",
            self.passed, self.failed, self.errored, self.total
        )
    }
}

/// Deterministic text rendering and exit-code policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reporter {
    /// Also list notes under each case.
    pub show_notes: bool,
}

impl Reporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_notes(mut self, show: bool) -> Self {
        self.show_notes = show;
        self
    }

    /// Render one line per case, failure details, and the summary line.
    #[must_use]
    pub fn render(&self, results: &[TestRunResult]) -> String {
        let mut out = String::new();
        for r in results {
            out.push_str(&format!("{:<5} {}\n", r.outcome.label(), r.case_name));
            for failure in r.recorder.failures() {
                match &failure.detail_message {
                    Some(detail) => {
                        out.push_str(&format!("      - {}: {}\n", failure.description, detail));
                    }
                    None => out.push_str(&format!("      - {}\n", failure.description)),
                }
            }
            if let Some(error) = &r.error {
                out.push_str(&format!("      ! {error}\n"));
            }
            if self.show_notes {
                for note in &r.notes {
                    out.push_str(&format!("      ~ {note}\n"));
                }
            }
        }
        out.push_str(&RunSummary::from_results(results).to_string());
        out.push('\n');
        out
    }

    /// Write [`render`](Self::render) to `out`.
    pub fn report(&self, results: &[TestRunResult], out: &mut dyn Write) -> std::io::Result<()> {
        out.write_all(self.render(results).as_bytes())?;
        out.flush()
    }

    /// `0` when every case passed, `1` otherwise.
    #[must_use]
    pub fn exit_code(results: &[TestRunResult]) -> i32 {
        if results.iter().all(|r| r.outcome == Outcome::Passed) {
            0
        } else {
            1
        }
    }
}

/// A full run report combining summary, per-case results and a digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub title: String,
    pub suite: String,
    pub timestamp: String,
    pub summary: RunSummary,
    pub exit_code: i32,
    /// SHA-256 of the plain-text rendering; equal digests mean equal runs.
    pub text_sha256: String,
    pub results: Vec<TestRunResult>,
}

impl RunReport {
    #[must_use]
    pub fn new(
        title: impl Into<String>,
        suite: impl Into<String>,
        timestamp: impl Into<String>,
        results: Vec<TestRunResult>,
    ) -> Self {
        let text = Reporter::new().render(&results);
        Self {
            title: title.into(),
            suite: suite.into(),
            timestamp: timestamp.into(),
            summary: RunSummary::from_results(&results),
            exit_code: Reporter::exit_code(&results),
            text_sha256: sha256_hex(text.as_bytes()),
            results,
        }
    }

    /// Render the report as markdown.
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# {}\n\n", self.title));
        out.push_str(&format!("- Suite: {}\n", self.suite));
        out.push_str(&format!("- Timestamp: {}\n", self.timestamp));
        out.push_str(&format!("- Total: {}\n", self.summary.total));
        out.push_str(&format!("- Passed: {}\n", self.summary.passed));
        out.push_str(&format!("- Failed: {}\n", self.summary.failed));
        out.push_str(&format!("- Errored: {}\n", self.summary.errored));
        out.push_str(&format!("- Digest: `{}`\n\n", self.text_sha256));

        out.push_str("| Case | Checks | Failed | Status |\n");
        out.push_str("|------|--------|--------|--------|\n");
        for r in &self.results {
            out.push_str(&format!(
                "| {} | {} | {} | {} |\n",
                r.case_name,
                r.recorder.total_count(),
                r.recorder.failure_count(),
                r.outcome.label()
            ));
        }
        out
    }

    /// Render the report as JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::AssertionRecorder;

    fn result(name: &str, outcome: Outcome, rec: AssertionRecorder) -> TestRunResult {
        TestRunResult {
            case_name: name.to_string(),
            outcome,
            recorder: rec,
            error: None,
            notes: Vec::new(),
            duration_ms: 0,
        }
    }

    fn sample() -> Vec<TestRunResult> {
        let mut failing = AssertionRecorder::new();
        failing.record_equals(4, 5, "answer");
        let mut errored = result("faulty", Outcome::Errored, AssertionRecorder::new());
        errored.error = Some("panicked: boom".to_string());
        errored.notes.push("binding 'x' was still active".to_string());
        vec![
            result("good", Outcome::Passed, AssertionRecorder::new()),
            result("bad", Outcome::Failed, failing),
            errored,
        ]
    }

    #[test]
    fn render_lists_cases_details_and_summary() {
        let text = Reporter::new().render(&sample());
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "PASS  good");
        assert_eq!(lines[1], "FAIL  bad");
        assert_eq!(lines[2], "      - answer: expected 5, got 4");
        assert_eq!(lines[3], "ERROR faulty");
        assert_eq!(lines[4], "      ! panicked: boom");
        assert_eq!(lines[5], "1 passed, 1 failed, 1 errored, 3 total");
    }

    #[test]
    fn notes_only_shown_on_request() {
        let plain = Reporter::new().render(&sample());
        let noisy = Reporter::new().with_notes(true).render(&sample());
        assert!(!plain.contains("still active"));
        assert!(noisy.contains("      ~ binding 'x' was still active"));
    }

    #[test]
    fn exit_code_is_zero_only_when_all_pass() {
        let all = sample();
        assert_eq!(Reporter::exit_code(&all), 1);
        assert_eq!(Reporter::exit_code(&all[..1]), 0);
        assert_eq!(Reporter::exit_code(&[]), 0);
    }

    #[test]
    fn report_digest_is_deterministic() {
        let a = RunReport::new("Run", "unit", "t0", sample());
        let b = RunReport::new("Run", "unit", "t1", sample());
        assert_eq!(a.text_sha256, b.text_sha256);
        assert_eq!(a.text_sha256.len(), 64);
        assert_eq!(a.exit_code, 1);
    }

    #[test]
    fn report_renders_markdown_and_json() {
        let report = RunReport::new("Focal run", "unit", "2026-01-01T00:00:00Z", sample());
        let md = report.to_markdown();
        assert!(md.starts_with("# Focal run\n"));
        assert!(md.contains("| bad | 1 | 1 | FAIL |"));

        let parsed: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(parsed["summary"]["errored"], 1);
        assert_eq!(parsed["results"][1]["outcome"], "failed");
        assert_eq!(parsed["results"][0].get("error"), None);
    }
}
