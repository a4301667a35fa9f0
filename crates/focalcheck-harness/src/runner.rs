//! Test registry and sequential execution engine.
//!
//! Cases run one at a time in registration order. Each gets a fresh
//! [`TestContext`]; panics and errors are caught at the case boundary so one
//! faulting case never stops the rest of the suite.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::case::{CaseError, CaseResult, TestCase, TestContext};
use crate::intercept::{RealFn, Response};
use crate::recorder::AssertionRecorder;
use crate::report::{Reporter, RunSummary};
use crate::structured_log::RunLogger;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a case named '{name}' is already registered")]
    DuplicateCase { name: String },
    #[error("case '{name}' cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        name: String,
        from: CaseState,
        to: CaseState,
    },
}

/// Lifecycle of a registered case within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseState {
    Pending,
    Running,
    Completed,
    Errored,
}

impl CaseState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored)
    }

    const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Errored)
        )
    }
}

/// Final classification of a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Passed,
    Failed,
    Errored,
}

impl Outcome {
    /// Console label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Passed => "PASS",
            Self::Failed => "FAIL",
            Self::Errored => "ERROR",
        }
    }
}

/// What the runner produced for one case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRunResult {
    pub case_name: String,
    pub outcome: Outcome,
    /// Snapshot of the case's recorder at the moment it finished.
    pub recorder: AssertionRecorder,
    /// Fault description for errored cases, or the halting requirement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Interceptor and fixture observations (not failures).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    pub duration_ms: u64,
}

/// Progress notifications emitted while a run is in flight.
#[derive(Debug, Clone, Copy)]
pub enum RunEvent<'a> {
    CaseStarted { index: usize, name: &'a str },
    CaseFinished { index: usize, result: &'a TestRunResult },
}

struct Entry {
    case: TestCase,
    state: CaseState,
}

impl Entry {
    fn advance(&mut self, next: CaseState) -> Result<(), RegistryError> {
        if !self.state.can_advance_to(next) {
            return Err(RegistryError::InvalidTransition {
                name: self.case.name().to_string(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Leave `Running` for a terminal state.
    fn settle(&mut self, terminal: CaseState) {
        debug_assert!(terminal.is_terminal());
        debug_assert!(self.state.can_advance_to(terminal));
        self.state = terminal;
    }
}

/// Ordered collection of cases plus the real implementations their
/// interceptors fall back to.
#[derive(Default)]
pub struct TestRegistry {
    entries: Vec<Entry>,
    reals: BTreeMap<String, RealFn>,
}

impl fmt::Debug for TestRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestRegistry")
            .field("cases", &self.names())
            .field("reals", &self.reals.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TestRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a case under a unique name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        action: impl Fn(&mut TestContext) -> CaseResult + 'static,
    ) -> Result<(), RegistryError> {
        self.add(TestCase::new(name, action))
    }

    pub fn add(&mut self, case: TestCase) -> Result<(), RegistryError> {
        if self.entries.iter().any(|e| e.case.name() == case.name()) {
            return Err(RegistryError::DuplicateCase {
                name: case.name().to_string(),
            });
        }
        self.entries.push(Entry {
            case,
            state: CaseState::Pending,
        });
        Ok(())
    }

    /// Behavior of `name` whenever a case has not bound it.
    pub fn provide_real(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&Value) -> Response + Send + Sync + 'static,
    ) {
        self.reals.insert(name.into(), Arc::new(f));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Case names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.case.name()).collect()
    }

    #[must_use]
    pub fn state_of(&self, name: &str) -> Option<CaseState> {
        self.entries
            .iter()
            .find(|e| e.case.name() == name)
            .map(|e| e.state)
    }

    fn reset_states(&mut self) {
        for entry in &mut self.entries {
            entry.state = CaseState::Pending;
        }
    }
}

/// Executes a registry and collects one result per executed case.
#[derive(Debug, Clone, Default)]
pub struct TestRunner {
    /// Name of the suite, used in logs and reports.
    pub suite: String,
    /// Only cases whose name contains this substring run.
    pub filter: Option<String>,
}

impl TestRunner {
    #[must_use]
    pub fn new(suite: impl Into<String>) -> Self {
        Self {
            suite: suite.into(),
            filter: None,
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    fn selects(&self, name: &str) -> bool {
        self.filter.as_deref().is_none_or(|f| name.contains(f))
    }

    /// Run every selected case in order.
    pub fn run(&self, registry: &mut TestRegistry) -> Vec<TestRunResult> {
        self.run_with(registry, |_| {})
    }

    /// Run every selected case in order, reporting progress to `on_event`.
    pub fn run_with(
        &self,
        registry: &mut TestRegistry,
        mut on_event: impl FnMut(RunEvent<'_>),
    ) -> Vec<TestRunResult> {
        registry.reset_states();
        let reals = registry.reals.clone();
        let mut results = Vec::with_capacity(registry.entries.len());

        for (index, entry) in registry.entries.iter_mut().enumerate() {
            if !self.selects(entry.case.name()) {
                continue;
            }
            on_event(RunEvent::CaseStarted {
                index,
                name: entry.case.name(),
            });
            let result = run_entry(entry, &reals);
            on_event(RunEvent::CaseFinished {
                index,
                result: &result,
            });
            results.push(result);
        }
        results
    }

    /// [`run_with`](Self::run_with), writing run and case events to `logger`.
    pub fn run_logged(
        &self,
        registry: &mut TestRegistry,
        logger: &mut RunLogger,
    ) -> Vec<TestRunResult> {
        let selected = registry.names().into_iter().filter(|n| self.selects(n)).count();
        logger.run_started(selected);
        let results = self.run_with(registry, |event| logger.observe(event));
        logger.run_finished(
            &RunSummary::from_results(&results),
            Reporter::exit_code(&results),
        );
        results
    }
}

fn run_entry(entry: &mut Entry, reals: &BTreeMap<String, RealFn>) -> TestRunResult {
    let name = entry.case.name().to_string();
    if let Err(err) = entry.advance(CaseState::Running) {
        return TestRunResult {
            case_name: name,
            outcome: Outcome::Errored,
            recorder: AssertionRecorder::new(),
            error: Some(err.to_string()),
            notes: Vec::new(),
            duration_ms: 0,
        };
    }

    let mut ctx = TestContext::new(name.clone(), reals.clone());
    let started = Instant::now();
    let body = catch_unwind(AssertUnwindSafe(|| entry.case.invoke(&mut ctx)));
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    let (recorder, notes) = ctx.finish();

    let (outcome, error) = match body {
        Ok(Ok(())) if recorder.failure_count() == 0 => (Outcome::Passed, None),
        Ok(Ok(())) => (Outcome::Failed, None),
        Ok(Err(err @ CaseError::RequirementFailed { .. })) => {
            (Outcome::Failed, Some(err.to_string()))
        }
        Ok(Err(err)) => (Outcome::Errored, Some(err.to_string())),
        Err(payload) => (
            Outcome::Errored,
            Some(format!("panicked: {}", panic_message(payload.as_ref()))),
        ),
    };

    let terminal = if outcome == Outcome::Errored {
        CaseState::Errored
    } else {
        CaseState::Completed
    };
    entry.settle(terminal);

    TestRunResult {
        case_name: name,
        outcome,
        recorder,
        error,
        notes,
        duration_ms,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
