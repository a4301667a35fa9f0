//! Test cases and the per-case context handed to their bodies.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::fixtures::{Fixture, FixtureConfig, FixtureError};
use crate::intercept::{CallInterceptor, InterceptError, RealFn};
use crate::recorder::AssertionRecorder;

/// Errors a case body can return.
///
/// [`CaseError::RequirementFailed`] ends the case as failed; every other
/// variant ends it as errored.
#[derive(Debug, Error)]
pub enum CaseError {
    #[error("requirement failed: {description}")]
    RequirementFailed { description: String },
    #[error("{0}")]
    Fault(String),
    #[error(transparent)]
    Intercept(#[from] InterceptError),
    #[error(transparent)]
    Fixture(#[from] FixtureError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl CaseError {
    /// An unexpected fault raised by the code under test.
    pub fn fault(message: impl Into<String>) -> Self {
        Self::Fault(message.into())
    }
}

pub type CaseResult = Result<(), CaseError>;

/// Append-only list of observability notes shared by a case's collaborators.
#[derive(Debug, Clone, Default)]
pub struct NoteSink {
    notes: Arc<Mutex<Vec<String>>>,
}

impl NoteSink {
    pub fn push(&self, note: impl Into<String>) {
        self.notes.lock().push(note.into());
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.notes.lock().clone()
    }

    pub(crate) fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.notes.lock())
    }
}

/// Everything a case body may touch: its own recorder, interceptor and notes.
///
/// A fresh context is built for every case, so nothing leaks between cases.
#[derive(Debug)]
pub struct TestContext {
    case_name: String,
    /// Non-terminating checks for this case.
    pub recorder: AssertionRecorder,
    interceptor: CallInterceptor,
    notes: NoteSink,
}

impl TestContext {
    #[must_use]
    pub fn new(case_name: impl Into<String>, reals: BTreeMap<String, RealFn>) -> Self {
        Self {
            case_name: case_name.into(),
            recorder: AssertionRecorder::new(),
            interceptor: CallInterceptor::with_reals(reals),
            notes: NoteSink::default(),
        }
    }

    #[must_use]
    pub fn case_name(&self) -> &str {
        &self.case_name
    }

    #[must_use]
    pub fn interceptor(&self) -> &CallInterceptor {
        &self.interceptor
    }

    /// Build a fixture whose teardown warnings land in this case's notes.
    pub fn fixture(&self, config: FixtureConfig) -> Result<Fixture, FixtureError> {
        Ok(Fixture::build(config)?.with_sink(self.notes.clone()))
    }

    /// Leave a non-fatal observation in the case result.
    pub fn note(&self, note: impl Into<String>) {
        self.notes.push(note);
    }

    /// Release leftover bindings and collect every note raised during the case.
    pub(crate) fn finish(&mut self) -> (AssertionRecorder, Vec<String>) {
        for name in self.interceptor.release_all() {
            self.notes
                .push(format!("binding '{name}' was still active at case end; released"));
        }
        let mut notes = self.interceptor.take_notes();
        notes.extend(self.notes.take());
        (std::mem::take(&mut self.recorder), notes)
    }
}

type CaseFn = dyn Fn(&mut TestContext) -> CaseResult;

/// A named arrange/act/assert unit.
pub struct TestCase {
    name: String,
    action: Box<CaseFn>,
}

impl TestCase {
    pub fn new(
        name: impl Into<String>,
        action: impl Fn(&mut TestContext) -> CaseResult + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            action: Box::new(action),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn invoke(&self, ctx: &mut TestContext) -> CaseResult {
        (self.action)(ctx)
    }
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase").field("name", &self.name).finish()
    }
}
