//! Unit-test harness for focal routines.
//!
//! This crate provides:
//! - Recorder: non-terminating checks that record instead of aborting
//! - Interception: scripted substitutes for a routine's external dependencies
//! - Fixtures: validated buffers and temp files with guaranteed teardown
//! - Runner: ordered, fault-isolated execution of registered cases
//! - Report generation: console summary, exit code, JSON/markdown reports
//! - Structured logging: JSONL run events plus schema validation

#![forbid(unsafe_code)]

pub mod case;
pub mod fixtures;
pub mod intercept;
pub mod recorder;
pub mod report;
pub mod runner;
pub mod structured_log;

pub use case::{CaseError, CaseResult, TestCase, TestContext};
pub use fixtures::{Fixture, FixtureConfig, FixtureError, GlobalOverride, ResourceLeakWarning};
pub use intercept::{BindingGuard, CallInterceptor, Dependency, InterceptError, ResponseScript};
pub use recorder::{AssertionRecorder, AssertionResult, AssertionSummary};
pub use report::{Reporter, RunReport, RunSummary};
pub use runner::{Outcome, TestRegistry, TestRunResult, TestRunner};
