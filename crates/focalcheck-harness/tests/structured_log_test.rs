//! Integration tests: structured run logs.
//!
//! Validates:
//! 1. A logged run writes one schema-valid JSONL line per event to disk.
//! 2. Case-end entries carry outcome, duration and failing checks.
//! 3. Interceptor notes surface as warn-level entries.
//! 4. Schema violations are reported with their line numbers.
//! 5. Suites and run ids containing `::` still produce valid logs.

use focalcheck_harness::structured_log::{
    LogEmitter, LogEntry, LogLevel, RunLogger, validate_log_file, validate_log_line,
};
use focalcheck_harness::{Outcome, ResponseScript, TestRegistry, TestRunner};
use serde_json::json;

fn sample_registry() -> TestRegistry {
    let mut registry = TestRegistry::new();
    registry
        .register("exhausts_script", |ctx| {
            let _read = ctx.interceptor().bind(
                "readFile",
                ResponseScript::sequence([json!([1]), json!([2])]),
            )?;
            for _ in 0..3 {
                ctx.interceptor().invoke("readFile", &())?;
            }
            Ok(())
        })
        .expect("register exhausts_script");
    registry
        .register("fails_a_check", |ctx| {
            ctx.recorder.record_equals("png", "gif", "format");
            Ok(())
        })
        .expect("register fails_a_check");
    registry
}

#[test]
fn logged_run_round_trips_through_validation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("run.jsonl");

    let mut registry = sample_registry();
    let emitter = LogEmitter::to_file(&path, "log-test", "run-1").expect("create log");
    let mut logger = RunLogger::new(emitter);
    let results = TestRunner::new("log-test").run_logged(&mut registry, &mut logger);
    logger.finish().expect("flush log");
    assert_eq!(results.len(), 2);

    let (line_count, errors) = validate_log_file(&path).expect("read log");
    assert!(errors.is_empty(), "{errors:?}");
    // run_start, 2 x (case_start, case_end), one exhaustion note, run_end
    assert_eq!(line_count, 7);

    let content = std::fs::read_to_string(&path).expect("read log");
    let entries: Vec<LogEntry> = content
        .lines()
        .map(|l| serde_json::from_str(l).expect("parse entry"))
        .collect();

    let trace_ids: Vec<_> = entries.iter().map(|e| e.trace_id.as_str()).collect();
    assert_eq!(trace_ids[0], "log-test::run-1::001");
    assert_eq!(trace_ids[6], "log-test::run-1::007");

    let note = entries
        .iter()
        .find(|e| e.event == "case_note")
        .expect("exhaustion note logged");
    assert_eq!(note.level, LogLevel::Warn);
    assert_eq!(note.case.as_deref(), Some("exhausts_script"));

    let failed = entries
        .iter()
        .find(|e| e.event == "case_end" && e.outcome == Some(Outcome::Failed))
        .expect("failed case_end");
    assert_eq!(failed.level, LogLevel::Warn);
    let details = failed.details.as_ref().expect("details");
    assert_eq!(
        details["failed_checks"][0],
        json!("format: expected \"gif\", got \"png\"")
    );

    let end = entries.last().expect("run_end");
    assert_eq!(end.event, "run_end");
    assert_eq!(end.exit_code, Some(1));
    assert_eq!(end.details.as_ref().map(|d| d["failed"].clone()), Some(json!(1)));
}

#[test]
fn violations_carry_line_numbers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("broken.jsonl");
    let good = LogEntry::new("s::r::001", LogLevel::Info, "run_start")
        .to_jsonl()
        .expect("serialize");
    let body = [
        good.as_str(),
        r#"{"timestamp":"t","trace_id":"s::r::002","level":"info","event":"case_end","case":"x"}"#,
        r#"{"timestamp":"t","trace_id":"s::r::003","level":"loud","event":"run_end"}"#,
    ]
    .join("\n");
    std::fs::write(&path, body).expect("write log");

    let (line_count, errors) = validate_log_file(&path).expect("read log");
    assert_eq!(line_count, 3);
    let located: Vec<_> = errors
        .iter()
        .map(|e| (e.line_number, e.field.as_str()))
        .collect();
    assert_eq!(located, [(2, "outcome"), (3, "level")]);
}

#[test]
fn nested_suite_names_produce_valid_logs() {
    let mut registry = sample_registry();
    let mut logger = RunLogger::new(LogEmitter::to_buffer("png::push", "2026-01-01T10::15"));
    let results = TestRunner::new("png::push").run_logged(&mut registry, &mut logger);
    assert_eq!(results.len(), 2);

    let text = logger
        .finish()
        .expect("flush log")
        .buffer_contents()
        .expect("buffered log");
    let mut lines = 0;
    for (i, line) in text.lines().enumerate() {
        let entry = validate_log_line(line, i + 1).expect("own log line is valid");
        assert!(entry.trace_id.starts_with("png::push::2026-01-01T10::15::"));
        lines += 1;
    }
    assert_eq!(lines, 7);
}
