//! The registered focal-routine suite run by the `harness` binary.
//!
//! Each routine receives its dependencies through a plain trait; the adapters
//! here route those traits through the case's [`CallInterceptor`] so cases
//! can script and observe them.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use focalcheck_harness::runner::RegistryError;
use focalcheck_harness::{
    BindingGuard, CallInterceptor, CaseError, Dependency, FixtureConfig,
    GlobalOverride, InterceptError, ResponseScript, TestContext, TestRegistry, check, check_eq,
};

use crate::checksum::{self, Adler32, BLOCK_LEN, adler32};
use crate::rollback::{
    Connection, FLAG_CORRUPT_RD_ONLY, FLAG_DEFER_FKS, HookError, RollbackHooks, TxnState,
    rollback_all,
};
use crate::signature::{
    self, FileSource, FsSource, PNG_SIGNATURE, SignatureError, probe, sig_cmp,
};

pub const SUITE_NAME: &str = "focal";

/// Dependency name of the signature reader's file access.
pub const READ_FILE: &str = "readFile";

/// Arguments of a [`READ_FILE`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub path: String,
    pub offset: usize,
    pub len: usize,
}

/// [`FileSource`] backed by the [`READ_FILE`] dependency.
#[derive(Debug, Clone)]
pub struct InterceptedFiles {
    read: Dependency,
}

impl InterceptedFiles {
    #[must_use]
    pub fn new(interceptor: &CallInterceptor) -> Self {
        Self {
            read: interceptor.dependency(READ_FILE),
        }
    }
}

impl FileSource for InterceptedFiles {
    fn read_file(&self, path: &str, offset: usize, len: usize) -> Result<Vec<u8>, SignatureError> {
        let request = ReadRequest {
            path: path.to_string(),
            offset,
            len,
        };
        self.read
            .call_as(&request)
            .map_err(|e| SignatureError::Read(e.to_string()))
    }
}

/// Real [`READ_FILE`]: reads from the filesystem.
fn read_file_real(args: &Value) -> Result<Value, String> {
    let request: ReadRequest = serde_json::from_value(args.clone()).map_err(|e| e.to_string())?;
    let bytes = std::fs::read(&request.path).map_err(|e| e.to_string())?;
    Ok(json!(signature::window(&bytes, request.offset, request.len)))
}

pub const HOOK_BEGIN_BENIGN_MALLOC: &str = "begin_benign_malloc";
pub const HOOK_END_BENIGN_MALLOC: &str = "end_benign_malloc";
pub const HOOK_ENTER_ALL: &str = "enter_all";
pub const HOOK_LEAVE_ALL: &str = "leave_all";
pub const HOOK_ROLLBACK_BTREE: &str = "rollback_btree";
pub const HOOK_ROLLBACK_VTABS: &str = "rollback_vtabs";
pub const HOOK_EXPIRE_STATEMENTS: &str = "expire_statements";
pub const HOOK_RESET_SCHEMAS: &str = "reset_schemas";
pub const HOOK_ROLLBACK_CALLBACK: &str = "rollback_callback";

pub const ROLLBACK_HOOKS: [&str; 9] = [
    HOOK_BEGIN_BENIGN_MALLOC,
    HOOK_END_BENIGN_MALLOC,
    HOOK_ENTER_ALL,
    HOOK_LEAVE_ALL,
    HOOK_ROLLBACK_BTREE,
    HOOK_ROLLBACK_VTABS,
    HOOK_EXPIRE_STATEMENTS,
    HOOK_RESET_SCHEMAS,
    HOOK_ROLLBACK_CALLBACK,
];

/// [`RollbackHooks`] where every hook is a named interceptor dependency.
#[derive(Debug, Clone)]
pub struct InterceptedHooks {
    interceptor: CallInterceptor,
}

impl InterceptedHooks {
    #[must_use]
    pub fn new(interceptor: &CallInterceptor) -> Self {
        Self {
            interceptor: interceptor.clone(),
        }
    }

    fn hit(&self, hook: &'static str, args: Value) -> Result<(), HookError> {
        self.interceptor
            .invoke(hook, &args)
            .map(drop)
            .map_err(|e| HookError {
                hook,
                message: e.to_string(),
            })
    }
}

impl RollbackHooks for InterceptedHooks {
    fn begin_benign_malloc(&mut self) -> Result<(), HookError> {
        self.hit(HOOK_BEGIN_BENIGN_MALLOC, Value::Null)
    }

    fn end_benign_malloc(&mut self) -> Result<(), HookError> {
        self.hit(HOOK_END_BENIGN_MALLOC, Value::Null)
    }

    fn enter_all(&mut self) -> Result<(), HookError> {
        self.hit(HOOK_ENTER_ALL, Value::Null)
    }

    fn leave_all(&mut self) -> Result<(), HookError> {
        self.hit(HOOK_LEAVE_ALL, Value::Null)
    }

    fn rollback_btree(
        &mut self,
        index: usize,
        trip_code: i32,
        reset_schema: bool,
    ) -> Result<(), HookError> {
        let args = json!({ "index": index, "trip_code": trip_code, "reset_schema": reset_schema });
        self.hit(HOOK_ROLLBACK_BTREE, args)
    }

    fn rollback_vtabs(&mut self) -> Result<(), HookError> {
        self.hit(HOOK_ROLLBACK_VTABS, Value::Null)
    }

    fn expire_statements(&mut self) -> Result<(), HookError> {
        self.hit(HOOK_EXPIRE_STATEMENTS, Value::Null)
    }

    fn reset_schemas(&mut self) -> Result<(), HookError> {
        self.hit(HOOK_RESET_SCHEMAS, Value::Null)
    }

    fn rollback_callback(&mut self) -> Result<(), HookError> {
        self.hit(HOOK_ROLLBACK_CALLBACK, Value::Null)
    }
}

/// Bind every rollback hook with the default response, except `failing`.
pub fn bind_rollback_hooks(
    interceptor: &CallInterceptor,
    failing: Option<&str>,
) -> Result<Vec<BindingGuard>, InterceptError> {
    ROLLBACK_HOOKS
        .iter()
        .map(|&name| {
            let script = if failing == Some(name) {
                ResponseScript::failing("injected hook failure")
            } else {
                ResponseScript::Default
            };
            interceptor.bind(name, script)
        })
        .collect()
}

/// Register the whole suite, including the real [`READ_FILE`].
pub fn register_all(registry: &mut TestRegistry) -> Result<(), RegistryError> {
    registry.provide_real(READ_FILE, read_file_real);
    register_checksum(registry)?;
    register_signature(registry)?;
    register_rollback(registry)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// checksum
// ---------------------------------------------------------------------------

fn register_checksum(registry: &mut TestRegistry) -> Result<(), RegistryError> {
    registry.register("checksum::empty_input_is_one", |ctx| {
        check_eq!(ctx.recorder, adler32(b""), 1);
        Ok(())
    })?;

    registry.register("checksum::known_vectors", |ctx| {
        check_eq!(ctx.recorder, adler32(b"abc"), 0x024d_0127);
        check_eq!(ctx.recorder, adler32(b"Wikipedia"), 0x11e6_0398);
        Ok(())
    })?;

    registry.register("checksum::incremental_over_fixture_buffer", |ctx| {
        let mut fx = ctx.fixture(
            FixtureConfig::new("adler-input")
                .with_buffer_size(64)
                .with_initial_bytes(b"focal routine under test".as_slice()),
        )?;
        let whole = adler32(fx.buffer());

        let mut state = Adler32::new();
        for offset in (0..fx.buffer().len()).step_by(10) {
            let len = (fx.buffer().len() - offset).min(10);
            state.update(fx.read_at(offset, len)?);
        }
        check_eq!(ctx.recorder, state.checksum(), whole);

        fx.write_at(0, b"F")?;
        check!(ctx.recorder, adler32(fx.buffer()) != whole);
        fx.teardown();
        Ok(())
    })?;

    registry.register("checksum::block_length_is_invisible", |ctx| {
        let data = vec![0xffu8; checksum::NMAX * 2 + 3];
        let expected = adler32(&data);

        let mut fx = ctx.fixture(FixtureConfig::new("block-length"))?;
        let block = GlobalOverride::set(&BLOCK_LEN, 1);
        check_eq!(ctx.recorder, block.previous().copied(), Some(checksum::NMAX));
        fx.adopt_global(block);
        check_eq!(ctx.recorder, adler32(&data), expected, "adler32 with 1-byte blocks");
        fx.teardown();
        Ok(())
    })?;

    registry.register("checksum::combine_joins_halves", |ctx| {
        let (left, right) = (b"non-terminating ".as_slice(), b"assertions".as_slice());
        let joined = checksum::combine(adler32(left), adler32(right), right.len() as u64);
        check_eq!(ctx.recorder, joined, adler32(&[left, right].concat()));
        Ok(())
    })?;

    Ok(())
}

// ---------------------------------------------------------------------------
// signature
// ---------------------------------------------------------------------------

fn png_header() -> Vec<u8> {
    [&PNG_SIGNATURE[..], b"\0\0\0\rIHDR".as_slice()].concat()
}

fn register_signature(registry: &mut TestRegistry) -> Result<(), RegistryError> {
    registry.register("signature::accepts_png_header", |ctx| {
        let read = ctx
            .interceptor()
            .bind(READ_FILE, ResponseScript::always(json!(png_header())))?;
        let files = InterceptedFiles::new(ctx.interceptor());

        check_eq!(ctx.recorder, probe(&files, "image.png"), Ok(1));
        check_eq!(ctx.recorder, read.call_count(), 1);
        check_eq!(
            ctx.recorder,
            read.last_arguments(),
            Some(json!({ "path": "image.png", "offset": 0, "len": 8 }))
        );
        Ok(())
    })?;

    registry.register("signature::partial_reads_resume_at_offset", |ctx| {
        let read = ctx.interceptor().bind(
            READ_FILE,
            ResponseScript::sequence([json!(PNG_SIGNATURE[..3]), json!(PNG_SIGNATURE[3..])]),
        )?;
        let files = InterceptedFiles::new(ctx.interceptor());

        check_eq!(ctx.recorder, probe(&files, "slow.png"), Ok(2));
        let calls = read.calls();
        ctx.recorder.require(calls.len() == 2, "two reads captured")?;
        check_eq!(ctx.recorder, &calls[1].arguments["offset"], &json!(3));
        check_eq!(ctx.recorder, &calls[1].arguments["len"], &json!(5));
        check!(ctx.recorder, calls[0].sequence < calls[1].sequence);
        Ok(())
    })?;

    registry.register("signature::foreign_bytes_are_rejected", |ctx| {
        let read = ctx
            .interceptor()
            .bind(READ_FILE, ResponseScript::always(json!([0x01, 0x02])))?;
        let files = InterceptedFiles::new(ctx.interceptor());

        let first = probe(&files, "a.bin");
        let second = probe(&files, "b.bin");
        check_eq!(ctx.recorder, read.call_count(), 2);
        check_eq!(ctx.recorder, &first, &second);
        check_eq!(ctx.recorder, first, Err(SignatureError::NotPng { offset: 0 }));
        Ok(())
    })?;

    registry.register("signature::ascii_damage_is_distinguished", |ctx| {
        let mut damaged = PNG_SIGNATURE;
        damaged[4] = b'\n';
        let _read = ctx
            .interceptor()
            .bind(READ_FILE, ResponseScript::always(json!(damaged)))?;
        let files = InterceptedFiles::new(ctx.interceptor());
        check_eq!(
            ctx.recorder,
            probe(&files, "ftp.png"),
            Err(SignatureError::AsciiConversion { offset: 4 })
        );
        Ok(())
    })?;

    registry.register("signature::truncated_file", |ctx| {
        let _read = ctx.interceptor().bind(
            READ_FILE,
            ResponseScript::sequence([json!(PNG_SIGNATURE[..3]), json!([])]),
        )?;
        let files = InterceptedFiles::new(ctx.interceptor());
        check_eq!(
            ctx.recorder,
            probe(&files, "cut.png"),
            Err(SignatureError::Truncated { len: 3 })
        );
        Ok(())
    })?;

    registry.register("signature::read_failure_is_reported", |ctx| {
        let _read = ctx
            .interceptor()
            .bind(READ_FILE, ResponseScript::failing("ENOENT"))?;
        let files = InterceptedFiles::new(ctx.interceptor());
        match probe(&files, "missing.png") {
            Err(SignatureError::Read(message)) => {
                check!(ctx.recorder, message.contains("ENOENT"), "message: {message}");
            }
            other => {
                ctx.recorder
                    .record_true(false, format!("expected read failure, got {other:?}"));
            }
        }
        Ok(())
    })?;

    registry.register("signature::unbound_reads_hit_the_filesystem", |ctx| {
        let mut fx = ctx.fixture(
            FixtureConfig::new("png-on-disk").with_temp_file("real.png", png_header()),
        )?;
        let path = fx
            .temp_path("real.png")
            .ok_or_else(|| CaseError::fault("temp file missing"))?
            .to_string_lossy()
            .into_owned();

        let files = InterceptedFiles::new(ctx.interceptor());
        check_eq!(ctx.recorder, probe(&files, &path), Ok(1));
        check_eq!(ctx.recorder, ctx.interceptor().call_count_for(READ_FILE), 0);

        let dir = fx
            .temp_dir()
            .ok_or_else(|| CaseError::fault("temp dir missing"))?;
        check_eq!(ctx.recorder, probe(&FsSource::new(dir), "real.png"), Ok(1));
        fx.teardown();
        Ok(())
    })?;

    registry.register("signature::sig_cmp_ranges", |ctx| {
        check!(ctx.recorder, sig_cmp(&PNG_SIGNATURE, 0, 8));
        check!(ctx.recorder, sig_cmp(&PNG_SIGNATURE, 4, 100));
        check!(ctx.recorder, !sig_cmp(&PNG_SIGNATURE, 8, 1));
        check!(ctx.recorder, !sig_cmp(&PNG_SIGNATURE, 0, 0));
        check!(ctx.recorder, !sig_cmp(b"\x89PNX", 0, 4));
        Ok(())
    })?;

    Ok(())
}

// ---------------------------------------------------------------------------
// rollback
// ---------------------------------------------------------------------------

fn count(ctx: &TestContext, hook: &str) -> usize {
    ctx.interceptor().call_count_for(hook)
}

fn first_sequence(ctx: &TestContext, hook: &str) -> Result<u64, CaseError> {
    ctx.interceptor()
        .calls_for(hook)
        .first()
        .map(|c| c.sequence)
        .ok_or_else(|| CaseError::fault(format!("hook '{hook}' was never called")))
}

fn register_rollback(registry: &mut TestRegistry) -> Result<(), RegistryError> {
    registry.register("rollback::no_btrees_fires_callback_outside_autocommit", |ctx| {
        let _hooks = bind_rollback_hooks(ctx.interceptor(), None)?;
        let mut conn = Connection {
            auto_commit: false,
            rollback_hook: true,
            ..Connection::default()
        };
        let summary = rollback_all(&mut conn, 12345, &mut InterceptedHooks::new(ctx.interceptor()))
            .map_err(|e| CaseError::fault(e.to_string()))?;

        check_eq!(ctx.recorder, count(ctx, HOOK_ROLLBACK_BTREE), 0);
        check_eq!(ctx.recorder, count(ctx, HOOK_ROLLBACK_VTABS), 1);
        check_eq!(ctx.recorder, count(ctx, HOOK_ROLLBACK_CALLBACK), 1);
        check!(ctx.recorder, summary.callback_fired);
        check!(ctx.recorder, !summary.was_writing);
        Ok(())
    })?;

    registry.register("rollback::write_txn_fires_callback_in_autocommit", |ctx| {
        let _hooks = bind_rollback_hooks(ctx.interceptor(), None)?;
        let mut conn = Connection {
            databases: vec![Some(TxnState::Read), Some(TxnState::Write)],
            auto_commit: true,
            rollback_hook: true,
            ..Connection::default()
        };
        let summary = rollback_all(&mut conn, 4, &mut InterceptedHooks::new(ctx.interceptor()))
            .map_err(|e| CaseError::fault(e.to_string()))?;

        check_eq!(ctx.recorder, count(ctx, HOOK_ROLLBACK_BTREE), 2);
        check_eq!(
            ctx.recorder,
            ctx.interceptor().last_arguments_for(HOOK_ROLLBACK_BTREE),
            Some(json!({ "index": 1, "trip_code": 4, "reset_schema": true }))
        );
        check!(ctx.recorder, summary.was_writing);
        check_eq!(ctx.recorder, count(ctx, HOOK_ROLLBACK_CALLBACK), 1);
        check_eq!(ctx.recorder, count(ctx, HOOK_RESET_SCHEMAS), 0);
        Ok(())
    })?;

    registry.register("rollback::read_only_autocommit_skips_callback", |ctx| {
        let _hooks = bind_rollback_hooks(ctx.interceptor(), None)?;
        let mut conn = Connection {
            databases: vec![Some(TxnState::Read)],
            auto_commit: true,
            rollback_hook: true,
            ..Connection::default()
        };
        rollback_all(&mut conn, 0, &mut InterceptedHooks::new(ctx.interceptor()))
            .map_err(|e| CaseError::fault(e.to_string()))?;
        check_eq!(ctx.recorder, count(ctx, HOOK_ROLLBACK_CALLBACK), 0);
        Ok(())
    })?;

    registry.register("rollback::schema_reset_runs_inside_the_locks", |ctx| {
        let _hooks = bind_rollback_hooks(ctx.interceptor(), None)?;
        let mut conn = Connection {
            databases: vec![Some(TxnState::Write)],
            schema_change_pending: true,
            ..Connection::default()
        };
        rollback_all(&mut conn, 0, &mut InterceptedHooks::new(ctx.interceptor()))
            .map_err(|e| CaseError::fault(e.to_string()))?;

        let enter = first_sequence(ctx, HOOK_ENTER_ALL)?;
        let btree = first_sequence(ctx, HOOK_ROLLBACK_BTREE)?;
        let expire = first_sequence(ctx, HOOK_EXPIRE_STATEMENTS)?;
        let reset = first_sequence(ctx, HOOK_RESET_SCHEMAS)?;
        let leave = first_sequence(ctx, HOOK_LEAVE_ALL)?;
        check!(ctx.recorder, enter < btree && btree < expire && expire < reset && reset < leave);
        check_eq!(
            ctx.recorder,
            ctx.interceptor().last_arguments_for(HOOK_ROLLBACK_BTREE),
            Some(json!({ "index": 0, "trip_code": 0, "reset_schema": false }))
        );
        Ok(())
    })?;

    registry.register("rollback::clears_deferred_state", |ctx| {
        let _hooks = bind_rollback_hooks(ctx.interceptor(), None)?;
        let mut conn = Connection {
            deferred_constraints: 5,
            deferred_immediate_constraints: 2,
            flags: FLAG_DEFER_FKS | FLAG_CORRUPT_RD_ONLY | 0x10,
            auto_commit: true,
            ..Connection::default()
        };
        rollback_all(&mut conn, 0, &mut InterceptedHooks::new(ctx.interceptor()))
            .map_err(|e| CaseError::fault(e.to_string()))?;
        check_eq!(ctx.recorder, conn.deferred_constraints, 0);
        check_eq!(ctx.recorder, conn.deferred_immediate_constraints, 0);
        check_eq!(ctx.recorder, conn.flags, 0x10);
        Ok(())
    })?;

    registry.register("rollback::hook_failure_stops_early", |ctx| {
        let _hooks = bind_rollback_hooks(ctx.interceptor(), Some(HOOK_ROLLBACK_VTABS))?;
        let mut conn = Connection {
            deferred_constraints: 5,
            ..Connection::default()
        };
        let result = rollback_all(&mut conn, 0, &mut InterceptedHooks::new(ctx.interceptor()));
        let err = match result {
            Ok(_) => {
                return Err(CaseError::RequirementFailed {
                    description: "rollback should fail when a hook fails".to_string(),
                });
            }
            Err(err) => err,
        };
        check_eq!(ctx.recorder, err.hook, HOOK_ROLLBACK_VTABS);
        check!(ctx.recorder, err.message.contains("injected hook failure"));
        check_eq!(ctx.recorder, count(ctx, HOOK_LEAVE_ALL), 0);
        check_eq!(ctx.recorder, conn.deferred_constraints, 5);
        Ok(())
    })?;

    Ok(())
}
