//! Connection-wide transaction rollback driven through injectable hooks.
//!
//! [`rollback_all`] takes every b-tree lock, rolls each attached database
//! back, rolls virtual tables back, resets schemas when a schema change is
//! pending, clears deferred-constraint state and finally fires the rollback
//! callback when a transaction was actually open.

use thiserror::Error;

/// Deferred foreign-key checking is on.
pub const FLAG_DEFER_FKS: u64 = 0x1;
/// Corruption detected in a read-only database.
pub const FLAG_CORRUPT_RD_ONLY: u64 = 0x4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("hook '{hook}' failed: {message}")]
pub struct HookError {
    pub hook: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxnState {
    #[default]
    None,
    Read,
    Write,
}

/// The slice of connection state a rollback reads and rewrites.
#[derive(Debug, Clone, Default)]
pub struct Connection {
    /// One slot per attached database; `None` when no b-tree is open.
    pub databases: Vec<Option<TxnState>>,
    pub schema_change_pending: bool,
    pub init_busy: bool,
    pub auto_commit: bool,
    pub deferred_constraints: i64,
    pub deferred_immediate_constraints: i64,
    pub flags: u64,
    /// Whether a rollback callback is configured.
    pub rollback_hook: bool,
}

/// Collaborators the rollback calls out to.
pub trait RollbackHooks {
    fn begin_benign_malloc(&mut self) -> Result<(), HookError>;
    fn end_benign_malloc(&mut self) -> Result<(), HookError>;
    fn enter_all(&mut self) -> Result<(), HookError>;
    fn leave_all(&mut self) -> Result<(), HookError>;
    fn rollback_btree(
        &mut self,
        index: usize,
        trip_code: i32,
        reset_schema: bool,
    ) -> Result<(), HookError>;
    fn rollback_vtabs(&mut self) -> Result<(), HookError>;
    fn expire_statements(&mut self) -> Result<(), HookError>;
    fn reset_schemas(&mut self) -> Result<(), HookError>;
    fn rollback_callback(&mut self) -> Result<(), HookError>;
}

/// What a rollback did beyond calling its hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RollbackSummary {
    pub btrees_rolled_back: usize,
    pub was_writing: bool,
    pub schema_reset: bool,
    pub callback_fired: bool,
}

pub fn rollback_all(
    conn: &mut Connection,
    trip_code: i32,
    hooks: &mut dyn RollbackHooks,
) -> Result<RollbackSummary, HookError> {
    let mut summary = RollbackSummary::default();

    hooks.begin_benign_malloc()?;
    // Every b-tree lock is held across all per-database rollbacks.
    hooks.enter_all()?;
    let schema_change = conn.schema_change_pending && !conn.init_busy;

    for (index, slot) in conn.databases.iter().enumerate() {
        let Some(state) = slot else { continue };
        if *state == TxnState::Write {
            summary.was_writing = true;
        }
        hooks.rollback_btree(index, trip_code, !schema_change)?;
        summary.btrees_rolled_back += 1;
    }
    hooks.rollback_vtabs()?;
    hooks.end_benign_malloc()?;

    if schema_change {
        hooks.expire_statements()?;
        hooks.reset_schemas()?;
        summary.schema_reset = true;
    }
    hooks.leave_all()?;

    conn.deferred_constraints = 0;
    conn.deferred_immediate_constraints = 0;
    conn.flags &= !(FLAG_DEFER_FKS | FLAG_CORRUPT_RD_ONLY);

    if conn.rollback_hook && (summary.was_writing || !conn.auto_commit) {
        hooks.rollback_callback()?;
        summary.callback_fired = true;
    }
    Ok(summary)
}
