//! Focal routines exercised by the focalcheck harness.
//!
//! - `checksum`: Adler-32, one-shot, incremental and combined
//! - `signature`: incremental PNG signature check over a [`signature::FileSource`]
//! - `rollback`: connection-wide rollback over [`rollback::RollbackHooks`]
//! - `suite`: the registered cases for all of the above

#![forbid(unsafe_code)]

pub mod checksum;
pub mod rollback;
pub mod signature;
pub mod suite;

pub use suite::{SUITE_NAME, register_all};
