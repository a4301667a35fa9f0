//! Fixture construction and teardown.
//!
//! A [`Fixture`] owns everything a focal routine needs from its environment:
//! a bounds-checked byte buffer, an optional temp directory with named files,
//! and any [`GlobalOverride`]s adopted from the case. All of it is released by
//! [`Fixture::teardown`], or by `Drop` if the case never got that far.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::case::NoteSink;

/// Configuration schema version accepted by [`Fixture::build`].
pub const FIXTURE_CONFIG_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("fixture config version {found} is not supported (expected {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("{initial} initial bytes do not fit a {buffer_size}-byte buffer")]
    InitialBytesExceedBuffer { initial: usize, buffer_size: usize },
    #[error("temp file name '{name}' must be a plain file name")]
    InvalidTempFileName { name: String },
    #[error("temp file '{name}' is declared twice")]
    DuplicateTempFile { name: String },
    #[error("range {offset}..{offset}+{len} is outside the {size}-byte buffer")]
    OutOfBounds { offset: usize, len: usize, size: usize },
    #[error("fixture '{label}' was already torn down")]
    TornDown { label: String },
    #[error("fixture io: {0}")]
    Io(#[from] std::io::Error),
    #[error("fixture config json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Non-fatal findings from teardown.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceLeakWarning {
    #[error("fixture '{label}' teardown called again; nothing left to release")]
    AlreadyReleased { label: String },
    #[error("fixture '{label}' was dropped without teardown; released on drop")]
    ReleasedOnDrop { label: String },
    #[error("fixture '{label}' could not remove {path}: {message}")]
    TempDirCleanup {
        label: String,
        path: String,
        message: String,
    },
}

/// A named file to materialize in the fixture's temp directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempFileSpec {
    pub name: String,
    pub contents: Vec<u8>,
}

/// Explicit description of a fixture. Nothing is read from ambient state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureConfig {
    /// Schema version; must equal [`FIXTURE_CONFIG_VERSION`].
    pub version: u32,
    /// Name used in warnings and errors.
    pub label: String,
    /// Size of the owned buffer; `initial_bytes` is zero-padded to it.
    pub buffer_size: usize,
    pub initial_bytes: Vec<u8>,
    /// Named options the routine under test may consult.
    #[serde(default)]
    pub flags: BTreeSet<String>,
    #[serde(default)]
    pub temp_files: Vec<TempFileSpec>,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            version: FIXTURE_CONFIG_VERSION,
            label: "fixture".to_string(),
            buffer_size: 0,
            initial_bytes: Vec::new(),
            flags: BTreeSet::new(),
            temp_files: Vec::new(),
        }
    }
}

impl FixtureConfig {
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set the initial bytes, growing the buffer to fit if it is smaller.
    #[must_use]
    pub fn with_initial_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.initial_bytes = bytes.into();
        self.buffer_size = self.buffer_size.max(self.initial_bytes.len());
        self
    }

    #[must_use]
    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.insert(flag.into());
        self
    }

    #[must_use]
    pub fn with_temp_file(mut self, name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.temp_files.push(TempFileSpec {
            name: name.into(),
            contents: contents.into(),
        });
        self
    }

    /// Load a config from JSON.
    pub fn from_json(json: &str) -> Result<Self, FixtureError> {
        Ok(serde_json::from_str(json)?)
    }

    fn validate(&self) -> Result<(), FixtureError> {
        if self.version != FIXTURE_CONFIG_VERSION {
            return Err(FixtureError::UnsupportedVersion {
                found: self.version,
                supported: FIXTURE_CONFIG_VERSION,
            });
        }
        if self.initial_bytes.len() > self.buffer_size {
            return Err(FixtureError::InitialBytesExceedBuffer {
                initial: self.initial_bytes.len(),
                buffer_size: self.buffer_size,
            });
        }
        let mut seen = BTreeSet::new();
        for spec in &self.temp_files {
            let name = spec.name.as_str();
            if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
                return Err(FixtureError::InvalidTempFileName {
                    name: spec.name.clone(),
                });
            }
            if !seen.insert(name) {
                return Err(FixtureError::DuplicateTempFile {
                    name: spec.name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Owned state for one focal-routine invocation.
pub struct Fixture {
    config: FixtureConfig,
    buffer: Vec<u8>,
    temp_dir: Option<tempfile::TempDir>,
    temp_paths: BTreeMap<String, PathBuf>,
    globals: Vec<Box<dyn Any>>,
    released: bool,
    warnings: Vec<ResourceLeakWarning>,
    sink: Option<NoteSink>,
}

impl std::fmt::Debug for Fixture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fixture")
            .field("label", &self.config.label)
            .field("buffer_len", &self.buffer.len())
            .field("temp_dir", &self.temp_dir.as_ref().map(tempfile::TempDir::path))
            .field("globals", &self.globals.len())
            .field("released", &self.released)
            .finish()
    }
}

impl Fixture {
    /// Validate `config` and acquire its resources.
    pub fn build(config: FixtureConfig) -> Result<Self, FixtureError> {
        config.validate()?;

        let mut buffer = config.initial_bytes.clone();
        buffer.resize(config.buffer_size, 0);

        let mut temp_dir = None;
        let mut temp_paths = BTreeMap::new();
        if !config.temp_files.is_empty() {
            let dir = tempfile::Builder::new().prefix("focalcheck-").tempdir()?;
            for spec in &config.temp_files {
                let path = dir.path().join(&spec.name);
                std::fs::write(&path, &spec.contents)?;
                temp_paths.insert(spec.name.clone(), path);
            }
            temp_dir = Some(dir);
        }

        Ok(Self {
            config,
            buffer,
            temp_dir,
            temp_paths,
            globals: Vec::new(),
            released: false,
            warnings: Vec::new(),
            sink: None,
        })
    }

    /// Route teardown warnings to a case's notes as well.
    #[must_use]
    pub(crate) fn with_sink(mut self, sink: NoteSink) -> Self {
        self.sink = Some(sink);
        self
    }

    #[must_use]
    pub fn config(&self) -> &FixtureConfig {
        &self.config
    }

    #[must_use]
    pub fn has_flag(&self, flag: &str) -> bool {
        self.config.flags.contains(flag)
    }

    /// The owned buffer (empty after teardown).
    #[must_use]
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    #[must_use]
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<std::ops::Range<usize>, FixtureError> {
        if self.released {
            return Err(FixtureError::TornDown {
                label: self.config.label.clone(),
            });
        }
        let size = self.buffer.len();
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(offset..end),
            _ => Err(FixtureError::OutOfBounds { offset, len, size }),
        }
    }

    pub fn read_at(&self, offset: usize, len: usize) -> Result<&[u8], FixtureError> {
        let range = self.check_range(offset, len)?;
        Ok(&self.buffer[range])
    }

    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<(), FixtureError> {
        let range = self.check_range(offset, bytes.len())?;
        self.buffer[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Path of a declared temp file, while the fixture is live.
    #[must_use]
    pub fn temp_path(&self, name: &str) -> Option<&Path> {
        self.temp_paths.get(name).map(PathBuf::as_path)
    }

    #[must_use]
    pub fn temp_dir(&self) -> Option<&Path> {
        self.temp_dir.as_ref().map(tempfile::TempDir::path)
    }

    /// Take ownership of a global override so teardown restores it.
    ///
    /// Overrides are restored in reverse adoption order.
    pub fn adopt_global<T: Send + 'static>(&mut self, global: GlobalOverride<T>) {
        self.globals.push(Box::new(global));
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Warnings raised so far.
    #[must_use]
    pub fn warnings(&self) -> &[ResourceLeakWarning] {
        &self.warnings
    }

    fn warn(&mut self, warning: ResourceLeakWarning) {
        if let Some(sink) = &self.sink {
            sink.push(warning.to_string());
        }
        self.warnings.push(warning);
    }

    /// Release everything [`build`](Self::build) acquired. Safe to call again.
    pub fn teardown(&mut self) {
        if self.released {
            let label = self.config.label.clone();
            self.warn(ResourceLeakWarning::AlreadyReleased { label });
            return;
        }
        self.released = true;

        while let Some(global) = self.globals.pop() {
            drop(global);
        }
        self.buffer = Vec::new();
        self.temp_paths.clear();
        if let Some(dir) = self.temp_dir.take() {
            let path = dir.path().display().to_string();
            if let Err(err) = dir.close() {
                let label = self.config.label.clone();
                self.warn(ResourceLeakWarning::TempDirCleanup {
                    label,
                    path,
                    message: err.to_string(),
                });
            }
        }
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        if !self.released {
            let label = self.config.label.clone();
            self.warn(ResourceLeakWarning::ReleasedOnDrop { label });
            self.teardown();
        }
    }
}

/// Scoped replacement of a process-wide value.
///
/// The previous value is put back when the override drops, so a case cannot
/// leak a modified global into the next one.
#[must_use = "dropping the override restores the previous value immediately"]
pub struct GlobalOverride<T: 'static> {
    slot: &'static Mutex<T>,
    previous: Option<T>,
}

impl<T: 'static> GlobalOverride<T> {
    pub fn set(slot: &'static Mutex<T>, value: T) -> Self {
        let previous = std::mem::replace(&mut *slot.lock(), value);
        Self {
            slot,
            previous: Some(previous),
        }
    }

    /// Run `f` against the current (overridden) value.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.slot.lock())
    }

    /// The value that will be restored.
    #[must_use]
    pub fn previous(&self) -> Option<&T> {
        self.previous.as_ref()
    }
}

impl<T: 'static> Drop for GlobalOverride<T> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            *self.slot.lock() = previous;
        }
    }
}
