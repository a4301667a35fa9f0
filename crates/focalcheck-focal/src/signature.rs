//! PNG signature probing over an injectable file reader.
//!
//! [`SignatureReader`] consumes the 8-byte signature incrementally, the way a
//! progressive decoder does: each step asks the source only for the bytes it
//! still needs and checks them as soon as they arrive.

use std::path::PathBuf;

use thiserror::Error;

/// The 8-byte PNG file signature.
pub const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("not a PNG file (mismatch at byte {offset})")]
    NotPng { offset: usize },
    #[error("PNG file corrupted by ASCII conversion (mismatch at byte {offset})")]
    AsciiConversion { offset: usize },
    #[error("file ended after {len} signature bytes")]
    Truncated { len: usize },
    #[error("read failed: {0}")]
    Read(String),
}

/// Where signature bytes come from.
pub trait FileSource {
    /// Up to `len` bytes of `path` starting at `offset`. An empty result
    /// means end of file.
    fn read_file(&self, path: &str, offset: usize, len: usize) -> Result<Vec<u8>, SignatureError>;
}

/// Reads straight from the filesystem, relative to `root`.
#[derive(Debug, Clone, Default)]
pub struct FsSource {
    pub root: PathBuf,
}

impl FsSource {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FileSource for FsSource {
    fn read_file(&self, path: &str, offset: usize, len: usize) -> Result<Vec<u8>, SignatureError> {
        let bytes =
            std::fs::read(self.root.join(path)).map_err(|e| SignatureError::Read(e.to_string()))?;
        Ok(window(&bytes, offset, len).to_vec())
    }
}

/// `bytes[offset..offset + len]`, clipped to what exists.
#[must_use]
pub fn window(bytes: &[u8], offset: usize, len: usize) -> &[u8] {
    let start = offset.min(bytes.len());
    let end = start.saturating_add(len).min(bytes.len());
    &bytes[start..end]
}

/// Compare `num_to_check` bytes of `sig` against the PNG signature, starting
/// at `start`. `num_to_check` is clamped to the signature length; an empty or
/// out-of-range request never matches.
#[must_use]
pub fn sig_cmp(sig: &[u8], start: usize, num_to_check: usize) -> bool {
    let mut num = num_to_check.min(PNG_SIGNATURE.len());
    if num == 0 || start >= PNG_SIGNATURE.len() {
        return false;
    }
    if start + num > PNG_SIGNATURE.len() {
        num = PNG_SIGNATURE.len() - start;
    }
    sig.get(start..start + num) == Some(&PNG_SIGNATURE[start..start + num])
}

/// Progress after one [`SignatureReader::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigProgress {
    Partial { have: usize },
    Complete,
}

#[derive(Debug, Clone)]
pub struct SignatureReader {
    path: String,
    sig: [u8; 8],
    sig_bytes: usize,
}

impl SignatureReader {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            sig: [0; 8],
            sig_bytes: 0,
        }
    }

    /// Signature bytes consumed so far.
    #[must_use]
    pub fn sig_bytes(&self) -> usize {
        self.sig_bytes
    }

    /// Fetch and check the next run of signature bytes.
    pub fn step(&mut self, source: &dyn FileSource) -> Result<SigProgress, SignatureError> {
        let start = self.sig_bytes;
        let wanted = PNG_SIGNATURE.len() - start;
        if wanted == 0 {
            return Ok(SigProgress::Complete);
        }

        let chunk = source.read_file(&self.path, start, wanted)?;
        let n = chunk.len().min(wanted);
        if n == 0 {
            return Err(SignatureError::Truncated { len: start });
        }
        self.sig[start..start + n].copy_from_slice(&chunk[..n]);
        self.sig_bytes += n;

        if !sig_cmp(&self.sig, start, n) {
            let offset = (start..start + n)
                .find(|&i| self.sig[i] != PNG_SIGNATURE[i])
                .unwrap_or(start);
            // The first four bytes are binary; later mismatches are CR/LF damage.
            return Err(if offset < 4 {
                SignatureError::NotPng { offset }
            } else {
                SignatureError::AsciiConversion { offset }
            });
        }

        if self.sig_bytes == PNG_SIGNATURE.len() {
            Ok(SigProgress::Complete)
        } else {
            Ok(SigProgress::Partial {
                have: self.sig_bytes,
            })
        }
    }
}

/// Read `path` through `source` until its signature is complete.
///
/// Returns the number of reads it took.
pub fn probe(source: &dyn FileSource, path: &str) -> Result<usize, SignatureError> {
    let mut reader = SignatureReader::new(path);
    let mut reads = 0;
    loop {
        reads += 1;
        if reader.step(source)? == SigProgress::Complete {
            return Ok(reads);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use super::*;

    struct Chunks(RefCell<VecDeque<Vec<u8>>>);

    impl FileSource for Chunks {
        fn read_file(&self, _: &str, _: usize, len: usize) -> Result<Vec<u8>, SignatureError> {
            let mut next = self.0.borrow_mut().pop_front().unwrap_or_default();
            next.truncate(len);
            Ok(next)
        }
    }

    fn chunks(parts: &[&[u8]]) -> Chunks {
        Chunks(RefCell::new(parts.iter().map(|p| p.to_vec()).collect()))
    }

    #[test]
    fn sig_cmp_clamps_ranges() {
        assert!(sig_cmp(&PNG_SIGNATURE, 0, 8));
        assert!(sig_cmp(&PNG_SIGNATURE, 0, 100));
        assert!(sig_cmp(&PNG_SIGNATURE, 6, 8));
        assert!(!sig_cmp(&PNG_SIGNATURE, 8, 1));
        assert!(!sig_cmp(&PNG_SIGNATURE, 0, 0));
        assert!(!sig_cmp(&PNG_SIGNATURE[..3], 0, 8));
        assert!(sig_cmp(b"\x89PN", 0, 3));
    }

    #[test]
    fn partial_reads_complete_the_signature() {
        let source = chunks(&[&PNG_SIGNATURE[..3], &PNG_SIGNATURE[3..]]);
        let mut reader = SignatureReader::new("img.png");
        assert_eq!(reader.step(&source), Ok(SigProgress::Partial { have: 3 }));
        assert_eq!(reader.step(&source), Ok(SigProgress::Complete));
        assert_eq!(reader.sig_bytes(), 8);
    }

    #[test]
    fn mismatch_classification() {
        let source = chunks(&[&b"GIF89a\0\0"[..]]);
        assert_eq!(probe(&source, "x"), Err(SignatureError::NotPng { offset: 0 }));

        let mut damaged = PNG_SIGNATURE;
        damaged[4] = b'\n';
        let source = chunks(&[&damaged[..]]);
        assert_eq!(
            probe(&source, "x"),
            Err(SignatureError::AsciiConversion { offset: 4 })
        );
    }

    #[test]
    fn eof_reports_truncation() {
        let source = chunks(&[&PNG_SIGNATURE[..5]]);
        assert_eq!(probe(&source, "x"), Err(SignatureError::Truncated { len: 5 }));
    }

    #[test]
    fn fs_source_reads_windows() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.png"), [&PNG_SIGNATURE[..], &b"IHDR"[..]].concat()).unwrap();
        let source = FsSource::new(dir.path());
        assert_eq!(probe(&source, "a.png"), Ok(1));
        assert_eq!(source.read_file("a.png", 8, 10).unwrap(), b"IHDR");
        assert!(matches!(
            source.read_file("missing.png", 0, 8),
            Err(SignatureError::Read(_))
        ));
    }
}
