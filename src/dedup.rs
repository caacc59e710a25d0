//! Content-addressed deduplication of attachment bytes.
//!
//! Two-tier scheme: a cheap `XxHash64` fingerprint over the first 1 KiB
//! shortlists candidates, and a streaming SHA-256 over the full contents
//! confirms them. The fingerprint alone is never enough to skip a copy —
//! distinct files can share a prefix.

use std::collections::HashMap;
use std::fs::File;
use std::hash::Hasher as _;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use twox_hash::XxHash64;

const FINGERPRINT_PREFIX_LEN: usize = 1024;
const SHA256_CHUNK_LEN: usize = 4096;

/// Fingerprint of the first [`FINGERPRINT_PREFIX_LEN`] bytes of a file.
pub fn fingerprint_file(path: &Path) -> io::Result<u64> {
    let mut file = File::open(path)?;
    let mut buf = [0u8; FINGERPRINT_PREFIX_LEN];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(&buf[..filled]);
    Ok(hasher.finish())
}

/// Hex digest of the full file contents, read in fixed-size chunks so large
/// videos never end up in memory at once.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; SHA256_CHUNK_LEN];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Process-lifetime table mapping fingerprints to the source files already
/// materialized under them.
///
/// Never persisted: each run starts empty and repopulates as it encounters
/// already-exported destinations and performs new copies. Owned by the
/// orchestrator and passed into each export call.
#[derive(Debug, Default)]
pub struct DedupIndex {
    entries: HashMap<u64, Vec<PathBuf>>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Source paths previously recorded under `fingerprint`, oldest first.
    pub fn candidates(&self, fingerprint: u64) -> &[PathBuf] {
        self.entries
            .get(&fingerprint)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Append `path` to the candidate list for `fingerprint`.
    pub fn record(&mut self, fingerprint: u64, path: PathBuf) {
        self.entries.entry(fingerprint).or_default().push(path);
    }

    /// Find a recorded candidate whose full contents are byte-identical to
    /// `source`, confirmed by SHA-256 of both sides.
    pub fn find_duplicate(&self, fingerprint: u64, source: &Path) -> io::Result<Option<&Path>> {
        let candidates = self.candidates(fingerprint);
        if candidates.is_empty() {
            return Ok(None);
        }
        let source_digest = sha256_file(source)?;
        for candidate in candidates {
            if sha256_file(candidate)? == source_digest {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }
}
