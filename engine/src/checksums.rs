//! Checksum and verification functionality.
//!
//! This module provides:
//! - SHA-256 and BLAKE3 file digests
//! - Verification of a copied tree against its source before it replaces anything

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use tracing::debug;

use crate::error::{CopyError, EngineError};
use crate::fs_ops::{enumerate_tree, EntryKind};
use crate::progress::CancelToken;

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    /// SHA-256 (cryptographic, 256-bit)
    Sha256,
    /// BLAKE3 (modern, fast, 256-bit)
    Blake3,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => write!(f, "sha256"),
            Self::Blake3 => write!(f, "blake3"),
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "blake3" => Ok(Self::Blake3),
            other => Err(format!(
                "unknown checksum algorithm '{}', expected 'sha256' or 'blake3'",
                other
            )),
        }
    }
}

/// A computed checksum value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumValue {
    algorithm: ChecksumAlgorithm,
    hex: String,
}

impl ChecksumValue {
    pub fn new(algorithm: ChecksumAlgorithm, hex: String) -> Self {
        ChecksumValue { algorithm, hex }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for ChecksumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

/// Incremental digest over a byte stream
pub trait ChecksumHasher {
    fn update(&mut self, data: &[u8]);
    fn finalize(self: Box<Self>) -> ChecksumValue;
}

struct Sha256Hasher {
    hasher: sha2::Sha256,
}

impl ChecksumHasher for Sha256Hasher {
    fn update(&mut self, data: &[u8]) {
        use sha2::Digest;
        self.hasher.update(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        use sha2::Digest;
        let digest = self.hasher.finalize();
        ChecksumValue::new(ChecksumAlgorithm::Sha256, format!("{:x}", digest))
    }
}

struct Blake3Hasher {
    hasher: blake3::Hasher,
}

impl ChecksumHasher for Blake3Hasher {
    fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        ChecksumValue::new(
            ChecksumAlgorithm::Blake3,
            self.hasher.finalize().to_hex().to_string(),
        )
    }
}

/// Create a new hasher for the given algorithm
pub fn create_hasher(algorithm: ChecksumAlgorithm) -> Box<dyn ChecksumHasher> {
    match algorithm {
        ChecksumAlgorithm::Sha256 => Box::new(Sha256Hasher {
            hasher: sha2::Sha256::default(),
        }),
        ChecksumAlgorithm::Blake3 => Box::new(Blake3Hasher {
            hasher: blake3::Hasher::new(),
        }),
    }
}

/// Compute checksum for a file
pub fn compute_file_checksum(
    path: &Path,
    algorithm: ChecksumAlgorithm,
) -> Result<ChecksumValue, CopyError> {
    let mut file = File::open(path).map_err(|e| CopyError::io(path, e))?;
    checksum_reader(&mut file, path, algorithm)
}

/// Digest of everything `reader` yields. `path` names it in errors.
pub(crate) fn checksum_reader(
    reader: &mut dyn Read,
    path: &Path,
    algorithm: ChecksumAlgorithm,
) -> Result<ChecksumValue, CopyError> {
    let mut hasher = create_hasher(algorithm);
    let mut buffer = [0u8; 65536];

    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buffer[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CopyError::io(path, e)),
        }
    }
    Ok(hasher.finalize())
}

/// Check that `copy` holds every entry of `source` with matching sizes and,
/// when `algorithm` is set, matching digests.
///
/// Extra entries in `copy` are not an error.
pub fn verify_copy(
    source: &Path,
    copy: &Path,
    algorithm: Option<ChecksumAlgorithm>,
    cancel: &CancelToken,
) -> Result<(), EngineError> {
    let entries = enumerate_tree(source, copy)?;

    for entry in &entries {
        if cancel.is_cancelled() {
            return Err(CopyError::Cancelled.into());
        }

        let mismatch = |reason: String| EngineError::VerificationFailed {
            path: entry.destination_path.clone(),
            reason,
        };

        let metadata = match fs::symlink_metadata(&entry.destination_path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Links without a file target are not copied off Unix
                if entry.kind == EntryKind::Symlink && !cfg!(unix) {
                    continue;
                }
                return Err(mismatch("missing from copy".to_string()));
            }
            Err(e) => return Err(CopyError::io(&entry.destination_path, e).into()),
        };

        match entry.kind {
            EntryKind::Directory => {
                if !metadata.is_dir() {
                    return Err(mismatch("expected a directory".to_string()));
                }
            }
            EntryKind::Symlink => {}
            EntryKind::File => {
                if metadata.len() != entry.file_size {
                    return Err(mismatch(format!(
                        "size mismatch: expected {} bytes, found {}",
                        entry.file_size,
                        metadata.len()
                    )));
                }
                if let Some(algorithm) = algorithm {
                    let expected = compute_file_checksum(&entry.source_path, algorithm)?;
                    let actual = compute_file_checksum(&entry.destination_path, algorithm)?;
                    if expected != actual {
                        return Err(mismatch(format!(
                            "checksum mismatch: expected {}, found {}",
                            expected, actual
                        )));
                    }
                }
            }
        }
    }

    debug!(entries = entries.len(), "copy verified");
    Ok(())
}
