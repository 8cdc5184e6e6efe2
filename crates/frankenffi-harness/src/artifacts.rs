//! Report files and their SHA-256 artifact index.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use frankenffi_core::structured_log::now_utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::HarnessError;

/// A single artifact entry in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub path: String,
    pub kind: String,
    pub sha256: String,
    pub size_bytes: u64,
}

/// Integrity index for the files a run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactIndex {
    pub index_version: u32,
    pub run_id: String,
    pub generated_utc: String,
    pub artifacts: Vec<ArtifactEntry>,
}

impl ArtifactIndex {
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            index_version: 1,
            run_id: run_id.into(),
            generated_utc: now_utc(),
            artifacts: Vec::new(),
        }
    }

    /// Hash the file at `path` and record it.
    pub fn add_file(&mut self, path: &Path, kind: impl Into<String>) -> Result<&mut Self, HarnessError> {
        let data = std::fs::read(path)?;
        self.artifacts.push(ArtifactEntry {
            path: path.display().to_string(),
            kind: kind.into(),
            sha256: sha256_hex(&data),
            size_bytes: data.len() as u64,
        });
        Ok(self)
    }

    /// Re-hash every recorded file; returns the paths whose digest changed.
    pub fn verify(&self) -> Result<Vec<String>, HarnessError> {
        let mut mismatched = Vec::new();
        for entry in &self.artifacts {
            let data = std::fs::read(&entry.path)?;
            if !sha256_hex(&data).eq_ignore_ascii_case(&entry.sha256) {
                mismatched.push(entry.path.clone());
            }
        }
        Ok(mismatched)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Lowercase hex SHA-256 of `data`.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Where the index for a report at `output` goes: `report.json` -> `report.artifacts.json`.
#[must_use]
pub fn index_path(output: &Path) -> PathBuf {
    output.with_extension("artifacts.json")
}

/// Write `report` as pretty JSON to `output`, then write an artifact index
/// covering it and any `extra` files (such as the run's JSONL log).
pub fn write_report<R: Serialize>(
    report: &R,
    output: &Path,
    run_id: &str,
    extra: &[(&Path, &str)],
) -> Result<ArtifactIndex, HarnessError> {
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(output, format!("{json}\n"))?;

    let mut index = ArtifactIndex::new(run_id);
    index.add_file(output, "report")?;
    for (path, kind) in extra {
        index.add_file(path, *kind)?;
    }
    std::fs::write(index_path(output), format!("{}\n", index.to_json()?))?;
    Ok(index)
}
