//! Scenario runner for FrankenFFI.
//!
//! Drives the core crates through end-to-end scenarios and produces JSON
//! reports plus SHA-256 artifact indexes:
//! - [`scenarios`]: request-scoped tasks, task storms, symbol probes
//! - [`artifacts`]: report files and their integrity index

pub mod artifacts;
pub mod scenarios;

use frankenffi_membrane::FfiError;
use thiserror::Error;

/// Anything a harness run can fail with.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Ffi(#[from] FfiError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
