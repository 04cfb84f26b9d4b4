//! JSON export of a finalized report.
//!
//! Writes go through a named temp file in the destination directory and an
//! atomic rename, so a crashed or failed write never leaves a partial
//! document behind.

use crate::report::{AggregateReport, HostResult};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to encode report: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Wire row for one host, borrowed from the finalized report.
///
/// The side a host does not have is `null`: output on failure, error on
/// success. An empty string means "captured, but empty".
#[derive(Serialize)]
struct HostRow<'a> {
    name: &'a str,
    ip: &'a str,
    username: &'a str,
    port: u16,
    ok: bool,
    output: Option<&'a str>,
    error: Option<&'a str>,
    exit_status: Option<i32>,
}

impl<'a> From<&'a HostResult> for HostRow<'a> {
    fn from(result: &'a HostResult) -> Self {
        Self {
            name: &result.name,
            ip: &result.address,
            username: &result.username,
            port: result.port,
            ok: result.ok,
            output: result.ok.then_some(result.output.as_str()),
            error: (!result.ok).then_some(result.error.as_str()),
            exit_status: result.exit_status,
        }
    }
}

/// Encode the report as a pretty-printed JSON array.
pub fn to_json_bytes(report: &AggregateReport) -> Result<Vec<u8>, PersistError> {
    let rows: Vec<HostRow<'_>> = report.results().iter().map(HostRow::from).collect();
    let mut bytes = serde_json::to_vec_pretty(&rows)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Atomically write the report to `path`.
pub fn write_json(report: &AggregateReport, path: &Path) -> Result<(), PersistError> {
    let bytes = to_json_bytes(report)?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let io_err = |source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    file.write_all(&bytes).map_err(io_err)?;
    file.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
