//! Structured tuple extraction from remote processor output.
//!
//! The processor's lines are authoritative; nothing here re-derives fault
//! counts from raw log text. Output is split into `(count, code,
//! last-timestamp)` tuples plus exactly one trailing failure-summary tuple.

use crate::script::FAILURE_CATEGORY;
use thiserror::Error;

/// One already-aggregated line of processor output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultTuple {
    /// Occurrences since the cutoff.
    pub count: u64,
    /// Fault code, or [`FAILURE_CATEGORY`] for the trailing summary.
    pub code: String,
    /// Most recent matching timestamp, `-` when none.
    pub last_seen: String,
}

/// Parsed processor output for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorReport {
    /// Per-code tuples in the order the processor emitted them
    /// (count descending).
    pub faults: Vec<FaultTuple>,
    /// The trailing generic-failure summary.
    pub failures: FaultTuple,
}

impl ProcessorReport {
    /// Total emergency events across all codes.
    pub fn emcy_events(&self) -> u64 {
        self.faults.iter().map(|t| t.count).sum()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty processor output")]
    Empty,

    #[error("line {line}: malformed fault line '{text}'")]
    Malformed { line: usize, text: String },

    #[error("missing trailing failure summary line")]
    MissingFailureSummary,

    #[error("line {line}: unexpected line after failure summary")]
    TrailingGarbage { line: usize },
}

/// Split processor output into fault tuples plus the failure summary.
pub fn parse_processor_output(text: &str) -> Result<ProcessorReport, ParseError> {
    let mut faults = Vec::new();
    let mut failures: Option<FaultTuple> = None;
    let mut saw_line = false;

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        saw_line = true;
        if failures.is_some() {
            return Err(ParseError::TrailingGarbage { line: idx + 1 });
        }

        if let Some(tuple) = parse_failure_line(line) {
            failures = Some(tuple);
            continue;
        }

        faults.push(parse_fault_line(line, idx + 1)?);
    }

    if !saw_line {
        return Err(ParseError::Empty);
    }
    let failures = failures.ok_or(ParseError::MissingFailureSummary)?;
    Ok(ProcessorReport { faults, failures })
}

fn parse_fault_line(line: &str, line_no: usize) -> Result<FaultTuple, ParseError> {
    let malformed = || ParseError::Malformed {
        line: line_no,
        text: line.to_string(),
    };

    let mut fields = line.split_whitespace();
    let count = fields
        .next()
        .and_then(|c| c.parse::<u64>().ok())
        .ok_or_else(malformed)?;
    let code = fields.next().ok_or_else(malformed)?.to_string();
    let last_seen = fields.next().ok_or_else(malformed)?.to_string();
    if fields.next().is_some() {
        return Err(malformed());
    }

    Ok(FaultTuple {
        count,
        code,
        last_seen,
    })
}

/// `<count> SAOBO Errors <timestamp-or-dash>`; a missing timestamp is
/// normalized to `-`.
fn parse_failure_line(line: &str) -> Option<FaultTuple> {
    let (count_str, rest) = line.split_once(' ')?;
    let rest = rest.trim_start().strip_prefix(FAILURE_CATEGORY)?;
    let count = count_str.parse::<u64>().ok()?;
    let last_seen = rest.trim();
    Some(FaultTuple {
        count,
        code: FAILURE_CATEGORY.to_string(),
        last_seen: if last_seen.is_empty() {
            "-".to_string()
        } else {
            last_seen.to_string()
        },
    })
}
