//! Target registry: hosts file parsing and the SINCE cutoff.
//!
//! A targets file holds an optional leading `SINCE=<cutoff>` directive
//! followed by one host per line:
//!
//! ```text
//! SINCE=202511052000
//! PS1204, 10.40.2.15
//! PS1311, 10.40.2.31, service
//! BENCH-3, lab-bench-3.local, ubuntu, 2222
//! ```
//!
//! Blank lines and `#` comments are skipped. Parsing is strict: any
//! malformed line fails the whole file with its line number, and a file
//! with zero valid hosts never reaches the dispatcher.

use chrono::NaiveDateTime;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Inclusive lower bound on remote log timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinceCutoff {
    /// Consider every log line regardless of timestamp.
    AllTime,
    /// Consider lines at or after this local timestamp.
    At(NaiveDateTime),
}

/// Accepted absolute forms, tried in order.
const CUTOFF_FORMATS: &[&str] = &["%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M", "%Y/%m/%d %H:%M"];

impl SinceCutoff {
    /// Parse a cutoff value.
    ///
    /// Accepts `YYYYMMDDHHMM`, `YYYYMMDDHH` (minutes padded to 00), the
    /// formats in [`CUTOFF_FORMATS`] with or without minutes, and the
    /// all-time sentinels (`0`, `all`, empty).
    pub fn parse(text: &str) -> Option<Self> {
        let t = text.trim();
        if t.is_empty() || t == "0" || t.eq_ignore_ascii_case("all") {
            return Some(Self::AllTime);
        }

        if t.chars().all(|c| c.is_ascii_digit()) {
            let padded;
            let digits = match t.len() {
                12 => t,
                10 => {
                    padded = format!("{t}00");
                    &padded
                }
                _ => return None,
            };
            return NaiveDateTime::parse_from_str(digits, "%Y%m%d%H%M")
                .ok()
                .map(Self::At);
        }

        for format in CUTOFF_FORMATS {
            if let Ok(dt) = NaiveDateTime::parse_from_str(t, format) {
                return Some(Self::At(dt));
            }
        }

        // Hour-only variants ("2025-12-08 19").
        let with_minutes = format!("{t}:00");
        for format in CUTOFF_FORMATS {
            if let Ok(dt) = NaiveDateTime::parse_from_str(&with_minutes, format) {
                return Some(Self::At(dt));
            }
        }

        None
    }

    /// Wire form handed to the remote processor: `YYYYMMDDHHMM`, or `0`
    /// meaning no line is excluded.
    pub fn remote_arg(&self) -> String {
        match self {
            Self::AllTime => "0".to_string(),
            Self::At(dt) => dt.format("%Y%m%d%H%M").to_string(),
        }
    }
}

impl fmt::Display for SinceCutoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllTime => write!(f, "all time"),
            Self::At(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M")),
        }
    }
}

/// One target machine. Immutable after registry parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    /// Display name, normalized to uppercase, unique within the registry.
    pub name: String,
    /// IP address or resolvable hostname.
    pub address: String,
    /// Per-host username override.
    pub username: Option<String>,
    /// Per-host SSH port override.
    pub port: Option<u16>,
}

impl Host {
    /// Effective username given the run-wide default.
    pub fn username_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.username.as_deref().unwrap_or(default)
    }

    /// Effective port given the run-wide default.
    pub fn port_or(&self, default: u16) -> u16 {
        self.port.unwrap_or(default)
    }
}

/// Errors raised while loading a targets file.
#[derive(Debug, Error)]
pub enum HostsFileError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("line {line}: duplicate host name '{name}'")]
    DuplicateName { line: usize, name: String },

    #[error("line {line}: invalid port '{value}' (expected 1-65535)")]
    InvalidPort { line: usize, value: String },

    #[error("line {line}: unparseable SINCE cutoff '{value}'")]
    BadCutoff { line: usize, value: String },

    #[error("no valid hosts defined")]
    Empty,
}

/// The validated list of target hosts plus the collection cutoff.
#[derive(Debug, Clone)]
pub struct HostRegistry {
    since: SinceCutoff,
    hosts: Vec<Host>,
}

impl HostRegistry {
    /// Load and validate a targets file.
    pub fn from_path(path: &Path) -> Result<Self, HostsFileError> {
        let text = std::fs::read_to_string(path).map_err(|source| HostsFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&text)
    }

    /// Parse targets-file content.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(text: &str) -> Result<Self, HostsFileError> {
        let mut since: Option<SinceCutoff> = None;
        let mut hosts: Vec<Host> = Vec::new();
        let mut seen_entry = false;

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                if key.trim().eq_ignore_ascii_case("SINCE") {
                    if seen_entry || since.is_some() {
                        return Err(HostsFileError::Malformed {
                            line: line_no,
                            reason: "SINCE directive must be the first entry".to_string(),
                        });
                    }
                    since = Some(SinceCutoff::parse(value).ok_or_else(|| {
                        HostsFileError::BadCutoff {
                            line: line_no,
                            value: value.trim().to_string(),
                        }
                    })?);
                    seen_entry = true;
                    continue;
                }
            }

            seen_entry = true;
            let host = parse_host_line(line, line_no)?;
            if hosts
                .iter()
                .any(|existing| existing.name == host.name)
            {
                return Err(HostsFileError::DuplicateName {
                    line: line_no,
                    name: host.name,
                });
            }
            hosts.push(host);
        }

        if hosts.is_empty() {
            return Err(HostsFileError::Empty);
        }

        let since = since.unwrap_or_else(|| {
            warn!("targets file has no SINCE directive, collecting from all time");
            SinceCutoff::AllTime
        });

        Ok(Self { since, hosts })
    }

    pub fn since(&self) -> SinceCutoff {
        self.since
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

fn parse_host_line(line: &str, line_no: usize) -> Result<Host, HostsFileError> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 2 || parts.len() > 4 {
        return Err(HostsFileError::Malformed {
            line: line_no,
            reason: format!(
                "expected 'name, address[, username][, port]', got {} field(s)",
                parts.len()
            ),
        });
    }
    if parts.iter().any(|p| p.is_empty()) {
        return Err(HostsFileError::Malformed {
            line: line_no,
            reason: "empty field".to_string(),
        });
    }

    let name = parts[0].to_uppercase();
    let address = parts[1].to_string();
    if !is_plausible_address(&address) {
        return Err(HostsFileError::Malformed {
            line: line_no,
            reason: format!("implausible address '{address}'"),
        });
    }

    let username = parts.get(2).map(|u| u.to_string());
    let port = match parts.get(3) {
        Some(value) => Some(value.parse::<u16>().ok().filter(|p| *p > 0).ok_or_else(
            || HostsFileError::InvalidPort {
                line: line_no,
                value: value.to_string(),
            },
        )?),
        None => None,
    };

    Ok(Host {
        name,
        address,
        username,
        port,
    })
}

fn is_plausible_address(address: &str) -> bool {
    !address.is_empty()
        && address
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '-' | '_'))
}
