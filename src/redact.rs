//! Credential scrubbing for captured remote output.
//!
//! A misbehaving remote command can echo its environment or the invocation
//! back at us; anything resembling the run's credential is replaced before
//! the text reaches a log, the console, or the JSON report.

use crate::config::Credential;

const REPLACEMENT: &str = "[redacted]";

/// Replaces known credential fragments in free-form text.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    needles: Vec<String>,
}

impl Redactor {
    pub fn new(needles: impl IntoIterator<Item = String>) -> Self {
        Self {
            needles: needles.into_iter().filter(|n| !n.is_empty()).collect(),
        }
    }

    /// Build the scrub list for a credential: the password itself, or the
    /// key path and its file name.
    pub fn for_credential(credential: &Credential) -> Self {
        match credential {
            Credential::Password(password) => Self::new([password.clone()]),
            Credential::KeyFile(path) => {
                let mut needles = vec![path.display().to_string()];
                if let Some(name) = path.file_name() {
                    needles.push(name.to_string_lossy().into_owned());
                }
                Self::new(needles)
            }
        }
    }

    /// Replace every needle occurrence in `text`.
    pub fn scrub(&self, text: &str) -> String {
        let mut out = text.to_string();
        for needle in &self.needles {
            if out.contains(needle.as_str()) {
                out = out.replace(needle.as_str(), REPLACEMENT);
            }
        }
        out
    }
}
