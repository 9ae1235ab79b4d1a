//! Captured script output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stream a record was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputSource {
    Stdout,
    Stderr,
}

impl OutputSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl fmt::Display for OutputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One chunk of script output.
///
/// Serializes as `{"content": ..., "timestamp": "<RFC 3339>", "source": "stdout"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub source: OutputSource,
}

impl OutputRecord {
    /// Creates a record stamped with the current time.
    pub fn new(source: OutputSource, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            timestamp: Utc::now(),
            source,
        }
    }

    pub fn stdout(content: impl Into<String>) -> Self {
        Self::new(OutputSource::Stdout, content)
    }

    pub fn stderr(content: impl Into<String>) -> Self {
        Self::new(OutputSource::Stderr, content)
    }
}
