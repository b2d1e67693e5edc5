//! # Write Results
//!
//! Summary the server returns for insert/update/replace/delete.

use serde::{Deserialize, Serialize};

/// Counts of what a write did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    #[serde(default)]
    pub inserted: u64,
    #[serde(default)]
    pub replaced: u64,
    #[serde(default)]
    pub unchanged: u64,
    #[serde(default)]
    pub deleted: u64,
    /// Targets that did not exist
    #[serde(default)]
    pub skipped: u64,
    #[serde(default)]
    pub errors: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_error: Option<String>,
    /// Keys generated for inserted documents without an `id`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generated_keys: Vec<String>,
}

impl WriteResult {
    /// True if no document failed
    pub fn is_ok(&self) -> bool {
        self.errors == 0
    }

    /// Record a failed document, keeping the first message
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors += 1;
        if self.first_error.is_none() {
            self.first_error = Some(message.into());
        }
    }

    /// Number of documents whose stored value changed
    pub fn changed(&self) -> u64 {
        self.inserted + self.replaced + self.deleted
    }
}
