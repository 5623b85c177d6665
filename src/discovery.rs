//! Loading the list of tests to run.
//!
//! fleetrun does not inspect test binaries itself; the build produces a
//! test list and the scheduler distributes it. Two formats are accepted.
//!
//! Plain text, one test per line. Trailing `@Name` words become meta
//! properties, which strict-run annotation filters match on. Blank lines
//! and lines starting with `#` are skipped:
//!
//! ```text
//! # smoke suite
//! com.example.LoginTest#validPassword
//! com.example.PaymentTest#refund @Strict
//! ```
//!
//! JSON, an array whose entries are either test ids or full test objects:
//!
//! ```json
//! [
//!   "com.example.LoginTest#validPassword",
//!   { "package": "com.example", "class": "PaymentTest", "method": "refund",
//!     "component": { "name": "payments" },
//!     "meta_properties": [{ "name": "Strict" }] }
//! ]
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

use crate::model::{ComponentInfo, MetaProperty, Test};

/// Result type for test list loading.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Errors raised while loading a test list.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// A line or entry is not a `package.Class#method` id.
    #[error("Invalid test id at line {line}: '{id}'")]
    InvalidTestId { line: usize, id: String },

    #[error("Failed to parse test list: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonEntry {
    Id(String),
    Test(Test),
}

/// Loads tests from a file, picking the format from its content.
pub fn load_tests(path: &Path) -> DiscoveryResult<Vec<Test>> {
    let content = std::fs::read_to_string(path)?;
    let tests = parse_tests(&content)?;
    info!("Loaded {} tests from {}", tests.len(), path.display());
    Ok(tests)
}

/// Parses either format. Content starting with `[` is read as JSON.
pub fn parse_tests(content: &str) -> DiscoveryResult<Vec<Test>> {
    if content.trim_start().starts_with('[') {
        parse_json(content)
    } else {
        parse_lines(content)
    }
}

/// Parses the plain text format.
pub fn parse_lines(content: &str) -> DiscoveryResult<Vec<Test>> {
    let mut tests = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut words = line.split_whitespace();
        let id = words.next().unwrap_or_default();
        let mut test = Test::parse(id, ComponentInfo::default()).ok_or_else(|| {
            DiscoveryError::InvalidTestId {
                line: index + 1,
                id: id.to_string(),
            }
        })?;
        for word in words {
            match word.strip_prefix('@') {
                Some(name) if !name.is_empty() => {
                    test = test.with_meta_property(MetaProperty::new(name));
                }
                _ => warn!("Ignoring '{}' after {} on line {}", word, id, index + 1),
            }
        }
        tests.push(test);
    }
    Ok(dedup(tests))
}

/// Parses the JSON format.
pub fn parse_json(content: &str) -> DiscoveryResult<Vec<Test>> {
    let entries: Vec<JsonEntry> = serde_json::from_str(content)?;
    let mut tests = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        match entry {
            JsonEntry::Test(test) => tests.push(test),
            JsonEntry::Id(id) => {
                let test = Test::parse(&id, ComponentInfo::default())
                    .ok_or(DiscoveryError::InvalidTestId { line: index + 1, id })?;
                tests.push(test);
            }
        }
    }
    Ok(dedup(tests))
}

/// Drops repeated tests, keeping the first occurrence.
fn dedup(tests: Vec<Test>) -> Vec<Test> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(tests.len());
    for test in tests {
        if seen.insert(test.clone()) {
            unique.push(test);
        } else {
            warn!("Test {} is listed more than once", test);
        }
    }
    unique
}
