//! Configuration loading, schema definitions and validation.
//!
//! This module provides types and functions for loading fleetrun
//! configuration from TOML files or strings, and the logical validation
//! that rejects strategy combinations the scheduler cannot honour.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;

/// Errors found while validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Preventive flaky executions and repeated shards would both multiply
    /// the same test, and results could not be merged.
    #[error(
        "Configuration is invalid: can't use complex sharding and complex flakiness strategy at the same time"
    )]
    ShardingWithFlakiness,

    /// Cached results can't participate in preventive flaky executions.
    #[error("Configuration is invalid: complex flakiness strategy and caching are not supported together")]
    FlakinessWithCache,

    #[error("Invalid regex '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Loads fleetrun configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use fleetrun::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("fleetrun.toml"))?;
/// println!("Uncompleted quota: {}", config.run.uncompleted_test_retry_quota);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads fleetrun configuration from a TOML string.
///
/// # Example
///
/// ```
/// use fleetrun::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [run]
///     strict_mode = true
/// "#)?;
///
/// assert!(config.run.strict_mode);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Checks the configuration for contradictions.
///
/// Runs before any pool starts; the scheduler assumes a validated
/// configuration.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    let strategies = &config.strategies;

    if !strategies.flakiness.is_trivial() && !strategies.sharding.is_trivial() {
        return Err(ConfigError::ShardingWithFlakiness);
    }
    if !strategies.flakiness.is_trivial() && config.run.cache_enabled {
        return Err(ConfigError::FlakinessWithCache);
    }

    if let BatchingConfig::FixedSize { size: 0 } = strategies.batching {
        return Err(ConfigError::InvalidValue {
            field: "strategies.batching.size",
            reason: "must be at least 1".to_string(),
        });
    }
    if let ShardingConfig::Count { count: 0 } = strategies.sharding {
        return Err(ConfigError::InvalidValue {
            field: "strategies.sharding.count",
            reason: "must be at least 1".to_string(),
        });
    }
    if config.run.test_batch_timeout_millis == 0 {
        return Err(ConfigError::InvalidValue {
            field: "run.test_batch_timeout_millis",
            reason: "must be positive".to_string(),
        });
    }

    compile_regexes(&config.run.ignore_crash_regexes)?;
    for filter in &config.strict_run_filter {
        if let Some(pattern) = filter.pattern() {
            compile_regex(pattern)?;
        }
    }

    Ok(())
}

/// Compiles a list of patterns, failing on the first invalid one.
pub fn compile_regexes(patterns: &[String]) -> Result<Vec<Regex>, ConfigError> {
    patterns.iter().map(|p| compile_regex(p)).collect()
}

/// Compiles one pattern in dot-matches-newline mode, so crash messages
/// spanning several lines match `.*`-style patterns.
pub fn compile_regex(pattern: &str) -> Result<Regex, ConfigError> {
    regex::RegexBuilder::new(pattern)
        .dot_matches_new_line(true)
        .build()
        .map_err(|source| ConfigError::InvalidRegex {
            pattern: pattern.to_string(),
            source,
        })
}

impl TestFilter {
    /// Returns the regex source of pattern-based filters.
    pub fn pattern(&self) -> Option<&str> {
        match self {
            TestFilter::FullyQualifiedClassName { regex }
            | TestFilter::SimpleClassName { regex }
            | TestFilter::Package { regex }
            | TestFilter::Method { regex }
            | TestFilter::Component { regex } => Some(regex),
            TestFilter::Annotation { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [run]
            uncompleted_test_retry_quota = 0
            ignore_crash_regexes = [".*SIGSEGV.*"]
            "#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.run.uncompleted_test_retry_quota, 0);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_config(Path::new("/nonexistent/fleetrun.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_rejects_sharding_with_flakiness() {
        let config = load_config_str(
            r#"
            [strategies.flakiness]
            type = "fixed"
            attempts = 2

            [strategies.sharding]
            type = "count"
            count = 2
            "#,
        )
        .unwrap();

        assert!(matches!(
            validate(&config),
            Err(ConfigError::ShardingWithFlakiness)
        ));
    }

    #[test]
    fn test_rejects_flakiness_with_cache() {
        let config = load_config_str(
            r#"
            [run]
            cache_enabled = true

            [strategies.flakiness]
            type = "fixed"
            attempts = 1
            "#,
        )
        .unwrap();

        assert!(matches!(
            validate(&config),
            Err(ConfigError::FlakinessWithCache)
        ));
    }

    #[test]
    fn test_rejects_invalid_regex() {
        let config = load_config_str(
            r#"
            [run]
            ignore_crash_regexes = ["(unclosed"]
            "#,
        )
        .unwrap();

        assert!(matches!(
            validate(&config),
            Err(ConfigError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let config = load_config_str(
            r#"
            [strategies.batching]
            type = "fixed-size"
            size = 0
            "#,
        )
        .unwrap();

        assert!(matches!(
            validate(&config),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_crash_regex_spans_lines() {
        let regex = compile_regex(".*SIGSEGV.*").unwrap();
        assert!(regex.is_match("Fatal signal\nProcess exited with signal 11 (SIGSEGV)\nbacktrace"));
    }
}
