//! Strict-run detection.

use regex::Regex;

use crate::config::{self, Config, ConfigError, TestFilter};
use crate::model::Test;

/// Decides whether a test must pass on its very first attempt.
pub trait StrictRunChecker: Send + Sync {
    fn is_strict_run(&self, test: &Test) -> bool;
}

/// Strict when strict mode is on or any configured filter matches.
pub struct ConfigurationStrictRunChecker {
    strict_mode: bool,
    filters: Vec<CompiledFilter>,
}

enum CompiledFilter {
    FullyQualifiedClassName(Regex),
    SimpleClassName(Regex),
    Package(Regex),
    Method(Regex),
    Component(Regex),
    Annotation(String),
}

impl CompiledFilter {
    fn compile(filter: &TestFilter) -> Result<Self, ConfigError> {
        Ok(match filter {
            TestFilter::FullyQualifiedClassName { regex } => {
                CompiledFilter::FullyQualifiedClassName(anchored(regex)?)
            }
            TestFilter::SimpleClassName { regex } => CompiledFilter::SimpleClassName(anchored(regex)?),
            TestFilter::Package { regex } => CompiledFilter::Package(anchored(regex)?),
            TestFilter::Method { regex } => CompiledFilter::Method(anchored(regex)?),
            TestFilter::Component { regex } => CompiledFilter::Component(anchored(regex)?),
            TestFilter::Annotation { name } => CompiledFilter::Annotation(name.clone()),
        })
    }

    fn matches(&self, test: &Test) -> bool {
        match self {
            CompiledFilter::FullyQualifiedClassName(r) => r.is_match(&test.class_name()),
            CompiledFilter::SimpleClassName(r) => r.is_match(&test.class),
            CompiledFilter::Package(r) => r.is_match(&test.package),
            CompiledFilter::Method(r) => r.is_match(&test.method),
            CompiledFilter::Component(r) => r.is_match(&test.component.name),
            CompiledFilter::Annotation(name) => test.has_meta_property(name),
        }
    }
}

/// Filters match whole names, not substrings.
fn anchored(pattern: &str) -> Result<Regex, ConfigError> {
    config::compile_regex(&format!("^(?:{})$", pattern))
}

impl ConfigurationStrictRunChecker {
    pub fn new(strict_mode: bool, filters: &[TestFilter]) -> Result<Self, ConfigError> {
        let filters = filters
            .iter()
            .map(CompiledFilter::compile)
            .collect::<Result<_, _>>()?;
        Ok(Self {
            strict_mode,
            filters,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Self::new(config.run.strict_mode, &config.strict_run_filter)
    }
}

impl StrictRunChecker for ConfigurationStrictRunChecker {
    fn is_strict_run(&self, test: &Test) -> bool {
        self.strict_mode || self.filters.iter().any(|f| f.matches(test))
    }
}
