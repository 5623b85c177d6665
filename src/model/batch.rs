//! Units of work: shards handed to pools and batches handed to devices.

use serde::{Deserialize, Serialize};

use super::test::{ComponentInfo, Test};

/// Errors raised when constructing a [`TestBatch`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BatchError {
    /// The tests of a batch belong to more than one component.
    #[error("Batch contains tests from different components: {0:?}")]
    MixedComponents(Vec<String>),

    /// The tests belong to a component other than the declared one.
    #[error("Expected all tests to belong to {expected} but found {found}")]
    ComponentMismatch { expected: String, found: String },
}

/// An ordered group of tests executed on one device as one unit.
///
/// All tests of a batch belong to the same [`ComponentInfo`]; the
/// constructor rejects anything else. Batch ids are random UUIDs and are
/// never reused within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestBatch {
    pub id: String,
    pub tests: Vec<Test>,
    pub component: ComponentInfo,
}

impl TestBatch {
    /// Creates a batch with a fresh id.
    pub fn new(tests: Vec<Test>, component: ComponentInfo) -> Result<Self, BatchError> {
        Self::with_id(uuid::Uuid::new_v4().to_string(), tests, component)
    }

    /// Creates a batch with an explicit id.
    pub fn with_id(
        id: impl Into<String>,
        tests: Vec<Test>,
        component: ComponentInfo,
    ) -> Result<Self, BatchError> {
        let mut components: Vec<&ComponentInfo> = tests.iter().map(|t| &t.component).collect();
        components.sort();
        components.dedup();

        if components.len() > 1 {
            return Err(BatchError::MixedComponents(
                components.iter().map(|c| c.name.clone()).collect(),
            ));
        }
        if let Some(found) = components.first()
            && **found != component
        {
            return Err(BatchError::ComponentMismatch {
                expected: component.name,
                found: found.name.clone(),
            });
        }

        Ok(Self {
            id: id.into(),
            tests,
            component,
        })
    }

    /// Builds a batch from tests that are known to share one component,
    /// using the component of the first test.
    pub fn from_tests(tests: Vec<Test>) -> Result<Self, BatchError> {
        let component = tests
            .first()
            .map(|t| t.component.clone())
            .unwrap_or_default();
        Self::new(tests, component)
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn contains(&self, test: &Test) -> bool {
        self.tests.contains(test)
    }
}

/// The work assigned to one device pool.
///
/// `tests` lists every execution the pool owes; a test may appear more
/// than once when the sharding strategy asks for repeated runs.
/// `flaky_tests` holds the additional preventive executions added by the
/// flakiness strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestShard {
    pub tests: Vec<Test>,
    #[serde(default)]
    pub flaky_tests: Vec<Test>,
}

impl TestShard {
    pub fn new(tests: Vec<Test>) -> Self {
        Self {
            tests,
            flaky_tests: Vec::new(),
        }
    }

    pub fn with_flaky_tests(mut self, flaky_tests: Vec<Test>) -> Self {
        self.flaky_tests = flaky_tests;
        self
    }

    /// Total number of executions this shard asks for.
    pub fn executions(&self) -> usize {
        self.tests.len() + self.flaky_tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty() && self.flaky_tests.is_empty()
    }
}
