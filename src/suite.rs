//! Executable test model and the bundle shipped to worker processes.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity of one executable test: owning unit plus test name.
///
/// Opaque beyond identity and equality; ordering exists only so tests can
/// key deterministic maps.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TestDescriptor {
    /// Unit the test belongs to.
    pub unit: String,
    /// Test name, unique within the unit.
    pub name: String,
}

impl TestDescriptor {
    /// Build a descriptor.
    pub fn new(unit: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.unit, self.name)
    }
}

/// Outcome of running one test once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestVerdict {
    /// The test passed.
    Pass,
    /// The test failed (assertion mismatch or trap).
    Fail,
}

/// What a test checks about its target invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Assertion {
    /// The invocation must return exactly this value.
    Expects(i64),
    /// Invoke only; any clean return passes. Coverage without assertion.
    None,
}

/// One executable test: invoke `target_method` on `target_unit` with
/// `args` and apply the assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    /// Test identity.
    pub descriptor: TestDescriptor,
    /// Unit holding the method under test.
    pub target_unit: String,
    /// Method under test, by name.
    pub target_method: String,
    /// Arguments passed to the method.
    pub args: Vec<i64>,
    /// Pass/fail criterion.
    pub assertion: Assertion,
}

impl TestCase {
    /// Build a test expecting an exact return value.
    pub fn expecting(
        descriptor: TestDescriptor,
        target_unit: impl Into<String>,
        target_method: impl Into<String>,
        args: Vec<i64>,
        expected: i64,
    ) -> Self {
        Self {
            descriptor,
            target_unit: target_unit.into(),
            target_method: target_method.into(),
            args,
            assertion: Assertion::Expects(expected),
        }
    }

    /// Build a test that merely invokes its target.
    pub fn invoking(
        descriptor: TestDescriptor,
        target_unit: impl Into<String>,
        target_method: impl Into<String>,
        args: Vec<i64>,
    ) -> Self {
        Self {
            descriptor,
            target_unit: target_unit.into(),
            target_method: target_method.into(),
            args,
            assertion: Assertion::None,
        }
    }
}

/// Everything a worker process needs at spawn: the encoded baseline units
/// and the full test suite. Written once per run; each job then ships only
/// the rewritten unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteBundle {
    /// Encoded baseline units.
    pub units: Vec<Vec<u8>>,
    /// All tests, in suite order.
    pub tests: Vec<TestCase>,
}

/// Bundle persistence errors.
#[derive(Debug, Error)]
pub enum BundleError {
    /// IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Encoding or decoding failure.
    #[error("bundle codec error: {0}")]
    Codec(#[from] bincode::Error),
}

impl SuiteBundle {
    /// Find a test case by descriptor.
    pub fn test(&self, descriptor: &TestDescriptor) -> Option<&TestCase> {
        self.tests.iter().find(|t| &t.descriptor == descriptor)
    }

    /// Write the bundle to `path`.
    pub fn write_to(&self, path: &Path) -> Result<(), BundleError> {
        let bytes = bincode::serialize(self)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Read a bundle back from `path`.
    pub fn read_from(path: &Path) -> Result<Self, BundleError> {
        let bytes = std::fs::read(path)?;
        Ok(bincode::deserialize(&bytes)?)
    }
}
