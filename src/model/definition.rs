//! Test definitions declared by a commit's definitions file.
//!
//! The file is either JSON or YAML with the shape
//! `{"build": {...}, "tests": [{...}, ...], "docker": {...}}`. The build entry is
//! always named `build`; a top-level `docker` block is inherited by every entry
//! that does not declare its own.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Name reserved for the build step of a commit.
pub const BUILD_TEST_NAME: &str = "build";

pub const DEFAULT_PERIOD_HOURS: f64 = 12.0;
pub const MAX_MACHINE_COUNT: u32 = 99;

#[derive(Error, Debug)]
pub enum DefinitionError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("test definition without a name")]
    MissingName,

    #[error("test '{0}' is defined more than once")]
    DuplicateTest(String),

    #[error("test '{test}' requests {count} machines (allowed 1..={MAX_MACHINE_COUNT})")]
    InvalidMachineCount { test: String, count: u32 },

    #[error("commit has no test definitions file")]
    Missing,
}

/// Shape of the machines a test needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineShape {
    #[serde(default = "default_machine_count")]
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores_min: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores_exact: Option<u32>,
    #[serde(default)]
    pub gpu: bool,
}

fn default_machine_count() -> u32 {
    1
}

fn default_period_hours() -> f64 {
    DEFAULT_PERIOD_HOURS
}

impl Default for MachineShape {
    fn default() -> Self {
        Self {
            count: default_machine_count(),
            cores_min: None,
            cores_exact: None,
            gpu: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub machines: MachineShape,
    #[serde(default, rename = "periodicTest")]
    pub periodic: bool,
    #[serde(default = "default_period_hours", rename = "periodicTestPeriodInHours")]
    pub period_hours: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<Value>,
}

impl TestDefinition {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            machines: MachineShape::default(),
            periodic: false,
            period_hours: DEFAULT_PERIOD_HOURS,
            docker: None,
        }
    }

    pub fn with_machines(mut self, machines: MachineShape) -> Self {
        self.machines = machines;
        self
    }

    pub fn with_periodic(mut self, period_hours: f64) -> Self {
        self.periodic = true;
        self.period_hours = period_hours;
        self
    }

    pub fn is_build(&self) -> bool {
        self.name == BUILD_TEST_NAME
    }

    pub fn period_seconds(&self) -> f64 {
        self.period_hours * 3600.0
    }

    fn validate(&self) -> Result<(), DefinitionError> {
        if self.name.is_empty() {
            return Err(DefinitionError::MissingName);
        }
        let count = self.machines.count;
        if count == 0 || count > MAX_MACHINE_COUNT {
            return Err(DefinitionError::InvalidMachineCount {
                test: self.name.clone(),
                count,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct DefinitionsFile {
    #[serde(default)]
    build: Option<TestDefinition>,
    #[serde(default)]
    tests: Vec<TestDefinition>,
    #[serde(default)]
    docker: Option<Value>,
}

/// Parse a definitions file. Content starting with `{` is read as JSON,
/// anything else as YAML.
pub fn parse_test_definitions(raw: &[u8]) -> Result<Vec<TestDefinition>, DefinitionError> {
    let first = raw.iter().find(|b| !b.is_ascii_whitespace());
    let file: DefinitionsFile = if first == Some(&b'{') {
        serde_json::from_slice(raw)?
    } else {
        serde_yaml::from_slice(raw)?
    };

    let mut definitions = Vec::with_capacity(file.tests.len() + 1);
    if let Some(mut build) = file.build {
        build.name = BUILD_TEST_NAME.to_string();
        definitions.push(build);
    }
    definitions.extend(file.tests);

    let mut seen = HashSet::new();
    for definition in &mut definitions {
        if definition.docker.is_none() {
            definition.docker = file.docker.clone();
        }
        definition.validate()?;
        if !seen.insert(definition.name.clone()) {
            return Err(DefinitionError::DuplicateTest(definition.name.clone()));
        }
    }

    Ok(definitions)
}
