//! Declaration-file loading
//!
//! Deployments declare their workflows and standalone tasks in a YAML
//! manifest. The CLI builds the in-memory registry from it at startup and
//! upserts the definitions into the store; after that only the scheduling
//! flags are admin-mutable.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use taskflow_core::definition::{DefinitionError, Task, TaskBuilder, Workflow};
use taskflow_core::registry::{Registry, RegistryError};

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read manifest: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

fn default_concurrency() -> u32 {
    1
}

fn default_max_retries() -> u32 {
    taskflow_core::definition::DEFAULT_MAX_RETRIES
}

fn default_timeout_seconds() -> u64 {
    taskflow_core::definition::DEFAULT_TIMEOUT.as_secs()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub workflows: Vec<WorkflowDecl>,
    #[serde(default)]
    pub tasks: Vec<TaskDecl>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDecl {
    pub name: String,
    #[serde(default)]
    pub active: bool,
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    pub sla_seconds: Option<u64>,
    pub schedule: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub default_priority: i32,
    #[serde(default)]
    pub tasks: Vec<TaskDecl>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskDecl {
    pub name: String,
    #[serde(default)]
    pub active: bool,
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    pub sla_seconds: Option<u64>,
    pub schedule: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub default_priority: i32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    pub params: Option<Value>,
    pub push_destination: Option<String>,
    #[serde(rename = "fn")]
    pub fn_def: Option<Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl Manifest {
    pub fn from_yaml(input: &str) -> Result<Self, ManifestError> {
        Ok(serde_yaml::from_str(input)?)
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    /// Build and validate every declaration into a populated registry.
    pub fn into_registry(self) -> Result<Registry, ManifestError> {
        let registry = Registry::new();
        for decl in self.workflows {
            registry.add_workflow(decl.build()?);
        }
        for decl in self.tasks {
            registry.add_task(decl.build_standalone()?)?;
        }
        Ok(registry)
    }
}

impl WorkflowDecl {
    fn build(self) -> Result<Workflow, DefinitionError> {
        let mut builder = Workflow::builder(&self.name)
            .active(self.active)
            .concurrency(self.concurrency)
            .default_priority(self.default_priority);
        if let Some(title) = self.title {
            builder = builder.title(title);
        }
        if let Some(description) = self.description {
            builder = builder.description(description);
        }
        if let Some(sla_seconds) = self.sla_seconds {
            builder = builder.sla(Duration::from_secs(sla_seconds));
        }
        if let Some(schedule) = self.schedule {
            builder = builder.schedule(schedule);
        }
        if let Some(start_date) = self.start_date {
            builder = builder.start_date(start_date);
        }
        if let Some(end_date) = self.end_date {
            builder = builder.end_date(end_date);
        }
        for task in self.tasks {
            builder = builder.task(task.into_builder());
        }
        builder.build()
    }
}

impl TaskDecl {
    fn into_builder(self) -> TaskBuilder {
        let mut builder = Task::builder(&self.name)
            .active(self.active)
            .concurrency(self.concurrency)
            .default_priority(self.default_priority)
            .max_retries(self.max_retries)
            .timeout(Duration::from_secs(self.timeout_seconds));
        if let Some(title) = self.title {
            builder = builder.title(title);
        }
        if let Some(description) = self.description {
            builder = builder.description(description);
        }
        if let Some(sla_seconds) = self.sla_seconds {
            builder = builder.sla(Duration::from_secs(sla_seconds));
        }
        if let Some(schedule) = self.schedule {
            builder = builder.schedule(schedule);
        }
        if let Some(start_date) = self.start_date {
            builder = builder.start_date(start_date);
        }
        if let Some(end_date) = self.end_date {
            builder = builder.end_date(end_date);
        }
        if let Some(params) = self.params {
            builder = builder.params(params);
        }
        if let Some(push_destination) = self.push_destination {
            builder = builder.push_destination(push_destination);
        }
        if let Some(fn_def) = self.fn_def {
            builder = builder.fn_def(fn_def);
        }
        for dependency in self.depends_on {
            builder = builder.depends_on(dependency);
        }
        builder
    }

    fn build_standalone(self) -> Result<Task, DefinitionError> {
        self.into_builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
workflows:
  - name: etl
    active: true
    schedule: "0 6 * * *"
    tasks:
      - name: extract
        active: true
        push_destination: batch
        fn:
          command: ["extract.sh"]
      - name: transform
        active: true
        push_destination: batch
        depends_on: [extract]
      - name: load
        active: true
        push_destination: batch
        max_retries: 3
        timeout_seconds: 900
        depends_on: [transform]
tasks:
  - name: vacuum
    active: true
    schedule: "30 2 * * *"
    push_destination: maintenance
"#;

    #[test]
    fn parses_and_builds_a_registry() {
        let manifest = Manifest::from_yaml(SAMPLE).unwrap();
        let registry = manifest.into_registry().unwrap();

        let etl = registry.get_workflow("etl").unwrap();
        assert!(etl.active());
        assert_eq!(etl.schedule().unwrap().expression(), "0 6 * * *");
        assert_eq!(etl.tasks().count(), 3);
        assert_eq!(etl.resolver().layers().len(), 3);

        let load = registry.get_task("load").unwrap();
        assert_eq!(load.max_retries(), 3);
        assert_eq!(load.timeout(), Duration::from_secs(900));
        assert_eq!(load.push_destination(), Some("batch"));

        let vacuum = registry.get_task("vacuum").unwrap();
        assert_eq!(vacuum.workflow(), None);
        assert_eq!(vacuum.schedule().unwrap().expression(), "30 2 * * *");
    }

    #[test]
    fn rejects_cyclic_declarations() {
        let cyclic = r#"
workflows:
  - name: broken
    tasks:
      - name: a
        depends_on: [b]
      - name: b
        depends_on: [a]
"#;
        let err = Manifest::from_yaml(cyclic).unwrap().into_registry().unwrap_err();
        assert!(matches!(err, ManifestError::Definition(_)));
    }

    #[test]
    fn rejects_unknown_fields() {
        let bogus = r#"
workflows:
  - name: w
    retries: 5
"#;
        assert!(Manifest::from_yaml(bogus).is_err());
    }
}
