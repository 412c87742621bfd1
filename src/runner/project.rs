//! The immutable set of definitions loaded once per invocation

use crate::config::{Config, HostPolicy};
use crate::error::{ConfigError, RunbookError};
use crate::runner::router::TaskTable;
use crate::runner::task::{Host, JobDefinition, TaskDefinition, DEFAULT_INTERPRETER};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything declared in a runbook file
#[derive(Debug, Clone)]
pub struct Project {
    pub name: Option<String>,
    pub usage: Option<String>,

    /// Directory of the config file; relative paths resolve against it
    pub base_dir: PathBuf,

    pub tasks: TaskTable,
    pub hosts: BTreeMap<String, Arc<Host>>,
    pub jobs: BTreeMap<String, JobDefinition>,

    /// Environment shared by every task
    pub env: Vec<(String, String)>,

    pub concurrency: Option<usize>,
    pub host_policy: HostPolicy,
}

impl Project {
    /// Build the definition tables from a validated configuration
    pub fn from_config(config: &Config, base_dir: &Path) -> Result<Self, RunbookError> {
        let interpreter: Vec<String> = config
            .interpreter
            .clone()
            .unwrap_or_else(|| DEFAULT_INTERPRETER.iter().map(|s| s.to_string()).collect());

        let mut tasks = TaskTable::new();
        for (key, task) in &config.tasks {
            tasks.insert(TaskDefinition::from_config(key, task, base_dir, &interpreter)?)?;
        }

        let hosts = config
            .hosts
            .iter()
            .map(|(name, host)| (name.clone(), Arc::new(Host::from_config(name, host))))
            .collect();

        let jobs = config
            .jobs
            .iter()
            .map(|(name, job)| (name.clone(), JobDefinition::from_config(name, job)))
            .collect();

        Ok(Project {
            name: config.name.clone(),
            usage: config.usage.clone(),
            base_dir: base_dir.to_path_buf(),
            tasks,
            hosts,
            jobs,
            env: config.env.clone(),
            concurrency: config.concurrency,
            host_policy: config.host_policy.unwrap_or_default(),
        })
    }

    /// Parse, validate and load YAML text; handy for embedding and tests
    pub fn from_yaml(yaml: &str, base_dir: &Path) -> Result<Self, RunbookError> {
        let config = crate::config::parse_config(yaml, None)?;
        crate::config::validate_config(&config)?;
        Self::from_config(&config, base_dir)
    }

    pub fn job(&self, name: &str) -> Result<&JobDefinition, ConfigError> {
        self.jobs
            .get(name)
            .ok_or_else(|| ConfigError::JobNotFound(name.to_string()))
    }
}
