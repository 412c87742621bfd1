//! Configuration validation
//!
//! Static checks that fail before any graph is built. Cycles are not
//! checked here since they depend on the active context; the graph
//! builder detects them on the resolved graph.

use crate::config::types::{Config, TaskConfig};
use crate::error::{ConfigError, ConfigResult};
use crate::runner::task::{split_task_key, Runtime, DEFAULT_INTERPRETER};
use crate::utils::parse_duration;
use std::collections::HashSet;

/// Validate a complete configuration
pub fn validate_config(config: &Config) -> ConfigResult<()> {
    if config.concurrency == Some(0) {
        return Err(ConfigError::Invalid(
            "concurrency must be greater than zero".to_string(),
        ));
    }
    if config.interpreter.as_ref().is_some_and(|i| i.is_empty()) {
        return Err(ConfigError::Invalid(
            "interpreter must not be empty".to_string(),
        ));
    }

    let known = known_task_names(config);
    for (key, task) in &config.tasks {
        validate_task(config, key, task, &known)?;
    }

    for (name, job) in &config.jobs {
        for step in &job.steps {
            if !known.contains(step.as_str()) {
                return Err(ConfigError::UnknownTask {
                    task: format!("job {}", name),
                    reference: step.clone(),
                });
            }
        }
        for needed in &job.needs {
            if !config.jobs.contains_key(needed) {
                return Err(ConfigError::JobNotFound(needed.clone()));
            }
        }
    }

    Ok(())
}

/// Every name a reference may use: task keys plus the base names of overrides
fn known_task_names(config: &Config) -> HashSet<&str> {
    let mut known = HashSet::new();
    for key in config.tasks.keys() {
        known.insert(key.as_str());
        known.insert(split_task_key(key).0);
    }
    known
}

/// Validate a single task
pub fn validate_task(
    config: &Config,
    key: &str,
    task: &TaskConfig,
    known: &HashSet<&str>,
) -> ConfigResult<()> {
    let references = task
        .needs
        .iter()
        .chain(&task.hooks.before)
        .chain(&task.hooks.after);
    for reference in references {
        if !known.contains(reference.as_str()) {
            return Err(ConfigError::UnknownTask {
                task: key.to_string(),
                reference: reference.clone(),
            });
        }
    }

    for host in &task.hosts {
        if !config.hosts.contains_key(host) {
            return Err(ConfigError::UnknownHost {
                task: key.to_string(),
                host: host.clone(),
            });
        }
    }

    let default_interpreter: Vec<String> = config
        .interpreter
        .clone()
        .unwrap_or_else(|| DEFAULT_INTERPRETER.iter().map(|s| s.to_string()).collect());
    let runtime = Runtime::from_config(task.runtime.as_deref(), &task.with, &default_interpreter)?;
    if runtime.is_container() && !task.hosts.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "task '{}' uses a container runtime and cannot target hosts",
            key
        )));
    }

    if let Some(crate::config::TimeoutValue::Text(text)) = &task.timeout {
        parse_duration(text).map_err(|e| ConfigError::InvalidTimeout {
            task: key.to_string(),
            error: e.to_string(),
        })?;
    }

    Ok(())
}
