//! Core configuration types
//!
//! This module defines the data structures that represent a runbook.yml configuration file.

use serde::{Deserialize, Deserializer};
use serde_yaml::Value;
use std::collections::BTreeMap;

/// Top-level configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Application name (optional)
    #[serde(default)]
    pub name: Option<String>,

    /// Application usage description (optional)
    #[serde(default)]
    pub usage: Option<String>,

    /// Default interpreter for tasks without a runtime (e.g., ["sh", "-c"])
    #[serde(default)]
    pub interpreter: Option<Vec<String>>,

    /// Maximum number of tasks running at once (unbounded when absent)
    #[serde(default)]
    pub concurrency: Option<usize>,

    /// Whether tasks targeting the same host may run sessions concurrently
    #[serde(default)]
    pub host_policy: Option<HostPolicy>,

    /// Environment shared by every task
    #[serde(default, deserialize_with = "deserialize_env")]
    pub env: Vec<(String, String)>,

    /// Glob patterns of additional files whose tasks, jobs and hosts are merged in
    #[serde(default, deserialize_with = "deserialize_string_list")]
    pub include: Vec<String>,

    /// Remote hosts tasks may target
    #[serde(default)]
    pub hosts: BTreeMap<String, HostConfig>,

    /// Tasks, keyed by `name` or `name:context`
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskConfig>,

    /// Jobs aggregating tasks into pipelines
    #[serde(default)]
    pub jobs: BTreeMap<String, JobConfig>,
}

/// Policy for concurrent sessions against a single remote host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostPolicy {
    /// Sessions to the same host may overlap
    #[default]
    Parallel,
    /// At most one session per host at a time
    Serial,
}

impl std::str::FromStr for HostPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parallel" => Ok(HostPolicy::Parallel),
            "serial" => Ok(HostPolicy::Serial),
            other => Err(format!(
                "invalid host policy '{}': expected 'parallel' or 'serial'",
                other
            )),
        }
    }
}

/// A task definition
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskConfig {
    /// Description for listings
    #[serde(default, alias = "description", alias = "usage")]
    pub desc: Option<String>,

    /// Runtime selecting the execution backend (bash, python, docker, ...)
    #[serde(default)]
    pub runtime: Option<String>,

    /// Body of the task
    #[serde(default, deserialize_with = "deserialize_body")]
    pub run: String,

    /// Environment variables, later entries shadow earlier ones
    #[serde(default, deserialize_with = "deserialize_env")]
    pub env: Vec<(String, String)>,

    /// Dotenv files loaded in order
    #[serde(default, deserialize_with = "deserialize_dotenv")]
    pub dotenv: Vec<DotenvEntry>,

    /// Working directory, relative to the config file
    #[serde(default, alias = "dir")]
    pub cwd: Option<String>,

    /// Tasks that must finish before this one
    #[serde(default, deserialize_with = "deserialize_string_list")]
    pub needs: Vec<String>,

    /// Tasks fused around this one
    #[serde(default)]
    pub hooks: HooksConfig,

    /// Timeout such as "30s" or a number of seconds
    #[serde(default)]
    pub timeout: Option<TimeoutValue>,

    /// Condition expression deciding whether the task runs
    #[serde(default, rename = "if")]
    pub condition: Option<String>,

    /// Run even when a dependency failed
    #[serde(default)]
    pub force: bool,

    /// Remote hosts to run on (empty means local)
    #[serde(default, deserialize_with = "deserialize_string_list")]
    pub hosts: Vec<String>,

    /// Render `{{ ... }}` templates before execution
    #[serde(default)]
    pub template: bool,

    /// Backend parameters (container image, shell, ...)
    #[serde(default, deserialize_with = "deserialize_scalar_map")]
    pub with: BTreeMap<String, String>,

    /// Do not echo this task's output
    #[serde(default)]
    pub quiet: bool,

    /// Hide from `--list`
    #[serde(default)]
    pub private: bool,
}

/// Hook lists of a task
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HooksConfig {
    #[serde(default, deserialize_with = "deserialize_string_list")]
    pub before: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_string_list")]
    pub after: Vec<String>,
}

/// A dotenv source
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DotenvEntry {
    /// Path that must exist
    Path(String),

    /// Path with options
    Detailed {
        path: String,
        #[serde(default)]
        optional: bool,
    },
}

/// A timeout written as text or plain seconds
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TimeoutValue {
    Seconds(u64),
    Text(String),
}

/// A remote host
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostConfig {
    /// Address to connect to (defaults to the host's name)
    #[serde(default, alias = "hostname")]
    pub address: Option<String>,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default, deserialize_with = "deserialize_string_list")]
    pub tags: Vec<String>,
}

/// A job definition
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobConfig {
    #[serde(default, alias = "description")]
    pub desc: Option<String>,

    /// Tasks run in order
    #[serde(default, deserialize_with = "deserialize_string_list")]
    pub steps: Vec<String>,

    /// Jobs that must finish before this one
    #[serde(default, deserialize_with = "deserialize_string_list")]
    pub needs: Vec<String>,
}

/// Convert a YAML scalar to the string a shell would see
fn scalar_to_string(value: Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(format!("expected a scalar value, found {:?}", other)),
    }
}

/// Deserialize a body given either as a string or a list of lines
fn deserialize_body<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Sequence(seq) => {
            let lines = seq
                .into_iter()
                .map(scalar_to_string)
                .collect::<Result<Vec<_>, _>>()
                .map_err(D::Error::custom)?;
            Ok(lines.join("\n"))
        }
        Value::Null => Ok(String::new()),
        _ => Err(D::Error::custom("run must be a string or array")),
    }
}

/// Deserialize a single string or a list of strings
fn deserialize_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(vec![s]),
        Value::Sequence(seq) => seq
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                _ => Err(D::Error::custom("expected a list of strings")),
            })
            .collect(),
        Value::Null => Ok(Vec::new()),
        _ => Err(D::Error::custom("expected a string or a list of strings")),
    }
}

/// Deserialize an environment given as an ordered mapping or a list of
/// `KEY=VALUE` strings / single-entry mappings. Declaration order is kept.
fn deserialize_env<'de, D>(deserializer: D) -> Result<Vec<(String, String)>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    fn mapping_pairs(
        mapping: serde_yaml::Mapping,
        out: &mut Vec<(String, String)>,
    ) -> Result<(), String> {
        for (key, value) in mapping {
            let key = scalar_to_string(key)?;
            out.push((key, scalar_to_string(value)?));
        }
        Ok(())
    }

    let mut pairs = Vec::new();
    match Value::deserialize(deserializer)? {
        Value::Mapping(mapping) => mapping_pairs(mapping, &mut pairs).map_err(D::Error::custom)?,
        Value::Sequence(seq) => {
            for item in seq {
                match item {
                    Value::String(s) => {
                        let (key, value) = s.split_once('=').ok_or_else(|| {
                            D::Error::custom(format!("env entry '{}' must be KEY=VALUE", s))
                        })?;
                        pairs.push((key.trim().to_string(), value.to_string()));
                    }
                    Value::Mapping(mapping) => {
                        mapping_pairs(mapping, &mut pairs).map_err(D::Error::custom)?
                    }
                    _ => return Err(D::Error::custom("env entries must be KEY=VALUE or mappings")),
                }
            }
        }
        Value::Null => {}
        _ => return Err(D::Error::custom("env must be a mapping or a list")),
    }
    Ok(pairs)
}

/// Deserialize dotenv sources given as one entry or a list of entries
fn deserialize_dotenv<'de, D>(deserializer: D) -> Result<Vec<DotenvEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Value::deserialize(deserializer)? {
        Value::Sequence(seq) => seq
            .into_iter()
            .map(|item| DotenvEntry::deserialize(item).map_err(D::Error::custom))
            .collect(),
        Value::Null => Ok(Vec::new()),
        single => Ok(vec![DotenvEntry::deserialize(single).map_err(D::Error::custom)?]),
    }
}

/// Deserialize a mapping whose values are scalars of any type
fn deserialize_scalar_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Value::deserialize(deserializer)? {
        Value::Mapping(mapping) => mapping
            .into_iter()
            .map(|(k, v)| {
                let key = scalar_to_string(k).map_err(D::Error::custom)?;
                let value = scalar_to_string(v).map_err(D::Error::custom)?;
                Ok((key, value))
            })
            .collect(),
        Value::Null => Ok(BTreeMap::new()),
        _ => Err(D::Error::custom("with must be a mapping")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_simple_config() {
        let yaml = r#"
tasks:
  hello:
    desc: Say hello
    run: echo "hello"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.tasks.len(), 1);
        assert_eq!(config.tasks["hello"].run, "echo \"hello\"");
    }

    #[test]
    fn test_env_list_allows_shadowing() {
        let yaml = r#"
tasks:
  build:
    env:
      - ZED=1
      - ALPHA: two
      - ZED=3
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config.tasks["build"].env,
            vec![
                ("ZED".to_string(), "1".to_string()),
                ("ALPHA".to_string(), "two".to_string()),
                ("ZED".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn test_mapping_env_order_and_scalars() {
        let yaml = r#"
env:
  PORT: 8080
  DEBUG: true
  NAME: api
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let keys: Vec<&str> = config.env.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["PORT", "DEBUG", "NAME"]);
        assert_eq!(config.env[0].1, "8080");
        assert_eq!(config.env[1].1, "true");
    }

    #[test]
    fn test_deserialize_full_task() {
        let yaml = r#"
hosts:
  web1:
    address: 10.0.0.5
    user: deploy
    tags: [web]
tasks:
  deploy:prod:
    desc: Deploy to production
    runtime: bash
    run:
      - echo one
      - echo two
    dotenv:
      - .env
      - path: .env.local
        optional: true
    needs: build
    hooks:
      before: [lint]
      after: notify
    timeout: 30s
    if: "$CI == 'true'"
    force: true
    hosts: web1
    template: true
    with:
      retries: 3
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let task = &config.tasks["deploy:prod"];
        assert_eq!(task.run, "echo one\necho two");
        assert_eq!(task.needs, vec!["build"]);
        assert_eq!(task.hooks.before, vec!["lint"]);
        assert_eq!(task.hooks.after, vec!["notify"]);
        assert_eq!(task.timeout, Some(TimeoutValue::Text("30s".to_string())));
        assert_eq!(task.condition.as_deref(), Some("$CI == 'true'"));
        assert!(task.force && task.template);
        assert_eq!(task.hosts, vec!["web1"]);
        assert_eq!(task.with["retries"], "3");
        assert_eq!(
            task.dotenv,
            vec![
                DotenvEntry::Path(".env".to_string()),
                DotenvEntry::Detailed {
                    path: ".env.local".to_string(),
                    optional: true
                },
            ]
        );
        assert_eq!(config.hosts["web1"].user.as_deref(), Some("deploy"));
    }

    #[test]
    fn test_deserialize_jobs_and_policy() {
        let yaml = r#"
host_policy: serial
concurrency: 2
jobs:
  ci:
    steps: [lint, test]
    needs: setup
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.host_policy, Some(HostPolicy::Serial));
        assert_eq!(config.concurrency, Some(2));
        assert_eq!(config.jobs["ci"].steps, vec!["lint", "test"]);
        assert_eq!(config.jobs["ci"].needs, vec!["setup"]);
    }

    #[test]
    fn test_timeout_as_seconds() {
        let yaml = "tasks:\n  t:\n    timeout: 5\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.tasks["t"].timeout, Some(TimeoutValue::Seconds(5)));
    }
}
