//! Immutable runtime definitions built from the configuration
//!
//! These differ from the `config` types by having every reference split,
//! every duration parsed and the runtime resolved to a backend kind.

use crate::config::{self, DotenvEntry, TimeoutValue};
use crate::error::{ConfigError, ConfigResult};
use crate::utils::parse_duration;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Interpreter used when neither the task nor the file names one
pub const DEFAULT_INTERPRETER: &[&str] = &["sh", "-c"];

/// Split a task key into its base name and optional context qualifier.
///
/// The key is split at the last `:`; both halves must be non-empty to
/// count as a context override.
pub fn split_task_key(key: &str) -> (&str, Option<&str>) {
    match key.rsplit_once(':') {
        Some((name, context)) if !name.is_empty() && !context.is_empty() => (name, Some(context)),
        _ => (key, None),
    }
}

/// How a task body is executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Runtime {
    /// A local or remote interpreter invoked as `program args... body`
    Interpreter { program: String, args: Vec<String> },

    /// A container engine running `shell -c body` inside `image`
    Container {
        engine: String,
        image: String,
        shell: String,
    },
}

impl Runtime {
    /// Resolve the `runtime:` field of a task
    pub fn from_config(
        runtime: Option<&str>,
        with: &BTreeMap<String, String>,
        default_interpreter: &[String],
    ) -> ConfigResult<Self> {
        let Some(name) = runtime else {
            return Self::from_command_line(default_interpreter);
        };

        let interpreter = |program: &str, args: &[&str]| Runtime::Interpreter {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        };

        Ok(match name {
            "docker" | "podman" => {
                let image = with.get("image").cloned().ok_or_else(|| {
                    ConfigError::Invalid(format!("runtime '{}' requires `with.image`", name))
                })?;
                Runtime::Container {
                    engine: name.to_string(),
                    image,
                    shell: with.get("shell").cloned().unwrap_or_else(|| "sh".to_string()),
                }
            }
            "sh" | "bash" | "zsh" | "dash" | "ksh" | "fish" => interpreter(name, &["-c"]),
            "python" | "python3" => interpreter("python3", &["-c"]),
            "node" | "nodejs" => interpreter("node", &["-e"]),
            "deno" => interpreter("deno", &["eval"]),
            "ruby" => interpreter("ruby", &["-e"]),
            "perl" => interpreter("perl", &["-e"]),
            "pwsh" | "powershell" => interpreter("pwsh", &["-Command"]),
            other => interpreter(other, &["-c"]),
        })
    }

    fn from_command_line(command: &[String]) -> ConfigResult<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| ConfigError::Invalid("interpreter must not be empty".to_string()))?;
        Ok(Runtime::Interpreter {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Runtime::Container { .. })
    }

    /// This runtime with container parameters taken from rendered `with`
    /// values; interpreters are returned unchanged
    pub fn rendered(&self, with: &BTreeMap<String, String>) -> Runtime {
        match self {
            Runtime::Container {
                engine,
                image,
                shell,
            } => Runtime::Container {
                engine: engine.clone(),
                image: with.get("image").cloned().unwrap_or_else(|| image.clone()),
                shell: with.get("shell").cloned().unwrap_or_else(|| shell.clone()),
            },
            other => other.clone(),
        }
    }
}

/// A dotenv file to load before running a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DotenvSource {
    pub path: PathBuf,
    pub optional: bool,
}

/// Hook lists fused into the graph as ordering edges
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hooks {
    pub before: Vec<String>,
    pub after: Vec<String>,
}

/// A fully resolved task definition
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    /// Base name, without context qualifier
    pub name: String,

    /// Context this definition overrides, if any
    pub context: Option<String>,

    pub description: Option<String>,
    pub runtime: Runtime,
    pub body: String,

    /// Absolute working directory
    pub working_dir: PathBuf,

    /// Declared environment, later entries shadow earlier ones
    pub declared_env: Vec<(String, String)>,

    pub dotenv: Vec<DotenvSource>,

    /// Dependencies in declaration order, without duplicates
    pub needs: Vec<String>,

    pub hooks: Hooks,
    pub timeout: Option<Duration>,
    pub condition: Option<String>,
    pub force: bool,
    pub hosts: Vec<String>,
    pub template: bool,
    pub with: BTreeMap<String, String>,
    pub quiet: bool,
    pub private: bool,
}

impl TaskDefinition {
    /// Build a definition from its configuration entry
    pub fn from_config(
        key: &str,
        config: &config::TaskConfig,
        base_dir: &std::path::Path,
        default_interpreter: &[String],
    ) -> ConfigResult<Self> {
        let (name, context) = split_task_key(key);

        let timeout = match &config.timeout {
            None => None,
            Some(TimeoutValue::Seconds(secs)) => Some(Duration::from_secs(*secs)),
            Some(TimeoutValue::Text(text)) => {
                Some(parse_duration(text).map_err(|e| ConfigError::InvalidTimeout {
                    task: key.to_string(),
                    error: e.to_string(),
                })?)
            }
        };

        let working_dir = match &config.cwd {
            Some(dir) => base_dir.join(dir),
            None => base_dir.to_path_buf(),
        };

        let dotenv = config
            .dotenv
            .iter()
            .map(|entry| match entry {
                DotenvEntry::Path(path) => DotenvSource {
                    path: working_dir.join(path),
                    optional: false,
                },
                DotenvEntry::Detailed { path, optional } => DotenvSource {
                    path: working_dir.join(path),
                    optional: *optional,
                },
            })
            .collect();

        Ok(TaskDefinition {
            name: name.to_string(),
            context: context.map(str::to_string),
            description: config.desc.clone(),
            runtime: Runtime::from_config(
                config.runtime.as_deref(),
                &config.with,
                default_interpreter,
            )?,
            body: config.run.clone(),
            working_dir,
            declared_env: config.env.clone(),
            dotenv,
            needs: dedup(&config.needs),
            hooks: Hooks {
                before: dedup(&config.hooks.before),
                after: dedup(&config.hooks.after),
            },
            timeout,
            condition: config.condition.clone(),
            force: config.force,
            hosts: dedup(&config.hosts),
            template: config.template,
            with: config.with.clone(),
            quiet: config.quiet,
            private: config.private,
        })
    }

    /// Key this definition is registered under (`name` or `name:context`)
    pub fn key(&self) -> String {
        match &self.context {
            Some(context) => format!("{}:{}", self.name, context),
            None => self.name.clone(),
        }
    }

    pub fn is_remote(&self) -> bool {
        !self.hosts.is_empty()
    }
}

fn dedup(items: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items
        .iter()
        .filter(|item| seen.insert(item.as_str()))
        .cloned()
        .collect()
}

/// A remote host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub name: String,
    pub address: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub tags: Vec<String>,
}

impl Host {
    pub fn from_config(name: &str, config: &config::HostConfig) -> Self {
        Host {
            name: name.to_string(),
            address: config.address.clone().unwrap_or_else(|| name.to_string()),
            user: config.user.clone(),
            port: config.port,
            tags: config.tags.clone(),
        }
    }

    /// `user@address` or just `address`
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.address),
            None => self.address.clone(),
        }
    }
}

/// A named, ordered pipeline of tasks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefinition {
    pub name: String,
    pub description: Option<String>,
    pub steps: Vec<String>,
    pub needs: Vec<String>,
}

impl JobDefinition {
    pub fn from_config(name: &str, config: &config::JobConfig) -> Self {
        JobDefinition {
            name: name.to_string(),
            description: config.desc.clone(),
            steps: config.steps.clone(),
            needs: dedup(&config.needs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn sh() -> Vec<String> {
        DEFAULT_INTERPRETER.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_split_task_key() {
        assert_eq!(split_task_key("deploy"), ("deploy", None));
        assert_eq!(split_task_key("deploy:prod"), ("deploy", Some("prod")));
        assert_eq!(split_task_key("docker:build:ci"), ("docker:build", Some("ci")));
        assert_eq!(split_task_key(":prod"), (":prod", None));
        assert_eq!(split_task_key("deploy:"), ("deploy:", None));
    }

    #[test]
    fn test_runtime_resolution() {
        let with = BTreeMap::new();
        assert_eq!(
            Runtime::from_config(None, &with, &sh()).unwrap(),
            Runtime::Interpreter {
                program: "sh".to_string(),
                args: vec!["-c".to_string()]
            }
        );
        assert_eq!(
            Runtime::from_config(Some("python"), &with, &sh()).unwrap(),
            Runtime::Interpreter {
                program: "python3".to_string(),
                args: vec!["-c".to_string()]
            }
        );
        assert_eq!(
            Runtime::from_config(Some("deno"), &with, &sh()).unwrap(),
            Runtime::Interpreter {
                program: "deno".to_string(),
                args: vec!["eval".to_string()]
            }
        );
    }

    #[test]
    fn test_container_runtime_requires_image() {
        let mut with = BTreeMap::new();
        assert!(Runtime::from_config(Some("docker"), &with, &sh()).is_err());

        with.insert("image".to_string(), "alpine:3".to_string());
        let runtime = Runtime::from_config(Some("docker"), &with, &sh()).unwrap();
        assert!(runtime.is_container());
        assert!(matches!(runtime, Runtime::Container { ref shell, .. } if shell == "sh"));
    }

    #[test]
    fn test_rendered_runtime_takes_container_parameters() {
        let mut declared = BTreeMap::new();
        declared.insert("image".to_string(), "alpine:{{ .Context }}".to_string());
        let runtime = Runtime::from_config(Some("podman"), &declared, &sh()).unwrap();

        let mut rendered = BTreeMap::new();
        rendered.insert("image".to_string(), "alpine:3.19".to_string());
        rendered.insert("shell".to_string(), "bash".to_string());
        assert_eq!(
            runtime.rendered(&rendered),
            Runtime::Container {
                engine: "podman".to_string(),
                image: "alpine:3.19".to_string(),
                shell: "bash".to_string(),
            }
        );

        let interpreter = Runtime::from_config(None, &BTreeMap::new(), &sh()).unwrap();
        assert_eq!(interpreter.rendered(&rendered), interpreter);
    }

    #[test]
    fn test_definition_from_config() {
        let config = config::TaskConfig {
            run: "echo hi".to_string(),
            cwd: Some("sub".to_string()),
            needs: vec!["a".to_string(), "b".to_string(), "a".to_string()],
            timeout: Some(TimeoutValue::Text("1m".to_string())),
            dotenv: vec![DotenvEntry::Path(".env".to_string())],
            ..Default::default()
        };

        let def = TaskDefinition::from_config("build:ci", &config, Path::new("/proj"), &sh())
            .unwrap();
        assert_eq!(def.name, "build");
        assert_eq!(def.context.as_deref(), Some("ci"));
        assert_eq!(def.key(), "build:ci");
        assert_eq!(def.needs, vec!["a", "b"]);
        assert_eq!(def.timeout, Some(Duration::from_secs(60)));
        assert_eq!(def.working_dir, PathBuf::from("/proj/sub"));
        assert_eq!(def.dotenv[0].path, PathBuf::from("/proj/sub/.env"));
    }

    #[test]
    fn test_invalid_timeout() {
        let config = config::TaskConfig {
            timeout: Some(TimeoutValue::Text("soon".to_string())),
            ..Default::default()
        };
        let result = TaskDefinition::from_config("t", &config, Path::new("/"), &sh());
        assert!(matches!(result, Err(ConfigError::InvalidTimeout { .. })));
    }

    #[test]
    fn test_host_destination() {
        let host = Host::from_config(
            "web1",
            &config::HostConfig {
                user: Some("deploy".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(host.address, "web1");
        assert_eq!(host.destination(), "deploy@web1");
    }
}
