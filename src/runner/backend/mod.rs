//! Execution backends
//!
//! Every task body runs through one of three backend kinds. Each exposes the
//! same `run` contract and the same termination behaviour on timeout and
//! cancellation.

pub mod container;
pub mod local;
pub mod process;
pub mod remote;

pub use container::ContainerBackend;
pub use local::LocalBackend;
pub use remote::{Connections, RemoteBackend};

use crate::error::NodeResult;
use crate::runner::env::{Channels, TaskEnv};
use crate::runner::task::{Host, Runtime, TaskDefinition};
use crate::runner::template::RenderedTask;
use process::Captured;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Structured result of one backend run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Last `lines` lines of stderr
    pub fn stderr_tail(&self, lines: usize) -> Vec<&str> {
        let all: Vec<&str> = self.stderr.lines().collect();
        all[all.len().saturating_sub(lines)..].to_vec()
    }
}

impl From<Captured> for ExecutionResult {
    fn from(captured: Captured) -> Self {
        ExecutionResult {
            exit_code: captured.exit_code,
            stdout: captured.stdout,
            stderr: captured.stderr,
            duration: captured.duration,
        }
    }
}

/// Everything a backend needs for one run of a rendered body
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    /// Prefix for echoed output, `task` or `task@host`
    pub label: &'a str,
    pub body: &'a str,
    pub working_dir: &'a Path,
    pub env: &'a TaskEnv,
    pub channels: &'a Channels,
    pub timeout: Option<Duration>,
    pub cancel: &'a CancellationToken,
    pub echo: bool,
}

/// Backend selected for a task and target
#[derive(Debug, Clone)]
pub enum Backend {
    Local(LocalBackend),
    Container(ContainerBackend),
    Remote(RemoteBackend),
}

impl Backend {
    /// Pick the backend for `runtime`, remote when a host is given
    pub fn select(runtime: &Runtime, host: Option<&Arc<Host>>, connections: &Arc<Connections>) -> Self {
        match (runtime, host) {
            (Runtime::Container { engine, image, shell }, _) => {
                Backend::Container(ContainerBackend::new(engine, image, shell))
            }
            (Runtime::Interpreter { program, args }, Some(host)) => Backend::Remote(RemoteBackend {
                host: Arc::clone(host),
                program: program.clone(),
                args: args.clone(),
                connections: Arc::clone(connections),
            }),
            (Runtime::Interpreter { program, args }, None) => {
                Backend::Local(LocalBackend::new(program.clone(), args.clone()))
            }
        }
    }

    /// Backend for a rendered task; container parameters come from the
    /// rendered `with` values
    pub fn for_task(
        definition: &TaskDefinition,
        rendered: &RenderedTask,
        host: Option<&Arc<Host>>,
        connections: &Arc<Connections>,
    ) -> Self {
        Backend::select(&definition.runtime.rendered(&rendered.with), host, connections)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Backend::Local(_) => "local",
            Backend::Container(_) => "container",
            Backend::Remote(_) => "remote",
        }
    }

    /// Whether the orchestrator's own environment is visible to the body
    pub fn inherits_process_env(&self) -> bool {
        matches!(self, Backend::Local(_))
    }

    pub async fn run(&self, invocation: &Invocation<'_>) -> NodeResult<ExecutionResult> {
        match self {
            Backend::Local(backend) => backend.run(invocation).await,
            Backend::Container(backend) => backend.run(invocation).await,
            Backend::Remote(backend) => backend.run(invocation).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::env::InheritedEnv;
    use crate::runner::template::TemplateContext;

    #[test]
    fn test_select() {
        let connections = Arc::new(Connections::default());
        let sh = Runtime::Interpreter {
            program: "sh".to_string(),
            args: vec!["-c".to_string()],
        };
        let host = Arc::new(Host {
            name: "web1".to_string(),
            address: "web1".to_string(),
            user: None,
            port: None,
            tags: vec![],
        });

        assert_eq!(Backend::select(&sh, None, &connections).kind(), "local");
        assert_eq!(Backend::select(&sh, Some(&host), &connections).kind(), "remote");

        let docker = Runtime::Container {
            engine: "docker".to_string(),
            image: "alpine".to_string(),
            shell: "sh".to_string(),
        };
        let backend = Backend::select(&docker, None, &connections);
        assert_eq!(backend.kind(), "container");
        assert!(!backend.inherits_process_env());
    }

    #[test]
    fn test_container_image_is_rendered() {
        let project = crate::runner::Project::from_yaml(
            r#"
tasks:
  image:
    runtime: docker
    template: true
    with:
      image: "alpine:{{ .Context }}"
    run: cat /etc/alpine-release
"#,
            Path::new("/"),
        )
        .unwrap();
        let definition = project.tasks.resolve("image", None).unwrap();
        let inherited = InheritedEnv::default();
        let template = TemplateContext::new(definition, &inherited).with_context(Some("3.19"));
        let rendered = RenderedTask::render(&template).unwrap();

        let backend = Backend::for_task(definition, &rendered, None, &Arc::new(Connections::default()));
        match backend {
            Backend::Container(container) => assert_eq!(container.image, "alpine:3.19"),
            other => panic!("expected a container backend, got {}", other.kind()),
        }
    }

    #[test]
    fn test_stderr_tail() {
        let result = ExecutionResult {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "a\nb\nc\n".to_string(),
            duration: Duration::ZERO,
        };
        assert_eq!(result.stderr_tail(2), vec!["b", "c"]);
        assert_eq!(result.stderr_tail(10), vec!["a", "b", "c"]);
        assert!(!result.success());
    }
}
