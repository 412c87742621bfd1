//! Container backend
//!
//! Runs the body inside a throwaway container. The working directory is
//! mounted at `/workspace` and the channel directory at `/runbook`.

use super::process::{supervise, Echo, Input};
use super::{ExecutionResult, Invocation};
use crate::error::{ExecutionError, NodeResult};
use crate::runner::env::Channels;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::process::Command;
use tracing::{debug, warn};

const WORKSPACE: &str = "/workspace";
const CHANNEL_MOUNT: &str = "/runbook";

static CONTAINER_SEQ: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerBackend {
    pub engine: String,
    pub image: String,
    pub shell: String,
}

impl ContainerBackend {
    pub fn new(engine: &str, image: &str, shell: &str) -> Self {
        ContainerBackend {
            engine: engine.to_string(),
            image: image.to_string(),
            shell: shell.to_string(),
        }
    }

    pub async fn run(&self, invocation: &Invocation<'_>) -> NodeResult<ExecutionResult> {
        let name = container_name(invocation.label);
        let mut command = Command::new(&self.engine);
        command.args(self.arguments(&name, invocation));

        debug!(label = invocation.label, container = %name, image = %self.image, "starting container");

        let echo = Echo::new(invocation.label, invocation.echo);
        match supervise(command, Input::Null, &echo, invocation.timeout, invocation.cancel).await {
            Ok(captured) => Ok(captured.into()),
            Err(error @ (ExecutionError::Timeout(_) | ExecutionError::Cancelled)) => {
                self.kill(&name).await;
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    /// Arguments after the engine name
    pub fn arguments(&self, name: &str, invocation: &Invocation<'_>) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
            "--name".to_string(),
            name.to_string(),
            "-v".to_string(),
            format!("{}:{}", invocation.working_dir.display(), WORKSPACE),
            "-w".to_string(),
            WORKSPACE.to_string(),
            "-v".to_string(),
            format!("{}:{}", invocation.channels.dir().display(), CHANNEL_MOUNT),
        ];

        let vars = invocation
            .env
            .vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .chain(Channels::vars_under(CHANNEL_MOUNT));
        for (key, value) in vars {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        if !invocation.env.path_prefix.is_empty() {
            debug!(
                label = invocation.label,
                "inherited PATH entries are not applied inside containers"
            );
        }

        args.push(self.image.clone());
        args.push(self.shell.clone());
        args.push("-c".to_string());
        args.push(invocation.body.to_string());
        args
    }

    async fn kill(&self, name: &str) {
        let result = Command::new(&self.engine)
            .args(["kill", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match result {
            Ok(status) if status.success() => debug!(container = %name, "container killed"),
            Ok(status) => warn!(container = %name, code = status.code(), "container kill failed"),
            Err(e) => warn!(container = %name, error = %e, "container kill failed"),
        }
    }
}

fn container_name(label: &str) -> String {
    let sanitized: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    format!(
        "runbook-{}-{}-{}",
        sanitized,
        std::process::id(),
        CONTAINER_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::env::TaskEnv;
    use std::path::Path;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_container_names_are_unique_and_safe() {
        let a = container_name("build:ci");
        let b = container_name("build:ci");
        assert_ne!(a, b);
        assert!(a.starts_with("runbook-build-ci-"));
    }

    #[test]
    fn test_arguments() {
        let backend = ContainerBackend::new("docker", "alpine:3", "sh");
        let channels = Channels::create().unwrap();
        let mut env = TaskEnv::default();
        env.vars.insert("MODE".to_string(), "release".to_string());
        let cancel = CancellationToken::new();
        let invocation = Invocation {
            label: "build",
            body: "make",
            working_dir: Path::new("/src/app"),
            env: &env,
            channels: &channels,
            timeout: None,
            cancel: &cancel,
            echo: false,
        };

        let args = backend.arguments("runbook-build-1", &invocation);
        assert_eq!(&args[..5], &["run", "--rm", "-i", "--name", "runbook-build-1"]);
        assert!(args.contains(&"/src/app:/workspace".to_string()));
        assert!(args.contains(&"MODE=release".to_string()));
        assert!(args.contains(&"RUNBOOK_ENV=/runbook/env".to_string()));
        assert_eq!(&args[args.len() - 4..], &["alpine:3", "sh", "-c", "make"]);
    }
}
