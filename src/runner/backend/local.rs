//! Local interpreter backend

use super::process::{supervise, Echo, Input};
use super::{ExecutionResult, Invocation};
use crate::error::NodeResult;
use std::env;
use tokio::process::Command;
use tracing::debug;

/// Runs `program args... body` on this machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalBackend {
    pub program: String,
    pub args: Vec<String>,
}

impl LocalBackend {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        LocalBackend {
            program: program.into(),
            args,
        }
    }

    pub async fn run(&self, invocation: &Invocation<'_>) -> NodeResult<ExecutionResult> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(invocation.body)
            .current_dir(invocation.working_dir)
            .envs(&invocation.env.vars)
            .envs(invocation.channels.vars());

        let base_path = invocation
            .env
            .vars
            .get("PATH")
            .cloned()
            .or_else(|| env::var("PATH").ok());
        if let Some(path) = invocation.env.joined_path(base_path.as_deref()) {
            command.env("PATH", path);
        }

        debug!(
            label = invocation.label,
            program = %self.program,
            cwd = %invocation.working_dir.display(),
            "running local process"
        );

        let echo = Echo::new(invocation.label, invocation.echo);
        let captured = supervise(command, Input::Null, &echo, invocation.timeout, invocation.cancel).await?;
        Ok(captured.into())
    }
}
