//! Common test utilities

#![allow(dead_code)]

use runbook::runner::{Project, RunContext, RunReport, Scheduler, TaskGraph, Verbosity};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Create a temporary directory with a runbook.yml file
pub fn create_test_config(content: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("runbook.yml");
    fs::write(&config_path, content).unwrap();
    (temp_dir, config_path)
}

/// Load a project whose relative paths resolve inside a fresh temp dir
pub fn project(yaml: &str) -> (TempDir, Project) {
    let temp_dir = TempDir::new().unwrap();
    let project = Project::from_yaml(yaml, temp_dir.path()).unwrap();
    (temp_dir, project)
}

/// Run context with task output echo turned off
pub fn quiet_context(project: &Project) -> RunContext {
    RunContext::new(project).with_verbosity(Verbosity::Quiet)
}

/// Build and run the graph for `targets`
pub async fn run_targets(ctx: RunContext, project: &Project, targets: &[&str]) -> RunReport {
    let targets: Vec<String> = targets.iter().map(|t| t.to_string()).collect();
    let graph = TaskGraph::build(&project.tasks, ctx.active_context(), &targets).unwrap();
    Scheduler::new(ctx).run(&graph, CancellationToken::new()).await
}

/// Trimmed stdout of a node
pub fn stdout_of(report: &RunReport, name: &str) -> String {
    report
        .node(name)
        .and_then(|n| n.result.as_ref())
        .map(|r| r.stdout.trim().to_string())
        .unwrap_or_default()
}
