//! End-of-run summaries and task listings

use crate::runner::{ExecutionNode, JobReport, NodeStatus, Project, RunReport, SkipReason, Verbosity};
use crate::utils::format_duration;
use colored::{ColoredString, Colorize};
use std::fmt::Write as _;

/// Number of stderr lines shown for a failed node
const STDERR_TAIL: usize = 10;

fn status_label(status: NodeStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        NodeStatus::Succeeded => text.green(),
        NodeStatus::Failed => text.red().bold(),
        NodeStatus::Skipped(SkipReason::Condition) => text.dimmed(),
        NodeStatus::Skipped(_) => text.yellow(),
        _ => text.normal(),
    }
}

/// Render the per-node summary of a run
pub fn render_run_report(report: &RunReport, verbosity: Verbosity) -> String {
    let mut out = String::new();
    let width = report.nodes.iter().map(|n| n.name.len()).max().unwrap_or(0);

    for node in &report.nodes {
        let show = verbosity >= Verbosity::Normal || node.status == NodeStatus::Failed;
        if !show {
            continue;
        }
        let duration = node
            .duration()
            .map(|d| format!(" ({})", format_duration(d)))
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "  {:<width$}  {}{}",
            node.name,
            status_label(node.status),
            duration,
            width = width
        );
        if node.status == NodeStatus::Failed {
            render_failure(&mut out, node);
        }
    }

    let summary = if report.cancelled {
        "run cancelled".yellow().bold()
    } else if report.success() {
        "all tasks succeeded".green().bold()
    } else {
        "run failed".red().bold()
    };
    let _ = writeln!(out, "{} in {}", summary, format_duration(report.duration));
    out
}

fn render_failure(out: &mut String, node: &ExecutionNode) {
    if let Some(error) = &node.error {
        let _ = writeln!(out, "      {}: {}", error.kind().red(), error);
    }
    if let Some(result) = &node.result {
        for line in result.stderr_tail(STDERR_TAIL) {
            let _ = writeln!(out, "      | {}", line.dimmed());
        }
    }
}

/// Render job outcomes with every step's status
pub fn render_job_reports(reports: &[JobReport]) -> String {
    let mut out = String::new();
    for job in reports {
        let verdict = if job.succeeded {
            "succeeded".green()
        } else {
            "failed".red().bold()
        };
        let _ = writeln!(out, "job {} {}", job.name.bold(), verdict);
        for (step, status) in &job.steps {
            let _ = writeln!(out, "  - {}: {}", step, status_label(*status));
        }
    }
    out
}

/// Render the task and job listing for `--list`
pub fn render_task_list(project: &Project) -> String {
    let mut out = String::new();
    if let Some(usage) = &project.usage {
        let _ = writeln!(out, "{}\n", usage);
    }

    let _ = writeln!(out, "{}", "Tasks:".bold());
    let mut names: Vec<&str> = project
        .tasks
        .base_definitions()
        .filter(|d| !d.private)
        .map(|d| d.name.as_str())
        .collect();
    names.extend(project.tasks.override_only_names());
    names.sort_unstable();

    let width = names.iter().map(|n| n.len()).max().unwrap_or(0);
    for name in names {
        let description = project
            .tasks
            .resolve(name, None)
            .ok()
            .and_then(|d| d.description.clone())
            .unwrap_or_default();
        let contexts = project.tasks.contexts_for(name);
        let contexts = if contexts.is_empty() {
            String::new()
        } else {
            format!(" [{}]", contexts.join(", ")).dimmed().to_string()
        };
        let _ = writeln!(
            out,
            "  {:<width$}  {}{}",
            name.cyan(),
            description,
            contexts,
            width = width
        );
    }

    if !project.jobs.is_empty() {
        let _ = writeln!(out, "\n{}", "Jobs:".bold());
        for job in project.jobs.values() {
            let _ = writeln!(
                out,
                "  {}  {}",
                job.name.cyan(),
                job.description.clone().unwrap_or_else(|| job.steps.join(" -> "))
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_task_list_includes_contexts_and_jobs() {
        colored::control::set_override(false);
        let project = Project::from_yaml(
            r#"
tasks:
  build: { run: make, desc: Build it }
  build:ci: { run: make ci }
  seed:dev: { run: echo seed }
  secret: { run: echo, private: true }
jobs:
  release: { steps: [build] }
"#,
            Path::new("/"),
        )
        .unwrap();

        let listing = render_task_list(&project);
        assert!(listing.contains("Build it [ci]"));
        assert!(listing.contains("seed"));
        assert!(!listing.contains("secret"));
        assert!(listing.contains("release  build"));
    }

    #[test]
    fn test_job_report_lists_steps() {
        colored::control::set_override(false);
        let reports = vec![JobReport {
            name: "ci".to_string(),
            succeeded: false,
            steps: vec![
                ("lint".to_string(), NodeStatus::Failed),
                ("test".to_string(), NodeStatus::Skipped(SkipReason::UpstreamFailed)),
            ],
        }];
        let text = render_job_reports(&reports);
        assert!(text.contains("job ci failed"));
        assert!(text.contains("- lint: failed"));
        assert!(text.contains("- test: skipped (upstream failed)"));
    }
}
