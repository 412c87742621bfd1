//! Job orchestration
//!
//! Jobs are selected at job granularity first, then every selected job's
//! steps are fused into one task graph: steps run in order, and a job runs
//! after the jobs it needs.

use crate::error::{ConfigError, Result, RunbookError};
use crate::runner::graph::{find_cycle, GraphBuilder, TaskGraph};
use crate::runner::node::{NodeId, NodeStatus};
use crate::runner::project::Project;
use crate::runner::scheduler::RunReport;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Plans job runs against a project
pub struct JobOrchestrator<'a> {
    project: &'a Project,
    context: Option<&'a str>,
}

/// The task graph for a set of jobs
#[derive(Debug, Clone)]
pub struct JobPlan {
    /// Selected jobs, dependencies first
    pub jobs: Vec<String>,
    pub graph: TaskGraph,
    steps: Vec<Vec<NodeId>>,
}

impl<'a> JobOrchestrator<'a> {
    pub fn new(project: &'a Project, context: Option<&'a str>) -> Self {
        JobOrchestrator { project, context }
    }

    /// Jobs to run for `job`, dependencies first.
    ///
    /// Without `downstream` this is the job and everything it transitively
    /// needs; with it, the job and every job that transitively needs it.
    pub fn select(&self, job: &str, downstream: bool) -> Result<Vec<String>> {
        self.project.job(job)?;
        self.check_cycles()?;

        let mut selected = BTreeSet::new();
        let mut stack = vec![job.to_string()];
        while let Some(name) = stack.pop() {
            if !selected.insert(name.clone()) {
                continue;
            }
            if downstream {
                stack.extend(
                    self.project
                        .jobs
                        .values()
                        .filter(|j| j.needs.contains(&name))
                        .map(|j| j.name.clone()),
                );
            } else {
                stack.extend(self.project.job(&name)?.needs.iter().cloned());
            }
        }

        Ok(self.topological(&selected))
    }

    /// Select jobs and build their union task graph
    pub fn plan(&self, job: &str, downstream: bool) -> Result<JobPlan> {
        let jobs = self.select(job, downstream)?;
        debug!(job, downstream, selected = ?jobs, "job selection");

        let mut builder = GraphBuilder::new(&self.project.tasks, self.context);
        let mut step_nodes = Vec::with_capacity(jobs.len());
        for name in &jobs {
            let definition = self.project.job(name)?;
            let mut ids = Vec::with_capacity(definition.steps.len());
            for step in &definition.steps {
                ids.push(builder.add(step)?);
            }
            for pair in definition.steps.windows(2) {
                builder.order(&pair[0], &pair[1])?;
            }
            step_nodes.push(ids);
        }

        for (i, name) in jobs.iter().enumerate() {
            let definition = self.project.job(name)?;
            let Some(first) = definition.steps.first() else {
                continue;
            };
            for needed in &definition.needs {
                let Some(j) = jobs.iter().position(|n| n == needed) else {
                    continue;
                };
                if let Some(last) = self.project.job(&jobs[j])?.steps.last() {
                    debug!(from = %jobs[j], to = %jobs[i], "job ordering edge");
                    builder.order(last, first)?;
                }
            }
        }

        Ok(JobPlan {
            jobs,
            graph: builder.build()?,
            steps: step_nodes,
        })
    }

    fn check_cycles(&self) -> Result<()> {
        let names: Vec<&String> = self.project.jobs.keys().collect();
        let index: HashMap<&str, usize> = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        let mut adjacency = Vec::with_capacity(names.len());
        for job in self.project.jobs.values() {
            let mut deps = Vec::with_capacity(job.needs.len());
            for needed in &job.needs {
                let id = index
                    .get(needed.as_str())
                    .ok_or_else(|| ConfigError::JobNotFound(needed.clone()))?;
                deps.push(*id);
            }
            adjacency.push(deps);
        }

        match find_cycle(&adjacency) {
            Some(cycle) => Err(RunbookError::Cycle {
                path: cycle.into_iter().map(|i| names[i].clone()).collect(),
            }),
            None => Ok(()),
        }
    }

    /// Dependencies-first order of `selected`, ties broken by name
    fn topological(&self, selected: &BTreeSet<String>) -> Vec<String> {
        fn visit(
            name: &str,
            orchestrator: &JobOrchestrator,
            selected: &BTreeSet<String>,
            done: &mut BTreeSet<String>,
            order: &mut Vec<String>,
        ) {
            if !done.insert(name.to_string()) {
                return;
            }
            if let Some(job) = orchestrator.project.jobs.get(name) {
                for needed in &job.needs {
                    if selected.contains(needed) {
                        visit(needed, orchestrator, selected, done, order);
                    }
                }
            }
            order.push(name.to_string());
        }

        let mut done = BTreeSet::new();
        let mut order = Vec::with_capacity(selected.len());
        for name in selected {
            visit(name, self, selected, &mut done, &mut order);
        }
        order
    }
}

/// Outcome of one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub name: String,
    pub succeeded: bool,
    /// Every step with its node's final status
    pub steps: Vec<(String, NodeStatus)>,
}

impl JobPlan {
    /// Aggregate node results per job
    pub fn report(&self, run: &RunReport) -> Vec<JobReport> {
        self.jobs
            .iter()
            .zip(&self.steps)
            .map(|(name, ids)| {
                let steps: Vec<(String, NodeStatus)> = ids
                    .iter()
                    .filter_map(|&id| run.nodes.get(id))
                    .map(|node| (node.name.clone(), node.status))
                    .collect();
                JobReport {
                    name: name.clone(),
                    succeeded: steps.iter().all(|(_, status)| status.is_success()),
                    steps,
                }
            })
            .collect()
    }
}
