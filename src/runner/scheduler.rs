//! Concurrent DAG execution
//!
//! The scheduling loop is the only writer of node state. Workers run on a
//! `JoinSet` and report an outcome back; the loop settles the node, frees
//! its dependents and launches whatever became ready, up to the
//! concurrency limit.

use crate::error::ExecutionError;
use crate::runner::backend::{Backend, Connections, ExecutionResult, Invocation};
use crate::runner::condition::{self, ConditionScope, Decision};
use crate::runner::context::{RunContext, Verbosity};
use crate::runner::env::{ChannelData, Channels, Exported, InheritedEnv, TaskEnv};
use crate::runner::graph::TaskGraph;
use crate::runner::node::{ExecutionNode, NodeId, NodeStatus, SkipReason};
use crate::runner::task::{Host, TaskDefinition};
use crate::runner::template::{RenderedTask, TemplateContext};
use crate::ui;
use futures::future::join_all;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::env;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Exit code for runs that failed only because of timeouts
pub const EXIT_TIMEOUT: i32 = 124;
/// Exit code for cancelled runs
pub const EXIT_CANCELLED: i32 = 130;

/// Final state of every node of a run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub nodes: Vec<ExecutionNode>,
    pub cancelled: bool,
    pub duration: Duration,
}

impl RunReport {
    pub fn node(&self, name: &str) -> Option<&ExecutionNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn status(&self, name: &str) -> Option<NodeStatus> {
        self.node(name).map(|n| n.status)
    }

    pub fn failed(&self) -> impl Iterator<Item = &ExecutionNode> {
        self.nodes.iter().filter(|n| n.status == NodeStatus::Failed)
    }

    /// Every node succeeded or was skipped by its own condition
    pub fn success(&self) -> bool {
        !self.cancelled && self.nodes.iter().all(|n| n.status.is_success())
    }

    /// 0 on success, 130 when cancelled, 124 when every failure was a
    /// timeout, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            return EXIT_CANCELLED;
        }
        if self.success() {
            return 0;
        }
        let mut failed = self.failed().peekable();
        if failed.peek().is_some()
            && failed.all(|n| matches!(n.error, Some(ExecutionError::Timeout(_))))
        {
            return EXIT_TIMEOUT;
        }
        1
    }
}

/// Executes task graphs
#[derive(Debug, Clone)]
pub struct Scheduler {
    ctx: Arc<RunContext>,
}

impl Scheduler {
    pub fn new(ctx: RunContext) -> Self {
        Scheduler { ctx: Arc::new(ctx) }
    }

    /// Run every node of `graph`; stops launching nodes once `cancel` fires
    pub async fn run(&self, graph: &TaskGraph, cancel: CancellationToken) -> RunReport {
        let started = Instant::now();
        let any_remote = graph.nodes().iter().any(|n| n.definition.is_remote());
        let connections = Arc::new(Connections::new(
            self.ctx.host_policy,
            self.ctx.ssh_multiplexing && any_remote,
        ));
        let limit = self.ctx.concurrency.unwrap_or(usize::MAX).max(1);

        let mut state = RunState::new(graph, &self.ctx, &cancel);
        let mut workers: JoinSet<(NodeId, WorkOutcome)> = JoinSet::new();
        let mut cancel_noted = false;

        let roots: Vec<NodeId> = (0..graph.len()).filter(|&id| state.waiting[id] == 0).collect();
        for id in roots {
            state.unblock(id);
        }

        loop {
            while workers.len() < limit {
                let Some(id) = state.ready.pop_front() else {
                    break;
                };
                if cancel.is_cancelled() {
                    state.finish(id, NodeStatus::Skipped(SkipReason::Cancelled));
                    continue;
                }
                let worker = state.start(id, &connections);
                workers.spawn(worker.run());
            }

            if workers.is_empty() {
                break;
            }

            tokio::select! {
                joined = workers.join_next() => match joined {
                    Some(Ok((id, outcome))) => state.complete(id, outcome),
                    Some(Err(e)) => error!(error = %e, "worker task failed"),
                    None => {}
                },
                _ = cancel.cancelled(), if !cancel_noted => {
                    cancel_noted = true;
                    warn!("run cancelled, terminating running nodes");
                }
            }
        }

        state.sweep();
        RunReport {
            nodes: state.nodes,
            cancelled: cancel.is_cancelled(),
            duration: started.elapsed(),
        }
    }
}

struct RunState<'a> {
    ctx: &'a Arc<RunContext>,
    cancel: &'a CancellationToken,
    nodes: Vec<ExecutionNode>,
    dependents: Vec<Vec<NodeId>>,
    /// Dependencies not yet terminal, per node
    waiting: Vec<usize>,
    ready: VecDeque<NodeId>,
}

impl<'a> RunState<'a> {
    fn new(graph: &TaskGraph, ctx: &'a Arc<RunContext>, cancel: &'a CancellationToken) -> Self {
        let nodes: Vec<ExecutionNode> = graph
            .nodes()
            .iter()
            .map(|n| ExecutionNode::new(n.id, n.key.clone(), Arc::clone(&n.definition), n.deps.clone()))
            .collect();
        let waiting = nodes.iter().map(|n| n.deps.len()).collect();

        RunState {
            ctx,
            cancel,
            nodes,
            dependents: graph.dependents(),
            waiting,
            ready: VecDeque::new(),
        }
    }

    /// Every dependency of `id` is terminal: decide its fate
    fn unblock(&mut self, id: NodeId) {
        if let Some(status) = self.prepare(id) {
            self.finish(id, status);
        }
    }

    /// Assemble the node's inherited environment and check its condition.
    /// Returns a terminal status when the node will not run.
    fn prepare(&mut self, id: NodeId) -> Option<NodeStatus> {
        if self.cancel.is_cancelled() {
            return Some(NodeStatus::Skipped(SkipReason::Cancelled));
        }

        let node = &self.nodes[id];
        let upstream_failed = node
            .deps
            .iter()
            .any(|&dep| self.nodes[dep].status.fails_dependents());
        if upstream_failed && !node.definition.force {
            return Some(NodeStatus::Skipped(SkipReason::UpstreamFailed));
        }

        let inherited = Arc::new(InheritedEnv::merge(node.deps.iter().filter_map(|&dep| {
            let dep = &self.nodes[dep];
            dep.exported
                .as_deref()
                .map(|exported| (dep.definition.name.as_str(), exported))
        })));
        let definition = Arc::clone(&node.definition);

        let node = &mut self.nodes[id];
        node.inherited_env = Some(Arc::clone(&inherited));
        node.status = NodeStatus::Ready;
        info!(task = %node.name, forced = upstream_failed, "node ready");

        if let Some(expression) = &definition.condition {
            let scope = ConditionScope {
                context: self.ctx.active_context(),
                inherited: &inherited,
                working_dir: &definition.working_dir,
            };
            match condition::evaluate(expression, &scope) {
                Ok(Decision::Run) => {}
                Ok(Decision::Skip) => return Some(NodeStatus::Skipped(SkipReason::Condition)),
                Err(e) => {
                    node.error = Some(e.into());
                    return Some(NodeStatus::Failed);
                }
            }
        }

        self.ready.push_back(id);
        None
    }

    /// Move `id` to Running and hand out its worker
    fn start(&mut self, id: NodeId, connections: &Arc<Connections>) -> Worker {
        let node = &mut self.nodes[id];
        node.status = NodeStatus::Running;
        node.started_at = Some(Instant::now());
        info!(task = %node.name, "node started");

        Worker {
            id,
            name: node.name.clone(),
            definition: Arc::clone(&node.definition),
            inherited: node.inherited_env.clone().unwrap_or_default(),
            ctx: Arc::clone(self.ctx),
            connections: Arc::clone(connections),
            cancel: self.cancel.clone(),
        }
    }

    fn complete(&mut self, id: NodeId, outcome: WorkOutcome) {
        let node = &mut self.nodes[id];
        match outcome {
            WorkOutcome::Succeeded { result, exported } => {
                node.result = Some(result);
                node.exported = Some(Arc::new(exported));
                self.finish(id, NodeStatus::Succeeded);
            }
            WorkOutcome::Failed { error, result } => {
                node.result = result;
                node.error = Some(error);
                self.finish(id, NodeStatus::Failed);
            }
        }
    }

    /// Record a terminal status and unblock dependents
    fn finish(&mut self, id: NodeId, status: NodeStatus) {
        let mut settled = vec![(id, status)];
        while let Some((id, status)) = settled.pop() {
            self.settle(id, status);
            for dependent in self.dependents[id].clone() {
                self.waiting[dependent] -= 1;
                if self.waiting[dependent] == 0 {
                    if let Some(status) = self.prepare(dependent) {
                        settled.push((dependent, status));
                    }
                }
            }
        }
    }

    fn settle(&mut self, id: NodeId, status: NodeStatus) {
        let node = &mut self.nodes[id];
        node.status = status;
        node.finished_at = Some(Instant::now());

        match status {
            NodeStatus::Succeeded => info!(task = %node.name, "node succeeded"),
            NodeStatus::Failed => {
                let (kind, message) = node
                    .error
                    .as_ref()
                    .map(|e| (e.kind(), e.to_string()))
                    .unwrap_or(("Unknown", String::new()));
                warn!(task = %node.name, kind, error = %message, "node failed");
            }
            NodeStatus::Skipped(reason) => info!(task = %node.name, ?reason, "node skipped"),
            _ => {}
        }
    }

    /// Settle anything a lost worker left behind
    fn sweep(&mut self) {
        for id in 0..self.nodes.len() {
            match self.nodes[id].status {
                NodeStatus::Running => {
                    self.nodes[id].error =
                        Some(ExecutionError::Spawn("worker did not report back".to_string()));
                    self.settle(id, NodeStatus::Failed);
                }
                NodeStatus::Pending | NodeStatus::Ready => {
                    self.settle(id, NodeStatus::Skipped(SkipReason::Cancelled));
                }
                _ => {}
            }
        }
    }
}

enum WorkOutcome {
    Succeeded {
        result: ExecutionResult,
        exported: Exported,
    },
    Failed {
        error: ExecutionError,
        result: Option<ExecutionResult>,
    },
}

/// A node-local error with whatever the backend returned
type Failure = (ExecutionError, Option<ExecutionResult>);

fn fail(error: impl Into<ExecutionError>) -> Failure {
    (error.into(), None)
}

/// Runs one node: render, assemble the environment, invoke the backend on
/// every target and collect the channels
struct Worker {
    id: NodeId,
    name: String,
    definition: Arc<TaskDefinition>,
    inherited: Arc<InheritedEnv>,
    ctx: Arc<RunContext>,
    connections: Arc<Connections>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) -> (NodeId, WorkOutcome) {
        let id = self.id;
        let outcome = match AssertUnwindSafe(self.execute()).catch_unwind().await {
            Ok(Ok((result, exported))) => WorkOutcome::Succeeded { result, exported },
            Ok(Err((error, result))) => WorkOutcome::Failed { error, result },
            Err(_) => WorkOutcome::Failed {
                error: ExecutionError::Spawn("worker panicked".to_string()),
                result: None,
            },
        };
        (id, outcome)
    }

    fn targets(&self) -> Result<Vec<Option<Arc<Host>>>, ExecutionError> {
        if self.definition.hosts.is_empty() {
            return Ok(vec![None]);
        }
        self.definition
            .hosts
            .iter()
            .map(|name| {
                self.ctx.hosts.get(name).cloned().map(Some).ok_or_else(|| {
                    ExecutionError::RemoteConnection {
                        host: name.clone(),
                        message: "host is not defined".to_string(),
                    }
                })
            })
            .collect()
    }

    async fn execute(&self) -> Result<(ExecutionResult, Exported), Failure> {
        let definition = &self.definition;
        let targets = self.targets().map_err(fail)?;

        // Render every target first so a template error starts nothing
        let mut plans = Vec::with_capacity(targets.len());
        for host in targets {
            let template = TemplateContext::new(definition, &self.inherited)
                .with_host(host.as_deref())
                .with_context(self.ctx.active_context());
            let rendered = RenderedTask::render(&template).map_err(fail)?;
            let backend = Backend::for_task(definition, &rendered, host.as_ref(), &self.connections);
            let label = match &host {
                Some(host) => format!("{}@{}", self.name, host.name),
                None => self.name.clone(),
            };
            plans.push((label, rendered, backend));
        }

        let ambient: HashMap<String, String> = match plans.first() {
            Some((_, _, backend)) if backend.inherits_process_env() => env::vars().collect(),
            _ => HashMap::new(),
        };
        let task_env = TaskEnv::compose(
            &ambient,
            &self.ctx.env,
            &definition.dotenv,
            &self.inherited,
            &definition.declared_env,
        )
        .map_err(fail)?;

        let outcomes = join_all(
            plans
                .iter()
                .map(|(label, rendered, backend)| self.run_target(label, rendered, backend, &task_env)),
        )
        .await;

        let mut combined: Option<ExecutionResult> = None;
        let mut data = ChannelData::default();
        for outcome in outcomes {
            let (result, channel_data) = outcome?;
            data.env.extend(channel_data.env);
            data.path.extend(channel_data.path);
            data.outputs.extend(channel_data.outputs);
            combined = Some(match combined {
                None => result,
                Some(mut acc) => {
                    acc.stdout.push_str(&result.stdout);
                    acc.stderr.push_str(&result.stderr);
                    acc.duration = acc.duration.max(result.duration);
                    acc
                }
            });
        }

        let result = combined
            .ok_or_else(|| fail(ExecutionError::Spawn("task has no execution target".to_string())))?;
        let exported = Exported::from_node(&self.name, &self.inherited, data);
        Ok((result, exported))
    }

    async fn run_target(
        &self,
        label: &str,
        rendered: &RenderedTask,
        backend: &Backend,
        task_env: &TaskEnv,
    ) -> Result<(ExecutionResult, ChannelData), Failure> {
        let channels = Channels::create()
            .map_err(|e| fail(ExecutionError::Environment(format!("channel files: {}", e))))?;

        if self.ctx.verbosity >= Verbosity::Normal {
            ui::task_started(label);
        }
        debug!(task = %self.name, label, backend = backend.kind(), "invoking backend");

        let invocation = Invocation {
            label,
            body: &rendered.body,
            working_dir: &rendered.working_dir,
            env: task_env,
            channels: &channels,
            timeout: self.ctx.timeout_for(self.definition.timeout),
            cancel: &self.cancel,
            echo: self.ctx.echo_output(self.definition.quiet),
        };

        let result = backend.run(&invocation).await.map_err(fail)?;
        if !result.success() {
            let error = ExecutionError::RuntimeExec {
                exit_code: result.exit_code,
            };
            return Err((error, Some(result)));
        }

        let data = channels.collect(&self.name).map_err(|e| {
            (
                ExecutionError::Environment(format!("reading channel files: {}", e)),
                Some(result.clone()),
            )
        })?;
        Ok((result, data))
    }
}
