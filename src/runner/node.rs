//! Per-run execution nodes

use crate::error::ExecutionError;
use crate::runner::backend::ExecutionResult;
use crate::runner::env::{Exported, InheritedEnv};
use crate::runner::task::TaskDefinition;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Index of a node inside its graph
pub type NodeId = usize;

/// Why a node did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Its `if:` condition evaluated to false
    Condition,
    /// A dependency failed and the node is not `force`
    UpstreamFailed,
    /// The run was cancelled before the node started
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped(SkipReason),
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Skipped(_)
        )
    }

    /// Whether this status makes dependents skip unless they are `force`
    pub fn fails_dependents(&self) -> bool {
        matches!(
            self,
            NodeStatus::Failed
                | NodeStatus::Skipped(SkipReason::UpstreamFailed)
                | NodeStatus::Skipped(SkipReason::Cancelled)
        )
    }

    /// Succeeded, or skipped by its own condition
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            NodeStatus::Succeeded | NodeStatus::Skipped(SkipReason::Condition)
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Pending => write!(f, "pending"),
            NodeStatus::Ready => write!(f, "ready"),
            NodeStatus::Running => write!(f, "running"),
            NodeStatus::Succeeded => write!(f, "succeeded"),
            NodeStatus::Failed => write!(f, "failed"),
            NodeStatus::Skipped(SkipReason::Condition) => write!(f, "skipped (condition)"),
            NodeStatus::Skipped(SkipReason::UpstreamFailed) => {
                write!(f, "skipped (upstream failed)")
            }
            NodeStatus::Skipped(SkipReason::Cancelled) => write!(f, "skipped (cancelled)"),
        }
    }
}

/// The scheduler's record of one resolved task in one run
#[derive(Debug, Clone)]
pub struct ExecutionNode {
    pub id: NodeId,
    /// Definition key, `name` or `name:context`
    pub name: String,
    pub definition: Arc<TaskDefinition>,
    pub deps: Vec<NodeId>,
    pub status: NodeStatus,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
    pub result: Option<ExecutionResult>,
    pub error: Option<ExecutionError>,
    /// Fixed when the node becomes ready
    pub inherited_env: Option<Arc<InheritedEnv>>,
    /// Set once the node succeeded
    pub exported: Option<Arc<Exported>>,
}

impl ExecutionNode {
    pub fn new(id: NodeId, name: String, definition: Arc<TaskDefinition>, deps: Vec<NodeId>) -> Self {
        ExecutionNode {
            id,
            name,
            definition,
            deps,
            status: NodeStatus::Pending,
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            inherited_env: None,
            exported: None,
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end.saturating_duration_since(start)),
            _ => None,
        }
    }
}
