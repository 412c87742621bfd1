//! Run-wide settings
//!
//! The context carries everything that is fixed for one invocation but not
//! part of the definitions: the active context name, limits and output level.

use crate::config::HostPolicy;
use crate::runner::project::Project;
use crate::runner::task::Host;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Verbosity levels for output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    Silent = 0,
    Quiet = 1,
    #[default]
    Normal = 2,
    Verbose = 3,
}

/// Settings shared by every node of a run
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    /// Active context used to route task references
    pub context: Option<String>,

    /// Maximum number of running nodes; unbounded when unset
    pub concurrency: Option<usize>,

    /// Replaces every task's own timeout when set
    pub timeout: Option<Duration>,

    pub host_policy: HostPolicy,

    /// Reuse SSH connections through OpenSSH multiplexing
    pub ssh_multiplexing: bool,

    pub verbosity: Verbosity,

    /// File-level environment
    pub env: Vec<(String, String)>,

    pub hosts: BTreeMap<String, Arc<Host>>,
}

impl RunContext {
    /// Create a context with the project's defaults
    pub fn new(project: &Project) -> Self {
        RunContext {
            context: None,
            concurrency: project.concurrency,
            timeout: None,
            host_policy: project.host_policy,
            ssh_multiplexing: true,
            verbosity: Verbosity::Normal,
            env: project.env.clone(),
            hosts: project.hosts.clone(),
        }
    }

    /// Set the active context
    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    /// Override the concurrency limit
    pub fn with_concurrency(mut self, limit: Option<usize>) -> Self {
        if limit.is_some() {
            self.concurrency = limit;
        }
        self
    }

    /// Override every task timeout
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_host_policy(mut self, policy: Option<HostPolicy>) -> Self {
        if let Some(policy) = policy {
            self.host_policy = policy;
        }
        self
    }

    pub fn with_ssh_multiplexing(mut self, enabled: bool) -> Self {
        self.ssh_multiplexing = enabled;
        self
    }

    /// Set verbosity level
    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn active_context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Effective timeout for a task declaring `own`
    pub fn timeout_for(&self, own: Option<Duration>) -> Option<Duration> {
        self.timeout.or(own)
    }

    /// Whether task output should be echoed
    pub fn echo_output(&self, quiet_task: bool) -> bool {
        !quiet_task && self.verbosity >= Verbosity::Normal
    }
}
