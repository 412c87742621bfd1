//! Task graph execution engine
//!
//! Definitions are routed by context, fused into a dependency graph and
//! executed concurrently. Environment flows between nodes only through the
//! propagation channels.

pub mod backend;
pub mod condition;
pub mod context;
pub mod env;
pub mod graph;
pub mod interpolate;
pub mod job;
pub mod node;
pub mod project;
pub mod router;
pub mod scheduler;
pub mod task;
pub mod template;

// Re-export main types
pub use backend::{Backend, ExecutionResult};
pub use condition::Decision;
pub use context::*;
pub use env::{InheritedEnv, TaskEnv};
pub use graph::{GraphBuilder, TaskGraph};
pub use interpolate::*;
pub use job::{JobOrchestrator, JobPlan, JobReport};
pub use node::*;
pub use project::Project;
pub use router::TaskTable;
pub use scheduler::{RunReport, Scheduler};
pub use task::*;
