//! Error types for runbook

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for runbook operations
pub type Result<T> = std::result::Result<T, RunbookError>;

/// Errors that abort a whole run before any task executes
#[derive(Error, Debug)]
pub enum RunbookError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A task reference could not be resolved
    #[error("Task '{name}' is not defined{}", context_suffix(.context))]
    TaskNotFound {
        name: String,
        context: Option<String>,
    },

    /// The dependency graph contains a cycle
    #[error("Circular dependency detected: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// YAML parsing errors
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn context_suffix(context: &Option<String>) -> String {
    match context {
        Some(ctx) => format!(" (context '{}')", ctx),
        None => String::new(),
    }
}

impl RunbookError {
    /// Process exit code for errors raised before execution
    pub fn exit_code(&self) -> i32 {
        2
    }
}

/// Configuration parsing and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to find config file (searched: {0})")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Task '{task}' references undefined task '{reference}'")]
    UnknownTask { task: String, reference: String },

    #[error("Task '{task}' targets undefined host '{host}'")]
    UnknownHost { task: String, host: String },

    #[error("Job '{0}' is not defined")]
    JobNotFound(String),

    #[error("Invalid timeout for task '{task}': {error}")]
    InvalidTimeout { task: String, error: String },

    #[error("'{0}' is defined more than once")]
    Duplicate(String),

    #[error("Failed to include file '{path}': {error}")]
    IncludeFile { path: PathBuf, error: String },
}

/// Errors local to a single node; they fail that node only
#[derive(Error, Debug, Clone)]
pub enum ExecutionError {
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Condition error: {0}")]
    Condition(#[from] ConditionError),

    #[error("Command failed with exit code {}", exit_code_text(.exit_code))]
    RuntimeExec { exit_code: Option<i32> },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cannot reach host '{host}': {message}")]
    RemoteConnection { host: String, message: String },

    #[error("Environment error: {0}")]
    Environment(String),

    #[error("Failed to start process: {0}")]
    Spawn(String),

    #[error("Cancelled")]
    Cancelled,
}

fn exit_code_text(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none (terminated by signal)".to_string(),
    }
}

impl ExecutionError {
    /// Short, stable name of the error kind used in reports
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::Template(_) => "TemplateError",
            ExecutionError::Condition(_) => "ConditionEvaluationError",
            ExecutionError::RuntimeExec { .. } => "RuntimeExecError",
            ExecutionError::Timeout(_) => "TimeoutError",
            ExecutionError::RemoteConnection { .. } => "RemoteConnectionError",
            ExecutionError::Environment(_) => "EnvironmentError",
            ExecutionError::Spawn(_) => "SpawnError",
            ExecutionError::Cancelled => "Cancelled",
        }
    }
}

/// Template and interpolation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("Unresolved reference '{0}'")]
    Unresolved(String),

    #[error("Invalid template syntax: {0}")]
    InvalidSyntax(String),

    #[error("Recursive interpolation detected")]
    RecursiveInterpolation,
}

/// Malformed `if:` expressions
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConditionError {
    #[error("Unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },

    #[error("Unterminated string literal")]
    UnterminatedString,

    #[error("Unexpected token '{0}'")]
    UnexpectedToken(String),

    #[error("Unexpected end of expression")]
    UnexpectedEnd,

    #[error("Unknown function '{0}'")]
    UnknownFunction(String),
}

/// Specialized result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Specialized result type for node-local operations
pub type NodeResult<T> = std::result::Result<T, ExecutionError>;

/// Specialized result type for template rendering and interpolation
pub type TemplateResult<T> = std::result::Result<T, TemplateError>;
