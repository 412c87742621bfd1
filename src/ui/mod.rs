//! Console output
//!
//! Everything the user is meant to read goes through here; diagnostics go
//! through `tracing` instead.

pub mod report;

pub use report::*;

use colored::Colorize;

/// Announce a task starting on a target
pub fn task_started(label: &str) {
    eprintln!("{} {}", "==>".blue().bold(), label.bold());
}

/// Echo one line of task stdout
pub fn task_stdout(label: &str, line: &str) {
    println!("{} {}", format!("[{}]", label).cyan(), line);
}

/// Echo one line of task stderr
pub fn task_stderr(label: &str, line: &str) {
    eprintln!("{} {}", format!("[{}]", label).yellow(), line);
}

/// Print a fatal error
pub fn print_error(message: &str) {
    eprintln!("{} {}", "error:".red().bold(), message);
}
