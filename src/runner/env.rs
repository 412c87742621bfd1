//! Environment propagation between tasks
//!
//! Each running node gets three private channel files. After the node
//! finishes they are parsed into [`ChannelData`], folded into the node's
//! [`Exported`] environment, and merged into the [`InheritedEnv`] of every
//! dependent when it becomes ready. Nothing here touches the orchestrator's
//! own process environment.

use crate::error::{ExecutionError, NodeResult};
use crate::runner::interpolate::interpolate;
use crate::runner::task::DotenvSource;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::warn;

/// Variable naming the env channel file inside a task body
pub const ENV_CHANNEL_VAR: &str = "RUNBOOK_ENV";
/// Variable naming the path channel file inside a task body
pub const PATH_CHANNEL_VAR: &str = "RUNBOOK_PATH";
/// Variable naming the outputs channel file inside a task body
pub const OUTPUT_CHANNEL_VAR: &str = "RUNBOOK_OUTPUT";

const ENV_FILE: &str = "env";
const PATH_FILE: &str = "path";
const OUTPUT_FILE: &str = "output";

/// The three node-scoped channel files, removed on drop
#[derive(Debug)]
pub struct Channels {
    dir: TempDir,
}

impl Channels {
    pub fn create() -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("runbook-").tempdir()?;
        for name in [ENV_FILE, PATH_FILE, OUTPUT_FILE] {
            fs::write(dir.path().join(name), "")?;
        }
        Ok(Channels { dir })
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn env_file(&self) -> PathBuf {
        self.dir().join(ENV_FILE)
    }

    pub fn path_file(&self) -> PathBuf {
        self.dir().join(PATH_FILE)
    }

    pub fn output_file(&self) -> PathBuf {
        self.dir().join(OUTPUT_FILE)
    }

    /// Channel variables pointing at the local files
    pub fn vars(&self) -> Vec<(String, String)> {
        Self::vars_under(&self.dir().to_string_lossy())
    }

    /// Channel variables for a body that sees the channel directory at `root`
    pub fn vars_under(root: &str) -> Vec<(String, String)> {
        let root = root.trim_end_matches('/');
        vec![
            (ENV_CHANNEL_VAR.to_string(), format!("{}/{}", root, ENV_FILE)),
            (PATH_CHANNEL_VAR.to_string(), format!("{}/{}", root, PATH_FILE)),
            (OUTPUT_CHANNEL_VAR.to_string(), format!("{}/{}", root, OUTPUT_FILE)),
        ]
    }

    /// Read and parse whatever the body wrote
    pub fn collect(&self, origin: &str) -> io::Result<ChannelData> {
        Ok(ChannelData {
            env: parse_assignments(&fs::read_to_string(self.env_file())?, origin),
            path: parse_paths(&fs::read_to_string(self.path_file())?),
            outputs: parse_assignments(&fs::read_to_string(self.output_file())?, origin),
        })
    }
}

/// Parsed contents of a node's channels
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelData {
    pub env: Vec<(String, String)>,
    pub path: Vec<String>,
    pub outputs: Vec<(String, String)>,
}

/// Parse `KEY=value` lines and `KEY<<DELIM` heredocs.
///
/// Blank lines and `#` comments are ignored; malformed lines are logged and
/// skipped.
pub fn parse_assignments(text: &str, origin: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut lines = text.lines();

    while let Some(line) = lines.next() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let heredoc = trimmed
            .split_once("<<")
            .filter(|(key, _)| !key.contains('='));
        if let Some((key, delimiter)) = heredoc {
            let (key, delimiter) = (key.trim(), delimiter.trim());
            let mut body = Vec::new();
            let mut closed = false;
            for line in lines.by_ref() {
                if line.trim_end() == delimiter {
                    closed = true;
                    break;
                }
                body.push(line);
            }
            if !closed || !valid_key(key) {
                warn!(task = origin, key, "ignoring malformed heredoc in channel file");
                continue;
            }
            pairs.push((key.to_string(), body.join("\n")));
            continue;
        }

        match line.split_once('=') {
            Some((key, value)) if valid_key(key.trim()) => {
                pairs.push((key.trim().to_string(), value.to_string()));
            }
            _ => warn!(task = origin, line, "ignoring malformed line in channel file"),
        }
    }

    pairs
}

fn valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// Parse one directory per line
pub fn parse_paths(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// A value together with the node it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvValue {
    pub value: String,
    pub origin: String,
}

/// What a succeeded node hands to its dependents
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exported {
    pub vars: BTreeMap<String, EnvValue>,
    /// Front entry has the highest priority
    pub path: Vec<EnvValue>,
    pub outputs: BTreeMap<String, String>,
}

impl Exported {
    /// The node's inherited environment overlaid with its own channel writes
    pub fn from_node(origin: &str, inherited: &InheritedEnv, data: ChannelData) -> Self {
        let mut vars = inherited.vars.clone();
        for (key, value) in data.env {
            vars.insert(
                key,
                EnvValue {
                    value,
                    origin: origin.to_string(),
                },
            );
        }

        let own = data.path.into_iter().map(|dir| EnvValue {
            value: dir,
            origin: origin.to_string(),
        });
        let path = dedup_path(own.chain(inherited.path.iter().cloned()));

        Exported {
            vars,
            path,
            outputs: data.outputs.into_iter().collect(),
        }
    }
}

fn dedup_path(entries: impl Iterator<Item = EnvValue>) -> Vec<EnvValue> {
    let mut seen = HashSet::new();
    entries.filter(|e| seen.insert(e.value.clone())).collect()
}

/// Environment assembled for a node from its succeeded dependencies
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InheritedEnv {
    vars: BTreeMap<String, EnvValue>,
    path: Vec<EnvValue>,
    outputs: BTreeMap<String, BTreeMap<String, String>>,
}

impl InheritedEnv {
    /// Merge dependency exports given in dependency order.
    ///
    /// For a key set by several dependencies the later dependency wins, and
    /// a later dependency's path entries go in front of earlier ones.
    pub fn merge<'a>(exports: impl IntoIterator<Item = (&'a str, &'a Exported)>) -> Self {
        let mut merged = InheritedEnv::default();
        for (name, exported) in exports {
            for (key, value) in &exported.vars {
                merged.vars.insert(key.clone(), value.clone());
            }
            let previous = std::mem::take(&mut merged.path);
            merged.path = dedup_path(exported.path.iter().cloned().chain(previous));
            merged
                .outputs
                .insert(name.to_string(), exported.outputs.clone());
        }
        merged
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(|v| v.value.as_str())
    }

    /// Node that contributed `key`
    pub fn origin(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(|v| v.origin.as_str())
    }

    pub fn vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.value.as_str()))
    }

    pub fn path_entries(&self) -> impl Iterator<Item = &str> {
        self.path.iter().map(|e| e.value.as_str())
    }

    /// Output `key` of the direct dependency `task`
    pub fn output(&self, task: &str, key: &str) -> Option<&str> {
        self.outputs.get(task)?.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty() && self.path.is_empty() && self.outputs.is_empty()
    }
}

/// Environment handed to a backend: explicitly set variables plus path
/// entries to put in front of `PATH`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskEnv {
    pub vars: BTreeMap<String, String>,
    pub path_prefix: Vec<String>,
}

impl TaskEnv {
    /// Layer the environment of a task, lowest precedence first: shared
    /// `env`, dotenv files, inherited values, declared task `env`.
    ///
    /// `ambient` is what `${VAR}` references may fall back to (the
    /// orchestrator's environment for local backends).
    pub fn compose(
        ambient: &HashMap<String, String>,
        shared: &[(String, String)],
        dotenv: &[DotenvSource],
        inherited: &InheritedEnv,
        declared: &[(String, String)],
    ) -> NodeResult<Self> {
        let mut scope = ambient.clone();
        let mut vars = BTreeMap::new();
        let mut set = |key: String, value: String, scope: &mut HashMap<String, String>| {
            scope.insert(key.clone(), value.clone());
            vars.insert(key, value);
        };

        for (key, value) in shared {
            let value = interpolate(value, &scope)?;
            set(key.clone(), value, &mut scope);
        }
        for (key, value) in load_dotenv(dotenv)? {
            set(key, value, &mut scope);
        }
        for (key, value) in inherited.vars() {
            set(key.to_string(), value.to_string(), &mut scope);
        }
        for (key, value) in declared {
            let value = interpolate(value, &scope)?;
            set(key.clone(), value, &mut scope);
        }

        Ok(TaskEnv {
            vars,
            path_prefix: inherited.path_entries().map(str::to_string).collect(),
        })
    }

    /// `PATH` with the inherited entries in front of `base`
    pub fn joined_path(&self, base: Option<&str>) -> Option<String> {
        if self.path_prefix.is_empty() {
            return None;
        }
        let mut parts: Vec<&str> = self.path_prefix.iter().map(String::as_str).collect();
        if let Some(base) = base.filter(|b| !b.is_empty()) {
            parts.push(base);
        }
        Some(parts.join(":"))
    }
}

/// Load dotenv files in order
pub fn load_dotenv(sources: &[DotenvSource]) -> NodeResult<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for source in sources {
        if !source.path.is_file() {
            if source.optional {
                continue;
            }
            return Err(ExecutionError::Environment(format!(
                "dotenv file '{}' not found",
                source.path.display()
            )));
        }

        let entries = dotenvy::from_path_iter(&source.path).map_err(|e| {
            ExecutionError::Environment(format!("{}: {}", source.path.display(), e))
        })?;
        for entry in entries {
            let (key, value) = entry.map_err(|e| {
                ExecutionError::Environment(format!("{}: {}", source.path.display(), e))
            })?;
            pairs.push((key, value));
        }
    }
    Ok(pairs)
}
