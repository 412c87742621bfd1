//! Context-based task routing
//!
//! Definitions live in a two-level table: base definitions keyed by name and
//! overrides keyed by `(name, context)`. Every task reference goes through
//! [`TaskTable::resolve`], so the active context applies transitively to
//! `needs`, hooks and job steps as well as to CLI targets.

use crate::error::{ConfigError, ConfigResult, RunbookError};
use crate::runner::task::{split_task_key, TaskDefinition};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Default, Clone)]
pub struct TaskTable {
    base: BTreeMap<String, Arc<TaskDefinition>>,
    overrides: HashMap<(String, String), Arc<TaskDefinition>>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition under its base name or its `(name, context)` pair
    pub fn insert(&mut self, definition: TaskDefinition) -> ConfigResult<()> {
        let key = definition.key();
        let definition = Arc::new(definition);

        let previous = match &definition.context {
            Some(context) => self
                .overrides
                .insert((definition.name.clone(), context.clone()), definition),
            None => self.base.insert(definition.name.clone(), definition),
        };

        match previous {
            Some(_) => Err(ConfigError::Duplicate(key)),
            None => Ok(()),
        }
    }

    /// Resolve a task reference under the active context.
    ///
    /// `name:context` overrides win over the bare `name`; a reference that is
    /// itself qualified resolves to that override directly.
    pub fn resolve(
        &self,
        name: &str,
        context: Option<&str>,
    ) -> Result<&Arc<TaskDefinition>, RunbookError> {
        if let Some(context) = context {
            if let Some(definition) = self.overrides.get(&(name.to_string(), context.to_string())) {
                return Ok(definition);
            }
        }

        if let Some(definition) = self.base.get(name) {
            return Ok(definition);
        }

        if let (base, Some(qualifier)) = split_task_key(name) {
            if let Some(definition) = self
                .overrides
                .get(&(base.to_string(), qualifier.to_string()))
            {
                return Ok(definition);
            }
        }

        Err(RunbookError::TaskNotFound {
            name: name.to_string(),
            context: context.map(str::to_string),
        })
    }

    /// Base definitions in name order
    pub fn base_definitions(&self) -> impl Iterator<Item = &Arc<TaskDefinition>> {
        self.base.values()
    }

    /// Contexts that override `name`, sorted
    pub fn contexts_for(&self, name: &str) -> Vec<&str> {
        let mut contexts: Vec<&str> = self
            .overrides
            .keys()
            .filter(|(base, _)| base == name)
            .map(|(_, context)| context.as_str())
            .collect();
        contexts.sort_unstable();
        contexts
    }

    /// Base names that exist only as overrides, sorted
    pub fn override_only_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .overrides
            .keys()
            .map(|(name, _)| name.as_str())
            .filter(|name| !self.base.contains_key(*name))
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    pub fn len(&self) -> usize {
        self.base.len() + self.overrides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskConfig;
    use std::path::Path;

    fn definition(key: &str, body: &str) -> TaskDefinition {
        let config = TaskConfig {
            run: body.to_string(),
            ..Default::default()
        };
        TaskDefinition::from_config(key, &config, Path::new("/"), &["sh".into(), "-c".into()])
            .unwrap()
    }

    fn table() -> TaskTable {
        let mut table = TaskTable::new();
        table.insert(definition("deploy", "echo base")).unwrap();
        table.insert(definition("deploy:prod", "echo prod")).unwrap();
        table.insert(definition("seed:ci", "echo seed")).unwrap();
        table
    }

    #[test]
    fn test_override_wins_for_matching_context() {
        let table = table();
        assert_eq!(table.resolve("deploy", Some("prod")).unwrap().body, "echo prod");
    }

    #[test]
    fn test_falls_back_to_base() {
        let table = table();
        assert_eq!(table.resolve("deploy", Some("staging")).unwrap().body, "echo base");
        assert_eq!(table.resolve("deploy", None).unwrap().body, "echo base");
    }

    #[test]
    fn test_qualified_reference() {
        let table = table();
        assert_eq!(table.resolve("deploy:prod", None).unwrap().body, "echo prod");
    }

    #[test]
    fn test_override_only_task() {
        let table = table();
        assert_eq!(table.resolve("seed", Some("ci")).unwrap().body, "echo seed");
        assert!(matches!(
            table.resolve("seed", Some("prod")),
            Err(RunbookError::TaskNotFound { name, context })
                if name == "seed" && context.as_deref() == Some("prod")
        ));
        assert_eq!(table.override_only_names(), vec!["seed"]);
    }

    #[test]
    fn test_missing_task() {
        assert!(matches!(
            table().resolve("nope", None),
            Err(RunbookError::TaskNotFound { .. })
        ));
    }

    #[test]
    fn test_duplicate_insert() {
        let mut table = table();
        assert!(matches!(
            table.insert(definition("deploy:prod", "again")),
            Err(ConfigError::Duplicate(key)) if key == "deploy:prod"
        ));
    }

    #[test]
    fn test_contexts_for() {
        assert_eq!(table().contexts_for("deploy"), vec!["prod"]);
    }
}
