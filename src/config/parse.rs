//! Configuration file parsing and discovery

use crate::config::types::Config;
use crate::error::{ConfigError, ConfigResult, RunbookError};
use directories::ProjectDirs;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default configuration file names to search for
const CONFIG_FILE_NAMES: &[&str] = &["runbook.yml", "runbook.yaml"];

/// Find the configuration file by searching current and parent directories,
/// then the user configuration directory
pub fn find_config_file() -> ConfigResult<PathBuf> {
    let start = env::current_dir().map_err(|e| {
        ConfigError::Invalid(format!("Failed to get current directory: {}", e))
    })?;

    match find_config_file_from(start) {
        Ok(path) => Ok(path),
        Err(ConfigError::NotFound(searched)) => match user_config_file() {
            Some(path) => Ok(path),
            None => Err(ConfigError::NotFound(searched)),
        },
        Err(e) => Err(e),
    }
}

/// Find the configuration file starting from a specific directory
pub fn find_config_file_from(start_dir: PathBuf) -> ConfigResult<PathBuf> {
    let mut current_dir = start_dir;
    let mut searched_paths = Vec::new();

    loop {
        for file_name in CONFIG_FILE_NAMES {
            let config_path = current_dir.join(file_name);
            searched_paths.push(config_path.display().to_string());

            if config_path.is_file() {
                return Ok(config_path);
            }
        }

        match current_dir.parent() {
            Some(parent) => current_dir = parent.to_path_buf(),
            None => return Err(ConfigError::NotFound(searched_paths.join(", "))),
        }
    }
}

/// Per-user task file, e.g. `~/.config/runbook/runbook.yml`
fn user_config_file() -> Option<PathBuf> {
    let dirs = ProjectDirs::from("", "", "runbook")?;
    CONFIG_FILE_NAMES
        .iter()
        .map(|name| dirs.config_dir().join(name))
        .find(|path| path.is_file())
}

/// Parse a configuration file from a path
pub fn parse_config_file(path: &Path) -> Result<Config, RunbookError> {
    let contents = fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read {}: {}", path.display(), e)))?;

    parse_config(&contents, Some(path))
}

/// Parse configuration from a string
///
/// Includes are only resolved when the path of the file is known.
pub fn parse_config(yaml: &str, config_path: Option<&Path>) -> Result<Config, RunbookError> {
    let mut config: Config = serde_yaml::from_str(yaml)?;

    if let Some(path) = config_path {
        process_includes(&mut config, path)?;
    }

    Ok(config)
}

/// Parse configuration with automatic file discovery
pub fn parse_config_auto() -> Result<(Config, PathBuf), RunbookError> {
    let config_path = find_config_file()?;
    let config = parse_config_file(&config_path)?;
    Ok((config, config_path))
}

/// Merge the tasks, jobs and hosts of every file matched by `include`
fn process_includes(config: &mut Config, config_path: &Path) -> Result<(), RunbookError> {
    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));

    for pattern in std::mem::take(&mut config.include) {
        let full_pattern = base_dir.join(&pattern);
        let paths = glob::glob(&full_pattern.to_string_lossy()).map_err(|e| {
            ConfigError::IncludeFile {
                path: full_pattern.clone(),
                error: e.to_string(),
            }
        })?;

        for entry in paths {
            let path = entry.map_err(|e| ConfigError::IncludeFile {
                path: full_pattern.clone(),
                error: e.to_string(),
            })?;
            if path == config_path {
                continue;
            }
            debug!(path = %path.display(), "including task file");
            let included = load_included(&path)?;
            merge_into(&mut config.tasks, included.tasks)?;
            merge_into(&mut config.jobs, included.jobs)?;
            merge_into(&mut config.hosts, included.hosts)?;
        }
    }

    Ok(())
}

/// Load an included file; nested includes are not followed
fn load_included(path: &Path) -> ConfigResult<Config> {
    let contents = fs::read_to_string(path).map_err(|e| ConfigError::IncludeFile {
        path: path.to_path_buf(),
        error: e.to_string(),
    })?;

    serde_yaml::from_str(&contents).map_err(|e| ConfigError::IncludeFile {
        path: path.to_path_buf(),
        error: e.to_string(),
    })
}

fn merge_into<T>(target: &mut BTreeMap<String, T>, source: BTreeMap<String, T>) -> ConfigResult<()> {
    for (name, value) in source {
        match target.entry(name) {
            Entry::Occupied(entry) => return Err(ConfigError::Duplicate(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(value);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_parse_simple_config() {
        let yaml = r#"
tasks:
  hello:
    desc: Say hello
    run: echo "hello"
"#;
        let config = parse_config(yaml, None).unwrap();
        assert_eq!(config.tasks.len(), 1);
        assert!(config.tasks.contains_key("hello"));
    }

    #[test]
    fn test_find_config_in_current_dir() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("runbook.yml");
        fs::write(&config_path, "tasks:\n  test:\n    run: echo test\n").unwrap();

        let found = find_config_file_from(temp_dir.path().to_path_buf()).unwrap();
        assert_eq!(found, config_path);
    }

    #[test]
    fn test_find_config_in_parent_dir() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("runbook.yaml");
        let sub_dir = temp_dir.path().join("subdir");

        fs::create_dir(&sub_dir).unwrap();
        fs::write(&config_path, "tasks:\n  test:\n    run: echo test\n").unwrap();

        let found = find_config_file_from(sub_dir).unwrap();
        assert_eq!(found, config_path);
    }

    #[test]
    fn test_config_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let result = find_config_file_from(temp_dir.path().to_path_buf());
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_includes_are_merged() {
        let temp_dir = TempDir::new().unwrap();
        let tasks_dir = temp_dir.path().join("tasks");
        fs::create_dir(&tasks_dir).unwrap();
        fs::write(
            tasks_dir.join("build.yml"),
            "tasks:\n  build:\n    run: echo build\njobs:\n  ci:\n    steps: [build]\n",
        )
        .unwrap();
        let config_path = temp_dir.path().join("runbook.yml");
        fs::write(
            &config_path,
            "include: tasks/*.yml\ntasks:\n  test:\n    run: echo test\n",
        )
        .unwrap();

        let config = parse_config_file(&config_path).unwrap();
        assert!(config.tasks.contains_key("build"));
        assert!(config.tasks.contains_key("test"));
        assert!(config.jobs.contains_key("ci"));
    }

    #[test]
    fn test_duplicate_include_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("extra.yml"),
            "tasks:\n  test:\n    run: echo other\n",
        )
        .unwrap();
        let config_path = temp_dir.path().join("runbook.yml");
        fs::write(
            &config_path,
            "include: [extra.yml]\ntasks:\n  test:\n    run: echo test\n",
        )
        .unwrap();

        let result = parse_config_file(&config_path);
        assert!(matches!(
            result,
            Err(RunbookError::Config(ConfigError::Duplicate(name))) if name == "test"
        ));
    }

    #[test]
    fn test_parse_config_with_interpreter() {
        let yaml = r#"
interpreter:
  - bash
  - -c
tasks:
  hello:
    run: echo "hello"
"#;
        let config = parse_config(yaml, None).unwrap();
        assert_eq!(
            config.interpreter,
            Some(vec!["bash".to_string(), "-c".to_string()])
        );
    }
}
