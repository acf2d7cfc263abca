// Configuration file loading

use super::{ConfigError, OrchestratorConfig};
use crate::parallel::workspace::WorkspaceDisposition;
use crate::utils::project_config_path;
use std::fs;
use std::path::{Path, PathBuf};

/// Command line overrides, applied on top of every file layer
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub max_workers: Option<usize>,
    pub task_timeout_secs: Option<u64>,
    pub shutdown_timeout_secs: Option<u64>,
    pub auto_commit: Option<bool>,
    pub mainline: Option<String>,
    pub workspace_disposition: Option<WorkspaceDisposition>,
    pub active_dir: Option<PathBuf>,
    pub done_dir: Option<PathBuf>,
    pub runner_command: Option<String>,
    /// Replaces the configured args when non-empty
    pub runner_args: Vec<String>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut OrchestratorConfig) {
        if let Some(v) = self.max_workers {
            config.execution.max_workers = v;
        }
        if let Some(v) = self.task_timeout_secs {
            config.execution.task_timeout_secs = v;
        }
        if let Some(v) = self.shutdown_timeout_secs {
            config.execution.shutdown_timeout_secs = v;
        }
        if let Some(v) = self.auto_commit {
            config.execution.auto_commit = v;
        }
        if let Some(v) = &self.mainline {
            config.git.mainline = v.clone();
        }
        if let Some(v) = self.workspace_disposition {
            config.git.workspace_disposition = v;
        }
        if let Some(v) = &self.active_dir {
            config.tasks.active_dir = v.clone();
        }
        if let Some(v) = &self.done_dir {
            config.tasks.done_dir = v.clone();
        }
        if let Some(v) = &self.runner_command {
            config.runner.command = Some(v.clone());
        }
        if !self.runner_args.is_empty() {
            config.runner.args = self.runner_args.clone();
        }
    }
}

/// Finds and merges the config layers
pub struct ConfigLoader {
    global_path: Option<PathBuf>,
    project_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            global_path: Self::get_global_config_path(),
            project_path: None,
        }
    }

    /// Use `<repo>/.ralph-parallel/config.toml` as the project layer
    pub fn with_project_path(mut self, repo_root: &Path) -> Self {
        self.project_path = Some(project_config_path(repo_root));
        self
    }

    /// Replace (or drop) the global layer
    pub fn with_global_path(mut self, path: Option<PathBuf>) -> Self {
        self.global_path = path;
        self
    }

    fn get_global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("ralph-parallel").join("config.toml"))
    }

    /// Defaults, then the global file, then the project file, then `overrides`.
    /// Keys merge table by table, so a project file setting only `mainline`
    /// keeps the global `maxWorkers`. Each layer is checked on its own first,
    /// so errors name the file they come from.
    pub fn load(&self, overrides: &ConfigOverrides) -> Result<OrchestratorConfig, ConfigError> {
        let mut merged = toml::Table::new();
        let mut last_path = None;
        for path in [&self.global_path, &self.project_path].into_iter().flatten() {
            if let Some(layer) = Self::read_table(path)? {
                parse_table(layer.clone(), path)?;
                log::debug!("[Config] Loaded {}", path.display());
                merge_tables(&mut merged, normalize_keys(layer));
                last_path = Some(path.clone());
            }
        }

        let mut config = parse_table(merged, &last_path.unwrap_or_default())?;

        overrides.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a single file
    pub fn load_from_path(path: &Path) -> Result<Option<OrchestratorConfig>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: OrchestratorConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(Some(config))
    }

    fn read_table(path: &Path) -> Result<Option<toml::Table>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        contents
            .parse::<toml::Table>()
            .map(Some)
            .map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
    }

    pub fn global_config_exists(&self) -> bool {
        self.global_path.as_ref().is_some_and(|p| p.exists())
    }

    pub fn project_config_exists(&self) -> bool {
        self.project_path.as_ref().is_some_and(|p| p.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_table(table: toml::Table, path: &Path) -> Result<OrchestratorConfig, ConfigError> {
    toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Rewrite snake_case keys to their camelCase names at every level, so the
/// two spellings of a key from different layers override each other
fn normalize_keys(table: toml::Table) -> toml::Table {
    table
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                toml::Value::Table(inner) => toml::Value::Table(normalize_keys(inner)),
                other => other,
            };
            (camel_case(&key), value)
        })
        .collect()
}

fn camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper = false;
    for c in key.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Recursively merge `layer` into `base`; `layer` wins on scalar conflicts
fn merge_tables(base: &mut toml::Table, layer: toml::Table) {
    for (key, value) in layer {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_no_files_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = ConfigLoader::new()
            .with_global_path(None)
            .with_project_path(temp_dir.path())
            .load(&ConfigOverrides::default())
            .unwrap();
        assert_eq!(config, OrchestratorConfig::default());
    }

    #[test]
    fn test_layers_merge_per_key() {
        let temp_dir = TempDir::new().unwrap();
        let global = temp_dir.path().join("global/config.toml");
        write(
            &global,
            "[execution]\nmaxWorkers = 6\npollIntervalMs = 100\n[git]\nmainline = \"develop\"\n",
        );
        let repo = temp_dir.path().join("repo");
        write(
            &project_config_path(&repo),
            "[execution]\nmax_workers = 2\n",
        );

        let loader = ConfigLoader::new()
            .with_global_path(Some(global))
            .with_project_path(&repo);
        assert!(loader.global_config_exists());
        assert!(loader.project_config_exists());

        let config = loader.load(&ConfigOverrides::default()).unwrap();
        assert_eq!(config.execution.max_workers, 2);
        assert_eq!(config.execution.poll_interval_ms, 100);
        assert_eq!(config.git.mainline, "develop");
    }

    #[test]
    fn test_mixed_key_spellings_across_layers() {
        let temp_dir = TempDir::new().unwrap();
        let global = temp_dir.path().join("global/config.toml");
        write(
            &global,
            "[execution]\ntask_timeout_secs = 90\n[git]\nworkspaceDisposition = \"discard-all\"\n",
        );
        let repo = temp_dir.path().join("repo");
        write(
            &project_config_path(&repo),
            "[execution]\ntaskTimeoutSecs = 30\n[git]\nworkspace_disposition = \"merge-pending\"\n",
        );

        let config = ConfigLoader::new()
            .with_global_path(Some(global))
            .with_project_path(&repo)
            .load(&ConfigOverrides::default())
            .unwrap();
        assert_eq!(config.execution.task_timeout_secs, 30);
        assert_eq!(config.git.workspace_disposition, WorkspaceDisposition::MergePending);
    }

    #[test]
    fn test_layer_error_names_its_own_file() {
        let temp_dir = TempDir::new().unwrap();
        let global = temp_dir.path().join("global/config.toml");
        write(&global, "[execution]\nmaxWorkers = \"many\"\n");
        let repo = temp_dir.path().join("repo");
        write(&project_config_path(&repo), "[execution]\nmaxWorkers = 2\n");

        let result = ConfigLoader::new()
            .with_global_path(Some(global.clone()))
            .with_project_path(&repo)
            .load(&ConfigOverrides::default());
        match result {
            Err(ConfigError::Parse { path, .. }) => assert_eq!(path, global),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_camel_case_keys() {
        assert_eq!(camel_case("max_workers"), "maxWorkers");
        assert_eq!(camel_case("maxWorkers"), "maxWorkers");
        assert_eq!(camel_case("mainline"), "mainline");
    }

    #[test]
    fn test_overrides_win() {
        let temp_dir = TempDir::new().unwrap();
        write(
            &project_config_path(temp_dir.path()),
            "[execution]\nmaxWorkers = 2\n[runner]\ncommand = \"agent\"\nargs = [\"a\"]\n",
        );

        let overrides = ConfigOverrides {
            max_workers: Some(8),
            workspace_disposition: Some(WorkspaceDisposition::DiscardAll),
            runner_args: vec!["b".to_string()],
            ..Default::default()
        };
        let config = ConfigLoader::new()
            .with_global_path(None)
            .with_project_path(temp_dir.path())
            .load(&overrides)
            .unwrap();
        assert_eq!(config.execution.max_workers, 8);
        assert_eq!(config.git.workspace_disposition, WorkspaceDisposition::DiscardAll);
        assert_eq!(config.runner.command.as_deref(), Some("agent"));
        assert_eq!(config.runner.args, vec!["b".to_string()]);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let temp_dir = TempDir::new().unwrap();
        write(
            &project_config_path(temp_dir.path()),
            "[execution]\nmaxWorkers = 0\n",
        );
        let result = ConfigLoader::new()
            .with_global_path(None)
            .with_project_path(temp_dir.path())
            .load(&ConfigOverrides::default());
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_parse_error_names_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = project_config_path(temp_dir.path());
        write(&path, "[execution\n");

        match ConfigLoader::load_from_path(&path) {
            Err(ConfigError::Parse { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected parse error, got {:?}", other),
        }
        assert!(ConfigLoader::load_from_path(&temp_dir.path().join("none.toml"))
            .unwrap()
            .is_none());
    }
}
