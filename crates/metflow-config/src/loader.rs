//! Layered loading of pipeline `config.toml` files.
//!
//! A configuration is assembled from these layers, each one overriding the
//! keys it sets:
//!
//! 1. `~/.metflow/config.toml`
//! 2. `<workspace>/.metflow/config.toml`
//! 3. CLI overrides
//!
//! An explicit `--config` file replaces the first two layers. Files are merged
//! as TOML tables before deserializing, so a key written in a later file wins
//! even when it restates the built-in default.

use crate::error::{ConfigError, Layer};
use crate::{ConfigOverrides, PipelineConfig};
use std::path::{Path, PathBuf};
use toml::{Table, Value};
use tracing::{debug, trace};

const CONFIG_DIR: &str = ".metflow";
const CONFIG_FILE: &str = "config.toml";

/// Resolves the configuration of a workspace from its layers.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// `~/.metflow`, if there is a home directory
    global_dir: Option<PathBuf>,

    /// Global layer, kept after its first successful read
    global: Option<Table>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            global_dir: dirs::home_dir().map(|home| home.join(CONFIG_DIR)),
            global: None,
        }
    }

    /// Loader whose global layer lives in `global_dir` instead of `~/.metflow`.
    pub fn with_global_dir(global_dir: impl Into<PathBuf>) -> Self {
        Self {
            global_dir: Some(global_dir.into()),
            global: None,
        }
    }

    pub fn global_config_path(&self) -> Option<PathBuf> {
        self.global_dir.as_ref().map(|dir| dir.join(CONFIG_FILE))
    }

    pub fn local_config_path(&self, workspace_root: &Path) -> PathBuf {
        workspace_root.join(CONFIG_DIR).join(CONFIG_FILE)
    }

    /// Resolve global, workspace and CLI layers, then validate the result.
    pub fn load(
        &mut self,
        workspace_root: &Path,
        overrides: Option<&ConfigOverrides>,
    ) -> Result<PipelineConfig, ConfigError> {
        let mut merged = self.global_layer()?.unwrap_or_default();
        let local_path = self.local_config_path(workspace_root);
        if let Some(local) = read_layer(Layer::Workspace, &local_path)? {
            overlay(&mut merged, local);
        }
        resolve(merged, overrides)
    }

    /// Resolve a single explicit file and CLI overrides.
    ///
    /// A missing file is an error here, unlike the implicit layers.
    pub fn load_file(
        &self,
        path: &Path,
        overrides: Option<&ConfigOverrides>,
    ) -> Result<PipelineConfig, ConfigError> {
        let table = read_layer(Layer::Explicit, path)?.ok_or_else(|| ConfigError::Unreadable {
            layer: Layer::Explicit,
            path: path.to_path_buf(),
            source: std::io::ErrorKind::NotFound.into(),
        })?;
        resolve(table, overrides)
    }

    fn global_layer(&mut self) -> Result<Option<Table>, ConfigError> {
        if self.global.is_none() {
            let Some(path) = self.global_config_path() else {
                debug!("No home directory, skipping the global layer");
                return Ok(None);
            };
            self.global = read_layer(Layer::Global, &path)?;
        }
        Ok(self.global.clone())
    }

    /// Write `~/.metflow/config.toml` with the defaults unless it exists.
    pub fn init_global(&self) -> Result<PathBuf, ConfigError> {
        let dir = self.global_dir.as_ref().ok_or(ConfigError::NoHomeDir)?;
        write_defaults(dir)
    }

    /// Write `<workspace>/.metflow/config.toml` with the defaults unless it exists.
    pub fn init_local(&self, workspace_root: &Path) -> Result<PathBuf, ConfigError> {
        write_defaults(&workspace_root.join(CONFIG_DIR))
    }

    /// Forget the global layer so the next `load` reads it again.
    pub fn clear_cache(&mut self) {
        self.global = None;
    }
}

/// Parse one layer, or `None` when its file does not exist.
///
/// The layer is also checked against the schema so that a type error is
/// reported against the file that holds it.
fn read_layer(layer: Layer, path: &Path) -> Result<Option<Table>, ConfigError> {
    if !path.exists() {
        trace!("No {} config at {:?}", layer, path);
        return Ok(None);
    }
    debug!("Reading {} config from {:?}", layer, path);

    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
        layer,
        path: path.to_path_buf(),
        source,
    })?;
    let malformed = |source| ConfigError::Malformed {
        layer,
        path: path.to_path_buf(),
        source,
    };
    let table: Table = toml::from_str(&text).map_err(malformed)?;
    Value::Table(table.clone())
        .try_into::<PipelineConfig>()
        .map_err(malformed)?;
    Ok(Some(table))
}

/// Copy the keys of `upper` into `lower`, descending into tables both share.
fn overlay(lower: &mut Table, upper: Table) {
    for (key, value) in upper {
        let value = match (lower.get_mut(&key), value) {
            (Some(Value::Table(inner)), Value::Table(nested)) => {
                overlay(inner, nested);
                continue;
            }
            (_, value) => value,
        };
        lower.insert(key, value);
    }
}

fn resolve(
    merged: Table,
    overrides: Option<&ConfigOverrides>,
) -> Result<PipelineConfig, ConfigError> {
    let mut config: PipelineConfig = Value::Table(merged)
        .try_into()
        .map_err(ConfigError::Merged)?;
    if let Some(overrides) = overrides {
        config.apply_overrides(overrides);
    }
    config.validate()?;
    Ok(config)
}

fn write_defaults(dir: &Path) -> Result<PathBuf, ConfigError> {
    let path = dir.join(CONFIG_FILE);
    if path.exists() {
        return Ok(path);
    }

    let unwritable = |source| ConfigError::Unwritable {
        path: path.clone(),
        source,
    };
    std::fs::create_dir_all(dir).map_err(unwritable)?;
    let text = toml::to_string_pretty(&PipelineConfig::default())?;
    std::fs::write(&path, text).map_err(unwritable)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LogFormat, ReaderConfig, SchedulerMode, Section};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    /// Home and workspace directories for one test
    struct Dirs {
        _temp: TempDir,
        global: PathBuf,
        workspace: PathBuf,
    }

    impl Dirs {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let global = temp.path().join("home/.metflow");
            let workspace = temp.path().join("workspace");
            std::fs::create_dir_all(&workspace).unwrap();
            Self {
                _temp: temp,
                global,
                workspace,
            }
        }

        fn loader(&self) -> ConfigLoader {
            ConfigLoader::with_global_dir(&self.global)
        }

        fn write_global(&self, text: &str) -> PathBuf {
            write(&self.global, text)
        }

        fn write_local(&self, text: &str) -> PathBuf {
            write(&self.workspace.join(CONFIG_DIR), text)
        }
    }

    fn write(dir: &Path, text: &str) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(CONFIG_FILE);
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_no_files_gives_defaults() {
        let dirs = Dirs::new();
        let config = dirs.loader().load(&dirs.workspace, None).unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_workspace_layer_over_global() {
        let dirs = Dirs::new();
        dirs.write_global(
            r#"
            [memory]
            budget_mb = 1024

            [logging]
            level = "debug"
            "#,
        );
        dirs.write_local(
            r#"
            [memory]
            budget_mb = 256

            [scheduler]
            worker_threads = 3
            "#,
        );

        let config = dirs.loader().load(&dirs.workspace, None).unwrap();

        assert_eq!(config.memory.budget_mb, 256);
        assert_eq!(config.memory.identifier, "system");
        assert_eq!(config.scheduler.worker_threads, 3);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_workspace_can_restate_a_default() {
        let dirs = Dirs::new();
        dirs.write_global("[scheduler]\nmode = \"single\"\nmax_gpu_tasks = 4\n");
        dirs.write_local("[scheduler]\nmode = \"multi\"\n");

        let config = dirs.loader().load(&dirs.workspace, None).unwrap();

        assert_eq!(config.scheduler.mode, SchedulerMode::Multi);
        assert_eq!(config.scheduler.max_gpu_tasks, 4);
    }

    #[test]
    fn test_log_file_is_inherited() {
        let dirs = Dirs::new();
        dirs.write_global("[logging]\nfile = \"/var/log/metflow.log\"\n");
        dirs.write_local("[logging]\nformat = \"json\"\n");

        let config = dirs.loader().load(&dirs.workspace, None).unwrap();

        assert_eq!(config.logging.file, Some(PathBuf::from("/var/log/metflow.log")));
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_cli_overrides_all_layers() {
        let dirs = Dirs::new();
        dirs.write_local("[scheduler]\nmode = \"multi\"\n");
        let overrides = ConfigOverrides {
            scheduler_mode: Some(SchedulerMode::Single),
            log_level: Some("trace".to_string()),
            log_format: Some(LogFormat::Json),
            ..Default::default()
        };

        let config = dirs.loader().load(&dirs.workspace, Some(&overrides)).unwrap();

        assert_eq!(config.scheduler.mode, SchedulerMode::Single);
        assert_eq!(config.logging.level, "trace");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_setting_is_rejected_after_merge() {
        let dirs = Dirs::new();
        dirs.write_local("[scheduler]\nmax_gpu_tasks = 0\n");

        let err = dirs.loader().load(&dirs.workspace, None).unwrap_err();

        assert_eq!(err.section(), Some(Section::Scheduler));
    }

    #[test]
    fn test_bad_toml_names_layer_and_file() {
        let dirs = Dirs::new();
        let path = dirs.write_local("[memory\nbudget_mb = ");

        let err = dirs.loader().load(&dirs.workspace, None).unwrap_err();

        assert!(matches!(
            err,
            ConfigError::Malformed {
                layer: Layer::Workspace,
                ..
            }
        ));
        assert_eq!(err.path(), Some(path.as_path()));
    }

    #[test]
    fn test_type_error_is_blamed_on_its_file() {
        let dirs = Dirs::new();
        let global = dirs.write_global("[reader]\nnlon = \"wide\"\n");
        dirs.write_local("[reader]\nnlat = 10\n");

        let err = dirs.loader().load(&dirs.workspace, None).unwrap_err();

        assert!(matches!(
            err,
            ConfigError::Malformed {
                layer: Layer::Global,
                ..
            }
        ));
        assert_eq!(err.path(), Some(global.as_path()));
    }

    #[test]
    fn test_explicit_file_skips_other_layers() {
        let dirs = Dirs::new();
        dirs.write_local("[reader]\nnlev = 7\n");
        let path = dirs.workspace.join("pipeline.toml");
        std::fs::write(&path, "[reader]\nnlon = 36\nlatency_ms = 5\n").unwrap();

        let config = dirs.loader().load_file(&path, None).unwrap();

        assert_eq!(config.reader.nlon, 36);
        assert_eq!(config.reader.nlev, ReaderConfig::default().nlev);
        assert_eq!(config.reader.latency_ms, 5);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dirs = Dirs::new();
        let path = dirs.workspace.join("absent.toml");

        let err = dirs.loader().load_file(&path, None).unwrap_err();

        assert!(matches!(
            err,
            ConfigError::Unreadable {
                layer: Layer::Explicit,
                ..
            }
        ));
    }

    #[test]
    fn test_init_local_writes_loadable_defaults() {
        let dirs = Dirs::new();
        let loader = dirs.loader();

        let path = loader.init_local(&dirs.workspace).unwrap();

        assert!(path.ends_with(".metflow/config.toml"));
        let config = loader.load_file(&path, None).unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_init_global_keeps_existing_file() {
        let dirs = Dirs::new();
        dirs.write_global("[memory]\nbudget_mb = 64\n");

        let path = dirs.loader().init_global().unwrap();

        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("budget_mb = 64"));
    }

    #[test]
    fn test_global_layer_is_cached_until_cleared() {
        let dirs = Dirs::new();
        dirs.write_global("[logging]\nlevel = \"debug\"\n");
        let mut loader = dirs.loader();

        assert_eq!(loader.load(&dirs.workspace, None).unwrap().logging.level, "debug");

        dirs.write_global("[logging]\nlevel = \"warn\"\n");
        assert_eq!(loader.load(&dirs.workspace, None).unwrap().logging.level, "debug");

        loader.clear_cache();
        assert_eq!(loader.load(&dirs.workspace, None).unwrap().logging.level, "warn");
    }

    #[test]
    fn test_overlay_replaces_scalars_and_merges_tables() {
        let mut lower: Table = toml::from_str("[memory]\nbudget_mb = 1\nidentifier = \"a\"\n").unwrap();
        let upper: Table = toml::from_str("[memory]\nbudget_mb = 2\n[reader]\nnlon = 3\n").unwrap();

        overlay(&mut lower, upper);

        assert_eq!(lower["memory"]["budget_mb"].as_integer(), Some(2));
        assert_eq!(lower["memory"]["identifier"].as_str(), Some("a"));
        assert_eq!(lower["reader"]["nlon"].as_integer(), Some(3));
    }
}
