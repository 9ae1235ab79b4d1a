//! Layered configuration loading.
//!
//! ```text
//! defaults ─▶ ~/.blim/config.toml ─▶ <project>/.blim/config.toml ─▶ BLIM_*
//! ```
//!
//! A file only overrides the values it sets to something other than the
//! default. Missing files are skipped.

use super::{
    default_config_path, BridgeConfig, ConfigError, PROJECT_CONFIG_DIR, PROJECT_CONFIG_FILE,
};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Environment variables read by the last layer, in application order.
pub const ENV_VARS: [&str; 6] = [
    "BLIM_OUTPUT_CAPACITY",
    "BLIM_WATCHDOG_INSTRUCTIONS",
    "BLIM_COLLECTOR_BUFFER",
    "BLIM_READ_TIMEOUT_MS",
    "BLIM_WRITE_TIMEOUT_MS",
    "BLIM_DISPATCH_QUEUE",
];

#[derive(Debug, Clone, Default)]
enum GlobalFile {
    #[default]
    Home,
    At(PathBuf),
    Off,
}

/// Builds a [`BridgeConfig`] from defaults, files and the environment.
///
/// ```ignore
/// use blim_runtime::config::ConfigLoader;
///
/// let config = ConfigLoader::new()
///     .with_project_root(std::env::current_dir()?)
///     .load()?;
/// println!("queue: {}", config.dispatch.queue_capacity);
/// ```
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    global: GlobalFile,
    project_root: Option<PathBuf>,
    project_enabled: bool,
    env_enabled: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self {
            global: GlobalFile::Home,
            project_root: None,
            project_enabled: true,
            env_enabled: true,
        }
    }
}

impl ConfigLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the global layer from `path` instead of `~/.blim/config.toml`.
    #[must_use]
    pub fn with_global_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.global = GlobalFile::At(path.into());
        self
    }

    /// Enables the project layer at `<root>/.blim/config.toml`.
    #[must_use]
    pub fn with_project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.project_root = Some(root.into());
        self
    }

    #[must_use]
    pub fn skip_global_config(mut self) -> Self {
        self.global = GlobalFile::Off;
        self
    }

    #[must_use]
    pub fn skip_project_config(mut self) -> Self {
        self.project_enabled = false;
        self
    }

    /// Ignores `BLIM_*` variables, for deterministic tests.
    #[must_use]
    pub fn skip_env_vars(mut self) -> Self {
        self.env_enabled = false;
        self
    }

    /// Config files consulted by [`load`](Self::load), lowest priority first.
    #[must_use]
    pub fn sources(&self) -> Vec<PathBuf> {
        let mut files = Vec::with_capacity(2);
        match &self.global {
            GlobalFile::Home => files.push(default_config_path()),
            GlobalFile::At(path) => files.push(path.clone()),
            GlobalFile::Off => {}
        }
        if self.project_enabled {
            if let Some(root) = &self.project_root {
                files.push(root.join(PROJECT_CONFIG_DIR).join(PROJECT_CONFIG_FILE));
            }
        }
        files
    }

    /// Merges every enabled layer and validates the result.
    ///
    /// # Errors
    ///
    /// An existing file that cannot be read or parsed, a `BLIM_*` variable
    /// that is not an unsigned integer, or a merged value out of range.
    pub fn load(&self) -> Result<BridgeConfig, ConfigError> {
        let mut config = BridgeConfig::default();

        for path in self.sources() {
            match read_layer(&path)? {
                Some(layer) => {
                    config.merge(&layer);
                    debug!(path = %path.display(), "config layer applied");
                }
                None => trace!(path = %path.display(), "config layer absent"),
            }
        }

        if self.env_enabled {
            for name in ENV_VARS {
                if let Ok(raw) = std::env::var(name) {
                    apply_env_var(&mut config, name, &raw)?;
                    debug!(var = name, "config override from environment");
                }
            }
        }

        config.validate()?;
        Ok(config)
    }
}

fn read_layer(path: &Path) -> Result<Option<BridgeConfig>, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ConfigError::read_file(path, e)),
    };
    BridgeConfig::from_toml(&text)
        .map(Some)
        .map_err(|e| ConfigError::parse_toml(path, e))
}

fn apply_env_var(config: &mut BridgeConfig, name: &str, raw: &str) -> Result<(), ConfigError> {
    fn num<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
        raw.trim()
            .parse()
            .map_err(|_| ConfigError::invalid_env_var(name, "expected unsigned integer"))
    }

    match name {
        "BLIM_OUTPUT_CAPACITY" => config.engine.output_capacity = num(name, raw)?,
        "BLIM_WATCHDOG_INSTRUCTIONS" => config.engine.watchdog_instructions = num(name, raw)?,
        "BLIM_COLLECTOR_BUFFER" => config.collector.buffer_size = num(name, raw)?,
        "BLIM_READ_TIMEOUT_MS" => config.device.read_timeout_ms = num(name, raw)?,
        "BLIM_WRITE_TIMEOUT_MS" => config.device.write_timeout_ms = num(name, raw)?,
        "BLIM_DISPATCH_QUEUE" => config.dispatch.queue_capacity = num(name, raw)?,
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_layer(dir: &Path, toml: &str) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(PROJECT_CONFIG_FILE);
        std::fs::write(&path, toml).unwrap();
        path
    }

    fn isolated() -> ConfigLoader {
        ConfigLoader::new().skip_env_vars()
    }

    #[test]
    fn no_layers_gives_defaults() {
        let config = isolated()
            .skip_global_config()
            .skip_project_config()
            .load()
            .unwrap();
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn sources_follow_priority() {
        let loader = ConfigLoader::new()
            .with_global_config("/etc/blim.toml")
            .with_project_root("/work/hrm");
        assert_eq!(
            loader.sources(),
            vec![
                PathBuf::from("/etc/blim.toml"),
                PathBuf::from("/work/hrm/.blim/config.toml"),
            ]
        );
        assert!(loader.clone().skip_project_config().sources().len() == 1);
        assert!(loader.skip_global_config().sources()[0].ends_with(".blim/config.toml"));
    }

    #[test]
    fn project_layer_wins_over_global() {
        let home = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let global = write_layer(
            home.path(),
            "[engine]\noutput_capacity = 50\n\n[device]\nread_timeout_ms = 1000\n",
        );
        write_layer(
            &project.path().join(PROJECT_CONFIG_DIR),
            "[device]\nread_timeout_ms = 250\n",
        );

        let config = isolated()
            .with_global_config(&global)
            .with_project_root(project.path())
            .load()
            .unwrap();
        assert_eq!(config.engine.output_capacity, 50);
        assert_eq!(config.device.read_timeout_ms, 250);
    }

    #[test]
    fn absent_files_are_skipped() {
        let config = isolated()
            .with_global_config("/nonexistent/blim/config.toml")
            .with_project_root("/nonexistent/project")
            .load()
            .unwrap();
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn broken_toml_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_layer(dir.path(), "[engine\noutput_capacity = ");
        let err = isolated()
            .with_global_config(&path)
            .skip_project_config()
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::ParseToml { .. }));
        assert!(err.to_string().contains(&path.display().to_string()));
    }

    #[test]
    fn out_of_range_value_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_layer(dir.path(), "[collector]\nbuffer_size = 0\n");
        let err = isolated()
            .with_global_config(&path)
            .skip_project_config()
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "collector.buffer_size", .. }));
    }

    #[test]
    fn env_values_are_parsed() {
        let mut config = BridgeConfig::default();
        apply_env_var(&mut config, "BLIM_DISPATCH_QUEUE", " 32 ").unwrap();
        apply_env_var(&mut config, "BLIM_READ_TIMEOUT_MS", "750").unwrap();
        apply_env_var(&mut config, "BLIM_UNRELATED", "x").unwrap();
        assert_eq!(config.dispatch.queue_capacity, 32);
        assert_eq!(config.device.read_timeout_ms, 750);

        let err = apply_env_var(&mut config, "BLIM_DISPATCH_QUEUE", "many").unwrap_err();
        assert!(err.to_string().contains("BLIM_DISPATCH_QUEUE"));
        let err = apply_env_var(&mut config, "BLIM_OUTPUT_CAPACITY", "-1").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvVar { .. }));
    }

    #[test]
    fn env_layer_applies_last() {
        // Only this test sets BLIM_WRITE_TIMEOUT_MS.
        std::env::set_var("BLIM_WRITE_TIMEOUT_MS", "1234");
        let config = ConfigLoader::new()
            .skip_global_config()
            .skip_project_config()
            .load();
        std::env::remove_var("BLIM_WRITE_TIMEOUT_MS");
        assert_eq!(config.unwrap().device.write_timeout_ms, 1234);
    }
}
