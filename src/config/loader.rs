//! Configuration loading with hierarchy merging.
//!
//! Missing system/user config files are not errors - they are skipped.
//! A missing `--config` file is an error (the operator asked for it).
//! Invalid TOML is always an error (fail fast with a clear message).

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::ConfigError;
use super::schema::SecurityConfig;

/// System-wide configuration path.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/audio-gate/config.toml";

/// User configuration directory name under the platform config dir.
pub const USER_CONFIG_DIR: &str = "audio-gate";

/// User configuration filename.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Embedded default configuration, compiled into the binary.
const DEFAULT_CONFIG: &str = include_str!("../../config/default.toml");

/// Configuration loader with support for hierarchy merging.
pub struct ConfigLoader {
    system_path: PathBuf,
    user_path: PathBuf,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Create a new loader with the default system and user paths.
    #[must_use]
    pub fn new() -> Self {
        let user_config_dir = dirs::config_dir()
            .map(|p| p.join(USER_CONFIG_DIR))
            .unwrap_or_else(|| PathBuf::from(".config").join(USER_CONFIG_DIR));

        Self {
            system_path: PathBuf::from(SYSTEM_CONFIG_PATH),
            user_path: user_config_dir.join(USER_CONFIG_FILE),
        }
    }

    /// Create a loader with custom paths (for testing).
    #[must_use]
    pub fn with_paths(system_path: PathBuf, user_path: PathBuf) -> Self {
        Self {
            system_path,
            user_path,
        }
    }

    /// Load and merge configuration from all sources.
    ///
    /// Merge order: embedded defaults → system → user → `extra_config`.
    pub fn load(&self, extra_config: Option<&Path>) -> Result<SecurityConfig, ConfigError> {
        let mut config: SecurityConfig =
            toml::from_str(DEFAULT_CONFIG).map_err(|e| ConfigError::ParseError {
                path: PathBuf::from("<embedded:default.toml>"),
                source: e,
            })?;
        debug!("Loaded embedded default configuration");

        if let Some(system_config) = self.load_file(&self.system_path)? {
            config.merge(system_config);
            debug!("Loaded system config from {:?}", self.system_path);
        }

        if let Some(user_config) = self.load_file(&self.user_path)? {
            config.merge(user_config);
            debug!("Loaded user config from {:?}", self.user_path);
        }

        if let Some(path) = extra_config {
            match self.load_file(path)? {
                Some(extra) => {
                    config.merge(extra);
                    debug!("Loaded additional config from {:?}", path);
                }
                None => {
                    // Unlike system/user config, a missing explicit config is an error
                    return Err(ConfigError::ReadError {
                        path: path.to_path_buf(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "Specified config file not found",
                        ),
                    });
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Load a single config file, returning `None` if it does not exist.
    fn load_file(&self, path: &Path) -> Result<Option<SecurityConfig>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;

        Ok(Some(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn loader_without_ambient_files(dir: &Path) -> ConfigLoader {
        ConfigLoader::with_paths(dir.join("no-system.toml"), dir.join("no-user.toml"))
    }

    #[test]
    fn test_embedded_defaults_parse() {
        let dir = tempfile::tempdir().unwrap();
        let config = loader_without_ambient_files(dir.path()).load(None).unwrap();
        assert_eq!(config.limits.max_file_size_mb, 200);
        assert_eq!(config.admission.max_concurrent_processes, 4);
    }

    #[test]
    fn test_user_config_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let user_path = dir.path().join("config.toml");
        let mut f = fs::File::create(&user_path).unwrap();
        writeln!(f, "[limits]\nmax_file_size_mb = 42").unwrap();

        let loader = ConfigLoader::with_paths(dir.path().join("no-system.toml"), user_path);
        let config = loader.load(None).unwrap();
        assert_eq!(config.limits.max_file_size_mb, 42);
    }

    #[test]
    fn test_missing_explicit_config_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result =
            loader_without_ambient_files(dir.path()).load(Some(&dir.path().join("nope.toml")));
        assert!(matches!(result, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let user_path = dir.path().join("config.toml");
        fs::write(&user_path, "this is not toml [[").unwrap();

        let loader = ConfigLoader::with_paths(dir.path().join("no-system.toml"), user_path);
        assert!(matches!(
            loader.load(None),
            Err(ConfigError::ParseError { .. })
        ));
    }
}
