//! Layered settings loading.
//!
//! Files are read in order, later ones overriding earlier ones:
//! `default.toml` (required), `{environment}.toml`, `local.toml`. A single
//! file given with `LOCKSTEP_CONFIG_FILE` or `--config` replaces the whole
//! chain. `LOCKSTEP_*` variables always win, with `__` between nesting
//! levels: `LOCKSTEP_EXECUTOR__MAX_POOL_SIZE` sets `executor.max_pool_size`.

use std::path::{Path, PathBuf};

use config::{Config, File, FileFormat};

use crate::config::environment::Environment;
use crate::config::error::ConfigError;
use crate::config::settings::Settings;

const CONFIG_DIR_ENV: &str = "LOCKSTEP_CONFIG_DIR";
const CONFIG_FILE_ENV: &str = "LOCKSTEP_CONFIG_FILE";
const DEFAULT_CONFIG_DIR: &str = "config";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    Layered(PathBuf),
    Single(PathBuf),
}

#[derive(Debug)]
pub struct ConfigLoader {
    source: Source,
    environment: Environment,
}

impl ConfigLoader {
    /// Loader driven by `LOCKSTEP_CONFIG_DIR`, `LOCKSTEP_CONFIG_FILE` and
    /// `LOCKSTEP_APP_ENV`. The first two are mutually exclusive.
    pub fn new() -> Result<Self, ConfigError> {
        let dir = std::env::var(CONFIG_DIR_ENV).ok();
        let file = std::env::var(CONFIG_FILE_ENV).ok();
        let source = match (dir, file) {
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingSources),
            (_, Some(file)) => Source::Single(PathBuf::from(file)),
            (dir, None) => Source::Layered(PathBuf::from(
                dir.unwrap_or_else(|| DEFAULT_CONFIG_DIR.to_string()),
            )),
        };

        Ok(Self {
            source,
            environment: Environment::from_env()?,
        })
    }

    /// Loader for one file given on the command line
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            source: Source::Single(path.into()),
            environment: Environment::default(),
        }
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Files read in override order, with whether each must exist
    fn files(&self) -> Vec<(PathBuf, bool)> {
        match &self.source {
            Source::Single(path) => vec![(path.clone(), true)],
            Source::Layered(dir) => vec![
                (dir.join("default.toml"), true),
                (dir.join(self.environment.overlay_file()), false),
                (dir.join("local.toml"), false),
            ],
        }
    }

    /// Read every source, deserialize and validate
    pub fn load(&self) -> Result<Settings, ConfigError> {
        let mut builder = Config::builder();
        for (path, required) in self.files() {
            builder = builder.add_source(file_source(&path, required)?);
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("LOCKSTEP")
                    .prefix_separator("_")
                    .separator("__")
                    .ignore_empty(true)
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config
            .try_deserialize()
            .map_err(|e| ConfigError::Malformed(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }
}

fn file_source(
    path: &Path,
    required: bool,
) -> Result<File<config::FileSourceFile, FileFormat>, ConfigError> {
    if required && !path.exists() {
        return Err(ConfigError::MissingFile(path.to_path_buf()));
    }
    let name = path
        .to_str()
        .ok_or_else(|| ConfigError::Malformed(format!("non UTF-8 path {}", path.display())))?;
    Ok(File::new(name, FileFormat::Toml).required(required))
}
