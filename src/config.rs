use anyhow::{Context, Result};
use bm857_lib::calibration::CalibrationConfig;
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Contents of the calibration configuration file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub calibration: CalibrationConfig,
    /// CSV file the calibration rounds are appended to.
    pub log_file: Option<PathBuf>,
}

impl Config {
    pub const DEFAULT_CONFIG_FILE: &'static str = "calibration.yml";

    pub fn load(path: &Path) -> Result<Self> {
        log::debug!("Loading config file from {path:?}");
        let config_file =
            File::open(path).with_context(|| format!("Cannot open config file {path:?}"))?;
        let config: Config = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot parse config file {path:?}"))?;
        Ok(config)
    }
}

/// Loads `path`, or the default file if it exists, or the built-in defaults.
pub(crate) fn get_config(path: Option<&Path>) -> Result<Config> {
    let default_file = Path::new(Config::DEFAULT_CONFIG_FILE);
    match path {
        Some(path) => Config::load(path),
        None if default_file.exists() => Config::load(default_file),
        None => {
            log::debug!("No config file found, using built-in calibration defaults");
            Ok(Config::default())
        }
    }
}
