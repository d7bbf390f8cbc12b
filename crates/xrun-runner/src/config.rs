use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use xrun_core::{Result, XrunError};

use crate::coordinator::{DEFAULT_TEMPLATE, DEFAULT_TIMEOUT};
use crate::external::ExternalModelConfig;

fn default_expdir() -> PathBuf {
    PathBuf::from("out")
}

fn default_rundir_template() -> String {
    DEFAULT_TEMPLATE.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    #[serde(default)]
    pub model: Option<ExternalModelConfig>,
    #[serde(default = "default_expdir")]
    pub expdir: PathBuf,
    #[serde(default = "default_rundir_template")]
    pub rundir_template: String,
    #[serde(default)]
    pub autodir: bool,
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<f64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: None,
            expdir: default_expdir(),
            rundir_template: default_rundir_template(),
            autodir: false,
            max_workers: None,
            timeout_secs: None,
        }
    }
}

impl RunConfig {
    pub fn timeout(&self) -> Result<Duration> {
        match self.timeout_secs {
            None => Ok(DEFAULT_TIMEOUT),
            Some(secs) => Duration::try_from_secs_f64(secs).map_err(|_| {
                XrunError::Configuration(format!("invalid timeout_secs: {}", secs))
            }),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == Some(0) {
            return Err(XrunError::Configuration(
                "max_workers must be at least 1".to_string(),
            ));
        }
        self.timeout()?;
        if let Some(model) = &self.model {
            model.validate()?;
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<RunConfig> {
    let text = fs::read_to_string(path)?;
    let config: RunConfig = serde_yaml::from_str(&text)?;
    config.validate()?;
    Ok(config)
}
