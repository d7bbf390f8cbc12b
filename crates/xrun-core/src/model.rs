use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::process::Command;

use crate::error::Result;
use crate::likelihood::Likelihood;
use crate::params::ParamSet;

pub type RunArgs = BTreeMap<String, String>;

pub type Output = BTreeMap<String, OutputValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    NotStarted,
    Running,
    Success,
    Failed,
    Timeout,
}

impl ModelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelStatus::NotStarted => "not_started",
            ModelStatus::Running => "running",
            ModelStatus::Success => "success",
            ModelStatus::Failed => "failed",
            ModelStatus::Timeout => "timeout",
        }
    }

    pub fn is_success(&self) -> bool {
        *self == ModelStatus::Success
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputValue {
    Scalar(f64),
    Series(Vec<f64>),
}

impl OutputValue {
    pub fn as_scalar(&self) -> f64 {
        match self {
            OutputValue::Scalar(v) => *v,
            OutputValue::Series(values) if values.is_empty() => f64::NAN,
            OutputValue::Series(values) => values.iter().sum::<f64>() / values.len() as f64,
        }
    }
}

pub trait Model: Send {
    fn runid(&self) -> Option<usize>;

    fn rundir(&self) -> &Path;

    fn params(&self) -> &ParamSet;

    fn command(&self, args: &RunArgs) -> Result<Command>;

    // Clears results of an earlier run and writes any input files the
    // command expects. Called once before every real run.
    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    fn load(&mut self) -> Result<()>;

    fn status(&self) -> ModelStatus;

    fn output(&self) -> &Output;

    fn likelihood(&self) -> &Likelihood;

    fn postprocess(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.output())?)
    }
}

pub trait ModelFactory: Send + Sync {
    fn bind(&self, runid: Option<usize>, rundir: &Path, params: &ParamSet) -> Result<Box<dyn Model>>;

    fn likelihood(&self) -> &Likelihood;
}
