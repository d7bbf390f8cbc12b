use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::debug;

use xrun_core::{
    atomic_write_bytes, format_value, load_json_file, Likelihood, Model, ModelFactory, ModelStatus,
    Output, OutputValue, ParamSet, Result, RunArgs, XrunError,
};

use crate::rundir::{autofolder, DEFAULT_RUNDIR};
use crate::supervise::STATUS_FILE;

fn default_arg_template() -> Vec<String> {
    vec!["--{name}".to_string(), "{value}".to_string()]
}

fn default_out_template() -> Vec<String> {
    vec!["--out".to_string(), "{rundir}".to_string()]
}

fn default_output_file() -> String {
    "output.json".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamsFileFormat {
    Json,
    #[default]
    Linesep,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamsFileConfig {
    pub name: String,
    #[serde(default)]
    pub format: ParamsFileFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExternalModelConfig {
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_arg_template")]
    pub arg_template: Vec<String>,
    #[serde(default = "default_out_template")]
    pub out_template: Vec<String>,
    #[serde(default)]
    pub params_file: Option<ParamsFileConfig>,
    #[serde(default = "default_output_file")]
    pub output_file: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub likelihood: Likelihood,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ExternalModelConfig {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            arg_template: default_arg_template(),
            out_template: default_out_template(),
            params_file: None,
            output_file: default_output_file(),
            params: Vec::new(),
            likelihood: Likelihood::default(),
            env: BTreeMap::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.executable.trim().is_empty() {
            return Err(XrunError::Configuration(
                "model executable is empty".to_string(),
            ));
        }
        if self.output_file.trim().is_empty() {
            return Err(XrunError::Configuration("output_file is empty".to_string()));
        }
        self.likelihood.validate()
    }
}

pub struct ExternalModelFactory {
    config: Arc<ExternalModelConfig>,
}

impl ExternalModelFactory {
    pub fn new(config: ExternalModelConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &ExternalModelConfig {
        &self.config
    }
}

impl ModelFactory for ExternalModelFactory {
    fn bind(&self, runid: Option<usize>, rundir: &Path, params: &ParamSet) -> Result<Box<dyn Model>> {
        if !self.config.params.is_empty() {
            if let Some(name) = params
                .names()
                .iter()
                .find(|n| !self.config.params.contains(n))
            {
                return Err(XrunError::unknown_parameter(name, &self.config.params));
            }
        }
        Ok(Box::new(ExternalModel {
            config: Arc::clone(&self.config),
            runid,
            rundir: rundir.to_path_buf(),
            params: params.clone(),
            status: ModelStatus::NotStarted,
            output: Output::new(),
        }))
    }

    fn likelihood(&self) -> &Likelihood {
        &self.config.likelihood
    }
}

pub struct ExternalModel {
    config: Arc<ExternalModelConfig>,
    runid: Option<usize>,
    rundir: PathBuf,
    params: ParamSet,
    status: ModelStatus,
    output: Output,
}

impl ExternalModel {
    fn runtag(&self) -> String {
        match self.runid {
            Some(_) => autofolder(self.params.names(), self.params.values()),
            None => DEFAULT_RUNDIR.to_string(),
        }
    }

    fn context(&self, args: &RunArgs) -> BTreeMap<String, String> {
        let mut ctx = BTreeMap::new();
        for (name, value) in self.params.iter() {
            ctx.insert(name.to_string(), format_value(value));
        }
        for (k, v) in args {
            ctx.insert(k.clone(), v.clone());
        }
        let rundir = self.rundir.to_string_lossy().to_string();
        ctx.insert(String::new(), rundir.clone());
        ctx.insert("rundir".to_string(), rundir);
        ctx.insert(
            "runid".to_string(),
            self.runid
                .map(|i| i.to_string())
                .unwrap_or_else(|| DEFAULT_RUNDIR.to_string()),
        );
        ctx.insert("runtag".to_string(), self.runtag());
        ctx
    }

    pub fn argv(&self, args: &RunArgs) -> Result<Vec<String>> {
        let ctx = self.context(args);
        let lookup = |key: &str| ctx.get(key).cloned();
        let mut argv = Vec::new();
        argv.push(fill(&self.config.executable, &lookup)?);
        for token in self.config.out_template.iter().chain(self.config.args.iter()) {
            argv.push(fill(token, &lookup)?);
        }
        for (name, value) in self.params.iter() {
            let value = format_value(value);
            let param_lookup = |key: &str| match key {
                "name" => Some(name.to_string()),
                "value" => Some(value.clone()),
                other => ctx.get(other).cloned(),
            };
            for token in &self.config.arg_template {
                argv.push(fill(token, &param_lookup)?);
            }
        }
        Ok(argv)
    }

    fn write_params_file(&self) -> Result<()> {
        let spec = match &self.config.params_file {
            Some(spec) => spec,
            None => return Ok(()),
        };
        let text = match spec.format {
            ParamsFileFormat::Json => {
                let map: serde_json::Map<String, Value> = self
                    .params
                    .iter()
                    .map(|(k, v)| (k.to_string(), serde_json::json!(v)))
                    .collect();
                serde_json::to_string_pretty(&Value::Object(map))?
            }
            ParamsFileFormat::Linesep => self
                .params
                .iter()
                .map(|(k, v)| format!("{} {}\n", k, format_value(v)))
                .collect(),
        };
        atomic_write_bytes(&self.rundir.join(&spec.name), text.as_bytes())
    }

    fn read_output(&self) -> Result<Output> {
        let path = self.rundir.join(&self.config.output_file);
        if !path.exists() {
            return Err(XrunError::MissingOutput(path));
        }
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            let value = load_json_file(&path)?;
            return Ok(serde_json::from_value(value)?);
        }
        parse_linesep_output(&fs::read_to_string(&path)?)
    }
}

impl Model for ExternalModel {
    fn runid(&self) -> Option<usize> {
        self.runid
    }

    fn rundir(&self) -> &Path {
        &self.rundir
    }

    fn params(&self) -> &ParamSet {
        &self.params
    }

    fn command(&self, args: &RunArgs) -> Result<Command> {
        let argv = self.argv(args)?;
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.env("XRUN_RUNDIR", &self.rundir);
        cmd.env(
            "XRUN_RUNID",
            self.runid
                .map(|i| i.to_string())
                .unwrap_or_else(|| DEFAULT_RUNDIR.to_string()),
        );
        for (k, v) in &self.config.env {
            cmd.env(k, v);
        }
        for (k, v) in args {
            cmd.env(format!("XRUN_{}", k.to_uppercase()), v);
        }
        Ok(cmd)
    }

    fn prepare(&mut self) -> Result<()> {
        let path = self.rundir.join(&self.config.output_file);
        if path.exists() {
            debug!(path = %path.display(), "removing stale output");
            fs::remove_file(&path)?;
        }
        self.status = ModelStatus::NotStarted;
        self.output = Output::new();
        self.write_params_file()
    }

    fn load(&mut self) -> Result<()> {
        let status_path = self.rundir.join(STATUS_FILE);
        self.output = Output::new();
        if !status_path.exists() {
            self.status = ModelStatus::NotStarted;
            return Ok(());
        }
        let state = load_json_file(&status_path)?;
        self.status = serde_json::from_value(state.get("status").cloned().unwrap_or(Value::Null))
            .unwrap_or(ModelStatus::Failed);
        if self.status.is_success() {
            self.output = self.read_output()?;
        }
        Ok(())
    }

    fn status(&self) -> ModelStatus {
        self.status
    }

    fn output(&self) -> &Output {
        &self.output
    }

    fn likelihood(&self) -> &Likelihood {
        &self.config.likelihood
    }
}

// Expands `{key}` placeholders; `{{` and `}}` are literal braces.
fn fill(template: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut key = String::new();
                let mut closed = false;
                for k in chars.by_ref() {
                    if k == '}' {
                        closed = true;
                        break;
                    }
                    key.push(k);
                }
                if !closed {
                    return Err(XrunError::Configuration(format!(
                        "unterminated placeholder in {:?}",
                        template
                    )));
                }
                let value = lookup(&key).ok_or_else(|| {
                    XrunError::Configuration(format!(
                        "unknown placeholder {{{}}} in {:?}",
                        key, template
                    ))
                })?;
                out.push_str(&value);
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

fn parse_linesep_output(text: &str) -> Result<Output> {
    let mut output = Output::new();
    for (i, line) in text.lines().enumerate() {
        let mut fields = line.split_whitespace();
        let name = match fields.next() {
            Some(name) => name,
            None => continue,
        };
        let values = fields
            .map(|f| f.parse::<f64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| XrunError::ParamsFormat {
                line: i + 1,
                message: format!("non-numeric output value for {:?}", name),
            })?;
        let value = match values.len() {
            0 => {
                return Err(XrunError::ParamsFormat {
                    line: i + 1,
                    message: format!("missing value for {:?}", name),
                })
            }
            1 => OutputValue::Scalar(values[0]),
            _ => OutputValue::Series(values),
        };
        output.insert(name.to_string(), value);
    }
    Ok(output)
}
