use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use xrun_analysis::{write_analysis, Analysis};
use xrun_core::{
    atomic_write_json_pretty, canonical_json_digest, load_json_file, parse_indices, DiscreteParam,
    ModelFactory, ParamSpace, Prior, RunArgs, SampleMethod,
};
use xrun_runner::{
    load_config, load_manifest, BatchOutcome, CancelFlag, Ensemble, ExternalModelConfig,
    ExternalModelFactory, RunConfig, RunOutcome, RunRequest, PARAMS_FILE,
};

const MODEL_FILE: &str = "model.json";

#[derive(Parser)]
#[command(name = "xrun", version, about = "Run and analyze model ensembles")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the factorial combination of NAME=VALUES factors
    Product {
        #[arg(required = true)]
        factors: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Draw NAME=U?LO,HI or NAME=N?MEAN,SD priors into a parameter table
    Sample {
        #[arg(required = true)]
        priors: Vec<String>,
        #[arg(short = 'N', long)]
        size: usize,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long, default_value = "montecarlo")]
        method: SampleMethod,
        #[arg(long)]
        json: bool,
    },
    /// Run every member of an ensemble
    Run {
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,
        #[arg(short = 'x', long)]
        executable: Option<String>,
        #[arg(short = 'p', long = "params", num_args = 1..)]
        factors: Vec<String>,
        #[arg(short = 'i', long = "params-file")]
        params_file: Option<PathBuf>,
        #[arg(short = 'o', long = "out-dir")]
        out_dir: Option<PathBuf>,
        #[arg(short = 'a', long)]
        autodir: bool,
        #[arg(long = "id")]
        id: Option<String>,
        #[arg(long)]
        include_default: bool,
        #[arg(short = 'j', long = "max-workers")]
        max_workers: Option<usize>,
        #[arg(long)]
        timeout: Option<f64>,
        #[arg(long)]
        force: bool,
        #[arg(long = "kw")]
        kw: Vec<String>,
        /// One member at a time, output on the terminal
        #[arg(short = 't', long = "test")]
        test: bool,
        /// Print the command lines without running anything
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Aggregate the results of a finished ensemble
    Analyze {
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,
        #[arg(short = 'o', long = "out-dir")]
        out_dir: Option<PathBuf>,
        #[arg(long)]
        dest: Option<PathBuf>,
        #[arg(long)]
        alpha: Option<f64>,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "xrun=info,xrun_runner=info,xrun_analysis=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let cancel = CancelFlag::new();
    let worker_cancel = cancel.clone();
    let mut job = tokio::task::spawn_blocking(move || run_command(cli.command, &worker_cancel));

    let result = tokio::select! {
        joined = &mut job => joined?,
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    warn!("interrupted, stopping running members");
                    cancel.cancel();
                }
                Err(err) => warn!("cannot listen for interrupts: {}", err),
            }
            job.await?
        }
    };
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands, cancel: &CancelFlag) -> Result<Option<Value>> {
    match command {
        Commands::Product { factors, json } => {
            let space = product_space(&factors)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "product",
                    "names": space.names(),
                    "rows": (0..space.size()).filter_map(|i| space.row(i)).collect::<Vec<_>>(),
                })));
            }
            print!("{}", space.to_table_string());
        }
        Commands::Sample {
            priors,
            size,
            seed,
            method,
            json,
        } => {
            let priors = priors
                .iter()
                .map(|p| Prior::parse(p))
                .collect::<xrun_core::Result<Vec<_>>>()?;
            let space = ParamSpace::sample(&priors, size, method, seed)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "sample",
                    "names": space.names(),
                    "rows": (0..space.size()).filter_map(|i| space.row(i)).collect::<Vec<_>>(),
                })));
            }
            print!("{}", space.to_table_string());
        }
        Commands::Run {
            config,
            executable,
            factors,
            params_file,
            out_dir,
            autodir,
            id,
            include_default,
            max_workers,
            timeout,
            force,
            kw,
            test,
            dry_run,
            json,
            command,
        } => {
            let config = match config {
                Some(path) => load_config(&path)?,
                None => RunConfig::default(),
            };
            let expdir = out_dir.unwrap_or_else(|| config.expdir.clone());
            let model = resolve_model(config.model.clone(), executable, command)?;
            let timeout = match timeout {
                Some(secs) => Duration::try_from_secs_f64(secs)
                    .map_err(|_| anyhow::anyhow!("invalid --timeout {}", secs))?,
                None => config.timeout()?,
            };
            let args = parse_kw_bindings(&kw)?;
            let indices = id.as_deref().map(parse_indices).transpose()?;
            let (space, fresh) = if !factors.is_empty() {
                (product_space(&factors)?, true)
            } else if let Some(path) = params_file {
                (ParamSpace::read(&path)?, true)
            } else if expdir.join(PARAMS_FILE).exists() {
                (ParamSpace::read(&expdir.join(PARAMS_FILE))?, false)
            } else {
                (ParamSpace::empty(), false)
            };
            let include_default = include_default || space.size() == 0;
            let factory = Arc::new(ExternalModelFactory::new(model.clone())?);
            let ensemble = Ensemble::builder(factory)
                .params(space)
                .expdir(&expdir)
                .rundir_template(config.rundir_template.clone())
                .autodir(autodir || config.autodir)
                .max_workers(max_workers.or(config.max_workers))
                .timeout(timeout)
                .build()?;
            let request = RunRequest {
                indices,
                args,
                cancel: Some(cancel.clone()),
                foreground: test,
                ..RunRequest::default()
            };
            if dry_run {
                let mut commands = Vec::new();
                if include_default {
                    commands.push(ensemble.command_line(None, &request.args)?);
                }
                commands.extend(ensemble.dry_run(&request)?);
                if json {
                    return Ok(Some(json!({
                        "ok": true,
                        "command": "run",
                        "dry_run": true,
                        "commands": commands,
                    })));
                }
                for argv in commands {
                    println!("{}", argv.join(" "));
                }
                return Ok(None);
            }
            if fresh {
                ensemble.setup(force)?;
            }
            let model_json = serde_json::to_value(&model)?;
            let model_digest = canonical_json_digest(&model_json);
            let model_path = expdir.join(MODEL_FILE);
            if let Ok(previous) = load_json_file(&model_path) {
                if canonical_json_digest(&previous) != model_digest {
                    warn!(path = %model_path.display(), "model configuration changed since last run");
                }
            }
            atomic_write_json_pretty(&model_path, &model_json)?;

            let default = if include_default {
                Some(ensemble.run_default(&request)?)
            } else {
                None
            };
            let results = ensemble.run(&request, None)?;
            let succeeded = results.iter().filter(|r| r.is_some()).count();
            let outcome = BatchOutcome::classify(succeeded, results.len());
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "expdir": expdir.display().to_string(),
                    "size": ensemble.len(),
                    "model_digest": model_digest,
                    "requested": results.len(),
                    "succeeded": succeeded,
                    "outcome": batch_outcome_str(outcome),
                    "cancelled": cancel.is_cancelled(),
                    "default": default.map(|d| d.as_ref().map(outcome_to_json)),
                    "results": results.iter().map(|r| r.as_ref().map(outcome_to_json)).collect::<Vec<_>>(),
                })));
            }
            println!("expdir: {}", expdir.display());
            println!("runs: {} of {} succeeded", succeeded, results.len());
            if let Some(default) = default {
                println!(
                    "default: {}",
                    if default.is_some() { "succeeded" } else { "failed" }
                );
            }
        }
        Commands::Analyze {
            config,
            out_dir,
            dest,
            alpha,
            json,
        } => {
            let config = match config {
                Some(path) => load_config(&path)?,
                None => RunConfig::default(),
            };
            let expdir = out_dir.unwrap_or_else(|| config.expdir.clone());
            let model = match config.model.clone() {
                Some(model) => model,
                None => stored_model(&expdir)?,
            };
            let factory = Arc::new(ExternalModelFactory::new(model)?);
            let likelihood = factory.likelihood().clone();
            let mut builder = Ensemble::builder(factory)
                .params(ParamSpace::read(&expdir.join(PARAMS_FILE))?)
                .expdir(&expdir);
            builder = match load_manifest(&expdir) {
                Ok(manifest) => match manifest.rundir_template {
                    Some(template) => builder.rundir_template(template),
                    None => builder.autodir(manifest.autodir),
                },
                Err(err) => {
                    warn!("no usable manifest, using configured layout: {}", err);
                    builder
                        .rundir_template(config.rundir_template.clone())
                        .autodir(config.autodir)
                }
            };
            let ensemble = builder.build()?;
            let analysis = Analysis::load(ensemble.members()?, likelihood);
            let dest = dest.unwrap_or_else(|| expdir.clone());
            let summary = write_analysis(&dest, &analysis, alpha)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "analyze",
                    "dest": dest.display().to_string(),
                    "summary": summary,
                })));
            }
            println!("members: {}", summary["members"]);
            println!("successes: {}", summary["successes"]);
            println!("valid: {}", summary["valid"]);
            println!("effective sample size: {}", summary["effective_sample_size"]);
            println!("written to: {}", dest.display());
        }
    }
    Ok(None)
}

fn product_space(factors: &[String]) -> Result<ParamSpace> {
    let factors = factors
        .iter()
        .map(|f| DiscreteParam::parse(f))
        .collect::<xrun_core::Result<Vec<_>>>()?;
    Ok(ParamSpace::product(&factors)?)
}

// `-c` model, overridden by `-x`; a bare command after `--` carries its own
// placeholders and gets no generated arguments.
fn resolve_model(
    configured: Option<ExternalModelConfig>,
    executable: Option<String>,
    command: Vec<String>,
) -> Result<ExternalModelConfig> {
    let mut model = match (configured, executable) {
        (Some(mut model), Some(exe)) => {
            model.executable = exe;
            model
        }
        (Some(model), None) => model,
        (None, Some(exe)) => ExternalModelConfig::new(exe),
        (None, None) => {
            let mut parts = command.into_iter();
            let exe = parts.next().ok_or_else(|| {
                anyhow::anyhow!("no model: pass -c CONFIG, -x EXECUTABLE or a command after --")
            })?;
            let mut model = ExternalModelConfig::new(exe);
            model.args = parts.collect();
            model.arg_template = Vec::new();
            model.out_template = Vec::new();
            return Ok(model);
        }
    };
    model.args.extend(command);
    Ok(model)
}

fn stored_model(expdir: &Path) -> Result<ExternalModelConfig> {
    let path = expdir.join(MODEL_FILE);
    if !path.exists() {
        return Err(anyhow::anyhow!(
            "{} not found: pass -c CONFIG with a model section",
            path.display()
        ));
    }
    Ok(serde_json::from_value(load_json_file(&path)?)?)
}

fn parse_kw_bindings(values: &[String]) -> Result<RunArgs> {
    let mut out = RunArgs::new();
    for raw in values {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!(format!("invalid --kw '{}': expected k=v", raw)))?;
        if key.trim().is_empty() {
            return Err(anyhow::anyhow!(format!(
                "invalid --kw '{}': key cannot be empty",
                raw
            )));
        }
        out.insert(key.trim().to_string(), value.to_string());
    }
    Ok(out)
}

fn outcome_to_json(outcome: &RunOutcome) -> Value {
    json!({
        "runid": outcome.runid,
        "rundir": outcome.rundir.display().to_string(),
        "status": outcome.status,
        "exit_code": outcome.exit_code,
        "elapsed_secs": outcome.elapsed_secs,
    })
}

fn batch_outcome_str(outcome: BatchOutcome) -> &'static str {
    match outcome {
        BatchOutcome::AllSucceeded => "all_succeeded",
        BatchOutcome::Partial => "partial",
        BatchOutcome::AllFailed => "all_failed",
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Product { json, .. }
        | Commands::Sample { json, .. }
        | Commands::Run { json, .. }
        | Commands::Analyze { json, .. } => *json,
    }
}
