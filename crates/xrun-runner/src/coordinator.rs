use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use xrun_core::{
    atomic_write_json_pretty, ensure_dir, load_json_file, sha256_file, MemberFailure, Model,
    ModelFactory, ParamSet, ParamSpace, Result, RunArgs, XrunError,
};

use crate::rundir::{RundirMode, RundirResolver};
use crate::supervise;
use crate::task::{CancelFlag, RunOutcome, RunTask};

pub const PARAMS_FILE: &str = "params.txt";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const DEFAULT_TEMPLATE: &str = "{}";
// One year: effectively unbounded.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(31_536_000);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: String,
    pub created_at: String,
    pub runner_version: String,
    pub size: usize,
    pub names: Vec<String>,
    pub params_digest: String,
    #[serde(default)]
    pub rundir_template: Option<String>,
    #[serde(default)]
    pub autodir: bool,
}

pub fn load_manifest(expdir: &Path) -> Result<Manifest> {
    let value = load_json_file(&expdir.join(MANIFEST_FILE))?;
    Ok(serde_json::from_value(value)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    AllSucceeded,
    Partial,
    AllFailed,
}

impl BatchOutcome {
    pub fn classify(successes: usize, total: usize) -> Self {
        if successes == total {
            BatchOutcome::AllSucceeded
        } else if successes > 0 {
            BatchOutcome::Partial
        } else {
            BatchOutcome::AllFailed
        }
    }

    fn log(&self, successes: usize, total: usize) {
        match self {
            BatchOutcome::AllSucceeded => info!(total, "all runs finished successfully"),
            BatchOutcome::Partial => warn!(
                successes,
                total,
                "{} out of {} runs completed successfully",
                successes,
                total
            ),
            BatchOutcome::AllFailed => error!(total, "all runs failed"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub indices: Option<Vec<usize>>,
    pub max_workers: Option<usize>,
    pub timeout: Option<Duration>,
    pub args: RunArgs,
    pub cancel: Option<CancelFlag>,
    pub foreground: bool,
}

pub struct EnsembleBuilder {
    factory: Arc<dyn ModelFactory>,
    space: ParamSpace,
    expdir: PathBuf,
    template: String,
    autodir: bool,
    max_workers: Option<usize>,
    timeout: Duration,
}

impl EnsembleBuilder {
    pub fn new(factory: Arc<dyn ModelFactory>) -> Self {
        Self {
            factory,
            space: ParamSpace::empty(),
            expdir: PathBuf::from("."),
            template: DEFAULT_TEMPLATE.to_string(),
            autodir: false,
            max_workers: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn params(mut self, space: ParamSpace) -> Self {
        self.space = space;
        self
    }

    pub fn expdir(mut self, expdir: impl Into<PathBuf>) -> Self {
        self.expdir = expdir.into();
        self
    }

    pub fn rundir_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    pub fn autodir(mut self, autodir: bool) -> Self {
        self.autodir = autodir;
        self
    }

    pub fn max_workers(mut self, max_workers: Option<usize>) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<Ensemble> {
        if self.max_workers == Some(0) {
            return Err(XrunError::Configuration(
                "max_workers must be at least 1".to_string(),
            ));
        }
        let resolver = if self.autodir {
            RundirResolver::auto(self.expdir)
        } else {
            RundirResolver::template(self.expdir, &self.template)?
        };
        resolver.check_unique(&self.space)?;
        Ok(Ensemble {
            factory: self.factory,
            space: self.space,
            resolver,
            max_workers: self.max_workers,
            timeout: self.timeout,
        })
    }
}

pub struct Ensemble {
    factory: Arc<dyn ModelFactory>,
    space: ParamSpace,
    resolver: RundirResolver,
    max_workers: Option<usize>,
    timeout: Duration,
}

impl Ensemble {
    pub fn builder(factory: Arc<dyn ModelFactory>) -> EnsembleBuilder {
        EnsembleBuilder::new(factory)
    }

    pub fn len(&self) -> usize {
        self.space.size()
    }

    pub fn is_empty(&self) -> bool {
        self.space.size() == 0
    }

    pub fn params(&self) -> &ParamSpace {
        &self.space
    }

    pub fn expdir(&self) -> &Path {
        self.resolver.expdir()
    }

    pub fn factory(&self) -> &dyn ModelFactory {
        self.factory.as_ref()
    }

    pub fn rundir(&self, runid: usize) -> Result<PathBuf> {
        self.resolver.rundir(Some(runid), &self.space)
    }

    pub fn member(&self, runid: usize) -> Result<Box<dyn Model>> {
        let params = self.space.pset(runid)?;
        let rundir = self.rundir(runid)?;
        self.factory.bind(Some(runid), &rundir, &params)
    }

    pub fn default_member(&self) -> Result<Box<dyn Model>> {
        let rundir = self.resolver.rundir(None, &self.space)?;
        self.factory.bind(None, &rundir, &ParamSet::empty())
    }

    pub fn members(&self) -> Result<Vec<Box<dyn Model>>> {
        (0..self.len()).map(|i| self.member(i)).collect()
    }

    pub fn setup(&self, force: bool) -> Result<()> {
        let expdir = self.expdir();
        if !expdir.exists() {
            info!(expdir = %expdir.display(), "create directory");
        }
        ensure_dir(expdir)?;
        let pfile = expdir.join(PARAMS_FILE);
        if pfile.exists() && !force {
            return Err(XrunError::ExperimentExists(pfile));
        }
        self.space.write(&pfile)?;
        let (rundir_template, autodir) = match self.resolver.mode() {
            RundirMode::Template(t) => (Some(t.clone()), false),
            RundirMode::Auto => (None, true),
        };
        let manifest = Manifest {
            schema_version: "xrun_manifest_v1".to_string(),
            created_at: Utc::now().to_rfc3339(),
            runner_version: format!("rust-{}", env!("CARGO_PKG_VERSION")),
            size: self.len(),
            names: self.space.names().to_vec(),
            params_digest: sha256_file(&pfile)?,
            rundir_template,
            autodir,
        };
        atomic_write_json_pretty(&expdir.join(MANIFEST_FILE), &serde_json::to_value(&manifest)?)
    }

    fn task(&self, runid: Option<usize>, request: &RunRequest) -> Result<RunTask> {
        let params = match runid {
            Some(i) => self.space.pset(i)?,
            None => ParamSet::empty(),
        };
        Ok(RunTask {
            runid,
            rundir: self.resolver.rundir(runid, &self.space)?,
            params,
            args: request.args.clone(),
            timeout: request.timeout.unwrap_or(self.timeout),
            foreground: request.foreground,
        })
    }

    pub fn command_line(&self, runid: Option<usize>, args: &RunArgs) -> Result<Vec<String>> {
        let (rundir, params) = match runid {
            Some(i) => (self.rundir(i)?, self.space.pset(i)?),
            None => (self.resolver.rundir(None, &self.space)?, ParamSet::empty()),
        };
        let model = self.factory.bind(runid, &rundir, &params)?;
        let cmd = model.command(args)?;
        Ok(std::iter::once(cmd.get_program())
            .chain(cmd.get_args())
            .map(|s| s.to_string_lossy().into_owned())
            .collect())
    }

    pub fn dry_run(&self, request: &RunRequest) -> Result<Vec<Vec<String>>> {
        self.requested(request)?
            .into_iter()
            .map(|i| self.command_line(Some(i), &request.args))
            .collect()
    }

    fn requested(&self, request: &RunRequest) -> Result<Vec<usize>> {
        let indices: Vec<usize> = match &request.indices {
            Some(indices) => indices.clone(),
            None => (0..self.len()).collect(),
        };
        if let Some(&index) = indices.iter().find(|&&i| i >= self.len()) {
            return Err(XrunError::InvalidIndex {
                index,
                size: self.len(),
            });
        }
        Ok(indices)
    }

    pub fn run(
        &self,
        request: &RunRequest,
        callback: Option<&dyn Fn(&RunOutcome)>,
    ) -> Result<Vec<Option<RunOutcome>>> {
        let indices = self.requested(request)?;
        let tasks = indices
            .iter()
            .map(|&i| self.task(Some(i), request))
            .collect::<Result<Vec<_>>>()?;
        let timeout = request.timeout.unwrap_or(self.timeout);
        let total = tasks.len();
        if total == 0 {
            info!("no runs requested");
            return Ok(Vec::new());
        }
        let workers = if request.foreground {
            1
        } else {
            request
                .max_workers
                .or(self.max_workers)
                .unwrap_or(total)
                .clamp(1, total)
        };
        let cancel = request.cancel.clone().unwrap_or_default();
        info!(
            members = total,
            workers,
            timeout_secs = timeout.as_secs_f64(),
            "dispatching ensemble"
        );

        let results = dispatch(self.factory.as_ref(), tasks, workers, &cancel, |pos, result| {
            match result {
                Ok(outcome) => {
                    if let Some(cb) = callback {
                        cb(&outcome);
                    }
                    Some(outcome)
                }
                Err(err) => {
                    warn!(
                        runid = indices[pos],
                        reason = err.reason(),
                        "run {} failed: {}",
                        indices[pos],
                        err
                    );
                    None
                }
            }
        })?;

        let successes = results.iter().filter(|r| r.is_some()).count();
        BatchOutcome::classify(successes, total).log(successes, total);
        Ok(results)
    }

    pub fn run_default(&self, request: &RunRequest) -> Result<Option<RunOutcome>> {
        let task = self.task(None, request)?;
        let cancel = request.cancel.clone().unwrap_or_default();
        match supervise::execute(&task, self.factory.as_ref(), &cancel) {
            Ok(outcome) => {
                info!(rundir = %outcome.rundir.display(), "default run finished successfully");
                Ok(Some(outcome))
            }
            Err(err) => {
                warn!(reason = err.reason(), "default run failed: {}", err);
                Ok(None)
            }
        }
    }
}

type TaskResult = std::result::Result<RunOutcome, MemberFailure>;

fn dispatch<F>(
    factory: &dyn ModelFactory,
    tasks: Vec<RunTask>,
    workers: usize,
    cancel: &CancelFlag,
    mut on_result: F,
) -> Result<Vec<Option<RunOutcome>>>
where
    F: FnMut(usize, TaskResult) -> Option<RunOutcome>,
{
    let total = tasks.len();
    let (task_tx, task_rx) = mpsc::channel::<(usize, RunTask)>();
    let task_rx = Mutex::new(task_rx);
    let (result_tx, result_rx) = mpsc::channel::<(usize, TaskResult)>();

    thread::scope(|scope| {
        for w in 0..workers {
            let task_rx = &task_rx;
            let result_tx = result_tx.clone();
            let cancel = cancel.clone();
            let spawned = thread::Builder::new()
                .name(format!("xrun-worker-{}", w))
                .spawn_scoped(scope, move || loop {
                    let next = match task_rx.lock() {
                        Ok(rx) => rx.recv(),
                        Err(_) => break,
                    };
                    let (pos, task) = match next {
                        Ok(item) => item,
                        Err(_) => break,
                    };
                    let result = panic::catch_unwind(AssertUnwindSafe(|| {
                        supervise::execute(&task, factory, &cancel)
                    }))
                    .unwrap_or_else(|payload| Err(MemberFailure::Panic(panic_message(payload.as_ref()))));
                    if result_tx.send((pos, result)).is_err() {
                        break;
                    }
                });
            if let Err(e) = spawned {
                // Already running workers see a closed queue and exit.
                drop(task_tx);
                return Err(XrunError::Pool(e));
            }
        }
        drop(result_tx);
        for item in tasks.into_iter().enumerate() {
            if task_tx.send(item).is_err() {
                break;
            }
        }
        drop(task_tx);

        let mut results: Vec<Option<RunOutcome>> = vec![None; total];
        for (pos, result) in result_rx.iter() {
            results[pos] = on_result(pos, result);
        }
        Ok(results)
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;
    use tracing::field::{Field, Visit};
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<(Level, String)>>>);

    struct MessageVisitor(String);

    impl Visit for MessageVisitor {
        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            if field.name() == "message" {
                self.0 = format!("{:?}", value);
            }
        }
    }

    impl<S: Subscriber> Layer<S> for Recorder {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            let mut visitor = MessageVisitor(String::new());
            event.record(&mut visitor);
            self.0
                .lock()
                .expect("lock")
                .push((*event.metadata().level(), visitor.0));
        }
    }

    fn logged(successes: usize, total: usize) -> Vec<(Level, String)> {
        let recorder = Recorder::default();
        let subscriber = tracing_subscriber::registry().with(recorder.clone());
        tracing::subscriber::with_default(subscriber, || {
            BatchOutcome::classify(successes, total).log(successes, total)
        });
        let events = recorder.0.lock().expect("lock").clone();
        events
    }

    #[test]
    fn batch_summary_log_level_escalates() {
        assert_eq!(
            logged(4, 4),
            vec![(Level::INFO, "all runs finished successfully".to_string())]
        );
        assert_eq!(
            logged(2, 4),
            vec![(Level::WARN, "2 out of 4 runs completed successfully".to_string())]
        );
        assert_eq!(logged(0, 4), vec![(Level::ERROR, "all runs failed".to_string())]);
    }

    #[test]
    fn batch_outcome_escalates_with_failures() {
        assert_eq!(BatchOutcome::classify(4, 4), BatchOutcome::AllSucceeded);
        assert_eq!(BatchOutcome::classify(1, 4), BatchOutcome::Partial);
        assert_eq!(BatchOutcome::classify(3, 4), BatchOutcome::Partial);
        assert_eq!(BatchOutcome::classify(0, 4), BatchOutcome::AllFailed);
    }

    #[test]
    fn panic_message_extracts_text() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
