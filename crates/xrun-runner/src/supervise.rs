use chrono::{DateTime, Utc};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use xrun_core::{atomic_write_json_pretty, ensure_dir, MemberFailure, ModelFactory, ModelStatus};

use crate::task::{CancelFlag, RunOutcome, RunTask};

pub const STATUS_FILE: &str = "status.json";
pub const STDOUT_FILE: &str = "log.out";
pub const STDERR_FILE: &str = "log.err";

const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub fn write_member_status(
    rundir: &Path,
    runid: Option<usize>,
    status: ModelStatus,
    exit_code: Option<i32>,
    reason: Option<&str>,
    started_at: &DateTime<Utc>,
    elapsed_secs: Option<f64>,
) -> xrun_core::Result<()> {
    let finished_at = match status {
        ModelStatus::Running | ModelStatus::NotStarted => None,
        _ => Some(Utc::now().to_rfc3339()),
    };
    let payload = json!({
        "schema_version": "member_status_v1",
        "runid": runid,
        "status": status,
        "exit_code": exit_code,
        "reason": reason,
        "started_at": started_at.to_rfc3339(),
        "finished_at": finished_at,
        "elapsed_secs": elapsed_secs,
    });
    atomic_write_json_pretty(&rundir.join(STATUS_FILE), &payload)
}

struct MemberStateGuard {
    rundir: PathBuf,
    runid: Option<usize>,
    started_at: DateTime<Utc>,
    clock: Instant,
    exit_code: Option<i32>,
    done: bool,
}

impl MemberStateGuard {
    fn start(rundir: &Path, runid: Option<usize>) -> xrun_core::Result<Self> {
        let started_at = Utc::now();
        write_member_status(
            rundir,
            runid,
            ModelStatus::Running,
            None,
            None,
            &started_at,
            None,
        )?;
        Ok(Self {
            rundir: rundir.to_path_buf(),
            runid,
            started_at,
            clock: Instant::now(),
            exit_code: None,
            done: false,
        })
    }

    fn elapsed_secs(&self) -> f64 {
        self.clock.elapsed().as_secs_f64()
    }

    fn complete(
        &mut self,
        status: ModelStatus,
        exit_code: Option<i32>,
        reason: Option<&str>,
    ) -> xrun_core::Result<()> {
        write_member_status(
            &self.rundir,
            self.runid,
            status,
            exit_code,
            reason,
            &self.started_at,
            Some(self.elapsed_secs()),
        )?;
        self.done = true;
        Ok(())
    }

    fn fail(&mut self, failure: MemberFailure) -> MemberFailure {
        let status = match failure {
            MemberFailure::Timeout { .. } => ModelStatus::Timeout,
            _ => ModelStatus::Failed,
        };
        let exit_code = match failure {
            MemberFailure::Exit { code } => code,
            _ => self.exit_code,
        };
        let _ = self.complete(status, exit_code, Some(failure.reason()));
        failure
    }
}

impl Drop for MemberStateGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = write_member_status(
                &self.rundir,
                self.runid,
                ModelStatus::Failed,
                None,
                Some("aborted"),
                &self.started_at,
                Some(self.elapsed_secs()),
            );
        }
    }
}

pub(crate) fn execute(
    task: &RunTask,
    factory: &dyn ModelFactory,
    cancel: &CancelFlag,
) -> Result<RunOutcome, MemberFailure> {
    if cancel.is_cancelled() {
        return Err(MemberFailure::Cancelled);
    }
    ensure_dir(&task.rundir)?;
    let mut model = factory.bind(task.runid, &task.rundir, &task.params)?;
    let mut guard = MemberStateGuard::start(&task.rundir, task.runid)?;

    if let Err(e) = model.prepare() {
        return Err(guard.fail(MemberFailure::Model(e)));
    }
    let mut cmd = match prepare_command(model.as_ref(), task) {
        Ok(cmd) => cmd,
        Err(e) => return Err(guard.fail(MemberFailure::Model(e))),
    };
    debug!(runid = %task.label(), command = ?cmd, "spawning member");
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return Err(guard.fail(MemberFailure::Spawn(e))),
    };

    let deadline = Instant::now().checked_add(task.timeout);
    let exit = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => {
                terminate(&mut child);
                return Err(guard.fail(MemberFailure::Supervise(e)));
            }
        }
        let now = Instant::now();
        let remaining = deadline.map(|d| d.saturating_duration_since(now));
        if remaining == Some(Duration::ZERO) {
            terminate(&mut child);
            return Err(guard.fail(MemberFailure::Timeout {
                secs: task.timeout.as_secs_f64(),
            }));
        }
        if cancel.is_cancelled() {
            terminate(&mut child);
            return Err(guard.fail(MemberFailure::Cancelled));
        }
        thread::sleep(remaining.map_or(POLL_INTERVAL, |r| r.min(POLL_INTERVAL)));
    };

    guard.exit_code = exit.code();
    if !exit.success() {
        return Err(guard.fail(MemberFailure::Exit { code: exit.code() }));
    }
    guard.complete(ModelStatus::Success, exit.code(), None)?;
    let loaded = model.load().map_err(MemberFailure::Model).and_then(|_| {
        if model.status().is_success() {
            Ok(())
        } else {
            Err(MemberFailure::Status(model.status()))
        }
    });
    if let Err(failure) = loaded {
        return Err(guard.fail(failure));
    }
    Ok(RunOutcome {
        runid: task.runid,
        rundir: task.rundir.clone(),
        status: model.status(),
        exit_code: exit.code(),
        elapsed_secs: guard.elapsed_secs(),
    })
}

fn prepare_command(model: &dyn xrun_core::Model, task: &RunTask) -> xrun_core::Result<Command> {
    let mut cmd = model.command(&task.args)?;
    cmd.stdin(Stdio::null());
    if task.foreground {
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
    } else {
        cmd.stdout(fs::File::create(task.rundir.join(STDOUT_FILE))?);
        cmd.stderr(fs::File::create(task.rundir.join(STDERR_FILE))?);
    }
    isolate_from_terminal(&mut cmd);
    Ok(cmd)
}

#[cfg(unix)]
fn isolate_from_terminal(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_from_terminal(_cmd: &mut Command) {}

fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        let pgid = child.id() as libc::pid_t;
        // SAFETY: plain syscall on the process group created in
        // `isolate_from_terminal`; the child has not been reaped yet so the
        // group id cannot have been recycled.
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;
    use xrun_core::load_json_file;

    #[test]
    fn dropped_guard_marks_member_aborted() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let guard = MemberStateGuard::start(dir.path(), Some(4)).expect("start");
            let state = load_json_file(&dir.path().join(STATUS_FILE)).expect("state");
            assert_eq!(state["status"], "running");
            assert!(state["finished_at"].is_null());
            drop(guard);
        }
        let state = load_json_file(&dir.path().join(STATUS_FILE)).expect("state");
        assert_eq!(state["schema_version"], "member_status_v1");
        assert_eq!(state["runid"], 4);
        assert_eq!(state["status"], "failed");
        assert_eq!(state["reason"], "aborted");
    }

    #[test]
    fn timeout_failure_is_recorded_as_timeout_status() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut guard = MemberStateGuard::start(dir.path(), None).expect("start");
        let failure = guard.fail(MemberFailure::Timeout { secs: 1.0 });
        assert_eq!(failure.reason(), "timeout");
        drop(guard);
        let state = load_json_file(&dir.path().join(STATUS_FILE)).expect("state");
        assert_eq!(state["status"], "timeout");
        assert!(state["runid"].is_null());
        assert!(state["elapsed_secs"].is_f64());
    }
}
