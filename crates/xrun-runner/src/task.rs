use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use xrun_core::{ModelStatus, ParamSet, RunArgs};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTask {
    pub runid: Option<usize>,
    pub rundir: PathBuf,
    pub params: ParamSet,
    pub args: RunArgs,
    pub timeout: Duration,
    #[serde(default)]
    pub foreground: bool,
}

impl RunTask {
    pub fn label(&self) -> String {
        self.runid
            .map(|i| i.to_string())
            .unwrap_or_else(|| "default".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub runid: Option<usize>,
    pub rundir: PathBuf,
    pub status: ModelStatus,
    pub exit_code: Option<i32>,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_serializes_as_plain_data() {
        let task = RunTask {
            runid: Some(2),
            rundir: PathBuf::from("out/2"),
            params: ParamSet::new(vec!["a".to_string()], vec![3.0]).expect("pset"),
            args: RunArgs::from([("years".to_string(), "100".to_string())]),
            timeout: Duration::from_secs(5),
            foreground: false,
        };
        let text = serde_json::to_string(&task).expect("serialize");
        let back: RunTask = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(back, task);
        assert_eq!(task.label(), "2");
    }

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(!other.is_cancelled());
        flag.cancel();
        assert!(other.is_cancelled());
    }
}
