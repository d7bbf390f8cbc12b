use std::path::PathBuf;
use thiserror::Error;

use crate::model::ModelStatus;

pub type Result<T> = std::result::Result<T, XrunError>;

#[derive(Error, Debug)]
pub enum XrunError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{} already exists (use force to overwrite)", .0.display())]
    ExperimentExists(PathBuf),

    #[error(
        "unknown parameter {name:?}; available parameters: {}{}",
        .available.join(" "),
        did_you_mean(.suggestions)
    )]
    UnknownParameter {
        name: String,
        available: Vec<String>,
        suggestions: Vec<String>,
    },

    #[error("member index {index} out of range for ensemble of size {size}")]
    InvalidIndex { index: usize, size: usize },

    #[error("invalid index selection {0:?}: expected I,J,...,START-STOP[:STEP]")]
    InvalidSelection(String),

    #[error("params file line {line}: {message}")]
    ParamsFormat { line: usize, message: String },

    #[error("output file {} missing", .0.display())]
    MissingOutput(PathBuf),

    #[error("no successful run in ensemble")]
    NoSuccessfulRun,

    #[error("worker pool could not be started: {0}")]
    Pool(#[source] std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl XrunError {
    pub fn unknown_parameter(name: &str, available: &[String]) -> Self {
        XrunError::UnknownParameter {
            name: name.to_string(),
            available: available.to_vec(),
            suggestions: close_matches(name, available),
        }
    }
}

pub fn close_matches(name: &str, candidates: &[String]) -> Vec<String> {
    let limit = (name.chars().count() / 3).max(1);
    let mut scored: Vec<(usize, &String)> = candidates
        .iter()
        .map(|c| (edit_distance(name, c), c))
        .filter(|&(d, _)| d <= limit)
        .collect();
    scored.sort_by_key(|&(d, _)| d);
    scored.into_iter().take(3).map(|(_, c)| c.clone()).collect()
}

fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut cur = vec![i + 1; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            let swap = prev[j] + usize::from(ca != *cb);
            cur[j + 1] = swap.min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        prev = cur;
    }
    prev[b.len()]
}

fn did_you_mean(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!("; did you mean: {}?", suggestions.join(", "))
    }
}

#[derive(Error, Debug)]
pub enum MemberFailure {
    #[error("model error: {0}")]
    Model(#[from] XrunError),

    #[error("could not start process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("process exited with {}", .code.map(|c| format!("code {}", c)).unwrap_or_else(|| "signal".to_string()))]
    Exit { code: Option<i32> },

    #[error("timed out after {secs:.3}s")]
    Timeout { secs: f64 },

    #[error("cancelled")]
    Cancelled,

    #[error("model status is {0} after run")]
    Status(ModelStatus),

    #[error("supervision failed: {0}")]
    Supervise(#[source] std::io::Error),

    #[error("worker panicked: {0}")]
    Panic(String),
}

impl MemberFailure {
    pub fn reason(&self) -> &'static str {
        match self {
            MemberFailure::Model(_) => "model_error",
            MemberFailure::Spawn(_) => "spawn_error",
            MemberFailure::Exit { .. } => "exit_nonzero",
            MemberFailure::Timeout { .. } => "timeout",
            MemberFailure::Cancelled => "cancelled",
            MemberFailure::Status(_) => "status_not_success",
            MemberFailure::Supervise(_) => "supervise_error",
            MemberFailure::Panic(_) => "panic",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_parameter_lists_available_names() {
        let err = XrunError::UnknownParameter {
            name: "aa".to_string(),
            available: vec!["a".to_string(), "b".to_string()],
            suggestions: Vec::new(),
        };
        let msg = err.to_string();
        assert!(msg.contains("\"aa\""), "{}", msg);
        assert!(msg.contains("a b"), "{}", msg);
        assert!(!msg.contains("did you mean"), "{}", msg);

        let err = XrunError::UnknownParameter {
            name: "alpah".to_string(),
            available: vec!["alpha".to_string(), "beta".to_string()],
            suggestions: vec!["alpha".to_string()],
        };
        assert!(err.to_string().ends_with("; did you mean: alpha?"), "{}", err);
    }

    #[test]
    fn close_matches_rank_by_edit_distance() {
        let names: Vec<String> = ["years", "yrs", "clim", "climate"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(close_matches("yeers", &names), vec!["years".to_string()]);
        assert_eq!(close_matches("climat", &names), vec!["climate".to_string(), "clim".to_string()]);
        assert!(close_matches("zzz", &names).is_empty());
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        match XrunError::unknown_parameter("yers", &names) {
            XrunError::UnknownParameter { suggestions, .. } => {
                assert_eq!(suggestions, vec!["years".to_string(), "yrs".to_string()]);
            }
            other => panic!("unexpected: {}", other),
        }
    }

    #[test]
    fn exit_failure_reports_signal_when_code_missing() {
        assert_eq!(
            MemberFailure::Exit { code: Some(3) }.to_string(),
            "process exited with code 3"
        );
        assert_eq!(
            MemberFailure::Exit { code: None }.to_string(),
            "process exited with signal"
        );
        assert_eq!(MemberFailure::Timeout { secs: 0.5 }.reason(), "timeout");
    }
}
