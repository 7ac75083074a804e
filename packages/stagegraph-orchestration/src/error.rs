use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Prerequisite missing or empty: {}", .0.display())]
    PrerequisiteMissing(PathBuf),

    #[error("Submission error for stage '{stage}': {reason}")]
    Submission { stage: String, reason: String },

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error(
        "Stage '{stage}' failed: {} of {total} tasks failed; see {}",
        .failures.len(),
        failed_logs(.failures)
    )]
    StageFailed {
        stage: String,
        total: usize,
        failures: Vec<TaskFailure>,
    },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Unsupported pipeline file version {found}. Supported versions: 1")]
    UnsupportedVersion { found: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OrchestratorError {
    pub fn validation<E: fmt::Display>(e: E) -> Self {
        Self::Validation(e.to_string())
    }

    pub fn submission<E: fmt::Display>(stage: impl Into<String>, e: E) -> Self {
        Self::Submission {
            stage: stage.into(),
            reason: e.to_string(),
        }
    }

    /// Log files of the failed tasks, empty for every other variant
    pub fn failed_logs(&self) -> Vec<PathBuf> {
        match self {
            Self::StageFailed { failures, .. } => failures.iter().map(|f| f.log.clone()).collect(),
            _ => Vec::new(),
        }
    }
}

fn failed_logs(failures: &[TaskFailure]) -> String {
    failures
        .iter()
        .map(|f| f.log.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Why a single task did not succeed
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskFailureReason {
    /// Command exited non-zero (`None` when killed by a signal)
    ExitStatus { code: Option<i32> },
    /// Command exited zero but the log lacks the success marker
    MissingMarker { marker: String },
    /// The task could not be started or waited on
    Io { message: String },
}

impl fmt::Display for TaskFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskFailureReason::ExitStatus { code: Some(code) } => write!(f, "exit code {}", code),
            TaskFailureReason::ExitStatus { code: None } => write!(f, "killed by signal"),
            TaskFailureReason::MissingMarker { marker } => {
                write!(f, "success marker '{}' not found in log", marker)
            }
            TaskFailureReason::Io { message } => write!(f, "{}", message),
        }
    }
}

/// A failed task, pointing at the log that explains it
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TaskFailure {
    pub index: u32,
    pub log: PathBuf,
    pub reason: TaskFailureReason,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task {} failed ({}), log: {}",
            self.index,
            self.reason,
            self.log.display()
        )
    }
}
