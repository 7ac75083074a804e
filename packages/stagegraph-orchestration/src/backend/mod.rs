//! Execution backends: local process pool and cluster batch arrays.

pub mod cluster;
pub mod local;
pub mod script;

pub use cluster::ClusterBackend;
pub use local::{LocalBackend, LocalRun};
pub use script::{ArrayHeader, BatchScript, GuardedCommand, PbsRenderer, ScriptRenderer};

use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::job::JobHandle;
use crate::range::RangeSpec;
use crate::task::{CompletionCriterion, Task};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which backend runs the stages of an invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Local,
    Cluster,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Cluster => "cluster",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Everything a backend needs to execute the pending part of a stage
#[derive(Debug, Clone)]
pub struct StageSubmission {
    pub stage: String,
    /// Pending tasks only, ascending by index
    pub tasks: Vec<Task>,
    pub total_tasks: u32,
    pub range: RangeSpec,
    pub predecessor: JobHandle,
    pub criterion: CompletionCriterion,
}

/// Capability shared by both execution strategies
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// True when `submit` returns only after every task has finished
    fn is_synchronous(&self) -> bool {
        self.kind() == BackendKind::Local
    }

    /// Execute (local) or enqueue (cluster) the submission's tasks
    async fn submit(&self, stage: &StageSubmission) -> Result<JobHandle>;
}

/// Backend selected by the configuration
pub fn build_backend(config: Arc<OrchestratorConfig>) -> Arc<dyn ExecutionBackend> {
    match config.backend {
        BackendKind::Local => Arc::new(LocalBackend::new(config)),
        BackendKind::Cluster => Arc::new(ClusterBackend::new(config)),
    }
}
