/*
 * Stagegraph Orchestration - re-runnable partitioned batch stages
 *
 * Runs per-index external commands over a local process pool or a
 * cluster batch-array scheduler.
 *
 * Architecture:
 * - Completion oracle (artifacts + log + marker + sentinel)
 * - Task set planner (pending set, stale output invalidation)
 * - Range compressor (scheduler array ranges)
 * - Execution backends (local processes, PBS/Torque arrays)
 * - Dependency chain (scheduler job handles between stages)
 * - Stage orchestrator and fixed pipeline shapes
 */

// Public modules
pub mod backend;
pub mod chain;
pub mod completion;
pub mod config;
pub mod error;
pub mod job;
pub mod orchestrator;
pub mod pipeline;
pub mod pipelines;
pub mod planner;
pub mod range;
pub mod task;

// Re-exports
pub use backend::{
    build_backend, BackendKind, ClusterBackend, ExecutionBackend, LocalBackend, LocalRun,
    StageSubmission,
};
pub use chain::DependencyChain;
pub use completion::CompletionOracle;
pub use config::{ClusterSettings, OrchestratorConfig};
pub use error::{OrchestratorError, Result, TaskFailure, TaskFailureReason};
pub use job::{JobHandle, StageRun, StageRunState, StageRunStateMachine};
pub use orchestrator::{PipelineResult, StageOrchestrator, StageOutcome, StagePreview};
pub use pipeline::{OutputTemplate, Pipeline, StageMetrics, StageSpec, StageTemplate};
pub use pipelines::{
    EstimationPipeline, MixtureGrowthPipeline, PipelineDefinition, PipelineFile,
    SinglePassPipeline,
};
pub use planner::{Plan, TaskSetPlanner};
pub use range::{RangeCompressor, RangePolicy, RangeSpec};
pub use task::{
    ArtifactDescriptor, CommandTemplate, CompletionCriterion, Task, TemplateVars,
};
