use crate::backend::{build_backend, ExecutionBackend, StageSubmission};
use crate::chain::DependencyChain;
use crate::completion::CompletionOracle;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::job::{JobHandle, StageRun, StageRunStateMachine};
use crate::pipeline::{Pipeline, StageMetrics, StageSpec};
use crate::planner::{Plan, TaskSetPlanner};
use crate::range::{RangeCompressor, RangeSpec};
use crate::task::{is_non_empty_file, ArtifactDescriptor, Task};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// What happened to one stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    pub run: StageRun,
    pub plan: Plan,
    /// `None` when the stage was skipped
    pub range: Option<RangeSpec>,
    pub handle: JobHandle,
    pub metrics: StageMetrics,
}

/// Dry-run view of a stage: what would be submitted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagePreview {
    pub stage: String,
    pub plan: Plan,
    pub range: Option<RangeSpec>,
}

/// Pipeline result (aggregated metrics from all stages)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineResult {
    pub pipeline: String,
    /// Final artifact was already present, nothing ran
    pub skipped: bool,
    pub stages: Vec<StageRun>,
    pub tasks_total: usize,
    pub tasks_run: usize,
    pub tasks_skipped: usize,
    pub files_invalidated: usize,
    pub duration_ms: u64,
    /// Handle of the last submitted stage (cluster mode)
    pub final_handle: JobHandle,
}

impl PipelineResult {
    pub fn merge_metrics(&mut self, metrics: &StageMetrics) {
        self.tasks_total += metrics.tasks_total;
        self.tasks_run += metrics.tasks_run;
        self.tasks_skipped += metrics.tasks_skipped;
        self.files_invalidated += metrics.files_invalidated;
    }
}

/// Composes planner, range compressor, dependency chain and backend
pub struct StageOrchestrator {
    config: Arc<OrchestratorConfig>,
    backend: Arc<dyn ExecutionBackend>,
    planner: TaskSetPlanner,
    compressor: RangeCompressor,
    chain: DependencyChain,
    history: Vec<StageOutcome>,
}

impl StageOrchestrator {
    /// Create an orchestrator with the backend the configuration selects
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let backend = build_backend(config.clone());
        Ok(Self::with_backend(config, backend))
    }

    /// Create with an explicit backend
    pub fn with_backend(config: Arc<OrchestratorConfig>, backend: Arc<dyn ExecutionBackend>) -> Self {
        Self {
            planner: TaskSetPlanner::new(CompletionOracle::default(), config.overwrite),
            compressor: RangeCompressor::new(config.range_policy),
            chain: DependencyChain::new(),
            history: Vec::new(),
            config,
            backend,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn backend(&self) -> &dyn ExecutionBackend {
        self.backend.as_ref()
    }

    pub fn chain(&self) -> &DependencyChain {
        &self.chain
    }

    /// Stages run so far, including a failed last one
    pub fn history(&self) -> &[StageOutcome] {
        &self.history
    }

    /// Every path must exist and be non-empty
    pub fn check_prerequisites(&self, paths: &[PathBuf]) -> Result<()> {
        for path in paths {
            let resolved = self.config.resolve(path);
            if !is_non_empty_file(&resolved) {
                return Err(OrchestratorError::PrerequisiteMissing(resolved));
            }
        }
        Ok(())
    }

    /// Plan a stage without deleting anything
    pub fn preview_stage(&self, stage: &StageSpec) -> Result<StagePreview> {
        let plan = self.planner_for(stage).survey(&stage.tasks)?;
        let range = if plan.is_noop() {
            None
        } else {
            Some(self.compressor.compress(&plan.pending, plan.total)?)
        };
        Ok(StagePreview {
            stage: stage.name.clone(),
            plan,
            range,
        })
    }

    /// Every task of `stage` already complete; always false under `overwrite`
    pub fn is_stage_complete(&self, stage: &StageSpec) -> Result<bool> {
        Ok(self.planner_for(stage).survey(&stage.tasks)?.is_noop())
    }

    fn planner_for(&self, stage: &StageSpec) -> TaskSetPlanner {
        self.planner
            .with_oracle(CompletionOracle::new(stage.criterion.clone()))
    }

    /// Plan, invalidate, submit and chain one stage.
    ///
    /// A stage with nothing pending never reaches the backend and leaves
    /// the dependency chain as it was.
    pub async fn run_stage(&mut self, stage: StageSpec) -> Result<StageOutcome> {
        let start = Instant::now();
        let plan = self.planner_for(&stage).plan(&stage.tasks)?;
        let mut sm = StageRunStateMachine::new(StageRun::planned(
            &stage.name,
            plan.total,
            plan.pending.clone(),
        ));
        let mut metrics = StageMetrics {
            tasks_total: plan.total as usize,
            tasks_skipped: plan.complete.len(),
            files_invalidated: plan.invalidated,
            ..Default::default()
        };

        if plan.is_noop() {
            info!(
                "Stage '{}': all {} task(s) complete, skipping",
                stage.name, plan.total
            );
            sm.skip("all tasks complete")?;
            metrics.duration_ms = start.elapsed().as_millis() as u64;
            return Ok(self.record(StageOutcome {
                run: sm.into_run(),
                plan,
                range: None,
                handle: JobHandle::Empty,
                metrics,
            }));
        }

        let range = self.compressor.compress(&plan.pending, plan.total)?;
        info!(
            "Stage '{}': {} of {} task(s) pending {:?}, range {} on {} backend",
            stage.name,
            plan.pending.len(),
            plan.total,
            plan.pending,
            range,
            self.backend.kind()
        );

        let mut tasks: Vec<Task> = stage
            .tasks
            .into_iter()
            .filter(|t| plan.pending.binary_search(&t.index).is_ok())
            .collect();
        tasks.sort_by_key(|t| t.index);

        let mut submission = StageSubmission {
            stage: stage.name.clone(),
            tasks,
            total_tasks: plan.total,
            range: range.clone(),
            predecessor: JobHandle::Empty,
            criterion: stage.criterion,
        };
        self.chain.bind(&mut submission);

        match self.backend.submit(&submission).await {
            Ok(handle) => {
                sm.submit(handle.clone(), range.to_string())?;
                if self.backend.is_synchronous() {
                    sm.succeed()?;
                }
                self.chain.advance(handle.clone());
                metrics.tasks_run = plan.pending.len();
                metrics.duration_ms = start.elapsed().as_millis() as u64;
                Ok(self.record(StageOutcome {
                    run: sm.into_run(),
                    plan,
                    range: Some(range),
                    handle,
                    metrics,
                }))
            }
            Err(e) => {
                error!("Stage '{}' failed: {}", stage.name, e);
                sm.fail(&e)?;
                metrics.tasks_run = plan.pending.len();
                metrics.duration_ms = start.elapsed().as_millis() as u64;
                self.record(StageOutcome {
                    run: sm.into_run(),
                    plan,
                    range: Some(range),
                    handle: JobHandle::Empty,
                    metrics,
                });
                Err(e)
            }
        }
    }

    fn record(&mut self, outcome: StageOutcome) -> StageOutcome {
        self.history.push(outcome.clone());
        outcome
    }

    /// Run a whole pipeline, short-circuiting when its final artifact
    /// already exists and `overwrite` is off.
    pub async fn run_pipeline(&mut self, pipeline: &dyn Pipeline) -> Result<PipelineResult> {
        let start = Instant::now();
        pipeline.validate()?;

        let mut result = PipelineResult {
            pipeline: pipeline.name().to_string(),
            ..Default::default()
        };

        if !self.config.overwrite {
            if let Some(path) = pipeline.final_artifact()? {
                let artifact = ArtifactDescriptor::new(self.config.resolve(&path));
                if artifact.is_present() {
                    info!(
                        "Pipeline '{}': {} already exists, nothing to do",
                        pipeline.name(),
                        artifact.path.display()
                    );
                    result.skipped = true;
                    result.duration_ms = start.elapsed().as_millis() as u64;
                    return Ok(result);
                }
            }
        }

        self.check_prerequisites(&pipeline.prerequisites()?)?;

        let first = self.history.len();
        info!(
            "Pipeline '{}': starting on {} backend in {}",
            pipeline.name(),
            self.backend.kind(),
            self.config.work_dir.display()
        );
        pipeline.execute(self).await?;

        for outcome in &self.history[first..] {
            result.merge_metrics(&outcome.metrics);
            result.stages.push(outcome.run.clone());
        }
        result.final_handle = self.chain.predecessor().clone();
        result.duration_ms = start.elapsed().as_millis() as u64;

        info!(
            "Pipeline '{}' finished: {} stage(s), {} task(s) run, {} skipped in {}ms",
            result.pipeline,
            result.stages.len(),
            result.tasks_run,
            result.tasks_skipped,
            result.duration_ms
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::job::StageRunState;
    use crate::pipeline::{OutputTemplate, StageTemplate};
    use crate::task::TemplateVars;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records submissions instead of running anything
    #[derive(Default)]
    struct RecordingBackend {
        submitted: Mutex<Vec<StageSubmission>>,
    }

    #[async_trait]
    impl ExecutionBackend for RecordingBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Cluster
        }

        async fn submit(&self, stage: &StageSubmission) -> Result<JobHandle> {
            let mut submitted = self.submitted.lock().unwrap();
            submitted.push(stage.clone());
            Ok(JobHandle::Scheduler(format!("{}", 100 + submitted.len())))
        }
    }

    fn stage(config: &OrchestratorConfig, name: &str, n: u32) -> StageSpec {
        StageTemplate::new(name, "echo {index} > {output}")
            .with_output(OutputTemplate::new(format!("{}.{{index}}.out", name)))
            .instantiate(name, n, &TemplateVars::new(), config)
            .unwrap()
    }

    fn complete(task: &Task) {
        std::fs::create_dir_all(task.log.parent().unwrap()).unwrap();
        std::fs::write(
            &task.log,
            "ok\n# Ended (code 0) at Mon, 19 Oct 2026 10:00:00 +0000\n",
        )
        .unwrap();
        std::fs::write(&task.artifacts[0].path, "data").unwrap();
    }

    #[tokio::test]
    async fn test_run_stage_chains_scheduler_handles() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(OrchestratorConfig::new(dir.path()));
        let backend = Arc::new(RecordingBackend::default());
        let mut orch = StageOrchestrator::with_backend(config.clone(), backend.clone());

        let first = orch.run_stage(stage(&config, "acc", 3)).await.unwrap();
        assert_eq!(first.handle, JobHandle::Scheduler("101".to_string()));
        assert!(matches!(first.run.state, StageRunState::Submitted { .. }));

        orch.run_stage(stage(&config, "update", 1)).await.unwrap();

        let submitted = backend.submitted.lock().unwrap();
        assert_eq!(submitted[0].predecessor, JobHandle::Empty);
        assert_eq!(submitted[1].predecessor.scheduler_id(), Some("101"));
    }

    #[tokio::test]
    async fn test_run_stage_submits_only_pending() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(OrchestratorConfig::new(dir.path()));
        let backend = Arc::new(RecordingBackend::default());
        let mut orch = StageOrchestrator::with_backend(config.clone(), backend.clone());

        let spec = stage(&config, "decode", 3);
        complete(&spec.tasks[1]);

        let outcome = orch.run_stage(spec).await.unwrap();
        assert_eq!(outcome.plan.pending, vec![1, 3]);
        assert_eq!(outcome.range.unwrap().to_string(), "1-3");
        assert_eq!(outcome.metrics.tasks_skipped, 1);

        let submitted = backend.submitted.lock().unwrap();
        let indices: Vec<u32> = submitted[0].tasks.iter().map(|t| t.index).collect();
        assert_eq!(indices, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_noop_stage_skips_backend_and_keeps_chain() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(OrchestratorConfig::new(dir.path()));
        let backend = Arc::new(RecordingBackend::default());
        let mut orch = StageOrchestrator::with_backend(config.clone(), backend.clone());

        orch.run_stage(stage(&config, "acc", 1)).await.unwrap();

        let spec = stage(&config, "decode", 2);
        spec.tasks.iter().for_each(complete);
        let outcome = orch.run_stage(spec).await.unwrap();

        assert!(matches!(outcome.run.state, StageRunState::Skipped { .. }));
        assert_eq!(backend.submitted.lock().unwrap().len(), 1);
        assert_eq!(orch.chain().predecessor().scheduler_id(), Some("101"));
    }

    #[test]
    fn test_check_prerequisites() {
        let dir = TempDir::new().unwrap();
        let orch = StageOrchestrator::new(OrchestratorConfig::new(dir.path())).unwrap();
        std::fs::write(dir.path().join("empty"), "").unwrap();
        std::fs::write(dir.path().join("feats.scp"), "utt1 feats.ark:10\n").unwrap();

        assert!(orch.check_prerequisites(&[PathBuf::from("feats.scp")]).is_ok());
        match orch.check_prerequisites(&[PathBuf::from("empty")]) {
            Err(OrchestratorError::PrerequisiteMissing(path)) => {
                assert_eq!(path, dir.path().join("empty"))
            }
            other => panic!("Expected PrerequisiteMissing, got {:?}", other),
        }
    }

    #[test]
    fn test_preview_does_not_delete() {
        let dir = TempDir::new().unwrap();
        let config = OrchestratorConfig::new(dir.path()).with_overwrite(true);
        let orch = StageOrchestrator::new(config.clone()).unwrap();

        let spec = stage(&config, "decode", 2);
        complete(&spec.tasks[0]);

        let preview = orch.preview_stage(&spec).unwrap();
        assert_eq!(preview.plan.pending, vec![1, 2]);
        assert_eq!(preview.range.unwrap().to_string(), "1-2");
        assert!(spec.tasks[0].artifacts[0].path.exists());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = OrchestratorConfig::new("/w").with_max_parallel(0);
        assert!(matches!(
            StageOrchestrator::new(config),
            Err(OrchestratorError::Validation(_))
        ));
    }
}
