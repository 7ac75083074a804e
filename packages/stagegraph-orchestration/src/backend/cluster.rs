//! Cluster batch-array backend.
//!
//! One array job per stage. The array range comes from the range
//! compressor; only pending indices get a command block, and each block
//! re-checks completion before running so a compressed range that covers
//! complete tasks is harmless.

use super::script::{ArrayHeader, BatchScript, GuardedCommand, PbsRenderer, ScriptRenderer};
use super::{BackendKind, ExecutionBackend, StageSubmission};
use crate::completion::CompletionOracle;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::job::JobHandle;
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

pub struct ClusterBackend {
    config: Arc<OrchestratorConfig>,
    renderer: Arc<dyn ScriptRenderer>,
}

impl ClusterBackend {
    pub fn new(config: Arc<OrchestratorConfig>) -> Self {
        Self::with_renderer(config, Arc::new(PbsRenderer))
    }

    pub fn with_renderer(config: Arc<OrchestratorConfig>, renderer: Arc<dyn ScriptRenderer>) -> Self {
        Self { config, renderer }
    }

    pub fn renderer(&self) -> &dyn ScriptRenderer {
        self.renderer.as_ref()
    }

    /// Where the script for `stage` is written
    pub fn script_path(&self, stage: &str) -> PathBuf {
        self.config
            .script_dir()
            .join(format!("{}.sh", stage.replace('/', "_")))
    }

    pub fn build_script(&self, stage: &StageSubmission) -> BatchScript {
        let oracle = CompletionOracle::new(stage.criterion.clone());
        let file_stem = stage.stage.replace('/', "_");

        let blocks = stage
            .tasks
            .iter()
            .map(|task| GuardedCommand {
                index: task.index,
                guard: oracle.shell_guard(task),
                command: task.command.clone(),
                log: task.log.clone(),
                success_marker: stage.criterion.success_marker.clone(),
                sentinel: stage
                    .criterion
                    .require_sentinel
                    .then(|| task.sentinel.clone()),
            })
            .collect();

        BatchScript {
            shell: self.config.cluster.shell.clone(),
            header: ArrayHeader {
                job_name: self.config.job_name(&stage.stage),
                range: stage.range.clone(),
                wait_for: stage.predecessor.scheduler_id().map(str::to_string),
                options: self.config.backend_options.clone(),
                work_dir: self.config.work_dir.clone(),
                scheduler_log: self
                    .config
                    .script_dir()
                    .join(format!("{}.{}.log", file_stem, self.renderer.name())),
            },
            blocks,
        }
    }
}

#[async_trait]
impl ExecutionBackend for ClusterBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cluster
    }

    async fn submit(&self, stage: &StageSubmission) -> Result<JobHandle> {
        if stage.tasks.is_empty() {
            return Err(OrchestratorError::submission(
                &stage.stage,
                "no pending tasks reached the cluster backend",
            ));
        }

        let script = self.build_script(stage);
        let path = self.script_path(&stage.stage);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, self.renderer.render(&script)).await?;
        debug!(
            "Stage '{}': wrote {} script {} (indices {:?})",
            stage.stage,
            self.renderer.name(),
            path.display(),
            script.guarded_indices()
        );

        let program = &self.config.cluster.submit_program;
        let output = match Command::new(program)
            .args(&self.config.cluster.submit_args)
            .arg(&path)
            .current_dir(&self.config.work_dir)
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(OrchestratorError::BackendUnavailable(format!(
                    "submission program '{}' not found",
                    program
                )))
            }
            Err(e) => return Err(OrchestratorError::submission(&stage.stage, e)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OrchestratorError::submission(
                &stage.stage,
                format!("{} exited with {}: {}", program, output.status, stderr.trim()),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let id = self.renderer.parse_job_id(&stdout).ok_or_else(|| {
            OrchestratorError::submission(
                &stage.stage,
                format!("no job id in {} output '{}'", program, stdout.trim()),
            )
        })?;

        info!(
            "Stage '{}': submitted array {} as job {}{}",
            stage.stage,
            script.header.range,
            id,
            match &script.header.wait_for {
                Some(dep) => format!(" (after {})", dep),
                None => String::new(),
            }
        );
        Ok(JobHandle::Scheduler(id))
    }
}
