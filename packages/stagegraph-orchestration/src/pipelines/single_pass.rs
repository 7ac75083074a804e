use super::{check_paths, render_path, render_paths};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::orchestrator::StageOrchestrator;
use crate::pipeline::{Pipeline, StageSpec, StageTemplate};
use crate::task::{CommandTemplate, TemplateVars};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One partitioned stage per invocation: decoding, alignment, lattice
/// rescoring. Index `i` processes input partition `i`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinglePassPipeline {
    pub num_jobs: u32,
    pub stage: StageTemplate,
    #[serde(default)]
    pub prerequisites: Vec<CommandTemplate>,
    /// Skip everything when this already exists
    #[serde(default)]
    pub final_artifact: Option<CommandTemplate>,
    #[serde(skip)]
    pub vars: TemplateVars,
}

impl SinglePassPipeline {
    pub fn new(num_jobs: u32, stage: StageTemplate) -> Self {
        Self {
            num_jobs,
            stage,
            prerequisites: Vec::new(),
            final_artifact: None,
            vars: TemplateVars::new(),
        }
    }

    pub fn with_vars(mut self, vars: TemplateVars) -> Self {
        self.vars = vars;
        self
    }

    pub fn with_prerequisite(mut self, path: impl Into<String>) -> Self {
        self.prerequisites.push(CommandTemplate::new(path));
        self
    }

    pub fn with_final_artifact(mut self, path: impl Into<String>) -> Self {
        self.final_artifact = Some(CommandTemplate::new(path));
        self
    }
}

#[async_trait]
impl Pipeline for SinglePassPipeline {
    fn name(&self) -> &str {
        &self.stage.name
    }

    fn final_artifact(&self) -> Result<Option<PathBuf>> {
        self.final_artifact
            .as_ref()
            .map(|t| render_path(t, &self.vars))
            .transpose()
    }

    fn prerequisites(&self) -> Result<Vec<PathBuf>> {
        render_paths(&self.prerequisites, &self.vars)
    }

    fn validate(&self) -> Result<()> {
        if self.num_jobs == 0 {
            return Err(OrchestratorError::validation("num_jobs must be at least 1"));
        }
        self.stage.validate(&|n| self.vars.contains(n))?;
        check_paths(&self.prerequisites, &self.vars)?;
        if let Some(path) = &self.final_artifact {
            check_paths(std::slice::from_ref(path), &self.vars)?;
        }
        Ok(())
    }

    fn first_stage(&self, config: &OrchestratorConfig) -> Result<StageSpec> {
        self.stage
            .instantiate(&self.stage.name, self.num_jobs, &self.vars, config)
    }

    async fn execute(&self, orchestrator: &mut StageOrchestrator) -> Result<()> {
        let spec = self.first_stage(orchestrator.config())?;
        orchestrator.run_stage(spec).await?;
        Ok(())
    }
}
