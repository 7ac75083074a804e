use super::{
    check_paths, default_model_template, iteration_complete, model_path, render_paths,
    run_iteration_stage,
};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::orchestrator::StageOrchestrator;
use crate::pipeline::{Pipeline, StageSpec, StageTemplate};
use crate::task::{CommandTemplate, TemplateVars};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

/// Placeholders each iteration adds on top of the user vars
pub const ITERATION_VARS: &[&str] = &["iter", "next_iter", "model", "next_model"];

fn default_name() -> String {
    "train".to_string()
}

fn default_start_iter() -> u32 {
    1
}

/// Iterative estimation loop.
///
/// For each iteration in `start_iter..num_iters`: an optional partitioned
/// realignment (on `realign_iters`), a partitioned accumulation, then a
/// single-task update that turns `{model}` into `{next_model}`. The model
/// of iteration `num_iters` is the final artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimationPipeline {
    #[serde(default = "default_name")]
    pub name: String,
    pub num_jobs: u32,
    pub num_iters: u32,
    #[serde(default = "default_start_iter")]
    pub start_iter: u32,
    #[serde(default)]
    pub realign_iters: Vec<u32>,
    /// Model path for iteration `{iter}`
    #[serde(default = "default_model_template")]
    pub model: CommandTemplate,
    #[serde(default)]
    pub realign: Option<StageTemplate>,
    pub accumulate: StageTemplate,
    pub update: StageTemplate,
    #[serde(default)]
    pub prerequisites: Vec<CommandTemplate>,
    #[serde(skip)]
    pub vars: TemplateVars,
}

impl EstimationPipeline {
    pub fn new(
        num_jobs: u32,
        num_iters: u32,
        accumulate: StageTemplate,
        update: StageTemplate,
    ) -> Self {
        Self {
            name: default_name(),
            num_jobs,
            num_iters,
            start_iter: default_start_iter(),
            realign_iters: Vec::new(),
            model: default_model_template(),
            realign: None,
            accumulate,
            update,
            prerequisites: Vec::new(),
            vars: TemplateVars::new(),
        }
    }

    pub fn with_vars(mut self, vars: TemplateVars) -> Self {
        self.vars = vars;
        self
    }

    pub fn with_start_iter(mut self, start_iter: u32) -> Self {
        self.start_iter = start_iter;
        self
    }

    pub fn with_realign(mut self, realign: StageTemplate, iters: Vec<u32>) -> Self {
        self.realign = Some(realign);
        self.realign_iters = iters;
        self
    }

    pub(crate) fn iteration_vars(&self, iter: u32) -> Result<TemplateVars> {
        Ok(self
            .vars
            .clone()
            .with("iter", iter)
            .with("next_iter", iter + 1)
            .with("model", model_path(&self.model, &self.vars, iter)?)
            .with("next_model", model_path(&self.model, &self.vars, iter + 1)?))
    }

    fn realigns_at(&self, iter: u32) -> Option<&StageTemplate> {
        self.realign
            .as_ref()
            .filter(|_| self.realign_iters.contains(&iter))
    }
}

#[async_trait]
impl Pipeline for EstimationPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn final_artifact(&self) -> Result<Option<PathBuf>> {
        Ok(Some(PathBuf::from(model_path(
            &self.model,
            &self.vars,
            self.num_iters,
        )?)))
    }

    /// The starting model plus the declared inputs
    fn prerequisites(&self) -> Result<Vec<PathBuf>> {
        let mut paths = vec![PathBuf::from(model_path(
            &self.model,
            &self.vars,
            self.start_iter,
        )?)];
        paths.extend(render_paths(&self.prerequisites, &self.vars)?);
        Ok(paths)
    }

    fn validate(&self) -> Result<()> {
        if self.num_jobs == 0 {
            return Err(OrchestratorError::validation("num_jobs must be at least 1"));
        }
        if self.start_iter >= self.num_iters {
            return Err(OrchestratorError::validation(format!(
                "start_iter ({}) must be below num_iters ({})",
                self.start_iter, self.num_iters
            )));
        }
        if self.realign.is_none() && !self.realign_iters.is_empty() {
            return Err(OrchestratorError::validation(
                "realign_iters given without a realign stage",
            ));
        }

        self.model
            .check_placeholders(|n| n == "iter" || self.vars.contains(n))?;
        let known = |n: &str| ITERATION_VARS.contains(&n) || self.vars.contains(n);
        if let Some(realign) = &self.realign {
            realign.validate(&known)?;
        }
        self.accumulate.validate(&known)?;
        self.update.validate(&known)?;
        check_paths(&self.prerequisites, &self.vars)
    }

    fn first_stage(&self, config: &OrchestratorConfig) -> Result<StageSpec> {
        let iter = self.start_iter;
        let template = self.realigns_at(iter).unwrap_or(&self.accumulate);
        template.instantiate(
            &format!("{}.{}", template.name, iter),
            self.num_jobs,
            &self.iteration_vars(iter)?,
            config,
        )
    }

    async fn execute(&self, orchestrator: &mut StageOrchestrator) -> Result<()> {
        for iter in self.start_iter..self.num_iters {
            info!(
                "Pipeline '{}': iteration {} (of {})",
                self.name, iter, self.num_iters
            );
            let vars = self.iteration_vars(iter)?;
            if iteration_complete(orchestrator, &self.update, iter, &vars)? {
                info!("Pipeline '{}': iteration {} already complete", self.name, iter);
                continue;
            }

            if let Some(realign) = self.realigns_at(iter) {
                run_iteration_stage(orchestrator, realign, iter, self.num_jobs, &vars).await?;
            }
            run_iteration_stage(orchestrator, &self.accumulate, iter, self.num_jobs, &vars).await?;
            run_iteration_stage(orchestrator, &self.update, iter, 1, &vars).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::OutputTemplate;
    use std::fs;
    use tempfile::TempDir;

    /// acc: copy the model per job; update: model + 1
    fn counting(num_jobs: u32, num_iters: u32) -> EstimationPipeline {
        EstimationPipeline::new(
            num_jobs,
            num_iters,
            StageTemplate::new("acc", "cat {model} > {output}")
                .with_output(OutputTemplate::new("{iter}.{index}.acc")),
            StageTemplate::new("update", "echo $(( $(cat {model}) + 1 )) > {output}")
                .with_output(OutputTemplate::new("{next_model}")),
        )
    }

    #[test]
    fn test_final_artifact_and_prerequisites() {
        let pipeline = counting(2, 4).with_start_iter(2);
        assert_eq!(
            pipeline.final_artifact().unwrap(),
            Some(PathBuf::from("4.mdl"))
        );
        assert_eq!(pipeline.prerequisites().unwrap(), vec![PathBuf::from("2.mdl")]);
    }

    #[test]
    fn test_validate() {
        assert!(counting(2, 4).validate().is_ok());
        assert!(counting(2, 1).validate().is_err());
        assert!(counting(0, 4).validate().is_err());

        let mut pipeline = counting(2, 4);
        pipeline.realign_iters = vec![2];
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn test_first_stage_prefers_realign() {
        let config = OrchestratorConfig::new("/exp/mono");
        let pipeline = counting(2, 4).with_realign(
            StageTemplate::new("align", "align {model} {index}"),
            vec![1, 3],
        );
        let spec = pipeline.first_stage(&config).unwrap();
        assert_eq!(spec.name, "align.1");
        assert_eq!(spec.tasks[0].command, "align 1.mdl 1");
    }

    #[tokio::test]
    async fn test_iterations_feed_next_model() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("1.mdl"), "10\n").unwrap();
        let mut orch = StageOrchestrator::new(OrchestratorConfig::new(dir.path())).unwrap();

        let result = orch.run_pipeline(&counting(2, 4)).await.unwrap();
        assert_eq!(result.stages.len(), 6);
        assert_eq!(result.tasks_run, 9);
        assert_eq!(
            fs::read_to_string(dir.path().join("4.mdl")).unwrap().trim(),
            "13"
        );
        assert!(dir.path().join("log/update.3.1.log").exists());
    }
}
