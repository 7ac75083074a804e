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

fn default_name() -> String {
    "mixup".to_string()
}

/// One step of the growth schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixtureStep {
    pub iter: u32,
    /// Mixture count the update of this iteration grows to
    pub mixtures: u32,
}

/// Grows the mixture count by `increment` per iteration until
/// `target_mixtures` (or `max_iters` iterations) is reached.
///
/// Each iteration is a partitioned accumulation followed by a single-task
/// update; the update sees the count it should grow to as `{mixtures}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixtureGrowthPipeline {
    #[serde(default = "default_name")]
    pub name: String,
    pub num_jobs: u32,
    /// Iteration of the starting model
    #[serde(default)]
    pub start_iter: u32,
    pub start_mixtures: u32,
    pub target_mixtures: u32,
    pub increment: u32,
    #[serde(default)]
    pub max_iters: Option<u32>,
    #[serde(default = "default_model_template")]
    pub model: CommandTemplate,
    pub accumulate: StageTemplate,
    pub update: StageTemplate,
    #[serde(default)]
    pub prerequisites: Vec<CommandTemplate>,
    #[serde(skip)]
    pub vars: TemplateVars,
}

impl MixtureGrowthPipeline {
    pub fn new(
        num_jobs: u32,
        start_mixtures: u32,
        target_mixtures: u32,
        increment: u32,
        accumulate: StageTemplate,
        update: StageTemplate,
    ) -> Self {
        Self {
            name: default_name(),
            num_jobs,
            start_iter: 0,
            start_mixtures,
            target_mixtures,
            increment,
            max_iters: None,
            model: default_model_template(),
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

    pub fn with_max_iters(mut self, max_iters: u32) -> Self {
        self.max_iters = Some(max_iters);
        self
    }

    /// Deterministic, so the final model is known before anything runs
    pub fn schedule(&self) -> Vec<MixtureStep> {
        let mut steps = Vec::new();
        let mut mixtures = self.start_mixtures;
        let mut iter = self.start_iter;
        let limit = self.max_iters.unwrap_or(u32::MAX) as usize;

        while mixtures < self.target_mixtures && steps.len() < limit && self.increment > 0 {
            mixtures = mixtures
                .saturating_add(self.increment)
                .min(self.target_mixtures);
            steps.push(MixtureStep { iter, mixtures });
            iter += 1;
        }
        steps
    }

    fn step_vars(&self, step: MixtureStep) -> Result<TemplateVars> {
        Ok(self
            .vars
            .clone()
            .with("iter", step.iter)
            .with("next_iter", step.iter + 1)
            .with("mixtures", step.mixtures)
            .with("model", model_path(&self.model, &self.vars, step.iter)?)
            .with(
                "next_model",
                model_path(&self.model, &self.vars, step.iter + 1)?,
            ))
    }
}

#[async_trait]
impl Pipeline for MixtureGrowthPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn final_artifact(&self) -> Result<Option<PathBuf>> {
        let last = self
            .schedule()
            .last()
            .map_or(self.start_iter, |step| step.iter + 1);
        Ok(Some(PathBuf::from(model_path(&self.model, &self.vars, last)?)))
    }

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
        if self.increment == 0 {
            return Err(OrchestratorError::validation("increment must be at least 1"));
        }
        if self.target_mixtures <= self.start_mixtures {
            return Err(OrchestratorError::validation(format!(
                "target_mixtures ({}) must exceed start_mixtures ({})",
                self.target_mixtures, self.start_mixtures
            )));
        }
        if self.max_iters == Some(0) {
            return Err(OrchestratorError::validation("max_iters must be at least 1"));
        }

        self.model
            .check_placeholders(|n| n == "iter" || self.vars.contains(n))?;
        let known = |n: &str| {
            matches!(n, "iter" | "next_iter" | "mixtures" | "model" | "next_model")
                || self.vars.contains(n)
        };
        self.accumulate.validate(&known)?;
        self.update.validate(&known)?;
        check_paths(&self.prerequisites, &self.vars)
    }

    fn first_stage(&self, config: &OrchestratorConfig) -> Result<StageSpec> {
        let step = self.schedule().first().copied().ok_or_else(|| {
            OrchestratorError::validation("mixture schedule is empty")
        })?;
        self.accumulate.instantiate(
            &format!("{}.{}", self.accumulate.name, step.iter),
            self.num_jobs,
            &self.step_vars(step)?,
            config,
        )
    }

    async fn execute(&self, orchestrator: &mut StageOrchestrator) -> Result<()> {
        for step in self.schedule() {
            info!(
                "Pipeline '{}': iteration {}, growing to {} mixtures (target {})",
                self.name, step.iter, step.mixtures, self.target_mixtures
            );
            let vars = self.step_vars(step)?;
            if iteration_complete(orchestrator, &self.update, step.iter, &vars)? {
                info!(
                    "Pipeline '{}': iteration {} already complete",
                    self.name, step.iter
                );
                continue;
            }
            run_iteration_stage(orchestrator, &self.accumulate, step.iter, self.num_jobs, &vars)
                .await?;
            run_iteration_stage(orchestrator, &self.update, step.iter, 1, &vars).await?;
        }
        Ok(())
    }
}
