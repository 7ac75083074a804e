//! Fixed pipeline shapes and the YAML file that selects one.

pub mod estimation;
pub mod mixture;
pub mod single_pass;

pub use estimation::EstimationPipeline;
pub use mixture::MixtureGrowthPipeline;
pub use single_pass::SinglePassPipeline;

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::orchestrator::StageOrchestrator;
use crate::pipeline::{Pipeline, StageTemplate};
use crate::task::{CommandTemplate, TemplateVars};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Only supported pipeline file version
pub const PIPELINE_FILE_VERSION: u32 = 1;

/// Top-level pipeline file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineFile {
    #[serde(default)]
    pub version: Option<u32>,
    /// User placeholders available to every template
    #[serde(default)]
    pub vars: TemplateVars,
    #[serde(default)]
    pub orchestrator: Option<OrchestratorConfig>,
    pub pipeline: PipelineDefinition,
}

impl PipelineFile {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let file: PipelineFile = serde_yaml::from_str(yaml)?;
        file.check_version()?;
        Ok(file)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            OrchestratorError::validation(format!(
                "cannot read pipeline file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml_str(&text)
    }

    fn check_version(&self) -> Result<()> {
        match self.version {
            None => Err(OrchestratorError::validation(format!(
                "pipeline file has no 'version' field (expected version: {})",
                PIPELINE_FILE_VERSION
            ))),
            Some(PIPELINE_FILE_VERSION) => Ok(()),
            Some(found) => Err(OrchestratorError::UnsupportedVersion { found }),
        }
    }

    /// Orchestrator settings from the file, rooted at `work_dir`
    pub fn orchestrator_config(&self, work_dir: impl Into<PathBuf>) -> OrchestratorConfig {
        let mut config = self.orchestrator.clone().unwrap_or_default();
        config.work_dir = work_dir.into();
        config
    }

    /// The pipeline with file vars merged under `overrides`
    pub fn build(&self, overrides: &TemplateVars, num_jobs: Option<u32>) -> Box<dyn Pipeline> {
        let vars = self.vars.merged(overrides);
        let mut definition = self.pipeline.clone();
        if let Some(n) = num_jobs {
            definition.set_num_jobs(n);
        }
        definition.into_pipeline(vars)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineDefinition {
    SinglePass(SinglePassPipeline),
    Estimation(EstimationPipeline),
    MixtureGrowth(MixtureGrowthPipeline),
}

impl PipelineDefinition {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineDefinition::SinglePass(_) => "single_pass",
            PipelineDefinition::Estimation(_) => "estimation",
            PipelineDefinition::MixtureGrowth(_) => "mixture_growth",
        }
    }

    pub fn set_num_jobs(&mut self, num_jobs: u32) {
        match self {
            PipelineDefinition::SinglePass(p) => p.num_jobs = num_jobs,
            PipelineDefinition::Estimation(p) => p.num_jobs = num_jobs,
            PipelineDefinition::MixtureGrowth(p) => p.num_jobs = num_jobs,
        }
    }

    pub fn into_pipeline(self, vars: TemplateVars) -> Box<dyn Pipeline> {
        match self {
            PipelineDefinition::SinglePass(mut p) => {
                p.vars = vars;
                Box::new(p)
            }
            PipelineDefinition::Estimation(mut p) => {
                p.vars = vars;
                Box::new(p)
            }
            PipelineDefinition::MixtureGrowth(mut p) => {
                p.vars = vars;
                Box::new(p)
            }
        }
    }
}

pub(crate) fn default_model_template() -> CommandTemplate {
    CommandTemplate::new("{iter}.mdl")
}

pub(crate) fn render_path(template: &CommandTemplate, vars: &TemplateVars) -> Result<PathBuf> {
    Ok(PathBuf::from(template.render(vars)?))
}

pub(crate) fn render_paths(templates: &[CommandTemplate], vars: &TemplateVars) -> Result<Vec<PathBuf>> {
    templates.iter().map(|t| render_path(t, vars)).collect()
}

pub(crate) fn check_paths(templates: &[CommandTemplate], vars: &TemplateVars) -> Result<()> {
    for template in templates {
        template.check_placeholders(|n| vars.contains(n))?;
    }
    Ok(())
}

/// Model path of iteration `iter`
pub(crate) fn model_path(model: &CommandTemplate, vars: &TemplateVars, iter: u32) -> Result<String> {
    model.render(&vars.clone().with("iter", iter))
}

/// Run `template` as stage `<name>.<iter>`
pub(crate) async fn run_iteration_stage(
    orchestrator: &mut StageOrchestrator,
    template: &StageTemplate,
    iter: u32,
    num_tasks: u32,
    vars: &TemplateVars,
) -> Result<()> {
    let name = format!("{}.{}", template.name, iter);
    let spec = template.instantiate(&name, num_tasks, vars, orchestrator.config())?;
    orchestrator.run_stage(spec).await?;
    Ok(())
}

/// The update of iteration `iter` already produced its model
pub(crate) fn iteration_complete(
    orchestrator: &StageOrchestrator,
    update: &StageTemplate,
    iter: u32,
    vars: &TemplateVars,
) -> Result<bool> {
    let name = format!("{}.{}", update.name, iter);
    let spec = update.instantiate(&name, 1, vars, orchestrator.config())?;
    orchestrator.is_stage_complete(&spec)
}
