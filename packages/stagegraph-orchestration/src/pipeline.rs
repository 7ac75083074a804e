use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::orchestrator::StageOrchestrator;
use crate::task::{ArtifactDescriptor, CommandTemplate, CompletionCriterion, Task, TemplateVars};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Log path used when a stage template does not name one
pub const DEFAULT_LOG_TEMPLATE: &str = "log/{stage}.{index}.log";

/// Placeholders every stage template may use without declaring them
pub const BUILTIN_VARS: &[&str] = &["work_dir", "stage", "index", "num_jobs", "output"];

/// One output of a stage, per index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputTemplate {
    pub path: CommandTemplate,
    /// Written as `.gz` when the orchestrator compresses outputs
    #[serde(default)]
    pub compressible: bool,
}

impl OutputTemplate {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: CommandTemplate::new(path),
            compressible: false,
        }
    }

    pub fn compressible(path: impl Into<String>) -> Self {
        Self {
            path: CommandTemplate::new(path),
            compressible: true,
        }
    }
}

/// Declarative stage: a command template run once per index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTemplate {
    pub name: String,
    pub command: CommandTemplate,
    #[serde(default)]
    pub outputs: Vec<OutputTemplate>,
    /// Defaults to [`DEFAULT_LOG_TEMPLATE`]
    #[serde(default)]
    pub log: Option<CommandTemplate>,
    /// Overrides the orchestrator-wide marker
    #[serde(default)]
    pub success_marker: Option<String>,
}

impl StageTemplate {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: CommandTemplate::new(command),
            outputs: Vec::new(),
            log: None,
            success_marker: None,
        }
    }

    pub fn with_output(mut self, output: OutputTemplate) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = Some(CommandTemplate::new(log));
        self
    }

    pub fn with_success_marker(mut self, marker: impl Into<String>) -> Self {
        self.success_marker = Some(marker.into());
        self
    }

    fn log_template(&self) -> CommandTemplate {
        self.log
            .clone()
            .unwrap_or_else(|| CommandTemplate::new(DEFAULT_LOG_TEMPLATE))
    }

    /// Fail on placeholders that neither the builtins, `output_N`, nor
    /// `known` account for. Run before any task starts.
    pub fn validate(&self, known: &dyn Fn(&str) -> bool) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(OrchestratorError::validation("stage name must not be empty"));
        }
        if self.command.as_str().trim().is_empty() {
            return Err(OrchestratorError::validation(format!(
                "stage '{}' has an empty command",
                self.name
            )));
        }
        let outputs = self.outputs.len();
        let accepted = |name: &str| {
            BUILTIN_VARS.contains(&name) || is_output_var(name, outputs) || known(name)
        };

        self.command.check_placeholders(&accepted)?;
        self.log_template().check_placeholders(&accepted)?;
        for output in &self.outputs {
            // Outputs are rendered before output vars exist
            output
                .path
                .check_placeholders(|n| n != "output" && !is_output_var(n, outputs) && accepted(n))?;
        }
        Ok(())
    }

    /// Render every task of the stage named `name`.
    ///
    /// Output and log paths are resolved against the work directory. The
    /// command sees `{output}` (first output) and `{output_N}` as the path
    /// it should write, `.gz` included when compression applies.
    pub fn instantiate(
        &self,
        name: &str,
        num_tasks: u32,
        vars: &TemplateVars,
        config: &OrchestratorConfig,
    ) -> Result<StageSpec> {
        if num_tasks == 0 {
            return Err(OrchestratorError::validation(format!(
                "stage '{}' needs at least one task",
                name
            )));
        }

        let log_template = self.log_template();
        let mut tasks = Vec::with_capacity(num_tasks as usize);

        for index in 1..=num_tasks {
            let mut task_vars = vars
                .clone()
                .with("work_dir", config.work_dir.display())
                .with("stage", name)
                .with("index", index)
                .with("num_jobs", num_tasks);

            let mut artifacts = Vec::with_capacity(self.outputs.len());
            for output in &self.outputs {
                let path = config.resolve(output.path.render(&task_vars)?);
                artifacts.push(if output.compressible && config.compress_outputs {
                    ArtifactDescriptor::compressed(path)
                } else {
                    ArtifactDescriptor::new(path)
                });
            }
            for (i, artifact) in artifacts.iter().enumerate() {
                let path = artifact.output_path().display().to_string();
                if i == 0 {
                    task_vars.insert("output", &path);
                }
                task_vars.insert(format!("output_{}", i + 1), path);
            }

            let command = self.command.render(&task_vars)?;
            let log = config.resolve(log_template.render(&task_vars)?);
            let task = artifacts
                .into_iter()
                .fold(Task::new(index, command, log), Task::with_artifact);
            tasks.push(task);
        }

        Ok(StageSpec {
            name: name.to_string(),
            tasks,
            criterion: config.criterion(self.success_marker.as_deref()),
        })
    }
}

fn is_output_var(name: &str, outputs: usize) -> bool {
    name.strip_prefix("output_")
        .and_then(|n| n.parse::<usize>().ok())
        .map_or(false, |n| n >= 1 && n <= outputs)
}

/// A fully rendered stage, ready for planning
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub name: String,
    pub tasks: Vec<Task>,
    pub criterion: CompletionCriterion,
}

/// Stage metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMetrics {
    pub tasks_total: usize,
    pub tasks_run: usize,
    pub tasks_skipped: usize,
    pub files_invalidated: usize,
    pub duration_ms: u64,
}

/// A fixed-shape pipeline the orchestrator can run
#[async_trait]
pub trait Pipeline: Send + Sync {
    fn name(&self) -> &str;

    /// Artifact whose presence means the whole pipeline already ran
    fn final_artifact(&self) -> Result<Option<PathBuf>> {
        Ok(None)
    }

    /// Inputs that must exist and be non-empty before anything runs
    fn prerequisites(&self) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }

    /// Checks that need no filesystem access (placeholders, counts)
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// First stage to run, for previews
    fn first_stage(&self, config: &OrchestratorConfig) -> Result<StageSpec>;

    async fn execute(&self, orchestrator: &mut StageOrchestrator) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OrchestratorConfig {
        OrchestratorConfig::new("/exp/tri1")
    }

    #[test]
    fn test_instantiate_renders_tasks() {
        let template = StageTemplate::new("decode", "decode --model {model} feats.{index} {output}")
            .with_output(OutputTemplate::compressible("lat.{index}"));
        let vars = TemplateVars::new().with("model", "final.mdl");

        let spec = template.instantiate("decode", 2, &vars, &config()).unwrap();
        assert_eq!(spec.tasks.len(), 2);

        let task = &spec.tasks[1];
        assert_eq!(task.index, 2);
        assert_eq!(task.command, "decode --model final.mdl feats.2 /exp/tri1/lat.2");
        assert_eq!(task.log, PathBuf::from("/exp/tri1/log/decode.2.log"));
        assert_eq!(task.artifacts[0].path, PathBuf::from("/exp/tri1/lat.2"));
        assert!(!task.artifacts[0].compressible);
    }

    #[test]
    fn test_instantiate_with_compression() {
        let template = StageTemplate::new("align", "align {index} | gzip -c > {output}")
            .with_output(OutputTemplate::compressible("ali.{index}"))
            .with_output(OutputTemplate::new("ali.{index}.txt"))
            .with_log("log/custom.{index}.log");
        let config = config().with_compression(true);

        let spec = template
            .instantiate("align", 1, &TemplateVars::new(), &config)
            .unwrap();
        let task = &spec.tasks[0];
        assert_eq!(task.command, "align 1 | gzip -c > /exp/tri1/ali.1.gz");
        assert!(task.artifacts[0].compressible);
        assert!(!task.artifacts[1].compressible);
        assert_eq!(task.log, PathBuf::from("/exp/tri1/log/custom.1.log"));
    }

    #[test]
    fn test_instantiate_uses_stage_marker() {
        let template = StageTemplate::new("acc", "acc {index}").with_success_marker("Done");
        let spec = template
            .instantiate("acc.3", 1, &TemplateVars::new(), &config().with_success_marker("x"))
            .unwrap();
        assert_eq!(spec.criterion.success_marker.as_deref(), Some("Done"));
        assert_eq!(spec.tasks[0].log, PathBuf::from("/exp/tri1/log/acc.3.1.log"));
    }

    #[test]
    fn test_validate_placeholders() {
        let template = StageTemplate::new("acc", "acc {model} {output_1} {output_2}")
            .with_output(OutputTemplate::new("{iter}.{index}.acc"))
            .with_output(OutputTemplate::new("{iter}.{index}.stats"));
        assert!(template
            .validate(&|n| n == "model" || n == "iter")
            .is_ok());
        assert!(template.validate(&|n| n == "model").is_err());

        let bad = StageTemplate::new("acc", "acc {output_3}").with_output(OutputTemplate::new("a"));
        assert!(bad.validate(&|_| false).is_err());

        let cyclic = StageTemplate::new("acc", "acc").with_output(OutputTemplate::new("{output}"));
        assert!(cyclic.validate(&|_| false).is_err());
    }

    #[test]
    fn test_zero_tasks_rejected() {
        let template = StageTemplate::new("decode", "true");
        assert!(template
            .instantiate("decode", 0, &TemplateVars::new(), &config())
            .is_err());
    }
}
