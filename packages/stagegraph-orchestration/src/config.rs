//! Orchestrator configuration.
//!
//! Built once at the boundary (pipeline file + CLI flags), validated, then
//! shared read-only as `Arc<OrchestratorConfig>` by every component.

use crate::backend::BackendKind;
use crate::error::{OrchestratorError, Result};
use crate::range::RangePolicy;
use crate::task::CompletionCriterion;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings only the cluster backend reads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Program that accepts a script path and prints the job id
    pub submit_program: String,
    /// Arguments placed before the script path
    pub submit_args: Vec<String>,
    /// Interpreter named in the script's shebang
    pub shell: String,
    /// Defaults to `<work_dir>/q`
    pub script_dir: Option<PathBuf>,
    /// Prepended to stage names to form job names
    pub job_prefix: Option<String>,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            submit_program: "qsub".to_string(),
            submit_args: Vec::new(),
            shell: "/bin/bash".to_string(),
            script_dir: None,
            job_prefix: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Set from the command line, never from a pipeline file
    #[serde(skip)]
    pub work_dir: PathBuf,
    /// Recompute every task, deleting prior outputs first
    pub overwrite: bool,
    pub backend: BackendKind,
    /// Passed verbatim into the batch script header
    pub backend_options: Option<String>,
    /// Ask compressible outputs to be written as `.gz`
    pub compress_outputs: bool,
    /// Default marker for stages that do not set their own
    pub success_marker: Option<String>,
    /// Write `<log stem>.done` after each verified run and require it
    pub write_sentinels: bool,
    /// Local fan-out cap; `None` runs every pending task at once
    pub max_parallel: Option<usize>,
    pub range_policy: RangePolicy,
    /// Shell used to run commands locally (`<shell> -c <command>`)
    pub local_shell: String,
    pub cluster: ClusterSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::new(),
            overwrite: false,
            backend: BackendKind::Local,
            backend_options: None,
            compress_outputs: false,
            success_marker: None,
            write_sentinels: false,
            max_parallel: None,
            range_policy: RangePolicy::Span,
            local_shell: "sh".to_string(),
            cluster: ClusterSettings::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_success_marker(mut self, marker: impl Into<String>) -> Self {
        self.success_marker = Some(marker.into());
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress_outputs = compress;
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = Some(max_parallel);
        self
    }

    pub fn with_cluster(mut self, cluster: ClusterSettings) -> Self {
        self.cluster = cluster;
        self
    }

    /// Completion criterion for a stage, `marker` overriding the default
    pub fn criterion(&self, marker: Option<&str>) -> CompletionCriterion {
        CompletionCriterion {
            success_marker: marker
                .map(str::to_string)
                .or_else(|| self.success_marker.clone()),
            require_sentinel: self.write_sentinels,
        }
    }

    /// Relative paths are taken relative to the work directory
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        self.work_dir.join(path)
    }

    pub fn script_dir(&self) -> PathBuf {
        match &self.cluster.script_dir {
            Some(dir) => self.resolve(dir),
            None => self.work_dir.join("q"),
        }
    }

    pub fn job_name(&self, stage: &str) -> String {
        match &self.cluster.job_prefix {
            Some(prefix) if !prefix.is_empty() => format!("{}{}", prefix, stage),
            _ => stage.to_string(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.work_dir.as_os_str().is_empty() {
            return Err(OrchestratorError::validation("work directory must be set"));
        }
        if self.max_parallel == Some(0) {
            return Err(OrchestratorError::validation(
                "max_parallel must be at least 1 (omit it for unbounded fan-out)",
            ));
        }
        if let RangePolicy::Adaptive { max_list_len: 0 } = self.range_policy {
            return Err(OrchestratorError::validation(
                "range_policy.max_list_len must be at least 1",
            ));
        }
        if self.local_shell.trim().is_empty() {
            return Err(OrchestratorError::validation("local_shell must not be empty"));
        }
        if self.backend == BackendKind::Cluster {
            if self.cluster.submit_program.trim().is_empty() {
                return Err(OrchestratorError::validation(
                    "cluster.submit_program must not be empty",
                ));
            }
            if self.cluster.shell.trim().is_empty() {
                return Err(OrchestratorError::validation("cluster.shell must not be empty"));
            }
        }
        if matches!(&self.success_marker, Some(m) if m.is_empty()) {
            return Err(OrchestratorError::validation(
                "success_marker must not be empty",
            ));
        }
        Ok(())
    }
}
