use crate::completion::CompletionOracle;
use crate::error::{OrchestratorError, Result};
use crate::task::Task;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Partition of a stage's indices into work still to do and work done
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub total: u32,
    /// Ascending
    pub pending: Vec<u32>,
    /// Ascending
    pub complete: Vec<u32>,
    /// Files deleted while invalidating pending tasks
    pub invalidated: usize,
}

impl Plan {
    pub fn is_noop(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Computes which tasks of a stage must run and clears their stale outputs
#[derive(Debug, Clone)]
pub struct TaskSetPlanner {
    oracle: CompletionOracle,
    overwrite: bool,
}

impl TaskSetPlanner {
    pub fn new(oracle: CompletionOracle, overwrite: bool) -> Self {
        Self { oracle, overwrite }
    }

    pub fn oracle(&self) -> &CompletionOracle {
        &self.oracle
    }

    pub fn overwrite(&self) -> bool {
        self.overwrite
    }

    /// Same planner, judging completion with a different oracle
    pub fn with_oracle(&self, oracle: CompletionOracle) -> Self {
        Self {
            oracle,
            overwrite: self.overwrite,
        }
    }

    /// Partition the tasks and delete every output of the pending ones
    /// (both compressed and uncompressed forms, plus sentinels).
    pub fn plan(&self, tasks: &[Task]) -> Result<Plan> {
        let mut plan = self.survey(tasks)?;

        for task in tasks.iter().filter(|t| plan.pending.binary_search(&t.index).is_ok()) {
            let removed = task.invalidate()?;
            if removed > 0 {
                warn!(
                    "Invalidated {} stale file(s) of task {} (log: {})",
                    removed,
                    task.index,
                    task.log.display()
                );
            }
            plan.invalidated += removed;
        }

        Ok(plan)
    }

    /// Compute the partition without touching the filesystem
    pub fn survey(&self, tasks: &[Task]) -> Result<Plan> {
        validate_indices(tasks)?;

        let mut sorted: Vec<&Task> = tasks.iter().collect();
        sorted.sort_by_key(|t| t.index);

        let mut plan = Plan {
            total: tasks.len() as u32,
            ..Default::default()
        };
        for task in sorted {
            if !self.overwrite && self.oracle.is_complete(task) {
                debug!("Task {} already complete", task.index);
                plan.complete.push(task.index);
            } else {
                plan.pending.push(task.index);
            }
        }
        Ok(plan)
    }
}

/// Indices must be exactly 1..=N and artifact paths must not be shared.
pub fn validate_indices(tasks: &[Task]) -> Result<()> {
    let n = tasks.len() as u32;
    let mut seen = HashSet::with_capacity(tasks.len());
    for task in tasks {
        if task.index == 0 || task.index > n {
            return Err(OrchestratorError::validation(format!(
                "task index {} outside 1..={}",
                task.index, n
            )));
        }
        if !seen.insert(task.index) {
            return Err(OrchestratorError::validation(format!(
                "duplicate task index {}",
                task.index
            )));
        }
    }

    let mut paths: HashSet<PathBuf> = HashSet::new();
    for task in tasks {
        for artifact in &task.artifacts {
            if !paths.insert(artifact.path.clone()) {
                return Err(OrchestratorError::validation(format!(
                    "artifact {} is written by more than one task",
                    artifact.path.display()
                )));
            }
        }
    }
    Ok(())
}
