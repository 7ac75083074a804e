use crate::backend::script::shell_quote;
use crate::error::{TaskFailure, TaskFailureReason};
use crate::task::{CompletionCriterion, Task};
use std::fs;

/// First line of every task log
pub const LOG_STARTED: &str = "# Started at ";
/// Prefix of the closing line of every task log
pub const LOG_ENDED: &str = "# Ended (";
/// Closing line prefix of a run that exited 0
pub const LOG_CLEAN_EXIT: &str = "# Ended (code 0) at ";

/// Decides whether a task's previous run can be trusted.
///
/// A task is complete when every artifact is present, its log records a
/// clean exit, the log contains the success marker (if one is configured)
/// and the sentinel exists (if required). Artifacts alone are never enough.
///
/// The marker is only searched in the command's own output: the
/// `# Started at` and `# Ended (` lines written around it are reserved.
#[derive(Debug, Clone, Default)]
pub struct CompletionOracle {
    criterion: CompletionCriterion,
}

impl CompletionOracle {
    pub fn new(criterion: CompletionCriterion) -> Self {
        Self { criterion }
    }

    pub fn criterion(&self) -> &CompletionCriterion {
        &self.criterion
    }

    pub fn is_complete(&self, task: &Task) -> bool {
        if !task.artifacts.iter().all(|a| a.is_present()) {
            return false;
        }
        let log = match fs::read_to_string(&task.log) {
            Ok(log) => log,
            Err(_) => return false,
        };
        if !log.lines().any(|line| line.starts_with(LOG_CLEAN_EXIT)) {
            return false;
        }
        if let Some(marker) = &self.criterion.success_marker {
            if !output_contains(&log, marker) {
                return false;
            }
        }
        if self.criterion.require_sentinel && !task.sentinel.is_file() {
            return false;
        }
        true
    }

    /// Judge a finished run: exit code 0 AND the marker, when configured.
    pub fn verify_run(&self, task: &Task, exit_code: Option<i32>) -> Result<(), TaskFailure> {
        if exit_code != Some(0) {
            return Err(TaskFailure {
                index: task.index,
                log: task.log.clone(),
                reason: TaskFailureReason::ExitStatus { code: exit_code },
            });
        }
        if let Some(marker) = &self.criterion.success_marker {
            let log = fs::read_to_string(&task.log).unwrap_or_default();
            if !output_contains(&log, marker) {
                return Err(TaskFailure {
                    index: task.index,
                    log: task.log.clone(),
                    reason: TaskFailureReason::MissingMarker {
                        marker: marker.clone(),
                    },
                });
            }
        }
        Ok(())
    }

    /// The same check as [`is_complete`](Self::is_complete), as a POSIX
    /// shell condition. Used for the run-time re-check in batch scripts.
    pub fn shell_guard(&self, task: &Task) -> String {
        let mut conditions: Vec<String> = task
            .artifacts
            .iter()
            .map(|a| {
                let [plain, gz] = a.representations();
                format!(
                    "{{ [ -s {} ] || [ -s {} ]; }}",
                    shell_quote(&plain.to_string_lossy()),
                    shell_quote(&gz.to_string_lossy())
                )
            })
            .collect();

        let log = shell_quote(&task.log.to_string_lossy());
        conditions.push(format!("grep -q '^# Ended (code 0) at ' {}", log));
        if let Some(marker) = &self.criterion.success_marker {
            conditions.push(marker_check(marker, &log));
        }
        if self.criterion.require_sentinel {
            conditions.push(format!(
                "[ -f {} ]",
                shell_quote(&task.sentinel.to_string_lossy())
            ));
        }
        conditions.join(" && ")
    }
}

fn is_reserved_line(line: &str) -> bool {
    line.starts_with(LOG_STARTED) || line.starts_with(LOG_ENDED)
}

fn output_contains(log: &str, marker: &str) -> bool {
    log.lines()
        .filter(|line| !is_reserved_line(line))
        .any(|line| line.contains(marker))
}

/// Shell form of [`output_contains`]; `log` must already be quoted
pub fn marker_check(marker: &str, log: &str) -> String {
    format!(
        "grep -v -e '^# Started at ' -e '^# Ended (' {} | grep -qF -- {}",
        log,
        shell_quote(marker)
    )
}
