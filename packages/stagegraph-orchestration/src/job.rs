use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Reference to submitted work, usable as a wait precondition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum JobHandle {
    /// Work already finished synchronously
    #[default]
    Empty,
    /// Local OS process ids
    Processes(Vec<u32>),
    /// Scheduler-assigned job id
    Scheduler(String),
}

impl JobHandle {
    pub fn is_empty(&self) -> bool {
        match self {
            JobHandle::Empty => true,
            JobHandle::Processes(pids) => pids.is_empty(),
            JobHandle::Scheduler(id) => id.is_empty(),
        }
    }

    pub fn scheduler_id(&self) -> Option<&str> {
        match self {
            JobHandle::Scheduler(id) if !id.is_empty() => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobHandle::Empty => write!(f, "-"),
            JobHandle::Processes(pids) => {
                let pids: Vec<String> = pids.iter().map(|p| p.to_string()).collect();
                write!(f, "pids[{}]", pids.join(","))
            }
            JobHandle::Scheduler(id) => write!(f, "{}", id),
        }
    }
}

/// Lifecycle of one stage execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageRunState {
    Planned {
        planned_at: DateTime<Utc>,
        pending: Vec<u32>,
    },
    Skipped {
        skipped_at: DateTime<Utc>,
        reason: String,
    },
    Submitted {
        submitted_at: DateTime<Utc>,
        handle: JobHandle,
        range: String,
        tasks: usize,
    },
    Succeeded {
        submitted_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        duration_ms: u64,
        tasks_run: usize,
    },
    Failed {
        failed_at: DateTime<Utc>,
        error: String,
        failed_logs: Vec<PathBuf>,
    },
}

impl StageRunState {
    pub fn state_name(&self) -> &'static str {
        match self {
            StageRunState::Planned { .. } => "planned",
            StageRunState::Skipped { .. } => "skipped",
            StageRunState::Submitted { .. } => "submitted",
            StageRunState::Succeeded { .. } => "succeeded",
            StageRunState::Failed { .. } => "failed",
        }
    }

    /// Submitted is not terminal: cluster stages stay there, their outcome
    /// is only observable through the scheduler.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageRunState::Skipped { .. }
                | StageRunState::Succeeded { .. }
                | StageRunState::Failed { .. }
        )
    }
}

/// Record of a stage execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRun {
    pub id: Uuid,
    pub stage: String,
    pub total_tasks: u32,
    pub state: StageRunState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StageRun {
    pub fn planned(stage: impl Into<String>, total_tasks: u32, pending: Vec<u32>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            stage: stage.into(),
            total_tasks,
            state: StageRunState::Planned {
                planned_at: now,
                pending,
            },
            created_at: now,
            updated_at: now,
        }
    }

    /// Handle produced by the submission, if it got that far
    pub fn handle(&self) -> Option<&JobHandle> {
        match &self.state {
            StageRunState::Submitted { handle, .. } => Some(handle),
            _ => None,
        }
    }
}

/// State machine for stage run transitions
pub struct StageRunStateMachine {
    run: StageRun,
}

impl StageRunStateMachine {
    pub fn new(run: StageRun) -> Self {
        Self { run }
    }

    pub fn run(&self) -> &StageRun {
        &self.run
    }

    pub fn into_run(self) -> StageRun {
        self.run
    }

    fn invalid(&self, to: &str) -> OrchestratorError {
        OrchestratorError::InvalidStateTransition {
            from: self.run.state.state_name().to_string(),
            to: to.to_string(),
        }
    }

    /// Transition: PLANNED → SKIPPED
    pub fn skip(&mut self, reason: impl Into<String>) -> Result<()> {
        match &self.run.state {
            StageRunState::Planned { .. } => {
                let now = Utc::now();
                self.run.state = StageRunState::Skipped {
                    skipped_at: now,
                    reason: reason.into(),
                };
                self.run.updated_at = now;
                Ok(())
            }
            _ => Err(self.invalid("skipped")),
        }
    }

    /// Transition: PLANNED → SUBMITTED
    pub fn submit(&mut self, handle: JobHandle, range: String) -> Result<()> {
        match &self.run.state {
            StageRunState::Planned { pending, .. } => {
                let now = Utc::now();
                let tasks = pending.len();
                self.run.state = StageRunState::Submitted {
                    submitted_at: now,
                    handle,
                    range,
                    tasks,
                };
                self.run.updated_at = now;
                Ok(())
            }
            _ => Err(self.invalid("submitted")),
        }
    }

    /// Transition: SUBMITTED → SUCCEEDED
    pub fn succeed(&mut self) -> Result<()> {
        match &self.run.state {
            StageRunState::Submitted {
                submitted_at,
                tasks,
                ..
            } => {
                let now = Utc::now();
                let duration_ms = (now - *submitted_at).num_milliseconds().max(0) as u64;
                self.run.state = StageRunState::Succeeded {
                    submitted_at: *submitted_at,
                    completed_at: now,
                    duration_ms,
                    tasks_run: *tasks,
                };
                self.run.updated_at = now;
                Ok(())
            }
            _ => Err(self.invalid("succeeded")),
        }
    }

    /// Transition: PLANNED | SUBMITTED → FAILED
    pub fn fail(&mut self, error: &OrchestratorError) -> Result<()> {
        match &self.run.state {
            StageRunState::Planned { .. } | StageRunState::Submitted { .. } => {
                let now = Utc::now();
                self.run.state = StageRunState::Failed {
                    failed_at: now,
                    error: error.to_string(),
                    failed_logs: error.failed_logs(),
                };
                self.run.updated_at = now;
                Ok(())
            }
            _ => Err(self.invalid("failed")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{TaskFailure, TaskFailureReason};

    #[test]
    fn test_handle_emptiness() {
        assert!(JobHandle::Empty.is_empty());
        assert!(JobHandle::Processes(vec![]).is_empty());
        assert!(!JobHandle::Processes(vec![42]).is_empty());
        assert!(!JobHandle::Scheduler("1234[]".to_string()).is_empty());
        assert_eq!(
            JobHandle::Scheduler("1234[]".to_string()).scheduler_id(),
            Some("1234[]")
        );
        assert_eq!(JobHandle::Processes(vec![1]).scheduler_id(), None);
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(JobHandle::Empty.to_string(), "-");
        assert_eq!(JobHandle::Processes(vec![10, 11]).to_string(), "pids[10,11]");
        assert_eq!(JobHandle::Scheduler("77".to_string()).to_string(), "77");
    }

    #[test]
    fn test_run_planned_to_skipped() {
        let mut sm = StageRunStateMachine::new(StageRun::planned("decode", 3, vec![]));
        sm.skip("all tasks complete").unwrap();
        assert!(matches!(sm.run().state, StageRunState::Skipped { .. }));
        assert!(sm.run().state.is_terminal());
    }

    #[test]
    fn test_run_submitted_to_succeeded() {
        let mut sm = StageRunStateMachine::new(StageRun::planned("decode", 3, vec![1, 3]));
        sm.submit(JobHandle::Empty, "1-3".to_string()).unwrap();
        assert!(!sm.run().state.is_terminal());
        sm.succeed().unwrap();

        match &sm.run().state {
            StageRunState::Succeeded { tasks_run, .. } => assert_eq!(*tasks_run, 2),
            other => panic!("Expected Succeeded state, got {:?}", other),
        }
    }

    #[test]
    fn test_run_failure_keeps_logs() {
        let mut sm = StageRunStateMachine::new(StageRun::planned("acc", 2, vec![1, 2]));
        let err = OrchestratorError::StageFailed {
            stage: "acc".to_string(),
            total: 2,
            failures: vec![TaskFailure {
                index: 2,
                log: PathBuf::from("log/acc.2.log"),
                reason: TaskFailureReason::ExitStatus { code: Some(1) },
            }],
        };
        sm.fail(&err).unwrap();

        match &sm.run().state {
            StageRunState::Failed { failed_logs, .. } => {
                assert_eq!(failed_logs, &vec![PathBuf::from("log/acc.2.log")]);
            }
            other => panic!("Expected Failed state, got {:?}", other),
        }
    }

    #[test]
    fn test_cannot_succeed_without_submission() {
        let mut sm = StageRunStateMachine::new(StageRun::planned("decode", 1, vec![1]));
        assert!(sm.succeed().is_err());
        sm.skip("nothing").unwrap();
        assert!(sm.submit(JobHandle::Empty, "1".to_string()).is_err());
    }
}
