//! Local multi-process backend.
//!
//! One OS process per pending task, all started together unless a
//! `max_parallel` cap is configured. Every process runs to completion;
//! failures are collected and reported once all siblings have exited.

use super::{BackendKind, ExecutionBackend, StageSubmission};
use crate::completion::{CompletionOracle, LOG_ENDED, LOG_STARTED};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result, TaskFailure, TaskFailureReason};
use crate::job::JobHandle;
use crate::task::Task;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct LocalBackend {
    config: Arc<OrchestratorConfig>,
    limiter: Option<Arc<Semaphore>>,
}

impl LocalBackend {
    pub fn new(config: Arc<OrchestratorConfig>) -> Self {
        let limiter = config.max_parallel.map(|n| Arc::new(Semaphore::new(n)));
        Self { config, limiter }
    }

    /// Start every pending task and return without waiting.
    ///
    /// Without a cap all processes are started before this returns and
    /// [`LocalRun::handle`] lists their pids. With a cap, processes start
    /// as permits free up and are not listed.
    pub async fn launch(&self, stage: &StageSubmission) -> Result<LocalRun> {
        if stage.tasks.is_empty() {
            return Err(OrchestratorError::submission(
                &stage.stage,
                "no pending tasks reached the local backend",
            ));
        }
        if let Some(id) = stage.predecessor.scheduler_id() {
            return Err(OrchestratorError::validation(format!(
                "local stage '{}' cannot wait on scheduler job {}",
                stage.stage, id
            )));
        }

        let shell = self.config.local_shell.clone();
        let work_dir = self.config.work_dir.clone();
        let mut pids = Vec::new();
        let mut joins = Vec::with_capacity(stage.tasks.len());

        info!(
            "Stage '{}': launching {} local task(s){}",
            stage.stage,
            stage.tasks.len(),
            match self.config.max_parallel {
                Some(n) => format!(" (at most {} at once)", n),
                None => String::new(),
            }
        );

        for task in &stage.tasks {
            let task = task.clone();
            let join = match &self.limiter {
                None => match start_task(&shell, &work_dir, &task) {
                    Ok(child) => {
                        if let Some(pid) = child.id() {
                            pids.push(pid);
                        }
                        tokio::spawn(finish_task(child, task.log.clone()))
                    }
                    Err(e) => tokio::spawn(async move { TaskOutcome::SpawnFailed(e) }),
                },
                Some(limiter) => {
                    let limiter = limiter.clone();
                    let shell = shell.clone();
                    let work_dir = work_dir.clone();
                    tokio::spawn(async move {
                        let _permit = match limiter.acquire_owned().await {
                            Ok(permit) => permit,
                            Err(e) => {
                                return TaskOutcome::Error(io::Error::new(io::ErrorKind::Other, e))
                            }
                        };
                        match start_task(&shell, &work_dir, &task) {
                            Ok(child) => finish_task(child, task.log.clone()).await,
                            Err(e) => TaskOutcome::SpawnFailed(e),
                        }
                    })
                }
            };
            joins.push(join);
        }

        Ok(LocalRun {
            stage: stage.stage.clone(),
            shell,
            tasks: stage.tasks.clone(),
            joins,
            pids,
            oracle: CompletionOracle::new(stage.criterion.clone()),
            write_sentinels: stage.criterion.require_sentinel,
        })
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn submit(&self, stage: &StageSubmission) -> Result<JobHandle> {
        let run = self.launch(stage).await?;
        debug!("Stage '{}': running as {}", stage.stage, run.handle());
        run.wait().await?;
        Ok(JobHandle::Empty)
    }
}

enum TaskOutcome {
    Exited(Option<i32>),
    SpawnFailed(io::Error),
    Error(io::Error),
}

/// Tasks of one stage running on this host
pub struct LocalRun {
    stage: String,
    shell: String,
    tasks: Vec<Task>,
    joins: Vec<JoinHandle<TaskOutcome>>,
    pids: Vec<u32>,
    oracle: CompletionOracle,
    write_sentinels: bool,
}

impl LocalRun {
    pub fn handle(&self) -> JobHandle {
        JobHandle::Processes(self.pids.clone())
    }

    /// Wait for every task, then report all failures together
    pub async fn wait(self) -> Result<()> {
        let outcomes = join_all(self.joins).await;
        let total = self.tasks.len();
        let mut failures = Vec::new();
        let mut spawn_failed = false;

        for (task, outcome) in self.tasks.iter().zip(outcomes) {
            let outcome = outcome
                .unwrap_or_else(|e| TaskOutcome::Error(io::Error::new(io::ErrorKind::Other, e)));
            let failure = match outcome {
                TaskOutcome::Exited(code) => match self.oracle.verify_run(task, code) {
                    Ok(()) => {
                        if self.write_sentinels {
                            if let Err(e) = File::create(&task.sentinel) {
                                warn!(
                                    "Task {}: could not write sentinel {}: {}",
                                    task.index,
                                    task.sentinel.display(),
                                    e
                                );
                            }
                        }
                        continue;
                    }
                    Err(failure) => failure,
                },
                TaskOutcome::SpawnFailed(e) => {
                    spawn_failed = true;
                    io_failure(task, format!("could not start: {}", e))
                }
                TaskOutcome::Error(e) => io_failure(task, e.to_string()),
            };
            warn!("Stage '{}': {}", self.stage, failure);
            failures.push(failure);
        }

        if spawn_failed && !shell_available(&self.shell) {
            return Err(OrchestratorError::BackendUnavailable(format!(
                "shell '{}' could not be executed",
                self.shell
            )));
        }
        if !failures.is_empty() {
            let err = OrchestratorError::StageFailed {
                stage: self.stage.clone(),
                total,
                failures,
            };
            error!("{}", err);
            return Err(err);
        }

        info!("Stage '{}': all {} task(s) succeeded", self.stage, total);
        Ok(())
    }
}

fn io_failure(task: &Task, message: String) -> TaskFailure {
    TaskFailure {
        index: task.index,
        log: task.log.clone(),
        reason: TaskFailureReason::Io { message },
    }
}

/// `shell` names an executable file, directly or through `PATH`
fn shell_available(shell: &str) -> bool {
    if shell.contains('/') {
        return Path::new(shell).is_file();
    }
    env::var_os("PATH")
        .map(|path| env::split_paths(&path).any(|dir| dir.join(shell).is_file()))
        .unwrap_or(false)
}

/// Open the log, write the start line, spawn `<shell> -c <command>` with
/// stdout and stderr appended to the log. A spawn error is written to the
/// log before it is returned.
fn start_task(shell: &str, work_dir: &Path, task: &Task) -> io::Result<Child> {
    if let Some(parent) = task.log.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut log = File::create(&task.log)?;
    writeln!(log, "{}{}", LOG_STARTED, Utc::now().to_rfc2822())?;
    let stderr = log.try_clone()?;

    debug!("Task {}: {}", task.index, task.command);
    let spawned = Command::new(shell)
        .arg("-c")
        .arg(&task.command)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(stderr))
        .spawn();

    if let Err(e) = &spawned {
        let note = OpenOptions::new().append(true).open(&task.log).and_then(|mut f| {
            writeln!(
                f,
                "could not start '{}' in {}: {}",
                shell,
                work_dir.display(),
                e
            )?;
            writeln!(f, "{}start failed) at {}", LOG_ENDED, Utc::now().to_rfc2822())
        });
        if let Err(note_err) = note {
            warn!("Could not record start failure in {}: {}", task.log.display(), note_err);
        }
    }
    spawned
}

async fn finish_task(mut child: Child, log: PathBuf) -> TaskOutcome {
    let status = match child.wait().await {
        Ok(status) => status,
        Err(e) => return TaskOutcome::Error(e),
    };
    let code = status.code();
    let footer = OpenOptions::new().append(true).open(&log).and_then(|mut f| {
        writeln!(
            f,
            "{}code {}) at {}",
            LOG_ENDED,
            code.map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            Utc::now().to_rfc2822()
        )
    });
    if let Err(e) = footer {
        warn!("Could not finish log {}: {}", log.display(), e);
    }
    TaskOutcome::Exited(code)
}
