// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The phased task execution framework.
//!
//! A [`Task`] is one retryable unit of work with a matching rollback. Tasks are batched into a
//! [`TaskGroup`], run sequentially or concurrently, and groups are chained into phases by a
//! [`TaskOrchestrator`].

use std::sync::Arc;
use std::time::Duration;

use {
    async_trait::async_trait,
    chrono::{DateTime, Local},
    tokio_util::sync::CancellationToken,
};

use crate::executor::{ExecError, Executor};
use crate::provision::ProvisionError;

mod group;
mod orchestrator;

pub use group::{GroupError, GroupState, TaskGroup, DEFAULT_MAX_PARALLELISM};
pub use orchestrator::{OrchestratorError, OrchestratorState, RollbackScope, TaskOrchestrator};

#[derive(thiserror::Error, Debug)]
pub enum TaskError {
    /// The remote transport failed: connection, authentication or timeout.
    #[error("transport error: {0}")]
    Transport(ExecError),

    /// A remote command ran but failed.
    #[error("{0}")]
    Command(ExecError),

    /// The task cannot run in the current state of the cluster. Never retried.
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("disk provisioning failed: {0}")]
    Provisioning(#[from] ProvisionError),

    /// An action completed but the result did not check out.
    #[error("verification failed: {0}")]
    Verification(String),

    #[error("cancelled")]
    Cancelled,

    #[error("task panicked")]
    Panicked,
}

impl TaskError {
    /// Only failures that a later attempt could plausibly get past are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Transport(_) | TaskError::Command(_))
    }
}

impl From<ExecError> for TaskError {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::Cancelled { .. } => TaskError::Cancelled,
            ExecError::NonZeroExit { .. } => TaskError::Command(e),
            _ => TaskError::Transport(e),
        }
    }
}

/// A unit of work. Tasks keep no state between invocations: anything `rollback` needs has to be
/// derivable from the task's own fields.
#[async_trait]
pub trait Task: Send + Sync {
    fn id(&self) -> String;

    fn description(&self) -> String;

    async fn execute(&self, ctx: &TaskContext) -> Result<(), TaskError>;

    async fn rollback(&self, ctx: &TaskContext) -> Result<(), TaskError>;
}

/// The outcome of running a task, including all of its retries.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: String,
    pub description: String,
    pub success: bool,
    pub error: Option<Arc<TaskError>>,
    pub attempts: u32,
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
    pub duration: Duration,
}

/// What a task needs to reach the cluster: the executor, and a token that cancels in-flight
/// commands and polling loops.
#[derive(Clone, Debug)]
pub struct TaskContext {
    pub executor: Arc<dyn Executor>,
    pub cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        TaskContext {
            executor,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run a command on `host`, aborting if the context is cancelled first.
    pub async fn run(&self, host: &str, command: &str) -> Result<String, ExecError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ExecError::Cancelled { host: host.to_string() }),
            result = self.executor.execute(host, command) => result,
        }
    }

    pub async fn run_timeout(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<String, ExecError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ExecError::Cancelled { host: host.to_string() }),
            result = self.executor.execute_timeout(host, command, timeout) => result,
        }
    }

    /// Like `run`, but a non-zero exit is an answer ("no") rather than an error.
    pub async fn probe(&self, host: &str, command: &str) -> Result<bool, ExecError> {
        match self.run(host, command).await {
            Ok(_) => Ok(true),
            Err(ExecError::NonZeroExit { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn write_file(
        &self,
        host: &str,
        remote: &str,
        contents: &str,
    ) -> Result<(), ExecError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ExecError::Cancelled { host: host.to_string() }),
            result = self.executor.write_file(host, remote, contents) => result,
        }
    }

    pub async fn put_file(
        &self,
        host: &str,
        local: &std::path::Path,
        remote: &str,
    ) -> Result<(), ExecError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ExecError::Cancelled { host: host.to_string() }),
            result = self.executor.put_file(host, local, remote) => result,
        }
    }

    /// Sleep for `duration` unless cancelled.
    pub async fn sleep(&self, duration: Duration) -> Result<(), TaskError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TaskError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
