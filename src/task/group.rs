// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use {
    chrono::Local,
    futures::FutureExt,
    log::{debug, error, info, warn},
    tokio::{sync::Semaphore, task::JoinSet},
};

use super::{Task, TaskContext, TaskError, TaskResult};

/// The default number of tasks a parallel group runs at once.
pub const DEFAULT_MAX_PARALLELISM: usize = 16;

#[derive(thiserror::Error, Debug)]
pub enum GroupError {
    #[error("task {task_id} in group {group} failed: {source}")]
    Task {
        group: String,
        task_id: String,
        #[source]
        source: Arc<TaskError>,
    },

    #[error("rollback of group {group} failed for {}", format_failures(.failures))]
    Rollback {
        group: String,
        failures: Vec<(String, Arc<TaskError>)>,
    },

    #[error("group {0} has already been executed")]
    AlreadyExecuted(String),
}

fn format_failures(failures: &[(String, Arc<TaskError>)]) -> String {
    failures
        .iter()
        .map(|(id, e)| format!("{id} ({e})"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Pending,
    Running,
    Completed,
    Failed,
    RolledBack,
}

/// A named batch of tasks which is executed exactly once, either one task at a time in
/// declaration order, or all at once.
pub struct TaskGroup {
    name: String,
    tasks: Vec<Arc<dyn Task>>,
    parallel: bool,
    max_retries: u32,
    retry_delay: Duration,
    continue_on_error: bool,
    max_parallelism: usize,
    state: GroupState,

    /// Results in the order the tasks finished.
    results: Vec<TaskResult>,
}

impl TaskGroup {
    fn new(name: &str, parallel: bool) -> Self {
        TaskGroup {
            name: name.to_string(),
            tasks: Vec::new(),
            parallel,
            max_retries: 0,
            retry_delay: Duration::ZERO,
            continue_on_error: false,
            max_parallelism: DEFAULT_MAX_PARALLELISM,
            state: GroupState::Pending,
            results: Vec::new(),
        }
    }

    pub fn sequential(name: &str) -> Self {
        Self::new(name, false)
    }

    pub fn parallel(name: &str) -> Self {
        Self::new(name, true)
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn with_max_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism.max(1);
        self
    }

    pub fn add_task(&mut self, task: Arc<dyn Task>) {
        self.tasks.push(task);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.description()).collect()
    }

    pub fn results(&self) -> &[TaskResult] {
        &self.results
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }

    /// Run every task in the group.
    ///
    /// In sequential mode the group stops at the first failed task unless `continue_on_error` is
    /// set. In parallel mode every task runs to completion regardless of its siblings, and the
    /// error reported is the first one observed.
    ///
    /// With `continue_on_error` set, failed tasks are recorded in the results but the group itself
    /// succeeds.
    pub async fn execute(&mut self, ctx: &TaskContext) -> Result<(), GroupError> {
        if self.state != GroupState::Pending {
            return Err(GroupError::AlreadyExecuted(self.name.clone()));
        }
        self.state = GroupState::Running;
        info!(
            "running group {} ({} tasks, {})",
            self.name,
            self.tasks.len(),
            if self.parallel { "parallel" } else { "sequential" }
        );

        let first_failure = if self.parallel {
            self.execute_parallel(ctx).await
        } else {
            self.execute_sequential(ctx).await
        };

        match first_failure {
            Some(result) if !self.continue_on_error => {
                self.state = GroupState::Failed;
                Err(GroupError::Task {
                    group: self.name.clone(),
                    task_id: result.task_id,
                    source: result.error.unwrap_or(Arc::new(TaskError::Panicked)),
                })
            }
            Some(result) => {
                warn!(
                    "group {}: continuing past failure of task {}",
                    self.name, result.task_id
                );
                self.state = GroupState::Completed;
                Ok(())
            }
            None => {
                self.state = GroupState::Completed;
                Ok(())
            }
        }
    }

    async fn execute_sequential(&mut self, ctx: &TaskContext) -> Option<TaskResult> {
        let mut first_failure = None;
        for task in self.tasks.iter() {
            let result = run_with_retry(
                Arc::clone(task),
                ctx.clone(),
                self.max_retries,
                self.retry_delay,
            )
            .await;
            self.results.push(result.clone());

            if !result.success && first_failure.is_none() {
                first_failure = Some(result);
                if !self.continue_on_error {
                    break;
                }
            }
        }
        first_failure
    }

    async fn execute_parallel(&mut self, ctx: &TaskContext) -> Option<TaskResult> {
        let semaphore = Arc::new(Semaphore::new(self.max_parallelism));
        let mut set = JoinSet::new();

        for task in self.tasks.iter() {
            let task = Arc::clone(task);
            let ctx = ctx.clone();
            let semaphore = Arc::clone(&semaphore);
            let (max_retries, retry_delay) = (self.max_retries, self.retry_delay);
            set.spawn(async move {
                // The semaphore is never closed.
                let _permit = semaphore.acquire_owned().await;
                run_with_retry(task, ctx, max_retries, retry_delay).await
            });
        }

        let mut first_failure = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => {
                    if !result.success && first_failure.is_none() {
                        first_failure = Some(result.clone());
                    }
                    self.results.push(result);
                }
                Err(e) => error!("group {}: task could not be joined: {e}", self.name),
            }
        }
        first_failure
    }

    /// Roll back the tasks that succeeded, most recently finished first. Rollback is best-effort:
    /// every successful task gets its rollback attempted even when an earlier one fails.
    ///
    /// The group cannot be executed again afterwards.
    pub async fn rollback(&mut self, ctx: &TaskContext) -> Result<(), GroupError> {
        let mut failures = Vec::new();

        for result in self.results.iter().rev().filter(|r| r.success) {
            let Some(task) = self.tasks.iter().find(|t| t.id() == result.task_id) else {
                continue;
            };
            info!("rolling back task {}", result.task_id);
            if let Err(e) = task.rollback(ctx).await {
                error!("rollback of task {} failed: {e}", result.task_id);
                failures.push((result.task_id.clone(), Arc::new(e)));
            }
        }

        self.state = GroupState::RolledBack;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(GroupError::Rollback {
                group: self.name.clone(),
                failures,
            })
        }
    }
}

/// Run a task up to `max_retries + 1` times with a fixed delay between attempts. Only the final
/// attempt's outcome is kept.
async fn run_with_retry(
    task: Arc<dyn Task>,
    ctx: TaskContext,
    max_retries: u32,
    retry_delay: Duration,
) -> TaskResult {
    let task_id = task.id();
    let started = Local::now();
    let clock = Instant::now();
    let mut attempts = 0;

    let outcome = loop {
        attempts += 1;
        debug!("task {task_id}: attempt {attempts}");

        let attempt = AssertUnwindSafe(task.execute(&ctx)).catch_unwind().await;
        match attempt {
            Ok(Ok(())) => break Ok(()),
            Ok(Err(e)) if e.is_retryable() && attempts <= max_retries => {
                warn!("task {task_id}: attempt {attempts} failed, retrying: {e}");
                if let Err(cancelled) = ctx.sleep(retry_delay).await {
                    break Err(cancelled);
                }
            }
            Ok(Err(e)) => break Err(e),
            Err(_) => break Err(TaskError::Panicked),
        }
    };

    match &outcome {
        Ok(()) => info!("task {task_id} succeeded"),
        Err(e) => error!("task {task_id} failed after {attempts} attempt(s): {e}"),
    }

    TaskResult {
        task_id,
        description: task.description(),
        success: outcome.is_ok(),
        error: outcome.err().map(Arc::new),
        attempts,
        started,
        finished: Local::now(),
        duration: clock.elapsed(),
    }
}
