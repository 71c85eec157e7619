// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use {
    log::{error, info, warn},
    serde::{Deserialize, Serialize},
};

use super::{GroupError, TaskContext, TaskGroup, TaskResult};

/// Which tasks are rolled back when a phase fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RollbackScope {
    /// Only the failing phase is rolled back; earlier phases stay in place.
    #[default]
    Phase,

    /// The failing phase and then every completed phase before it, latest first.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Pending,
    RunningPhase(usize),
    RollingBack(usize),
    Completed,
    Failed,
}

#[derive(thiserror::Error, Debug)]
pub enum OrchestratorError {
    #[error("phase {phase} failed: {source}")]
    Phase {
        phase: String,
        #[source]
        source: GroupError,
    },

    #[error("phase {phase} failed: {source}; rollback also failed: {}", join_errors(.rollback))]
    RollbackFailed {
        phase: String,
        #[source]
        source: GroupError,
        rollback: Vec<GroupError>,
    },
}

impl OrchestratorError {
    /// The error that made the phase fail, regardless of how rollback went.
    pub fn cause(&self) -> &GroupError {
        match self {
            OrchestratorError::Phase { source, .. } => source,
            OrchestratorError::RollbackFailed { source, .. } => source,
        }
    }

    pub fn phase(&self) -> &str {
        match self {
            OrchestratorError::Phase { phase, .. } => phase,
            OrchestratorError::RollbackFailed { phase, .. } => phase,
        }
    }
}

fn join_errors(errors: &[GroupError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// An ordered list of task groups, each one a phase that only starts once the previous phase
/// has completed.
pub struct TaskOrchestrator {
    groups: Vec<TaskGroup>,
    scope: RollbackScope,
    state: OrchestratorState,
}

impl Default for TaskOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskOrchestrator {
    pub fn new() -> Self {
        TaskOrchestrator {
            groups: Vec::new(),
            scope: RollbackScope::Phase,
            state: OrchestratorState::Pending,
        }
    }

    pub fn with_rollback_scope(mut self, scope: RollbackScope) -> Self {
        self.scope = scope;
        self
    }

    /// Append a phase. Empty groups are dropped, since an absent role has nothing to do.
    pub fn add_group(&mut self, group: TaskGroup) {
        if group.is_empty() {
            return;
        }
        self.groups.push(group);
    }

    pub fn groups(&self) -> &[TaskGroup] {
        &self.groups
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Every recorded task result, phase by phase.
    pub fn results(&self) -> impl Iterator<Item = &TaskResult> {
        self.groups.iter().flat_map(|g| g.results().iter())
    }

    /// Run the phases in order. The first phase that fails is rolled back (along with the earlier
    /// phases when the scope is `All`) and its error is returned; a failed rollback is reported
    /// alongside it rather than in place of it.
    pub async fn execute(&mut self, ctx: &TaskContext) -> Result<(), OrchestratorError> {
        for i in 0..self.groups.len() {
            self.state = OrchestratorState::RunningPhase(i);
            info!("starting phase {}: {}", i + 1, self.groups[i].name());

            if let Err(source) = self.groups[i].execute(ctx).await {
                let phase = self.groups[i].name().to_string();
                error!("phase {phase} failed: {source}");

                self.state = OrchestratorState::RollingBack(i);
                let rollback = self.rollback_from(i, ctx).await;
                self.state = OrchestratorState::Failed;

                return Err(if rollback.is_empty() {
                    OrchestratorError::Phase { phase, source }
                } else {
                    OrchestratorError::RollbackFailed {
                        phase,
                        source,
                        rollback,
                    }
                });
            }
        }

        self.state = OrchestratorState::Completed;
        Ok(())
    }

    async fn rollback_from(&mut self, failed: usize, ctx: &TaskContext) -> Vec<GroupError> {
        let first = match self.scope {
            RollbackScope::Phase => failed,
            RollbackScope::All => 0,
        };

        let mut errors = Vec::new();
        for group in self.groups[first..=failed].iter_mut().rev() {
            warn!("rolling back phase {}", group.name());
            if let Err(e) = group.rollback(ctx).await {
                errors.push(e);
            }
        }
        errors
    }
}
