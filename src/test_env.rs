// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Test doubles for the orchestration engine: a scripted executor, a health probe driven from a
//! table, a task that records what was done to it, and a binary repository that needs no files.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::cluster::ComponentSpec;
use crate::component::{BinaryRepository, RepositoryError};
use crate::executor::{ExecError, Executor};
use crate::status::{HealthProbe, HealthReport};
use crate::task::{Task, TaskContext, TaskError};

/// What a [`MockExecutor`] answers to a command.
#[derive(Debug, Clone)]
pub enum Reply {
    Ok(String),
    /// Exit with the given status and output.
    Fail(i32, String),
    Timeout,
    Disconnect,
}

impl Reply {
    pub fn ok(output: &str) -> Self {
        Reply::Ok(output.to_string())
    }

    pub fn fail(code: i32) -> Self {
        Reply::Fail(code, String::new())
    }
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    host: Option<String>,
    /// Replies are handed out in order; the last one repeats.
    replies: Vec<Reply>,
    calls: usize,
}

impl Rule {
    fn matches(&self, host: &str, command: &str) -> bool {
        command.contains(&self.pattern) && self.host.as_deref().map_or(true, |h| h == host)
    }

    fn next_reply(&mut self) -> Reply {
        let i = self.calls.min(self.replies.len() - 1);
        self.calls += 1;
        self.replies[i].clone()
    }
}

/// An executor that answers commands from a script instead of running them.
///
/// A rule matches a command when the command contains the rule's pattern (and the host matches,
/// for host-specific rules). When several rules match, the one added last wins. A command that
/// no rule matches succeeds with empty output. Every command is recorded in a journal, along with
/// the contents of every file written through the executor.
#[derive(Debug, Default)]
pub struct MockExecutor {
    rules: Mutex<Vec<Rule>>,
    journal: Mutex<Vec<(String, String)>>,
    files: Mutex<Vec<(String, String, String)>>,
    closed: Mutex<bool>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_rule(&self, host: Option<&str>, pattern: &str, replies: Vec<Reply>) {
        assert!(!replies.is_empty(), "a rule needs at least one reply");
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.to_string(),
            host: host.map(|h| h.to_string()),
            replies,
            calls: 0,
        });
    }

    pub fn on(&self, pattern: &str, reply: Reply) -> &Self {
        self.add_rule(None, pattern, vec![reply]);
        self
    }

    pub fn on_host(&self, host: &str, pattern: &str, reply: Reply) -> &Self {
        self.add_rule(Some(host), pattern, vec![reply]);
        self
    }

    /// Answer successive matching commands with successive replies.
    pub fn on_sequence(&self, pattern: &str, replies: Vec<Reply>) -> &Self {
        self.add_rule(None, pattern, replies);
        self
    }

    /// Every command run so far, as (host, command).
    pub fn journal(&self) -> Vec<(String, String)> {
        self.journal.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.journal().into_iter().map(|(_, c)| c).collect()
    }

    pub fn commands_on(&self, host: &str) -> Vec<String> {
        self.journal()
            .into_iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c)
            .collect()
    }

    /// How many commands run so far contain `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(pattern)).count()
    }

    pub fn ran(&self, pattern: &str) -> bool {
        self.count(pattern) > 0
    }

    /// Files written with `write_file`, as (host, path, contents).
    pub fn written_files(&self) -> Vec<(String, String, String)> {
        self.files.lock().unwrap().clone()
    }

    pub fn file(&self, host: &str, path: &str) -> Option<String> {
        self.written_files()
            .into_iter()
            .rev()
            .find(|(h, p, _)| h == host && p == path)
            .map(|(_, _, contents)| contents)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }

    fn reply(&self, host: &str, command: &str) -> Reply {
        self.journal
            .lock()
            .unwrap()
            .push((host.to_string(), command.to_string()));
        let mut rules = self.rules.lock().unwrap();
        match rules.iter_mut().rev().find(|r| r.matches(host, command)) {
            Some(rule) => rule.next_reply(),
            None => Reply::Ok(String::new()),
        }
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn execute_timeout(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<String, ExecError> {
        match self.reply(host, command) {
            Reply::Ok(output) => Ok(output),
            Reply::Fail(code, output) => Err(ExecError::NonZeroExit {
                host: host.to_string(),
                command: command.to_string(),
                code,
                output,
            }),
            Reply::Timeout => Err(ExecError::Timeout {
                host: host.to_string(),
                after: timeout,
            }),
            Reply::Disconnect => Err(ExecError::Connection {
                host: host.to_string(),
                reason: "connection reset".to_string(),
            }),
        }
    }

    /// Recorded as the command `put_file <local> <remote>`.
    async fn put_file(&self, host: &str, local: &Path, remote: &str) -> Result<(), ExecError> {
        let command = format!("put_file {} {remote}", local.display());
        self.execute(host, &command).await.map(|_| ())
    }

    /// Recorded as the command `write_file <remote>`; the contents are kept for inspection.
    async fn write_file(&self, host: &str, remote: &str, contents: &str) -> Result<(), ExecError> {
        self.execute(host, &format!("write_file {remote}")).await?;
        self.files.lock().unwrap().push((
            host.to_string(),
            remote.to_string(),
            contents.to_string(),
        ));
        Ok(())
    }

    async fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }
}

/// A health probe answering from a table keyed by instance id. Instances not in the table get
/// the default answer, which starts out healthy.
#[derive(Debug)]
pub struct MockProbe {
    answers: Mutex<HashMap<String, bool>>,
    default: Mutex<bool>,
    checks: AtomicU32,
}

impl Default for MockProbe {
    fn default() -> Self {
        MockProbe {
            answers: Mutex::new(HashMap::new()),
            default: Mutex::new(true),
            checks: AtomicU32::new(0),
        }
    }
}

impl MockProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, id: &str, healthy: bool) {
        self.answers.lock().unwrap().insert(id.to_string(), healthy);
    }

    pub fn set_default(&self, healthy: bool) {
        *self.default.lock().unwrap() = healthy;
    }

    pub fn checks(&self) -> u32 {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for MockProbe {
    async fn check(&self, spec: &ComponentSpec) -> HealthReport {
        self.checks.fetch_add(1, Ordering::SeqCst);
        let id = spec.id();
        let healthy = self
            .answers
            .lock()
            .unwrap()
            .get(&id)
            .copied()
            .unwrap_or(*self.default.lock().unwrap());
        if healthy {
            HealthReport::healthy(&id)
        } else {
            HealthReport::unhealthy(&format!("{id} is down"))
        }
    }
}

pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

/// A task that appends `execute <id>` and `rollback <id>` to a shared journal, and fails when
/// told to.
pub struct RecordingTask {
    id: String,
    journal: Journal,
    /// The first `fail_attempts` attempts fail.
    fail_attempts: u32,
    retryable: bool,
    rollback_fails: bool,
    delay: Duration,
    attempts: AtomicU32,
}

impl RecordingTask {
    pub fn new(id: &str, journal: &Journal) -> Self {
        RecordingTask {
            id: id.to_string(),
            journal: Arc::clone(journal),
            fail_attempts: 0,
            retryable: true,
            rollback_fails: false,
            delay: Duration::ZERO,
            attempts: AtomicU32::new(0),
        }
    }

    /// Fail every attempt with a retryable error.
    pub fn failing(mut self) -> Self {
        self.fail_attempts = u32::MAX;
        self
    }

    /// Fail the first `attempts` attempts with a retryable error, then succeed.
    pub fn failing_first(mut self, attempts: u32) -> Self {
        self.fail_attempts = attempts;
        self
    }

    /// Fail with an error that is never retried.
    pub fn failing_precondition(mut self) -> Self {
        self.fail_attempts = u32::MAX;
        self.retryable = false;
        self
    }

    pub fn failing_rollback(mut self) -> Self {
        self.rollback_fails = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Task for RecordingTask {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn description(&self) -> String {
        format!("recording task {}", self.id)
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        self.journal
            .lock()
            .unwrap()
            .push(format!("execute {}", self.id));
        if !self.delay.is_zero() {
            ctx.sleep(self.delay).await?;
        }
        if attempt < self.fail_attempts {
            return Err(if self.retryable {
                TaskError::Transport(ExecError::Connection {
                    host: "mock".to_string(),
                    reason: format!("{} attempt {} failed", self.id, attempt + 1),
                })
            } else {
                TaskError::Precondition(format!("{} cannot run", self.id))
            });
        }
        Ok(())
    }

    async fn rollback(&self, _ctx: &TaskContext) -> Result<(), TaskError> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("rollback {}", self.id));
        if self.rollback_fails {
            return Err(TaskError::Verification(format!(
                "{} could not be undone",
                self.id
            )));
        }
        Ok(())
    }
}

/// A repository that claims every version is installed under `/repo`, except the ones marked
/// missing.
#[derive(Debug, Default)]
pub struct StaticRepository {
    missing: Mutex<HashSet<String>>,
}

impl StaticRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_version(self, version: &str) -> Self {
        self.missing.lock().unwrap().insert(version.to_string());
        self
    }
}

impl BinaryRepository for StaticRepository {
    fn binary_path(&self, component: &str, version: &str) -> Result<PathBuf, RepositoryError> {
        let path = PathBuf::from(format!("/repo/{component}/{version}/{component}"));
        if self.missing.lock().unwrap().contains(version) {
            return Err(RepositoryError::NotInstalled {
                component: component.to_string(),
                version: version.to_string(),
                path: path.display().to_string(),
            });
        }
        Ok(path)
    }
}
