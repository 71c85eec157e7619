// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Remote command execution.
//!
//! Every interaction with a cluster host goes through an [`Executor`]: a shell command is run on a
//! named host and its combined stdout/stderr is returned. Failures are split into timeouts,
//! connection/authentication failures, and commands that ran but exited non-zero. The last kind
//! carries the command output so that callers can inspect it for diagnostics.

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use {async_trait::async_trait, log::debug, tokio::process::Command};

mod local;
mod ssh;

pub use local::LocalExecutor;
pub use ssh::{SshExecutor, SshOptions};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(thiserror::Error, Debug)]
pub enum ExecError {
    #[error("command on {host} timed out after {after:?}")]
    Timeout { host: String, after: Duration },

    #[error("could not connect to {host}: {reason}")]
    Connection { host: String, reason: String },

    #[error("ssh authentication unavailable: {0}")]
    Auth(String),

    #[error("command `{command}` on {host} exited with status {code}: {output}")]
    NonZeroExit {
        host: String,
        command: String,
        code: i32,
        output: String,
    },

    #[error("command on {host} was cancelled")]
    Cancelled { host: String },

    #[error("could not run command for {host}: {source}")]
    Io { host: String, source: io::Error },
}

impl ExecError {
    /// The output of a command that ran to completion but failed.
    pub fn output(&self) -> Option<&str> {
        match self {
            ExecError::NonZeroExit { output, .. } => Some(output),
            _ => None,
        }
    }

    /// Whether the error came from the transport rather than the command itself.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ExecError::Timeout { .. } | ExecError::Connection { .. } | ExecError::Io { .. }
        )
    }
}

/// Runs shell commands on cluster hosts.
#[async_trait]
pub trait Executor: Send + Sync + std::fmt::Debug {
    /// Run `command` on `host`, giving up after `timeout`.
    async fn execute_timeout(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<String, ExecError>;

    /// Copy the local file at `local` to `remote` on `host`.
    async fn put_file(&self, host: &str, local: &Path, remote: &str) -> Result<(), ExecError>;

    async fn execute(&self, host: &str, command: &str) -> Result<String, ExecError> {
        self.execute_timeout(host, command, self.command_timeout())
            .await
    }

    /// Write `contents` to the file `remote` on `host`, creating its parent directory.
    async fn write_file(&self, host: &str, remote: &str, contents: &str) -> Result<(), ExecError> {
        let parent = Path::new(remote)
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or("/".to_string());
        let command = format!(
            "mkdir -p '{parent}' && cat > '{remote}' <<'{HEREDOC_END}'\n{contents}\n{HEREDOC_END}"
        );
        self.execute(host, &command).await.map(|_| ())
    }

    fn command_timeout(&self) -> Duration {
        DEFAULT_COMMAND_TIMEOUT
    }

    /// Release any resources (connections) held by the executor.
    async fn close(&self) {}
}

const HEREDOC_END: &str = "SEAFORGE_EOF";

/// Run a prepared process to completion, folding stdout and stderr together.
///
/// `host` is only used to label errors. A `connection_status`, when given, is the exit status
/// that the transport itself uses to report that it could not reach the host.
pub(crate) async fn run_command(
    mut cmd: Command,
    host: &str,
    description: &str,
    timeout: Duration,
    connection_status: Option<i32>,
) -> Result<String, ExecError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("running on {host}: {description}");

    let child = cmd.spawn().map_err(|source| ExecError::Io {
        host: host.to_string(),
        source,
    })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|source| ExecError::Io {
            host: host.to_string(),
            source,
        })?,
        Err(_) => {
            return Err(ExecError::Timeout {
                host: host.to_string(),
                after: timeout,
            })
        }
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    match output.status.code() {
        Some(0) => Ok(combined),
        Some(code) if Some(code) == connection_status => Err(ExecError::Connection {
            host: host.to_string(),
            reason: combined.trim().to_string(),
        }),
        code => Err(ExecError::NonZeroExit {
            host: host.to_string(),
            command: description.to_string(),
            // Killed by a signal.
            code: code.unwrap_or(-1),
            output: combined,
        }),
    }
}
