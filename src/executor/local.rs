// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::path::Path;
use std::time::Duration;

use {async_trait::async_trait, tokio::process::Command};

use super::{run_command, ExecError, Executor, DEFAULT_COMMAND_TIMEOUT};

/// Runs commands through the local shell. The `host` argument is accepted but ignored, so that a
/// single-machine deployment (or a test) can use the same code paths as a remote one.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    shell: String,
    timeout: Duration,
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalExecutor {
    pub fn new() -> Self {
        LocalExecutor {
            shell: "/bin/sh".to_string(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn execute_timeout(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<String, ExecError> {
        let mut cmd = Command::new(&self.shell);
        cmd.args(["-c", command]);
        run_command(cmd, host, command, timeout, None).await
    }

    async fn put_file(&self, host: &str, local: &Path, remote: &str) -> Result<(), ExecError> {
        let io_err = |source| ExecError::Io {
            host: host.to_string(),
            source,
        };
        if let Some(parent) = Path::new(remote).parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::copy(local, remote).await.map_err(io_err)?;
        Ok(())
    }

    fn command_timeout(&self) -> Duration {
        self.timeout
    }
}
