// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! An executor that runs commands over OpenSSH.
//!
//! Each host gets one multiplexed control-master connection which is reused by every command
//! sent to it. Before a cached connection is reused its control socket is checked; if the master
//! has died the entry is evicted and a new connection is dialed transparently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use {
    async_trait::async_trait,
    log::{debug, info, warn},
    tokio::process::Command,
};

use crate::config::GlobalOptions;

use super::{run_command, ExecError, Executor, DEFAULT_COMMAND_TIMEOUT};

/// OpenSSH reports its own failures (as opposed to the remote command's) with status 255.
const SSH_TRANSPORT_STATUS: i32 = 255;

#[derive(Debug, Clone)]
pub struct SshOptions {
    pub user: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    /// Directory holding the control sockets of the live connections.
    pub control_dir: PathBuf,
}

impl Default for SshOptions {
    fn default() -> Self {
        SshOptions {
            user: "root".to_string(),
            port: 22,
            identity_file: None,
            connect_timeout: Duration::from_secs(10),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            control_dir: std::env::temp_dir(),
        }
    }
}

impl From<&GlobalOptions> for SshOptions {
    fn from(global: &GlobalOptions) -> Self {
        SshOptions {
            user: global.ssh_user.clone(),
            port: global.ssh_port,
            identity_file: global.identity_file.as_ref().map(PathBuf::from),
            command_timeout: Duration::from_secs(global.command_timeout_secs),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
enum AuthMethod {
    IdentityFile(PathBuf),
    Agent,
}

/// A live control-master connection to one host.
#[derive(Debug)]
struct SshConnection {
    destination: String,
    control_path: PathBuf,
}

/// The per-host slot in the connection pool. Holding the slot's lock serializes dialing and
/// liveness checks for that host only, so hosts never wait on each other.
type Slot = Arc<tokio::sync::Mutex<Option<Arc<SshConnection>>>>;

#[derive(Debug)]
pub struct SshExecutor {
    options: SshOptions,
    auth: AuthMethod,
    connections: Mutex<HashMap<String, Slot>>,
    dial_counter: AtomicU64,
}

impl SshExecutor {
    /// Create an executor, resolving how it will authenticate. An identity file is used when one
    /// is configured, otherwise a running ssh-agent is required.
    pub fn new(options: SshOptions) -> Result<Self, ExecError> {
        let auth = match &options.identity_file {
            Some(path) if path.exists() => AuthMethod::IdentityFile(path.clone()),
            Some(path) => {
                return Err(ExecError::Auth(format!(
                    "identity file '{}' does not exist",
                    path.display()
                )))
            }
            None => match std::env::var_os("SSH_AUTH_SOCK") {
                Some(_) => AuthMethod::Agent,
                None => {
                    return Err(ExecError::Auth(
                        "no identity file given and SSH_AUTH_SOCK is not set".to_string(),
                    ))
                }
            },
        };
        debug!("ssh executor using {auth:?}");

        Ok(SshExecutor {
            options,
            auth,
            connections: Mutex::new(HashMap::new()),
            dial_counter: AtomicU64::new(0),
        })
    }

    fn destination(&self, host: &str) -> String {
        format!("{}@{}", self.options.user, host)
    }

    fn slot(&self, host: &str) -> Slot {
        let mut connections = self.connections.lock().unwrap();
        Arc::clone(connections.entry(host.to_string()).or_default())
    }

    /// Get a live connection to `host`, dialing a new one if there is no cached connection or the
    /// cached one is dead.
    async fn connection(&self, host: &str) -> Result<Arc<SshConnection>, ExecError> {
        let slot = self.slot(host);
        let mut slot = slot.lock().await;

        if let Some(conn) = slot.as_ref() {
            if self.is_alive(conn).await {
                return Ok(Arc::clone(conn));
            }
            warn!("connection to {host} is dead, redialing");
            *slot = None;
        }

        let conn = Arc::new(self.dial(host).await?);
        *slot = Some(Arc::clone(&conn));
        Ok(conn)
    }

    async fn dial(&self, host: &str) -> Result<SshConnection, ExecError> {
        let n = self.dial_counter.fetch_add(1, Ordering::Relaxed);
        let control_path = self
            .options
            .control_dir
            .join(format!("seaforge-{}-{host}-{n}.sock", std::process::id()));
        let destination = self.destination(host);

        let mut cmd = Command::new("ssh");
        cmd.args(["-M", "-N", "-f"])
            .arg("-S")
            .arg(&control_path)
            .args(["-o", "ControlPersist=yes"])
            .args(["-o", "BatchMode=yes"])
            .args(["-o", "StrictHostKeyChecking=accept-new"])
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.options.connect_timeout.as_secs().max(1)
            ))
            .arg("-p")
            .arg(self.options.port.to_string());
        if let AuthMethod::IdentityFile(path) = &self.auth {
            cmd.arg("-i").arg(path).args(["-o", "IdentitiesOnly=yes"]);
        }
        cmd.arg(&destination);

        // The master forks into the background once authenticated, so this returns as soon as
        // the connection is up.
        let timeout = self.options.connect_timeout + Duration::from_secs(5);
        match run_command(cmd, host, "ssh connect", timeout, Some(SSH_TRANSPORT_STATUS)).await {
            Ok(_) => {
                info!("connected to {destination}");
                Ok(SshConnection {
                    destination,
                    control_path,
                })
            }
            Err(ExecError::Connection { reason, .. }) if reason.contains("Permission denied") => {
                Err(ExecError::Auth(format!("{destination}: {reason}")))
            }
            Err(e) => Err(e),
        }
    }

    async fn is_alive(&self, conn: &SshConnection) -> bool {
        let mut cmd = Command::new("ssh");
        cmd.arg("-S")
            .arg(&conn.control_path)
            .args(["-O", "check"])
            .arg(&conn.destination);
        run_command(
            cmd,
            &conn.destination,
            "ssh -O check",
            self.options.connect_timeout,
            None,
        )
        .await
        .is_ok()
    }

    async fn exit_connection(&self, conn: &SshConnection) {
        let mut cmd = Command::new("ssh");
        cmd.arg("-S")
            .arg(&conn.control_path)
            .args(["-O", "exit"])
            .arg(&conn.destination);
        if let Err(e) = run_command(
            cmd,
            &conn.destination,
            "ssh -O exit",
            self.options.connect_timeout,
            None,
        )
        .await
        {
            warn!("could not close connection to {}: {e}", conn.destination);
        }
    }

    /// Drop the cached connection to `host` so that the next command redials.
    async fn evict(&self, host: &str) {
        let slot = self.slot(host);
        *slot.lock().await = None;
    }
}

#[async_trait]
impl Executor for SshExecutor {
    async fn execute_timeout(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<String, ExecError> {
        let conn = self.connection(host).await?;

        let mut cmd = Command::new("ssh");
        cmd.arg("-S")
            .arg(&conn.control_path)
            .args(["-o", "BatchMode=yes"])
            .arg("-p")
            .arg(self.options.port.to_string())
            .arg(&conn.destination)
            .arg("--")
            .arg(command);

        let result = run_command(cmd, host, command, timeout, Some(SSH_TRANSPORT_STATUS)).await;
        if let Err(ExecError::Connection { .. }) = &result {
            self.evict(host).await;
        }
        result
    }

    async fn put_file(&self, host: &str, local: &Path, remote: &str) -> Result<(), ExecError> {
        let conn = self.connection(host).await?;

        let parent = Path::new(remote)
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or("/".to_string());
        self.execute(host, &format!("mkdir -p '{parent}'")).await?;

        let mut cmd = Command::new("scp");
        cmd.arg("-o")
            .arg(format!("ControlPath={}", conn.control_path.display()))
            .args(["-o", "BatchMode=yes"])
            .arg("-P")
            .arg(self.options.port.to_string())
            .arg(local)
            .arg(format!("{}:{remote}", conn.destination));

        let description = format!("scp {} {remote}", local.display());
        run_command(
            cmd,
            host,
            &description,
            self.options.command_timeout,
            None,
        )
        .await
        .map(|_| ())
    }

    fn command_timeout(&self) -> Duration {
        self.options.command_timeout
    }

    /// Close every live connection. The owner of the executor must call this when the
    /// orchestration run is done.
    async fn close(&self) {
        let slots: Vec<Slot> = self
            .connections
            .lock()
            .unwrap()
            .drain()
            .map(|(_, slot)| slot)
            .collect();

        for slot in slots {
            if let Some(conn) = slot.lock().await.take() {
                self.exit_connection(&conn).await;
            }
        }
    }
}
