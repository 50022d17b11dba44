//! The `exec` provider: runs the command locally through `sh -c`.
//!
//! `%h`, `%u` and `%n` in the command text expand to the hostname, remote user
//! and node index, so `ssh %h uptime` or `docker exec %h uptime` fan out over any
//! transport with a command line client. `%a` expands to the resolved address;
//! only the `exec-addr` flavor resolves, the plain one substitutes the hostname.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::error::{FanoutError, Result};
use crate::rcmd::{
    shell_status, BoxReader, BoxWriter, ConnectRequest, Connection, Rcmd, RcmdHandle,
};

#[derive(Debug, Clone)]
pub struct ExecRcmd {
    name: &'static str,
    shell: String,
    resolve: bool,
}

impl ExecRcmd {
    pub fn new() -> Self {
        Self {
            name: "exec",
            shell: "sh".to_string(),
            resolve: false,
        }
    }

    /// Resolves each hostname before running, for commands that need `%a`.
    pub fn resolving() -> Self {
        Self {
            name: "exec-addr",
            resolve: true,
            ..Self::new()
        }
    }
}

impl Default for ExecRcmd {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Rcmd for ExecRcmd {
    fn name(&self) -> &str {
        self.name
    }

    fn resolves_address(&self) -> bool {
        self.resolve
    }

    async fn connect(&self, request: &ConnectRequest) -> Result<Connection> {
        let mut script = substitute(&request.command, request);
        if !request.want_stderr {
            script = format!("exec 2>&1; {}", script);
        }

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&script)
            .stdout(Stdio::piped())
            .stderr(if request.want_stderr {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdin(if request.want_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| FanoutError::Connect(format!("{}: {}", self.shell, e)))?;
        tracing::debug!(host = %request.host, pid = ?child.id(), "exec started");

        let stdio = child
            .stdout
            .take()
            .map(|s| Box::new(s) as BoxReader)
            .ok_or_else(|| FanoutError::Connect("no stdout pipe".to_string()))?;
        let stderr = child.stderr.take().map(|s| Box::new(s) as BoxReader);
        let stdin = child.stdin.take().map(|s| Box::new(s) as BoxWriter);
        let handle = ExecHandle {
            pid: child.id(),
            exited: AtomicBool::new(false),
            child: Mutex::new(child),
        };

        Ok(Connection {
            stdio,
            stderr,
            stdin,
            handle: Arc::new(handle),
        })
    }
}

struct ExecHandle {
    pid: Option<u32>,
    exited: AtomicBool,
    child: Mutex<Child>,
}

#[async_trait]
impl RcmdHandle for ExecHandle {
    async fn signal(&self, signum: i32) -> Result<()> {
        // Once reaped the pid may belong to someone else.
        if self.exited.load(Ordering::Acquire) {
            return Ok(());
        }
        let Some(pid) = self.pid else {
            return Ok(());
        };
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid as libc::pid_t, signum) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<Option<i32>> {
        let status = self.child.lock().await.wait().await?;
        self.exited.store(true, Ordering::Release);
        Ok(shell_status(status))
    }
}

/// Expands `%h`, `%u`, `%n`, `%a` and `%%` in a command template.
fn substitute(template: &str, request: &ConnectRequest) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('h') => out.push_str(&request.host),
            Some('u') => out.push_str(&request.remote_user),
            Some('n') => out.push_str(&request.node_index.to_string()),
            Some('a') => match request.address {
                Some(address) => out.push_str(&address.to_string()),
                None => out.push_str(&request.host),
            },
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}
