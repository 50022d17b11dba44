//! The `ssh` provider, built on OpenSSH multiplexing.
//!
//! Every connection gets its own control master. OpenSSH's mux protocol cannot
//! forward signals to the remote command, so `signal` asks the master to exit,
//! which tears down the channel and leaves the remote shell with a hangup.

use std::borrow::Cow;
use std::path::PathBuf;
use std::process::Stdio as StdStdio;
use std::sync::Arc;

use async_trait::async_trait;
use openssh::{Child, KnownHosts, Session, SessionBuilder, Stdio};
use tokio::sync::Mutex;

use crate::error::{FanoutError, Result};
use crate::rcmd::{
    shell_status, BoxReader, BoxWriter, ConnectRequest, Connection, Rcmd, RcmdHandle,
};

#[derive(Debug, Clone)]
pub struct SshRcmd {
    known_hosts: KnownHosts,
}

impl SshRcmd {
    pub fn new() -> Self {
        Self {
            known_hosts: KnownHosts::Add,
        }
    }
}

impl Default for SshRcmd {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Rcmd for SshRcmd {
    fn name(&self) -> &str {
        "ssh"
    }

    async fn connect(&self, request: &ConnectRequest) -> Result<Connection> {
        let mut builder = SessionBuilder::default();
        builder.known_hosts_check(self.known_hosts.clone());
        if !request.remote_user.is_empty() {
            builder.user(request.remote_user.clone());
        }
        let session = Arc::new(builder.connect_mux(&request.host).await?);
        let control = session.control_socket().to_path_buf();
        tracing::debug!(host = %request.host, control = %control.display(), "ssh master up");

        let script = if request.want_stderr {
            Cow::Borrowed(request.command.as_str())
        } else {
            Cow::Owned(format!("exec 2>&1; {}", request.command))
        };
        let mut command = Arc::clone(&session).arc_command("sh");
        command
            .arg("-c")
            .raw_arg(single_quote(&script))
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
            });
        let mut child = command.spawn().await?;

        let stdio = child
            .stdout()
            .take()
            .map(|s| Box::new(s) as BoxReader)
            .ok_or_else(|| FanoutError::Connect("no stdout channel".to_string()))?;
        let stderr = child.stderr().take().map(|s| Box::new(s) as BoxReader);
        let stdin = child.stdin().take().map(|s| Box::new(s) as BoxWriter);

        Ok(Connection {
            stdio,
            stderr,
            stdin,
            handle: Arc::new(SshHandle {
                host: request.host.clone(),
                control,
                child: Mutex::new(Some(child)),
                session: Mutex::new(Some(session)),
            }),
        })
    }
}

struct SshHandle {
    host: String,
    control: PathBuf,
    child: Mutex<Option<Child<Arc<Session>>>>,
    session: Mutex<Option<Arc<Session>>>,
}

#[async_trait]
impl RcmdHandle for SshHandle {
    async fn signal(&self, signum: i32) -> Result<()> {
        tracing::debug!(host = %self.host, signum, "stopping ssh master");
        let status = tokio::process::Command::new("ssh")
            .arg("-S")
            .arg(&self.control)
            .args(["-O", "exit"])
            .arg(&self.host)
            .stdin(StdStdio::null())
            .stdout(StdStdio::null())
            .stderr(StdStdio::null())
            .status()
            .await?;
        if !status.success() {
            return Err(FanoutError::Connect(format!(
                "ssh -O exit returned {}",
                status
            )));
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<Option<i32>> {
        let code = match self.child.lock().await.take() {
            Some(child) => match child.wait().await {
                Ok(status) => shell_status(status),
                // Master already gone, e.g. after `signal`.
                Err(e) => {
                    tracing::debug!(host = %self.host, "ssh wait failed: {}", e);
                    None
                }
            },
            None => None,
        };
        if let Some(session) = self.session.lock().await.take() {
            match Arc::try_unwrap(session) {
                Ok(session) => {
                    if let Err(e) = session.close().await {
                        tracing::debug!(host = %self.host, "error while terminating: {}", e);
                    }
                }
                Err(_) => tracing::debug!(host = %self.host, "ssh session still shared"),
            }
        }
        Ok(code)
    }
}

/// Quotes `s` for a POSIX shell.
fn single_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
