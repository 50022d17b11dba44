//! Connection providers.
//!
//! An `Rcmd` knows how to start a command on a host and hand back its output
//! streams. Which provider a host uses is decided by the `RcmdRegistry`: an
//! explicit per-host choice wins, then the first matching pattern rule, then the
//! registry default.

use std::collections::HashMap;
use std::net::IpAddr;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{FanoutError, Result};
use crate::host::Host;

pub mod exec;
pub mod ssh;

pub use exec::ExecRcmd;
pub use ssh::SshRcmd;

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Everything a provider needs to start one remote command.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub host: String,
    /// Resolved address, only filled in for providers that ask for it.
    pub address: Option<IpAddr>,
    pub local_user: String,
    pub remote_user: String,
    pub command: String,
    pub node_index: usize,
    /// Keep stderr on its own stream instead of merging it into stdio.
    pub want_stderr: bool,
    /// Open a writable stdin (used by file copies).
    pub want_stdin: bool,
}

/// A started remote command.
pub struct Connection {
    pub stdio: BoxReader,
    pub stderr: Option<BoxReader>,
    pub stdin: Option<BoxWriter>,
    pub handle: Arc<dyn RcmdHandle>,
}

/// Control over a started remote command.
#[async_trait]
pub trait RcmdHandle: Send + Sync {
    /// Delivers `signum` to the remote side, as well as the provider can.
    async fn signal(&self, signum: i32) -> Result<()>;

    /// Tears the connection down, returning the remote exit status if known.
    async fn destroy(&self) -> Result<Option<i32>>;
}

#[async_trait]
pub trait Rcmd: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the worker should resolve the hostname before connecting.
    fn resolves_address(&self) -> bool {
        false
    }

    async fn connect(&self, request: &ConnectRequest) -> Result<Connection>;
}

pub struct RcmdRegistry {
    providers: HashMap<String, Arc<dyn Rcmd>>,
    rules: Vec<(Regex, String)>,
    default: String,
}

impl RcmdRegistry {
    /// Creates a registry whose default is `default`.
    pub fn new(default: Arc<dyn Rcmd>) -> Self {
        let name = default.name().to_string();
        let mut providers = HashMap::new();
        providers.insert(name.clone(), default);
        Self {
            providers,
            rules: Vec::new(),
            default: name,
        }
    }

    /// The `ssh`, `exec` and `exec-addr` providers, with `ssh` as the default.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new(Arc::new(SshRcmd::new()));
        registry.register(Arc::new(ExecRcmd::new()));
        registry.register(Arc::new(ExecRcmd::resolving()));
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn Rcmd>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.providers.contains_key(name) {
            return Err(FanoutError::UnknownRcmd(name.to_string()));
        }
        self.default = name.to_string();
        Ok(())
    }

    /// Routes hosts matching the glob `pattern` to provider `name`.
    pub fn add_rule(&mut self, pattern: &str, name: &str) -> Result<()> {
        if !self.providers.contains_key(name) {
            return Err(FanoutError::UnknownRcmd(name.to_string()));
        }
        self.rules.push((glob_to_regex(pattern)?, name.to_string()));
        Ok(())
    }

    pub fn select(&self, host: &Host) -> Result<Arc<dyn Rcmd>> {
        let name = match &host.rcmd {
            Some(name) => name.as_str(),
            None => self
                .rules
                .iter()
                .find(|(pattern, _)| pattern.is_match(&host.hostname))
                .map(|(_, name)| name.as_str())
                .unwrap_or(&self.default),
        };
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| FanoutError::UnknownRcmd(name.to_string()))
    }
}

/// Maps an exit status the way a shell reports `$?`.
pub(crate) fn shell_status(status: ExitStatus) -> Option<i32> {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
}

/// Parses a `PATTERN=NAME` routing rule.
pub fn parse_rule(rule: &str) -> Result<(String, String)> {
    match rule.split_once('=') {
        Some((pattern, name)) if !pattern.is_empty() && !name.is_empty() => {
            Ok((pattern.to_string(), name.to_string()))
        }
        _ => Err(FanoutError::Config(format!(
            "rcmd rule must look like PATTERN=NAME, got \"{}\"",
            rule
        ))),
    }
}

/// Translates a shell-style glob (`*`, `?`) into an anchored regex.
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| FanoutError::Config(format!("bad pattern {}: {}", pattern, e)))
}
