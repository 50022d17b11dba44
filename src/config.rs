//! Configuration for fanout.
//!
//! `Config` holds the clap structs for command line arguments and flags.
//! `DispatchOptions` is what the engine itself consumes; it knows nothing about
//! the command line so it can be built directly by embedders and tests.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};

use crate::error::{FanoutError, Result};
use crate::host::{dedup_hosts, get_hosts, parse_host_list, Host};
use crate::rcmd::{parse_rule, RcmdRegistry};
use crate::worker::Payload;

#[derive(Parser, Debug)]
#[command(version, author, about)]
pub struct Config {
    #[command(subcommand)]
    pub mode: Mode,

    /// Comma separated target hosts
    #[arg(long = "hosts", short = 'w', value_name = "HOST,...")]
    pub hosts: Vec<String>,

    /// YAML file listing target hosts
    #[arg(long)]
    pub hosts_file: Option<String>,

    /// Maximum number of hosts worked on at the same time
    #[arg(long, short, default_value = "32")]
    pub fanout: usize,

    /// Seconds to wait for a connection. 0 waits forever.
    #[arg(long, short = 't', default_value = "10")]
    pub connect_timeout: u64,

    /// Seconds a remote command may run. 0 waits forever.
    #[arg(long, short = 'u', default_value = "0")]
    pub command_timeout: u64,

    /// Abort everything once a remote command dies from a signal
    #[arg(long, short)]
    pub kill_on_fail: bool,

    /// Don't prefix output lines with the hostname
    #[arg(long = "no-labels", short = 'N')]
    pub no_labels: bool,

    /// Exit with the largest remote return code
    #[arg(long, short = 'S')]
    pub remote_rc: bool,

    /// Send remote stderr through stdout
    #[arg(long)]
    pub merge_stderr: bool,

    /// Batch mode: a single interrupt aborts
    #[arg(long, short)]
    pub batch: bool,

    /// Print timing hints and a summary of failures
    #[arg(long, short)]
    pub debug: bool,

    /// Default connection method
    #[arg(long, short = 'R', default_value = "ssh")]
    pub rcmd: String,

    /// Use a connection method for hosts matching a glob, as PATTERN=NAME
    #[arg(long = "rcmd-for", value_name = "PATTERN=NAME")]
    pub rcmd_rules: Vec<String>,

    /// Remote user name
    #[arg(long, short = 'l')]
    pub user: Option<String>,

    /// Color host labels
    #[arg(long)]
    pub color: bool,

    /// Log more; repeat for more detail
    #[arg(short, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Mode {
    /// Run a command on every host
    Run {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Copy a local file to every host
    Copy { source: PathBuf, dest: String },
}

impl Config {
    /// The ordered, de-duplicated target list.
    pub fn targets(&self) -> Result<Vec<Host>> {
        let mut hosts = Vec::new();
        if let Some(path) = &self.hosts_file {
            hosts.extend(get_hosts(path)?);
        }
        for list in &self.hosts {
            hosts.extend(parse_host_list(list));
        }
        if hosts.is_empty() {
            return Err(FanoutError::Config(
                "no target hosts; use -w or --hosts-file".to_string(),
            ));
        }
        Ok(dedup_hosts(hosts))
    }

    pub fn registry(&self) -> Result<RcmdRegistry> {
        let mut registry = RcmdRegistry::with_builtin();
        registry.set_default(&self.rcmd)?;
        for rule in &self.rcmd_rules {
            let (pattern, name) = parse_rule(rule)?;
            registry.add_rule(&pattern, &name)?;
        }
        Ok(registry)
    }

    pub fn payload(&self) -> Payload {
        match &self.mode {
            Mode::Run { command } => Payload::Command(command.join(" ")),
            Mode::Copy { source, dest } => Payload::Copy {
                source: source.clone(),
                dest: dest.clone(),
            },
        }
    }

    pub fn options(&self) -> Result<DispatchOptions> {
        if self.fanout == 0 {
            return Err(FanoutError::Config("fanout must be at least 1".to_string()));
        }
        Ok(DispatchOptions {
            fanout: self.fanout,
            connect_timeout: seconds(self.connect_timeout),
            command_timeout: seconds(self.command_timeout),
            kill_on_fail: self.kill_on_fail,
            labels: !self.no_labels,
            color: self.color,
            separate_stderr: !self.merge_stderr,
            batch: self.batch,
            debug: self.debug,
            remote_rc: self.remote_rc,
            remote_user: self.user.clone(),
            ..DispatchOptions::default()
        })
    }
}

/// Zero means disabled.
fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub fanout: usize,
    pub connect_timeout: Option<Duration>,
    pub command_timeout: Option<Duration>,
    pub kill_on_fail: bool,
    pub labels: bool,
    pub color: bool,
    pub separate_stderr: bool,
    /// Strict batch mode: no diagnostic step on interrupt.
    pub batch: bool,
    pub debug: bool,
    /// Aggregate remote return codes instead of a success flag.
    pub remote_rc: bool,
    pub remote_user: Option<String>,
    /// How often the watchdog scans for overdue workers.
    pub watchdog_period: Duration,
    /// Install interrupt/suspend handling for the duration of a dispatch.
    ///
    /// tokio cannot uninstall a signal handler. Once a dispatch has run with this
    /// set, SIGINT and SIGTSTP stay caught for the rest of the process and are
    /// ignored between dispatches. Embedders that need the default actions back
    /// should leave this off and handle signals themselves.
    pub handle_signals: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            fanout: 32,
            connect_timeout: Some(Duration::from_secs(10)),
            command_timeout: None,
            kill_on_fail: false,
            labels: true,
            color: false,
            separate_stderr: true,
            batch: false,
            debug: false,
            remote_rc: false,
            remote_user: None,
            watchdog_period: Duration::from_secs(2),
            handle_signals: true,
        }
    }
}

/// The invoking user, for providers that pass it along.
pub fn local_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "nobody".to_string())
}
