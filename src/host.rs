//! Target hosts.
//!
//! One worker is created per `Host`. Hosts come from a comma separated list on the
//! command line and/or a YAML hosts file whose entries are either bare hostnames or
//! mappings with per-host overrides.

use std::fmt;
use std::fs::File;
use std::str::FromStr;

use itertools::Itertools;
use serde::Deserialize;
use void::Void;

use crate::error::{FanoutError, Result};
use crate::serde::string_or_mapping;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    /// Hostname to connect to.
    pub hostname: String,
    /// Remote user override for this host.
    pub user: Option<String>,
    /// Connection provider override for this host.
    pub rcmd: Option<String>,
}

impl Host {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            user: None,
            rcmd: None,
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.hostname)
    }
}

#[derive(Debug, Deserialize)]
struct HostSpec(#[serde(deserialize_with = "string_or_mapping")] HostSpecInner);

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HostSpecInner {
    hostname: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    rcmd: Option<String>,
}

impl FromStr for HostSpecInner {
    type Err = Void;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self {
            hostname: s.to_string(),
            user: None,
            rcmd: None,
        })
    }
}

impl From<HostSpecInner> for Host {
    fn from(spec: HostSpecInner) -> Self {
        Self {
            hostname: spec.hostname,
            user: spec.user,
            rcmd: spec.rcmd,
        }
    }
}

/// Reads a YAML hosts file.
pub fn get_hosts(hosts_file: &str) -> Result<Vec<Host>> {
    let file = File::open(hosts_file).map_err(|e| FanoutError::HostsFile {
        path: hosts_file.to_string(),
        reason: e.to_string(),
    })?;
    parse_hosts_yaml(file).map_err(|reason| FanoutError::HostsFile {
        path: hosts_file.to_string(),
        reason,
    })
}

fn parse_hosts_yaml<R: std::io::Read>(reader: R) -> std::result::Result<Vec<Host>, String> {
    let specs: Vec<HostSpec> = serde_yaml::from_reader(reader).map_err(|e| e.to_string())?;
    if let Some(HostSpec(spec)) = specs.iter().find(|HostSpec(spec)| spec.hostname.is_empty()) {
        return Err(format!("empty hostname in entry {:?}", spec));
    }
    Ok(specs.into_iter().map(|HostSpec(spec)| spec.into()).collect())
}

/// Splits `a,b,c` into hosts. Blank items are skipped.
pub fn parse_host_list(list: &str) -> Vec<Host> {
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(Host::new)
        .collect()
}

/// Removes repeated hostnames, keeping the first occurrence and the original order.
pub fn dedup_hosts(hosts: Vec<Host>) -> Vec<Host> {
    hosts
        .into_iter()
        .unique_by(|host| host.hostname.clone())
        .collect()
}
