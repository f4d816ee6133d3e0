//! Fleet hosts.
//!
//! A `Host` is one enrolled test machine: identity, lock state, health
//! status, and label membership. Hosts are parsed from a YAML hosts file and
//! enrolled into the datastore at startup.

use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::str::FromStr;

use colored::*;
use colourado::Color;
use itertools::sorted;
use serde::Deserialize;
use void::Void;

use crate::serde::string_or_mapping;
use crate::store::{HostId, LabelId};

/// Health status of a host.
///
/// Only `Ready` hosts may receive new work. Every other status reflects the
/// most recently started verify/repair/cleanup/provision task or a running
/// job, and `RepairFailed` marks a host that maintenance could not bring
/// back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    Ready,
    Pending,
    Verifying,
    Running,
    Cleaning,
    Repairing,
    Provisioning,
    RepairFailed,
}

impl HostStatus {
    /// Whether a host in this status may be handed new work.
    pub fn is_usable(self) -> bool {
        matches!(self, HostStatus::Ready)
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            HostStatus::Ready => "Ready",
            HostStatus::Pending => "Pending",
            HostStatus::Verifying => "Verifying",
            HostStatus::Running => "Running",
            HostStatus::Cleaning => "Cleaning",
            HostStatus::Repairing => "Repairing",
            HostStatus::Provisioning => "Provisioning",
            HostStatus::RepairFailed => "Repair Failed",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone)]
pub struct Host {
    pub id: HostId,
    /// SSH hostname to connect to.
    pub hostname: String,
    pub status: HostStatus,
    pub locked: bool,
    pub lock_holder: Option<String>,
    /// Decommissioned hosts stay in the registry but are never scheduled.
    pub invalid: bool,
    /// Labels this host is a member of.
    pub labels: HashSet<LabelId>,
}

impl Host {
    pub fn new(id: HostId, hostname: String) -> Self {
        Self {
            id,
            hostname,
            status: HostStatus::Ready,
            locked: false,
            lock_holder: None,
            invalid: false,
            labels: HashSet::new(),
        }
    }

    /// For pretty-printing the host name.
    /// Surrounds with brackets and colors it with a random color.
    pub fn prettify(&self, color: Color) -> ColoredString {
        let r = (color.red * 256.0) as u8;
        let g = (color.green * 256.0) as u8;
        let b = (color.blue * 256.0) as u8;
        format!("{}", self).truecolor(r, g, b)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}]", self.hostname)
    }
}

/// One entry of the hosts file, either a bare hostname string or a mapping
/// with `hostname`, `labels`, and `locked` keys.
#[derive(Debug, Deserialize)]
struct HostSpec(#[serde(deserialize_with = "string_or_mapping")] HostDef);

/// An unenrolled host as declared in the hosts file.
#[derive(Debug, Clone, Deserialize)]
pub struct HostDef {
    pub hostname: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub locked: bool,
}

impl FromStr for HostDef {
    type Err = Void;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            hostname: s.to_string(),
            labels: vec![],
            locked: false,
        })
    }
}

impl fmt::Display for HostDef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.labels.is_empty() {
            write!(f, "[{}]", self.hostname)
        } else {
            write!(
                f,
                "[{} ({})]",
                self.hostname,
                sorted(self.labels.iter()).cloned().collect::<Vec<_>>().join(",")
            )
        }
    }
}

pub fn get_hosts(hosts_file: &str) -> Vec<HostDef> {
    // Read and parse the host file to a vector of HostSpec objects.
    let hosts_fd =
        File::open(hosts_file).unwrap_or_else(|_| panic!("Failed to open {}", hosts_file));
    let host_specs: Vec<HostSpec> = serde_yaml::from_reader(hosts_fd)
        .unwrap_or_else(|_| panic!("Failed to parse {}", hosts_file));

    let hosts: Vec<HostDef> = host_specs.into_iter().map(|HostSpec(def)| def).collect();
    eprintln!("[Corral] Hosts detected:\n{:#?}", &hosts);
    hosts
}
