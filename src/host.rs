//! Cluster hosts.
//!
//! Every machine has a management hostname (SSH control and error reporting) and
//! optionally a separate transfer hostname that bulk data is routed through, e.g. an
//! address on a high-bandwidth fabric. The hosts file lists them; `HostPlan` keeps the
//! two lists index-aligned for the distribution engine.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs::File;
use std::path::Path;

use handlebars::Handlebars;
use itertools::Itertools;
use serde::Deserialize;
use serde_yaml::Value;
use tracing::{debug, warn};

use crate::error::{DistError, Result};
use crate::executor::HostResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    /// SSH hostname used for control and reporting.
    pub hostname: String,
    /// Hostname used for the data path, if different.
    pub transfer: Option<String>,
}

impl Host {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            transfer: None,
        }
    }

    /// The endpoint bulk transfers to this host should target.
    pub fn transfer_host(&self) -> &str {
        self.transfer.as_deref().unwrap_or(&self.hostname)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.transfer {
            Some(transfer) if transfer != &self.hostname => {
                write!(f, "[{} via {}]", self.hostname, transfer)
            }
            _ => write!(f, "[{}]", self.hostname),
        }
    }
}

/// One entry of the hosts file: a bare hostname, or a mapping with `hostname`, an
/// optional `transfer` template, and extra parameters that are expanded as a cartesian
/// product and substituted into both templates.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HostSpec {
    Bare(String),
    Templated {
        hostname: Value,
        #[serde(default)]
        transfer: Option<String>,
        #[serde(flatten)]
        params: BTreeMap<String, Value>,
    },
}

/// Flattens a YAML scalar or a sequence of scalars into strings.
fn scalar_values(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::String(s) => Some(vec![s.clone()]),
        Value::Number(n) => Some(vec![n.to_string()]),
        Value::Bool(b) => Some(vec![b.to_string()]),
        Value::Sequence(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.extend(scalar_values(item)?);
            }
            Some(values)
        }
        _ => None,
    }
}

fn invalid(path: &Path, reason: impl Into<String>) -> DistError {
    DistError::InvalidHosts {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

pub fn get_hosts(hosts_file: &Path) -> Result<Vec<Host>> {
    let hosts_fd = File::open(hosts_file)?;
    let host_specs: Vec<HostSpec> =
        serde_yaml::from_reader(hosts_fd).map_err(|source| DistError::HostsFileError {
            path: hosts_file.to_path_buf(),
            source,
        })?;
    let hosts = expand_host_specs(host_specs, hosts_file)?;
    debug!("Hosts detected: {}", hosts.iter().join(" "));
    Ok(hosts)
}

fn expand_host_specs(host_specs: Vec<HostSpec>, path: &Path) -> Result<Vec<Host>> {
    let mut registry = Handlebars::new();
    registry.set_strict_mode(true);
    registry.register_escape_fn(handlebars::no_escape);

    let mut hosts = Vec::with_capacity(host_specs.len());
    for spec in host_specs {
        let (hostname, transfer, params) = match spec {
            HostSpec::Bare(hostname) => {
                hosts.push(Host::new(hostname));
                continue;
            }
            HostSpec::Templated {
                hostname,
                transfer,
                params,
            } => (hostname, transfer, params),
        };

        let hostnames = scalar_values(&hostname)
            .ok_or_else(|| invalid(path, "'hostname' must be a string or a list of strings"))?;

        // Each spec expands independently; every parameter multiplies the expansion by
        // the number of values it has.
        let mut expanded: Vec<BTreeMap<String, String>> = vec![BTreeMap::new()];
        for (key, values) in &params {
            let values = scalar_values(values).ok_or_else(|| {
                invalid(path, format!("parameter '{}' must be a scalar or a list", key))
            })?;
            let mut part_expanded = Vec::with_capacity(expanded.len() * values.len());
            for assignment in expanded {
                for value in &values {
                    let mut assignment = assignment.clone();
                    assignment.insert(key.clone(), value.clone());
                    part_expanded.push(assignment);
                }
            }
            expanded = part_expanded;
        }

        for hostname in &hostnames {
            for assignment in &expanded {
                let rendered = registry.render_template(hostname, assignment)?;
                let transfer = match &transfer {
                    Some(template) => Some(registry.render_template(template, assignment)?),
                    None => None,
                };
                hosts.push(Host {
                    hostname: rendered,
                    transfer,
                });
            }
        }
    }
    Ok(hosts)
}

/// Index-aligned management and transfer host lists.
///
/// `transfer()[i]` is where data for `hosts()[i]` is sent. Failures are always reported
/// against management hostnames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPlan {
    hosts: Vec<String>,
    transfer: Vec<String>,
}

impl HostPlan {
    /// Pairs `hosts` with `transfer`, which falls back to `hosts` when absent.
    pub fn new(hosts: Vec<String>, transfer: Option<Vec<String>>) -> Result<Self> {
        let transfer = match transfer {
            Some(transfer) if transfer.len() != hosts.len() => {
                return Err(DistError::TransferHostMismatch {
                    hosts: hosts.len(),
                    transfer: transfer.len(),
                });
            }
            Some(transfer) => transfer,
            None => hosts.clone(),
        };
        Ok(Self { hosts, transfer })
    }

    pub fn from_hosts(hosts: &[Host]) -> Self {
        Self {
            hosts: hosts.iter().map(|h| h.hostname.clone()).collect(),
            transfer: hosts.iter().map(|h| h.transfer_host().to_owned()).collect(),
        }
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn transfer(&self) -> &[String] {
        &self.transfer
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn head(&self) -> Option<&str> {
        self.hosts.first().map(String::as_str)
    }

    /// Transfer hostnames of every host but the head.
    pub fn worker_transfer(&self) -> &[String] {
        self.transfer.get(1..).unwrap_or(&[])
    }

    /// Management hostnames of the hosts whose transfer endpoint is in `failed`,
    /// restricted to positions `from..`. Order follows the plan.
    pub fn management_for<'a, I>(&self, failed: I, from: usize) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let failed: HashSet<&str> = failed.into_iter().collect();
        let mut seen = HashSet::new();
        let mut mapped = Vec::new();
        for (host, transfer) in self.hosts.iter().zip(&self.transfer).skip(from) {
            if failed.contains(transfer.as_str()) && seen.insert(host.as_str()) {
                mapped.push(host.clone());
            }
        }
        for name in &failed {
            if !self.transfer[from.min(self.transfer.len())..]
                .iter()
                .any(|t| t == name)
            {
                warn!("Failure reported for unknown transfer host {}", name);
            }
        }
        mapped
    }

    /// Maps unsuccessful executor results, keyed by transfer hostname, back to
    /// management hostnames.
    pub fn map_failures(&self, results: &[HostResult]) -> Vec<String> {
        self.management_for(
            results
                .iter()
                .filter(|r| !r.success)
                .map(|r| r.host.as_str()),
            0,
        )
    }
}
