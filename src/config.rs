//! Configuration for sparkdist.
//!
//! Holds the clap structs for command line arguments and `Settings`, the resolved
//! configuration threaded through the library. `Settings::resolve` is the only place
//! that consults the environment.

use std::collections::hash_map::DefaultHasher;
use std::ffi::OsString;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use crate::error::{DistError, Result};
use crate::executor::SshOptions;
use crate::host::{get_hosts, HostPlan};

#[derive(Parser)]
#[command(version, author, about)]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,

    /// Host file to use. Ignored when --hosts is given
    #[arg(long, global = true, default_value = "hosts.yaml")]
    pub hosts_file: PathBuf,

    /// Comma-separated management hostnames
    #[arg(long, short = 'H', global = true, value_delimiter = ',')]
    pub hosts: Vec<String>,

    /// Comma-separated transfer hostnames, one per host, for the data path
    #[arg(long, global = true, value_delimiter = ',')]
    pub transfer: Vec<String>,

    /// HuggingFace cache root (defaults to $HF_HOME or ~/.cache/huggingface)
    #[arg(long, global = true, env = "SPARKDIST_HF_CACHE")]
    pub hf_cache: Option<PathBuf>,

    /// sparkdist cache root for pending-op records and image archives
    #[arg(long, global = true, env = "SPARKDIST_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// SSH user
    #[arg(long, global = true)]
    pub ssh_user: Option<String>,

    /// SSH private key
    #[arg(long, global = true)]
    pub ssh_key: Option<PathBuf>,

    /// SSH port
    #[arg(long, global = true)]
    pub ssh_port: Option<u16>,

    /// Extra ssh option (`-o KEY=VALUE`), may be repeated
    #[arg(long = "ssh-option", short = 'o', global = true)]
    pub ssh_options: Vec<String>,

    /// SSH connect timeout in seconds
    #[arg(long, global = true, default_value = "10")]
    pub connect_timeout: u64,

    /// Per-host timeout in seconds for remote operations. 0 disables it
    #[arg(long, global = true, default_value = "0")]
    pub timeout: u64,

    /// Show what would be done without touching any host
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Debug logging
    #[arg(long, short, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Make every host pull a container image it does not have
    SyncImage {
        image: String,
        #[command(flatten)]
        tracking: Tracking,
    },
    /// Make every host download a model into its own cache
    SyncModel {
        model: String,
        /// Branch, tag or commit
        #[arg(long)]
        revision: Option<String>,
        #[command(flatten)]
        tracking: Tracking,
    },
    /// Download a model once and push it to every host
    DistributeModel {
        model: String,
        /// Branch, tag or commit
        #[arg(long)]
        revision: Option<String>,
        /// Where the single download happens
        #[arg(long, value_enum, default_value = "local")]
        from: Source,
        #[command(flatten)]
        tracking: Tracking,
    },
    /// Pull an image once and push it to every host
    DistributeImage {
        image: String,
        /// Where the single pull happens
        #[arg(long, value_enum, default_value = "local")]
        from: Source,
        #[command(flatten)]
        tracking: Tracking,
    },
    /// Take ownership of the HuggingFace cache on every host, with a sudo fallback
    FixPermissions {
        /// Read a sudo password from the first line of stdin for hosts that need one
        #[arg(long)]
        password_stdin: bool,
    },
    /// List distribution operations in progress
    Pending {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

/// Display metadata for the pending-operation record of a command.
#[derive(clap::Args, Clone, Default)]
pub struct Tracking {
    /// Cluster id to record the operation under (derived from the hosts by default)
    #[arg(long)]
    pub cluster_id: Option<String>,
    /// Recipe name to show in status output
    #[arg(long)]
    pub recipe: Option<String>,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug, ValueEnum)]
pub enum Source {
    /// This machine
    Local,
    /// The first host
    Head,
}

/// Resolved configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub hf_cache: PathBuf,
    pub cache_dir: PathBuf,
    pub ssh: SshOptions,
    pub timeout: Option<Duration>,
    pub dry_run: bool,
}

impl Settings {
    pub fn resolve(config: &Config) -> Result<Self> {
        Self::resolve_with(config, dirs::home_dir(), std::env::var_os("HF_HOME"))
    }

    /// Flags (and their env vars) win, then `HF_HOME`, then defaults under `home`.
    pub fn resolve_with(
        config: &Config,
        home: Option<PathBuf>,
        hf_home: Option<OsString>,
    ) -> Result<Self> {
        let hf_cache = match (&config.hf_cache, hf_home, &home) {
            (Some(path), _, _) => path.clone(),
            (None, Some(hf_home), _) if !hf_home.is_empty() => PathBuf::from(hf_home),
            (None, _, Some(home)) => home.join(".cache").join("huggingface"),
            (None, _, None) => return Err(DistError::NoHomeDir),
        };
        let cache_dir = match (&config.cache_dir, &home) {
            (Some(path), _) => path.clone(),
            (None, Some(home)) => home.join(".cache").join("sparkdist"),
            (None, None) => return Err(DistError::NoHomeDir),
        };
        let ssh = SshOptions {
            user: config.ssh_user.clone(),
            key: config.ssh_key.clone(),
            port: config.ssh_port,
            connect_timeout: (config.connect_timeout > 0)
                .then(|| Duration::from_secs(config.connect_timeout)),
            extra: config.ssh_options.clone(),
        };
        Ok(Self {
            hf_cache,
            cache_dir,
            ssh,
            timeout: (config.timeout > 0).then(|| Duration::from_secs(config.timeout)),
            dry_run: config.dry_run,
        })
    }
}

/// Hosts from `--hosts`, or from the hosts file. `--transfer` overrides whatever
/// transfer hostnames the file declares.
pub fn resolve_plan(config: &Config) -> Result<HostPlan> {
    let transfer = (!config.transfer.is_empty()).then(|| config.transfer.clone());
    if !config.hosts.is_empty() {
        return HostPlan::new(config.hosts.clone(), transfer);
    }
    let hosts = get_hosts(&config.hosts_file)?;
    match transfer {
        Some(transfer) => HostPlan::new(hosts.into_iter().map(|h| h.hostname).collect(), Some(transfer)),
        None => Ok(HostPlan::from_hosts(&hosts)),
    }
}

/// Stable cluster id for a host list, used when none is given.
pub fn default_cluster_id(hosts: &[String]) -> String {
    let mut sorted: Vec<&String> = hosts.iter().collect();
    sorted.sort();
    let mut hasher = DefaultHasher::new();
    sorted.hash(&mut hasher);
    format!("sparkdist_{:08x}", hasher.finish() as u32)
}
