//! sparkdist: Distribute container images and models to a cluster over SSH.

// Command line arguments and configuration.
pub mod config;
// How to parse and represent hosts.
pub mod host;
// Shell scripts run on hosts.
pub mod script;
// Remote and local command execution.
pub mod executor;
// HuggingFace cache layout.
pub mod cache;
// Distribution topologies.
pub mod distribute;
// Privileged execution with a password fallback.
pub mod sudo;
// Process liveness.
pub mod probe;
// Pending-operation ledger.
pub mod pending;
// Error handling.
pub mod error;

pub use config::{Config, Settings, Source};
pub use distribute::Distributor;
pub use error::DistError;
pub use executor::{HostResult, RemoteExecutor, SshExecutor, SshOptions};
pub use host::{get_hosts, Host, HostPlan};
pub use pending::{ActiveOp, PendingGuard, PendingInfo, PendingLedger};
pub use probe::{ProcessProbe, SystemProbe};
pub use script::Script;
pub use sudo::run_with_sudo_fallback;
