//! Privileged execution with a password fallback.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info};

use crate::executor::{HostResult, RemoteExecutor};

/// Runs `script` (which must use non-interactive `sudo -n`) on every host in parallel,
/// then retries the hosts that failed one at a time with `fallback_script` under
/// password-based sudo.
///
/// The retry only happens when `password` is given and this is not a dry run. Never
/// prompts; the caller decides whether to ask again for the hosts still failing.
///
/// Returns the latest result per host and the hosts that still failed.
pub async fn run_with_sudo_fallback(
    executor: &dyn RemoteExecutor,
    hosts: &[String],
    script: &str,
    fallback_script: &str,
    password: Option<&str>,
    timeout: Option<Duration>,
    dry_run: bool,
) -> (BTreeMap<String, HostResult>, Vec<String>) {
    let mut result_map = BTreeMap::new();
    let mut needs_password = Vec::new();
    for result in executor
        .run_script_parallel(hosts, script, timeout, dry_run)
        .await
    {
        if !result.success {
            needs_password.push(result.host.clone());
        }
        result_map.insert(result.host.clone(), result);
    }

    if needs_password.is_empty() {
        return (result_map, Vec::new());
    }
    match password {
        Some(password) if !dry_run => {
            info!(
                "Retrying {} host(s) with password-based sudo",
                needs_password.len()
            );
            // Sequential: one interactive sudo session at a time.
            for host in &needs_password {
                let result = executor
                    .run_sudo_script(host, fallback_script, password, timeout, dry_run)
                    .await;
                debug!("[{}] sudo fallback success={}", host, result.success);
                result_map.insert(host.clone(), result);
            }
        }
        _ => debug!(
            "{} host(s) need a sudo password; none supplied",
            needs_password.len()
        ),
    }

    let still_failed = needs_password
        .into_iter()
        .filter(|host| result_map.get(host).map_or(true, |r| !r.success))
        .collect();
    (result_map, still_failed)
}
