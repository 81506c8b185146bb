//! Getting images and models onto every host of a cluster.
//!
//! Three topologies are supported:
//!
//! - **Independent pull** (`sync_*_to_hosts`): every host checks its own cache and
//!   fetches what is missing.
//! - **From local** (`distribute_*_from_local`): fetch once on this machine, then push
//!   to every host with rsync. Hosts that already have the data finish almost at once.
//! - **From head** (`distribute_*_from_head`): fetch once on `hosts[0]`, then have the
//!   head push to the remaining hosts so data never passes through this machine.
//!
//! Every operation returns the management hostnames that failed; an empty list means
//! full success. If the artifact cannot be acquired at the source, nothing is pushed and
//! every requested host is reported as failed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use tracing::{debug, error, info, warn};

use crate::cache::{cache_path, image_archive_path, is_cached};
use crate::executor::{HostResult, RemoteExecutor};
use crate::host::HostPlan;
use crate::script::Script;

/// Bound on the best-effort ownership fix before rsync.
pub const PERMISSION_FIX_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Distributor {
    executor: Arc<dyn RemoteExecutor>,
    /// HuggingFace cache root, the same path on every host.
    hf_cache: PathBuf,
    /// Tool cache root; image archives are staged under it.
    cache_dir: PathBuf,
    /// Per-host bound on remote operations.
    timeout: Option<Duration>,
    dry_run: bool,
}

impl Distributor {
    pub fn new(executor: Arc<dyn RemoteExecutor>, hf_cache: PathBuf, cache_dir: PathBuf) -> Self {
        Self {
            executor,
            hf_cache,
            cache_dir,
            timeout: None,
            dry_run: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Renders `script`, logging instead of failing so callers can treat a broken
    /// template like any other acquisition failure.
    fn render(&self, script: &Script) -> Option<String> {
        match script.render() {
            Ok(text) => Some(text),
            Err(e) => {
                error!("Failed to render {}: {}", script.name(), e);
                None
            }
        }
    }

    /// Runs `script` on one host through the fan-out path, so dry runs apply.
    async fn run_on(&self, host: &str, script: &str) -> HostResult {
        let mut results = self
            .executor
            .run_script_parallel(&[host.to_owned()], script, self.timeout, self.dry_run)
            .await;
        results
            .pop()
            .unwrap_or_else(|| HostResult::failed(host, "executor returned no result", None))
    }

    /// Runs `script` on every host independently and returns the failed hosts.
    async fn sync_resource_to_hosts(
        &self,
        script: &Script,
        hosts: &[String],
        label: &str,
    ) -> Vec<String> {
        if hosts.is_empty() {
            return Vec::new();
        }
        let Some(text) = self.render(script) else {
            return hosts.to_vec();
        };
        info!("Syncing {} to {} host(s)", label, hosts.len());
        let results = self
            .executor
            .run_script_parallel(hosts, &text, self.timeout, self.dry_run)
            .await;
        let failed: Vec<String> = results
            .iter()
            .filter(|r| !r.success)
            .inspect(|r| debug!("[{}] {} sync failed: {}", r.host, label, r.output.trim()))
            .map(|r| r.host.clone())
            .collect();
        if failed.is_empty() {
            info!("{} available on all {} host(s)", label, hosts.len());
        } else {
            warn!("{} sync failed on hosts: {}", label, failed.join(", "));
        }
        failed
    }

    /// Ensures `image` is present on every host, pulling where missing.
    pub async fn sync_image_to_hosts(&self, image: &str, hosts: &[String]) -> Vec<String> {
        let script = Script::PullImage {
            image: image.to_owned(),
        };
        self.sync_resource_to_hosts(&script, hosts, &format!("Image '{}'", image))
            .await
    }

    /// Has every host fetch `model_id` into its own cache.
    pub async fn sync_model_to_hosts(
        &self,
        model_id: &str,
        revision: Option<&str>,
        hosts: &[String],
    ) -> Vec<String> {
        let script = Script::fetch_model(model_id, &self.hf_cache, revision);
        self.sync_resource_to_hosts(&script, hosts, &format!("Model '{}'", model_id))
            .await
    }

    /// Best effort: containers leave root-owned files in the cache, which block rsync as
    /// a regular user. Tries a passwordless chown and only warns on failure.
    async fn fix_remote_permissions(&self, hosts: &[String]) {
        if hosts.is_empty() {
            return;
        }
        let script = Script::FixOwnership {
            cache_dir: self.hf_cache.clone(),
        };
        let Some(text) = self.render(&script) else {
            return;
        };
        let results = self
            .executor
            .run_script_parallel(hosts, &text, Some(PERMISSION_FIX_TIMEOUT), self.dry_run)
            .await;
        let failed = results.iter().filter(|r| !r.success).count();
        if failed > 0 {
            warn!(
                "Could not fix cache ownership on {} host(s); rsync may fail if a container \
                 left root-owned files. Run `sparkdist fix-permissions` to set up passwordless \
                 chown.",
                failed
            );
        }
    }

    /// Acquires an artifact on this machine with `script`. Returns false on failure.
    async fn acquire_locally(&self, script: &Script, label: &str) -> bool {
        let Some(text) = self.render(script) else {
            return false;
        };
        // Local downloads are not bounded by the per-host timeout.
        let result = self
            .executor
            .run_local_script(&text, None, self.dry_run)
            .await;
        if !result.success {
            error!(
                "Failed to acquire {} locally; aborting distribution: {}",
                label,
                result.output.trim()
            );
        }
        result.success
    }

    /// Downloads `model_id` into the local cache, then rsyncs its cache directory to
    /// every host.
    pub async fn distribute_model_from_local(
        &self,
        model_id: &str,
        revision: Option<&str>,
        plan: &HostPlan,
    ) -> Vec<String> {
        let label = format!("Model '{}'", model_id);
        info!("Distributing {} from local to {} host(s)", label, plan.len());

        if is_cached(model_id, &self.hf_cache, revision) {
            debug!("{} is cached locally; re-validating", label);
        }
        // The fetch runs even when cached so partial downloads get completed.
        let fetch = Script::fetch_model(model_id, &self.hf_cache, revision);
        if !self.acquire_locally(&fetch, &label).await {
            return plan.hosts().to_vec();
        }
        if plan.is_empty() {
            return Vec::new();
        }

        self.fix_remote_permissions(plan.hosts()).await;

        let model_path = cache_path(model_id, &self.hf_cache);
        let results = self
            .executor
            .run_rsync_parallel(
                &model_path,
                plan.transfer(),
                &model_path,
                self.timeout,
                self.dry_run,
            )
            .await;
        let failed = plan.map_failures(&results);
        if failed.is_empty() {
            info!("{} distributed to all {} host(s)", label, plan.len());
        } else {
            warn!("{} distribution failed on hosts: {}", label, failed.join(", "));
        }
        failed
    }

    /// Pulls and saves `image` locally, rsyncs the archive to every host and loads it
    /// there.
    pub async fn distribute_image_from_local(&self, image: &str, plan: &HostPlan) -> Vec<String> {
        let label = format!("Image '{}'", image);
        info!("Distributing {} from local to {} host(s)", label, plan.len());

        let archive = image_archive_path(image, &self.cache_dir);
        let save = Script::SaveImage {
            image: image.to_owned(),
            archive: archive.clone(),
        };
        if !self.acquire_locally(&save, &label).await {
            return plan.hosts().to_vec();
        }
        if plan.is_empty() {
            return Vec::new();
        }

        let load = Script::LoadImage {
            image: image.to_owned(),
            archive: archive.clone(),
        };
        let Some(load) = self.render(&load) else {
            return plan.hosts().to_vec();
        };

        let results = self
            .executor
            .run_rsync_parallel(&archive, plan.transfer(), &archive, self.timeout, self.dry_run)
            .await;
        let transfer_failed = plan.map_failures(&results);

        let loadable: Vec<String> = plan
            .hosts()
            .iter()
            .filter(|host| !transfer_failed.contains(host))
            .cloned()
            .collect();
        let load_failed: Vec<String> = self
            .executor
            .run_script_parallel(&loadable, &load, self.timeout, self.dry_run)
            .await
            .into_iter()
            .filter(|r| !r.success)
            .map(|r| r.host)
            .collect();

        let failed: Vec<String> = plan
            .hosts()
            .iter()
            .filter(|host| transfer_failed.contains(host) || load_failed.contains(host))
            .cloned()
            .collect();
        if failed.is_empty() {
            info!("{} distributed to all {} host(s)", label, plan.len());
        } else {
            warn!("{} distribution failed on hosts: {}", label, failed.join(", "));
        }
        failed
    }

    /// Runs `ensure` on the head; if that succeeds and there are workers, runs
    /// `distribute` on the head to fan the artifact out to them.
    async fn distribute_from_head(
        &self,
        plan: &HostPlan,
        ensure: &Script,
        distribute: &Script,
        label: &str,
        before_distribute: impl std::future::Future<Output = ()>,
    ) -> Vec<String> {
        let Some(head) = plan.head() else {
            return Vec::new();
        };
        info!(
            "Distributing {} from head ({}) to {} host(s)",
            label,
            head,
            plan.len()
        );
        let (Some(ensure), Some(distribute)) = (self.render(ensure), self.render(distribute))
        else {
            return plan.hosts().to_vec();
        };

        let result = self.run_on(head, &ensure).await;
        if !result.success {
            error!(
                "Failed to acquire {} on head {}; aborting distribution: {}",
                label,
                head,
                result.output.trim()
            );
            return plan.hosts().to_vec();
        }
        if plan.len() == 1 {
            info!("{} ready on {}", label, head);
            return Vec::new();
        }

        before_distribute.await;

        let result = self.run_on(head, &distribute).await;
        if result.success {
            info!("{} distributed to all {} host(s)", label, plan.len());
            return Vec::new();
        }
        let targets = failed_targets(&result.output);
        let failed = plan.management_for(targets.iter().copied(), 1);
        if failed.is_empty() {
            // The script itself failed (or never ran); nothing can be vouched for.
            error!(
                "Distribution script failed on head {}: {}",
                head,
                result.output.trim()
            );
            return plan.hosts().to_vec();
        }
        warn!("{} distribution failed on hosts: {}", label, failed.join(", "));
        failed
    }

    /// Downloads `model_id` on `hosts[0]` and rsyncs it from there to the other hosts.
    pub async fn distribute_model_from_head(
        &self,
        model_id: &str,
        revision: Option<&str>,
        plan: &HostPlan,
    ) -> Vec<String> {
        let options = self.executor.ssh_options();
        let ensure = Script::fetch_model(model_id, &self.hf_cache, revision);
        let distribute = Script::DistributeModel {
            source: cache_path(model_id, &self.hf_cache),
            targets: plan.worker_transfer().to_vec(),
            ssh_opts: options.to_opts_string(),
            ssh_user: options.user.clone(),
        };
        let workers = plan.hosts().get(1..).unwrap_or(&[]);
        self.distribute_from_head(
            plan,
            &ensure,
            &distribute,
            &format!("Model '{}'", model_id),
            self.fix_remote_permissions(workers),
        )
        .await
    }

    /// Pulls `image` on `hosts[0]` and streams it from there to the other hosts.
    pub async fn distribute_image_from_head(&self, image: &str, plan: &HostPlan) -> Vec<String> {
        let options = self.executor.ssh_options();
        let ensure = Script::PullImage {
            image: image.to_owned(),
        };
        let distribute = Script::DistributeImage {
            image: image.to_owned(),
            targets: plan.worker_transfer().to_vec(),
            ssh_opts: options.to_opts_string(),
            ssh_user: options.user.clone(),
        };
        self.distribute_from_head(
            plan,
            &ensure,
            &distribute,
            &format!("Image '{}'", image),
            async {},
        )
        .await
    }
}

/// Targets a head-side distribute script reported as failed (`FAILED <target>` lines).
fn failed_targets(output: &str) -> Vec<&str> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("FAILED "))
        .map(str::trim)
        .filter(|target| !target.is_empty())
        .unique()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_targets() {
        let output = "OK 10.0.0.2\nFAILED 10.0.0.3\nsome rsync noise\nFAILED 10.0.0.4 \n";
        assert_eq!(failed_targets(output), vec!["10.0.0.3", "10.0.0.4"]);
        assert!(failed_targets("OK a\nOK b\n").is_empty());
    }
}
