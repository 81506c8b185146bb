//! Distribution topologies and the sudo fallback against a scripted executor.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use sparkdist::cache::{cache_path, image_archive_path};
use sparkdist::executor::LOCALHOST;
use sparkdist::{
    run_with_sudo_fallback, Distributor, HostPlan, HostResult, RemoteExecutor, Script,
    SshExecutor, SshOptions,
};

/// Record of one executor call.
#[derive(Debug, Clone, PartialEq)]
enum Call {
    Script { host: String, script: String },
    Rsync { src: PathBuf, host: String },
    Sudo { host: String, password: String },
    Local { script: String },
}

/// Executor that never spawns anything. Every call succeeds unless configured otherwise.
#[derive(Default)]
struct MockExecutor {
    options: SshOptions,
    /// `(host, script)` pairs that exit non-zero.
    failing_scripts: HashSet<(String, String)>,
    /// Canned `(success, output)` for `(host, script)` pairs.
    outputs: HashMap<(String, String), (bool, String)>,
    failing_rsync: HashSet<String>,
    sudo_succeeds: HashSet<String>,
    local_fails: bool,
    calls: Mutex<Vec<Call>>,
}

impl MockExecutor {
    fn fail_script(mut self, host: &str, script: &str) -> Self {
        self.failing_scripts
            .insert((host.to_owned(), script.to_owned()));
        self
    }

    fn with_output(mut self, host: &str, script: &str, success: bool, output: &str) -> Self {
        self.outputs.insert(
            (host.to_owned(), script.to_owned()),
            (success, output.to_owned()),
        );
        self
    }

    fn fail_rsync(mut self, host: &str) -> Self {
        self.failing_rsync.insert(host.to_owned());
        self
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn rsync_hosts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Rsync { host, .. } => Some(host),
                _ => None,
            })
            .collect()
    }

    /// Hosts `script` ran on, in call order.
    fn script_hosts(&self, script: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Script { host, script: s } if s == script => Some(host),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl RemoteExecutor for MockExecutor {
    fn ssh_options(&self) -> &SshOptions {
        &self.options
    }

    async fn run_script(&self, host: &str, script: &str, _timeout: Option<Duration>) -> HostResult {
        self.calls.lock().unwrap().push(Call::Script {
            host: host.to_owned(),
            script: script.to_owned(),
        });
        let key = (host.to_owned(), script.to_owned());
        if let Some((success, output)) = self.outputs.get(&key) {
            return if *success {
                HostResult::ok(host, output.as_str())
            } else {
                HostResult::failed(host, output.as_str(), Some(1))
            };
        }
        if self.failing_scripts.contains(&key) {
            HostResult::failed(host, "script failed", Some(1))
        } else {
            HostResult::ok(host, "")
        }
    }

    async fn run_rsync(
        &self,
        src: &Path,
        host: &str,
        _dest: &Path,
        _timeout: Option<Duration>,
    ) -> HostResult {
        self.calls.lock().unwrap().push(Call::Rsync {
            src: src.to_path_buf(),
            host: host.to_owned(),
        });
        if self.failing_rsync.contains(host) {
            HostResult::failed(host, "rsync error: connection refused", Some(255))
        } else {
            HostResult::ok(host, "")
        }
    }

    async fn run_sudo_script(
        &self,
        host: &str,
        _script: &str,
        password: &str,
        _timeout: Option<Duration>,
        dry_run: bool,
    ) -> HostResult {
        if dry_run {
            return HostResult::dry_run(host);
        }
        self.calls.lock().unwrap().push(Call::Sudo {
            host: host.to_owned(),
            password: password.to_owned(),
        });
        if self.sudo_succeeds.contains(host) {
            HostResult::ok(host, "")
        } else {
            HostResult::failed(host, "sudo: incorrect password", Some(1))
        }
    }

    async fn run_local_script(
        &self,
        script: &str,
        _timeout: Option<Duration>,
        dry_run: bool,
    ) -> HostResult {
        if dry_run {
            return HostResult::dry_run(LOCALHOST);
        }
        self.calls.lock().unwrap().push(Call::Local {
            script: script.to_owned(),
        });
        if self.local_fails {
            HostResult::failed(LOCALHOST, "401 Unauthorized", Some(1))
        } else {
            HostResult::ok(LOCALHOST, "")
        }
    }
}

const MODEL: &str = "org/model";
const IMAGE: &str = "nvcr.io/nvidia/vllm:25.09";

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn plan(hosts: &[&str], transfer: Option<&[&str]>) -> HostPlan {
    HostPlan::new(strings(hosts), transfer.map(strings)).unwrap()
}

fn distributor(executor: &Arc<MockExecutor>, dir: &TempDir) -> Distributor {
    Distributor::new(
        executor.clone(),
        dir.path().join("hf"),
        dir.path().join("sparkdist"),
    )
}

fn fetch_script(dir: &TempDir) -> String {
    Script::fetch_model(MODEL, &dir.path().join("hf"), None)
        .render()
        .unwrap()
}

fn fix_script(dir: &TempDir) -> String {
    Script::FixOwnership {
        cache_dir: dir.path().join("hf"),
    }
    .render()
    .unwrap()
}

fn model_distribute_script(dir: &TempDir, targets: &[&str]) -> String {
    Script::DistributeModel {
        source: cache_path(MODEL, &dir.path().join("hf")),
        targets: strings(targets),
        ssh_opts: SshOptions::default().to_opts_string(),
        ssh_user: None,
    }
    .render()
    .unwrap()
}

#[tokio::test]
async fn test_local_acquisition_failure_aborts_before_any_transfer() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(MockExecutor {
        local_fails: true,
        ..Default::default()
    });
    let failed = distributor(&executor, &dir)
        .distribute_model_from_local(MODEL, None, &plan(&["a", "b"], None))
        .await;

    assert_eq!(failed, strings(&["a", "b"]));
    assert_eq!(
        executor.calls(),
        vec![Call::Local {
            script: fetch_script(&dir)
        }]
    );
}

#[tokio::test]
async fn test_local_distribution_to_no_hosts_only_downloads() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(MockExecutor::default());
    let failed = distributor(&executor, &dir)
        .distribute_model_from_local(MODEL, None, &plan(&[], None))
        .await;

    assert!(failed.is_empty());
    assert_eq!(executor.calls().len(), 1);
}

#[tokio::test]
async fn test_local_distribution_reports_management_hosts() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(MockExecutor::default().fail_rsync("10.0.0.2"));
    let failed = distributor(&executor, &dir)
        .distribute_model_from_local(
            MODEL,
            None,
            &plan(&["spark1", "spark2"], Some(&["10.0.0.1", "10.0.0.2"])),
        )
        .await;

    assert_eq!(failed, strings(&["spark2"]));
    // Data goes over the transfer network; ownership fixes go to management names.
    assert_eq!(executor.rsync_hosts(), strings(&["10.0.0.1", "10.0.0.2"]));
    assert_eq!(
        executor.script_hosts(&fix_script(&dir)),
        strings(&["spark1", "spark2"])
    );
    assert!(executor.calls().iter().all(|call| match call {
        Call::Rsync { src, .. } => src == &cache_path(MODEL, &dir.path().join("hf")),
        _ => true,
    }));
}

#[tokio::test]
async fn test_failed_permission_fix_does_not_abort() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(MockExecutor::default().fail_script("b", &fix_script(&dir)));
    let failed = distributor(&executor, &dir)
        .distribute_model_from_local(MODEL, None, &plan(&["a", "b"], None))
        .await;

    assert!(failed.is_empty());
    assert_eq!(executor.rsync_hosts(), strings(&["a", "b"]));
}

#[tokio::test]
async fn test_head_only_cluster_skips_distribution() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(MockExecutor::default());
    let failed = distributor(&executor, &dir)
        .distribute_model_from_head(MODEL, None, &plan(&["head"], None))
        .await;

    assert!(failed.is_empty());
    assert_eq!(
        executor.calls(),
        vec![Call::Script {
            host: "head".into(),
            script: fetch_script(&dir)
        }]
    );
}

#[tokio::test]
async fn test_head_distribution_maps_failed_targets() {
    let dir = TempDir::new().unwrap();
    let distribute = model_distribute_script(&dir, &["10.0.0.2", "10.0.0.3"]);
    let executor = Arc::new(MockExecutor::default().with_output(
        "spark1",
        &distribute,
        false,
        "OK 10.0.0.2\nFAILED 10.0.0.3\n",
    ));
    let failed = distributor(&executor, &dir)
        .distribute_model_from_head(
            MODEL,
            None,
            &plan(
                &["spark1", "spark2", "spark3"],
                Some(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]),
            ),
        )
        .await;

    assert_eq!(failed, strings(&["spark3"]));
    // Fetch on the head, ownership fix on workers, then the fan-out from the head.
    let calls = executor.calls();
    assert_eq!(
        calls.first(),
        Some(&Call::Script {
            host: "spark1".into(),
            script: fetch_script(&dir)
        })
    );
    assert_eq!(
        calls.last(),
        Some(&Call::Script {
            host: "spark1".into(),
            script: distribute
        })
    );
    assert_eq!(
        executor.script_hosts(&fix_script(&dir)),
        strings(&["spark2", "spark3"])
    );
    assert!(executor.rsync_hosts().is_empty());
}

#[tokio::test]
async fn test_head_script_failure_without_report_fails_everyone() {
    let dir = TempDir::new().unwrap();
    let distribute = model_distribute_script(&dir, &["b", "c"]);
    let executor = Arc::new(MockExecutor::default().with_output(
        "a",
        &distribute,
        false,
        "bash: rsync: command not found\n",
    ));
    let failed = distributor(&executor, &dir)
        .distribute_model_from_head(MODEL, None, &plan(&["a", "b", "c"], None))
        .await;

    assert_eq!(failed, strings(&["a", "b", "c"]));
}

#[tokio::test]
async fn test_head_acquisition_failure_aborts() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(MockExecutor::default().fail_script("a", &fetch_script(&dir)));
    let failed = distributor(&executor, &dir)
        .distribute_model_from_head(MODEL, None, &plan(&["a", "b"], None))
        .await;

    assert_eq!(failed, strings(&["a", "b"]));
    assert_eq!(executor.calls().len(), 1);
}

#[tokio::test]
async fn test_image_from_head_streams_to_worker_transfer_hosts() {
    let dir = TempDir::new().unwrap();
    let distribute = Script::DistributeImage {
        image: IMAGE.into(),
        targets: strings(&["10.0.0.2"]),
        ssh_opts: SshOptions::default().to_opts_string(),
        ssh_user: None,
    }
    .render()
    .unwrap();
    let executor = Arc::new(MockExecutor::default());
    let failed = distributor(&executor, &dir)
        .distribute_image_from_head(IMAGE, &plan(&["a", "b"], Some(&["10.0.0.1", "10.0.0.2"])))
        .await;

    assert!(failed.is_empty());
    assert_eq!(executor.script_hosts(&distribute), strings(&["a"]));
    assert!(executor.script_hosts(&fix_script(&dir)).is_empty());
}

#[tokio::test]
async fn test_image_from_local_combines_transfer_and_load_failures() {
    let dir = TempDir::new().unwrap();
    let archive = image_archive_path(IMAGE, &dir.path().join("sparkdist"));
    let load = Script::LoadImage {
        image: IMAGE.into(),
        archive: archive.clone(),
    }
    .render()
    .unwrap();
    let executor = Arc::new(
        MockExecutor::default()
            .fail_rsync("tb")
            .fail_script("a", &load),
    );
    let failed = distributor(&executor, &dir)
        .distribute_image_from_local(IMAGE, &plan(&["a", "b", "c"], Some(&["ta", "tb", "tc"])))
        .await;

    assert_eq!(failed, strings(&["a", "b"]));
    // Hosts whose transfer failed are not asked to load.
    assert_eq!(executor.script_hosts(&load), strings(&["a", "c"]));
    assert!(executor.calls().iter().all(|call| match call {
        Call::Rsync { src, .. } => src == &archive,
        _ => true,
    }));
}

#[tokio::test]
async fn test_sync_reports_failed_subset() {
    let dir = TempDir::new().unwrap();
    let pull = Script::PullImage {
        image: IMAGE.into(),
    }
    .render()
    .unwrap();
    let executor = Arc::new(MockExecutor::default().fail_script("b", &pull));
    let distributor = distributor(&executor, &dir);

    let failed = distributor
        .sync_image_to_hosts(IMAGE, &strings(&["a", "b", "c"]))
        .await;
    assert_eq!(failed, strings(&["b"]));

    let failed = distributor
        .sync_model_to_hosts(MODEL, None, &strings(&["a", "b"]))
        .await;
    assert!(failed.is_empty());
    assert_eq!(executor.script_hosts(&fetch_script(&dir)), strings(&["a", "b"]));

    assert!(distributor.sync_image_to_hosts(IMAGE, &[]).await.is_empty());
}

#[tokio::test]
async fn test_dry_run_touches_nothing() {
    let dir = TempDir::new().unwrap();
    // A real executor: any spawn would fail against these hosts.
    let executor: Arc<dyn RemoteExecutor> = Arc::new(SshExecutor::new(SshOptions::default()));
    let distributor = Distributor::new(executor, dir.path().join("hf"), dir.path().join("sd"))
        .with_dry_run(true);
    let plan = plan(&["nonexistent-a.invalid", "nonexistent-b.invalid"], None);

    assert!(distributor
        .distribute_model_from_local(MODEL, None, &plan)
        .await
        .is_empty());
    assert!(distributor
        .distribute_model_from_head(MODEL, Some("main"), &plan)
        .await
        .is_empty());
    assert!(distributor
        .distribute_image_from_local(IMAGE, &plan)
        .await
        .is_empty());
    assert!(distributor
        .distribute_image_from_head(IMAGE, &plan)
        .await
        .is_empty());
    assert!(distributor
        .sync_image_to_hosts(IMAGE, plan.hosts())
        .await
        .is_empty());
    assert!(distributor
        .sync_model_to_hosts(MODEL, None, plan.hosts())
        .await
        .is_empty());
    assert!(!dir.path().join("sd").exists());
}

#[tokio::test]
async fn test_sudo_fallback_retries_failures_with_password() {
    let mut executor = MockExecutor::default()
        .fail_script("b", "chown")
        .fail_script("c", "chown");
    executor.sudo_succeeds.insert("b".into());
    let hosts = strings(&["a", "b", "c"]);

    let (results, still_failed) =
        run_with_sudo_fallback(&executor, &hosts, "chown", "root chown", Some("pw"), None, false)
            .await;

    assert_eq!(still_failed, strings(&["c"]));
    assert!(results["a"].success);
    assert!(results["b"].success);
    assert!(!results["c"].success);
    let sudo_calls: Vec<Call> = executor
        .calls()
        .into_iter()
        .filter(|call| matches!(call, Call::Sudo { .. }))
        .collect();
    assert_eq!(
        sudo_calls,
        vec![
            Call::Sudo {
                host: "b".into(),
                password: "pw".into()
            },
            Call::Sudo {
                host: "c".into(),
                password: "pw".into()
            },
        ]
    );
}

#[tokio::test]
async fn test_sudo_fallback_without_password_does_not_retry() {
    let executor = MockExecutor::default().fail_script("b", "chown");
    let hosts = strings(&["a", "b"]);

    let (results, still_failed) =
        run_with_sudo_fallback(&executor, &hosts, "chown", "root chown", None, None, false).await;

    assert_eq!(still_failed, strings(&["b"]));
    assert_eq!(results.len(), 2);
    assert!(!executor
        .calls()
        .iter()
        .any(|call| matches!(call, Call::Sudo { .. })));
}

#[tokio::test]
async fn test_sudo_fallback_dry_run_succeeds_without_calls() {
    let executor = MockExecutor::default().fail_script("a", "chown");
    let hosts = strings(&["a"]);

    let (results, still_failed) =
        run_with_sudo_fallback(&executor, &hosts, "chown", "root chown", Some("pw"), None, true)
            .await;

    assert!(still_failed.is_empty());
    assert!(results["a"].success);
    assert!(executor.calls().is_empty());
}
