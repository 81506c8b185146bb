//! Remote script execution and rsync fan-out.
//!
//! One SSH connection is opened per host and call. A fan-out call drives every host
//! concurrently and returns exactly one `HostResult` per input host; per-host failures
//! (connect errors, non-zero exits, timeouts) are folded into the result instead of
//! being propagated, so one bad host never stops its siblings.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use openssh::{KnownHosts, Session, SessionBuilder};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::DistError;
use crate::script::shell_quote;

/// Outcome of running something on one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostResult {
    /// The host the call targeted, as passed to the executor.
    pub host: String,
    pub success: bool,
    /// Captured stdout followed by stderr.
    pub output: String,
    /// Exit status, if the process got far enough to have one.
    pub status: Option<i32>,
}

impl HostResult {
    pub fn ok(host: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            success: true,
            output: output.into(),
            status: Some(0),
        }
    }

    pub fn failed(host: impl Into<String>, output: impl Into<String>, status: Option<i32>) -> Self {
        Self {
            host: host.into(),
            success: false,
            output: output.into(),
            status,
        }
    }

    /// Synthetic success for dry runs.
    pub fn dry_run(host: impl Into<String>) -> Self {
        Self::ok(host, "[dry-run]")
    }

    fn from_output(host: &str, output: Output) -> Self {
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Self {
            host: host.to_owned(),
            success: output.status.success(),
            output: text,
            status: output.status.code(),
        }
    }
}

/// SSH connection options shared by every call an executor makes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshOptions {
    pub user: Option<String>,
    pub key: Option<PathBuf>,
    pub port: Option<u16>,
    pub connect_timeout: Option<Duration>,
    /// Extra `-o` style options, e.g. `StrictHostKeyChecking=accept-new`.
    pub extra: Vec<String>,
}

impl SshOptions {
    /// Arguments for the `ssh` command line, without the destination.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["-o".to_string(), "BatchMode=yes".to_string()];
        if let Some(timeout) = self.connect_timeout {
            args.push("-o".into());
            args.push(format!("ConnectTimeout={}", timeout.as_secs().max(1)));
        }
        if let Some(key) = &self.key {
            args.push("-i".into());
            args.push(key.display().to_string());
        }
        if let Some(port) = self.port {
            args.push("-p".into());
            args.push(port.to_string());
        }
        for option in &self.extra {
            args.push("-o".into());
            args.push(option.clone());
        }
        args
    }

    /// All options as one shell-safe string, for embedding in scripts.
    pub fn to_opts_string(&self) -> String {
        self.args()
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// `user@host`, or just `host` without a configured user.
    pub fn destination(&self, host: &str) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, host),
            None => host.to_owned(),
        }
    }
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    fn ssh_options(&self) -> &SshOptions;

    /// Runs `script` with bash on `host`.
    async fn run_script(&self, host: &str, script: &str, timeout: Option<Duration>) -> HostResult;

    /// Runs `script` on every host concurrently.
    async fn run_script_parallel(
        &self,
        hosts: &[String],
        script: &str,
        timeout: Option<Duration>,
        dry_run: bool,
    ) -> Vec<HostResult> {
        if dry_run {
            debug!("[dry-run] Would run script on {} host(s)", hosts.len());
            return hosts.iter().map(HostResult::dry_run).collect();
        }
        join_all(hosts.iter().map(|host| self.run_script(host, script, timeout))).await
    }

    /// Copies `src` on this machine to `dest` on `host`, incrementally.
    async fn run_rsync(
        &self,
        src: &Path,
        host: &str,
        dest: &Path,
        timeout: Option<Duration>,
    ) -> HostResult;

    /// Copies `src` to `dest` on every host concurrently.
    async fn run_rsync_parallel(
        &self,
        src: &Path,
        hosts: &[String],
        dest: &Path,
        timeout: Option<Duration>,
        dry_run: bool,
    ) -> Vec<HostResult> {
        if dry_run {
            debug!(
                "[dry-run] Would rsync {} to {} host(s)",
                src.display(),
                hosts.len()
            );
            return hosts.iter().map(HostResult::dry_run).collect();
        }
        join_all(
            hosts
                .iter()
                .map(|host| self.run_rsync(src, host, dest, timeout)),
        )
        .await
    }

    /// Runs `script` under `sudo` on `host`, answering the password prompt.
    async fn run_sudo_script(
        &self,
        host: &str,
        script: &str,
        password: &str,
        timeout: Option<Duration>,
        dry_run: bool,
    ) -> HostResult;

    /// Runs `script` with bash on this machine.
    async fn run_local_script(
        &self,
        script: &str,
        timeout: Option<Duration>,
        dry_run: bool,
    ) -> HostResult;
}

/// Host name used in results of local execution.
pub const LOCALHOST: &str = "localhost";

/// Executor backed by OpenSSH multiplexed sessions and the `rsync` binary.
///
/// `SshOptions::extra` only reaches the `ssh`/`rsync` command lines; control sessions
/// pick up such settings from the user's ssh config.
pub struct SshExecutor {
    options: SshOptions,
}

impl SshExecutor {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }

    async fn connect(&self, host: &str) -> Result<Session, openssh::Error> {
        let mut builder = SessionBuilder::default();
        builder.known_hosts_check(KnownHosts::Add);
        if let Some(user) = &self.options.user {
            builder.user(user.clone());
        }
        if let Some(port) = self.options.port {
            builder.port(port);
        }
        if let Some(key) = &self.options.key {
            builder.keyfile(key);
        }
        if let Some(timeout) = self.options.connect_timeout {
            builder.connect_timeout(timeout);
        }
        builder.connect_mux(host).await
    }

    /// Feeds `stdin` to `program args..` on `host` and collects its output.
    async fn exec(
        &self,
        host: &str,
        program: &str,
        args: &[&str],
        stdin: &str,
    ) -> Result<Output, DistError> {
        let session = self.connect(host).await?;
        let result = async {
            let mut cmd = session.command(program);
            let process = cmd
                .args(args.iter().copied())
                .stdin(openssh::Stdio::piped())
                .stdout(openssh::Stdio::piped())
                .stderr(openssh::Stdio::piped());
            let mut child = process.spawn().await?;
            if let Some(mut input) = child.stdin().take() {
                input.write_all(stdin.as_bytes()).await?;
                input.shutdown().await?;
            }
            Ok::<_, DistError>(child.wait_with_output().await?)
        }
        .await;
        if let Err(e) = session.close().await {
            debug!("[{}] Error while terminating session: {}", host, e);
        }
        result
    }

    fn rsync_command(&self, src: &Path, host: &str, dest: &Path) -> Command {
        // A directory is synced into `dest/`; a single file lands at `dest`.
        let (src_arg, dest_arg, dest_dir) = if src.is_dir() {
            (
                format!("{}/", src.display()),
                format!("{}/", dest.display()),
                dest.to_path_buf(),
            )
        } else {
            (
                src.display().to_string(),
                dest.display().to_string(),
                dest.parent().map(Path::to_path_buf).unwrap_or_default(),
            )
        };
        let mut ssh = vec!["ssh".to_string()];
        ssh.extend(self.options.args().iter().map(|arg| shell_quote(arg)));

        let mut command = Command::new("rsync");
        command
            .arg("-a")
            .arg("--partial")
            .arg("-e")
            .arg(ssh.join(" "))
            .arg("--rsync-path")
            .arg(format!(
                "mkdir -p {} && rsync",
                shell_quote(&dest_dir.display().to_string())
            ))
            .arg(src_arg)
            .arg(format!("{}:{}", self.options.destination(host), dest_arg))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

/// `sudo` arguments and stdin for running `script` as root.
///
/// Only the password line goes down stdin. The script travels as a `bash -c` argument,
/// so a sudo that never reads stdin cannot hand the password to bash.
fn sudo_invocation<'a>(script: &'a str, password: &str) -> (Vec<&'a str>, String) {
    (
        vec!["-S", "-p", "", "bash", "-c", script],
        format!("{}\n", password),
    )
}

/// Applies an optional timeout to a host operation, folding every error into a
/// failed result.
async fn bounded<F>(host: &str, timeout: Option<Duration>, fut: F) -> HostResult
where
    F: std::future::Future<Output = Result<Output, DistError>>,
{
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!("[{}] Timed out after {:?}", host, limit);
                return HostResult::failed(host, format!("timed out after {:?}", limit), None);
            }
        },
        None => fut.await,
    };
    match result {
        Ok(output) => {
            let result = HostResult::from_output(host, output);
            if result.success {
                debug!("[{}] done", host);
            } else {
                debug!("[{}] failed ({:?}): {}", host, result.status, result.output.trim());
            }
            result
        }
        Err(e) => {
            debug!("[{}] error: {}", host, e);
            HostResult::failed(host, e.to_string(), None)
        }
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    fn ssh_options(&self) -> &SshOptions {
        &self.options
    }

    async fn run_script(&self, host: &str, script: &str, timeout: Option<Duration>) -> HostResult {
        debug!("[{}] running script ({} bytes)", host, script.len());
        bounded(host, timeout, self.exec(host, "bash", &["-s"], script)).await
    }

    async fn run_rsync(
        &self,
        src: &Path,
        host: &str,
        dest: &Path,
        timeout: Option<Duration>,
    ) -> HostResult {
        debug!("[{}] rsync {} -> {}", host, src.display(), dest.display());
        let mut command = self.rsync_command(src, host, dest);
        bounded(host, timeout, async move {
            command.output().await.map_err(DistError::from)
        })
        .await
    }

    async fn run_sudo_script(
        &self,
        host: &str,
        script: &str,
        password: &str,
        timeout: Option<Duration>,
        dry_run: bool,
    ) -> HostResult {
        if dry_run {
            return HostResult::dry_run(host);
        }
        let (args, stdin) = sudo_invocation(script, password);
        bounded(host, timeout, self.exec(host, "sudo", &args, &stdin)).await
    }

    async fn run_local_script(
        &self,
        script: &str,
        timeout: Option<Duration>,
        dry_run: bool,
    ) -> HostResult {
        if dry_run {
            return HostResult::dry_run(LOCALHOST);
        }
        let script = script.to_owned();
        bounded(LOCALHOST, timeout, async move {
            let mut child = Command::new("bash")
                .arg("-s")
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;
            if let Some(mut input) = child.stdin.take() {
                input.write_all(script.as_bytes()).await?;
            }
            Ok::<_, DistError>(child.wait_with_output().await?)
        })
        .await
    }
}
