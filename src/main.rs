use std::io::BufRead;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sparkdist::config::{default_cluster_id, resolve_plan, Command, Config, Settings, Source};
use sparkdist::error::Result;
use sparkdist::executor::{RemoteExecutor, SshExecutor};
use sparkdist::pending::{ActiveOp, PendingInfo, PendingLedger};
use sparkdist::script::Script;
use sparkdist::sudo::run_with_sudo_fallback;
use sparkdist::Distributor;

fn init_tracing(verbose: bool) {
    let default = if verbose { "sparkdist=debug" } else { "sparkdist=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn print_pending(ops: &[ActiveOp], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(ops)?);
        return Ok(());
    }
    if ops.is_empty() {
        eprintln!("[sparkdist] No operations in progress.");
        return Ok(());
    }
    for op in ops {
        let record = &op.record;
        let subject = [&record.info.model, &record.info.image, &record.info.recipe]
            .into_iter()
            .find(|s| !s.is_empty())
            .map(String::as_str)
            .unwrap_or("-");
        println!(
            "{:<24} {:<18} {:<40} pid {:<8} {:>8.1}s  {}",
            record.cluster_id.bold(),
            record.operation,
            subject,
            record.pid,
            op.elapsed_seconds,
            record.info.hosts.join(",")
        );
    }
    Ok(())
}

fn read_password() -> Result<Option<String>> {
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let password = line.trim_end_matches(&['\r', '\n'][..]).to_owned();
    Ok((!password.is_empty()).then_some(password))
}

fn report(failed: &[String], total: usize, what: &str) -> ExitCode {
    if failed.is_empty() {
        eprintln!(
            "[sparkdist] {} {} on {} host(s).",
            what,
            "succeeded".green(),
            total
        );
        ExitCode::SUCCESS
    } else {
        eprintln!(
            "[sparkdist] {} {} on {}/{} host(s): {}",
            what,
            "failed".red().bold(),
            failed.len(),
            total,
            failed.join(", ").red()
        );
        ExitCode::FAILURE
    }
}

async fn run_fix_permissions(
    cli: &Config,
    settings: &Settings,
    password_stdin: bool,
) -> Result<ExitCode> {
    let plan = resolve_plan(cli)?;
    let password = if password_stdin { read_password()? } else { None };
    let script = Script::FixOwnership {
        cache_dir: settings.hf_cache.clone(),
    }
    .render()?;
    let fallback = Script::ChownCache {
        cache_dir: settings.hf_cache.clone(),
    }
    .render()?;
    let executor = SshExecutor::new(settings.ssh.clone());
    let (results, still_failed) = run_with_sudo_fallback(
        &executor,
        plan.hosts(),
        &script,
        &fallback,
        password.as_deref(),
        settings.timeout,
        settings.dry_run,
    )
    .await;
    for host in &still_failed {
        if let Some(result) = results.get(host) {
            warn!("[{}] {}", host, result.output.trim());
        }
    }
    if !still_failed.is_empty() && password.is_none() && !settings.dry_run {
        info!("Hosts that need a sudo password can be retried with --password-stdin");
    }
    Ok(report(&still_failed, plan.len(), "Permission fix"))
}

async fn run(cli: Config) -> Result<ExitCode> {
    let settings = Settings::resolve(&cli)?;
    let ledger = PendingLedger::new(&settings.cache_dir);

    let (tracking, operation, model, image) = match &cli.command {
        Command::Pending { json } => {
            print_pending(&ledger.list_active(), *json)?;
            return Ok(ExitCode::SUCCESS);
        }
        Command::FixPermissions { password_stdin } => {
            return run_fix_permissions(&cli, &settings, *password_stdin).await;
        }
        Command::SyncImage { image, tracking } => (tracking, "image_pull", "", image.as_str()),
        Command::SyncModel { model, tracking, .. } => {
            (tracking, "model_download", model.as_str(), "")
        }
        Command::DistributeModel { model, tracking, .. } => {
            (tracking, "model_distribute", model.as_str(), "")
        }
        Command::DistributeImage { image, tracking, .. } => {
            (tracking, "image_distribute", "", image.as_str())
        }
    };

    let plan = resolve_plan(&cli)?;
    let executor: Arc<dyn RemoteExecutor> = Arc::new(SshExecutor::new(settings.ssh.clone()));
    let distributor = Distributor::new(
        executor,
        settings.hf_cache.clone(),
        settings.cache_dir.clone(),
    )
    .with_timeout(settings.timeout)
    .with_dry_run(settings.dry_run);

    let cluster_id = tracking
        .cluster_id
        .clone()
        .unwrap_or_else(|| default_cluster_id(plan.hosts()));
    let info = PendingInfo {
        recipe: tracking.recipe.clone().unwrap_or_default(),
        model: model.to_owned(),
        image: image.to_owned(),
        hosts: plan.hosts().to_vec(),
    };
    // Removed on every exit path, including Ctrl-C below.
    let _guard = (!settings.dry_run).then(|| ledger.begin(&cluster_id, operation, info));

    let work = async {
        match &cli.command {
            Command::SyncImage { image, .. } => {
                distributor.sync_image_to_hosts(image, plan.hosts()).await
            }
            Command::SyncModel {
                model, revision, ..
            } => {
                distributor
                    .sync_model_to_hosts(model, revision.as_deref(), plan.hosts())
                    .await
            }
            Command::DistributeModel {
                model,
                revision,
                from: Source::Local,
                ..
            } => {
                distributor
                    .distribute_model_from_local(model, revision.as_deref(), &plan)
                    .await
            }
            Command::DistributeModel {
                model,
                revision,
                from: Source::Head,
                ..
            } => {
                distributor
                    .distribute_model_from_head(model, revision.as_deref(), &plan)
                    .await
            }
            Command::DistributeImage {
                image,
                from: Source::Local,
                ..
            } => distributor.distribute_image_from_local(image, &plan).await,
            Command::DistributeImage {
                image,
                from: Source::Head,
                ..
            } => distributor.distribute_image_from_head(image, &plan).await,
            Command::Pending { .. } | Command::FixPermissions { .. } => Vec::new(),
        }
    };

    tokio::select! {
        failed = work => Ok(report(&failed, plan.len(), operation)),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; abandoning {}", operation);
            Ok(ExitCode::from(130))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Config::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(2)
        }
    }
}
